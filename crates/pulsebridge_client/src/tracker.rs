//! Delivery tracking
//!
//! The tracker remembers every message a consumer handed to the application
//! and has not seen acknowledged. Each entry carries an optional deadline
//! (ack timeout or negative-ack delay). `expire` hands out the ids whose
//! deadline passed so the consumer can ask the broker to redeliver them.
//!
//! An expired entry stays in the map, parked (`in_flight == false`), until the
//! message is received again or acknowledged, so its redelivery count
//! survives the round trip.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use pulsebridge_message::MessageId;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    received_at: Instant,
    deadline: Option<Instant>,
    redelivery_count: u32,
    in_flight: bool,
}

/// What `settle` removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settled {
    pub in_flight: bool,
    pub redelivery_count: u32,
}

/// An id handed out by `expire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expired {
    pub id: MessageId,
    pub redelivery_count: u32,
    /// How long the application held it since it was last handed out.
    pub held_for: Duration,
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    entries: Mutex<HashMap<MessageId, Entry>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<MessageId, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a message handed to the application. Re-tracking keeps the
    /// redelivery count.
    pub fn track(&self, id: MessageId, deadline: Option<Instant>) {
        let now = Instant::now();
        self.entries()
            .entry(id)
            .and_modify(|entry| {
                entry.received_at = now;
                entry.deadline = deadline;
                entry.in_flight = true;
            })
            .or_insert(Entry {
                received_at: now,
                deadline,
                redelivery_count: 0,
                in_flight: true,
            });
    }

    /// Forget an acknowledged id. `None` when it was not tracked.
    pub fn settle(&self, id: &MessageId) -> Option<Settled> {
        self.entries().remove(id).map(|entry| Settled {
            in_flight: entry.in_flight,
            redelivery_count: entry.redelivery_count,
        })
    }

    /// Move an in-flight id's deadline to `deadline`. Returns `false` when the
    /// id is unknown or already parked.
    pub fn negative(&self, id: &MessageId, deadline: Instant) -> bool {
        match self.entries().get_mut(id) {
            Some(entry) if entry.in_flight => {
                entry.deadline = Some(deadline);
                true
            }
            _ => false,
        }
    }

    /// Hand out every in-flight id whose deadline is at or before `now`,
    /// bumping its redelivery count and parking it.
    pub fn expire(&self, now: Instant) -> impl Iterator<Item = Expired> + use<> {
        let mut entries = self.entries();
        let mut expired: Vec<Expired> = entries
            .iter_mut()
            .filter(|(_, e)| e.in_flight && e.deadline.is_some_and(|d| d <= now))
            .map(|(id, entry)| {
                entry.redelivery_count += 1;
                entry.in_flight = false;
                entry.deadline = None;
                Expired {
                    id: *id,
                    redelivery_count: entry.redelivery_count,
                    held_for: now.saturating_duration_since(entry.received_at),
                }
            })
            .collect();
        expired.sort_by_key(|e| e.id);
        expired.into_iter()
    }

    pub fn redelivery_count(&self, id: &MessageId) -> Option<u32> {
        self.entries().get(id).map(|e| e.redelivery_count)
    }

    pub fn is_in_flight(&self, id: &MessageId) -> bool {
        self.entries().get(id).is_some_and(|e| e.in_flight)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(entry: u64) -> MessageId {
        MessageId::new(1, entry, -1)
    }

    #[test]
    fn settle_is_idempotent() {
        let tracker = DeliveryTracker::new();
        tracker.track(id(1), None);
        assert_eq!(
            tracker.settle(&id(1)),
            Some(Settled {
                in_flight: true,
                redelivery_count: 0
            })
        );
        assert_eq!(tracker.settle(&id(1)), None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn expire_yields_each_id_once_per_sweep() {
        let tracker = DeliveryTracker::new();
        let now = Instant::now();
        tracker.track(id(1), Some(now));
        tracker.track(id(2), Some(now + Duration::from_secs(60)));
        tracker.track(id(3), None);

        let swept = now + Duration::from_secs(5);
        let expired: Vec<Expired> = tracker.expire(swept).collect();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, id(1));
        assert_eq!(expired[0].redelivery_count, 1);
        assert!(expired[0].held_for <= Duration::from_secs(5));
        assert!(expired[0].held_for > Duration::from_secs(4));
        // parked until received again
        assert_eq!(tracker.expire(swept + Duration::from_secs(1)).count(), 0);
        assert!(!tracker.is_in_flight(&id(1)));
        assert_eq!(tracker.len(), 3);
    }

    #[test]
    fn retracking_keeps_the_count() {
        let tracker = DeliveryTracker::new();
        let now = Instant::now();
        tracker.track(id(7), Some(now));
        assert_eq!(tracker.expire(now).count(), 1);

        tracker.track(id(7), Some(now));
        let again: Vec<Expired> = tracker.expire(now).collect();
        assert_eq!(again[0].redelivery_count, 2);
        assert_eq!(tracker.redelivery_count(&id(7)), Some(2));

        assert_eq!(
            tracker.settle(&id(7)),
            Some(Settled {
                in_flight: false,
                redelivery_count: 2
            })
        );
    }

    #[test]
    fn negative_pulls_the_deadline_in() {
        let tracker = DeliveryTracker::new();
        let now = Instant::now();
        tracker.track(id(1), None);
        assert_eq!(tracker.expire(now).count(), 0);

        assert!(tracker.negative(&id(1), now));
        assert_eq!(tracker.expire(now).count(), 1);
        assert!(!tracker.negative(&id(1), now));
        assert!(!tracker.negative(&id(9), now));
    }

    #[test]
    fn clear_forgets_everything() {
        let tracker = DeliveryTracker::new();
        tracker.track(id(1), None);
        tracker.track(id(2), None);
        tracker.clear();
        assert!(tracker.is_empty());
        assert_eq!(tracker.redelivery_count(&id(1)), None);
    }
}
