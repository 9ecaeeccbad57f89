//! pulsebridge_utils
//!
//! Small shared helpers: tracing bootstrap and the wall clock used for
//! publish and delivery timestamps.

pub mod clock;
pub mod logging;

#[cfg(test)]
mod tests {
    use super::{clock, logging};

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
        logging::init("not-a-level");
    }

    #[test]
    fn level_parsing_falls_back_to_info() {
        assert_eq!(logging::parse_level("WARNING"), tracing::Level::WARN);
        assert_eq!(logging::parse_level("trace"), tracing::Level::TRACE);
        assert_eq!(logging::parse_level("verbose"), tracing::Level::INFO);
    }

    #[test]
    fn clock_is_monotonic_enough_for_timestamps() {
        let a = clock::now_millis();
        let b = clock::now_millis();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000);
    }

    #[test]
    fn millis_render_as_utc_datetimes() {
        let dt = clock::to_datetime(1_725_000_000_123).expect("in range");
        assert_eq!(dt.timestamp_millis(), 1_725_000_000_123);
    }
}
