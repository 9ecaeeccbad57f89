//! pulsebridge_nodes
//!
//! Workflow-facing entry points on top of the client core:
//!
//! - `Publisher`: publish a list of items through one producer and report a
//!   per-item outcome
//! - `Trigger`: run a consumer that turns every message into a
//!   `TriggerRecord` and hands it to a `RecordSink`

pub mod publish;
pub mod record;
pub mod trigger;

pub use publish::{MessageFormat, PublishItem, PublishOutcome, Publisher};
pub use record::{TriggerRecord, decode_body};
pub use trigger::{EmitError, RecordSink, Trigger, TriggerConfig};
