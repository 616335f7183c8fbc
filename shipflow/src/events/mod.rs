//! Event sink system for observability.
//!
//! Every action, stage and run transition is delivered to an [`EventSink`]
//! for external logging and alerting.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
