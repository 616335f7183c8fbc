//! Logging setup and timing helpers.

mod subscriber;

pub use subscriber::{init_tracing, LogFormat, SpanTimer};
