//! Utility functions for timestamps and content digests.

mod digest;
pub mod timestamps;

pub use digest::{sha256_hex, short_digest};
pub use timestamps::{iso_timestamp, now, Timestamp};
