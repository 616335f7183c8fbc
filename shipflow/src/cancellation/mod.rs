//! External cancellation of in-flight actions.

mod token;

pub use token::CancellationToken;
