//! Cooperative cancellation for runs.

mod token;

pub use token::CancellationToken;
