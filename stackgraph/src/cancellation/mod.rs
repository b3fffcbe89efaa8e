//! Cooperative cancellation for provisioning runs.

mod token;

pub use token::CancellationToken;
