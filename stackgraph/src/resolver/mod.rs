//! Resolution of outputs published by other stacks.
//!
//! - [`OutputResolver`]: `(stack, output)` lookups over a [`StateBackend`](crate::state::StateBackend)
//! - [`LiveStacks`]: pending outputs of stacks applied in the same run
//! - retry with backoff for transient backend failures

mod live;
#[allow(clippy::module_inception)]
mod resolver;
mod retry;

pub use live::LiveStacks;
pub use resolver::{OutputResolver, OutputValue};
pub use retry::{
    should_retry, with_retry_if, BackoffStrategy, JitterStrategy, RetryConfig, RetryDecision,
    RetryExhausted, RetryState,
};
