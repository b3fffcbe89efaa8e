//! Testing utilities for stack programs.
//!
//! This module provides:
//! - A recording provider with failure and delay injection
//! - Sample stacks and an engine harness
//! - Assertions over applied graphs

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_all_realized, assert_output_eq, assert_realized_before, assert_status};
pub use fixtures::{api_program, api_stack, db_program, db_stack, stack_id, TestEngine};
pub use mocks::MockProvider;
