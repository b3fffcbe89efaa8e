//! Assertions over applied graphs and stack reports.

use serde_json::Value;

use crate::core::ResourceStatus;
use crate::engine::StackReport;
use crate::graph::AppliedState;

/// Asserts that a resource ended with the expected status.
///
/// # Panics
///
/// Panics if the resource is unknown or its status differs.
pub fn assert_status(applied: &AppliedState, resource: &str, expected: ResourceStatus) {
    let actual = applied.status(resource);
    assert_eq!(
        actual,
        Some(expected),
        "Expected '{resource}' to be {expected}, got {actual:?}"
    );
}

/// Asserts that every resource was applied or unchanged.
///
/// # Panics
///
/// Panics listing the resources that were not realized.
pub fn assert_all_realized(applied: &AppliedState) {
    let unrealized: Vec<String> = applied
        .resources
        .iter()
        .filter(|r| !r.status.is_success())
        .map(|r| format!("{} ({})", r.id, r.status))
        .collect();
    assert!(
        unrealized.is_empty(),
        "Expected every resource to be realized, but these were not: {unrealized:?}"
    );
}

/// Asserts that `first` was handed to the provider before `second`.
///
/// # Panics
///
/// Panics if either resource was never dispatched or the order is reversed.
pub fn assert_realized_before(applied: &AppliedState, first: &str, second: &str) {
    let position = |id: &str| {
        applied
            .realization_order
            .iter()
            .position(|r| r.as_str() == id)
            .unwrap_or_else(|| panic!("'{id}' was never dispatched: {:?}", applied.realization_order))
    };
    assert!(
        position(first) < position(second),
        "Expected '{first}' before '{second}', got {:?}",
        applied.realization_order
    );
}

/// Asserts that a stack report carries an output with the expected value.
///
/// # Panics
///
/// Panics if the output is missing or differs.
pub fn assert_output_eq(report: &StackReport, output: &str, expected: &Value) {
    assert_eq!(
        report.outputs.get(output),
        Some(expected),
        "Output '{output}' of '{}' mismatch. Outputs: {:?}",
        report.stack,
        report.outputs
    );
}
