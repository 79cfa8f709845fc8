//! Custom assertion helpers for integration tests.

use shipyard_controller::event::KeptnEvent;
use shipyard_controller::sequence::{SequenceExecution, SequenceState};

/// Asserts that an execution is in `expected`.
///
/// # Panics
///
/// Panics if the state differs.
pub fn assert_state(execution: &SequenceExecution, expected: SequenceState) {
    assert_eq!(
        execution.status.state, expected,
        "Expected execution {} of {}.{} to be {expected}, but it was {}",
        execution.id, execution.scope.stage, execution.sequence.name, execution.status.state
    );
}

/// Asserts that `events` contain exactly the given types, in order.
///
/// # Panics
///
/// Panics if the type sequences differ.
pub fn assert_event_types(events: &[KeptnEvent], expected: &[&str]) {
    let actual: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(actual, expected, "Unexpected event types");
}

/// Asserts that a finished event reports `result` and `status`.
///
/// # Panics
///
/// Panics if the payload differs.
pub fn assert_finished_with(event: &KeptnEvent, result: &str, status: &str) {
    assert_eq!(
        event.data["result"], result,
        "Expected result {result} on {}",
        event.event_type
    );
    assert_eq!(
        event.data["status"], status,
        "Expected status {status} on {}",
        event.event_type
    );
}
