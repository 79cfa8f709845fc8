//! Property-based tests for task completion.
//!
//! Whatever the mix of executors and results, every report is kept and the
//! task completes exactly once with its worst result.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use tokio_test::block_on;

use shipyard_controller::event::ResultType;
use shipyard_controller::sequence::SequenceState;
use shipyard_test_utils::TestHarness;

fn arb_result() -> impl Strategy<Value = ResultType> {
    prop_oneof![
        4 => Just(ResultType::Pass),
        2 => Just(ResultType::Warning),
        1 => Just(ResultType::Fail),
    ]
}

fn worst(results: &[ResultType]) -> ResultType {
    if results.contains(&ResultType::Fail) {
        ResultType::Fail
    } else if results.contains(&ResultType::Warning) {
        ResultType::Warning
    } else {
        ResultType::Pass
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn task_completes_once_with_worst_result(
        results in prop::collection::vec(arb_result(), 1..12),
        reversed in any::<bool>(),
    ) {
        block_on(async {
            let harness = TestHarness::new().await;
            harness
                .send(harness.events.sequence_triggered("dev", "delivery", "ctx-prop"))
                .await;
            let task = harness.last_published("sh.keptn.event.deployment.triggered", "ctx-prop");

            for i in 0..results.len() {
                harness
                    .send(harness.events.task_started(&task, &format!("executor-{i}")))
                    .await;
            }
            let mut order: Vec<usize> = (0..results.len()).collect();
            if reversed {
                order.reverse();
            }
            for i in order {
                harness
                    .send(harness.events.task_finished(&task, &format!("executor-{i}"), results[i]))
                    .await;
            }

            let expected = worst(&results);
            let execution = harness.execution("ctx-prop", "dev").await;
            assert_eq!(execution.status.previous_tasks.len(), 1);
            assert_eq!(execution.status.previous_tasks[0].result, expected);

            let next = harness.published_in("sh.keptn.event.test.triggered", "ctx-prop");
            if expected == ResultType::Fail {
                assert!(next.is_empty());
                assert_eq!(execution.status.state, SequenceState::Finished);
            } else {
                assert_eq!(next.len(), 1);
                assert_eq!(execution.status.state, SequenceState::Triggered);
            }
        });
    }
}
