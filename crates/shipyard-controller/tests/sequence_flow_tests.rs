//! End-to-end sequence execution through the controller.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::json;

use shipyard_controller::event::ResultType;
use shipyard_controller::sequence::SequenceState;
use shipyard_test_utils::{
    TestHarness, assert_event_types, assert_finished_with, assert_state, init_test_logging,
};

const DEV_FINISHED: &str = "sh.keptn.event.dev.delivery.finished";
const DEPLOYMENT_TRIGGERED: &str = "sh.keptn.event.deployment.triggered";
const TEST_TRIGGERED: &str = "sh.keptn.event.test.triggered";

#[tokio::test]
async fn trigger_starts_sequence_and_first_task() {
    init_test_logging();
    let harness = TestHarness::new().await;

    let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-start");
    let outcome = harness.send(trigger.clone()).await;
    assert!(!outcome.is_queued());

    assert_event_types(
        &harness.outbox.events(),
        &["sh.keptn.event.dev.delivery.started", DEPLOYMENT_TRIGGERED],
    );
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-start");
    assert_eq!(task.triggered_id, trigger.id);
    assert_eq!(task.data["stage"], "dev");
    assert_eq!(task.data["deployment"]["deploymentstrategy"], "direct");

    let execution = harness.execution("ctx-start", "dev").await;
    assert_state(&execution, SequenceState::Triggered);
    assert_eq!(execution.scope.triggered_id, trigger.id);
    let current = execution.status.current_task.expect("first task is current");
    assert_eq!(current.name, "deployment");
    assert_eq!(current.triggered_id, task.id);
}

#[tokio::test]
async fn redelivered_trigger_is_rejected_without_side_effects() {
    let harness = TestHarness::new().await;
    let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-dup");

    harness.send(trigger.clone()).await;
    let before = harness.outbox.events().len();

    let err = harness
        .controller
        .handle_event(trigger)
        .await
        .expect_err("second delivery is rejected");
    assert!(err.is_already_exists());
    assert_eq!(harness.outbox.events().len(), before);

    let executions = harness
        .controller
        .executions()
        .get_by_context("ctx-dup", None, &[])
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
}

#[tokio::test]
async fn started_report_moves_execution_to_started() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-s"))
        .await;

    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-s");
    harness.send(harness.events.task_started(&task, "helm")).await;

    let execution = harness.execution("ctx-s", "dev").await;
    assert_state(&execution, SequenceState::Started);
    let current = execution.status.current_task.unwrap();
    assert_eq!(current.started_count(), 1);
    assert_eq!(current.finished_count(), 0);
}

#[tokio::test]
async fn tasks_advance_in_order_and_accumulate_output() {
    let harness = TestHarness::new().await;
    let trigger = harness.events.delivery_with_image("dev", "ctx-adv", "carts:0.1.0");
    harness.send(trigger).await;

    let deployment = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-adv");
    assert_eq!(
        deployment.data["configurationChange"]["values"]["image"],
        "carts:0.1.0"
    );
    harness
        .send(harness.events.task_started(&deployment, "helm"))
        .await;
    harness
        .send(harness.events.task_finished_with(
            &deployment,
            "helm",
            ResultType::Pass,
            json!({"deployment": {"deploymentURIsLocal": ["http://carts.dev"]}}),
        ))
        .await;

    let test = harness.last_published(TEST_TRIGGERED, "ctx-adv");
    assert_eq!(
        test.data["deployment"]["deploymentURIsLocal"][0],
        "http://carts.dev"
    );
    assert_eq!(test.data["test"]["teststrategy"], "functional");
    assert_eq!(
        test.data["configurationChange"]["values"]["image"],
        "carts:0.1.0"
    );

    let execution = harness.execution("ctx-adv", "dev").await;
    assert_state(&execution, SequenceState::Triggered);
    assert_eq!(execution.status.previous_tasks.len(), 1);
    assert_eq!(execution.status.previous_tasks[0].name, "deployment");
    assert_eq!(execution.status.previous_tasks[0].result, ResultType::Pass);
    assert_eq!(execution.status.current_task.unwrap().name, "test");
}

#[tokio::test]
async fn last_task_finishes_sequence() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-fin"))
        .await;

    harness
        .complete_task("deployment", "ctx-fin", ResultType::Pass)
        .await;
    harness
        .complete_task("test", "ctx-fin", ResultType::Warning)
        .await;

    let execution = harness.execution("ctx-fin", "dev").await;
    assert_state(&execution, SequenceState::Finished);
    assert!(execution.status.current_task.is_none());
    assert_eq!(execution.status.previous_tasks.len(), 2);

    let finished = harness.last_published(DEV_FINISHED, "ctx-fin");
    assert_finished_with(&finished, "warning", "succeeded");
    assert_eq!(finished.data["stage"], "dev");
}

#[tokio::test]
async fn failed_task_short_circuits_the_sequence() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-fail"))
        .await;

    harness
        .complete_task("deployment", "ctx-fail", ResultType::Fail)
        .await;

    assert!(harness.published_in(TEST_TRIGGERED, "ctx-fail").is_empty());
    let execution = harness.execution("ctx-fail", "dev").await;
    assert_state(&execution, SequenceState::Finished);
    assert_eq!(execution.result(), ResultType::Fail);

    let finished = harness.last_published(DEV_FINISHED, "ctx-fail");
    assert_finished_with(&finished, "fail", "errored");
    assert!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.triggered", "ctx-fail")
            .is_empty(),
        "a failed dev delivery must not promote to hardening"
    );
}

#[tokio::test]
async fn task_waits_for_every_started_executor() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-multi"))
        .await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-multi");

    harness.send(harness.events.task_started(&task, "helm")).await;
    harness.send(harness.events.task_started(&task, "argo")).await;
    harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;
    assert!(harness.published_in(TEST_TRIGGERED, "ctx-multi").is_empty());

    harness
        .send(harness.events.task_finished(&task, "argo", ResultType::Warning))
        .await;
    assert_eq!(harness.published_in(TEST_TRIGGERED, "ctx-multi").len(), 1);

    let execution = harness.execution("ctx-multi", "dev").await;
    assert_eq!(execution.status.previous_tasks[0].result, ResultType::Warning);
}

#[tokio::test]
async fn reports_for_a_completed_task_are_ignored() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-stale"))
        .await;
    let deployment = harness
        .complete_task("deployment", "ctx-stale", ResultType::Pass)
        .await;
    let published = harness.outbox.events().len();

    let late = harness
        .send(harness.events.task_finished(&deployment, "late", ResultType::Fail))
        .await;
    match late {
        shipyard_controller::DispatchOutcome::Delivered(output) => assert!(output.is_empty()),
        shipyard_controller::DispatchOutcome::Queued => panic!("late report was queued"),
    }
    assert_eq!(harness.outbox.events().len(), published);

    let execution = harness.execution("ctx-stale", "dev").await;
    assert_eq!(execution.status.current_task.unwrap().name, "test");
    assert_eq!(execution.status.previous_tasks.len(), 1);
}

#[tokio::test]
async fn report_for_another_task_name_is_ignored() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-name"))
        .await;
    let deployment = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-name");

    let mut wrong = harness
        .events
        .task_finished(&deployment, "helm", ResultType::Pass);
    wrong.event_type = "sh.keptn.event.release.finished".to_string();
    harness.send(wrong).await;

    let execution = harness.execution("ctx-name", "dev").await;
    assert!(execution.status.current_task.unwrap().events.is_empty());
}

#[tokio::test]
async fn sequence_without_tasks_finishes_immediately() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "noop", "ctx-noop"))
        .await;

    assert_event_types(
        &harness.outbox.events(),
        &[
            "sh.keptn.event.dev.noop.started",
            "sh.keptn.event.dev.noop.finished",
        ],
    );
    let execution = harness.execution("ctx-noop", "dev").await;
    assert_state(&execution, SequenceState::Finished);
    assert_finished_with(
        &harness.last_published("sh.keptn.event.dev.noop.finished", "ctx-noop"),
        "pass",
        "succeeded",
    );
}

#[tokio::test]
async fn unknown_sequence_is_not_found() {
    let harness = TestHarness::new().await;
    let err = harness
        .controller
        .handle_event(harness.events.sequence_triggered("dev", "unknown", "ctx-u"))
        .await
        .expect_err("sequence is not in the shipyard");
    assert!(err.is_not_found());
    assert!(harness.outbox.events().is_empty());
}

#[tokio::test]
async fn unrelated_events_are_ignored() {
    let harness = TestHarness::new().await;
    let mut other = harness.events.sequence_triggered("dev", "delivery", "ctx-o");
    other.event_type = "sh.keptn.log.error".to_string();

    let outcome = harness.send(other).await;
    assert!(matches!(
        outcome,
        shipyard_controller::DispatchOutcome::Delivered(ref out) if out.is_empty()
    ));
    assert!(harness.outbox.events().is_empty());
}

#[tokio::test]
async fn store_outage_is_retryable_and_recovers() {
    let harness = TestHarness::new().await;
    let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-outage");

    harness.store.set_available(false);
    let err = harness
        .controller
        .handle_event(trigger.clone())
        .await
        .expect_err("store is down");
    assert!(err.is_retryable(), "unexpected error: {err}");
    assert!(harness.outbox.events().is_empty());

    harness.store.set_available(true);
    harness.send(trigger).await;
    let execution = harness.execution("ctx-outage", "dev").await;
    assert_state(&execution, SequenceState::Triggered);
}

#[tokio::test]
async fn trigger_without_context_gets_one_assigned() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", ""))
        .await;

    let started = harness.published("sh.keptn.event.dev.delivery.started");
    assert_eq!(started.len(), 1);
    let ctx = started[0].keptn_context.clone();
    assert!(!ctx.is_empty());

    let execution = harness.execution(&ctx, "dev").await;
    assert_eq!(execution.scope.keptn_context, ctx);
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, &ctx);
    assert_eq!(task.triggered_id, execution.scope.triggered_id);
}

#[tokio::test]
async fn failed_start_leaves_nothing_and_redelivery_recovers() {
    let harness = TestHarness::new().await;
    let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-sink");

    harness.outbox.fail_next(DEPLOYMENT_TRIGGERED);
    let err = harness
        .controller
        .handle_event(trigger.clone())
        .await
        .expect_err("sink refused the first task");
    assert!(err.is_retryable(), "unexpected error: {err}");
    let leftovers = harness
        .controller
        .executions()
        .get_by_context("ctx-sink", None, &[])
        .await
        .unwrap();
    assert!(leftovers.is_empty());

    harness.send(trigger).await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-sink");
    assert_eq!(harness.published_in(DEPLOYMENT_TRIGGERED, "ctx-sink").len(), 1);
    let execution = harness.execution("ctx-sink", "dev").await;
    assert_state(&execution, SequenceState::Triggered);
    assert_eq!(execution.status.current_task.unwrap().triggered_id, task.id);
}

#[tokio::test]
async fn redelivered_report_counts_once() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-again"))
        .await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-again");
    harness.send(harness.events.task_started(&task, "helm")).await;
    harness.send(harness.events.task_started(&task, "argo")).await;

    let finished = harness.events.task_finished(&task, "helm", ResultType::Pass);
    harness.send(finished.clone()).await;
    harness.send(finished).await;

    assert!(harness.published_in(TEST_TRIGGERED, "ctx-again").is_empty());
    let current = harness
        .execution("ctx-again", "dev")
        .await
        .status
        .current_task
        .unwrap();
    assert_eq!(current.name, "deployment");
    assert_eq!(current.finished_count(), 1);
    assert_eq!(current.events.len(), 3);
}
