//! Cross-stage triggering of sequences.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serde_json::json;

use shipyard_controller::event::ResultType;
use shipyard_controller::sequence::SequenceState;
use shipyard_controller::store::queue::QUEUE_COLLECTION;
use shipyard_test_utils::{TestHarness, assert_state};

const HARDENING_TRIGGERED: &str = "sh.keptn.event.hardening.delivery.triggered";
const PRODUCTION_TRIGGERED: &str = "sh.keptn.event.production.delivery.triggered";
const ROLLBACK_TRIGGERED: &str = "sh.keptn.event.production.rollback.triggered";

async fn finish_dev(harness: &TestHarness, ctx: &str) {
    harness
        .send(harness.events.delivery_with_image("dev", ctx, "carts:1.0.0"))
        .await;
    harness.complete_task("deployment", ctx, ResultType::Pass).await;
    harness.complete_task("test", ctx, ResultType::Pass).await;
}

#[tokio::test]
async fn passing_dev_delivery_promotes_to_hardening() {
    let harness = TestHarness::new().await;
    finish_dev(&harness, "ctx-promo").await;

    let dev_finished = harness.last_published("sh.keptn.event.dev.delivery.finished", "ctx-promo");
    let promotion = harness.last_published(HARDENING_TRIGGERED, "ctx-promo");
    assert_eq!(promotion.keptn_context, "ctx-promo");
    assert_eq!(promotion.triggered_id, dev_finished.id);
    assert_eq!(promotion.data["stage"], "hardening");
    assert_eq!(promotion.data["service"], "carts");
    assert_eq!(
        promotion.data["configurationChange"]["values"]["image"],
        "carts:1.0.0"
    );

    let hardening = harness.execution("ctx-promo", "hardening").await;
    assert_state(&hardening, SequenceState::Triggered);
    assert_eq!(hardening.scope.triggered_id, promotion.id);
    assert_eq!(hardening.status.current_task.unwrap().name, "deployment");

    let deployment = harness.last_published("sh.keptn.event.deployment.triggered", "ctx-promo");
    assert_eq!(deployment.data["stage"], "hardening");
    assert_eq!(deployment.triggered_id, promotion.id);
}

#[tokio::test]
async fn promotion_carries_output_of_completed_tasks() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-carry"))
        .await;
    let deployment = harness.last_published("sh.keptn.event.deployment.triggered", "ctx-carry");
    harness
        .send(harness.events.task_finished_with(
            &deployment,
            "helm",
            ResultType::Pass,
            json!({"deployment": {"gitCommit": "abc123"}}),
        ))
        .await;
    harness.complete_task("test", "ctx-carry", ResultType::Pass).await;

    let promotion = harness.last_published(HARDENING_TRIGGERED, "ctx-carry");
    assert_eq!(promotion.data["deployment"]["gitCommit"], "abc123");
}

#[tokio::test]
async fn selector_filters_on_result() {
    let harness = TestHarness::new().await;
    finish_dev(&harness, "ctx-fail-hardening").await;
    harness
        .complete_task("deployment", "ctx-fail-hardening", ResultType::Fail)
        .await;

    let hardening = harness.execution("ctx-fail-hardening", "hardening").await;
    assert_state(&hardening, SequenceState::Finished);
    assert_eq!(hardening.result(), ResultType::Fail);

    // `production.delivery` has no selector, `production.rollback` wants `fail`.
    assert_eq!(
        harness
            .published_in(PRODUCTION_TRIGGERED, "ctx-fail-hardening")
            .len(),
        1
    );
    assert_eq!(
        harness
            .published_in(ROLLBACK_TRIGGERED, "ctx-fail-hardening")
            .len(),
        1
    );

    let production = harness
        .controller
        .executions()
        .get_by_context("ctx-fail-hardening", Some("production"), &[])
        .await
        .unwrap();
    let mut names: Vec<&str> = production.iter().map(|e| e.sequence.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, ["delivery", "rollback"]);
}

#[tokio::test]
async fn passing_hardening_skips_rollback() {
    let harness = TestHarness::new().await;
    finish_dev(&harness, "ctx-prod").await;
    harness
        .complete_task("deployment", "ctx-prod", ResultType::Pass)
        .await;
    harness
        .complete_task("release", "ctx-prod", ResultType::Pass)
        .await;

    assert_eq!(harness.published_in(PRODUCTION_TRIGGERED, "ctx-prod").len(), 1);
    assert!(harness.published_in(ROLLBACK_TRIGGERED, "ctx-prod").is_empty());
    let production = harness.execution("ctx-prod", "production").await;
    assert_eq!(production.sequence.name, "delivery");
}

#[tokio::test]
async fn whole_pipeline_runs_to_production() {
    let harness = TestHarness::new().await;
    finish_dev(&harness, "ctx-e2e").await;
    for task in ["deployment", "release"] {
        harness.complete_task(task, "ctx-e2e", ResultType::Pass).await;
    }
    for task in ["deployment", "release"] {
        harness.complete_task(task, "ctx-e2e", ResultType::Pass).await;
    }

    for stage in ["dev", "hardening", "production"] {
        let execution = harness.execution("ctx-e2e", stage).await;
        assert_state(&execution, SequenceState::Finished);
        assert_eq!(execution.result(), ResultType::Pass);
    }
    let finished = harness.last_published("sh.keptn.event.production.delivery.finished", "ctx-e2e");
    assert_eq!(finished.data["result"], "pass");
}

#[tokio::test]
async fn unrelated_run_is_not_promoted() {
    let harness = TestHarness::new().await;
    finish_dev(&harness, "ctx-a").await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-b"))
        .await;

    assert_eq!(harness.published(HARDENING_TRIGGERED).len(), 1);
    assert!(harness.published_in(HARDENING_TRIGGERED, "ctx-b").is_empty());
}

#[tokio::test]
async fn failed_promotion_is_parked_and_retried() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.delivery_with_image("dev", "ctx-retry", "carts:1.0.0"))
        .await;
    harness
        .complete_task("deployment", "ctx-retry", ResultType::Pass)
        .await;

    harness
        .outbox
        .fail_next("sh.keptn.event.hardening.delivery.started");
    harness.complete_task("test", "ctx-retry", ResultType::Pass).await;

    let hardening = harness
        .controller
        .executions()
        .get_by_context("ctx-retry", Some("hardening"), &[])
        .await
        .unwrap();
    assert!(hardening.is_empty());
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);

    let report = harness.controller.drain().await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 0);

    let promotion = harness.last_published(HARDENING_TRIGGERED, "ctx-retry");
    assert_eq!(harness.published_in(HARDENING_TRIGGERED, "ctx-retry").len(), 1);
    let hardening = harness.execution("ctx-retry", "hardening").await;
    assert_state(&hardening, SequenceState::Triggered);
    assert_eq!(hardening.scope.triggered_id, promotion.id);
    assert_eq!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.started", "ctx-retry")
            .len(),
        1
    );
}
