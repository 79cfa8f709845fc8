//! Pause, resume, abort and timeout of runs.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use shipyard_controller::Error;
use shipyard_controller::event::ResultType;
use shipyard_controller::sequence::SequenceState;
use shipyard_controller::store::queue::{PAUSE_COLLECTION, QUEUE_COLLECTION};
use shipyard_controller::scope::EventScope;
use shipyard_controller::store::{
    BatchOutcome, ConnectionManager, DocumentStore, EventQueueRepo, QueueItem,
    SequenceExecutionRepo,
};
use shipyard_core::Clock;
use shipyard_test_utils::{TestHarness, assert_finished_with, assert_state};

const DEPLOYMENT_TRIGGERED: &str = "sh.keptn.event.deployment.triggered";
const TEST_TRIGGERED: &str = "sh.keptn.event.test.triggered";

async fn started_run(harness: &TestHarness, ctx: &str) {
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", ctx))
        .await;
}

#[tokio::test]
async fn paused_run_queues_events_until_resumed() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-pause").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-pause");

    harness.controller.pause("ctx-pause", None).await.unwrap();
    let paused = harness.execution("ctx-pause", "dev").await;
    assert_state(&paused, SequenceState::Paused);
    assert_eq!(paused.status.state_before_pause, Some(SequenceState::Triggered));

    let outcome = harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;
    assert!(outcome.is_queued());
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);
    assert!(harness.published_in(TEST_TRIGGERED, "ctx-pause").is_empty());

    let report = harness.controller.resume("ctx-pause", None).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 0);
    assert_eq!(harness.store.count(PAUSE_COLLECTION).unwrap(), 0);

    assert_eq!(harness.published_in(TEST_TRIGGERED, "ctx-pause").len(), 1);
    let resumed = harness.execution("ctx-pause", "dev").await;
    assert_state(&resumed, SequenceState::Triggered);
    assert_eq!(resumed.status.current_task.unwrap().name, "test");
}

#[tokio::test]
async fn resume_restores_state_before_pause() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-restore").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-restore");
    harness.send(harness.events.task_started(&task, "helm")).await;

    harness.controller.pause("ctx-restore", None).await.unwrap();
    harness.controller.resume("ctx-restore", None).await.unwrap();

    let execution = harness.execution("ctx-restore", "dev").await;
    assert_state(&execution, SequenceState::Started);
    assert_eq!(execution.status.state_before_pause, None);
}

#[tokio::test]
async fn queued_events_replay_in_arrival_order() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-order").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-order");
    harness.controller.pause("ctx-order", None).await.unwrap();

    harness.send(harness.events.task_started(&task, "helm")).await;
    harness.clock.advance(chrono::Duration::seconds(1));
    harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;

    let report = harness.controller.resume("ctx-order", None).await.unwrap();
    assert_eq!(report.delivered, 2);

    let execution = harness.execution("ctx-order", "dev").await;
    assert_eq!(execution.status.previous_tasks.len(), 1);
    assert_eq!(harness.published_in(TEST_TRIGGERED, "ctx-order").len(), 1);
}

#[tokio::test]
async fn stage_pause_only_holds_that_stage() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-stage").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-stage");

    harness
        .controller
        .pause("ctx-stage", Some("dev"))
        .await
        .unwrap();
    let outcome = harness
        .send(harness.events.task_started(&task, "helm"))
        .await;
    assert!(outcome.is_queued());

    // A hardening event of the same run is not held back.
    let mut other_stage = harness.events.task_started(&task, "helm");
    other_stage.data["stage"] = "hardening".into();
    assert!(!harness.send(other_stage).await.is_queued());

    let report = harness
        .controller
        .resume("ctx-stage", Some("dev"))
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
}

#[tokio::test]
async fn drain_skips_items_of_paused_stages() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-other").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-other");

    harness.controller.pause("ctx-other", Some("dev")).await.unwrap();
    harness.send(harness.events.task_started(&task, "helm")).await;

    let report = harness.controller.drain().await.unwrap();
    assert_eq!(report.still_paused, 1);
    assert_eq!(report.delivered, 0);
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);
}

#[tokio::test]
async fn control_commands_on_unknown_run_are_not_found() {
    let harness = TestHarness::new().await;
    assert!(harness.controller.pause("nope", None).await.unwrap_err().is_not_found());
    assert!(harness.controller.resume("nope", None).await.unwrap_err().is_not_found());
    assert!(harness.controller.abort("nope", None).await.unwrap_err().is_not_found());
    assert!(
        harness
            .controller
            .time_out("nope", "dev")
            .await
            .unwrap_err()
            .is_not_found()
    );
}

#[tokio::test]
async fn abort_purges_queue_and_announces_finish() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-abort").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-abort");
    harness.controller.pause("ctx-abort", None).await.unwrap();
    harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);

    let announced = harness.controller.abort("ctx-abort", None).await.unwrap();
    assert_eq!(announced.len(), 1);
    assert_eq!(
        announced[0].event_type,
        "sh.keptn.event.dev.delivery.finished"
    );
    assert_finished_with(&announced[0], "pass", "aborted");
    assert_eq!(
        harness
            .published_in("sh.keptn.event.dev.delivery.finished", "ctx-abort")
            .len(),
        1
    );

    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 0);
    assert_eq!(harness.store.count(PAUSE_COLLECTION).unwrap(), 0);
    let execution = harness.execution("ctx-abort", "dev").await;
    assert_state(&execution, SequenceState::Aborted);

    // Aborted runs neither advance nor promote.
    let late = harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;
    assert!(!late.is_queued());
    assert!(harness.published_in(TEST_TRIGGERED, "ctx-abort").is_empty());
    assert!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.triggered", "ctx-abort")
            .is_empty()
    );

    let again = harness.controller.abort("ctx-abort", None).await;
    assert!(again.unwrap_err().is_not_found());

    // Resuming an aborted run revives nothing.
    let report = harness.controller.resume("ctx-abort", None).await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_state(
        &harness.execution("ctx-abort", "dev").await,
        SequenceState::Aborted,
    );
    assert!(harness.published_in(TEST_TRIGGERED, "ctx-abort").is_empty());
}

#[tokio::test]
async fn abort_of_one_stage_leaves_the_rest() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-partial"))
        .await;
    harness
        .complete_task("deployment", "ctx-partial", ResultType::Pass)
        .await;
    harness
        .complete_task("test", "ctx-partial", ResultType::Pass)
        .await;

    let announced = harness
        .controller
        .abort("ctx-partial", Some("hardening"))
        .await
        .unwrap();
    assert_eq!(announced.len(), 1);
    assert_eq!(
        announced[0].event_type,
        "sh.keptn.event.hardening.delivery.finished"
    );

    assert_state(
        &harness.execution("ctx-partial", "dev").await,
        SequenceState::Finished,
    );
    assert_state(
        &harness.execution("ctx-partial", "hardening").await,
        SequenceState::Aborted,
    );
}

#[tokio::test]
async fn timeout_fails_the_stage() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-timeout").await;

    let announced = harness
        .controller
        .time_out("ctx-timeout", "dev")
        .await
        .unwrap();
    assert_eq!(announced.len(), 1);
    assert_finished_with(&announced[0], "fail", "errored");

    let execution = harness.execution("ctx-timeout", "dev").await;
    assert_state(&execution, SequenceState::TimedOut);
    assert!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.triggered", "ctx-timeout")
            .is_empty()
    );
}

#[tokio::test]
async fn promotion_into_a_paused_stage_is_parked() {
    let harness = TestHarness::new().await;
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", "ctx-gate"))
        .await;
    harness
        .complete_task("deployment", "ctx-gate", ResultType::Pass)
        .await;

    // Hold hardening before any of its sequences exist.
    let hold = EventQueueRepo::pause_op("ctx-gate", Some("hardening")).unwrap();
    let applied = harness.store.apply_batch(vec![hold]).await.unwrap();
    assert_eq!(applied, BatchOutcome::Applied);

    harness
        .complete_task("test", "ctx-gate", ResultType::Pass)
        .await;
    assert_eq!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.triggered", "ctx-gate")
            .len(),
        1
    );
    assert!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.started", "ctx-gate")
            .is_empty()
    );
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);

    let lift = EventQueueRepo::resume_ops("ctx-gate", Some("hardening"));
    harness.store.apply_batch(lift).await.unwrap();
    let report = harness.controller.drain().await.unwrap();
    assert_eq!(report.delivered, 1);

    assert_eq!(
        harness
            .published_in("sh.keptn.event.hardening.delivery.started", "ctx-gate")
            .len(),
        1
    );
    assert_state(
        &harness.execution("ctx-gate", "hardening").await,
        SequenceState::Triggered,
    );
}

#[tokio::test]
async fn drain_loop_delivers_due_items_and_stops() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-loop").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-loop");

    // Park an event directly, as if its pause had been lifted elsewhere.
    let started = harness.events.task_started(&task, "helm");
    let conn = ConnectionManager::new(
        harness.store.clone(),
        Duration::from_millis(100),
        Duration::from_millis(5),
    );
    EventQueueRepo::new(conn)
        .queue_event(&QueueItem::new(
            EventScope::from_event(&started).unwrap(),
            started,
            harness.clock.now(),
        ))
        .await
        .unwrap();

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let handle = tokio::spawn(harness.controller.dispatcher().run_drain_loop(
        Duration::from_millis(10),
        async move {
            let _ = stop_rx.await;
        },
    ));

    tokio::time::timeout(Duration::from_secs(5), async {
        while harness.store.count(QUEUE_COLLECTION).unwrap() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("queue drained");
    stop_tx.send(()).unwrap();
    handle.await.unwrap();

    assert_state(
        &harness.execution("ctx-loop", "dev").await,
        SequenceState::Started,
    );
}

/// Pauses the run's dev execution without writing its pause marker, as if
/// the pause committed after the dispatcher checked for one.
async fn pause_behind_the_gate(harness: &TestHarness, ctx: &str) {
    let execution = harness.execution(ctx, "dev").await;
    let pause = SequenceExecutionRepo::status_update_op(
        &execution.scope.project,
        &execution.id,
        &[execution.status.state],
        SequenceState::Paused,
        Some(execution.status.state),
    );
    let applied = harness.store.apply_batch(vec![pause]).await.unwrap();
    assert_eq!(applied, BatchOutcome::Applied);
}

#[tokio::test]
async fn report_racing_a_pause_is_queued() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-race").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-race");
    pause_behind_the_gate(&harness, "ctx-race").await;

    let outcome = harness
        .send(harness.events.task_finished(&task, "helm", ResultType::Pass))
        .await;
    assert!(outcome.is_queued());
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);
    let paused = harness.execution("ctx-race", "dev").await;
    assert!(paused.status.current_task.unwrap().events.is_empty());

    let report = harness.controller.resume("ctx-race", None).await.unwrap();
    assert_eq!(report.delivered, 1);
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 0);
    assert_eq!(harness.published_in(TEST_TRIGGERED, "ctx-race").len(), 1);
    let resumed = harness.execution("ctx-race", "dev").await;
    assert_eq!(resumed.status.previous_tasks.len(), 1);
}

#[tokio::test]
async fn drain_keeps_items_of_a_run_paused_during_delivery() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-hold").await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, "ctx-hold");

    let started = harness.events.task_started(&task, "helm");
    let conn = ConnectionManager::new(
        harness.store.clone(),
        Duration::from_millis(100),
        Duration::from_millis(5),
    );
    EventQueueRepo::new(conn)
        .queue_event(&QueueItem::new(
            EventScope::from_event(&started).unwrap(),
            started,
            harness.clock.now(),
        ))
        .await
        .unwrap();
    pause_behind_the_gate(&harness, "ctx-hold").await;

    let report = harness.controller.drain().await.unwrap();
    assert_eq!(report.delivered, 0);
    assert_eq!(report.still_paused, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(harness.store.count(QUEUE_COLLECTION).unwrap(), 1);
}

#[tokio::test]
async fn stage_resume_under_a_run_pause_is_rejected() {
    let harness = TestHarness::new().await;
    started_run(&harness, "ctx-whole").await;
    harness.controller.pause("ctx-whole", None).await.unwrap();

    let err = harness
        .controller
        .resume("ctx-whole", Some("dev"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidStateTransition { .. }), "{err}");
    assert_state(
        &harness.execution("ctx-whole", "dev").await,
        SequenceState::Paused,
    );
    assert_eq!(harness.store.count(PAUSE_COLLECTION).unwrap(), 1);

    harness.controller.resume("ctx-whole", None).await.unwrap();
    assert_state(
        &harness.execution("ctx-whole", "dev").await,
        SequenceState::Triggered,
    );
    assert_eq!(harness.store.count(PAUSE_COLLECTION).unwrap(), 0);
}
