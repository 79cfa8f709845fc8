//! Concurrent event handling against a shared store.
//!
//! Reports for the same task race each other through guarded appends; none
//! may be lost and the task may only advance once.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use futures::future::join_all;

use shipyard_controller::event::ResultType;
use shipyard_controller::sequence::SequenceState;
use shipyard_test_utils::{TestHarness, assert_state};

const DEPLOYMENT_TRIGGERED: &str = "sh.keptn.event.deployment.triggered";
const TEST_TRIGGERED: &str = "sh.keptn.event.test.triggered";

async fn concurrent_reports_are_all_kept(executors: usize) {
    let harness = TestHarness::new().await;
    let ctx = format!("ctx-concurrent-{executors}");
    harness
        .send(harness.events.sequence_triggered("dev", "delivery", &ctx))
        .await;
    let task = harness.last_published(DEPLOYMENT_TRIGGERED, &ctx);

    let started = (0..executors)
        .map(|i| harness.events.task_started(&task, &format!("executor-{i}")))
        .map(|event| harness.send(event));
    join_all(started).await;

    let execution = harness.execution(&ctx, "dev").await;
    assert_state(&execution, SequenceState::Started);
    let current = execution.status.current_task.unwrap();
    assert_eq!(current.started_count(), executors);
    let mut sources: Vec<String> = current.events.iter().map(|e| e.source.clone()).collect();
    sources.sort();
    sources.dedup();
    assert_eq!(sources.len(), executors, "every executor is recorded once");

    let finished = (0..executors)
        .map(|i| {
            let result = if i == executors - 1 {
                ResultType::Warning
            } else {
                ResultType::Pass
            };
            harness
                .events
                .task_finished(&task, &format!("executor-{i}"), result)
        })
        .map(|event| harness.send(event));
    join_all(finished).await;

    assert_eq!(
        harness.published_in(TEST_TRIGGERED, &ctx).len(),
        1,
        "the next task is triggered exactly once"
    );
    let execution = harness.execution(&ctx, "dev").await;
    assert_eq!(execution.status.previous_tasks.len(), 1);
    assert_eq!(execution.status.previous_tasks[0].result, ResultType::Warning);
    assert_eq!(execution.status.current_task.unwrap().name, "test");
}

#[tokio::test]
async fn single_executor() {
    concurrent_reports_are_all_kept(1).await;
}

#[tokio::test]
async fn ten_executors() {
    concurrent_reports_are_all_kept(10).await;
}

#[tokio::test]
async fn hundred_executors() {
    concurrent_reports_are_all_kept(100).await;
}

#[tokio::test]
async fn concurrent_redeliveries_create_one_execution() {
    let harness = TestHarness::new().await;
    let trigger = harness.events.sequence_triggered("dev", "delivery", "ctx-redeliver");

    let attempts = (0..20).map(|_| harness.controller.handle_event(trigger.clone()));
    let results = join_all(attempts).await;

    let accepted = results.iter().filter(|r| r.is_ok()).count();
    let duplicates = results
        .iter()
        .filter(|r| r.as_ref().is_err_and(shipyard_controller::Error::is_already_exists))
        .count();
    assert_eq!(accepted, 1);
    assert_eq!(duplicates, 19);

    let executions = harness
        .controller
        .executions()
        .get_by_context("ctx-redeliver", None, &[])
        .await
        .unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(
        harness
            .published_in(DEPLOYMENT_TRIGGERED, "ctx-redeliver")
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_runs_do_not_interfere() {
    let harness = Arc::new(TestHarness::new().await);

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move {
                let ctx = format!("ctx-parallel-{i}");
                let trigger = harness.events.sequence_triggered("dev", "delivery", &ctx);
                harness.controller.handle_event(trigger).await.unwrap();
                let task = harness.last_published(DEPLOYMENT_TRIGGERED, &ctx);
                let finished = harness
                    .events
                    .task_finished(&task, "helm", ResultType::Pass);
                harness.controller.handle_event(finished).await.unwrap();
                ctx
            })
        })
        .collect();

    for handle in handles {
        let ctx = handle.await.unwrap();
        let execution = harness.execution(&ctx, "dev").await;
        assert_eq!(execution.status.previous_tasks.len(), 1);
        assert_eq!(execution.status.current_task.unwrap().name, "test");
    }
    assert_eq!(harness.published(TEST_TRIGGERED).len(), 16);
}
