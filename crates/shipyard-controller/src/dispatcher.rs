//! Pause gate in front of the engine.
//!
//! Every event, including the follow-up triggers the engine produces, passes
//! through [`Dispatcher::dispatch`]. If its run or stage is paused the event
//! is parked in the queue; otherwise it is handed to the engine. A task event
//! the engine refuses because the pause landed after the gate was checked is
//! parked the same way. A follow-up that fails with a retryable error is
//! parked for the next drain pass.
//!
//! Parked events are replayed by [`Dispatcher::drain`], either right after a
//! resume or periodically from [`Dispatcher::run_drain_loop`]. A queue item
//! is removed only after the engine handled it. If handling fails, the item
//! stays queued and later items of the same run are held back so the run
//! still sees its events in order.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use shipyard_core::Clock;

use crate::engine::{EngineOutput, SequenceEngine};
use crate::error::Result;
use crate::event::KeptnEvent;
use crate::metrics::ControllerMetrics;
use crate::scope::EventScope;
use crate::store::{EventQueueRepo, QueueItem};

/// What happened to a dispatched event.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The engine handled the event.
    Delivered(EngineOutput),
    /// The event was parked until its run or stage resumes.
    Queued,
}

impl DispatchOutcome {
    /// Returns true if the event was parked.
    #[must_use]
    pub fn is_queued(&self) -> bool {
        matches!(self, Self::Queued)
    }
}

/// Counts of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Items handed to the engine and removed.
    pub delivered: usize,
    /// Items left queued because their run or stage is still paused.
    pub still_paused: usize,
    /// Items whose hand-off failed.
    pub failed: usize,
    /// Items held back behind a failed item of the same run.
    pub held_back: usize,
}

/// Routes events to the engine or the queue.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    engine: Arc<SequenceEngine>,
    queue: EventQueueRepo,
    clock: Arc<dyn Clock>,
    metrics: ControllerMetrics,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(engine: Arc<SequenceEngine>, queue: EventQueueRepo, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            queue,
            clock,
            metrics: ControllerMetrics::new(),
        }
    }

    /// Dispatches `event` and then every follow-up it causes.
    ///
    /// A sequence trigger without a run context is given one first. The
    /// outcome describes `event` itself. Follow-ups go through the same
    /// pause gate; one that fails retryably is parked and replayed by the
    /// next drain, any other failure is logged.
    ///
    /// # Errors
    ///
    /// Returns the engine's error for `event`, or the store error if a
    /// failed follow-up could not be parked.
    #[tracing::instrument(skip(self, event), fields(event_type = %event.event_type, id = %event.id))]
    pub async fn dispatch(&self, mut event: KeptnEvent) -> Result<DispatchOutcome> {
        self.engine.assign_context(&mut event);
        let outcome = self.dispatch_one(&event).await?;
        if let DispatchOutcome::Delivered(output) = &outcome {
            self.dispatch_follow_ups(output.follow_ups.clone()).await?;
        }
        Ok(outcome)
    }

    async fn dispatch_follow_ups(&self, follow_ups: Vec<KeptnEvent>) -> Result<()> {
        let mut pending: VecDeque<KeptnEvent> = follow_ups.into();
        let mut unparked = None;
        while let Some(next) = pending.pop_front() {
            match self.dispatch_one(&next).await {
                Ok(DispatchOutcome::Delivered(output)) => pending.extend(output.follow_ups),
                Ok(DispatchOutcome::Queued) => {}
                Err(e) if e.is_retryable() => {
                    tracing::warn!(
                        error = %e,
                        event_type = %next.event_type,
                        id = %next.id,
                        "follow-up dispatch failed, parking it for the next drain"
                    );
                    if let Err(park_err) = self.park(&next).await {
                        tracing::error!(
                            error = %park_err,
                            id = %next.id,
                            "follow-up lost: could not park it"
                        );
                        if unparked.is_none() {
                            unparked = Some(park_err);
                        }
                    }
                }
                Err(e) => tracing::error!(
                    error = %e,
                    event_type = %next.event_type,
                    id = %next.id,
                    "follow-up dispatch failed"
                ),
            }
        }
        unparked.map_or(Ok(()), Err)
    }

    async fn dispatch_one(&self, event: &KeptnEvent) -> Result<DispatchOutcome> {
        let scope = EventScope::from_event(event)?;
        if !scope.keptn_context.is_empty()
            && self
                .queue
                .is_paused(&scope.keptn_context, &scope.stage)
                .await?
        {
            tracing::info!("run is paused, event queued");
            return self.queue_paused(event).await;
        }
        match self.engine.handle(event).await {
            Ok(output) => Ok(DispatchOutcome::Delivered(output)),
            Err(e) if e.is_paused() => {
                tracing::info!(error = %e, "run paused during handling, event queued");
                self.queue_paused(event).await
            }
            Err(e) => Err(e),
        }
    }

    async fn queue_paused(&self, event: &KeptnEvent) -> Result<DispatchOutcome> {
        self.park(event).await?;
        self.metrics.record_queued();
        Ok(DispatchOutcome::Queued)
    }

    /// Queues `event` as due now. An event that is already queued is fine.
    async fn park(&self, event: &KeptnEvent) -> Result<()> {
        let scope = EventScope::from_event(event)?;
        let item = QueueItem::new(scope, event.clone(), self.clock.now());
        match self.queue.queue_event(&item).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_already_exists() => {
                tracing::debug!(id = %event.id, "event already queued");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Replays queued events that are due at `now`.
    ///
    /// # Errors
    ///
    /// Returns a store error if the queue cannot be read.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self, now: DateTime<Utc>) -> Result<DrainReport> {
        let items = self.queue.get_queued_before(now).await?;
        let eligible = items.len();
        let mut report = DrainReport::default();
        let mut held: HashSet<String> = HashSet::new();

        for item in items {
            let context = item.scope.keptn_context.clone();
            if held.contains(&context) {
                report.held_back += 1;
                continue;
            }
            if self.queue.is_paused(&context, &item.scope.stage).await? {
                report.still_paused += 1;
                continue;
            }

            match self.engine.handle(&item.event).await {
                Ok(output) => {
                    self.queue.delete_queued(&item.event_id).await?;
                    report.delivered += 1;
                    if let Err(e) = self.dispatch_follow_ups(output.follow_ups).await {
                        tracing::error!(
                            error = %e,
                            event_id = %item.event_id,
                            "follow-ups of queued event failed"
                        );
                    }
                }
                Err(e) if e.is_already_exists() => {
                    tracing::debug!(event_id = %item.event_id, "queued event was already applied");
                    self.queue.delete_queued(&item.event_id).await?;
                    report.delivered += 1;
                }
                Err(e) if e.is_paused() => {
                    tracing::debug!(event_id = %item.event_id, "run paused during drain");
                    held.insert(context);
                    report.still_paused += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        event_id = %item.event_id,
                        "queued event could not be delivered"
                    );
                    held.insert(context);
                    report.failed += 1;
                }
            }
        }

        let outcome = if report.failed == 0 { "ok" } else { "partial" };
        self.metrics.record_drain(outcome, eligible);
        if report.delivered > 0 || report.failed > 0 {
            tracing::info!(?report, "drained event queue");
        }
        Ok(report)
    }

    /// Drains every `interval` until `shutdown` completes.
    pub async fn run_drain_loop<F>(self: Arc<Self>, interval: Duration, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tokio::pin!(shutdown);
        tracing::info!(?interval, "drain loop started");

        loop {
            tokio::select! {
                () = &mut shutdown => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.drain(self.clock.now()).await {
                        tracing::error!(error = %e, "drain pass failed");
                    }
                }
            }
        }
        tracing::info!("drain loop stopped");
    }
}
