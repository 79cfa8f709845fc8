//! Controller metrics.
//!
//! Recorded through the `metrics` facade; installing an exporter is up to the
//! embedding process.
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `shipyard_events_handled_total` | Counter | `kind`, `outcome` | Lifecycle events handled |
//! | `shipyard_event_handle_duration_seconds` | Histogram | `kind` | Time to handle one event |
//! | `shipyard_events_queued_total` | Counter | - | Events parked while paused |
//! | `shipyard_queue_drains_total` | Counter | `outcome` | Drain passes |
//! | `shipyard_queue_depth` | Gauge | - | Eligible items seen by the last drain |
//! | `shipyard_sequences_total` | Counter | `state`, `result` | Sequences reaching a terminal state |
//! | `shipyard_control_commands_total` | Counter | `command`, `outcome` | Pause/resume/abort/timeout |

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    /// Counter: lifecycle events handled.
    pub const EVENTS_HANDLED_TOTAL: &str = "shipyard_events_handled_total";
    /// Histogram: time to handle one event, in seconds.
    pub const EVENT_HANDLE_DURATION_SECONDS: &str = "shipyard_event_handle_duration_seconds";
    /// Counter: events parked while paused.
    pub const EVENTS_QUEUED_TOTAL: &str = "shipyard_events_queued_total";
    /// Counter: drain passes.
    pub const QUEUE_DRAINS_TOTAL: &str = "shipyard_queue_drains_total";
    /// Gauge: eligible items seen by the last drain.
    pub const QUEUE_DEPTH: &str = "shipyard_queue_depth";
    /// Counter: sequences reaching a terminal state.
    pub const SEQUENCES_TOTAL: &str = "shipyard_sequences_total";
    /// Counter: control commands.
    pub const CONTROL_COMMANDS_TOTAL: &str = "shipyard_control_commands_total";
}

/// Label keys.
pub mod labels {
    /// Event kind (triggered, started, finished).
    pub const KIND: &str = "kind";
    /// Outcome (handled, ignored, queued, error).
    pub const OUTCOME: &str = "outcome";
    /// Terminal sequence state.
    pub const STATE: &str = "state";
    /// Sequence result.
    pub const RESULT: &str = "result";
    /// Control command name.
    pub const COMMAND: &str = "command";
}

/// Records controller metrics. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    /// Creates a recorder.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Counts a handled event.
    pub fn record_event(&self, kind: &str, outcome: &str) {
        counter!(
            names::EVENTS_HANDLED_TOTAL,
            labels::KIND => kind.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }

    /// Records how long handling an event took.
    pub fn observe_handle_duration(&self, kind: &str, duration: Duration) {
        histogram!(
            names::EVENT_HANDLE_DURATION_SECONDS,
            labels::KIND => kind.to_string(),
        )
        .record(duration.as_secs_f64());
    }

    /// Counts a parked event.
    pub fn record_queued(&self) {
        counter!(names::EVENTS_QUEUED_TOTAL).increment(1);
    }

    /// Counts a drain pass and records how many items were eligible.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_drain(&self, outcome: &str, eligible: usize) {
        counter!(
            names::QUEUE_DRAINS_TOTAL,
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
        gauge!(names::QUEUE_DEPTH).set(eligible as f64);
    }

    /// Counts a sequence reaching a terminal state.
    pub fn record_sequence_outcome(&self, state: &str, result: &str) {
        counter!(
            names::SEQUENCES_TOTAL,
            labels::STATE => state.to_string(),
            labels::RESULT => result.to_string(),
        )
        .increment(1);
    }

    /// Counts a control command.
    pub fn record_control_command(&self, command: &str, outcome: &str) {
        counter!(
            names::CONTROL_COMMANDS_TOTAL,
            labels::COMMAND => command.to_string(),
            labels::OUTCOME => outcome.to_string(),
        )
        .increment(1);
    }
}

/// Calls `on_drop` with the elapsed time when dropped.
pub struct TimingGuard<F>
where
    F: FnOnce(Duration),
{
    start: Instant,
    on_drop: Option<F>,
}

impl<F> TimingGuard<F>
where
    F: FnOnce(Duration),
{
    /// Starts timing.
    pub fn new(on_drop: F) -> Self {
        Self {
            start: Instant::now(),
            on_drop: Some(on_drop),
        }
    }
}

impl<F> Drop for TimingGuard<F>
where
    F: FnOnce(Duration),
{
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop(self.start.elapsed());
        }
    }
}
