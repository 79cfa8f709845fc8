//! Pre-built test fixtures for common test scenarios.
//!
//! Provides shipyard documents and an event factory with sensible defaults.

use std::time::Duration;

use serde_json::{Map, Value, json};

use shipyard_controller::ControllerConfig;
use shipyard_controller::event::{
    EventKind, EventType, KeptnEvent, ResultType, StatusType, sequence_event_type,
    task_event_type,
};

/// Default project of the harness.
pub const TEST_PROJECT: &str = "sockshop";

/// Default service of the harness.
pub const TEST_SERVICE: &str = "carts";

/// Three-stage delivery pipeline.
///
/// - `dev.delivery`: `deployment`, `test`
/// - `dev.remediation`: `action`
/// - `dev.noop`: no tasks
/// - `hardening.delivery`: `deployment`, `release`; on `dev.delivery.finished`
///   with result `pass`
/// - `production.delivery`: `deployment`, `release`; on any
///   `hardening.delivery.finished`
/// - `production.rollback`: `rollback`; on `hardening.delivery.finished` with
///   result `fail`
pub const DELIVERY_SHIPYARD: &str = r"apiVersion: spec.keptn.sh/0.2.2
kind: Shipyard
metadata:
  name: shipyard-sockshop
spec:
  stages:
    - name: dev
      sequences:
        - name: delivery
          tasks:
            - name: deployment
              properties:
                deploymentstrategy: direct
            - name: test
              properties:
                teststrategy: functional
        - name: remediation
          tasks:
            - name: action
        - name: noop
    - name: hardening
      sequences:
        - name: delivery
          triggeredOn:
            - event: dev.delivery.finished
              selector:
                match:
                  result: pass
          tasks:
            - name: deployment
            - name: release
    - name: production
      sequences:
        - name: delivery
          triggeredOn:
            - event: hardening.delivery.finished
          tasks:
            - name: deployment
            - name: release
        - name: rollback
          triggeredOn:
            - event: hardening.delivery.finished
              selector:
                match:
                  result: fail
          tasks:
            - name: rollback
";

/// Configuration with short reconnect deadlines.
#[must_use]
pub fn test_config() -> ControllerConfig {
    ControllerConfig {
        drain_interval: Duration::from_millis(20),
        store_reconnect_timeout: Duration::from_millis(100),
        store_reconnect_backoff: Duration::from_millis(5),
        ..ControllerConfig::default()
    }
}

/// Builds incoming lifecycle events for one project and service.
#[derive(Debug, Clone)]
pub struct EventFactory {
    /// Project named in payloads.
    pub project: String,
    /// Service named in payloads.
    pub service: String,
}

impl EventFactory {
    /// Creates a factory.
    pub fn new(project: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            service: service.into(),
        }
    }

    fn unique_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn scope(&self, stage: &str) -> Map<String, Value> {
        let mut data = Map::new();
        data.insert("project".into(), json!(self.project));
        data.insert("stage".into(), json!(stage));
        data.insert("service".into(), json!(self.service));
        data
    }

    /// `sh.keptn.event.<stage>.<sequence>.triggered` for run `keptn_context`.
    pub fn sequence_triggered(&self, stage: &str, sequence: &str, keptn_context: &str) -> KeptnEvent {
        self.sequence_triggered_with(stage, sequence, keptn_context, json!({}))
    }

    /// Like [`EventFactory::sequence_triggered`], with extra payload fields.
    pub fn sequence_triggered_with(
        &self,
        stage: &str,
        sequence: &str,
        keptn_context: &str,
        extra: Value,
    ) -> KeptnEvent {
        let mut data = self.scope(stage);
        if let Value::Object(extra) = extra {
            data.extend(extra);
        }
        KeptnEvent::new(
            Self::unique_id(),
            sequence_event_type(stage, sequence, EventKind::Triggered),
            "test-client",
            Value::Object(data),
        )
        .with_context(keptn_context)
    }

    /// Delivery trigger that asks to deploy `image`.
    pub fn delivery_with_image(&self, stage: &str, keptn_context: &str, image: &str) -> KeptnEvent {
        self.sequence_triggered_with(
            stage,
            "delivery",
            keptn_context,
            json!({"configurationChange": {"values": {"image": image}}}),
        )
    }

    /// `<task>.started` answering the task `triggered` event.
    pub fn task_started(&self, triggered: &KeptnEvent, executor: &str) -> KeptnEvent {
        self.task_event(triggered, executor, EventKind::Started, Map::new())
    }

    /// `<task>.finished` answering `triggered` with `result`.
    pub fn task_finished(
        &self,
        triggered: &KeptnEvent,
        executor: &str,
        result: ResultType,
    ) -> KeptnEvent {
        self.task_finished_with(triggered, executor, result, json!({}))
    }

    /// Like [`EventFactory::task_finished`], with extra payload fields.
    pub fn task_finished_with(
        &self,
        triggered: &KeptnEvent,
        executor: &str,
        result: ResultType,
        extra: Value,
    ) -> KeptnEvent {
        let mut data = Map::new();
        data.insert("result".into(), json!(result));
        let status = if result == ResultType::Fail {
            StatusType::Errored
        } else {
            StatusType::Succeeded
        };
        data.insert("status".into(), json!(status));
        if let Value::Object(extra) = extra {
            data.extend(extra);
        }
        self.task_event(triggered, executor, EventKind::Finished, data)
    }

    fn task_event(
        &self,
        triggered: &KeptnEvent,
        executor: &str,
        kind: EventKind,
        extra: Map<String, Value>,
    ) -> KeptnEvent {
        let EventType::Task { task, .. } = triggered.parsed_type() else {
            panic!("{} is not a task event", triggered.event_type);
        };
        let stage = triggered
            .base_data()
            .expect("triggered payload decodes")
            .stage;
        let mut data = self.scope(&stage);
        data.extend(extra);
        KeptnEvent::new(
            Self::unique_id(),
            task_event_type(&task, kind),
            executor,
            Value::Object(data),
        )
        .with_context(triggered.keptn_context.as_str())
        .with_triggered_id(triggered.id.as_str())
    }
}

impl Default for EventFactory {
    fn default() -> Self {
        Self::new(TEST_PROJECT, TEST_SERVICE)
    }
}
