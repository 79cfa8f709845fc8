//! A controller wired to in-memory collaborators.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use shipyard_controller::dispatcher::DispatchOutcome;
use shipyard_controller::event::KeptnEvent;
use shipyard_controller::secrets::InMemorySecretStore;
use shipyard_controller::sequence::SequenceExecution;
use shipyard_controller::shipyard::InMemoryShipyardSource;
use shipyard_controller::sink::InMemoryOutbox;
use shipyard_controller::store::MemoryDocumentStore;
use shipyard_controller::{Controller, ControllerConfig, ControllerDeps, CreateProject};
use shipyard_core::{KeyedLockTable, ManualClock, SequentialIdSource};

use crate::fixtures::{DELIVERY_SHIPYARD, EventFactory, TEST_PROJECT, TEST_SERVICE, test_config};

/// Controller plus handles on every in-memory collaborator.
#[derive(Debug)]
pub struct TestHarness {
    /// The controller under test.
    pub controller: Controller,
    /// Backing document store.
    pub store: Arc<MemoryDocumentStore>,
    /// Shipyard documents by project.
    pub shipyards: Arc<InMemoryShipyardSource>,
    /// Secret store.
    pub secrets: Arc<InMemorySecretStore>,
    /// Everything the controller published.
    pub outbox: InMemoryOutbox,
    /// Clock driving event times and queue timestamps.
    pub clock: Arc<ManualClock>,
    /// Builds incoming events for [`TEST_PROJECT`] / [`TEST_SERVICE`].
    pub events: EventFactory,
}

impl TestHarness {
    /// Harness with [`DELIVERY_SHIPYARD`] and [`test_config`].
    pub async fn new() -> Self {
        Self::with_config(DELIVERY_SHIPYARD, test_config()).await
    }

    /// Harness with a custom shipyard.
    pub async fn with_shipyard(shipyard: &str) -> Self {
        Self::with_config(shipyard, test_config()).await
    }

    /// Harness with a custom shipyard and configuration.
    ///
    /// Creates [`TEST_PROJECT`] and adds [`TEST_SERVICE`] to every stage.
    pub async fn with_config(shipyard: &str, config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryDocumentStore::new());
        let shipyards = Arc::new(InMemoryShipyardSource::new());
        let secrets = Arc::new(InMemorySecretStore::new());
        let outbox = InMemoryOutbox::new();
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));

        let deps = ControllerDeps {
            store: store.clone(),
            shipyards: shipyards.clone(),
            secrets: secrets.clone(),
            sink: Arc::new(outbox.clone()),
            locks: Arc::new(KeyedLockTable::new()),
            ids: Arc::new(SequentialIdSource::new("evt")),
            clock: clock.clone(),
        };
        let controller = Controller::new(&config, deps).expect("valid test config");

        shipyards.put(TEST_PROJECT, shipyard).unwrap();
        controller
            .create_project(CreateProject {
                name: TEST_PROJECT.to_string(),
                shipyard: shipyard.to_string(),
                upstream: None,
            })
            .await
            .expect("project created");
        controller
            .create_service(TEST_PROJECT, TEST_SERVICE)
            .await
            .expect("service created");

        Self {
            controller,
            store,
            shipyards,
            secrets,
            outbox,
            clock,
            events: EventFactory::default(),
        }
    }

    /// Dispatches `event`, panicking on error.
    pub async fn send(&self, event: KeptnEvent) -> DispatchOutcome {
        let id = event.id.clone();
        self.controller
            .handle_event(event)
            .await
            .unwrap_or_else(|e| panic!("event {id} failed: {e}"))
    }

    /// Published events of type `event_type`, in publish order.
    pub fn published(&self, event_type: &str) -> Vec<KeptnEvent> {
        self.outbox
            .events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    /// Published events of type `event_type` in run `keptn_context`.
    pub fn published_in(&self, event_type: &str, keptn_context: &str) -> Vec<KeptnEvent> {
        self.published(event_type)
            .into_iter()
            .filter(|e| e.keptn_context == keptn_context)
            .collect()
    }

    /// The most recent published event of `event_type` in `keptn_context`.
    pub fn last_published(&self, event_type: &str, keptn_context: &str) -> KeptnEvent {
        self.published_in(event_type, keptn_context)
            .pop()
            .unwrap_or_else(|| panic!("no {event_type} published for {keptn_context}"))
    }

    /// The single execution of `keptn_context` in `stage`.
    pub async fn execution(&self, keptn_context: &str, stage: &str) -> SequenceExecution {
        let mut found = self
            .controller
            .executions()
            .get_by_context(keptn_context, Some(stage), &[])
            .await
            .expect("executions readable");
        assert_eq!(
            found.len(),
            1,
            "expected one execution of {keptn_context} in {stage}, found {}",
            found.len()
        );
        found.remove(0)
    }

    /// Runs task `task` of `keptn_context` through one executor to `result`.
    ///
    /// Returns the task's triggered event.
    pub async fn complete_task(
        &self,
        task: &str,
        keptn_context: &str,
        result: shipyard_controller::event::ResultType,
    ) -> KeptnEvent {
        let triggered = self.last_published(&format!("sh.keptn.event.{task}.triggered"), keptn_context);
        self.send(self.events.task_started(&triggered, "executor")).await;
        self.send(self.events.task_finished(&triggered, "executor", result))
            .await;
        triggered
    }
}
