//! # shipyard-controller
//!
//! Control plane of the shipyard delivery orchestrator.
//!
//! The controller turns a project's shipyard (stages, sequences, tasks) into
//! a chain of lifecycle events. It never runs tasks itself: it emits
//! `<task>.triggered` events, collects the executors' `started` and
//! `finished` reports, and decides what comes next.
//!
//! - **Sequence Engine**: Creates executions, advances them task by task and
//!   fans finished sequences out to the sequences they trigger
//! - **Dispatcher**: Parks events of paused runs and replays them on resume
//! - **Control Surface**: Pause, resume, abort and time out runs atomically
//! - **Project View**: A materialized per-project document updated under a
//!   keyed lock
//! - **Stores**: Document-backed repositories with guarded, narrow writes
//!
//! ## Guarantees
//!
//! - **Idempotent**: a sequence trigger is accepted once per event id
//! - **Lossless**: concurrent task reports are appended, never overwritten
//! - **Single advance**: a task completes and the next one is triggered
//!   exactly once, however many handlers race
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//!
//! use shipyard_controller::{Controller, ControllerConfig, ControllerDeps, CreateProject};
//! use shipyard_controller::secrets::InMemorySecretStore;
//! use shipyard_controller::shipyard::InMemoryShipyardSource;
//! use shipyard_controller::sink::InMemoryOutbox;
//! use shipyard_controller::store::MemoryDocumentStore;
//! use shipyard_core::{KeyedLockTable, SystemClock, UuidIdSource};
//!
//! # async fn example() -> shipyard_controller::Result<()> {
//! let deps = ControllerDeps {
//!     store: Arc::new(MemoryDocumentStore::new()),
//!     shipyards: Arc::new(InMemoryShipyardSource::new()),
//!     secrets: Arc::new(InMemorySecretStore::new()),
//!     sink: Arc::new(InMemoryOutbox::new()),
//!     locks: Arc::new(KeyedLockTable::new()),
//!     ids: Arc::new(UuidIdSource),
//!     clock: Arc::new(SystemClock),
//! };
//! let controller = Controller::new(&ControllerConfig::default(), deps)?;
//! let shipyard = "apiVersion: spec.keptn.sh/0.2.2\nkind: Shipyard\nmetadata:\n  name: demo\nspec:\n  stages:\n    - name: dev\n";
//! controller
//!     .create_project(CreateProject {
//!         name: "sockshop".into(),
//!         shipyard: shipyard.into(),
//!         upstream: None,
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod event;
pub mod metrics;
pub mod project;
pub mod scope;
pub mod secrets;
pub mod sequence;
pub mod shipyard;
pub mod sink;
pub mod store;
pub mod view;

pub use config::ControllerConfig;
pub use controller::{Controller, ControllerDeps, CreateProject};
pub use dispatcher::{DispatchOutcome, Dispatcher, DrainReport};
pub use engine::{EngineOutput, SequenceEngine};
pub use error::{Error, Result};
pub use event::KeptnEvent;
pub use view::ProjectMaterializedView;
