//! Shipyard controller process.
//!
//! Reads lifecycle events as JSON lines from stdin, writes every event the
//! controller emits as JSON lines to stdout, and drains the pause queue in
//! the background. Projects found under `SHIPYARD_SHIPYARD_DIR` are
//! registered at startup.

use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};

use shipyard_controller::error::{Error, Result};
use shipyard_controller::secrets::InMemorySecretStore;
use shipyard_controller::shipyard::{FileShipyardSource, InMemoryShipyardSource, ShipyardSource};
use shipyard_controller::sink::JsonLinesSink;
use shipyard_controller::store::MemoryDocumentStore;
use shipyard_controller::{Controller, ControllerConfig, ControllerDeps, CreateProject, KeptnEvent};
use shipyard_core::{KeyedLockTable, SystemClock, UuidIdSource, init_logging};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::from_env()?;
    init_logging(config.log_format);

    let shipyards: Arc<dyn ShipyardSource> = match &config.shipyard_dir {
        Some(dir) => Arc::new(FileShipyardSource::new(dir.clone())),
        None => Arc::new(InMemoryShipyardSource::new()),
    };
    let deps = ControllerDeps {
        store: Arc::new(MemoryDocumentStore::new()),
        shipyards,
        secrets: Arc::new(InMemorySecretStore::new()),
        sink: Arc::new(JsonLinesSink::new(tokio::io::stdout())),
        locks: Arc::new(KeyedLockTable::new()),
        ids: Arc::new(UuidIdSource),
        clock: Arc::new(SystemClock),
    };
    let controller = Controller::new(&config, deps)?;

    if let Some(dir) = &config.shipyard_dir {
        register_projects(&controller, dir).await?;
    }

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let drain = tokio::spawn(controller.dispatcher().run_drain_loop(
        config.drain_interval,
        async move {
            let _ = stop_rx.await;
        },
    ));

    tracing::info!(source = %config.event_source, "shipyard controller started");
    tokio::select! {
        result = read_events(&controller) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.map_err(|e| Error::configuration(format!("failed to listen for ctrl-c: {e}")))?;
            tracing::info!("interrupted");
        }
    }

    let _ = stop_tx.send(());
    if let Err(e) = drain.await {
        tracing::error!(error = %e, "drain loop panicked");
    }
    tracing::info!("shipyard controller stopped");
    Ok(())
}

async fn read_events(controller: &Controller) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| Error::storage_with_source("failed to read stdin", e))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let event: KeptnEvent = match serde_json::from_str(&line) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "skipping malformed event");
                continue;
            }
        };
        let id = event.id.clone();
        match controller.handle_event(event).await {
            Ok(outcome) => tracing::debug!(%id, queued = outcome.is_queued(), "event handled"),
            Err(e) => tracing::error!(%id, error = %e, "event handling failed"),
        }
    }
    tracing::info!("end of input");
    Ok(())
}

async fn register_projects(controller: &Controller, root: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(root)
        .await
        .map_err(|e| Error::storage_with_source(format!("failed to list {}", root.display()), e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::storage_with_source("failed to read project directory", e))?
    {
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let path = entry.path().join(FileShipyardSource::FILE_NAME);
        let Ok(shipyard) = tokio::fs::read_to_string(&path).await else {
            continue;
        };
        let request = CreateProject {
            name: name.clone(),
            shipyard,
            upstream: None,
        };
        match controller.create_project(request).await {
            Ok(_) => tracing::info!(project = %name, "project registered"),
            Err(e) => tracing::warn!(project = %name, error = %e, "project not registered"),
        }
    }
    Ok(())
}
