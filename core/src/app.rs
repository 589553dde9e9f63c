//! The application facade: a thin composition root that exposes core
//! operations to external adapters (CLI, tests) and owns the storage
//! handle.

use crate::error::Result;
use crate::manager::Manager;
use crate::monitor::Monitor;
use crate::probe::Probe;
use crate::storage::{MonitorSortingOrder, Storage};
use crate::worker::Worker;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Owns the storage handle and delegates every core operation to it, or to
/// a freshly-constructed [`Manager`]/[`Worker`].
pub struct App {
    storage: Arc<dyn Storage>,
}

impl App {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        App { storage }
    }

    /// Initializes the storage backend's schema.
    pub async fn setup(&self, force: bool) -> Result<()> {
        self.storage.setup(force).await
    }

    /// Creates a new monitor from raw, unvalidated attributes.
    pub async fn create_monitor(
        &self,
        id: Option<String>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
        interval: i64,
        body_regexp: Option<String>,
    ) -> Result<Monitor> {
        let monitor = Monitor::new(id, name, endpoint, interval, body_regexp)?;
        self.storage.create_monitor(monitor).await
    }

    /// Lists all monitors, oldest-created first.
    pub async fn list_monitors(&self) -> Result<Vec<Monitor>> {
        self.storage
            .list_monitors(MonitorSortingOrder::CreatedAtAsc)
            .await
    }

    /// Removes a monitor, cascading to its tasks and probes.
    pub async fn delete_monitor(&self, id: &str) -> Result<Monitor> {
        self.storage.delete_monitor(id).await
    }

    /// Returns the monitor and its most recent probes.
    pub async fn status(&self, id: &str, limit_probes: i64) -> Result<(Monitor, Vec<Probe>)> {
        let monitor = self.storage.read_monitor(id).await?;
        let probes = self.storage.list_probes(id, limit_probes).await?;
        Ok((monitor, probes))
    }

    /// Starts the manager process responsible for scheduling probes.
    pub async fn run_manager(&self, shutdown: broadcast::Receiver<()>) {
        Manager::new(self.storage.clone()).run(shutdown).await
    }

    /// Starts the worker process responsible for executing probes.
    pub async fn run_worker(&self, worker_id: Option<String>, shutdown: broadcast::Receiver<()>) {
        Worker::new(self.storage.clone(), worker_id)
            .run(shutdown)
            .await
    }

    /// Starts both manager and worker processes concurrently, joining both.
    pub async fn run(&self, worker_id: Option<String>, shutdown: broadcast::Sender<()>) {
        let manager = Manager::new(self.storage.clone());
        let worker = Worker::new(self.storage.clone(), worker_id);

        tokio::join!(
            manager.run(shutdown.subscribe()),
            worker.run(shutdown.subscribe())
        );
    }

    /// Shuts down the application, disconnecting storage exactly once.
    pub async fn shutdown(&self) -> Result<()> {
        self.storage.disconnect().await
    }
}
