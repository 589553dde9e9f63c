//! The backend-neutral storage contract.
//!
//! A table-name record parameterizes each concrete backend so multiple
//! deployments may share a database under distinct prefixes, and the
//! contract itself is expressed as an async trait rather than a concrete
//! base class, so both backends plug in behind the same `dyn Storage`.

use crate::error::Result;
use crate::monitor::Monitor;
use crate::probe::Probe;
use crate::task::Task;
use async_trait::async_trait;

/// Table name prefixing, so multiple deployments may share one database.
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub monitors: String,
    pub tasks: String,
    pub probes: String,
}

impl TableConfig {
    pub fn with_prefix(prefix: &str) -> Self {
        TableConfig {
            monitors: format!("{prefix}_monitors"),
            tasks: format!("{prefix}_tasks"),
            probes: format!("{prefix}_probes"),
        }
    }
}

impl Default for TableConfig {
    fn default() -> Self {
        Self::with_prefix("monico")
    }
}

/// Sort order for [`Storage::list_monitors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorSortingOrder {
    CreatedAtAsc,
    LastTaskAtDesc,
}

/// The backend-neutral contract every storage implementation satisfies.
///
/// All mutation operations are transactional: on any error the underlying
/// transaction is rolled back and the error propagates unchanged.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Probes the backend with a trivial query, surfacing
    /// `StorageConnectionError` on failure. The underlying pool is
    /// constructed lazily at backend-construction time, so `connect` only
    /// needs shared access: it validates reachability, it does not build
    /// anything.
    async fn connect(&self) -> Result<()>;

    /// Releases the underlying connection/pool. Idempotent. Safe to call
    /// through a shared reference since the pool handle is itself shared
    /// internally (closing it affects every clone, but there is exactly
    /// one logical storage instance per process).
    async fn disconnect(&self) -> Result<()>;

    /// Creates all managed tables, indexes, and enumerated types. With
    /// `force`, first drops them. Without `force` on an already-initialized
    /// store, fails with `StorageSetupError`.
    async fn setup(&self, force: bool) -> Result<()>;

    /// Drops all managed tables, indexes, and enumerated types. Idempotent.
    async fn teardown(&self) -> Result<()>;

    /// Assigns an id if absent; fails with `MonitorAlreadyExists` on a
    /// unique-key violation.
    async fn create_monitor(&self, monitor: Monitor) -> Result<Monitor>;

    /// Lists every monitor in the requested order.
    async fn list_monitors(&self, sort: MonitorSortingOrder) -> Result<Vec<Monitor>>;

    /// Fails with `MonitorNotFound` if absent.
    async fn read_monitor(&self, id: &str) -> Result<Monitor>;

    /// Deletes a monitor, cascading to its tasks and probes, and returns
    /// the deleted row for echo.
    async fn delete_monitor(&self, id: &str) -> Result<Monitor>;

    /// Inserts the task and updates the parent monitor's `last_task_at` in
    /// one transaction.
    async fn create_task(&self, task: Task) -> Result<Task>;

    /// Atomically leases up to `batch_size` PENDING tasks, oldest first, to
    /// `worker_id`. See the task lease protocol for the concurrency
    /// guarantee this must uphold.
    async fn lock_tasks(&self, worker_id: &str, batch_size: i64) -> Result<Vec<Task>>;

    /// Persists `status` and `completed_at`.
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Inserts the probe, updates the parent monitor's `last_probe_at`, and
    /// sets the parent task's status to COMPLETED, in one transaction.
    async fn record_probe(&self, probe: Probe) -> Result<()>;

    /// Lists probes for a monitor, newest first by timestamp.
    async fn list_probes(&self, monitor_id: &str, limit: i64) -> Result<Vec<Probe>>;
}
