//! Embedded SQLite implementation of the monico [`Storage`] contract.
//!
//! SQLite has no enumerated column type, so task status and probe
//! response-error are stored as `TEXT` columns constrained with `CHECK`.
//! The lease query relies on SQLite's single-writer model rather than
//! `FOR UPDATE SKIP LOCKED`: a single `UPDATE ... RETURNING` is already
//! serialized against concurrent writers by the database itself.

use async_trait::async_trait;
use monico_core::{
    MonicoError, Monitor, MonitorSortingOrder, Probe, ProbeResponseError, Result, Storage,
    TableConfig, Task, TaskStatus,
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};
use uuid::Uuid;

pub struct SqliteStorage {
    pool: SqlitePool,
    tables: TableConfig,
}

impl SqliteStorage {
    pub fn new(service_uri: &str) -> Result<Self> {
        Self::with_prefix(service_uri, "monico")
    }

    pub fn with_prefix(service_uri: &str, prefix: &str) -> Result<Self> {
        create_parent_dir(service_uri)?;
        let options = SqliteConnectOptions::from_str(service_uri)
            .map_err(|e| MonicoError::StorageConnectionError(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .connect_lazy_with(options);
        Ok(SqliteStorage {
            pool,
            tables: TableConfig::with_prefix(prefix),
        })
    }
}

/// SQLite stores its database as a single file; unlike a server backend, the
/// containing directory must exist before the driver will create it.
fn create_parent_dir(service_uri: &str) -> Result<()> {
    let path = service_uri
        .strip_prefix("sqlite://")
        .or_else(|| service_uri.strip_prefix("sqlite:"))
        .unwrap_or(service_uri);
    if path == ":memory:" || path.is_empty() {
        return Ok(());
    }
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MonicoError::StorageConnectionError(e.to_string()))?;
        }
    }
    Ok(())
}

#[async_trait]
impl Storage for SqliteStorage {
    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT sqlite_version()")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MonicoError::StorageConnectionError(e.to_string()))?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    async fn setup(&self, force: bool) -> Result<()> {
        info!("setting up sqlite storage; prefix={} force={force}", self.tables.monitors);
        if force {
            self.teardown().await?;
        }

        let t = &self.tables;

        let monitors_sql = format!(
            r#"
            CREATE TABLE {monitors} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                endpoint TEXT NOT NULL,
                interval INTEGER NOT NULL,
                body_regexp TEXT NULL,
                last_task_at INTEGER NULL,
                last_probe_at INTEGER NULL,
                created_at INTEGER NOT NULL DEFAULT (unixepoch())
            );
            CREATE INDEX {monitors}_last_probe_at_idx ON {monitors} (last_probe_at);
            CREATE INDEX {monitors}_created_at_idx ON {monitors} (created_at);
            "#,
            monitors = t.monitors,
        );

        let tasks_sql = format!(
            r#"
            CREATE TABLE {tasks} (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                fk_monitor TEXT NOT NULL REFERENCES {monitors}(id) ON DELETE CASCADE,
                status TEXT NOT NULL CHECK (status IN ('pending', 'running', 'completed', 'abandoned', 'failed')),
                locked_at INTEGER NULL,
                locked_by TEXT NULL,
                completed_at INTEGER NULL
            );
            CREATE INDEX {tasks}_fk_monitor_idx ON {tasks} (fk_monitor);
            "#,
            tasks = t.tasks,
            monitors = t.monitors,
        );

        let probes_sql = format!(
            r#"
            CREATE TABLE {probes} (
                id TEXT PRIMARY KEY,
                timestamp INTEGER NOT NULL,
                fk_monitor TEXT NOT NULL REFERENCES {monitors}(id) ON DELETE CASCADE,
                fk_task TEXT NULL REFERENCES {tasks}(id) ON DELETE SET NULL,
                response_time REAL NULL,
                response_code INTEGER NULL,
                response_error TEXT NULL CHECK (response_error IN ('timeout', 'connection_error')),
                content_match TEXT NULL
            );
            CREATE INDEX {probes}_timestamp_idx ON {probes} (timestamp);
            CREATE INDEX {probes}_fk_monitor_idx ON {probes} (fk_monitor);
            "#,
            probes = t.probes,
            monitors = t.monitors,
            tasks = t.tasks,
        );

        for sql in [monitors_sql, tasks_sql, probes_sql] {
            sqlx::raw_sql(&sql).execute(&self.pool).await.map_err(|e| {
                if is_duplicate_table(&e) {
                    MonicoError::StorageSetupError("storage already initialized".into())
                } else {
                    MonicoError::StorageSetupError(e.to_string())
                }
            })?;
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        debug!("tearing down sqlite storage; prefix={}", self.tables.monitors);
        let t = &self.tables;
        let sql = format!(
            "DROP TABLE IF EXISTS {probes}; DROP TABLE IF EXISTS {tasks}; DROP TABLE IF EXISTS {monitors};",
            probes = t.probes,
            tasks = t.tasks,
            monitors = t.monitors,
        );
        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| MonicoError::StorageSetupError(e.to_string()))?;
        Ok(())
    }

    async fn create_monitor(&self, mut monitor: Monitor) -> Result<Monitor> {
        let id = monitor
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let sql = format!(
            "INSERT INTO {} (id, name, endpoint, interval, body_regexp) VALUES (?, ?, ?, ?, ?)",
            self.tables.monitors
        );
        let result = sqlx::query(&sql)
            .bind(&id)
            .bind(&monitor.name)
            .bind(&monitor.endpoint)
            .bind(monitor.interval)
            .bind(&monitor.body_regexp)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => {
                monitor.id = Some(id);
                Ok(monitor)
            }
            Err(e) if is_unique_violation(&e) => Err(MonicoError::MonitorAlreadyExists(id).into()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_monitors(&self, sort: MonitorSortingOrder) -> Result<Vec<Monitor>> {
        let order = match sort {
            MonitorSortingOrder::CreatedAtAsc => "created_at ASC",
            MonitorSortingOrder::LastTaskAtDesc => "last_task_at DESC",
        };
        let sql = format!(
            "SELECT id, name, endpoint, interval, body_regexp, last_task_at, last_probe_at, created_at FROM {} ORDER BY {order}",
            self.tables.monitors
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_monitor).collect()
    }

    async fn read_monitor(&self, id: &str) -> Result<Monitor> {
        let sql = format!(
            "SELECT id, name, endpoint, interval, body_regexp, last_task_at, last_probe_at, created_at FROM {} WHERE id = ?",
            self.tables.monitors
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => row_to_monitor(row),
            None => Err(MonicoError::MonitorNotFound(id.to_string()).into()),
        }
    }

    async fn delete_monitor(&self, id: &str) -> Result<Monitor> {
        let monitor = self.read_monitor(id).await?;
        let sql = format!("DELETE FROM {} WHERE id = ?", self.tables.monitors);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(monitor)
    }

    async fn create_task(&self, task: Task) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let insert_sql = format!(
            "INSERT INTO {} (id, timestamp, fk_monitor, status) VALUES (?, ?, ?, ?)",
            self.tables.tasks
        );
        sqlx::query(&insert_sql)
            .bind(&task.id)
            .bind(task.timestamp)
            .bind(&task.monitor_id)
            .bind(task.status.as_str())
            .execute(&mut *tx)
            .await?;

        let update_sql = format!(
            "UPDATE {} SET last_task_at = ? WHERE id = ?",
            self.tables.monitors
        );
        sqlx::query(&update_sql)
            .bind(task.timestamp)
            .bind(&task.monitor_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(task)
    }

    async fn lock_tasks(&self, worker_id: &str, batch_size: i64) -> Result<Vec<Task>> {
        debug!("leasing up to {batch_size} tasks; worker_id={worker_id}");
        // SQLite lacks `FOR UPDATE SKIP LOCKED`; its single-writer model
        // already serializes this UPDATE against any concurrent worker, so
        // the plain id-subquery form is atomic without it.
        let sql = format!(
            r#"
            UPDATE {tasks} SET
                status = 'running',
                locked_at = unixepoch(),
                locked_by = ?
            WHERE id IN (
                SELECT id FROM {tasks}
                WHERE status = 'pending'
                ORDER BY timestamp ASC
                LIMIT ?
            )
            RETURNING id, timestamp, fk_monitor, status, locked_at, locked_by, completed_at
            "#,
            tasks = self.tables.tasks
        );
        let rows = sqlx::query(&sql)
            .bind(worker_id)
            .bind(batch_size)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_task).collect()
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET status = ?, completed_at = ? WHERE id = ?",
            self.tables.tasks
        );
        sqlx::query(&sql)
            .bind(task.status.as_str())
            .bind(task.completed_at)
            .bind(&task.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_probe(&self, probe: Probe) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let insert_sql = format!(
            r#"
            INSERT INTO {} (id, timestamp, fk_monitor, fk_task, response_time, response_code, response_error, content_match)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            self.tables.probes
        );
        sqlx::query(&insert_sql)
            .bind(&probe.id)
            .bind(probe.timestamp)
            .bind(&probe.monitor_id)
            .bind(&probe.task_id)
            .bind(probe.response_time)
            .bind(probe.response_code)
            .bind(probe.response_error.map(|e| e.as_str()))
            .bind(&probe.content_match)
            .execute(&mut *tx)
            .await?;

        let update_monitor_sql = format!(
            "UPDATE {} SET last_probe_at = ? WHERE id = ?",
            self.tables.monitors
        );
        sqlx::query(&update_monitor_sql)
            .bind(probe.timestamp)
            .bind(&probe.monitor_id)
            .execute(&mut *tx)
            .await?;

        if let Some(task_id) = &probe.task_id {
            let update_task_sql = format!(
                "UPDATE {} SET status = 'completed' WHERE id = ?",
                self.tables.tasks
            );
            sqlx::query(&update_task_sql)
                .bind(task_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn list_probes(&self, monitor_id: &str, limit: i64) -> Result<Vec<Probe>> {
        let sql = format!(
            r#"
            SELECT id, timestamp, fk_monitor, fk_task, response_time, response_code, response_error, content_match
            FROM {}
            WHERE fk_monitor = ?
            ORDER BY timestamp DESC
            LIMIT ?
            "#,
            self.tables.probes
        );
        let rows = sqlx::query(&sql)
            .bind(monitor_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_probe).collect()
    }
}

fn row_to_monitor(row: SqliteRow) -> Result<Monitor> {
    Ok(Monitor::from_row(
        row.try_get("id")?,
        row.try_get("name")?,
        row.try_get("endpoint")?,
        row.try_get("interval")?,
        row.try_get("body_regexp")?,
        row.try_get("last_task_at")?,
        row.try_get("last_probe_at")?,
        row.try_get("created_at")?,
    ))
}

fn row_to_task(row: SqliteRow) -> Result<Task> {
    let status_str: String = row.try_get("status")?;
    let status = TaskStatus::from_str_value(&status_str)
        .ok_or_else(|| anyhow::anyhow!("unknown task status \"{status_str}\""))?;
    Ok(Task {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        monitor_id: row.try_get("fk_monitor")?,
        status,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_probe(row: SqliteRow) -> Result<Probe> {
    let response_error: Option<String> = row.try_get("response_error")?;
    let response_error = response_error
        .map(|v| {
            ProbeResponseError::from_str_value(&v)
                .ok_or_else(|| anyhow::anyhow!("unknown response error \"{v}\""))
        })
        .transpose()?;
    Ok(Probe {
        id: row.try_get("id")?,
        timestamp: row.try_get("timestamp")?,
        monitor_id: row.try_get("fk_monitor")?,
        task_id: row.try_get("fk_task")?,
        response_time: row.try_get("response_time")?,
        response_code: row.try_get("response_code")?,
        response_error,
        content_match: row.try_get("content_match")?,
    })
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.code().as_deref() == Some("2067") || d.message().contains("UNIQUE constraint"))
        .unwrap_or(false)
}

fn is_duplicate_table(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .map(|d| d.message().contains("already exists"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    async fn open(dir: &TempDir) -> SqliteStorage {
        let path = dir.path().join("monico.db");
        let storage = SqliteStorage::new(&format!("sqlite://{}", path.display())).unwrap();
        storage.connect().await.unwrap();
        storage.setup(false).await.unwrap();
        storage
    }

    #[tokio::test]
    async fn setup_create_lock_and_record_round_trip() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;

        let monitor = Monitor::new(Some("m1".into()), "n", "example.com", 5, Some("hello".into()))
            .unwrap();
        let monitor = storage.create_monitor(monitor).await.unwrap();
        assert_eq!(monitor.id.as_deref(), Some("m1"));

        let task = storage.create_task(monitor.create_task()).await.unwrap();
        assert_eq!(
            storage.read_monitor("m1").await.unwrap().last_task_at,
            Some(task.timestamp)
        );

        let leased = storage.lock_tasks("w1", 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].status, TaskStatus::Running);
        assert_eq!(leased[0].locked_by.as_deref(), Some("w1"));

        // a second lease attempt finds nothing left to lease
        assert!(storage.lock_tasks("w2", 10).await.unwrap().is_empty());

        let probe = Probe::create(
            "m1".into(),
            task.id.clone(),
            0.1,
            Some(200),
            None,
            Some("hello".into()),
        );
        storage.record_probe(probe.clone()).await.unwrap();

        let probes = storage.list_probes("m1", 10).await.unwrap();
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].id, probe.id);

        let monitor = storage.read_monitor("m1").await.unwrap();
        assert_eq!(monitor.last_probe_at, Some(probe.timestamp));

        let task_status: String = sqlx::query_scalar(&format!(
            "SELECT status FROM {} WHERE id = ?",
            storage.tables.tasks
        ))
        .bind(&task.id)
        .fetch_one(&storage.pool)
        .await
        .unwrap();
        assert_eq!(task_status, TaskStatus::Completed.as_str());
    }

    #[tokio::test]
    async fn create_monitor_rejects_duplicate_id() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;

        let monitor = Monitor::new(Some("m1".into()), "n", "example.com", 5, None).unwrap();
        storage.create_monitor(monitor.clone()).await.unwrap();

        let err = storage.create_monitor(monitor).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<MonicoError>(),
            Some(MonicoError::MonitorAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn delete_monitor_cascades_to_tasks_and_probes() {
        let dir = TempDir::new().unwrap();
        let storage = open(&dir).await;

        let monitor = Monitor::new(Some("m1".into()), "n", "example.com", 5, None).unwrap();
        let monitor = storage.create_monitor(monitor).await.unwrap();
        storage.create_task(monitor.create_task()).await.unwrap();

        storage.delete_monitor("m1").await.unwrap();
        assert!(storage.read_monitor("m1").await.is_err());
        assert!(storage.list_probes("m1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn s6_concurrent_leases_are_disjoint_and_fifo() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(open(&dir).await);

        let monitor = Monitor::new(Some("m1".into()), "n", "example.com", 5, None).unwrap();
        let monitor = storage.create_monitor(monitor).await.unwrap();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let task = storage.create_task(monitor.create_task()).await.unwrap();
            ids.push(task.id);
        }

        let (a, b) = tokio::join!(storage.lock_tasks("w1", 2), storage.lock_tasks("w2", 2));
        let a = a.unwrap();
        let b = b.unwrap();

        let a_ids: std::collections::HashSet<_> = a.iter().map(|t| t.id.clone()).collect();
        let b_ids: std::collections::HashSet<_> = b.iter().map(|t| t.id.clone()).collect();
        assert!(a_ids.is_disjoint(&b_ids));

        let mut union: Vec<_> = a_ids.union(&b_ids).cloned().collect();
        union.sort();
        let mut expected = ids.clone();
        expected.sort();
        assert_eq!(union, expected);

        assert!(a_ids.contains(&ids[0]) || b_ids.contains(&ids[0]));
    }

    #[tokio::test]
    async fn setup_without_force_fails_on_initialized_store() {
        let dir = TempDir::new().unwrap();
        let _storage = open(&dir).await;
        let again = SqliteStorage::new(&format!(
            "sqlite://{}",
            dir.path().join("monico.db").display()
        ))
        .unwrap();
        let err = again.setup(false).await.unwrap_err();
        assert!(err.downcast_ref::<MonicoError>().is_some());
    }
}
