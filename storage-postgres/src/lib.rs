//! PostgreSQL implementation of the monico [`Storage`] contract.
//!
//! Task status and probe response-error are persisted as native Postgres
//! enumerated types, cast to `text` on the way out so the driver doesn't
//! need a registered `sqlx::Type` impl per prefix. The task lease uses
//! `FOR UPDATE SKIP LOCKED` for throughput under contention, per the
//! relational-backend guidance for the lease protocol.

use async_trait::async_trait;
use monico_core::{
    MonicoError, Monitor, MonitorSortingOrder, Probe, ProbeResponseError, Result, Storage,
    TableConfig, Task, TaskStatus,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};
use uuid::Uuid;

pub struct PgStorage {
    pool: PgPool,
    tables: TableConfig,
}

impl PgStorage {
    /// Builds a storage handle against the default `monico` table prefix.
    /// The connection pool is lazy: no network I/O happens until the first
    /// query, including the one issued by [`Storage::connect`].
    pub fn new(service_uri: &str) -> Result<Self> {
        Self::with_prefix(service_uri, "monico")
    }

    pub fn with_prefix(service_uri: &str, prefix: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .connect_lazy(service_uri)
            .map_err(|e| MonicoError::StorageConnectionError(e.to_string()))?;
        Ok(PgStorage {
            pool,
            tables: TableConfig::with_prefix(prefix),
        })
    }
}

#[async_trait]
impl Storage for PgStorage {
    async fn connect(&self) -> Result<()> {
        sqlx::query("SELECT version()")
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
        info!("setting up postgres storage; prefix={} force={force}", self.tables.monitors);
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
                interval BIGINT NOT NULL,
                body_regexp TEXT NULL,
                last_task_at BIGINT NULL,
                last_probe_at BIGINT NULL,
                created_at BIGINT NOT NULL DEFAULT EXTRACT(EPOCH FROM NOW())::BIGINT
            );
            CREATE INDEX {monitors}_last_probe_at_idx ON {monitors} (last_probe_at);
            CREATE INDEX {monitors}_created_at_idx ON {monitors} (created_at);
            "#,
            monitors = t.monitors,
        );

        let tasks_sql = format!(
            r#"
            CREATE TYPE {tasks}_status AS ENUM ('pending', 'running', 'completed', 'abandoned', 'failed');
            CREATE TABLE {tasks} (
                id TEXT PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                fk_monitor TEXT NOT NULL REFERENCES {monitors}(id) ON DELETE CASCADE,
                status {tasks}_status NOT NULL,
                locked_at BIGINT NULL,
                locked_by TEXT NULL,
                completed_at BIGINT NULL
            );
            CREATE INDEX {tasks}_fk_monitor_idx ON {tasks} (fk_monitor);
            "#,
            tasks = t.tasks,
            monitors = t.monitors,
        );

        let probes_sql = format!(
            r#"
            CREATE TYPE {probes}_response_error AS ENUM ('timeout', 'connection_error');
            CREATE TABLE {probes} (
                id TEXT PRIMARY KEY,
                timestamp BIGINT NOT NULL,
                fk_monitor TEXT NOT NULL REFERENCES {monitors}(id) ON DELETE CASCADE,
                fk_task TEXT NULL REFERENCES {tasks}(id) ON DELETE SET NULL,
                response_time DOUBLE PRECISION NULL,
                response_code INT NULL,
                response_error {probes}_response_error NULL,
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
                if is_duplicate_object(&e) {
                    MonicoError::StorageSetupError("storage already initialized".into())
                } else {
                    MonicoError::StorageSetupError(e.to_string())
                }
            })?;
        }
        Ok(())
    }

    async fn teardown(&self) -> Result<()> {
        debug!("tearing down postgres storage; prefix={}", self.tables.monitors);
        let t = &self.tables;
        let sql = format!(
            r#"
            DROP TABLE IF EXISTS {probes};
            DROP TYPE IF EXISTS {probes}_response_error;
            DROP TABLE IF EXISTS {tasks};
            DROP TYPE IF EXISTS {tasks}_status;
            DROP TABLE IF EXISTS {monitors};
            "#,
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
            "INSERT INTO {} (id, name, endpoint, interval, body_regexp) VALUES ($1, $2, $3, $4, $5)",
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
            "SELECT id, name, endpoint, interval, body_regexp, last_task_at, last_probe_at, created_at FROM {} WHERE id = $1",
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
        let sql = format!("DELETE FROM {} WHERE id = $1", self.tables.monitors);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(monitor)
    }

    async fn create_task(&self, task: Task) -> Result<Task> {
        let mut tx = self.pool.begin().await?;

        let insert_sql = format!(
            "INSERT INTO {tasks} (id, timestamp, fk_monitor, status) VALUES ($1, $2, $3, $4::{tasks}_status)",
            tasks = self.tables.tasks
        );
        sqlx::query(&insert_sql)
            .bind(&task.id)
            .bind(task.timestamp)
            .bind(&task.monitor_id)
            .bind(task.status.as_str())
            .execute(&mut *tx)
            .await?;

        let update_sql = format!(
            "UPDATE {} SET last_task_at = $1 WHERE id = $2",
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
        let sql = format!(
            r#"
            UPDATE {tasks} SET
                status = 'running'::{tasks}_status,
                locked_at = EXTRACT(EPOCH FROM NOW())::BIGINT,
                locked_by = $1
            WHERE id IN (
                SELECT id FROM {tasks}
                WHERE status = 'pending'::{tasks}_status
                ORDER BY timestamp ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, timestamp, fk_monitor, status::text, locked_at, locked_by, completed_at
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
            "UPDATE {tasks} SET status = $1::{tasks}_status, completed_at = $2 WHERE id = $3",
            tasks = self.tables.tasks
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
            INSERT INTO {probes} (id, timestamp, fk_monitor, fk_task, response_time, response_code, response_error, content_match)
            VALUES ($1, $2, $3, $4, $5, $6, $7::{probes}_response_error, $8)
            "#,
            probes = self.tables.probes
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
            "UPDATE {} SET last_probe_at = $1 WHERE id = $2",
            self.tables.monitors
        );
        sqlx::query(&update_monitor_sql)
            .bind(probe.timestamp)
            .bind(&probe.monitor_id)
            .execute(&mut *tx)
            .await?;

        if let Some(task_id) = &probe.task_id {
            let update_task_sql = format!(
                "UPDATE {tasks} SET status = 'completed'::{tasks}_status WHERE id = $1",
                tasks = self.tables.tasks
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
            SELECT id, timestamp, fk_monitor, fk_task, response_time, response_code, response_error::text, content_match
            FROM {probes}
            WHERE fk_monitor = $1
            ORDER BY timestamp DESC
            LIMIT $2
            "#,
            probes = self.tables.probes
        );
        let rows = sqlx::query(&sql)
            .bind(monitor_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_probe).collect()
    }
}

fn row_to_monitor(row: PgRow) -> Result<Monitor> {
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

fn row_to_task(row: PgRow) -> Result<Task> {
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

fn row_to_probe(row: PgRow) -> Result<Probe> {
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
        .and_then(|d| d.code())
        .map(|c| c == "23505")
        .unwrap_or(false)
}

fn is_duplicate_object(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|d| d.code())
        .map(|c| matches!(c.as_ref(), "42P07" | "42710"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn test_database_url() -> Option<String> {
        std::env::var("MONICO_TEST_POSTGRES_URI").ok()
    }

    // These exercise the real protocol against a live Postgres instance and
    // are skipped when no test database is configured, since unlike the
    // embedded backend this one can't be spun up in-process.
    #[tokio::test]
    async fn setup_create_lock_and_record_round_trip() {
        let Some(uri) = test_database_url() else {
            eprintln!("skipping: MONICO_TEST_POSTGRES_URI not set");
            return;
        };
        let prefix = format!("monico_test_{}", Uuid::new_v4().simple());
        let storage = PgStorage::with_prefix(&uri, &prefix).unwrap();
        storage.connect().await.unwrap();
        storage.setup(true).await.unwrap();

        let monitor = Monitor::new(Some("m1".into()), "n", "example.com", 5, Some("hello".into()))
            .unwrap();
        let monitor = storage.create_monitor(monitor).await.unwrap();

        let task = storage
            .create_task(monitor.create_task())
            .await
            .unwrap();
        assert_eq!(
            storage.read_monitor("m1").await.unwrap().last_task_at,
            Some(task.timestamp)
        );

        let leased = storage.lock_tasks("w1", 10).await.unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].status, TaskStatus::Running);

        let probe = Probe::create(
            "m1".into(),
            task.id.clone(),
            0.42,
            Some(200),
            None,
            Some("hello".into()),
        );
        storage.record_probe(probe.clone()).await.unwrap();

        let probes = storage.list_probes("m1", 1).await.unwrap();
        assert_eq!(probes[0].id, probe.id);
        assert_eq!(
            storage.read_monitor("m1").await.unwrap().last_probe_at,
            Some(probe.timestamp)
        );

        let task_status: String = sqlx::query_scalar(&format!(
            "SELECT status::text FROM {} WHERE id = $1",
            storage.tables.tasks
        ))
        .bind(&task.id)
        .fetch_one(&storage.pool)
        .await
        .unwrap();
        assert_eq!(task_status, TaskStatus::Completed.as_str());

        storage.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn setup_without_force_fails_on_initialized_store() {
        let Some(uri) = test_database_url() else {
            eprintln!("skipping: MONICO_TEST_POSTGRES_URI not set");
            return;
        };
        let prefix = format!("monico_test_{}", Uuid::new_v4().simple());
        let storage = PgStorage::with_prefix(&uri, &prefix).unwrap();
        storage.connect().await.unwrap();
        storage.setup(true).await.unwrap();

        let err = storage.setup(false).await.unwrap_err();
        assert!(err.downcast_ref::<MonicoError>().is_some());

        storage.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn s6_concurrent_leases_are_disjoint_and_fifo() {
        let Some(uri) = test_database_url() else {
            eprintln!("skipping: MONICO_TEST_POSTGRES_URI not set");
            return;
        };
        let prefix = format!("monico_test_{}", Uuid::new_v4().simple());
        let storage = Arc::new(PgStorage::with_prefix(&uri, &prefix).unwrap());
        storage.connect().await.unwrap();
        storage.setup(true).await.unwrap();

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

        storage.teardown().await.unwrap();
    }
}
