//! The lease loop: leases a batch of pending tasks, executes each as an
//! HTTP probe, and records the outcome.

use crate::error::Result;
use crate::probe::{Probe, ProbeResponseError};
use crate::storage::Storage;
use crate::task::{current_timestamp, Task};
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Seconds to wait between locking batches.
pub const MIN_WAIT_SECONDS: u64 = 5;
/// Seconds until an HTTP probe is considered timed out.
pub const REQUEST_TIMEOUT_SECONDS: u64 = 5;
/// Seconds since creation until a leased task is considered stale.
pub const STALE_THRESHOLD_SECONDS: i64 = 600;
/// Number of tasks to lease at once.
pub const BATCH_SIZE: i64 = 10;

/// Worker process responsible for executing probes.
pub struct Worker {
    worker_id: String,
    storage: Arc<dyn Storage>,
    http_client: reqwest::Client,
}

impl Worker {
    pub fn new(storage: Arc<dyn Storage>, worker_id: Option<String>) -> Self {
        let worker_id = worker_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let http_client = reqwest::Client::builder()
            .build()
            .expect("building the default HTTP client never fails");
        Worker {
            worker_id,
            storage,
            http_client,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    async fn lock_batch(&self) -> Result<Vec<Task>> {
        self.storage.lock_tasks(&self.worker_id, BATCH_SIZE).await
    }

    /// Starts the worker loop, running until a shutdown signal is received.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("worker has started; id={}", self.worker_id);

        loop {
            debug!("worker is locking a batch of tasks; batch_size={BATCH_SIZE}");
            let batch = tokio::select! {
                result = self.lock_batch() => result,
                _ = shutdown.recv() => {
                    info!("worker process has been cancelled");
                    return;
                }
            };

            let batch = match batch {
                Ok(batch) => batch,
                Err(e) => {
                    error!("worker encountered an unexpected exception while locking: {e}");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(MIN_WAIT_SECONDS)) => {}
                        _ = shutdown.recv() => {
                            info!("worker process has been cancelled");
                            return;
                        }
                    }
                    continue;
                }
            };
            debug!("worker has locked {} tasks", batch.len());

            // Run every leased task's probe concurrently with a minimum wait,
            // so lease attempts never outrun the throttle even when the
            // whole batch completes instantly.
            let probes = futures_util::future::join_all(
                batch.into_iter().map(|task| self.run_task(task)),
            );
            let throttle = tokio::time::sleep(Duration::from_secs(MIN_WAIT_SECONDS));

            tokio::select! {
                (results, _) = async { tokio::join!(probes, throttle) } => {
                    for result in results {
                        if let Err(e) = result {
                            error!("worker encountered an unexpected exception: {e}");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("worker process has been cancelled");
                    return;
                }
            }
        }
    }

    /// Runs a single instance of a task (probe) and records the result.
    async fn run_task(&self, mut task: Task) -> Result<()> {
        let now = current_timestamp();
        debug!("worker is running a task; task_id={}", task.id);

        // tasks that are too old are stale and should be abandoned
        if now - task.timestamp > STALE_THRESHOLD_SECONDS {
            warn!("abandoning a stale task; task_id={}", task.id);
            task.abandon();
            self.storage.update_task(&task).await?;
            return Ok(());
        }

        let probe = self.get_probe(&task).await?;
        let probe_id = probe.id.clone();
        self.storage.record_probe(probe).await?;
        debug!(
            "worker has recorded a probe; task_id={} probe_id={probe_id}",
            task.id
        );
        Ok(())
    }

    /// Executes an HTTP request and returns a probe based on the response.
    async fn get_probe(&self, task: &Task) -> Result<Probe> {
        debug!("worker is executing a probe; task_id={}", task.id);
        let monitor = self.storage.read_monitor(&task.monitor_id).await?;

        let start = Instant::now();
        let timeout = Duration::from_secs(REQUEST_TIMEOUT_SECONDS);

        let outcome = async {
            let response = self
                .http_client
                .get(&monitor.endpoint)
                .timeout(timeout)
                .send()
                .await?;
            let status = response.status().as_u16() as i32;
            let body = response.text().await?;
            Ok::<_, reqwest::Error>((status, body))
        }
        .await;

        let response_time = start.elapsed().as_secs_f64();

        let probe = match outcome {
            Ok((status, body)) => {
                let content_match = monitor
                    .body_regexp
                    .as_deref()
                    .and_then(|pattern| Regex::new(pattern).ok())
                    .and_then(|re| re.find(&body))
                    .map(|m| m.as_str().to_string());
                Probe::create(
                    task.monitor_id.clone(),
                    task.id.clone(),
                    response_time,
                    Some(status),
                    None,
                    content_match,
                )
            }
            Err(e) if e.is_timeout() => Probe::create(
                task.monitor_id.clone(),
                task.id.clone(),
                response_time,
                None,
                Some(ProbeResponseError::Timeout),
                None,
            ),
            Err(_) => Probe::create(
                task.monitor_id.clone(),
                task.id.clone(),
                response_time,
                None,
                Some(ProbeResponseError::ConnectionError),
                None,
            ),
        };

        Ok(probe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonicoError;
    use crate::monitor::Monitor;
    use crate::storage::MonitorSortingOrder;
    use crate::task::TaskStatus;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStorage {
        monitors: Mutex<Vec<Monitor>>,
        updated_tasks: Mutex<Vec<Task>>,
        recorded_probes: Mutex<Vec<Probe>>,
    }

    #[async_trait]
    impl Storage for FakeStorage {
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }
        async fn setup(&self, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn teardown(&self) -> Result<()> {
            Ok(())
        }
        async fn create_monitor(&self, monitor: Monitor) -> Result<Monitor> {
            Ok(monitor)
        }
        async fn list_monitors(&self, _sort: MonitorSortingOrder) -> Result<Vec<Monitor>> {
            Ok(self.monitors.lock().unwrap().clone())
        }
        async fn read_monitor(&self, id: &str) -> Result<Monitor> {
            self.monitors
                .lock()
                .unwrap()
                .iter()
                .find(|m| m.id.as_deref() == Some(id))
                .cloned()
                .ok_or_else(|| MonicoError::MonitorNotFound(id.to_string()).into())
        }
        async fn delete_monitor(&self, id: &str) -> Result<Monitor> {
            self.read_monitor(id).await
        }
        async fn create_task(&self, task: Task) -> Result<Task> {
            Ok(task)
        }
        async fn lock_tasks(&self, _worker_id: &str, _batch_size: i64) -> Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn update_task(&self, task: &Task) -> Result<()> {
            self.updated_tasks.lock().unwrap().push(task.clone());
            Ok(())
        }
        async fn record_probe(&self, probe: Probe) -> Result<()> {
            self.recorded_probes.lock().unwrap().push(probe);
            Ok(())
        }
        async fn list_probes(&self, _monitor_id: &str, _limit: i64) -> Result<Vec<Probe>> {
            Ok(vec![])
        }
    }

    #[tokio::test]
    async fn s5_abandons_a_stale_task_without_probing() {
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![Monitor::new(
                Some("m1".into()),
                "n",
                "example.com",
                60,
                None,
            )
            .unwrap()]),
            ..Default::default()
        });
        let worker = Worker::new(storage.clone(), Some("w1".into()));

        let mut task = Task::create("m1".into());
        task.timestamp = current_timestamp() - 601;

        worker.run_task(task.clone()).await.unwrap();

        assert!(storage.recorded_probes.lock().unwrap().is_empty());
        let updated = storage.updated_tasks.lock().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].status, TaskStatus::Abandoned);
    }

    #[test]
    fn worker_id_defaults_to_a_generated_uuid() {
        let storage = Arc::new(FakeStorage::default());
        let worker = Worker::new(storage, None);
        assert!(uuid::Uuid::parse_str(worker.worker_id()).is_ok());
    }

    async fn spawn_one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response).await;
                let _ = socket.shutdown().await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn s3_records_a_successful_probe_with_content_match() {
        let addr = spawn_one_shot_server(
            b"HTTP/1.1 200 OK\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello world",
        )
        .await;
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![Monitor::new(
                Some("m1".into()),
                "n",
                &format!("http://{addr}"),
                60,
                Some("hello".into()),
            )
            .unwrap()]),
            ..Default::default()
        });
        let worker = Worker::new(storage, Some("w1".into()));
        let task = Task::create("m1".into());

        let probe = worker.get_probe(&task).await.unwrap();

        assert_eq!(probe.response_code, Some(200));
        assert_eq!(probe.response_error, None);
        assert_eq!(probe.content_match.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn s4_records_a_timed_out_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept the connection but never write a response, so the client's
        // per-request timeout (not connection refusal) is what fires.
        tokio::spawn(async move {
            if let Ok((socket, _)) = listener.accept().await {
                tokio::time::sleep(Duration::from_secs(REQUEST_TIMEOUT_SECONDS + 5)).await;
                drop(socket);
            }
        });
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![Monitor::new(
                Some("m1".into()),
                "n",
                &format!("http://{addr}"),
                60,
                None,
            )
            .unwrap()]),
            ..Default::default()
        });
        let worker = Worker::new(storage, Some("w1".into()));
        let task = Task::create("m1".into());

        let probe = worker.get_probe(&task).await.unwrap();

        assert_eq!(probe.response_code, None);
        assert_eq!(probe.response_error, Some(ProbeResponseError::Timeout));
    }
}
