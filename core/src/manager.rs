//! The scheduling loop: decides which monitors are due for a new probe and
//! enqueues tasks for them.

use crate::error::Result;
use crate::monitor::Monitor;
use crate::storage::{MonitorSortingOrder, Storage};
use crate::task::current_timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Seconds to wait between scheduling passes.
pub const MIN_WAIT_SECONDS: u64 = 5;

/// Scheduling loop: selects due monitors and enqueues tasks for them.
///
/// The manager never talks to a worker directly; the database is the only
/// rendezvous between the two roles.
pub struct Manager {
    storage: Arc<dyn Storage>,
}

impl Manager {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Manager { storage }
    }

    async fn issue_task(&self, monitor: &Monitor) -> Result<()> {
        let monitor_id = monitor
            .id
            .as_deref()
            .expect("a monitor read back from storage always has an id");
        debug!("issuing task for monitor {monitor_id}");
        self.storage.create_task(monitor.create_task()).await?;
        Ok(())
    }

    /// Loops over all monitors and schedules a task if necessary.
    pub async fn schedule(&self) -> Result<()> {
        let now = current_timestamp();
        let monitors = self
            .storage
            .list_monitors(MonitorSortingOrder::LastTaskAtDesc)
            .await?;
        debug!("scheduling: found {} monitors", monitors.len());

        for monitor in &monitors {
            let monitor_id = monitor.id.as_deref().unwrap_or("<unknown>");
            match monitor.last_task_at {
                None => {
                    debug!("monitor {monitor_id} has never run: scheduling");
                    self.issue_task(monitor).await?;
                }
                Some(last_task_at) => {
                    let seconds_since_last_task = now - last_task_at;
                    if seconds_since_last_task >= monitor.interval {
                        debug!(
                            "monitor {monitor_id} has not been issuing a task for {seconds_since_last_task} seconds, which is longer or equal to the interval of {} seconds: scheduling",
                            monitor.interval
                        );
                        self.issue_task(monitor).await?;
                    } else {
                        debug!(
                            "monitor {monitor_id} has not been issuing a task for {seconds_since_last_task} seconds, which is less than the interval of {} seconds: skipping",
                            monitor.interval
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Runs the scheduling loop until a shutdown signal is received.
    ///
    /// Each tick runs the scheduling pass, then waits out whatever is left
    /// of `MIN_WAIT_SECONDS`, so a slow pass never shortens the throttle,
    /// and a fast pass never lets the loop spin hot.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("manager has started");

        loop {
            let tick_start = tokio::time::Instant::now();

            tokio::select! {
                result = self.schedule() => {
                    if let Err(e) = result {
                        error!("manager encountered an unexpected exception: {e}");
                    }
                }
                _ = shutdown.recv() => {
                    info!("manager process has been cancelled");
                    return;
                }
            }

            let min_wait = Duration::from_secs(MIN_WAIT_SECONDS);
            let elapsed = tick_start.elapsed();
            if elapsed < min_wait {
                tokio::select! {
                    _ = tokio::time::sleep(min_wait - elapsed) => {}
                    _ = shutdown.recv() => {
                        info!("manager process has been cancelled");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonicoError;
    use crate::probe::Probe;
    use crate::task::Task;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStorage {
        monitors: Mutex<Vec<Monitor>>,
        created_tasks: Mutex<Vec<Task>>,
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
            let mut monitors = self.monitors.lock().unwrap();
            if let Some(m) = monitors
                .iter_mut()
                .find(|m| m.id.as_deref() == Some(task.monitor_id.as_str()))
            {
                m.last_task_at = Some(task.timestamp);
            }
            self.created_tasks.lock().unwrap().push(task.clone());
            Ok(task)
        }
        async fn lock_tasks(&self, _worker_id: &str, _batch_size: i64) -> Result<Vec<Task>> {
            Ok(vec![])
        }
        async fn update_task(&self, _task: &Task) -> Result<()> {
            Ok(())
        }
        async fn record_probe(&self, _probe: Probe) -> Result<()> {
            Ok(())
        }
        async fn list_probes(&self, _monitor_id: &str, _limit: i64) -> Result<Vec<Probe>> {
            Ok(vec![])
        }
    }

    fn monitor_with(id: &str, last_task_at: Option<i64>, interval: i64) -> Monitor {
        let mut m = Monitor::new(Some(id.to_string()), "n", "example.com", interval, None).unwrap();
        m.last_task_at = last_task_at;
        m
    }

    #[tokio::test]
    async fn s1_schedules_a_never_run_monitor() {
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![monitor_with("m1", None, 5)]),
            created_tasks: Mutex::new(vec![]),
        });
        let manager = Manager::new(storage.clone());
        manager.schedule().await.unwrap();

        let tasks = storage.created_tasks.lock().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].monitor_id, "m1");
        assert_eq!(tasks[0].status, crate::task::TaskStatus::Pending);
        let monitors = storage.monitors.lock().unwrap();
        assert_eq!(monitors[0].last_task_at, Some(tasks[0].timestamp));
    }

    #[tokio::test]
    async fn s2_does_not_reschedule_before_interval_elapses() {
        let now = current_timestamp();
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![monitor_with("m1", Some(now - 3), 5)]),
            created_tasks: Mutex::new(vec![]),
        });
        let manager = Manager::new(storage.clone());
        manager.schedule().await.unwrap();

        assert!(storage.created_tasks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reschedules_once_interval_elapses() {
        let now = current_timestamp();
        let storage = Arc::new(FakeStorage {
            monitors: Mutex::new(vec![monitor_with("m1", Some(now - 10), 5)]),
            created_tasks: Mutex::new(vec![]),
        });
        let manager = Manager::new(storage.clone());
        manager.schedule().await.unwrap();

        assert_eq!(storage.created_tasks.lock().unwrap().len(), 1);
    }
}
