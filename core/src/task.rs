//! The `Task` value type: a single scheduled intent to probe a monitor.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle state of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Abandoned,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Abandoned => "abandoned",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "completed" => Some(TaskStatus::Completed),
            "abandoned" => Some(TaskStatus::Abandoned),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// A work item to probe one monitor once.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Task {
    pub id: String,
    pub timestamp: i64,
    pub monitor_id: String,
    pub status: TaskStatus,
    pub locked_at: Option<i64>,
    pub locked_by: Option<String>,
    pub completed_at: Option<i64>,
}

impl Task {
    /// Creates a new PENDING task for the given monitor, stamped with the
    /// current wall-clock second.
    pub fn create(monitor_id: String) -> Self {
        Task {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            monitor_id,
            status: TaskStatus::Pending,
            locked_at: None,
            locked_by: None,
            completed_at: None,
        }
    }

    /// Transitions the task to ABANDONED, stamping `completed_at`.
    pub fn abandon(&mut self) {
        self.status = TaskStatus::Abandoned;
        self.completed_at = Some(current_timestamp());
    }
}

pub(crate) fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_secs() as i64
}
