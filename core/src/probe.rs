//! The `Probe` value type: the recorded outcome of executing one task.

use crate::task::current_timestamp;
use uuid::Uuid;

/// The reason an HTTP probe failed to produce a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeResponseError {
    Timeout,
    ConnectionError,
}

impl ProbeResponseError {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeResponseError::Timeout => "timeout",
            ProbeResponseError::ConnectionError => "connection_error",
        }
    }

    pub fn from_str_value(value: &str) -> Option<Self> {
        match value {
            "timeout" => Some(ProbeResponseError::Timeout),
            "connection_error" => Some(ProbeResponseError::ConnectionError),
            _ => None,
        }
    }
}

/// The recorded outcome of executing one [`crate::task::Task`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Probe {
    pub id: String,
    pub timestamp: i64,
    pub monitor_id: String,
    pub task_id: Option<String>,
    pub response_time: f64,
    pub response_code: Option<i32>,
    pub response_error: Option<ProbeResponseError>,
    pub content_match: Option<String>,
}

impl Probe {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        monitor_id: String,
        task_id: String,
        response_time: f64,
        response_code: Option<i32>,
        response_error: Option<ProbeResponseError>,
        content_match: Option<String>,
    ) -> Self {
        Probe {
            id: Uuid::new_v4().to_string(),
            timestamp: current_timestamp(),
            monitor_id,
            task_id: Some(task_id),
            response_time,
            response_code,
            response_error,
            content_match,
        }
    }
}
