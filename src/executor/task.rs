//! Task/result types exchanged between the orchestrator and the executor.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unit of work submitted to the executor.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: Option<String>,
    pub kind: String,
    pub payload: Map<String, Value>,
    pub timeout: Option<Duration>,
}

impl Task {
    /// Decode a task description from an inbound `task` envelope's payload.
    /// `task_id` and `timeout` are optional, `kind` defaults to `"shell"`
    /// when absent.
    #[must_use]
    pub fn from_payload(payload: &Map<String, Value>) -> Self {
        let task_id = payload
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let kind = payload
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or("shell")
            .to_string();
        let timeout = payload
            .get("timeout")
            .and_then(Value::as_f64)
            .map(Duration::from_secs_f64);
        let task_payload = payload
            .get("payload")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        Self {
            task_id,
            kind,
            payload: task_payload,
            timeout,
        }
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
}

impl TaskStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Timeout
        )
    }
}

/// Outcome of a task, retained by the executor until eviction or exit.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub task_id: String,
    pub status: TaskStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<f64>,
    pub completed_at: Option<f64>,
    pub error: Option<String>,
}

impl TaskResult {
    #[must_use]
    pub fn pending(task_id: String) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    /// Duration in seconds, when both endpoints are known.
    #[must_use]
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| Value::Object(Map::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_payload_defaults_kind_to_shell() {
        let payload = json!({"payload": {"command": "echo hi"}}).as_object().unwrap().clone();
        let task = Task::from_payload(&payload);
        assert_eq!(task.kind, "shell");
        assert_eq!(task.payload["command"], "echo hi");
        assert!(task.task_id.is_none());
    }

    #[test]
    fn from_payload_respects_explicit_task_id_and_timeout() {
        let payload = json!({"task_id": "T1", "kind": "script", "timeout": 5.5, "payload": {}})
            .as_object()
            .unwrap()
            .clone();
        let task = Task::from_payload(&payload);
        assert_eq!(task.task_id.as_deref(), Some("T1"));
        assert_eq!(task.kind, "script");
        assert_eq!(task.timeout, Some(Duration::from_secs_f64(5.5)));
    }

    #[test]
    fn duration_is_none_without_both_timestamps() {
        let result = TaskResult::pending("t".into());
        assert!(result.duration().is_none());
    }

    #[test]
    fn duration_computes_difference() {
        let mut result = TaskResult::pending("t".into());
        result.started_at = Some(10.0);
        result.completed_at = Some(12.5);
        assert_eq!(result.duration(), Some(2.5));
    }

    #[test]
    fn status_terminal_classification() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(TaskStatus::Timeout.is_terminal());
    }

    #[test]
    fn to_payload_uses_lowercase_status() {
        let result = TaskResult::pending("t".into());
        let payload = result.to_payload();
        assert_eq!(payload["status"], "pending");
        assert_eq!(payload["task_id"], "t");
    }
}
