//! Task and TaskResult types

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A unit of work fetched from the orchestration server.
///
/// Tasks are immutable once received. The execution unit that polled a
/// task owns it exclusively until its result is reported or the permit
/// is released.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Unique task identifier assigned by the server
    pub task_id: String,

    /// Workflow instance this task belongs to
    pub workflow_instance_id: String,

    /// Task definition name (what kind of work this is)
    pub task_def_name: String,

    /// Input payload for the handler
    #[serde(default)]
    pub input_data: Map<String, Value>,

    /// Number of times the server has delivered this logical task.
    ///
    /// Strictly increases across re-deliveries of a long-running task.
    #[serde(default)]
    pub poll_count: u32,

    /// Execution ceiling in seconds, when the server set one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_timeout_seconds: Option<u64>,
}

impl Task {
    /// Create a task with the given IDs and an empty input payload.
    pub fn new(
        task_id: impl Into<String>,
        workflow_instance_id: impl Into<String>,
        task_def_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            workflow_instance_id: workflow_instance_id.into(),
            task_def_name: task_def_name.into(),
            input_data: Map::new(),
            poll_count: 1,
            response_timeout_seconds: None,
        }
    }

    /// Set an input field
    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.input_data.insert(key.into(), value);
        self
    }

    /// Set the poll count
    pub fn with_poll_count(mut self, count: u32) -> Self {
        self.poll_count = count;
        self
    }

    /// Set the response timeout
    pub fn with_response_timeout(mut self, seconds: u64) -> Self {
        self.response_timeout_seconds = Some(seconds);
        self
    }

    /// Deserialize the input payload into a typed value.
    ///
    /// Fields absent from the payload follow the target type's serde
    /// defaults.
    pub fn parse_input<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(Value::Object(self.input_data.clone()))
    }
}

/// Status reported back to the server for an executed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskResultStatus {
    /// Handler finished and produced an output
    Completed,

    /// Handler failed; the server may retry per its own policy
    Failed,

    /// Handler failed permanently; the server must not retry
    FailedWithTerminalError,

    /// Handler is still working; the server should re-deliver later
    InProgress,
}

impl std::fmt::Display for TaskResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::FailedWithTerminalError => write!(f, "FAILED_WITH_TERMINAL_ERROR"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
        }
    }
}

/// A timestamped log line attached to a task result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskLog {
    pub message: String,

    /// Epoch milliseconds at the time the line was recorded
    pub created_at: i64,
}

impl TaskLog {
    /// Create a log line stamped with the current time.
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            created_at: Utc::now().timestamp_millis(),
        }
    }
}

/// The outcome of executing a [`Task`], reported back to the server.
///
/// Constructed by the execution unit that ran the handler and never
/// shared across tasks after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: String,
    pub workflow_instance_id: String,
    pub worker_id: String,
    pub status: TaskResultStatus,

    #[serde(default)]
    pub output_data: Map<String, Value>,

    #[serde(default)]
    pub logs: Vec<TaskLog>,

    /// Only meaningful with [`TaskResultStatus::InProgress`]: asks the
    /// server to re-deliver this task after the given number of seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_after_seconds: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_for_incompletion: Option<String>,
}

impl TaskResult {
    /// Create a result for the given task with the given status.
    pub fn new(task: &Task, worker_id: impl Into<String>, status: TaskResultStatus) -> Self {
        Self {
            task_id: task.task_id.clone(),
            workflow_instance_id: task.workflow_instance_id.clone(),
            worker_id: worker_id.into(),
            status,
            output_data: Map::new(),
            logs: Vec::new(),
            callback_after_seconds: None,
            reason_for_incompletion: None,
        }
    }

    /// Shorthand for a completed result.
    pub fn completed(task: &Task, worker_id: impl Into<String>) -> Self {
        Self::new(task, worker_id, TaskResultStatus::Completed)
    }

    /// Shorthand for a failed result with a reason.
    pub fn failed(task: &Task, worker_id: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut result = Self::new(task, worker_id, TaskResultStatus::Failed);
        result.reason_for_incompletion = Some(reason.into());
        result
    }

    /// Set an output field
    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output_data.insert(key.into(), value);
        self
    }

    /// Set the callback delay
    pub fn with_callback_after(mut self, seconds: u64) -> Self {
        self.callback_after_seconds = Some(seconds);
        self
    }

    /// Append a log line stamped with the current time.
    pub fn add_log(&mut self, message: impl Into<String>) {
        self.logs.push(TaskLog::now(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_builder() {
        let task = Task::new("t1", "wf1", "greet")
            .with_input("name", json!("ada"))
            .with_poll_count(2)
            .with_response_timeout(30);

        assert_eq!(task.task_id, "t1");
        assert_eq!(task.task_def_name, "greet");
        assert_eq!(task.input_data["name"], json!("ada"));
        assert_eq!(task.poll_count, 2);
        assert_eq!(task.response_timeout_seconds, Some(30));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskResultStatus::Completed.to_string(), "COMPLETED");
        assert_eq!(
            TaskResultStatus::FailedWithTerminalError.to_string(),
            "FAILED_WITH_TERMINAL_ERROR"
        );
        assert_eq!(TaskResultStatus::InProgress.to_string(), "IN_PROGRESS");
    }

    #[test]
    fn test_result_carries_task_identity() {
        let task = Task::new("t1", "wf1", "greet");
        let result = TaskResult::completed(&task, "worker-a").with_output("out", json!(1));

        assert_eq!(result.task_id, "t1");
        assert_eq!(result.workflow_instance_id, "wf1");
        assert_eq!(result.worker_id, "worker-a");
        assert_eq!(result.output_data["out"], json!(1));
        assert!(result.callback_after_seconds.is_none());
    }

    #[test]
    fn test_parse_input_typed() {
        #[derive(Deserialize)]
        struct GreetInput {
            name: String,
            #[serde(default)]
            shout: bool,
        }

        let task = Task::new("t1", "wf1", "greet").with_input("name", json!("ada"));
        let input: GreetInput = task.parse_input().unwrap();
        assert_eq!(input.name, "ada");
        assert!(!input.shout);
    }

    #[test]
    fn test_serialization_round_trip() {
        let task = Task::new("t1", "wf1", "greet").with_input("n", json!(3));
        let json = serde_json::to_string(&task).unwrap();
        assert!(json.contains("\"taskDefName\":\"greet\""));

        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.task_id, task.task_id);
        assert_eq!(parsed.input_data, task.input_data);
    }
}
