//! Handler outcome union and its resolution into a TaskResult

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::model::{Task, TaskResult, TaskResultStatus};

/// Error type for handler failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HandlerError {
    /// Error message, reported as the reason for incompletion
    pub message: String,

    /// Whether the failure is permanent.
    ///
    /// Terminal errors report `FAILED_WITH_TERMINAL_ERROR` and the
    /// server must not re-deliver the task; anything else reports
    /// `FAILED` and leaves retrying to the server's own policy.
    pub terminal: bool,

    /// Additional detail appended to the result logs (for debugging)
    pub details: Option<String>,
}

impl HandlerError {
    /// Create an error the server may retry
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: false,
            details: None,
        }
    }

    /// Create a permanent error
    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            terminal: true,
            details: None,
        }
    }

    /// Attach detail text (a cause chain, a backtrace)
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HandlerError {}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string()).with_details(format!("{err:?}"))
    }
}

/// What a handler may return.
///
/// Resolved into a [`TaskResult`] by the execution step. This replaces
/// inspection of arbitrary return values with an explicit union.
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    /// An already-constructed result, used verbatim
    Result(TaskResult),

    /// Still working: report `IN_PROGRESS` and ask for re-delivery
    InProgress {
        /// Seconds until the server should re-deliver the task
        callback_after_seconds: Option<u64>,
        /// Partial output carried on the in-progress result
        output: Map<String, Value>,
    },

    /// A plain value: an object becomes the output map, anything else
    /// (including null) is wrapped as `{"result": value}`
    Value(Value),
}

impl TaskOutcome {
    /// Shorthand for an in-progress outcome with a callback delay.
    pub fn in_progress(callback_after_seconds: u64) -> Self {
        Self::InProgress {
            callback_after_seconds: Some(callback_after_seconds),
            output: Map::new(),
        }
    }
}

impl From<Value> for TaskOutcome {
    fn from(value: Value) -> Self {
        Self::Value(value)
    }
}

impl From<TaskResult> for TaskOutcome {
    fn from(result: TaskResult) -> Self {
        Self::Result(result)
    }
}

/// Resolve a handler's return into the result reported to the server.
pub(crate) fn resolve_outcome(
    task: &Task,
    worker_id: &str,
    outcome: Result<TaskOutcome, HandlerError>,
) -> TaskResult {
    match outcome {
        Ok(TaskOutcome::Result(result)) => result,
        Ok(TaskOutcome::InProgress {
            callback_after_seconds,
            output,
        }) => {
            let mut result = TaskResult::new(task, worker_id, TaskResultStatus::InProgress);
            result.callback_after_seconds = callback_after_seconds;
            result.output_data = output;
            result
        }
        Ok(TaskOutcome::Value(Value::Object(map))) => {
            let mut result = TaskResult::completed(task, worker_id);
            result.output_data = map;
            result
        }
        Ok(TaskOutcome::Value(other)) => {
            let mut result = TaskResult::completed(task, worker_id);
            result.output_data.insert("result".to_string(), other);
            result
        }
        Err(err) => {
            let status = if err.terminal {
                TaskResultStatus::FailedWithTerminalError
            } else {
                TaskResultStatus::Failed
            };
            let mut result = TaskResult::new(task, worker_id, status);
            result.reason_for_incompletion = Some(err.message.clone());
            if let Some(details) = err.details {
                result.add_log(details);
            }
            result
        }
    }
}
