//! Per-execution task context

use parking_lot::Mutex;

use super::model::{Task, TaskLog, TaskResult, TaskResultStatus};

/// Context handed to a handler for the duration of one execution.
///
/// The context is the side channel for things a handler wants on the
/// final result without constructing a [`TaskResult`] itself: log lines
/// and the callback delay for long-running tasks. The runner merges the
/// context into the result after the handler returns; context values
/// win only where the handler's own return left the field unset, while
/// log lines are always appended.
///
/// # Example
///
/// ```ignore
/// async fn handle(ctx: Arc<TaskContext>, task: Task) -> Result<TaskOutcome, HandlerError> {
///     ctx.add_log(format!("attempt {}", ctx.poll_count()));
///     if !warmed_up(&task) {
///         ctx.set_callback_after(30);
///         return Ok(TaskOutcome::InProgress {
///             callback_after_seconds: None,
///             output: Map::new(),
///         });
///     }
///     Ok(TaskOutcome::Value(json!({"ok": true})))
/// }
/// ```
#[derive(Debug)]
pub struct TaskContext {
    task_id: String,
    workflow_instance_id: String,
    task_def_name: String,
    poll_count: u32,
    state: Mutex<ContextState>,
}

#[derive(Debug, Default)]
struct ContextState {
    logs: Vec<TaskLog>,
    callback_after_seconds: Option<u64>,
}

impl TaskContext {
    /// Create a context for one delivery of the given task.
    pub fn new(task: &Task) -> Self {
        Self {
            task_id: task.task_id.clone(),
            workflow_instance_id: task.workflow_instance_id.clone(),
            task_def_name: task.task_def_name.clone(),
            poll_count: task.poll_count,
            state: Mutex::new(ContextState::default()),
        }
    }

    /// The task being executed
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// The workflow instance the task belongs to
    pub fn workflow_instance_id(&self) -> &str {
        &self.workflow_instance_id
    }

    /// The task definition name
    pub fn task_def_name(&self) -> &str {
        &self.task_def_name
    }

    /// How many times the server has delivered this logical task
    pub fn poll_count(&self) -> u32 {
        self.poll_count
    }

    /// Append a log line to be carried on the final result.
    pub fn add_log(&self, message: impl Into<String>) {
        self.state.lock().logs.push(TaskLog::now(message));
    }

    /// Request re-delivery after the given number of seconds.
    ///
    /// Honored only when the final result reports `IN_PROGRESS` and the
    /// handler's own return did not set a callback delay.
    pub fn set_callback_after(&self, seconds: u64) {
        self.state.lock().callback_after_seconds = Some(seconds);
    }

    /// The callback delay recorded so far, if any
    pub fn callback_after(&self) -> Option<u64> {
        self.state.lock().callback_after_seconds
    }

    /// Merge the context into a result produced from the handler's
    /// return value. Logs are appended; the callback delay applies only
    /// to an in-progress result that did not already set one.
    pub(crate) fn merge_into(&self, result: &mut TaskResult) {
        let mut state = self.state.lock();
        result.logs.append(&mut state.logs);
        if result.status == TaskResultStatus::InProgress
            && result.callback_after_seconds.is_none()
        {
            result.callback_after_seconds = state.callback_after_seconds.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskResultStatus;

    fn task() -> Task {
        Task::new("t1", "wf1", "greet").with_poll_count(3)
    }

    #[test]
    fn test_context_mirrors_task_identity() {
        let ctx = TaskContext::new(&task());
        assert_eq!(ctx.task_id(), "t1");
        assert_eq!(ctx.workflow_instance_id(), "wf1");
        assert_eq!(ctx.task_def_name(), "greet");
        assert_eq!(ctx.poll_count(), 3);
    }

    #[test]
    fn test_logs_are_appended_on_merge() {
        let task = task();
        let ctx = TaskContext::new(&task);
        ctx.add_log("one");
        ctx.add_log("two");

        let mut result = TaskResult::completed(&task, "w");
        result.add_log("handler line");
        ctx.merge_into(&mut result);

        let messages: Vec<_> = result.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["handler line", "one", "two"]);
    }

    #[test]
    fn test_handler_callback_wins_over_context() {
        let task = task();
        let ctx = TaskContext::new(&task);
        ctx.set_callback_after(120);

        let mut result = TaskResult::new(&task, "w", TaskResultStatus::InProgress);
        result.callback_after_seconds = Some(15);
        ctx.merge_into(&mut result);

        assert_eq!(result.callback_after_seconds, Some(15));
    }

    #[test]
    fn test_context_callback_fills_gap() {
        let task = task();
        let ctx = TaskContext::new(&task);
        ctx.set_callback_after(120);

        let mut result = TaskResult::new(&task, "w", TaskResultStatus::InProgress);
        ctx.merge_into(&mut result);

        assert_eq!(result.callback_after_seconds, Some(120));
    }

    #[test]
    fn test_callback_ignored_for_completed_result() {
        let task = task();
        let ctx = TaskContext::new(&task);
        ctx.set_callback_after(120);

        let mut result = TaskResult::completed(&task, "w");
        ctx.merge_into(&mut result);

        assert_eq!(result.callback_after_seconds, None);
    }
}
