//! Lifecycle events and the synchronous dispatcher
//!
//! Every poll round, execution, and update failure is broadcast as a
//! [`TaskRunnerEvent`] to registered [`EventListener`]s, synchronously
//! in the call stack that produced it. A panicking listener is isolated
//! and logged; it never affects the cycle or other listeners.

mod metrics;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;
use tracing::error;

use crate::task::TaskResult;

pub use metrics::{MetricsListener, MetricsSnapshot};

/// An immutable record of one runner lifecycle moment.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskRunnerEvent {
    /// A poll round began
    PollStarted { task_type: String, worker_id: String },

    /// A poll round finished
    PollCompleted {
        task_type: String,
        worker_id: String,
        duration_ms: u64,
        task_count: usize,
    },

    /// A poll against one server failed
    PollFailure {
        task_type: String,
        worker_id: String,
        error: String,
    },

    /// A handler invocation began
    ExecutionStarted {
        task_type: String,
        worker_id: String,
        task_id: String,
        workflow_instance_id: String,
    },

    /// A handler invocation produced a reportable result
    ExecutionCompleted {
        task_type: String,
        worker_id: String,
        task_id: String,
        duration_ms: u64,
    },

    /// A handler invocation failed (error, panic, or timeout)
    ExecutionFailure {
        task_type: String,
        worker_id: String,
        task_id: String,
        error: String,
    },

    /// All local update retries were exhausted; the result is lost to
    /// the server unless a listener reconciles it
    UpdateFailure {
        task_type: String,
        worker_id: String,
        task_id: String,
        lost_result: TaskResult,
    },
}

impl TaskRunnerEvent {
    /// The task type the event concerns
    pub fn task_type(&self) -> &str {
        match self {
            Self::PollStarted { task_type, .. }
            | Self::PollCompleted { task_type, .. }
            | Self::PollFailure { task_type, .. }
            | Self::ExecutionStarted { task_type, .. }
            | Self::ExecutionCompleted { task_type, .. }
            | Self::ExecutionFailure { task_type, .. }
            | Self::UpdateFailure { task_type, .. } => task_type,
        }
    }
}

/// Receiver for runner lifecycle events.
///
/// Listeners run synchronously inside the runner; keep them fast and
/// non-blocking. Panics are caught and logged.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &TaskRunnerEvent);
}

/// Synchronous fan-out of [`TaskRunnerEvent`]s to registered listeners.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Vec<Arc<dyn EventListener>>,
}

impl EventDispatcher {
    /// Create a dispatcher with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener
    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Publish an event to every listener in registration order.
    pub fn publish(&self, event: &TaskRunnerEvent) {
        for listener in &self.listeners {
            let result = catch_unwind(AssertUnwindSafe(|| listener.on_event(event)));
            if result.is_err() {
                error!(task_type = %event.task_type(), "event listener panicked");
            }
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl EventListener for Recorder {
        fn on_event(&self, event: &TaskRunnerEvent) {
            self.seen.lock().push(event.task_type().to_string());
        }
    }

    struct Panicker;

    impl EventListener for Panicker {
        fn on_event(&self, _event: &TaskRunnerEvent) {
            panic!("listener bug");
        }
    }

    fn poll_started() -> TaskRunnerEvent {
        TaskRunnerEvent::PollStarted {
            task_type: "greet".into(),
            worker_id: "w1".into(),
        }
    }

    #[test]
    fn test_publish_reaches_all_listeners() {
        let a = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let b = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let dispatcher = EventDispatcher::new()
            .with_listener(a.clone())
            .with_listener(b.clone());

        dispatcher.publish(&poll_started());

        assert_eq!(a.seen.lock().len(), 1);
        assert_eq!(b.seen.lock().len(), 1);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(vec![]),
        });
        let dispatcher = EventDispatcher::new()
            .with_listener(Arc::new(Panicker))
            .with_listener(recorder.clone());

        dispatcher.publish(&poll_started());

        // The listener after the panicking one still ran.
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let json = serde_json::to_string(&poll_started()).unwrap();
        assert!(json.contains("\"type\":\"poll_started\""));
    }
}
