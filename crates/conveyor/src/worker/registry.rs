//! Worker definitions and the explicit registry

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::client::MetadataClient;
use crate::task::{HandlerError, Task, TaskContext, TaskOutcome};

use super::config::{WorkerConfig, WorkerOptions};

/// Boxed async handler function
pub type AsyncHandlerFn = Arc<
    dyn Fn(Arc<TaskContext>, Task) -> BoxFuture<'static, Result<TaskOutcome, HandlerError>>
        + Send
        + Sync,
>;

/// Boxed blocking handler function, executed off the event loop
pub type BlockingHandlerFn =
    Arc<dyn Fn(&TaskContext, &Task) -> Result<TaskOutcome, HandlerError> + Send + Sync>;

/// A handler is either awaited directly on the loop or off-loaded to
/// the bounded blocking pool so it can never stall the loop.
#[derive(Clone)]
pub enum TaskHandler {
    Async(AsyncHandlerFn),
    Blocking(BlockingHandlerFn),
}

impl std::fmt::Debug for TaskHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Async(_) => write!(f, "TaskHandler::Async"),
            Self::Blocking(_) => write!(f, "TaskHandler::Blocking"),
        }
    }
}

/// One task type's execution capability.
///
/// Options are resolved (explicit value, then env overrides, then
/// defaults) when the worker is built and are immutable afterwards.
///
/// # Example
///
/// ```
/// use conveyor::worker::{Worker, WorkerOptions};
/// use conveyor::task::TaskOutcome;
/// use serde_json::json;
///
/// let worker = Worker::new_async("greet", |_ctx, task| async move {
///     let name = task.input_data.get("name").cloned().unwrap_or(json!("world"));
///     Ok(TaskOutcome::Value(json!({ "greeting": name })))
/// })
/// .with_options(WorkerOptions::new().with_concurrency(4));
/// assert_eq!(worker.config().concurrency, 4);
/// ```
#[derive(Debug, Clone)]
pub struct Worker {
    task_def_name: String,
    registered_names: Vec<String>,
    handler: TaskHandler,
    options: WorkerOptions,
    config: WorkerConfig,
}

impl Worker {
    /// Create a worker around an async handler.
    pub fn new_async<F, Fut>(task_def_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<TaskContext>, Task) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<TaskOutcome, HandlerError>> + Send + 'static,
    {
        let handler: AsyncHandlerFn = Arc::new(move |ctx, task| Box::pin(handler(ctx, task)));
        Self::with_handler(task_def_name, TaskHandler::Async(handler))
    }

    /// Create a worker around a blocking handler.
    pub fn new_blocking<F>(task_def_name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&TaskContext, &Task) -> Result<TaskOutcome, HandlerError> + Send + Sync + 'static,
    {
        Self::with_handler(task_def_name, TaskHandler::Blocking(Arc::new(handler)))
    }

    /// Create a worker around an already-boxed handler.
    pub fn with_handler(task_def_name: impl Into<String>, handler: TaskHandler) -> Self {
        let task_def_name = task_def_name.into();
        let options = WorkerOptions::default();
        let config = options.resolve(&task_def_name);
        Self {
            registered_names: vec![task_def_name.clone()],
            task_def_name,
            handler,
            options,
            config,
        }
    }

    /// Replace the options and re-resolve the configuration.
    pub fn with_options(mut self, options: WorkerOptions) -> Self {
        self.config = options.resolve(&self.task_def_name);
        self.options = options;
        self
    }

    /// Add an extra task definition name to register with the server.
    pub fn with_registered_name(mut self, name: impl Into<String>) -> Self {
        self.registered_names.push(name.into());
        self
    }

    /// The task type this worker polls for
    pub fn task_def_name(&self) -> &str {
        &self.task_def_name
    }

    /// Every task definition name to register with the server
    pub fn registered_names(&self) -> &[String] {
        &self.registered_names
    }

    /// The resolved, immutable configuration
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub(crate) fn handler(&self) -> &TaskHandler {
        &self.handler
    }
}

/// Explicit collection of workers handed to runners and the supervisor.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: Vec<Arc<Worker>>,
}

impl WorkerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Replaces any earlier worker for the same task type.
    pub fn register(mut self, worker: Worker) -> Self {
        self.workers
            .retain(|w| w.task_def_name() != worker.task_def_name());
        self.workers.push(Arc::new(worker));
        self
    }

    /// Look up a worker by task type
    pub fn get(&self, task_def_name: &str) -> Option<Arc<Worker>> {
        self.workers
            .iter()
            .find(|w| w.task_def_name() == task_def_name)
            .cloned()
    }

    /// All registered workers, in registration order
    pub fn workers(&self) -> &[Arc<Worker>] {
        &self.workers
    }

    /// Number of registered workers
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether the registry has no workers
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Register every worker's task definitions with the server.
    ///
    /// Best effort: failures are logged and never propagate.
    pub async fn register_task_defs(&self, client: &dyn MetadataClient) {
        for worker in &self.workers {
            for name in worker.registered_names() {
                match client.register_task_def(name).await {
                    Ok(()) => info!(task_def = %name, "registered task definition"),
                    Err(err) => {
                        warn!(task_def = %name, error = %err, "task definition registration failed")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskServer;
    use serde_json::json;

    fn noop_worker(name: &str) -> Worker {
        Worker::new_async(name, |_ctx, _task| async { Ok(TaskOutcome::Value(json!(null))) })
    }

    #[test]
    fn test_registry_lookup() {
        let registry = WorkerRegistry::new()
            .register(noop_worker("a"))
            .register(noop_worker("b"));

        assert_eq!(registry.len(), 2);
        assert!(registry.get("a").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_registering_same_type_replaces() {
        let registry = WorkerRegistry::new()
            .register(noop_worker("a"))
            .register(noop_worker("a").with_registered_name("a_alias"));

        assert_eq!(registry.len(), 1);
        let worker = registry.get("a").unwrap();
        assert_eq!(worker.registered_names(), ["a", "a_alias"]);
    }

    #[tokio::test]
    async fn test_register_task_defs_is_best_effort() {
        let server = InMemoryTaskServer::new();
        let registry = WorkerRegistry::new()
            .register(noop_worker("a").with_registered_name("a_v2"))
            .register(noop_worker("b"));

        registry.register_task_defs(&server).await;
        assert_eq!(registry.len(), 2);
        assert_eq!(server.registered_defs(), ["a", "a_v2", "b"]);
    }
}
