//! In-memory implementation of the client traits for testing

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::task::{Task, TaskResult, TaskResultStatus};

use super::{ClientError, MetadataClient, PollClient, UpdateClient};

/// In-memory task server implementing [`PollClient`], [`UpdateClient`]
/// and [`MetadataClient`].
///
/// This is primarily for testing. It keeps a queue per task type,
/// records every result it receives, and supports scripted failures for
/// both poll and update so resilience paths can be exercised without a
/// network.
///
/// Long-running semantics are modeled: a result with `IN_PROGRESS` and
/// a callback delay re-enqueues the original task with `poll_count + 1`.
/// A queue of chained tasks feeds the update call's next-task hint.
///
/// # Example
///
/// ```
/// use conveyor::client::InMemoryTaskServer;
/// use conveyor::task::Task;
///
/// let server = InMemoryTaskServer::new();
/// server.enqueue(Task::new("t1", "wf1", "greet"));
/// assert_eq!(server.pending("greet"), 1);
/// ```
pub struct InMemoryTaskServer {
    queues: RwLock<HashMap<String, VecDeque<Task>>>,
    delivered: RwLock<HashMap<String, Task>>,
    results: RwLock<Vec<TaskResult>>,
    chained: RwLock<VecDeque<Task>>,
    poll_failures: RwLock<VecDeque<ClientError>>,
    update_failures: RwLock<VecDeque<ClientError>>,
    registered_defs: RwLock<Vec<String>>,
    poll_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl InMemoryTaskServer {
    /// Create an empty server
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
            delivered: RwLock::new(HashMap::new()),
            results: RwLock::new(Vec::new()),
            chained: RwLock::new(VecDeque::new()),
            poll_failures: RwLock::new(VecDeque::new()),
            update_failures: RwLock::new(VecDeque::new()),
            registered_defs: RwLock::new(Vec::new()),
            poll_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    /// Enqueue a task for delivery
    pub fn enqueue(&self, task: Task) {
        self.queues
            .write()
            .entry(task.task_def_name.clone())
            .or_default()
            .push_back(task);
    }

    /// Enqueue a task to be handed back from the next successful update
    pub fn enqueue_chained(&self, task: Task) {
        self.chained.write().push_back(task);
    }

    /// Script the next poll to fail with the given error
    pub fn fail_next_poll(&self, error: ClientError) {
        self.poll_failures.write().push_back(error);
    }

    /// Script the next `n` polls to fail with clones of the given error
    pub fn fail_next_polls(&self, n: usize, error: ClientError) {
        let mut failures = self.poll_failures.write();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Script the next `n` updates to fail with clones of the given error
    pub fn fail_next_updates(&self, n: usize, error: ClientError) {
        let mut failures = self.update_failures.write();
        for _ in 0..n {
            failures.push_back(error.clone());
        }
    }

    /// Number of tasks waiting for the given task type
    pub fn pending(&self, task_type: &str) -> usize {
        self.queues
            .read()
            .get(task_type)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    /// All results received so far, in arrival order
    pub fn results(&self) -> Vec<TaskResult> {
        self.results.read().clone()
    }

    /// Number of batch-poll calls observed
    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::Relaxed)
    }

    /// Number of update calls observed
    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::Relaxed)
    }

    /// Task definition names registered so far
    pub fn registered_defs(&self) -> Vec<String> {
        self.registered_defs.read().clone()
    }

    /// Clear all state (for testing)
    pub fn clear(&self) {
        self.queues.write().clear();
        self.delivered.write().clear();
        self.results.write().clear();
        self.chained.write().clear();
        self.poll_failures.write().clear();
        self.update_failures.write().clear();
    }
}

impl Default for InMemoryTaskServer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollClient for InMemoryTaskServer {
    async fn batch_poll(
        &self,
        task_type: &str,
        _worker_id: &str,
        count: usize,
        _timeout: Duration,
        _domain: Option<&str>,
    ) -> Result<Vec<Task>, ClientError> {
        self.poll_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = self.poll_failures.write().pop_front() {
            return Err(error);
        }

        let mut tasks = Vec::new();
        {
            let mut queues = self.queues.write();
            if let Some(queue) = queues.get_mut(task_type) {
                while tasks.len() < count {
                    match queue.pop_front() {
                        Some(task) => tasks.push(task),
                        None => break,
                    }
                }
            }
        }

        let mut delivered = self.delivered.write();
        for task in &tasks {
            delivered.insert(task.task_id.clone(), task.clone());
        }

        Ok(tasks)
    }
}

#[async_trait]
impl UpdateClient for InMemoryTaskServer {
    async fn update(&self, result: &TaskResult) -> Result<Option<Task>, ClientError> {
        self.update_calls.fetch_add(1, Ordering::Relaxed);

        if let Some(error) = self.update_failures.write().pop_front() {
            return Err(error);
        }

        self.results.write().push(result.clone());

        // A long-running task asked to be re-delivered later.
        if result.status == TaskResultStatus::InProgress
            && result.callback_after_seconds.is_some()
        {
            let redelivery = self.delivered.read().get(&result.task_id).cloned();
            if let Some(task) = redelivery {
                let next_count = task.poll_count + 1;
                self.enqueue(task.with_poll_count(next_count));
            }
            return Ok(None);
        }

        Ok(self.chained.write().pop_front())
    }
}

#[async_trait]
impl MetadataClient for InMemoryTaskServer {
    async fn register_task_def(&self, name: &str) -> Result<(), ClientError> {
        self.registered_defs.write().push(name.to_string());
        Ok(())
    }
}
