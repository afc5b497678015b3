//! Strategy C: batch loop with the next-task fast path

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tracing::info;

use crate::events::EventDispatcher;
use crate::reliability::ServerTarget;
use crate::task::Task;
use crate::worker::Worker;

use super::cycle::CycleCore;
use super::execute::spawn_execution;
use super::{RunnerConfig, RunnerHandle};

/// Batch runner with chained-task dispatch.
///
/// Identical to [`super::BatchTaskRunner`] except that the update call
/// may hand back the server's next task for this worker. A chained task
/// dispatches immediately when a permit is free; otherwise it lands in
/// an in-process FIFO consumed before the next poll. High-throughput
/// chains of short tasks skip most poll round trips this way.
pub struct ChainedTaskRunner {
    core: CycleCore,
    shutdown_tx: watch::Sender<bool>,
    next_rx: UnboundedReceiver<(Arc<ServerTarget>, Task)>,
    backlog: VecDeque<(Arc<ServerTarget>, Task)>,
}

impl ChainedTaskRunner {
    /// Create a runner with no event listeners.
    pub fn new(worker: Worker, targets: Vec<ServerTarget>, config: RunnerConfig) -> Self {
        Self::with_dispatcher(worker, targets, config, EventDispatcher::new())
    }

    /// Create a runner publishing lifecycle events to `dispatcher`.
    pub fn with_dispatcher(
        worker: Worker,
        targets: Vec<ServerTarget>,
        config: RunnerConfig,
        dispatcher: EventDispatcher,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (next_tx, next_rx) = mpsc::unbounded_channel();
        let core = CycleCore::new(
            Arc::new(worker),
            targets.into_iter().map(Arc::new).collect(),
            config,
            Arc::new(dispatcher),
            shutdown_rx,
            true,
            Some(next_tx),
        );
        Self {
            core,
            shutdown_tx,
            next_rx,
            backlog: VecDeque::new(),
        }
    }

    /// Handle for stopping the runner from another task.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle::new(self.shutdown_tx.clone())
    }

    /// Drive the loop until stopped, then drain in-flight executions.
    pub async fn run(&mut self) {
        info!(
            task_type = %self.core.worker.task_def_name(),
            worker_id = %self.core.config.worker_id,
            concurrency = self.core.worker.config().concurrency,
            targets = self.core.targets.len(),
            "chained runner started"
        );

        while !self.core.is_shutdown() {
            self.run_once().await;
        }

        self.core.drain().await;
        info!(task_type = %self.core.worker.task_def_name(), "chained runner stopped");
    }

    /// One scheduling decision; chained tasks are served before polls.
    pub async fn run_once(&mut self) {
        self.collect_chained();
        self.dispatch_backlog();

        let worker_config = self.core.worker.config();
        if worker_config.paused {
            let interval = worker_config.poll_interval;
            self.core.wait(interval).await;
            return;
        }

        let slots = self.core.permits.available_permits();
        if slots == 0 {
            let pause = self.core.config.backpressure_pause;
            self.core.wait(pause).await;
            return;
        }

        if self.core.backoff_gate().await {
            return;
        }

        for (target, task) in self.core.poll_batch(slots).await {
            self.core.dispatch(target, task).await;
        }
    }

    /// Move chained tasks spilled by execution units into the backlog.
    fn collect_chained(&mut self) {
        while let Ok(pair) = self.next_rx.try_recv() {
            self.backlog.push_back(pair);
        }
    }

    /// Dispatch backlog entries while permits are immediately free.
    fn dispatch_backlog(&mut self) {
        while let Some((target, task)) = self.backlog.pop_front() {
            match Arc::clone(&self.core.permits).try_acquire_owned() {
                Ok(permit) => {
                    spawn_execution(Arc::clone(&self.core.env), target, task, permit);
                }
                Err(_) => {
                    self.backlog.push_front((target, task));
                    break;
                }
            }
        }
    }

    #[cfg(test)]
    fn backlog_len(&self) -> usize {
        self.backlog.len()
    }
}
