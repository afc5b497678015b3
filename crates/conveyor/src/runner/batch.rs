//! Strategy B: single cooperative loop with a permit pool

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::events::EventDispatcher;
use crate::reliability::ServerTarget;
use crate::worker::Worker;

use super::cycle::CycleCore;
use super::{RunnerConfig, RunnerHandle};

/// Cooperative batch runner.
///
/// Each `run_once()` makes one scheduling decision: with no free
/// permits it pauses briefly (backpressure), otherwise it batch-polls
/// up to the free capacity across all eligible server targets and
/// spawns one execution unit per returned task. Consecutive empty
/// polls back the poll cadence off exponentially, capped at the
/// worker's poll interval.
pub struct BatchTaskRunner {
    core: CycleCore,
    shutdown_tx: watch::Sender<bool>,
}

impl BatchTaskRunner {
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
        let core = CycleCore::new(
            Arc::new(worker),
            targets.into_iter().map(Arc::new).collect(),
            config,
            Arc::new(dispatcher),
            shutdown_rx,
            false,
            None,
        );
        Self { core, shutdown_tx }
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
            "batch runner started"
        );

        while !self.core.is_shutdown() {
            self.run_once().await;
        }

        self.core.drain().await;
        info!(task_type = %self.core.worker.task_def_name(), "batch runner stopped");
    }

    /// One scheduling decision; never blocks indefinitely.
    pub async fn run_once(&mut self) {
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
}
