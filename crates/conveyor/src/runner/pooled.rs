//! Strategy A: one task per cycle, classic mode

use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::events::EventDispatcher;
use crate::reliability::ServerTarget;
use crate::supervisor::{LOG_STREAM_END, STOP_SENTINEL};
use crate::worker::Worker;

use super::cycle::CycleCore;
use super::execute::spawn_execution;
use super::{RunnerConfig, RunnerHandle};

/// Classic one-task-per-cycle runner.
///
/// Each `run_once()` waits for a free execution slot, polls a single
/// task from one server target (rotating across targets), and runs it
/// to completion on that slot. Blocking handlers execute on the bounded
/// blocking pool, so the concurrency limit caps worker threads the same
/// way a fixed-size thread pool would.
///
/// This is the unit run inside each supervised OS process:
/// [`run_supervised`](Self::run_supervised) additionally watches stdin
/// for the supervisor's shutdown sentinel.
pub struct PooledTaskRunner {
    core: CycleCore,
    shutdown_tx: watch::Sender<bool>,
}

impl PooledTaskRunner {
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
            "pooled runner started"
        );

        while !self.core.is_shutdown() {
            self.run_once().await;
        }

        self.core.drain().await;
        info!(task_type = %self.core.worker.task_def_name(), "pooled runner stopped");
    }

    /// One scheduling decision: one slot, one poll, at most one task.
    pub async fn run_once(&mut self) {
        let worker_config = self.core.worker.config();
        if worker_config.paused {
            let interval = worker_config.poll_interval;
            self.core.wait(interval).await;
            return;
        }

        // Classic semantics: a free worker slot gates the poll.
        let Some(permit) = self.core.acquire_permit().await else {
            return;
        };

        if self.core.backoff_gate().await {
            return;
        }

        match self.core.poll_one().await {
            Some((target, task)) => {
                spawn_execution(Arc::clone(&self.core.env), target, task, permit);
            }
            None => drop(permit),
        }
    }

    /// Run as a supervised child process.
    ///
    /// Watches stdin for the supervisor's shutdown sentinel and marks
    /// the end of the log stream on stdout before returning, so the
    /// parent's log forwarder can close cleanly.
    pub async fn run_supervised(mut self) {
        let handle = self.handle();
        let stdin_watcher = tokio::spawn(async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim() == STOP_SENTINEL {
                    debug!("shutdown sentinel received");
                    handle.stop();
                    break;
                }
            }
        });

        self.run().await;

        stdin_watcher.abort();
        println!("{LOG_STREAM_END}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::InMemoryTaskServer;
    use crate::task::{Task, TaskOutcome};
    use crate::worker::WorkerOptions;
    use serde_json::json;
    use std::time::Duration;

    fn counting_worker() -> Worker {
        Worker::new_blocking("count", |_ctx, task| {
            Ok(TaskOutcome::Value(json!({
                "id": task.task_id.clone()
            })))
        })
        .with_options(
            WorkerOptions::new()
                .with_concurrency(2)
                .with_poll_interval(Duration::from_millis(100)),
        )
    }

    fn target(server: &Arc<InMemoryTaskServer>) -> ServerTarget {
        ServerTarget::new("local", Arc::clone(server) as _, Arc::clone(server) as _)
    }

    #[tokio::test]
    async fn test_processes_queue_one_poll_at_a_time() {
        let server = Arc::new(InMemoryTaskServer::new());
        for i in 0..4 {
            server.enqueue(Task::new(format!("t{i}"), "wf", "count"));
        }

        let mut runner = PooledTaskRunner::new(
            counting_worker(),
            vec![target(&server)],
            RunnerConfig::default().with_worker_id("w-pooled"),
        );
        let handle = runner.handle();
        let join = tokio::spawn(async move { runner.run().await });

        while server.results().len() < 4 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop();
        join.await.unwrap();

        assert_eq!(server.results().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotates_across_targets() {
        let a = Arc::new(InMemoryTaskServer::new());
        let b = Arc::new(InMemoryTaskServer::new());
        a.enqueue(Task::new("ta", "wf", "count"));
        b.enqueue(Task::new("tb", "wf", "count"));

        let mut runner = PooledTaskRunner::new(
            counting_worker(),
            vec![target(&a), target(&b)],
            RunnerConfig::default(),
        );
        let handle = runner.handle();
        let join = tokio::spawn(async move { runner.run().await });

        while a.results().is_empty() || b.results().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop();
        join.await.unwrap();

        assert_eq!(a.results()[0].task_id, "ta");
        assert_eq!(b.results()[0].task_id, "tb");
    }
}
