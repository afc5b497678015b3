//! State shared by the runner strategies

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{watch, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::events::EventDispatcher;
use crate::reliability::ServerTarget;
use crate::task::Task;
use crate::worker::Worker;

use super::execute::{spawn_execution, ExecutionEnv};
use super::poll::{empty_poll_delay, poll_round, split_slots};
use super::RunnerConfig;

/// Per-runner state driving the poll/execute/update lifecycle.
///
/// One cycle owns one worker, its permit pool, and the resilience state
/// of its server targets. Nothing here is shared across workers.
pub(crate) struct CycleCore {
    pub worker: Arc<Worker>,
    pub targets: Vec<Arc<ServerTarget>>,
    pub config: RunnerConfig,
    pub dispatcher: Arc<EventDispatcher>,
    pub permits: Arc<Semaphore>,
    pub env: Arc<ExecutionEnv>,
    shutdown_rx: watch::Receiver<bool>,
    consecutive_empty_polls: u32,
    last_poll_at: Option<Instant>,
    round_robin: usize,
}

impl CycleCore {
    pub(crate) fn new(
        worker: Arc<Worker>,
        targets: Vec<Arc<ServerTarget>>,
        config: RunnerConfig,
        dispatcher: Arc<EventDispatcher>,
        shutdown_rx: watch::Receiver<bool>,
        use_chaining: bool,
        next_tx: Option<UnboundedSender<(Arc<ServerTarget>, Task)>>,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(worker.config().concurrency));
        let env = Arc::new(ExecutionEnv {
            worker: Arc::clone(&worker),
            worker_id: config.worker_id.clone(),
            dispatcher: Arc::clone(&dispatcher),
            update_retry: config.update_retry.clone(),
            permits: Arc::clone(&permits),
            use_chaining,
            next_tx,
        });

        Self {
            worker,
            targets,
            config,
            dispatcher,
            permits,
            env,
            shutdown_rx,
            consecutive_empty_polls: 0,
            last_poll_at: None,
            round_robin: 0,
        }
    }

    /// Whether a stop has been signaled
    pub(crate) fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Sleep for `duration`, returning early (true) on a stop signal.
    pub(crate) async fn wait(&mut self, duration: Duration) -> bool {
        if *self.shutdown_rx.borrow() {
            return true;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = self.shutdown_rx.changed() => true,
        }
    }

    /// Apply the empty-poll backoff: after consecutive empty polls the
    /// next poll is delayed (measured from the last poll) so an idle
    /// server is not hammered, while the cap at the poll interval keeps
    /// reaction time bounded once work appears.
    ///
    /// Returns true if a stop was signaled during the wait.
    pub(crate) async fn backoff_gate(&mut self) -> bool {
        if self.consecutive_empty_polls == 0 {
            return false;
        }
        let delay = empty_poll_delay(
            self.consecutive_empty_polls,
            self.worker.config().poll_interval,
        );
        if let Some(last) = self.last_poll_at {
            let elapsed = last.elapsed();
            if elapsed < delay {
                return self.wait(delay - elapsed).await;
            }
        }
        false
    }

    fn eligible_targets(&self) -> Vec<Arc<ServerTarget>> {
        let now = Instant::now();
        self.targets
            .iter()
            .filter(|t| !t.is_suppressed(now))
            .cloned()
            .collect()
    }

    fn record_poll_result(&mut self, returned: usize) {
        self.last_poll_at = Some(Instant::now());
        if returned == 0 {
            self.consecutive_empty_polls = self.consecutive_empty_polls.saturating_add(1);
        } else {
            self.consecutive_empty_polls = 0;
        }
    }

    /// Batch-poll up to `slots` tasks, split evenly across the
    /// non-suppressed targets (remainder to the first ones).
    pub(crate) async fn poll_batch(&mut self, slots: usize) -> Vec<(Arc<ServerTarget>, Task)> {
        let eligible = self.eligible_targets();
        if eligible.is_empty() {
            debug!(
                task_type = %self.worker.task_def_name(),
                "every server target is suppressed, skipping poll"
            );
            self.record_poll_result(0);
            return Vec::new();
        }

        let counts = split_slots(slots, eligible.len());
        let polled = poll_round(
            &self.worker,
            &self.config,
            &self.dispatcher,
            &eligible,
            &counts,
        )
        .await;
        self.record_poll_result(polled.len());
        polled
    }

    /// Poll a single task from one target, rotating through the
    /// non-suppressed targets across calls.
    pub(crate) async fn poll_one(&mut self) -> Option<(Arc<ServerTarget>, Task)> {
        let eligible = self.eligible_targets();
        if eligible.is_empty() {
            debug!(
                task_type = %self.worker.task_def_name(),
                "every server target is suppressed, skipping poll"
            );
            self.record_poll_result(0);
            return None;
        }

        let target = Arc::clone(&eligible[self.round_robin % eligible.len()]);
        self.round_robin = self.round_robin.wrapping_add(1);

        let polled = poll_round(
            &self.worker,
            &self.config,
            &self.dispatcher,
            &[target],
            &[1],
        )
        .await;
        self.record_poll_result(polled.len());
        polled.into_iter().next()
    }

    /// Acquire one permit, returning `None` on a stop signal or a
    /// closed pool.
    pub(crate) async fn acquire_permit(
        &mut self,
    ) -> Option<tokio::sync::OwnedSemaphorePermit> {
        if *self.shutdown_rx.borrow() {
            return None;
        }
        tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok(),
            _ = self.shutdown_rx.changed() => None,
        }
    }

    /// Dispatch a task into its execution unit, acquiring a permit for
    /// the full execute+update lifecycle.
    pub(crate) async fn dispatch(&self, target: Arc<ServerTarget>, task: Task) {
        let permit = match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        spawn_execution(Arc::clone(&self.env), target, task, permit);
    }

    /// Wait for in-flight executions to finish, bounded by the drain
    /// timeout.
    pub(crate) async fn drain(&self) {
        let total = self.worker.config().concurrency;
        let deadline = Instant::now() + self.config.drain_timeout;

        loop {
            let available = self.permits.available_permits();
            if available >= total {
                debug!(task_type = %self.worker.task_def_name(), "all executions drained");
                return;
            }
            if Instant::now() >= deadline {
                warn!(
                    task_type = %self.worker.task_def_name(),
                    in_flight = total - available,
                    "drain timeout reached with executions still in flight"
                );
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    #[cfg(test)]
    pub(crate) fn consecutive_empty_polls(&self) -> u32 {
        self.consecutive_empty_polls
    }
}
