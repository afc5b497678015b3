//! The poll/execute/update cycle
//!
//! This module provides three interchangeable runner strategies driving
//! the same lifecycle:
//!
//! - [`PooledTaskRunner`] - one task per cycle, blocking handlers on
//!   the bounded blocking pool; the unit run inside each supervised OS
//!   process (classic mode)
//! - [`BatchTaskRunner`] - single cooperative loop with a permit pool,
//!   batch polls sized to free capacity
//! - [`ChainedTaskRunner`] - batch loop plus the next-task fast path:
//!   chained tasks handed back by the update call dispatch without an
//!   extra poll round trip
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          TaskRunner                            │
//! │   run(): loop run_once() until stopped, then drain             │
//! │                                                                │
//! │   run_once():                                                  │
//! │     available = permits.available()     ── 0 → brief pause     │
//! │     empty-poll backoff gate             (1ms·2^n, ≤ interval)  │
//! │     batch poll over eligible targets    (even slot split)     │
//! │          │ per-target success/auth/failure → resilience state  │
//! │          ▼                                                     │
//! │     spawn execution unit per task  [permit held end to end]    │
//! │       handler → TaskOutcome → TaskResult → update (retried)    │
//! │                                                                │
//! │   events: poll started/completed/failure, execution            │
//! │           started/completed/failure, update failure            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conveyor::runner::{BatchTaskRunner, RunnerConfig};
//!
//! let mut runner = BatchTaskRunner::new(worker, vec![target], RunnerConfig::default());
//! let handle = runner.handle();
//!
//! tokio::spawn(async move { runner.run().await });
//!
//! // ... later
//! handle.stop();
//! ```

mod batch;
mod chained;
mod cycle;
mod execute;
mod poll;
mod pooled;

use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::reliability::UpdateRetryPolicy;

pub use batch::BatchTaskRunner;
pub use chained::ChainedTaskRunner;
pub use pooled::PooledTaskRunner;

/// Runner configuration shared by all strategies.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Identity reported to the server on polls and results
    pub worker_id: String,

    /// Long-poll hint forwarded to the poll client
    pub poll_timeout: Duration,

    /// Hard ceiling on one poll round; a hung server target cannot
    /// stall the others past this
    pub poll_round_ceiling: Duration,

    /// Pause when every permit is busy (backpressure, not busy-waiting)
    pub backpressure_pause: Duration,

    /// How long `run()` waits for in-flight executions after a stop
    pub drain_timeout: Duration,

    /// Local retry schedule for result updates
    pub update_retry: UpdateRetryPolicy,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            poll_timeout: Duration::from_millis(100),
            poll_round_ceiling: Duration::from_secs(5),
            backpressure_pause: Duration::from_millis(10),
            drain_timeout: Duration::from_secs(30),
            update_retry: UpdateRetryPolicy::default(),
        }
    }
}

impl RunnerConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the worker identity
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the long-poll hint
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the poll-round ceiling
    pub fn with_poll_round_ceiling(mut self, ceiling: Duration) -> Self {
        self.poll_round_ceiling = ceiling;
        self
    }

    /// Set the drain timeout
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Set the update retry policy
    pub fn with_update_retry(mut self, policy: UpdateRetryPolicy) -> Self {
        self.update_retry = policy;
        self
    }
}

/// Handle for stopping a runner from outside its loop.
///
/// Stopping is cooperative: the loop observes the signal at its next
/// scheduling point and in-flight executions are allowed to finish.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RunnerHandle {
    pub(crate) fn new(shutdown_tx: watch::Sender<bool>) -> Self {
        Self { shutdown_tx }
    }

    /// Signal the runner to stop
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether a stop has been signaled
    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}
