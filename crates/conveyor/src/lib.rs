//! # Conveyor
//!
//! A worker-pool execution engine for remote task queues. Conveyor
//! polls a workflow-orchestration server for tasks, executes registered
//! handlers under a strict concurrency bound, and reports results back.
//!
//! ## Features
//!
//! - **Three runner strategies**: classic one-task-per-cycle, batch
//!   polling sized to free capacity, and batch polling with the
//!   chained next-task fast path
//! - **Per-server resilience**: circuit breakers and auth-failure
//!   backoff per configured server target, so a multi-homed worker
//!   rides out a failing endpoint
//! - **Adaptive polling**: exponential empty-poll backoff capped at the
//!   worker's poll interval
//! - **Lost-result accounting**: result updates retry locally; when
//!   retries exhaust, the result is surfaced through an event instead
//!   of crashing the loop
//! - **Process supervision**: classic mode runs one OS process per
//!   worker, restarted with capped exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ProcessSupervisor                       │
//! │  (classic mode: one OS process per worker, restart/backoff) │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │          TaskRunner (pooled / batch / chained)              │
//! │  poll ─► execute handler ─► update result (retried)         │
//! │  permit pool bounds concurrency end to end                  │
//! └─────────────────────────────────────────────────────────────┘
//!                │                              │
//!                ▼                              ▼
//! ┌───────────────────────────┐   ┌───────────────────────────┐
//! │  ServerTarget (×N)        │   │  EventDispatcher          │
//! │  circuit breaker,         │   │  poll/execute/update      │
//! │  auth backoff             │   │  lifecycle listeners      │
//! └───────────────────────────┘   └───────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::prelude::*;
//! use serde_json::json;
//!
//! let worker = Worker::new_async("process_order", |_ctx, task| async move {
//!     let order_id = task.input_data["orderId"].clone();
//!     Ok(TaskOutcome::Value(json!({ "shipped": order_id })))
//! })
//! .with_options(WorkerOptions::new().with_concurrency(10));
//!
//! let target = ServerTarget::new("prod", poll_client, update_client);
//! let mut runner = BatchTaskRunner::new(worker, vec![target], RunnerConfig::default());
//! runner.run().await;
//! ```

pub mod client;
pub mod events;
pub mod reliability;
pub mod runner;
pub mod supervisor;
pub mod task;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::client::{ClientError, MetadataClient, PollClient, UpdateClient};
    pub use crate::events::{EventDispatcher, EventListener, MetricsListener, TaskRunnerEvent};
    pub use crate::reliability::{ResilienceConfig, ServerTarget, UpdateRetryPolicy};
    pub use crate::runner::{
        BatchTaskRunner, ChainedTaskRunner, PooledTaskRunner, RunnerConfig, RunnerHandle,
    };
    pub use crate::supervisor::{ProcessSupervisor, SupervisorConfig, WorkerProcessStatus};
    pub use crate::task::{
        HandlerError, Task, TaskContext, TaskOutcome, TaskResult, TaskResultStatus,
    };
    pub use crate::worker::{Worker, WorkerOptions, WorkerRegistry};
}

// Re-export key types at crate root
pub use client::{ClientError, InMemoryTaskServer, MetadataClient, PollClient, UpdateClient};
pub use events::{EventDispatcher, EventListener, MetricsListener, TaskRunnerEvent};
pub use reliability::{ResilienceConfig, ServerTarget, UpdateRetryPolicy};
pub use runner::{BatchTaskRunner, ChainedTaskRunner, PooledTaskRunner, RunnerConfig, RunnerHandle};
pub use supervisor::{
    init_child_logging, supervised_child_worker, ProcessSupervisor, SupervisorConfig,
    SupervisorError, WorkerProcessStatus,
};
pub use task::{HandlerError, Task, TaskContext, TaskOutcome, TaskResult, TaskResultStatus};
pub use worker::{Worker, WorkerConfig, WorkerOptions, WorkerRegistry};
