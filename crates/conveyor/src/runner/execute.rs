//! Shared execution step: handler invocation, outcome resolution,
//! result update with local retries

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::events::{EventDispatcher, TaskRunnerEvent};
use crate::reliability::{ServerTarget, UpdateRetryPolicy};
use crate::task::{
    resolve_outcome, HandlerError, Task, TaskContext, TaskResult, TaskResultStatus,
};
use crate::worker::{TaskHandler, Worker};

/// Everything an execution unit needs, shared across all executions of
/// one runner.
pub(crate) struct ExecutionEnv {
    pub worker: Arc<Worker>,
    pub worker_id: String,
    pub dispatcher: Arc<EventDispatcher>,
    pub update_retry: UpdateRetryPolicy,
    pub permits: Arc<Semaphore>,

    /// Ask the update call for a chained next task (V2 path)
    pub use_chaining: bool,

    /// Where chained tasks spill when no permit is free
    pub next_tx: Option<UnboundedSender<(Arc<ServerTarget>, Task)>>,
}

/// Spawn one execution unit owning `permit` for the task's full
/// lifecycle. The permit is released by drop when the unit finishes,
/// whatever happened in between.
pub(crate) fn spawn_execution(
    env: Arc<ExecutionEnv>,
    target: Arc<ServerTarget>,
    task: Task,
    permit: OwnedSemaphorePermit,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let _permit = permit;
        execute_one(&env, &target, task).await;
    })
}

async fn execute_one(env: &Arc<ExecutionEnv>, target: &Arc<ServerTarget>, task: Task) {
    let task_type = env.worker.task_def_name().to_string();
    let started = Instant::now();

    env.dispatcher.publish(&TaskRunnerEvent::ExecutionStarted {
        task_type: task_type.clone(),
        worker_id: env.worker_id.clone(),
        task_id: task.task_id.clone(),
        workflow_instance_id: task.workflow_instance_id.clone(),
    });

    let ctx = Arc::new(TaskContext::new(&task));
    let lease = spawn_lease_extension(env, target, &task);

    let outcome = invoke_handler(env, &ctx, &task).await;

    if let Some(lease) = lease {
        lease.abort();
    }

    let mut result = resolve_outcome(&task, &env.worker_id, outcome);
    ctx.merge_into(&mut result);

    match result.status {
        TaskResultStatus::Failed | TaskResultStatus::FailedWithTerminalError => {
            env.dispatcher.publish(&TaskRunnerEvent::ExecutionFailure {
                task_type: task_type.clone(),
                worker_id: env.worker_id.clone(),
                task_id: task.task_id.clone(),
                error: result
                    .reason_for_incompletion
                    .clone()
                    .unwrap_or_else(|| "unknown failure".to_string()),
            });
        }
        _ => {
            env.dispatcher.publish(&TaskRunnerEvent::ExecutionCompleted {
                task_type: task_type.clone(),
                worker_id: env.worker_id.clone(),
                task_id: task.task_id.clone(),
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }
    }

    let next = update_with_retry(env, target, &result).await;

    // V2 fast path: a chained task dispatches immediately when a permit
    // is free, otherwise it queues for the loop to pick up before the
    // next poll.
    if let Some(next_task) = next {
        match env.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                debug!(task_id = %next_task.task_id, "dispatching chained task");
                spawn_execution(Arc::clone(env), Arc::clone(target), next_task, permit);
            }
            Err(_) => {
                if let Some(tx) = &env.next_tx {
                    let _ = tx.send((Arc::clone(target), next_task));
                }
            }
        }
    }
}

/// Invoke the handler under the task's response-timeout ceiling.
///
/// Async handlers are awaited on the loop; blocking handlers run on the
/// bounded blocking pool. Panics become retryable failures.
async fn invoke_handler(
    env: &ExecutionEnv,
    ctx: &Arc<TaskContext>,
    task: &Task,
) -> Result<crate::task::TaskOutcome, HandlerError> {
    let ceiling = task.response_timeout_seconds.map(Duration::from_secs);

    let invoked = match env.worker.handler() {
        TaskHandler::Async(handler) => {
            let fut = std::panic::AssertUnwindSafe(handler(Arc::clone(ctx), task.clone()))
                .catch_unwind();
            match with_ceiling(ceiling, fut).await {
                Some(Ok(outcome)) => outcome,
                Some(Err(panic)) => Err(HandlerError::retryable(panic_message(panic))),
                None => Err(timeout_error(task)),
            }
        }
        TaskHandler::Blocking(handler) => {
            let handler = Arc::clone(handler);
            let ctx = Arc::clone(ctx);
            let task_owned = task.clone();
            let join = tokio::task::spawn_blocking(move || handler(ctx.as_ref(), &task_owned));
            match with_ceiling(ceiling, join).await {
                Some(Ok(outcome)) => outcome,
                Some(Err(join_err)) => {
                    let message = if join_err.is_panic() {
                        panic_message(join_err.into_panic())
                    } else {
                        "handler task was cancelled".to_string()
                    };
                    Err(HandlerError::retryable(message))
                }
                None => Err(timeout_error(task)),
            }
        }
    };

    invoked
}

/// Await `fut`, bounded by `ceiling` when one is set. `None` means the
/// ceiling elapsed first.
async fn with_ceiling<F: std::future::Future>(ceiling: Option<Duration>, fut: F) -> Option<F::Output> {
    match ceiling {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}

fn timeout_error(task: &Task) -> HandlerError {
    HandlerError::retryable(format!(
        "execution exceeded response timeout of {}s",
        task.response_timeout_seconds.unwrap_or(0)
    ))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

/// While a long-running handler executes, keep the server's lease alive
/// with periodic in-progress reports. Only active when the worker opted
/// in and the task carries a response timeout.
fn spawn_lease_extension(
    env: &ExecutionEnv,
    target: &Arc<ServerTarget>,
    task: &Task,
) -> Option<JoinHandle<()>> {
    if !env.worker.config().lease_extension {
        return None;
    }
    let timeout_seconds = task.response_timeout_seconds?;
    if timeout_seconds == 0 {
        return None;
    }

    // Renew at 80% of the lease so a report lands before expiry.
    let period = Duration::from_secs_f64((timeout_seconds as f64 * 0.8).max(1.0));
    let client = target.update_client();
    let liveness = TaskResult::new(task, &env.worker_id, TaskResultStatus::InProgress);
    let task_id = task.task_id.clone();

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            debug!(task_id = %task_id, "extending task lease");
            if let Err(err) = client.update_v1(&liveness).await {
                warn!(task_id = %task_id, error = %err, "lease extension failed");
            }
        }
    }))
}

/// Try the update until it succeeds or the retry schedule is exhausted.
///
/// Exhaustion is a lost-result condition: an `UpdateFailure` event is
/// published exactly once, carrying the result for downstream
/// reconciliation, and the cycle moves on.
async fn update_with_retry(
    env: &ExecutionEnv,
    target: &Arc<ServerTarget>,
    result: &TaskResult,
) -> Option<Task> {
    let policy = &env.update_retry;
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let call = if env.use_chaining {
            target.update_client().update(result).await
        } else {
            target.update_client().update_v1(result).await.map(|_| None)
        };

        match call {
            Ok(next) => {
                target.record_success();
                return next;
            }
            Err(err) => {
                if err.is_authorization() {
                    target.record_auth_failure();
                }
                warn!(
                    task_id = %result.task_id,
                    attempt,
                    max_attempts = policy.max_attempts,
                    error = %err,
                    "failed to update task result"
                );
                if !policy.has_attempts_remaining(attempt) {
                    break;
                }
                tokio::time::sleep(policy.delay_after_attempt(attempt)).await;
            }
        }
    }

    error!(
        task_id = %result.task_id,
        status = %result.status,
        "update retries exhausted, result is lost to the server"
    );
    env.dispatcher.publish(&TaskRunnerEvent::UpdateFailure {
        task_type: env.worker.task_def_name().to_string(),
        worker_id: env.worker_id.clone(),
        task_id: result.task_id.clone(),
        lost_result: result.clone(),
    });
    None
}
