//! Poll-round fan-out and adaptive empty-poll backoff

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::client::ClientError;
use crate::events::{EventDispatcher, TaskRunnerEvent};
use crate::reliability::ServerTarget;
use crate::task::Task;
use crate::worker::Worker;

use super::RunnerConfig;

/// Split `total` poll slots as evenly as possible over `buckets`
/// targets, assigning the remainder to the first targets.
pub(crate) fn split_slots(total: usize, buckets: usize) -> Vec<usize> {
    if buckets == 0 {
        return Vec::new();
    }
    let base = total / buckets;
    let remainder = total % buckets;
    (0..buckets)
        .map(|i| if i < remainder { base + 1 } else { base })
        .collect()
}

/// Delay before the next poll after `consecutive_empty` empty polls:
/// `1ms * 2^min(n, 10)`, capped at the worker's poll interval.
pub(crate) fn empty_poll_delay(consecutive_empty: u32, poll_interval: Duration) -> Duration {
    if consecutive_empty == 0 {
        return Duration::ZERO;
    }
    let exp = consecutive_empty.min(10);
    Duration::from_millis(1u64 << exp).min(poll_interval)
}

/// Poll the given targets concurrently, `counts[i]` tasks from
/// `targets[i]`, each call bounded by the round ceiling.
///
/// Per-target outcomes feed that target's resilience state; failures
/// are published as events and never propagate. Returned tasks stay
/// paired with the target that delivered them so their results go back
/// to the same server.
pub(crate) async fn poll_round(
    worker: &Worker,
    config: &RunnerConfig,
    dispatcher: &EventDispatcher,
    targets: &[Arc<ServerTarget>],
    counts: &[usize],
) -> Vec<(Arc<ServerTarget>, Task)> {
    let task_type = worker.task_def_name();
    let domain = worker.config().domain.clone();
    let started = Instant::now();

    dispatcher.publish(&TaskRunnerEvent::PollStarted {
        task_type: task_type.to_string(),
        worker_id: config.worker_id.clone(),
    });

    let polls = targets.iter().zip(counts).filter(|(_, n)| **n > 0).map(|(target, count)| {
        let target = Arc::clone(target);
        let domain = domain.clone();
        let count = *count;
        async move {
            let client = target.poll_client();
            let result = tokio::time::timeout(
                config.poll_round_ceiling,
                client.batch_poll(
                    task_type,
                    &config.worker_id,
                    count,
                    config.poll_timeout,
                    domain.as_deref(),
                ),
            )
            .await
            .unwrap_or_else(|_| {
                Err(ClientError::Transport(format!(
                    "poll exceeded round ceiling of {}ms",
                    config.poll_round_ceiling.as_millis()
                )))
            });
            (target, result)
        }
    });

    let mut tasks = Vec::new();
    for (target, result) in futures::future::join_all(polls).await {
        match result {
            Ok(polled) => {
                target.record_success();
                debug!(
                    task_type = %task_type,
                    target_name = %target.name(),
                    count = polled.len(),
                    "poll returned tasks"
                );
                tasks.extend(polled.into_iter().map(|t| (Arc::clone(&target), t)));
            }
            Err(err) => {
                if err.is_authorization() {
                    target.record_auth_failure();
                } else {
                    target.record_failure();
                }
                dispatcher.publish(&TaskRunnerEvent::PollFailure {
                    task_type: task_type.to_string(),
                    worker_id: config.worker_id.clone(),
                    error: err.to_string(),
                });
            }
        }
    }

    dispatcher.publish(&TaskRunnerEvent::PollCompleted {
        task_type: task_type.to_string(),
        worker_id: config.worker_id.clone(),
        duration_ms: started.elapsed().as_millis() as u64,
        task_count: tasks.len(),
    });

    tasks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_evenly() {
        assert_eq!(split_slots(6, 3), vec![2, 2, 2]);
    }

    #[test]
    fn test_split_remainder_goes_first() {
        assert_eq!(split_slots(7, 3), vec![3, 2, 2]);
        assert_eq!(split_slots(2, 3), vec![1, 1, 0]);
    }

    #[test]
    fn test_split_no_buckets() {
        assert!(split_slots(5, 0).is_empty());
    }

    #[test]
    fn test_empty_poll_delay_monotonic_and_capped() {
        let interval = Duration::from_millis(500);
        let mut previous = Duration::ZERO;
        for n in 0..20 {
            let delay = empty_poll_delay(n, interval);
            assert!(delay >= previous, "delay shrank at n={n}");
            assert!(delay <= interval);
            previous = delay;
        }
        // 2^10 ms exceeds the interval, so the cap is in force.
        assert_eq!(empty_poll_delay(15, interval), interval);
    }

    #[test]
    fn test_empty_poll_delay_starts_small() {
        let interval = Duration::from_secs(1);
        assert_eq!(empty_poll_delay(0, interval), Duration::ZERO);
        assert_eq!(empty_poll_delay(1, interval), Duration::from_millis(2));
        assert_eq!(empty_poll_delay(3, interval), Duration::from_millis(8));
    }
}
