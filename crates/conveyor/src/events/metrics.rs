//! Built-in metrics listener

use std::sync::atomic::{AtomicU64, Ordering};

use super::{EventListener, TaskRunnerEvent};

/// Point-in-time view of the counters kept by [`MetricsListener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub polls: u64,
    pub empty_polls: u64,
    pub poll_failures: u64,
    pub executions_started: u64,
    pub executions_completed: u64,
    pub executions_failed: u64,
    pub update_failures: u64,
}

/// Event listener that keeps atomic lifecycle counters.
///
/// Counters use relaxed ordering; they are monotonic tallies, not
/// synchronization points.
#[derive(Debug, Default)]
pub struct MetricsListener {
    polls: AtomicU64,
    empty_polls: AtomicU64,
    poll_failures: AtomicU64,
    executions_started: AtomicU64,
    executions_completed: AtomicU64,
    executions_failed: AtomicU64,
    update_failures: AtomicU64,
}

impl MetricsListener {
    /// Create a listener with zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Read all counters at once
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            poll_failures: self.poll_failures.load(Ordering::Relaxed),
            executions_started: self.executions_started.load(Ordering::Relaxed),
            executions_completed: self.executions_completed.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            update_failures: self.update_failures.load(Ordering::Relaxed),
        }
    }
}

impl EventListener for MetricsListener {
    fn on_event(&self, event: &TaskRunnerEvent) {
        match event {
            TaskRunnerEvent::PollStarted { .. } => {}
            TaskRunnerEvent::PollCompleted { task_count, .. } => {
                self.polls.fetch_add(1, Ordering::Relaxed);
                if *task_count == 0 {
                    self.empty_polls.fetch_add(1, Ordering::Relaxed);
                }
            }
            TaskRunnerEvent::PollFailure { .. } => {
                self.poll_failures.fetch_add(1, Ordering::Relaxed);
            }
            TaskRunnerEvent::ExecutionStarted { .. } => {
                self.executions_started.fetch_add(1, Ordering::Relaxed);
            }
            TaskRunnerEvent::ExecutionCompleted { .. } => {
                self.executions_completed.fetch_add(1, Ordering::Relaxed);
            }
            TaskRunnerEvent::ExecutionFailure { .. } => {
                self.executions_failed.fetch_add(1, Ordering::Relaxed);
            }
            TaskRunnerEvent::UpdateFailure { .. } => {
                self.update_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_follow_events() {
        let metrics = MetricsListener::new();

        metrics.on_event(&TaskRunnerEvent::PollCompleted {
            task_type: "greet".into(),
            worker_id: "w1".into(),
            duration_ms: 5,
            task_count: 0,
        });
        metrics.on_event(&TaskRunnerEvent::PollCompleted {
            task_type: "greet".into(),
            worker_id: "w1".into(),
            duration_ms: 5,
            task_count: 2,
        });
        metrics.on_event(&TaskRunnerEvent::ExecutionStarted {
            task_type: "greet".into(),
            worker_id: "w1".into(),
            task_id: "t1".into(),
            workflow_instance_id: "wf1".into(),
        });
        metrics.on_event(&TaskRunnerEvent::ExecutionFailure {
            task_type: "greet".into(),
            worker_id: "w1".into(),
            task_id: "t1".into(),
            error: "boom".into(),
        });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.empty_polls, 1);
        assert_eq!(snapshot.executions_started, 1);
        assert_eq!(snapshot.executions_failed, 1);
        assert_eq!(snapshot.update_failures, 0);
    }
}
