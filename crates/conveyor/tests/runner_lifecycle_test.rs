//! End-to-end runner tests against the in-memory task server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use conveyor::{
    BatchTaskRunner, ClientError, EventDispatcher, EventListener, HandlerError,
    InMemoryTaskServer, MetricsListener, RunnerConfig, ServerTarget, Task, TaskOutcome,
    TaskResultStatus, TaskRunnerEvent, UpdateRetryPolicy, Worker, WorkerOptions,
};

fn target(server: &Arc<InMemoryTaskServer>) -> ServerTarget {
    ServerTarget::new("local", Arc::clone(server) as _, Arc::clone(server) as _)
}

/// Tracks how many handler invocations overlap.
#[derive(Default)]
struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn permits_bound_concurrency_and_are_always_released() {
    let server = Arc::new(InMemoryTaskServer::new());
    for i in 0..12 {
        server.enqueue(Task::new(format!("t{i}"), "wf", "mixed").with_input("i", json!(i)));
    }

    let probe = Arc::new(ConcurrencyProbe::default());
    let handler_probe = Arc::clone(&probe);
    let worker = Worker::new_async("mixed", move |_ctx, task| {
        let probe = Arc::clone(&handler_probe);
        async move {
            probe.enter();
            tokio::time::sleep(Duration::from_millis(50)).await;
            probe.exit();

            // Every third task fails; failures must release permits too.
            let i = task.input_data["i"].as_u64().unwrap();
            if i % 3 == 0 {
                Err(HandlerError::retryable("induced failure"))
            } else {
                Ok(TaskOutcome::Value(json!({"i": i})))
            }
        }
    })
    .with_options(
        WorkerOptions::new()
            .with_concurrency(3)
            .with_poll_interval(Duration::from_millis(100)),
    );

    let mut runner = BatchTaskRunner::new(worker, vec![target(&server)], RunnerConfig::default());
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while server.results().len() < 12 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop();
    // run() only returns once every in-flight execution drained, which
    // requires every permit to have been released.
    join.await.unwrap();

    assert!(probe.peak() <= 3, "peak concurrency {} exceeded limit", probe.peak());
    assert!(probe.peak() >= 2, "tasks never overlapped");

    let results = server.results();
    let failed = results
        .iter()
        .filter(|r| r.status == TaskResultStatus::Failed)
        .count();
    let completed = results
        .iter()
        .filter(|r| r.status == TaskResultStatus::Completed)
        .count();
    assert_eq!(failed, 4);
    assert_eq!(completed, 8);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn long_running_task_round_trips_through_in_progress() {
    let server = Arc::new(InMemoryTaskServer::new());
    server.enqueue(Task::new("t1", "wf", "warmup").with_poll_count(1));

    let worker = Worker::new_async("warmup", |ctx, _task| async move {
        if ctx.poll_count() < 3 {
            Ok(TaskOutcome::in_progress(30))
        } else {
            Ok(TaskOutcome::Value(json!({"done": true})))
        }
    })
    .with_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(50)));

    let mut runner = BatchTaskRunner::new(worker, vec![target(&server)], RunnerConfig::default());
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while server.results().len() < 3 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop();
    join.await.unwrap();

    let results = server.results();
    let statuses: Vec<_> = results.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        vec![
            TaskResultStatus::InProgress,
            TaskResultStatus::InProgress,
            TaskResultStatus::Completed,
        ]
    );
    assert_eq!(results[0].callback_after_seconds, Some(30));
    assert_eq!(results[1].callback_after_seconds, Some(30));
    assert_eq!(results[2].callback_after_seconds, None);
    assert_eq!(results[2].output_data["done"], json!(true));
}

struct LostResultRecorder {
    lost: Mutex<Vec<TaskRunnerEvent>>,
}

impl EventListener for LostResultRecorder {
    fn on_event(&self, event: &TaskRunnerEvent) {
        if matches!(event, TaskRunnerEvent::UpdateFailure { .. }) {
            self.lost.lock().push(event.clone());
        }
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn exhausted_update_retries_emit_one_lost_result_event() {
    let server = Arc::new(InMemoryTaskServer::new());
    server.enqueue(Task::new("t1", "wf", "echo"));
    // Every update attempt fails.
    server.fail_next_updates(64, ClientError::Transport("connection reset".into()));

    let recorder = Arc::new(LostResultRecorder {
        lost: Mutex::new(vec![]),
    });
    let metrics = Arc::new(MetricsListener::new());
    let dispatcher = EventDispatcher::new()
        .with_listener(Arc::clone(&recorder) as _)
        .with_listener(Arc::clone(&metrics) as _);

    let worker = Worker::new_async("echo", |_ctx, _task| async {
        Ok(TaskOutcome::Value(json!(null)))
    })
    .with_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(50)));

    let config = RunnerConfig::default()
        .with_update_retry(UpdateRetryPolicy::new().with_max_attempts(4));
    let mut runner =
        BatchTaskRunner::with_dispatcher(worker, vec![target(&server)], config, dispatcher);
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while recorder.lost.lock().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop();
    join.await.unwrap();

    // Exactly the configured number of attempts, then exactly one event
    // carrying the original result.
    assert_eq!(server.update_calls(), 4);
    let lost = recorder.lost.lock();
    assert_eq!(lost.len(), 1);
    match &lost[0] {
        TaskRunnerEvent::UpdateFailure { lost_result, .. } => {
            assert_eq!(lost_result.task_id, "t1");
            assert_eq!(lost_result.status, TaskResultStatus::Completed);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(metrics.snapshot().update_failures, 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn open_circuit_delays_polling_until_reset_window() {
    let server = Arc::new(InMemoryTaskServer::new());
    server.enqueue(Task::new("t1", "wf", "echo"));
    // Three consecutive failures open the circuit.
    server.fail_next_polls(3, ClientError::Transport("unreachable".into()));

    let worker = Worker::new_async("echo", |_ctx, _task| async {
        Ok(TaskOutcome::Value(json!(null)))
    })
    .with_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    let mut runner = BatchTaskRunner::new(worker, vec![target(&server)], RunnerConfig::default());
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while server.results().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started.elapsed();
    handle.stop();
    join.await.unwrap();

    // The successful probe could only happen after the 30s reset window.
    assert!(
        elapsed >= Duration::from_secs(30),
        "task completed after {elapsed:?}, before the circuit reset window"
    );
    assert_eq!(server.results()[0].task_id, "t1");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn auth_failure_backs_polling_off() {
    let server = Arc::new(InMemoryTaskServer::new());
    server.enqueue(Task::new("t1", "wf", "echo"));
    server.fail_next_poll(ClientError::Authorization("token expired".into()));

    let worker = Worker::new_async("echo", |_ctx, _task| async {
        Ok(TaskOutcome::Value(json!(null)))
    })
    .with_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(100)));

    let started = tokio::time::Instant::now();
    let mut runner = BatchTaskRunner::new(worker, vec![target(&server)], RunnerConfig::default());
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while server.results().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let elapsed = started.elapsed();
    handle.stop();
    join.await.unwrap();

    // One auth failure suppresses the target for 2^1 seconds.
    assert!(
        elapsed >= Duration::from_secs(2),
        "task completed after {elapsed:?}, inside the auth backoff window"
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn multi_homed_worker_drains_both_servers() {
    let a = Arc::new(InMemoryTaskServer::new());
    let b = Arc::new(InMemoryTaskServer::new());
    for i in 0..3 {
        a.enqueue(Task::new(format!("a{i}"), "wf", "echo"));
        b.enqueue(Task::new(format!("b{i}"), "wf", "echo"));
    }

    let worker = Worker::new_async("echo", |_ctx, _task| async {
        Ok(TaskOutcome::Value(json!(null)))
    })
    .with_options(
        WorkerOptions::new()
            .with_concurrency(4)
            .with_poll_interval(Duration::from_millis(100)),
    );

    let mut runner = BatchTaskRunner::new(
        worker,
        vec![target(&a), target(&b)],
        RunnerConfig::default(),
    );
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while a.results().len() + b.results().len() < 6 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop();
    join.await.unwrap();

    // Results went back to the server the task came from.
    assert!(a.results().iter().all(|r| r.task_id.starts_with('a')));
    assert!(b.results().iter().all(|r| r.task_id.starts_with('b')));
    assert!(a.poll_calls() > 0 && b.poll_calls() > 0);
}

struct SequenceRecorder {
    kinds: Mutex<Vec<&'static str>>,
}

impl EventListener for SequenceRecorder {
    fn on_event(&self, event: &TaskRunnerEvent) {
        let kind = match event {
            TaskRunnerEvent::PollStarted { .. } => "poll_started",
            TaskRunnerEvent::PollCompleted { .. } => "poll_completed",
            TaskRunnerEvent::PollFailure { .. } => "poll_failure",
            TaskRunnerEvent::ExecutionStarted { .. } => "execution_started",
            TaskRunnerEvent::ExecutionCompleted { .. } => "execution_completed",
            TaskRunnerEvent::ExecutionFailure { .. } => "execution_failure",
            TaskRunnerEvent::UpdateFailure { .. } => "update_failure",
        };
        self.kinds.lock().push(kind);
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn lifecycle_events_arrive_in_order() {
    let server = Arc::new(InMemoryTaskServer::new());
    server.enqueue(Task::new("t1", "wf", "echo"));

    let recorder = Arc::new(SequenceRecorder {
        kinds: Mutex::new(vec![]),
    });
    let dispatcher = EventDispatcher::new().with_listener(Arc::clone(&recorder) as _);

    let worker = Worker::new_async("echo", |_ctx, _task| async {
        Ok(TaskOutcome::Value(json!(null)))
    })
    .with_options(WorkerOptions::new().with_poll_interval(Duration::from_millis(50)));

    let mut runner = BatchTaskRunner::with_dispatcher(
        worker,
        vec![target(&server)],
        RunnerConfig::default(),
        dispatcher,
    );
    let handle = runner.handle();
    let join = tokio::spawn(async move { runner.run().await });

    while server.results().is_empty() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    handle.stop();
    join.await.unwrap();

    let kinds = recorder.kinds.lock();
    let pos = |needle: &str| kinds.iter().position(|k| *k == needle);

    let poll_started = pos("poll_started").expect("no poll_started event");
    let execution_started = pos("execution_started").expect("no execution_started event");
    let execution_completed = pos("execution_completed").expect("no execution_completed event");

    assert!(poll_started < execution_started);
    assert!(execution_started < execution_completed);
    assert!(!kinds.contains(&"execution_failure"));
    assert!(!kinds.contains(&"update_failure"));
}
