//! Process supervisor for classic mode
//!
//! Runs one OS process per registered worker, each executing a
//! [`crate::runner::PooledTaskRunner`] loop, and keeps them alive:
//!
//! ```text
//! Starting ──► Running ──► (Crashed ──► Restarting ──► Running)*
//!                │
//!                └──► Stopping ──► Stopped
//! ```
//!
//! Children are the host binary re-executed with a selector environment
//! variable; the host opts in by checking [`supervised_child_worker`]
//! at startup and running the named worker's supervised loop instead of
//! the supervisor. Child stdout is piped back and re-emitted through
//! the parent's logger until the log stream end marker (or EOF).
//!
//! # Example
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     if let Some(task_type) = conveyor::supervisor::supervised_child_worker() {
//!         return run_child(&task_type).await; // PooledTaskRunner::run_supervised
//!     }
//!
//!     let supervisor = ProcessSupervisor::new(registry, SupervisorConfig::default());
//!     supervisor.start()?;
//!     // ...
//!     supervisor.stop().await;
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::worker::WorkerRegistry;

/// Line written to a child's stdin to request a graceful stop.
pub(crate) const STOP_SENTINEL: &str = "__conveyor_stop__";

/// Line a child prints on stdout when its log stream is complete.
pub(crate) const LOG_STREAM_END: &str = "__conveyor_log_stream_end__";

/// Environment variable selecting the worker a child process runs.
pub(crate) const CHILD_WORKER_ENV: &str = "CONVEYOR_SUPERVISED_WORKER";

/// When the current process was launched as a supervised child, the
/// task type it should run. Host binaries check this before starting a
/// supervisor of their own.
pub fn supervised_child_worker() -> Option<String> {
    std::env::var(CHILD_WORKER_ENV).ok()
}

/// Set up logging for a supervised child process.
///
/// Plain lines on stdout, no ANSI codes, so the parent's forwarder can
/// re-emit them verbatim. Safe to call when a subscriber is already
/// installed.
pub fn init_child_logging() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stdout)
        .with_ansi(false)
        .with_target(false)
        .try_init();
}

/// Supervisor configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// How often child liveness is checked
    pub liveness_interval: Duration,

    /// First restart delay after a crash
    pub restart_backoff: Duration,

    /// Ceiling on the restart delay
    pub restart_backoff_cap: Duration,

    /// A child alive this long gets its restart delay reset
    pub backoff_reset_after: Duration,

    /// How long a stopping child may take before it is killed
    pub grace: Duration,

    /// Program and arguments to spawn instead of re-executing the
    /// current binary. Mainly for tests.
    pub command: Option<(PathBuf, Vec<String>)>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            liveness_interval: Duration::from_secs(1),
            restart_backoff: Duration::from_millis(500),
            restart_backoff_cap: Duration::from_secs(30),
            backoff_reset_after: Duration::from_secs(60),
            grace: Duration::from_secs(10),
            command: None,
        }
    }
}

impl SupervisorConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the liveness check interval
    pub fn with_liveness_interval(mut self, interval: Duration) -> Self {
        self.liveness_interval = interval;
        self
    }

    /// Set the initial restart backoff
    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    /// Set the restart backoff ceiling
    pub fn with_restart_backoff_cap(mut self, cap: Duration) -> Self {
        self.restart_backoff_cap = cap;
        self
    }

    /// Set the graceful-stop window
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Spawn the given program instead of re-executing the current
    /// binary
    pub fn with_command(
        mut self,
        program: impl Into<PathBuf>,
        args: impl IntoIterator<Item = String>,
    ) -> Self {
        self.command = Some((program.into(), args.into_iter().collect()));
        self
    }
}

/// Lifecycle phase of one supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Starting,
    Running,
    Crashed,
    Restarting,
    Stopping,
    Stopped,
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Crashed => write!(f, "crashed"),
            Self::Restarting => write!(f, "restarting"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Status of one supervised worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerProcessStatus {
    pub pid: Option<u32>,
    pub alive: bool,
    pub restart_count: u32,
    pub phase: WorkerPhase,
}

impl WorkerProcessStatus {
    fn initial() -> Self {
        Self {
            pid: None,
            alive: false,
            restart_count: 0,
            phase: WorkerPhase::Starting,
        }
    }
}

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The supervisor was already started
    #[error("supervisor is already running")]
    AlreadyRunning,

    /// No workers are registered
    #[error("no workers registered")]
    NoWorkers,
}

/// Keeps one OS process alive per registered worker.
pub struct ProcessSupervisor {
    registry: Arc<WorkerRegistry>,
    config: SupervisorConfig,
    statuses: Arc<RwLock<HashMap<String, WorkerProcessStatus>>>,
    shutdown_tx: watch::Sender<bool>,
    actors: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessSupervisor {
    /// Create a supervisor over the given registry.
    pub fn new(registry: WorkerRegistry, config: SupervisorConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            registry: Arc::new(registry),
            config,
            statuses: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            actors: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one supervised process per worker and begin liveness
    /// monitoring.
    pub fn start(&self) -> Result<(), SupervisorError> {
        if self.registry.is_empty() {
            return Err(SupervisorError::NoWorkers);
        }

        let mut actors = self.actors.lock();
        if !actors.is_empty() {
            return Err(SupervisorError::AlreadyRunning);
        }

        info!(workers = self.registry.len(), "supervisor starting");

        for worker in self.registry.workers() {
            let name = worker.task_def_name().to_string();
            self.statuses
                .write()
                .insert(name.clone(), WorkerProcessStatus::initial());

            let actor = supervise_worker(
                name,
                self.config.clone(),
                Arc::clone(&self.statuses),
                self.shutdown_tx.subscribe(),
            );
            actors.push(tokio::spawn(actor));
        }

        Ok(())
    }

    /// Stop every child gracefully, then kill stragglers.
    pub async fn stop(&self) {
        info!("supervisor stopping");
        let _ = self.shutdown_tx.send(true);

        let actors: Vec<JoinHandle<()>> = {
            let mut guard = self.actors.lock();
            guard.drain(..).collect()
        };
        for actor in actors {
            let _ = actor.await;
        }
        info!("supervisor stopped");
    }

    /// Whether every supervised process is currently alive.
    pub fn is_healthy(&self) -> bool {
        let statuses = self.statuses.read();
        !statuses.is_empty() && statuses.values().all(|s| s.alive)
    }

    /// Per-worker process status, keyed by task type.
    pub fn worker_status(&self) -> HashMap<String, WorkerProcessStatus> {
        self.statuses.read().clone()
    }
}

/// Own one worker's child process: spawn it, watch liveness, restart
/// with capped exponential backoff on crashes, stop it gracefully on
/// shutdown.
async fn supervise_worker(
    name: String,
    config: SupervisorConfig,
    statuses: Arc<RwLock<HashMap<String, WorkerProcessStatus>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut restart_count = 0u32;
    let mut backoff = config.restart_backoff;

    let set_status = |phase: WorkerPhase, pid: Option<u32>, restart_count: u32| {
        statuses.write().insert(
            name.clone(),
            WorkerProcessStatus {
                pid,
                alive: phase == WorkerPhase::Running,
                restart_count,
                phase,
            },
        );
    };

    loop {
        set_status(WorkerPhase::Starting, None, restart_count);

        let mut child = match spawn_child(&name, &config) {
            Ok(child) => child,
            Err(err) => {
                error!(worker = %name, error = %err, "failed to spawn worker process");
                set_status(WorkerPhase::Crashed, None, restart_count);
                if wait_or_shutdown(&mut shutdown_rx, backoff).await {
                    set_status(WorkerPhase::Stopped, None, restart_count);
                    return;
                }
                restart_count += 1;
                backoff = (backoff * 2).min(config.restart_backoff_cap);
                set_status(WorkerPhase::Restarting, None, restart_count);
                continue;
            }
        };

        let pid = child.id();
        info!(worker = %name, pid = ?pid, "worker process started");
        set_status(WorkerPhase::Running, pid, restart_count);

        let mut forwarder = child
            .stdout
            .take()
            .map(|stdout| tokio::spawn(forward_logs(name.clone(), stdout)));

        let spawned_at = Instant::now();
        let mut ticker = tokio::time::interval(config.liveness_interval);
        ticker.tick().await;

        let exited = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match child.try_wait() {
                        Ok(Some(status)) => break Some(status),
                        Ok(None) => {
                            if spawned_at.elapsed() >= config.backoff_reset_after {
                                backoff = config.restart_backoff;
                            }
                        }
                        Err(err) => {
                            error!(worker = %name, error = %err, "liveness check failed");
                            break None;
                        }
                    }
                }
                _ = shutdown_rx.changed() => break None,
            }
        };

        match exited {
            Some(status) if !*shutdown_rx.borrow() => {
                warn!(worker = %name, exit = %status, "worker process exited unexpectedly");
                set_status(WorkerPhase::Crashed, None, restart_count);
                drain_forwarder(&mut forwarder).await;

                if wait_or_shutdown(&mut shutdown_rx, backoff).await {
                    set_status(WorkerPhase::Stopped, None, restart_count);
                    return;
                }
                restart_count += 1;
                backoff = (backoff * 2).min(config.restart_backoff_cap);
                set_status(WorkerPhase::Restarting, None, restart_count);
            }
            Some(_) => {
                // Exited on its own while we were shutting down anyway.
                set_status(WorkerPhase::Stopped, None, restart_count);
                drain_forwarder(&mut forwarder).await;
                return;
            }
            None => {
                set_status(WorkerPhase::Stopping, pid, restart_count);
                graceful_stop(&name, &mut child, config.grace).await;
                set_status(WorkerPhase::Stopped, None, restart_count);
                drain_forwarder(&mut forwarder).await;
                return;
            }
        }
    }
}

fn spawn_child(name: &str, config: &SupervisorConfig) -> std::io::Result<Child> {
    let (program, args) = match &config.command {
        Some((program, args)) => (program.clone(), args.clone()),
        None => (std::env::current_exe()?, Vec::new()),
    };

    Command::new(program)
        .args(args)
        .env(CHILD_WORKER_ENV, name)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
}

/// Write the stop sentinel, give the child its grace window, then kill.
async fn graceful_stop(name: &str, child: &mut Child, grace: Duration) {
    if let Some(stdin) = child.stdin.as_mut() {
        let line = format!("{STOP_SENTINEL}\n");
        let _ = stdin.write_all(line.as_bytes()).await;
        let _ = stdin.flush().await;
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(worker = %name, exit = %status, "worker process stopped"),
        Ok(Err(err)) => error!(worker = %name, error = %err, "wait on stopping worker failed"),
        Err(_) => {
            warn!(worker = %name, "grace period exceeded, killing worker process");
            let _ = child.kill().await;
        }
    }
}

/// Re-emit child stdout lines through the parent logger until the log
/// stream end marker or EOF.
async fn forward_logs(worker: String, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line == LOG_STREAM_END {
            break;
        }
        info!(target: "conveyor::supervised", worker = %worker, "{line}");
    }
}

async fn drain_forwarder(forwarder: &mut Option<JoinHandle<()>>) {
    if let Some(mut handle) = forwarder.take() {
        // The pipe closes once the child is gone; bounded wait in case
        // a grandchild still holds it open.
        if tokio::time::timeout(Duration::from_secs(1), &mut handle)
            .await
            .is_err()
        {
            handle.abort();
        }
    }
}

async fn wait_or_shutdown(shutdown_rx: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return true;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown_rx.changed() => true,
    }
}
