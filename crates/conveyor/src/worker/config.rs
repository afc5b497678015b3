//! Worker option resolution

use std::time::Duration;

use tracing::warn;

/// Environment variable prefix for worker overrides.
///
/// Per-task overrides use `CONVEYOR_WORKER_<TASKNAME>_<PROP>`, generic
/// overrides `CONVEYOR_WORKER_<PROP>`. Recognized properties:
/// `POLL_INTERVAL_MILLIS`, `CONCURRENCY`, `DOMAIN`, `PAUSED`,
/// `LEASE_EXTENSION`.
pub(crate) const ENV_PREFIX: &str = "CONVEYOR_WORKER";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_CONCURRENCY: usize = 1;

/// Partially-specified worker options.
///
/// Each unset field is resolved from the environment (per-task override
/// first, then the generic one) and finally from the built-in default.
/// An explicit value set here always wins.
///
/// # Example
///
/// ```
/// use conveyor::worker::WorkerOptions;
/// use std::time::Duration;
///
/// let config = WorkerOptions::new()
///     .with_concurrency(8)
///     .with_poll_interval(Duration::from_millis(250))
///     .resolve("process_order");
/// assert_eq!(config.concurrency, 8);
/// ```
#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    pub poll_interval: Option<Duration>,
    pub concurrency: Option<usize>,
    pub domain: Option<String>,
    pub paused: Option<bool>,
    pub lease_extension: Option<bool>,
}

impl WorkerOptions {
    /// Create options with every field unset
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the poll interval explicitly
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    /// Set the concurrency limit explicitly
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency.max(1));
        self
    }

    /// Set the polling domain explicitly
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    /// Set the paused flag explicitly
    pub fn with_paused(mut self, paused: bool) -> Self {
        self.paused = Some(paused);
        self
    }

    /// Set the lease-extension flag explicitly
    pub fn with_lease_extension(mut self, enabled: bool) -> Self {
        self.lease_extension = Some(enabled);
        self
    }

    /// Resolve every field for the given task definition name.
    pub fn resolve(&self, task_def_name: &str) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self
                .poll_interval
                .or_else(|| env_parsed(task_def_name, "POLL_INTERVAL_MILLIS", parse_millis))
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            concurrency: self
                .concurrency
                .or_else(|| env_parsed(task_def_name, "CONCURRENCY", parse_concurrency))
                .unwrap_or(DEFAULT_CONCURRENCY),
            domain: self
                .domain
                .clone()
                .or_else(|| env_parsed(task_def_name, "DOMAIN", |s| Some(s.to_string()))),
            paused: self
                .paused
                .or_else(|| env_parsed(task_def_name, "PAUSED", parse_bool))
                .unwrap_or(false),
            lease_extension: self
                .lease_extension
                .or_else(|| env_parsed(task_def_name, "LEASE_EXTENSION", parse_bool))
                .unwrap_or(false),
        }
    }
}

/// Fully-resolved worker configuration, immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Upper bound on the pacing of polls when the queue is idle
    pub poll_interval: Duration,

    /// Maximum concurrent task executions for this worker
    pub concurrency: usize,

    /// Optional routing tag restricting which task pool is polled
    pub domain: Option<String>,

    /// A paused worker keeps running but never polls
    pub paused: bool,

    /// Report liveness to the server while long tasks execute
    pub lease_extension: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            concurrency: DEFAULT_CONCURRENCY,
            domain: None,
            paused: false,
            lease_extension: false,
        }
    }
}

/// Look up a property with per-task precedence over the generic key,
/// parsing with `parse`. An unparseable per-task value falls through to
/// the generic key, and an unparseable generic value to the default.
fn env_parsed<T>(task_def_name: &str, prop: &str, parse: fn(&str) -> Option<T>) -> Option<T> {
    for key in [
        format!("{}_{}_{}", ENV_PREFIX, sanitize(task_def_name), prop),
        format!("{ENV_PREFIX}_{prop}"),
    ] {
        if let Ok(raw) = std::env::var(&key) {
            match parse(&raw) {
                Some(value) => return Some(value),
                None => warn!(%key, value = %raw, "ignoring unparseable worker override"),
            }
        }
    }
    None
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn parse_millis(raw: &str) -> Option<Duration> {
    raw.trim().parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_concurrency(raw: &str) -> Option<usize> {
    raw.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}
