//! Server target with private failure bookkeeping

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::{PollClient, UpdateClient};

/// Thresholds and windows for per-target failure handling.
///
/// # State machine
///
/// ```text
/// poll failure  ──► consecutive_failures += 1
///                      │ reaches failure_threshold
///                      ▼
///                circuit open for reset_window ──► next attempt is the
///                (target skipped entirely)         half-open probe
///
/// auth failure  ──► auth_failures += 1, polls suppressed for
///                   2^auth_failures seconds (capped)
///
/// any success   ──► both counters reset
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResilienceConfig {
    /// Consecutive poll failures required to open the circuit
    pub failure_threshold: u32,

    /// How long an open circuit suppresses the target
    #[serde(with = "duration_millis")]
    pub reset_window: Duration,

    /// Ceiling on the auth-failure backoff window
    #[serde(with = "duration_millis")]
    pub auth_backoff_cap: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_window: Duration::from_secs(30),
            auth_backoff_cap: Duration::from_secs(60),
        }
    }
}

impl ResilienceConfig {
    /// Create the default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the circuit-opening failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set the open-circuit window
    pub fn with_reset_window(mut self, window: Duration) -> Self {
        self.reset_window = window;
        self
    }

    /// Set the auth-backoff ceiling
    pub fn with_auth_backoff_cap(mut self, cap: Duration) -> Self {
        self.auth_backoff_cap = cap;
        self
    }
}

#[derive(Debug, Default)]
struct TargetState {
    auth_failures: u32,
    last_auth_failure_at: Option<Instant>,
    consecutive_failures: u32,
    circuit_open_until: Option<Instant>,
}

/// One remote server endpoint plus its private resilience state.
///
/// A worker may be configured against several targets ("multi-homed");
/// each keeps its own failure bookkeeping, mutated only by the cycle
/// that owns the worker. Suppression checks are cheap and race-free, so
/// concurrent poll rounds across targets never block each other.
pub struct ServerTarget {
    name: String,
    poll: Arc<dyn PollClient>,
    update: Arc<dyn UpdateClient>,
    config: ResilienceConfig,
    state: Mutex<TargetState>,
}

impl ServerTarget {
    /// Create a target over the given clients.
    pub fn new(
        name: impl Into<String>,
        poll: Arc<dyn PollClient>,
        update: Arc<dyn UpdateClient>,
    ) -> Self {
        Self {
            name: name.into(),
            poll,
            update,
            config: ResilienceConfig::default(),
            state: Mutex::new(TargetState::default()),
        }
    }

    /// Override the resilience configuration.
    pub fn with_config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// The target's display name (endpoint label)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn poll_client(&self) -> Arc<dyn PollClient> {
        Arc::clone(&self.poll)
    }

    pub(crate) fn update_client(&self) -> Arc<dyn UpdateClient> {
        Arc::clone(&self.update)
    }

    /// Whether polls to this target are currently suppressed, either by
    /// an open circuit or by auth backoff.
    pub fn is_suppressed(&self, now: Instant) -> bool {
        let state = self.state.lock();

        if let Some(until) = state.circuit_open_until {
            if now < until {
                return true;
            }
        }

        if state.auth_failures > 0 {
            if let Some(at) = state.last_auth_failure_at {
                let exp = state.auth_failures.min(32);
                let backoff = Duration::from_secs(1u64 << exp.min(20))
                    .min(self.config.auth_backoff_cap);
                if now < at + backoff {
                    return true;
                }
            }
        }

        false
    }

    /// Record a successful call; resets all failure bookkeeping.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.auth_failures > 0 || state.consecutive_failures > 0 {
            debug!(target_name = %self.name, "server target recovered");
        }
        state.auth_failures = 0;
        state.last_auth_failure_at = None;
        state.consecutive_failures = 0;
        state.circuit_open_until = None;
    }

    /// Record an authorization failure; suppresses polls to this target
    /// for `2^auth_failures` seconds, capped.
    pub fn record_auth_failure(&self) {
        let mut state = self.state.lock();
        state.auth_failures = state.auth_failures.saturating_add(1);
        state.last_auth_failure_at = Some(Instant::now());
        warn!(
            target_name = %self.name,
            auth_failures = state.auth_failures,
            "authorization failure, backing off"
        );
    }

    /// Record a non-auth poll failure; opens the circuit once the
    /// consecutive count reaches the threshold.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= self.config.failure_threshold {
            state.circuit_open_until = Some(Instant::now() + self.config.reset_window);
            warn!(
                target_name = %self.name,
                consecutive_failures = state.consecutive_failures,
                reset_window_ms = self.config.reset_window.as_millis() as u64,
                "circuit opened"
            );
        }
    }

    /// Current auth failure count
    pub fn auth_failure_count(&self) -> u32 {
        self.state.lock().auth_failures
    }

    /// Current consecutive poll failure count
    pub fn consecutive_failure_count(&self) -> u32 {
        self.state.lock().consecutive_failures
    }
}

impl std::fmt::Debug for ServerTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ServerTarget")
            .field("name", &self.name)
            .field("auth_failures", &state.auth_failures)
            .field("consecutive_failures", &state.consecutive_failures)
            .field("circuit_open", &state.circuit_open_until.is_some())
            .finish()
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
