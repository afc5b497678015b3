//! Retry schedule for result updates

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry schedule applied to the update call after an execution.
///
/// The delay grows with the attempt number: attempt `n` waits
/// `base_delay * n` before the next try, so a default policy of 4
/// attempts with a 10s base waits 10s, 20s, 30s between tries.
/// Exhausting the schedule is a lost-result condition surfaced as an
/// event; it never stops the runner.
///
/// # Example
///
/// ```
/// use conveyor::reliability::UpdateRetryPolicy;
/// use std::time::Duration;
///
/// let policy = UpdateRetryPolicy::default()
///     .with_max_attempts(3)
///     .with_base_delay(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdateRetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Delay unit multiplied by the attempt number
    #[serde(with = "duration_millis")]
    pub base_delay: Duration,

    /// Jitter factor (0.0-1.0) to add randomness between workers
    pub jitter: f64,
}

impl Default for UpdateRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_secs(10),
            jitter: 0.0,
        }
    }
}

impl UpdateRetryPolicy {
    /// Create the default policy
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum number of attempts
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the base delay
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_secs_f64() * attempt as f64;

        let jittered = if self.jitter > 0.0 {
            let mut rng = rand::thread_rng();
            let range = base * self.jitter;
            (base + rng.gen_range(-range..range)).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }

    /// Whether another attempt is allowed after `attempts` tries.
    pub fn has_attempts_remaining(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let policy = UpdateRetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, Duration::from_secs(10));
        assert_eq!(policy.jitter, 0.0);
    }

    #[test]
    fn test_delay_grows_with_attempt() {
        let policy = UpdateRetryPolicy::default();
        assert_eq!(policy.delay_after_attempt(1), Duration::from_secs(10));
        assert_eq!(policy.delay_after_attempt(2), Duration::from_secs(20));
        assert_eq!(policy.delay_after_attempt(3), Duration::from_secs(30));
    }

    #[test]
    fn test_attempts_remaining() {
        let policy = UpdateRetryPolicy::default().with_max_attempts(2);
        assert!(policy.has_attempts_remaining(1));
        assert!(!policy.has_attempts_remaining(2));
    }

    #[test]
    fn test_jitter_stays_near_base() {
        let policy = UpdateRetryPolicy::default()
            .with_base_delay(Duration::from_secs(10))
            .with_jitter(0.1);

        for _ in 0..20 {
            let delay = policy.delay_after_attempt(1).as_secs_f64();
            assert!((9.0..=11.0).contains(&delay));
        }
    }

    #[test]
    fn test_serialization() {
        let policy = UpdateRetryPolicy::default().with_max_attempts(7);
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: UpdateRetryPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, parsed);
    }
}
