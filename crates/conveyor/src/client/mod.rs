//! Client traits for talking to the orchestration server
//!
//! Transport and wire format live outside this crate. The engine only
//! sees these traits; implementations must be thread-safe and support
//! concurrent calls.

mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::task::{Task, TaskResult};

pub use memory::InMemoryTaskServer;

/// Error type for client operations
///
/// The resilience layer keys off the variant: authorization failures
/// drive per-server auth backoff, everything else feeds the circuit
/// breaker.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// The server rejected the caller's credentials
    #[error("authorization failed: {0}")]
    Authorization(String),

    /// The request never produced a server response
    #[error("transport error: {0}")]
    Transport(String),

    /// The server answered with an error status
    #[error("server error (status {status}): {message}")]
    Server { status: u16, message: String },

    /// A payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ClientError {
    /// Whether this is an authorization failure
    pub fn is_authorization(&self) -> bool {
        matches!(self, Self::Authorization(_))
    }

    /// Whether retrying the same call later could plausibly succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Server { .. })
    }
}

/// Poll side of the server API.
#[async_trait]
pub trait PollClient: Send + Sync + 'static {
    /// Fetch up to `count` tasks of the given type.
    ///
    /// May return fewer tasks than requested, or none. `timeout` is the
    /// server-side long-poll hint; the engine enforces its own ceiling
    /// on top of it.
    async fn batch_poll(
        &self,
        task_type: &str,
        worker_id: &str,
        count: usize,
        timeout: Duration,
        domain: Option<&str>,
    ) -> Result<Vec<Task>, ClientError>;
}

/// Update side of the server API.
#[async_trait]
pub trait UpdateClient: Send + Sync + 'static {
    /// Report a result. May hand back a chained next task for this
    /// worker, saving a poll round trip.
    async fn update(&self, result: &TaskResult) -> Result<Option<Task>, ClientError>;

    /// Report a result without asking for a chained task.
    async fn update_v1(&self, result: &TaskResult) -> Result<(), ClientError> {
        self.update(result).await.map(|_| ())
    }
}

/// Task-definition registration, best effort.
///
/// Failures are logged by callers and never reach the runner loop.
#[async_trait]
pub trait MetadataClient: Send + Sync + 'static {
    /// Register a task definition by name.
    async fn register_task_def(&self, name: &str) -> Result<(), ClientError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_detection() {
        assert!(ClientError::Authorization("no token".into()).is_authorization());
        assert!(!ClientError::Transport("refused".into()).is_authorization());
    }

    #[test]
    fn test_transient_detection() {
        assert!(ClientError::Transport("reset".into()).is_transient());
        assert!(ClientError::Server {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
        assert!(!ClientError::Serialization("bad json".into()).is_transient());
        assert!(!ClientError::Authorization("expired".into()).is_transient());
    }
}
