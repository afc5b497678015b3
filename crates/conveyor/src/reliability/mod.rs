//! Per-server resilience
//!
//! This module provides:
//! - [`ServerTarget`] - one server endpoint plus its private failure
//!   bookkeeping (circuit breaker, auth backoff)
//! - [`ResilienceConfig`] - thresholds and windows for that bookkeeping
//! - [`UpdateRetryPolicy`] - local retry schedule for result updates

mod retry;
mod target;

pub use retry::UpdateRetryPolicy;
pub use target::{ResilienceConfig, ServerTarget};
