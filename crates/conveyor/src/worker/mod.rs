//! Worker definitions and registration
//!
//! This module provides:
//! - [`WorkerOptions`] / [`WorkerConfig`] - layered option resolution
//!   (explicit value, per-task env, generic env, default)
//! - [`Worker`] - one task type's execution capability
//! - [`WorkerRegistry`] - the explicit collection handed to runners and
//!   the supervisor (no process-wide implicit state)

mod config;
mod registry;

pub use config::{WorkerConfig, WorkerOptions};
pub use registry::{TaskHandler, Worker, WorkerRegistry};
