//! dispatch-forge: priority job scheduling onto a pool of remote workers.
//!
//! This library provides a priority job queue, a capability-aware worker
//! pool, a supervisor that dispatches and retries jobs through an external
//! dispatcher, and an advisory slot optimizer.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod scheduler;
pub mod storage;

// Re-export commonly used types
pub use config::{ConfigError, OrchestratorConfig};
pub use error::{ErrorCode, SchedulerError};
pub use orchestrator::Orchestrator;
pub use storage::{JobStore, StoreError};
