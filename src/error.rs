//! Error types shared across the orchestration core.
//!
//! Each subsystem defines its own error enum next to the code that raises it
//! (`QueueError`, `PoolError`, `DispatchError`, `StoreError`, `ConfigError`).
//! This module ties them together:
//!
//! - `ErrorCode`: the stable discriminator carried by errors and failure events
//! - `SchedulerError`: the top-level error returned by orchestration entry points

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::scheduler::dispatch::DispatchError;
use crate::scheduler::queue::QueueError;
use crate::scheduler::worker_pool::PoolError;
use crate::storage::StoreError;

/// Machine-readable discriminator for every failure the core can surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    CapacityExceeded,
    InvalidPriority,
    InvalidJob,
    DuplicateJob,
    JobNotFound,
    JobExpired,
    NoAvailableWorker,
    PoolAtCapacity,
    InvalidWorker,
    WorkerNotFound,
    WorkerUnhealthy,
    DispatchFailed,
    JobTimedOut,
    StorageFailed,
    InvalidConfig,
    ShutdownTimeout,
}

impl ErrorCode {
    /// Returns the code as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::CapacityExceeded => "CapacityExceeded",
            ErrorCode::InvalidPriority => "InvalidPriority",
            ErrorCode::InvalidJob => "InvalidJob",
            ErrorCode::DuplicateJob => "DuplicateJob",
            ErrorCode::JobNotFound => "JobNotFound",
            ErrorCode::JobExpired => "JobExpired",
            ErrorCode::NoAvailableWorker => "NoAvailableWorker",
            ErrorCode::PoolAtCapacity => "PoolAtCapacity",
            ErrorCode::InvalidWorker => "InvalidWorker",
            ErrorCode::WorkerNotFound => "WorkerNotFound",
            ErrorCode::WorkerUnhealthy => "WorkerUnhealthy",
            ErrorCode::DispatchFailed => "DispatchFailed",
            ErrorCode::JobTimedOut => "JobTimedOut",
            ErrorCode::StorageFailed => "StorageFailed",
            ErrorCode::InvalidConfig => "InvalidConfig",
            ErrorCode::ShutdownTimeout => "ShutdownTimeout",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error for orchestration entry points.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Running jobs did not finish before the shutdown deadline.
    #[error("Shutdown timed out after {timeout:?} with {remaining} job(s) still running")]
    ShutdownTimeout { timeout: Duration, remaining: usize },
}

impl SchedulerError {
    /// Returns the discriminator for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            SchedulerError::Queue(e) => e.code(),
            SchedulerError::Pool(e) => e.code(),
            SchedulerError::Dispatch(e) => e.code(),
            SchedulerError::Store(_) => ErrorCode::StorageFailed,
            SchedulerError::Config(_) => ErrorCode::InvalidConfig,
            SchedulerError::ShutdownTimeout { .. } => ErrorCode::ShutdownTimeout,
        }
    }
}
