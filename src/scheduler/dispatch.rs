//! Interface to the external system that actually runs jobs.
//!
//! The scheduler never executes work itself. It hands each job to an
//! [`ExternalDispatcher`] (for example a CI workflow trigger) and, optionally,
//! polls the resulting run until it completes.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::error::ErrorCode;

/// Errors raised while dispatching a job.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    /// The trigger call failed.
    #[error("Failed to trigger '{task}' on {target}: {message}")]
    TriggerFailed {
        target: String,
        task: String,
        message: String,
    },

    /// The run finished without succeeding.
    #[error("Run {run_id} finished with conclusion '{conclusion}'")]
    RunFailed { run_id: String, conclusion: String },

    /// The run did not report completion in time.
    #[error("Run {run_id} did not complete after {attempts} status checks")]
    Timeout { run_id: String, attempts: u32 },

    /// The worker running the job was evicted.
    #[error("Worker {worker_id} was lost while running the job")]
    WorkerLost { worker_id: String },

    /// The target could not be reached or does not exist.
    #[error("Target {target} unavailable: {message}")]
    TargetUnavailable { target: String, message: String },

    /// A status poll failed.
    #[error("Status check for run {run_id} failed: {message}")]
    StatusUnavailable { run_id: String, message: String },
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::Timeout { .. } => ErrorCode::JobTimedOut,
            DispatchError::WorkerLost { .. } => ErrorCode::WorkerUnhealthy,
            _ => ErrorCode::DispatchFailed,
        }
    }

    /// Returns true if the job may be attempted again.
    ///
    /// A timed-out run may still be executing remotely, so it is not retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, DispatchError::Timeout { .. })
    }
}

/// One unit of remote work to start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRequest {
    /// Job being dispatched.
    pub job_id: String,
    /// Repository or endpoint to run on.
    pub target: String,
    /// Workflow or task name.
    pub task_name: String,
    /// Git ref (branch, tag or sha) to run against.
    pub git_ref: String,
    /// Inputs passed through to the task.
    #[serde(default)]
    pub inputs: Value,
}

/// Handle to a started run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerReceipt {
    pub run_id: String,
}

/// Lifecycle state of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
    Completed,
}

/// Final result of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

impl fmt::Display for RunConclusion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunConclusion::Success => write!(f, "success"),
            RunConclusion::Failure => write!(f, "failure"),
            RunConclusion::Cancelled => write!(f, "cancelled"),
            RunConclusion::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// Snapshot of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStatus {
    pub state: RunState,
    #[serde(default)]
    pub conclusion: Option<RunConclusion>,
}

impl RunStatus {
    pub fn running() -> Self {
        Self {
            state: RunState::Running,
            conclusion: None,
        }
    }

    pub fn completed(conclusion: RunConclusion) -> Self {
        Self {
            state: RunState::Completed,
            conclusion: Some(conclusion),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    pub fn is_success(&self) -> bool {
        self.is_completed() && self.conclusion == Some(RunConclusion::Success)
    }
}

/// External system that runs dispatched jobs.
#[async_trait]
pub trait ExternalDispatcher: Send + Sync {
    /// Starts a run.
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerReceipt, DispatchError>;

    /// Reports the state of a run.
    async fn poll_status(&self, target: &str, run_id: &str) -> Result<RunStatus, DispatchError>;

    /// Checks that a target exists before it is registered.
    async fn verify_target(&self, _target: &str) -> Result<(), DispatchError> {
        Ok(())
    }
}

/// Dispatcher that logs every trigger and reports instant success.
#[derive(Debug, Default, Clone)]
pub struct DryRunDispatcher;

impl DryRunDispatcher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ExternalDispatcher for DryRunDispatcher {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerReceipt, DispatchError> {
        let run_id = format!("dry-run-{}", Uuid::new_v4());
        info!(
            job_id = %request.job_id,
            target = %request.target,
            task = %request.task_name,
            git_ref = %request.git_ref,
            run_id = %run_id,
            "Dry run: would trigger task"
        );
        Ok(TriggerReceipt { run_id })
    }

    async fn poll_status(&self, _target: &str, _run_id: &str) -> Result<RunStatus, DispatchError> {
        Ok(RunStatus::completed(RunConclusion::Success))
    }
}
