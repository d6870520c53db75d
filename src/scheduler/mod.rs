//! Priority scheduling of jobs onto a pool of remote workers.
//!
//! This module provides the orchestration core:
//!
//! - **PriorityJobQueue**: four priority tiers, FIFO within a tier, TTL expiry
//! - **WorkerPool**: capability-aware, least-loaded assignment with heartbeat health
//! - **Supervisor**: polling loop that dispatches, retries and reports
//! - **SlotOptimizer**: advisory utilization tracking and recommendations
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Producer   │
//!                      │  (API/CLI)   │
//!                      └──────┬───────┘
//!                             │ enqueue
//!                      ┌──────▼───────┐        ┌──────────────┐
//!                      │ Priority Job │◄───────│ Redis mirror │
//!                      │    Queue     │ reload │  (optional)  │
//!                      └──────┬───────┘        └──────────────┘
//!                             │ dequeue (capability filtered)
//!                      ┌──────▼───────┐        ┌──────────────┐
//!                      │  Supervisor  │───────►│ Delay queue  │
//!                      │  (poll tick) │◄───────│  (retries)   │
//!                      └──────┬───────┘        └──────────────┘
//!                             │ assign
//!         ┌───────────────────┼───────────────────┐
//!         │                   │                   │
//!         ▼                   ▼                   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └────┬────┘         └────┬────┘         └────┬────┘
//!         └───────────────────┼───────────────────┘
//!                             ▼
//!                  ExternalDispatcher (trigger + poll)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use dispatch_forge::scheduler::{
//!     DispatchRequest, DryRunDispatcher, EventBus, PriorityJobQueue, QueueConfig,
//!     Supervisor, SupervisorConfig, WorkerPool, WorkerPoolConfig,
//! };
//! use std::sync::Arc;
//! use tokio::sync::Mutex;
//!
//! let events = EventBus::default();
//! let queue = Arc::new(Mutex::new(PriorityJobQueue::new(QueueConfig::default(), events.clone())));
//! let pool = Arc::new(Mutex::new(WorkerPool::new(WorkerPoolConfig::default(), events.clone())));
//! let supervisor = Supervisor::new(
//!     SupervisorConfig::default(),
//!     queue,
//!     pool,
//!     Arc::new(DryRunDispatcher::new()),
//!     events,
//! );
//!
//! supervisor
//!     .dispatch_job(DispatchRequest::new("org/app", "ci.yml").with_priority("high"))
//!     .await?;
//! let report = supervisor.tick().await;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic assignment**: dequeue and assign happen under the queue and pool locks
//! - **Backoff retries**: failed dispatches re-enter the queue after `delay * 2^n`
//! - **Health eviction**: jobs on evicted workers are failed over to the retry path
//! - **Graceful shutdown**: running jobs are awaited and the queue is persisted

pub mod dispatch;
pub mod events;
pub mod job;
pub mod queue;
pub mod retry;
pub mod slot_optimizer;
pub mod supervisor;
pub mod worker_pool;

// Re-export main types for convenience
pub use dispatch::{
    DispatchError, DryRunDispatcher, ExternalDispatcher, RunConclusion, RunState, RunStatus, TriggerReceipt,
    TriggerRequest,
};
pub use events::{EventBus, SchedulerEvent, DEFAULT_EVENT_CAPACITY};
pub use job::{Job, JobOutcome, JobRecord, JobSubmission, Priority};
pub use queue::{PriorityJobQueue, QueueConfig, QueueError, QueueMetrics, TierCounts};
pub use retry::{DelayQueue, RetryPolicy};
pub use slot_optimizer::{
    AllocationEfficiency, BundleCandidate, BundlePlan, Confidence, CostEfficiency, DemandPrediction,
    Recommendation, RecommendationKind, SlotAllocation, SlotOptimizer, SlotOptimizerConfig, UtilizationReport,
    UtilizationStatus,
};
pub use supervisor::{
    DispatchRequest, Supervisor, SupervisorConfig, SupervisorMetrics, SupervisorReport, SupervisorStats,
    TickReport, WORKFLOW_JOB_TYPE,
};
pub use worker_pool::{
    Assignment, HealthReport, PoolError, PoolMetrics, UnregisterOutcome, Worker, WorkerPool, WorkerPoolConfig,
    WorkerSpec, WorkerStatus,
};
