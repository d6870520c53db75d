//! Metrics module for Prometheus-based monitoring.
//!
//! Scheduler events are turned into metrics by sinks subscribed to the
//! [`EventBus`](crate::scheduler::EventBus).
//!
//! # Example
//!
//! ```ignore
//! use dispatch_forge::metrics::{init_metrics, export_metrics, spawn_sink, PrometheusSink};
//!
//! // Initialize metrics on startup
//! init_metrics().expect("Failed to initialize metrics");
//!
//! // Feed scheduler events into the registry
//! let handle = spawn_sink(&events, PrometheusSink::new());
//!
//! // Export metrics for Prometheus scraping
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;
pub mod sink;

// Re-export key types for convenient access
pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
pub use sink::{spawn_sink, MetricsSink, PrometheusSink, TracingSink};

// Re-export metric constants for direct access when needed
pub use prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, JOBS_ENQUEUED_TOTAL, JOBS_FINISHED_TOTAL, JOBS_IN_PROGRESS, JOB_DURATION,
    JOB_WAIT, PENDING_RETRIES, QUEUE_DEPTH, REGISTRY, SLOT_UTILIZATION, WORKERS_TOTAL, WORKER_EVENTS_TOTAL,
};
