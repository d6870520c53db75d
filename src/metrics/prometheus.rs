//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by dispatch_forge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all dispatch_forge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Jobs admitted to the queue, labeled by priority.
pub static JOBS_ENQUEUED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job outcomes, labeled by outcome (completed, failed, retried, expired).
pub static JOBS_FINISHED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Attempt duration in seconds, from dispatch to completion.
pub static JOB_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Time spent queued in seconds, labeled by priority.
pub static JOB_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs in the queue.
pub static QUEUE_DEPTH: OnceLock<Gauge> = OnceLock::new();

/// Number of jobs currently dispatched.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Number of retries waiting for their backoff.
pub static PENDING_RETRIES: OnceLock<Gauge> = OnceLock::new();

/// Number of workers able to take a job.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Number of registered workers.
pub static WORKERS_TOTAL: OnceLock<Gauge> = OnceLock::new();

/// Worker lifecycle transitions, labeled by event.
pub static WORKER_EVENTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Advisory alerts raised, labeled by kind.
pub static ALERTS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Last sampled slot utilization (0.0 - 1.0).
pub static SLOT_UTILIZATION: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Repeated calls leave the first registration in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric creation or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Job metrics
    let jobs_enqueued_total = CounterVec::new(
        Opts::new("dispatch_forge_jobs_enqueued_total", "Total jobs admitted to the queue"),
        &["priority"],
    )?;

    let jobs_finished_total = CounterVec::new(
        Opts::new("dispatch_forge_jobs_finished_total", "Total job outcomes"),
        &["outcome"],
    )?;

    let job_duration = Histogram::with_opts(
        HistogramOpts::new("dispatch_forge_job_duration_seconds", "Job attempt duration in seconds")
            .buckets(vec![1.0, 10.0, 30.0, 60.0, 180.0, 300.0, 600.0, 1800.0]),
    )?;

    let job_wait = HistogramVec::new(
        HistogramOpts::new("dispatch_forge_job_wait_seconds", "Time jobs spend queued in seconds")
            .buckets(vec![0.1, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0]),
        &["priority"],
    )?;

    // Queue metrics
    let queue_depth = Gauge::new("dispatch_forge_queue_depth", "Number of jobs in queue")?;

    let jobs_in_progress = Gauge::new(
        "dispatch_forge_jobs_in_progress",
        "Number of jobs currently dispatched",
    )?;

    let pending_retries = Gauge::new(
        "dispatch_forge_pending_retries",
        "Number of retries waiting for backoff",
    )?;

    // Worker metrics
    let active_workers = Gauge::new("dispatch_forge_active_workers", "Number of available workers")?;
    let workers_total = Gauge::new("dispatch_forge_workers_total", "Number of registered workers")?;

    let worker_events_total = CounterVec::new(
        Opts::new("dispatch_forge_worker_events_total", "Worker lifecycle transitions"),
        &["event"],
    )?;

    // Advisory metrics
    let alerts_total = CounterVec::new(
        Opts::new("dispatch_forge_alerts_total", "Advisory alerts raised"),
        &["kind"],
    )?;

    let slot_utilization = Gauge::new(
        "dispatch_forge_slot_utilization",
        "Last sampled slot utilization ratio",
    )?;

    // Register all metrics with the registry
    registry.register(Box::new(jobs_enqueued_total.clone()))?;
    registry.register(Box::new(jobs_finished_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(job_wait.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(pending_retries.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(workers_total.clone()))?;
    registry.register(Box::new(worker_events_total.clone()))?;
    registry.register(Box::new(alerts_total.clone()))?;
    registry.register(Box::new(slot_utilization.clone()))?;

    // Store metrics in static variables
    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = JOBS_ENQUEUED_TOTAL.set(jobs_enqueued_total);
    let _ = JOBS_FINISHED_TOTAL.set(jobs_finished_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = JOB_WAIT.set(job_wait);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = PENDING_RETRIES.set(pending_retries);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = WORKERS_TOTAL.set(workers_total);
    let _ = WORKER_EVENTS_TOTAL.set(worker_events_total);
    let _ = ALERTS_TOTAL.set(alerts_total);
    let _ = SLOT_UTILIZATION.set(slot_utilization);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry was never initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
