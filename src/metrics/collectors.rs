//! Metric recording helpers for scheduler activity.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and keeps labeling
//! consistent. Every method is a no-op until `init_metrics()` has run.

use super::prometheus::{
    ACTIVE_WORKERS, ALERTS_TOTAL, JOBS_ENQUEUED_TOTAL, JOBS_FINISHED_TOTAL, JOBS_IN_PROGRESS, JOB_DURATION,
    JOB_WAIT, PENDING_RETRIES, QUEUE_DEPTH, SLOT_UTILIZATION, WORKERS_TOTAL, WORKER_EVENTS_TOTAL,
};
use crate::scheduler::SupervisorMetrics;

/// Metrics collector for recording scheduler metrics.
///
/// # Example
///
/// ```ignore
/// use dispatch_forge::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_enqueued("high");
/// collector.record_outcome("completed", Some(42_000));
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a job admitted to the queue.
    pub fn record_enqueued(&self, priority: &str) {
        if let Some(enqueued) = JOBS_ENQUEUED_TOTAL.get() {
            enqueued.with_label_values(&[priority]).inc();
        }

        tracing::trace!(priority = priority, "Recorded enqueue metric");
    }

    /// Record how long a job waited before being dequeued.
    pub fn record_wait(&self, priority: &str, wait_ms: u64) {
        if let Some(job_wait) = JOB_WAIT.get() {
            job_wait
                .with_label_values(&[priority])
                .observe(wait_ms as f64 / 1000.0);
        }
    }

    /// Record a job outcome.
    ///
    /// # Arguments
    ///
    /// * `outcome` - One of "completed", "failed", "retried" or "expired"
    /// * `duration_ms` - Attempt duration, when the job ran
    pub fn record_outcome(&self, outcome: &str, duration_ms: Option<u64>) {
        if let Some(finished) = JOBS_FINISHED_TOTAL.get() {
            finished.with_label_values(&[outcome]).inc();
        }

        if let (Some(histogram), Some(ms)) = (JOB_DURATION.get(), duration_ms) {
            histogram.observe(ms as f64 / 1000.0);
        }

        tracing::trace!(outcome = outcome, duration_ms = ?duration_ms, "Recorded outcome metric");
    }

    /// Record a worker lifecycle transition such as "registered" or "evicted".
    pub fn record_worker_event(&self, event: &str) {
        if let Some(events) = WORKER_EVENTS_TOTAL.get() {
            events.with_label_values(&[event]).inc();
        }
    }

    /// Record an advisory alert.
    pub fn record_alert(&self, kind: &str) {
        if let Some(alerts) = ALERTS_TOTAL.get() {
            alerts.with_label_values(&[kind]).inc();
        }

        tracing::trace!(kind = kind, "Recorded alert metric");
    }

    /// Update gauges from a supervisor metrics snapshot.
    pub fn update_snapshot(&self, metrics: &SupervisorMetrics) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth.set(metrics.queued_jobs as f64);
        }
        if let Some(in_progress) = JOBS_IN_PROGRESS.get() {
            in_progress.set(metrics.active_jobs as f64);
        }
        if let Some(pending) = PENDING_RETRIES.get() {
            pending.set(metrics.pending_retries as f64);
        }
        if let Some(active) = ACTIVE_WORKERS.get() {
            active.set(metrics.available_workers as f64);
        }
        if let Some(total) = WORKERS_TOTAL.get() {
            total.set(metrics.total_workers as f64);
        }

        tracing::trace!(
            queued = metrics.queued_jobs,
            active = metrics.active_jobs,
            workers = metrics.total_workers,
            "Updated snapshot gauges"
        );
    }

    /// Update the slot utilization gauge (0.0 - 1.0).
    pub fn update_slot_utilization(&self, utilization: f64) {
        if let Some(gauge) = SLOT_UTILIZATION.get() {
            gauge.set(utilization);
        }
    }
}
