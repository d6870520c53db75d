//! In-memory priority job queue.
//!
//! Jobs live in four fixed tiers (critical, high, normal, low). Dequeue scans
//! the tiers in that order and takes the head of the first non-empty tier, so
//! ordering is strict across tiers and FIFO within a tier.
//!
//! # Capability filtering
//!
//! A filtered dequeue returns the first *matching* job of the highest tier
//! that has one. Non-matching jobs ahead of it stay where they are, so within
//! a tier the order is FIFO among matching jobs only.
//!
//! # Expiry
//!
//! Every job carries an absolute `expires_at`. The periodic sweep evicts
//! expired jobs, and dequeue runs the same sweep first so an expired job is
//! never handed out. Expired jobs are not retried.
//!
//! # Persistence
//!
//! With a [`PersistenceHandle`] attached, admissions and removals are
//! mirrored to the store without awaiting it.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{EventBus, SchedulerEvent};
use super::job::{Job, JobSubmission, Priority};
use crate::error::ErrorCode;
use crate::storage::PersistenceHandle;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue already holds its configured maximum.
    #[error("Queue capacity exceeded (max {max} jobs)")]
    CapacityExceeded { max: usize },

    /// The priority string is not one of the four tiers.
    #[error("Invalid priority '{0}' (expected critical, high, normal or low)")]
    InvalidPriority(String),

    /// The job is malformed.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A job with the same id is already queued.
    #[error("Job {0} is already queued")]
    DuplicateJob(String),

    /// Job not found in the queue.
    #[error("Job {0} not found")]
    JobNotFound(String),
}

impl QueueError {
    pub fn code(&self) -> ErrorCode {
        match self {
            QueueError::CapacityExceeded { .. } => ErrorCode::CapacityExceeded,
            QueueError::InvalidPriority(_) => ErrorCode::InvalidPriority,
            QueueError::InvalidJob(_) => ErrorCode::InvalidJob,
            QueueError::DuplicateJob(_) => ErrorCode::DuplicateJob,
            QueueError::JobNotFound(_) => ErrorCode::JobNotFound,
        }
    }
}

/// Configuration for the priority queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Maximum number of jobs across all tiers.
    pub max_queue_size: usize,
    /// Default time a job may wait before it expires.
    pub max_wait: Duration,
    /// How often the expiry sweep runs.
    pub cleanup_interval: Duration,
    /// Whether jobs are mirrored to a job store.
    pub persistence_enabled: bool,
    /// Key prefix used by the job store.
    pub key_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            max_wait: Duration::from_secs(300), // 5 minutes
            cleanup_interval: Duration::from_secs(60),
            persistence_enabled: false,
            key_prefix: "dispatch".to_string(),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with the given capacity.
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            max_queue_size,
            ..Default::default()
        }
    }

    /// Sets the default max wait.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Sets the sweep interval.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Enables or disables persistence.
    pub fn with_persistence(mut self, enabled: bool) -> Self {
        self.persistence_enabled = enabled;
        self
    }

    /// Sets the store key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }
}

/// Job counts per tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl TierCounts {
    pub fn get(&self, priority: Priority) -> usize {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }

    pub fn total(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

/// The oldest queued job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OldestJob {
    pub id: String,
    pub priority: Priority,
    pub age_ms: u64,
}

/// Point-in-time queue metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    /// Jobs currently queued.
    pub size: usize,
    /// Configured capacity.
    pub max_size: usize,
    /// Queue fill level as a percentage.
    pub utilization: f64,
    /// Jobs per tier.
    pub by_priority: TierCounts,
    /// Jobs admitted since startup.
    pub enqueued: u64,
    /// Jobs handed out since startup.
    pub dequeued: u64,
    /// Jobs evicted by expiry.
    pub expired: u64,
    /// Jobs cancelled with `remove`.
    pub removed: u64,
    /// Mean time between admission and dequeue.
    pub average_wait_ms: f64,
    /// Longest-waiting job, if any.
    pub oldest_job: Option<OldestJob>,
}

impl QueueMetrics {
    /// Total jobs that have left the queue for any reason.
    pub fn total_drained(&self) -> u64 {
        self.dequeued + self.expired + self.removed
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: u64,
    dequeued: u64,
    expired: u64,
    removed: u64,
    total_wait_ms: u64,
}

/// Four-tier priority queue with capability-filtered dequeue and expiry.
pub struct PriorityJobQueue {
    config: QueueConfig,
    tiers: [VecDeque<Job>; 4],
    /// Job id to the tier currently holding it.
    index: HashMap<String, Priority>,
    counters: QueueCounters,
    events: EventBus,
    persistence: Option<PersistenceHandle>,
}

impl PriorityJobQueue {
    /// Creates an empty queue publishing to `events`.
    pub fn new(config: QueueConfig, events: EventBus) -> Self {
        Self {
            config,
            tiers: Default::default(),
            index: HashMap::new(),
            counters: QueueCounters::default(),
            events,
            persistence: None,
        }
    }

    /// Attaches a persistence handle. Ignored unless persistence is enabled.
    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        if self.config.persistence_enabled {
            self.persistence = Some(handle);
        } else {
            debug!("Persistence disabled in queue config, ignoring handle");
        }
        self
    }

    /// Re-saves every queued job through the attached persistence handle.
    ///
    /// Returns the number of jobs sent, zero when persistence is off.
    pub fn persist_all(&self) -> usize {
        let Some(store) = &self.persistence else {
            return 0;
        };
        let mut sent = 0;
        for job in self.iter() {
            store.save(job);
            sent += 1;
        }
        sent
    }

    /// Detaches the persistence handle so its writer can drain and stop.
    pub fn detach_persistence(&mut self) -> Option<PersistenceHandle> {
        self.persistence.take()
    }

    /// Returns the queue configuration.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admits a job at the current time.
    pub fn enqueue(&mut self, job: Job) -> Result<(), QueueError> {
        self.enqueue_at(job, Utc::now())
    }

    /// Validates and admits a producer submission. Returns the job id.
    pub fn submit(&mut self, submission: JobSubmission) -> Result<String, QueueError> {
        let job = submission.into_job()?;
        let id = job.id.clone();
        self.enqueue(job)?;
        Ok(id)
    }

    /// Admits a job, stamping its timestamps relative to `now`.
    ///
    /// # Errors
    ///
    /// - `InvalidJob` for a blank id or type
    /// - `DuplicateJob` if the id is already queued
    /// - `CapacityExceeded` if the queue is full
    pub fn enqueue_at(&mut self, mut job: Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        if job.id.trim().is_empty() {
            return Err(QueueError::InvalidJob("job id cannot be empty".to_string()));
        }
        if job.job_type.trim().is_empty() {
            return Err(QueueError::InvalidJob(format!("job {} has an empty type", job.id)));
        }
        if self.index.contains_key(&job.id) {
            return Err(QueueError::DuplicateJob(job.id));
        }
        if self.is_full() {
            warn!(
                job_id = %job.id,
                max = self.config.max_queue_size,
                "Queue full, rejecting job"
            );
            return Err(QueueError::CapacityExceeded {
                max: self.config.max_queue_size,
            });
        }

        job.stamp(now, self.config.max_wait);
        self.insert_back(job);
        Ok(())
    }

    fn insert_back(&mut self, job: Job) {
        let priority = job.priority;
        self.counters.enqueued += 1;
        self.index.insert(job.id.clone(), priority);
        if let Some(store) = &self.persistence {
            store.save(&job);
        }

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = %priority,
            "Job enqueued"
        );
        let event = SchedulerEvent::JobEnqueued {
            job_id: job.id.clone(),
            job_type: job.job_type.clone(),
            priority,
            queue_size: self.len() + 1,
        };
        self.tiers[priority.index()].push_back(job);
        self.events.publish(event);
    }

    /// Puts a job back at the head of its tier without restamping it.
    ///
    /// Used when a dequeued job could not be placed after all. Bypasses the
    /// capacity check since the slot was only just vacated.
    pub fn requeue_front(&mut self, job: Job) {
        if self.index.contains_key(&job.id) {
            warn!(job_id = %job.id, "Job already queued, not requeueing");
            return;
        }
        self.counters.dequeued = self.counters.dequeued.saturating_sub(1);
        self.index.insert(job.id.clone(), job.priority);
        if let Some(store) = &self.persistence {
            store.save(&job);
        }
        debug!(job_id = %job.id, priority = %job.priority, "Job returned to head of tier");
        self.tiers[job.priority.index()].push_front(job);
    }

    /// Dequeues the next job, optionally restricted to a capability.
    pub fn dequeue(&mut self, capability: Option<&str>) -> Option<Job> {
        self.dequeue_at(capability, Utc::now())
    }

    /// Dequeues the next job as of `now`.
    pub fn dequeue_at(&mut self, capability: Option<&str>, now: DateTime<Utc>) -> Option<Job> {
        self.dequeue_matching_at(
            |job| capability.map_or(true, |cap| job.matches_capability(cap)),
            now,
        )
    }

    /// Dequeues the first job accepted by `predicate`, scanning tiers in
    /// priority order. Expired jobs are swept first.
    pub fn dequeue_matching_at<F>(&mut self, predicate: F, now: DateTime<Utc>) -> Option<Job>
    where
        F: Fn(&Job) -> bool,
    {
        self.sweep_expired_at(now);

        for priority in Priority::ALL {
            let tier = &mut self.tiers[priority.index()];
            let Some(position) = tier.iter().position(|job| predicate(job)) else {
                continue;
            };
            let Some(job) = tier.remove(position) else {
                continue;
            };

            let wait_ms = job.wait_ms(now);
            self.index.remove(&job.id);
            self.counters.dequeued += 1;
            self.counters.total_wait_ms += wait_ms;
            if let Some(store) = &self.persistence {
                store.remove(&job.id);
            }

            debug!(job_id = %job.id, priority = %priority, wait_ms, "Job dequeued");
            self.events.publish(SchedulerEvent::JobDequeued {
                job_id: job.id.clone(),
                priority,
                wait_ms,
            });
            return Some(job);
        }

        None
    }

    /// Removes a queued job. Returns `None` if it is not queued.
    pub fn remove(&mut self, job_id: &str) -> Option<Job> {
        let job = self.take(job_id)?;
        self.counters.removed += 1;
        if let Some(store) = &self.persistence {
            store.remove(job_id);
        }

        info!(job_id = %job_id, priority = %job.priority, "Job removed from queue");
        self.events.publish(SchedulerEvent::JobRemoved {
            job_id: job.id.clone(),
            priority: job.priority,
        });
        Some(job)
    }

    fn take(&mut self, job_id: &str) -> Option<Job> {
        let priority = self.index.remove(job_id)?;
        let tier = &mut self.tiers[priority.index()];
        let position = tier.iter().position(|job| job.id == job_id)?;
        tier.remove(position)
    }

    /// Moves a job to the tail of another tier, keeping its timestamps.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::JobNotFound` if the job is not queued.
    pub fn change_priority(&mut self, job_id: &str, priority: Priority) -> Result<(), QueueError> {
        let from = *self
            .index
            .get(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        if from == priority {
            return Ok(());
        }

        let mut job = self
            .take(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.priority = priority;
        self.index.insert(job.id.clone(), priority);
        if let Some(store) = &self.persistence {
            store.remove(job_id);
            store.save(&job);
        }
        self.tiers[priority.index()].push_back(job);

        info!(job_id = %job_id, from = %from, to = %priority, "Job priority changed");
        self.events.publish(SchedulerEvent::JobPriorityChanged {
            job_id: job_id.to_string(),
            from,
            to: priority,
        });
        Ok(())
    }

    /// Evicts every job expired at the current time.
    pub fn sweep_expired(&mut self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    /// Evicts every job with `expires_at < now`. Returns the number evicted.
    pub fn sweep_expired_at(&mut self, now: DateTime<Utc>) -> usize {
        let mut expired = Vec::new();
        for tier in self.tiers.iter_mut() {
            if !tier.iter().any(|job| job.is_expired_at(now)) {
                continue;
            }
            let (stale, fresh): (VecDeque<Job>, VecDeque<Job>) =
                tier.drain(..).partition(|job| job.is_expired_at(now));
            *tier = fresh;
            expired.extend(stale);
        }

        for job in &expired {
            self.index.remove(&job.id);
            self.counters.expired += 1;
            if let Some(store) = &self.persistence {
                store.remove(&job.id);
            }

            let waited_ms = job.wait_ms(now);
            debug!(job_id = %job.id, priority = %job.priority, waited_ms, "Job expired");
            self.events.publish(SchedulerEvent::JobExpired {
                job_id: job.id.clone(),
                priority: job.priority,
                waited_ms,
            });
        }

        if !expired.is_empty() {
            info!(count = expired.len(), "Expired jobs evicted from queue");
        }
        expired.len()
    }

    /// Returns a queued job by id.
    pub fn get(&self, job_id: &str) -> Option<&Job> {
        let priority = self.index.get(job_id)?;
        self.tiers[priority.index()]
            .iter()
            .find(|job| job.id == job_id)
    }

    /// Returns true if the job is queued.
    pub fn contains(&self, job_id: &str) -> bool {
        self.index.contains_key(job_id)
    }

    /// Queued jobs of the given type, in dequeue order.
    pub fn jobs_by_type(&self, job_type: &str) -> Vec<&Job> {
        self.iter().filter(|job| job.job_type == job_type).collect()
    }

    /// The job the next unfiltered dequeue would return, or the head of
    /// `priority` if given.
    pub fn peek(&self, priority: Option<Priority>) -> Option<&Job> {
        match priority {
            Some(p) => self.tiers[p.index()].front(),
            None => self.tiers.iter().find_map(|tier| tier.front()),
        }
    }

    /// Iterates over queued jobs in dequeue order.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.tiers.iter().flat_map(|tier| tier.iter())
    }

    /// Total queued jobs.
    pub fn len(&self) -> usize {
        self.tiers.iter().map(VecDeque::len).sum()
    }

    /// Queued jobs in one tier.
    pub fn len_of(&self, priority: Priority) -> usize {
        self.tiers[priority.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.iter().all(VecDeque::is_empty)
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.config.max_queue_size
    }

    /// Drops every job in `priority`, or in all tiers. Returns the count.
    pub fn clear(&mut self, priority: Option<Priority>) -> usize {
        let tiers: Vec<Priority> = match priority {
            Some(p) => vec![p],
            None => Priority::ALL.to_vec(),
        };

        let mut cleared = 0;
        for p in tiers {
            let drained: Vec<Job> = self.tiers[p.index()].drain(..).collect();
            for job in &drained {
                self.index.remove(&job.id);
                if let Some(store) = &self.persistence {
                    store.remove(&job.id);
                }
            }
            cleared += drained.len();
        }

        if cleared > 0 {
            info!(count = cleared, tier = ?priority, "Queue cleared");
        }
        cleared
    }

    /// Clones every queued job in dequeue order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.iter().cloned().collect()
    }

    /// Reloads persisted jobs at the current time.
    pub fn restore(&mut self, jobs: Vec<Job>) -> usize {
        self.restore_at(jobs, Utc::now())
    }

    /// Reloads persisted jobs, keeping their original timestamps.
    ///
    /// Jobs are replayed in `enqueued_at` order. Expired and duplicate jobs
    /// are skipped, and restoring stops once the queue is full.
    pub fn restore_at(&mut self, mut jobs: Vec<Job>, now: DateTime<Utc>) -> usize {
        jobs.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));

        let mut restored = 0;
        let mut skipped = 0;
        for job in jobs {
            if job.is_expired_at(now) || self.index.contains_key(&job.id) {
                if let Some(store) = &self.persistence {
                    if !self.index.contains_key(&job.id) {
                        store.remove(&job.id);
                    }
                }
                skipped += 1;
                continue;
            }
            if self.is_full() {
                warn!(job_id = %job.id, "Queue full during restore, dropping job");
                skipped += 1;
                continue;
            }

            self.index.insert(job.id.clone(), job.priority);
            self.tiers[job.priority.index()].push_back(job);
            restored += 1;
        }

        info!(restored, skipped, "Queue restored from store");
        restored
    }

    /// Metrics at the current time.
    pub fn metrics(&self) -> QueueMetrics {
        self.metrics_at(Utc::now())
    }

    /// Metrics as of `now`.
    pub fn metrics_at(&self, now: DateTime<Utc>) -> QueueMetrics {
        let by_priority = TierCounts {
            critical: self.len_of(Priority::Critical),
            high: self.len_of(Priority::High),
            normal: self.len_of(Priority::Normal),
            low: self.len_of(Priority::Low),
        };
        let size = by_priority.total();

        let oldest_job = self
            .iter()
            .min_by_key(|job| job.enqueued_at)
            .map(|job| OldestJob {
                id: job.id.clone(),
                priority: job.priority,
                age_ms: job.wait_ms(now),
            });

        let average_wait_ms = if self.counters.dequeued > 0 {
            self.counters.total_wait_ms as f64 / self.counters.dequeued as f64
        } else {
            0.0
        };

        let utilization = if self.config.max_queue_size > 0 {
            size as f64 / self.config.max_queue_size as f64 * 100.0
        } else {
            0.0
        };

        QueueMetrics {
            size,
            max_size: self.config.max_queue_size,
            utilization,
            by_priority,
            enqueued: self.counters.enqueued,
            dequeued: self.counters.dequeued,
            expired: self.counters.expired,
            removed: self.counters.removed,
            average_wait_ms,
            oldest_job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{spawn_persistence, JobStore, MemoryJobStore};
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> PriorityJobQueue {
        PriorityJobQueue::new(QueueConfig::default(), EventBus::default())
    }

    fn job(id: &str, priority: Priority) -> Job {
        Job::new(id, "build", priority)
    }

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.max_queue_size, 1000);
        assert_eq!(config.max_wait, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(60));
        assert!(!config.persistence_enabled);
    }

    #[test]
    fn test_priority_order_across_tiers() {
        let mut q = queue();
        q.enqueue(job("1", Priority::Low)).unwrap();
        q.enqueue(job("2", Priority::Critical)).unwrap();
        q.enqueue(job("3", Priority::Normal)).unwrap();
        q.enqueue(job("4", Priority::High)).unwrap();

        let order: Vec<String> = std::iter::from_fn(|| q.dequeue(None)).map(|j| j.id).collect();
        assert_eq!(order, vec!["2", "4", "3", "1"]);
    }

    #[test]
    fn test_fifo_within_tier() {
        let mut q = queue();
        for id in ["a", "b", "c"] {
            q.enqueue(job(id, Priority::Normal)).unwrap();
        }

        assert_eq!(q.dequeue(None).unwrap().id, "a");
        assert_eq!(q.dequeue(None).unwrap().id, "b");
        assert_eq!(q.dequeue(None).unwrap().id, "c");
        assert!(q.dequeue(None).is_none());
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut q = PriorityJobQueue::new(QueueConfig::new(2), EventBus::default());
        q.enqueue(job("1", Priority::Low)).unwrap();
        q.enqueue(job("2", Priority::Critical)).unwrap();
        assert!(q.is_full());

        let err = q.enqueue(job("3", Priority::Critical)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CapacityExceeded);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_invalid_submissions_rejected() {
        let mut q = queue();
        let err = q
            .submit(JobSubmission::new("1", "build").with_priority("urgent"))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPriority);

        let err = q.enqueue(Job::new("1", "", Priority::Normal)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJob);

        q.enqueue(job("1", Priority::Normal)).unwrap();
        let err = q.enqueue(job("1", Priority::High)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateJob);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_filtered_dequeue_skips_non_matching() {
        let mut q = queue();
        q.enqueue(Job::new("a", "deploy", Priority::High)).unwrap();
        q.enqueue(Job::new("b", "build", Priority::High)).unwrap();
        q.enqueue(Job::new("c", "build", Priority::Critical)).unwrap();
        q.enqueue(Job::new("d", "lint", Priority::Normal).with_payload(json!({ "capabilities": ["build"] })))
            .unwrap();

        assert_eq!(q.dequeue(Some("build")).unwrap().id, "c");
        assert_eq!(q.dequeue(Some("build")).unwrap().id, "b");
        assert_eq!(q.dequeue(Some("build")).unwrap().id, "d");
        assert!(q.dequeue(Some("build")).is_none());

        // The skipped job kept its place.
        assert_eq!(q.peek(Some(Priority::High)).unwrap().id, "a");
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut q = queue();
        q.enqueue(job("1", Priority::Normal)).unwrap();

        assert_eq!(q.remove("1").unwrap().id, "1");
        assert!(q.remove("1").is_none());
        assert!(q.is_empty());
        assert_eq!(q.metrics().removed, 1);
    }

    #[test]
    fn test_change_priority_moves_to_tail() {
        let mut q = queue();
        q.enqueue(job("h1", Priority::High)).unwrap();
        q.enqueue(job("n1", Priority::Normal)).unwrap();
        let stamped = q.get("n1").unwrap().enqueued_at;

        q.change_priority("n1", Priority::High).unwrap();
        assert_eq!(q.len_of(Priority::High), 2);
        assert_eq!(q.len_of(Priority::Normal), 0);
        assert_eq!(q.get("n1").unwrap().enqueued_at, stamped);
        assert_eq!(q.dequeue(None).unwrap().id, "h1");
        assert_eq!(q.dequeue(None).unwrap().id, "n1");

        let err = q.change_priority("missing", Priority::Low).unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[test]
    fn test_expired_jobs_are_swept_once() {
        let mut q = queue();
        let now = Utc::now();
        q.enqueue_at(job("old", Priority::Critical), now - chrono::Duration::seconds(301))
            .unwrap();
        q.enqueue_at(job("new", Priority::Low), now).unwrap();

        assert_eq!(q.sweep_expired_at(now), 1);
        assert_eq!(q.sweep_expired_at(now), 0);
        assert_eq!(q.metrics_at(now).expired, 1);
        assert!(!q.contains("old"));
    }

    #[test]
    fn test_dequeue_never_returns_expired() {
        let mut q = queue();
        let now = Utc::now();
        let expiring = job("1", Priority::Critical).with_max_wait(Duration::from_secs(1));
        q.enqueue_at(expiring, now).unwrap();

        assert!(q.dequeue_at(None, now + chrono::Duration::seconds(2)).is_none());
        assert_eq!(q.metrics().expired, 1);
    }

    #[test]
    fn test_jobs_by_type_and_peek() {
        let mut q = queue();
        q.enqueue(Job::new("1", "lint", Priority::Low)).unwrap();
        q.enqueue(Job::new("2", "build", Priority::Normal)).unwrap();
        q.enqueue(Job::new("3", "build", Priority::High)).unwrap();

        let builds: Vec<&str> = q.jobs_by_type("build").iter().map(|j| j.id.as_str()).collect();
        assert_eq!(builds, vec!["3", "2"]);
        assert_eq!(q.peek(None).unwrap().id, "3");
        assert!(q.peek(Some(Priority::Critical)).is_none());
    }

    #[test]
    fn test_clear_by_tier() {
        let mut q = queue();
        q.enqueue(job("1", Priority::Low)).unwrap();
        q.enqueue(job("2", Priority::Low)).unwrap();
        q.enqueue(job("3", Priority::High)).unwrap();

        assert_eq!(q.clear(Some(Priority::Low)), 2);
        assert_eq!(q.len(), 1);
        assert_eq!(q.clear(None), 1);
        assert!(q.is_empty());
        assert!(!q.contains("3"));
    }

    #[test]
    fn test_requeue_front_restores_position() {
        let mut q = queue();
        q.enqueue(job("1", Priority::Normal)).unwrap();
        q.enqueue(job("2", Priority::Normal)).unwrap();

        let first = q.dequeue(None).unwrap();
        q.requeue_front(first);
        assert_eq!(q.dequeue(None).unwrap().id, "1");
        assert_eq!(q.metrics().dequeued, 1);
    }

    #[test]
    fn test_metrics_track_wait_and_oldest() {
        let mut q = queue();
        let now = Utc::now();
        q.enqueue_at(job("1", Priority::Low), now - chrono::Duration::seconds(10)).unwrap();
        q.enqueue_at(job("2", Priority::High), now - chrono::Duration::seconds(4)).unwrap();

        let metrics = q.metrics_at(now);
        assert_eq!(metrics.size, 2);
        assert_eq!(metrics.by_priority.get(Priority::Low), 1);
        assert_eq!(metrics.oldest_job.as_ref().unwrap().id, "1");
        assert!((metrics.utilization - 0.2).abs() < 1e-9);

        q.dequeue_at(None, now).unwrap();
        q.dequeue_at(None, now).unwrap();
        let metrics = q.metrics_at(now);
        assert!((metrics.average_wait_ms - 7000.0).abs() < 1.0);
        assert_eq!(metrics.total_drained(), 2);
        assert!(metrics.oldest_job.is_none());
    }

    #[test]
    fn test_restore_skips_expired_and_keeps_order() {
        let now = Utc::now();
        let mut stale = job("stale", Priority::High);
        stale.stamp(now - chrono::Duration::seconds(600), Duration::from_secs(300));
        let mut second = job("second", Priority::High);
        second.stamp(now - chrono::Duration::seconds(5), Duration::from_secs(300));
        let mut first = job("first", Priority::High);
        first.stamp(now - chrono::Duration::seconds(50), Duration::from_secs(300));

        let mut q = queue();
        let restored = q.restore_at(vec![second, stale, first], now);
        assert_eq!(restored, 2);
        assert_eq!(q.dequeue_at(None, now).unwrap().id, "first");
        assert_eq!(q.dequeue_at(None, now).unwrap().id, "second");
    }

    #[tokio::test]
    async fn test_events_published() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let mut q = PriorityJobQueue::new(QueueConfig::default(), bus);

        q.enqueue(job("1", Priority::Normal)).unwrap();
        q.dequeue(None).unwrap();

        assert_eq!(rx.recv().await.unwrap().name(), "job:enqueued");
        assert_eq!(rx.recv().await.unwrap().name(), "job:dequeued");
    }

    #[tokio::test]
    async fn test_persistence_mirror() {
        let store = Arc::new(MemoryJobStore::new());
        let (handle, writer) = spawn_persistence(store.clone());
        let mut q = PriorityJobQueue::new(QueueConfig::default().with_persistence(true), EventBus::default())
            .with_persistence(handle);

        q.enqueue(job("kept", Priority::Normal)).unwrap();
        q.enqueue(job("taken", Priority::High)).unwrap();
        q.change_priority("kept", Priority::Low).unwrap();
        q.dequeue(None).unwrap();
        drop(q);
        writer.await.unwrap();

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "kept");
        assert_eq!(stored[0].priority, Priority::Low);
    }

    #[tokio::test]
    async fn test_requeued_job_is_mirrored_again() {
        let store = Arc::new(MemoryJobStore::new());
        let (handle, writer) = spawn_persistence(store.clone());
        let mut q = PriorityJobQueue::new(QueueConfig::default().with_persistence(true), EventBus::default())
            .with_persistence(handle);

        q.enqueue(job("bounced", Priority::High)).unwrap();
        let taken = q.dequeue(None).unwrap();
        q.requeue_front(taken);
        drop(q);
        writer.await.unwrap();

        let stored = store.load_all().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, "bounced");
    }
}
