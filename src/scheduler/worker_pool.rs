//! Registry of remote workers and their capacity.
//!
//! A worker is a logical handle to remote execution capacity (for example
//! one repository's CI runners). The pool tracks each worker's declared
//! capabilities, its concurrency budget and its heartbeat, and picks the
//! worker for each job.
//!
//! # Features
//!
//! - Least-loaded selection with target affinity
//! - Deferred unregister (draining) for workers with running jobs
//! - Heartbeat health sweep: unhealthy after the timeout, evicted after twice
//!   the timeout
//! - Self-healing on the next heartbeat

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::events::{EventBus, SchedulerEvent};
use super::job::Job;
use crate::error::ErrorCode;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool already holds its configured maximum of workers.
    #[error("Worker pool at capacity (max {max} workers)")]
    PoolAtCapacity { max: usize },

    /// No available worker can take a job of this type.
    #[error("No available worker for job type '{job_type}'")]
    NoAvailableWorker { job_type: String },

    /// Worker not found in the pool.
    #[error("Worker {0} not found")]
    WorkerNotFound(String),

    /// The worker registration is malformed.
    #[error("Invalid worker: {0}")]
    InvalidWorker(String),
}

impl PoolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::PoolAtCapacity { .. } => ErrorCode::PoolAtCapacity,
            PoolError::NoAvailableWorker { .. } => ErrorCode::NoAvailableWorker,
            PoolError::WorkerNotFound(_) => ErrorCode::WorkerNotFound,
            PoolError::InvalidWorker(_) => ErrorCode::InvalidWorker,
        }
    }
}

/// Configuration for the worker pool.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    /// Maximum number of distinct workers.
    pub max_workers: usize,
    /// Silence after which a worker is marked unhealthy. Twice this evicts it.
    pub heartbeat_timeout: Duration,
    /// How often the health sweep runs.
    pub health_check_interval: Duration,
    /// Concurrency budget for workers registered without one.
    pub default_max_concurrent_jobs: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            heartbeat_timeout: Duration::from_secs(300), // 5 minutes
            health_check_interval: Duration::from_secs(60),
            default_max_concurrent_jobs: 5,
        }
    }
}

impl WorkerPoolConfig {
    /// Creates a configuration with the given worker limit.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            ..Default::default()
        }
    }

    /// Sets the heartbeat timeout.
    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    /// Sets the health sweep interval.
    pub fn with_health_check_interval(mut self, interval: Duration) -> Self {
        self.health_check_interval = interval;
        self
    }

    /// Sets the default per-worker concurrency.
    pub fn with_default_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.default_max_concurrent_jobs = max;
        self
    }
}

/// Status of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Healthy with spare capacity.
    Available,
    /// Healthy but at capacity.
    Busy,
    /// Slated for removal once its jobs finish.
    Draining,
    /// Missed its heartbeat deadline.
    Unhealthy,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Available => write!(f, "available"),
            WorkerStatus::Busy => write!(f, "busy"),
            WorkerStatus::Draining => write!(f, "draining"),
            WorkerStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Registration request for a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSpec {
    pub id: String,
    pub bound_target: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Falls back to the pool default when unset.
    #[serde(default)]
    pub max_concurrent_jobs: Option<usize>,
}

impl WorkerSpec {
    pub fn new(id: impl Into<String>, bound_target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            bound_target: bound_target.into(),
            capabilities: Vec::new(),
            max_concurrent_jobs: None,
        }
    }

    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_concurrent_jobs(mut self, max: usize) -> Self {
        self.max_concurrent_jobs = Some(max);
        self
    }
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub bound_target: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrent_jobs: usize,
    pub active_jobs: usize,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
}

impl Worker {
    /// Returns true if the worker declares `capability`.
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Returns true if the worker can run `job`.
    pub fn can_run(&self, job: &Job) -> bool {
        job.capability_tags().any(|tag| self.has_capability(tag))
    }

    /// Slots left before the worker is at capacity.
    pub fn spare_capacity(&self) -> usize {
        self.max_concurrent_jobs.saturating_sub(self.active_jobs)
    }

    /// Returns true if new jobs can be assigned.
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Available && self.spare_capacity() > 0
    }

    /// Share of the concurrency budget in use, as a percentage.
    pub fn utilization(&self) -> f64 {
        if self.max_concurrent_jobs == 0 {
            return 0.0;
        }
        self.active_jobs as f64 / self.max_concurrent_jobs as f64 * 100.0
    }

    /// Recomputes Available/Busy. Draining and Unhealthy are left alone.
    fn refresh_status(&mut self) {
        match self.status {
            WorkerStatus::Draining | WorkerStatus::Unhealthy => {}
            WorkerStatus::Available | WorkerStatus::Busy => {
                self.status = if self.active_jobs >= self.max_concurrent_jobs {
                    WorkerStatus::Busy
                } else {
                    WorkerStatus::Available
                };
            }
        }
    }
}

/// Where a job was placed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub worker_id: String,
    pub bound_target: String,
    pub active_jobs: usize,
}

/// Result of an unregister request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnregisterOutcome {
    /// The worker was idle and is gone.
    Removed,
    /// The worker has running jobs and will be removed once they finish.
    Draining,
    /// No such worker.
    NotFound,
}

/// Result of releasing a job slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The slot was freed; the worker stays registered.
    Released { active_jobs: usize },
    /// The worker was draining and is now removed.
    Removed,
}

/// A worker removed by the health sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictedWorker {
    pub id: String,
    pub bound_target: String,
    pub active_jobs: usize,
}

/// Outcome of one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Workers newly marked unhealthy.
    pub unhealthy: Vec<String>,
    /// Workers force-removed.
    pub evicted: Vec<EvictedWorker>,
}

impl HealthReport {
    pub fn is_clean(&self) -> bool {
        self.unhealthy.is_empty() && self.evicted.is_empty()
    }
}

/// Aggregate pool metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub total_workers: usize,
    pub available_workers: usize,
    pub busy_workers: usize,
    pub unhealthy_workers: usize,
    pub draining_workers: usize,
    pub total_active_jobs: usize,
    pub total_capacity: usize,
    pub total_jobs_completed: u64,
    pub total_jobs_failed: u64,
    /// Mean per-worker utilization, as a percentage.
    pub average_utilization: f64,
    /// Distinct bound targets.
    pub targets: Vec<String>,
}

impl PoolMetrics {
    /// Share of finished jobs that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_jobs_completed + self.total_jobs_failed;
        if total == 0 {
            return 0.0;
        }
        (self.total_jobs_completed as f64 / total as f64) * 100.0
    }
}

/// Pool of remote workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    workers: HashMap<String, Worker>,
    events: EventBus,
}

impl WorkerPool {
    /// Creates an empty pool publishing to `events`.
    pub fn new(config: WorkerPoolConfig, events: EventBus) -> Self {
        Self {
            config,
            workers: HashMap::new(),
            events,
        }
    }

    /// Returns the pool configuration.
    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Registers or re-registers a worker at the current time.
    pub fn register_worker(&mut self, spec: WorkerSpec) -> Result<(), PoolError> {
        self.register_worker_at(spec, Utc::now())
    }

    /// Registers or re-registers a worker.
    ///
    /// Re-registering an existing id resets it to available with no active
    /// jobs and a fresh heartbeat; lifetime totals are kept.
    ///
    /// # Errors
    ///
    /// - `InvalidWorker` for a blank id or target, or zero concurrency
    /// - `PoolAtCapacity` if the id is new and the pool is full
    pub fn register_worker_at(&mut self, spec: WorkerSpec, now: DateTime<Utc>) -> Result<(), PoolError> {
        if spec.id.trim().is_empty() {
            return Err(PoolError::InvalidWorker("worker id cannot be empty".to_string()));
        }
        if spec.bound_target.trim().is_empty() {
            return Err(PoolError::InvalidWorker(format!(
                "worker {} has an empty bound target",
                spec.id
            )));
        }
        let max_concurrent_jobs = spec
            .max_concurrent_jobs
            .unwrap_or(self.config.default_max_concurrent_jobs);
        if max_concurrent_jobs == 0 {
            return Err(PoolError::InvalidWorker(format!(
                "worker {} must accept at least one job",
                spec.id
            )));
        }

        let existing = self.workers.get(&spec.id);
        if existing.is_none() && self.workers.len() >= self.config.max_workers {
            warn!(worker_id = %spec.id, max = self.config.max_workers, "Worker pool at capacity");
            return Err(PoolError::PoolAtCapacity {
                max: self.config.max_workers,
            });
        }

        let updated = existing.is_some();
        let (registered_at, completed, failed) = existing
            .map(|w| (w.registered_at, w.total_jobs_completed, w.total_jobs_failed))
            .unwrap_or((now, 0, 0));

        let worker = Worker {
            id: spec.id.clone(),
            bound_target: spec.bound_target.clone(),
            capabilities: spec.capabilities.iter().cloned().collect(),
            max_concurrent_jobs,
            active_jobs: 0,
            status: WorkerStatus::Available,
            last_heartbeat: now,
            registered_at,
            total_jobs_completed: completed,
            total_jobs_failed: failed,
        };

        info!(
            worker_id = %worker.id,
            target = %worker.bound_target,
            max_concurrent_jobs,
            updated,
            "Worker registered"
        );
        self.events.publish(SchedulerEvent::WorkerRegistered {
            worker_id: worker.id.clone(),
            target: worker.bound_target.clone(),
            capabilities: worker.capabilities.iter().cloned().collect(),
            updated,
        });
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    /// Unregisters a worker, draining it first if it has active jobs.
    pub fn unregister_worker(&mut self, worker_id: &str) -> UnregisterOutcome {
        let Some(worker) = self.workers.get_mut(worker_id) else {
            debug!(worker_id = %worker_id, "Unregister requested for unknown worker");
            return UnregisterOutcome::NotFound;
        };

        if worker.active_jobs > 0 {
            worker.status = WorkerStatus::Draining;
            info!(
                worker_id = %worker_id,
                active_jobs = worker.active_jobs,
                "Worker draining before removal"
            );
            self.events.publish(SchedulerEvent::WorkerDraining {
                worker_id: worker_id.to_string(),
                active_jobs: worker.active_jobs,
            });
            return UnregisterOutcome::Draining;
        }

        self.remove_worker(worker_id);
        UnregisterOutcome::Removed
    }

    fn remove_worker(&mut self, worker_id: &str) -> Option<Worker> {
        let worker = self.workers.remove(worker_id)?;
        info!(worker_id = %worker_id, "Worker unregistered");
        self.events.publish(SchedulerEvent::WorkerUnregistered {
            worker_id: worker_id.to_string(),
        });
        Some(worker)
    }

    /// Available workers, least-loaded first, optionally filtered by capability.
    pub fn available_workers(&self, capability: Option<&str>) -> Vec<&Worker> {
        self.candidates(|w| capability.map_or(true, |cap| w.has_capability(cap)))
    }

    fn candidates<F>(&self, accept: F) -> Vec<&Worker>
    where
        F: Fn(&Worker) -> bool,
    {
        let mut workers: Vec<&Worker> = self
            .workers
            .values()
            .filter(|w| w.is_available() && accept(w))
            .collect();
        workers.sort_by(|a, b| a.active_jobs.cmp(&b.active_jobs).then_with(|| a.id.cmp(&b.id)));
        workers
    }

    /// Returns true if some available worker can run `job`.
    pub fn can_accept(&self, job: &Job) -> bool {
        self.workers.values().any(|w| w.is_available() && w.can_run(job))
    }

    /// Assigns a job of `job_type`, preferring a worker bound to `preferred_target`.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NoAvailableWorker` if no available worker declares
    /// the capability.
    pub fn assign_job_to_worker(
        &mut self,
        job_type: &str,
        preferred_target: Option<&str>,
    ) -> Result<Assignment, PoolError> {
        let worker_id = self.pick(|w| w.has_capability(job_type), preferred_target, job_type)?;
        self.occupy(&worker_id, job_type)
    }

    /// Assigns `job` to a worker that can run it, honouring its target.
    pub fn assign_job(&mut self, job: &Job) -> Result<Assignment, PoolError> {
        let worker_id = self.pick(|w| w.can_run(job), job.target.as_deref(), &job.job_type)?;
        self.occupy(&worker_id, &job.job_type)
    }

    fn pick<F>(&self, accept: F, preferred_target: Option<&str>, job_type: &str) -> Result<String, PoolError>
    where
        F: Fn(&Worker) -> bool,
    {
        let candidates = self.candidates(accept);
        let chosen = preferred_target
            .and_then(|target| candidates.iter().find(|w| w.bound_target == target))
            .or_else(|| candidates.first())
            .ok_or_else(|| PoolError::NoAvailableWorker {
                job_type: job_type.to_string(),
            })?;
        Ok(chosen.id.clone())
    }

    fn occupy(&mut self, worker_id: &str, job_type: &str) -> Result<Assignment, PoolError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;
        worker.active_jobs += 1;
        worker.refresh_status();

        debug!(
            worker_id = %worker.id,
            job_type = %job_type,
            active_jobs = worker.active_jobs,
            status = %worker.status,
            "Job assigned to worker"
        );
        self.events.publish(SchedulerEvent::JobAssigned {
            worker_id: worker.id.clone(),
            job_type: job_type.to_string(),
            active_jobs: worker.active_jobs,
        });

        Ok(Assignment {
            worker_id: worker.id.clone(),
            bound_target: worker.bound_target.clone(),
            active_jobs: worker.active_jobs,
        })
    }

    /// Frees a job slot on a worker.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::WorkerNotFound` if the worker is gone (for example
    /// evicted while the job ran).
    pub fn release_worker(&mut self, worker_id: &str, success: bool) -> Result<ReleaseOutcome, PoolError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;

        worker.active_jobs = worker.active_jobs.saturating_sub(1);
        if success {
            worker.total_jobs_completed += 1;
        } else {
            worker.total_jobs_failed += 1;
        }
        let active_jobs = worker.active_jobs;

        self.events.publish(SchedulerEvent::JobReleased {
            worker_id: worker_id.to_string(),
            success,
            active_jobs,
        });

        if worker.status == WorkerStatus::Draining && active_jobs == 0 {
            self.remove_worker(worker_id);
            return Ok(ReleaseOutcome::Removed);
        }

        worker.refresh_status();
        debug!(worker_id = %worker_id, success, active_jobs, "Worker slot released");
        Ok(ReleaseOutcome::Released { active_jobs })
    }

    /// Records a heartbeat at the current time.
    pub fn update_heartbeat(&mut self, worker_id: &str) -> Result<(), PoolError> {
        self.update_heartbeat_at(worker_id, Utc::now())
    }

    /// Records a heartbeat. An unhealthy worker recovers immediately.
    pub fn update_heartbeat_at(&mut self, worker_id: &str, now: DateTime<Utc>) -> Result<(), PoolError> {
        let worker = self
            .workers
            .get_mut(worker_id)
            .ok_or_else(|| PoolError::WorkerNotFound(worker_id.to_string()))?;

        worker.last_heartbeat = now;
        if worker.status == WorkerStatus::Unhealthy {
            worker.status = WorkerStatus::Available;
            worker.refresh_status();
            info!(worker_id = %worker_id, status = %worker.status, "Worker recovered");
            self.events.publish(SchedulerEvent::WorkerRecovered {
                worker_id: worker_id.to_string(),
            });
        }
        Ok(())
    }

    /// Runs the health sweep at the current time.
    pub fn health_check(&mut self) -> HealthReport {
        self.health_check_at(Utc::now())
    }

    /// Marks silent workers unhealthy and evicts those silent for more than
    /// twice the heartbeat timeout. Draining workers are skipped.
    pub fn health_check_at(&mut self, now: DateTime<Utc>) -> HealthReport {
        let timeout_ms = self.config.heartbeat_timeout.as_millis() as i64;
        let mut report = HealthReport::default();

        let mut ids: Vec<String> = self.workers.keys().cloned().collect();
        ids.sort();

        for id in ids {
            let Some(worker) = self.workers.get_mut(&id) else {
                continue;
            };
            if worker.status == WorkerStatus::Draining {
                continue;
            }

            let silent_ms = (now - worker.last_heartbeat).num_milliseconds();
            if silent_ms > timeout_ms.saturating_mul(2) {
                let evicted = EvictedWorker {
                    id: worker.id.clone(),
                    bound_target: worker.bound_target.clone(),
                    active_jobs: worker.active_jobs,
                };
                self.workers.remove(&id);
                warn!(
                    worker_id = %id,
                    silent_ms,
                    active_jobs = evicted.active_jobs,
                    "Worker evicted after missing heartbeats"
                );
                self.events.publish(SchedulerEvent::WorkerEvicted {
                    worker_id: id.clone(),
                    active_jobs: evicted.active_jobs,
                });
                report.evicted.push(evicted);
            } else if silent_ms > timeout_ms && worker.status != WorkerStatus::Unhealthy {
                worker.status = WorkerStatus::Unhealthy;
                warn!(worker_id = %id, silent_ms, "Worker marked unhealthy");
                self.events.publish(SchedulerEvent::WorkerUnhealthy {
                    worker_id: id.clone(),
                    since_heartbeat_ms: silent_ms.max(0) as u64,
                });
                report.unhealthy.push(id);
            }
        }

        report
    }

    /// Returns a worker by id.
    pub fn get_worker(&self, worker_id: &str) -> Option<&Worker> {
        self.workers.get(worker_id)
    }

    /// All registered workers, sorted by id.
    pub fn all_workers(&self) -> Vec<&Worker> {
        let mut workers: Vec<&Worker> = self.workers.values().collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));
        workers
    }

    /// Number of registered workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Spare slots across available workers.
    pub fn available_capacity(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.is_available())
            .map(Worker::spare_capacity)
            .sum()
    }

    /// Union of capabilities across available workers.
    pub fn available_capabilities(&self) -> BTreeSet<String> {
        self.workers
            .values()
            .filter(|w| w.is_available())
            .flat_map(|w| w.capabilities.iter().cloned())
            .collect()
    }

    /// Aggregate metrics.
    pub fn metrics(&self) -> PoolMetrics {
        let mut metrics = PoolMetrics {
            total_workers: self.workers.len(),
            ..Default::default()
        };
        let mut targets = BTreeSet::new();
        let mut utilization_sum = 0.0;

        for worker in self.workers.values() {
            match worker.status {
                WorkerStatus::Available => metrics.available_workers += 1,
                WorkerStatus::Busy => metrics.busy_workers += 1,
                WorkerStatus::Draining => metrics.draining_workers += 1,
                WorkerStatus::Unhealthy => metrics.unhealthy_workers += 1,
            }
            metrics.total_active_jobs += worker.active_jobs;
            metrics.total_capacity += worker.max_concurrent_jobs;
            metrics.total_jobs_completed += worker.total_jobs_completed;
            metrics.total_jobs_failed += worker.total_jobs_failed;
            utilization_sum += worker.utilization();
            targets.insert(worker.bound_target.clone());
        }

        if !self.workers.is_empty() {
            metrics.average_utilization = utilization_sum / self.workers.len() as f64;
        }
        metrics.targets = targets.into_iter().collect();
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Priority;
    use serde_json::json;

    fn pool() -> WorkerPool {
        WorkerPool::new(WorkerPoolConfig::default(), EventBus::default())
    }

    fn spec(id: &str, target: &str, max: usize) -> WorkerSpec {
        WorkerSpec::new(id, target)
            .with_capabilities(["build"])
            .with_max_concurrent_jobs(max)
    }

    #[test]
    fn test_worker_pool_config_default() {
        let config = WorkerPoolConfig::default();
        assert_eq!(config.max_workers, 100);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(300));
        assert_eq!(config.health_check_interval, Duration::from_secs(60));
        assert_eq!(config.default_max_concurrent_jobs, 5);
    }

    #[test]
    fn test_worker_pool_config_builder() {
        let config = WorkerPoolConfig::new(8)
            .with_heartbeat_timeout(Duration::from_secs(30))
            .with_health_check_interval(Duration::from_secs(5))
            .with_default_max_concurrent_jobs(2);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.health_check_interval, Duration::from_secs(5));
        assert_eq!(config.default_max_concurrent_jobs, 2);
    }

    #[test]
    fn test_register_uses_default_capacity() {
        let mut p = pool();
        p.register_worker(WorkerSpec::new("w1", "org/a")).unwrap();
        let worker = p.get_worker("w1").unwrap();
        assert_eq!(worker.max_concurrent_jobs, 5);
        assert_eq!(worker.status, WorkerStatus::Available);
    }

    #[test]
    fn test_register_rejects_invalid() {
        let mut p = pool();
        let err = p.register_worker(WorkerSpec::new("", "org/a")).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidWorker);
        let err = p.register_worker(spec("w1", "org/a", 0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidWorker);
    }

    #[test]
    fn test_pool_at_capacity_only_for_new_ids() {
        let mut p = WorkerPool::new(WorkerPoolConfig::new(1), EventBus::default());
        p.register_worker(spec("w1", "org/a", 1)).unwrap();

        let err = p.register_worker(spec("w2", "org/b", 1)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::PoolAtCapacity);

        // Updating an existing worker is allowed.
        p.register_worker(spec("w1", "org/a", 3)).unwrap();
        assert_eq!(p.get_worker("w1").unwrap().max_concurrent_jobs, 3);
    }

    #[test]
    fn test_reregister_keeps_totals() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 2)).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        p.release_worker("w1", true).unwrap();
        p.register_worker(spec("w1", "org/a", 2)).unwrap();

        let worker = p.get_worker("w1").unwrap();
        assert_eq!(worker.total_jobs_completed, 1);
        assert_eq!(worker.active_jobs, 0);
    }

    #[test]
    fn test_capacity_invariant() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 1)).unwrap();

        p.assign_job_to_worker("build", None).unwrap();
        assert_eq!(p.get_worker("w1").unwrap().status, WorkerStatus::Busy);

        let err = p.assign_job_to_worker("build", None).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoAvailableWorker);

        p.release_worker("w1", true).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        let worker = p.get_worker("w1").unwrap();
        assert!(worker.active_jobs <= worker.max_concurrent_jobs);
    }

    #[test]
    fn test_least_loaded_selection() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 5)).unwrap();
        p.register_worker(spec("w2", "org/b", 5)).unwrap();

        let first = p.assign_job_to_worker("build", None).unwrap();
        let second = p.assign_job_to_worker("build", None).unwrap();
        assert_ne!(first.worker_id, second.worker_id);

        let loads: Vec<usize> = p.available_workers(Some("build")).iter().map(|w| w.active_jobs).collect();
        assert_eq!(loads, vec![1, 1]);
    }

    #[test]
    fn test_target_affinity() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 5)).unwrap();
        p.register_worker(spec("w2", "org/b", 5)).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        p.assign_job_to_worker("build", Some("org/b")).unwrap();

        let assignment = p.assign_job_to_worker("build", Some("org/b")).unwrap();
        assert_eq!(assignment.worker_id, "w2");
        assert_eq!(assignment.active_jobs, 2);

        let fallback = p.assign_job_to_worker("build", Some("org/unknown")).unwrap();
        assert_eq!(fallback.worker_id, "w1");
    }

    #[test]
    fn test_assign_job_matches_payload_capabilities() {
        let mut p = pool();
        p.register_worker(WorkerSpec::new("w1", "org/a").with_capabilities(["lint"])).unwrap();

        let job = Job::new("j1", "analysis", Priority::Normal).with_payload(json!({ "capabilities": ["lint"] }));
        assert!(p.can_accept(&job));
        assert_eq!(p.assign_job(&job).unwrap().worker_id, "w1");

        let other = Job::new("j2", "deploy", Priority::Normal);
        assert!(!p.can_accept(&other));
        assert!(p.assign_job(&other).is_err());
    }

    #[test]
    fn test_draining_correctness() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 5)).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        p.assign_job_to_worker("build", None).unwrap();

        assert_eq!(p.unregister_worker("w1"), UnregisterOutcome::Draining);
        assert_eq!(p.get_worker("w1").unwrap().status, WorkerStatus::Draining);
        assert!(p.assign_job_to_worker("build", None).is_err());

        assert_eq!(p.release_worker("w1", true).unwrap(), ReleaseOutcome::Released { active_jobs: 1 });
        assert_eq!(p.release_worker("w1", true).unwrap(), ReleaseOutcome::Removed);
        assert!(p.all_workers().is_empty());
        assert_eq!(p.unregister_worker("w1"), UnregisterOutcome::NotFound);
    }

    #[test]
    fn test_unregister_idle_removes() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 1)).unwrap();
        assert_eq!(p.unregister_worker("w1"), UnregisterOutcome::Removed);
        assert!(p.is_empty());
    }

    #[test]
    fn test_release_floor_and_unknown() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 1)).unwrap();
        assert_eq!(p.release_worker("w1", false).unwrap(), ReleaseOutcome::Released { active_jobs: 0 });
        assert_eq!(p.get_worker("w1").unwrap().total_jobs_failed, 1);

        let err = p.release_worker("ghost", true).unwrap_err();
        assert_eq!(err.code(), ErrorCode::WorkerNotFound);
    }

    #[test]
    fn test_heartbeat_self_heal() {
        let mut p = pool();
        let start = Utc::now();
        p.register_worker_at(spec("w2", "org/a", 1), start).unwrap();

        let later = start + chrono::Duration::milliseconds(300_001);
        let report = p.health_check_at(later);
        assert_eq!(report.unhealthy, vec!["w2".to_string()]);
        assert_eq!(p.get_worker("w2").unwrap().status, WorkerStatus::Unhealthy);
        assert!(p.available_workers(None).is_empty());

        // Marked only once.
        assert!(p.health_check_at(later).is_clean());

        p.update_heartbeat_at("w2", later).unwrap();
        assert_eq!(p.get_worker("w2").unwrap().status, WorkerStatus::Available);
    }

    #[test]
    fn test_unhealthy_release_stays_unhealthy() {
        let mut p = pool();
        let start = Utc::now();
        p.register_worker_at(spec("w1", "org/a", 2), start).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        p.health_check_at(start + chrono::Duration::seconds(301));

        p.release_worker("w1", true).unwrap();
        assert_eq!(p.get_worker("w1").unwrap().status, WorkerStatus::Unhealthy);
    }

    #[test]
    fn test_eviction_after_twice_timeout() {
        let mut p = pool();
        let start = Utc::now();
        p.register_worker_at(spec("w1", "org/a", 2), start).unwrap();
        p.register_worker_at(spec("w2", "org/b", 2), start).unwrap();
        p.assign_job_to_worker("build", Some("org/a")).unwrap();
        p.update_heartbeat_at("w2", start + chrono::Duration::seconds(500)).unwrap();

        let report = p.health_check_at(start + chrono::Duration::seconds(601));
        assert_eq!(report.evicted.len(), 1);
        assert_eq!(report.evicted[0].id, "w1");
        assert_eq!(report.evicted[0].active_jobs, 1);
        assert!(p.get_worker("w1").is_none());
        assert!(p.get_worker("w2").is_some());
    }

    #[test]
    fn test_draining_skipped_by_health_check() {
        let mut p = pool();
        let start = Utc::now();
        p.register_worker_at(spec("w1", "org/a", 2), start).unwrap();
        p.assign_job_to_worker("build", None).unwrap();
        p.unregister_worker("w1");

        assert!(p.health_check_at(start + chrono::Duration::seconds(1000)).is_clean());
        assert_eq!(p.get_worker("w1").unwrap().status, WorkerStatus::Draining);
    }

    #[test]
    fn test_capacity_and_capabilities() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 3)).unwrap();
        p.register_worker(WorkerSpec::new("w2", "org/b").with_capabilities(["lint"]).with_max_concurrent_jobs(2))
            .unwrap();
        p.assign_job_to_worker("build", None).unwrap();

        assert_eq!(p.available_capacity(), 4);
        let caps: Vec<String> = p.available_capabilities().into_iter().collect();
        assert_eq!(caps, vec!["build".to_string(), "lint".to_string()]);
    }

    #[test]
    fn test_pool_metrics() {
        let mut p = pool();
        p.register_worker(spec("w1", "org/a", 1)).unwrap();
        p.register_worker(spec("w2", "org/a", 2)).unwrap();
        p.assign_job_to_worker("build", Some("org/a")).unwrap();
        p.assign_job_to_worker("build", Some("org/a")).unwrap();
        p.release_worker("w2", true).unwrap();

        let metrics = p.metrics();
        assert_eq!(metrics.total_workers, 2);
        assert_eq!(metrics.busy_workers, 1);
        assert_eq!(metrics.available_workers, 1);
        assert_eq!(metrics.total_active_jobs, 1);
        assert_eq!(metrics.total_capacity, 3);
        assert_eq!(metrics.targets, vec!["org/a".to_string()]);
        assert!((metrics.average_utilization - 50.0).abs() < 1e-9);
        assert!((metrics.success_rate() - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_error_display() {
        let err = PoolError::PoolAtCapacity { max: 100 };
        assert!(err.to_string().contains("100"));

        let err = PoolError::NoAvailableWorker {
            job_type: "build".to_string(),
        };
        assert!(err.to_string().contains("build"));
    }
}
