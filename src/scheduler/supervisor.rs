//! Supervisor: moves jobs from the queue onto workers and sees them through.
//!
//! Each polling tick runs four steps in order:
//!
//! 1. Release retries whose backoff has elapsed back into the queue.
//! 2. Run the worker health sweep. Jobs running on evicted workers go
//!    through the retry path.
//! 3. Dequeue as many jobs as free capacity allows, assign each to a worker
//!    and dispatch it on its own task.
//! 4. Publish metrics and advisory alerts.
//!
//! A dispatched job runs `queued -> running -> completed | failed`. A
//! retryable failure re-enters the queue as a new attempt after
//! `retry_delay * 2^retry_count`. Once the retry ceiling is reached the job
//! is failed exactly once: whichever path removes it from the running table
//! first finalizes it.
//!
//! # Locking
//!
//! The queue, pool and supervisor state each sit behind a `tokio::sync::Mutex`.
//! They are always acquired in that order (queue, pool, state), and no lock is
//! held across a call to the external dispatcher.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dispatch::{DispatchError, ExternalDispatcher, TriggerRequest};
use super::events::{EventBus, SchedulerEvent};
use super::job::{add_duration, Job, JobOutcome, JobRecord, JobSubmission};
use super::queue::{PriorityJobQueue, QueueError, QueueMetrics};
use super::retry::{DelayQueue, RetryPolicy};
use super::worker_pool::{PoolError, PoolMetrics, UnregisterOutcome, WorkerPool, WorkerSpec};
use crate::error::{ErrorCode, SchedulerError};

/// Job type used for repository workflow dispatches.
pub const WORKFLOW_JOB_TYPE: &str = "workflow_trigger";

/// Configuration for the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    // Scheduling
    /// Maximum jobs running at once across all workers.
    pub max_parallel_jobs: usize,
    /// Interval between polling ticks.
    pub polling_interval: Duration,

    // Retries
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry.
    pub retry_delay: Duration,
    /// Ceiling on a single retry delay.
    pub max_retry_delay: Duration,

    // Completion wait
    /// Whether to poll each run until it completes.
    pub await_completion: bool,
    /// Interval between status checks.
    pub completion_poll_interval: Duration,
    /// Status checks before a run is declared timed out.
    pub completion_max_attempts: u32,

    // Alerts and history
    /// Queue depth above which a high-queue alert fires.
    pub high_queue_threshold: usize,
    /// Available-worker count below which a low-workers alert fires.
    pub low_workers_threshold: usize,
    /// Entries kept in each of the completed and failed lists.
    pub history_limit: usize,

    // Repositories
    /// Git ref used when a dispatch does not name one.
    pub default_ref: String,
    /// Capabilities given to repository-backed workers.
    pub default_capabilities: Vec<String>,
    /// Concurrency given to repository-backed workers.
    pub default_max_concurrent_jobs: usize,
    /// Refresh heartbeats of repository-backed workers every tick.
    pub heartbeat_repositories: bool,

    /// How long shutdown waits for running jobs.
    pub shutdown_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            // Scheduling defaults
            max_parallel_jobs: 40,
            polling_interval: Duration::from_secs(30),

            // Retry defaults
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(3600),

            // Completion defaults (5 minutes total)
            await_completion: true,
            completion_poll_interval: Duration::from_secs(5),
            completion_max_attempts: 60,

            // Alert defaults
            high_queue_threshold: 100,
            low_workers_threshold: 2,
            history_limit: 100,

            // Repository defaults
            default_ref: "main".to_string(),
            default_capabilities: vec!["mod_analysis".to_string(), WORKFLOW_JOB_TYPE.to_string()],
            default_max_concurrent_jobs: 5,
            heartbeat_repositories: true,

            shutdown_timeout: Duration::from_secs(60),
        }
    }
}

impl SupervisorConfig {
    /// Creates a configuration with the given parallelism.
    pub fn new(max_parallel_jobs: usize) -> Self {
        Self {
            max_parallel_jobs,
            ..Default::default()
        }
    }

    /// Sets the polling interval.
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval;
        self
    }

    /// Sets the retry ceiling and base delay.
    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    /// Configures the completion wait.
    pub fn with_completion_wait(mut self, enabled: bool, poll_interval: Duration, max_attempts: u32) -> Self {
        self.await_completion = enabled;
        self.completion_poll_interval = poll_interval;
        self.completion_max_attempts = max_attempts;
        self
    }

    /// Sets the alert thresholds.
    pub fn with_alert_thresholds(mut self, high_queue: usize, low_workers: usize) -> Self {
        self.high_queue_threshold = high_queue;
        self.low_workers_threshold = low_workers;
        self
    }

    /// Sets the default git ref.
    pub fn with_default_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.default_ref = git_ref.into();
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Retry policy derived from this configuration.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay).with_max_delay(self.max_retry_delay)
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    /// Attempts handed to the dispatcher.
    pub dispatched: u64,
    pub completed: u64,
    /// Terminal failures.
    pub failed: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Summed wall time of finished attempts.
    pub total_execution_ms: u64,
}

impl SupervisorStats {
    /// Jobs that reached a terminal state.
    pub fn total_finished(&self) -> u64 {
        self.completed + self.failed
    }

    /// Mean wall time per finished attempt.
    pub fn average_execution_ms(&self) -> f64 {
        let attempts = self.completed + self.failed + self.retried;
        if attempts == 0 {
            return 0.0;
        }
        self.total_execution_ms as f64 / attempts as f64
    }
}

/// Snapshot published every tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorMetrics {
    pub timestamp: DateTime<Utc>,
    pub active_jobs: usize,
    pub queued_jobs: usize,
    pub pending_retries: usize,
    pub available_workers: usize,
    pub total_workers: usize,
    pub available_capacity: usize,
    pub registered_repositories: usize,
    pub stats: SupervisorStats,
    pub average_execution_ms: f64,
}

/// Periodic summary of supervisor activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorReport {
    pub generated_at: DateTime<Utc>,
    pub metrics: SupervisorMetrics,
    pub queue: QueueMetrics,
    pub pool: PoolMetrics,
    /// Completed share of terminal jobs, as a percentage.
    pub completion_rate: f64,
    /// Failed share of terminal jobs, as a percentage.
    pub failure_rate: f64,
    pub completed_history: usize,
    pub failed_history: usize,
    pub recent_failures: Vec<JobRecord>,
}

/// Request to run a workflow on a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub target: String,
    pub workflow: String,
    #[serde(default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default = "default_dispatch_priority")]
    pub priority: String,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub job_type: Option<String>,
}

fn default_dispatch_priority() -> String {
    "normal".to_string()
}

impl DispatchRequest {
    pub fn new(target: impl Into<String>, workflow: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            workflow: workflow.into(),
            git_ref: None,
            inputs: json!({}),
            priority: default_dispatch_priority(),
            job_id: None,
            job_type: None,
        }
    }

    pub fn with_ref(mut self, git_ref: impl Into<String>) -> Self {
        self.git_ref = Some(git_ref.into());
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}

/// What a single tick did.
#[derive(Debug)]
pub struct TickReport {
    pub retries_released: usize,
    pub unhealthy_workers: Vec<String>,
    pub evicted_workers: Vec<String>,
    /// Running jobs failed over because their worker was evicted.
    pub failed_over: usize,
    /// Tasks spawned for newly dispatched jobs.
    pub dispatched: Vec<JoinHandle<()>>,
    pub metrics: SupervisorMetrics,
}

struct RunningJob {
    job: Job,
    worker_id: String,
    started_at: DateTime<Utc>,
    abort: AbortHandle,
}

#[derive(Default)]
struct SupervisorState {
    running: HashMap<String, RunningJob>,
    /// Target to backing worker id.
    repositories: HashMap<String, String>,
    retries: DelayQueue<Job>,
    completed: VecDeque<JobRecord>,
    failed: VecDeque<JobRecord>,
    stats: SupervisorStats,
}

fn push_bounded(list: &mut VecDeque<JobRecord>, record: JobRecord, limit: usize) {
    list.push_back(record);
    while list.len() > limit {
        list.pop_front();
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    (to - from).num_milliseconds().max(0) as u64
}

/// Drives jobs from the queue through dispatch to completion.
pub struct Supervisor {
    config: SupervisorConfig,
    retry: RetryPolicy,
    queue: Arc<Mutex<PriorityJobQueue>>,
    pool: Arc<Mutex<WorkerPool>>,
    dispatcher: Arc<dyn ExternalDispatcher>,
    events: EventBus,
    state: Mutex<SupervisorState>,
}

impl Supervisor {
    /// Creates a supervisor over a shared queue and pool.
    pub fn new(
        config: SupervisorConfig,
        queue: Arc<Mutex<PriorityJobQueue>>,
        pool: Arc<Mutex<WorkerPool>>,
        dispatcher: Arc<dyn ExternalDispatcher>,
        events: EventBus,
    ) -> Arc<Self> {
        Arc::new(Self {
            retry: config.retry_policy(),
            config,
            queue,
            pool,
            dispatcher,
            events,
            state: Mutex::new(SupervisorState::default()),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn queue(&self) -> &Arc<Mutex<PriorityJobQueue>> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<Mutex<WorkerPool>> {
        &self.pool
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    // ------------------------------------------------------------------
    // Repositories
    // ------------------------------------------------------------------

    /// Registers a repository and its backing worker. Idempotent.
    ///
    /// Returns the id of the backing worker.
    pub async fn register_repository(&self, target: &str) -> Result<String, SchedulerError> {
        if target.trim().is_empty() {
            return Err(PoolError::InvalidWorker("repository target cannot be empty".to_string()).into());
        }
        if let Some(worker_id) = self.state.lock().await.repositories.get(target) {
            return Ok(worker_id.clone());
        }

        self.dispatcher.verify_target(target).await?;

        let worker_id = format!("worker-{}", target);
        let mut pool = self.pool.lock().await;
        let mut state = self.state.lock().await;
        if let Some(existing) = state.repositories.get(target) {
            return Ok(existing.clone());
        }

        pool.register_worker(
            WorkerSpec::new(&worker_id, target)
                .with_capabilities(self.config.default_capabilities.iter().cloned())
                .with_max_concurrent_jobs(self.config.default_max_concurrent_jobs),
        )?;
        state.repositories.insert(target.to_string(), worker_id.clone());

        info!(target = %target, worker_id = %worker_id, "Repository registered");
        self.events.publish(SchedulerEvent::RepositoryRegistered {
            target: target.to_string(),
            worker_id: worker_id.clone(),
        });
        Ok(worker_id)
    }

    /// Unregisters a repository, draining its worker if jobs are running.
    pub async fn unregister_repository(&self, target: &str) -> UnregisterOutcome {
        let mut pool = self.pool.lock().await;
        let mut state = self.state.lock().await;
        let Some(worker_id) = state.repositories.remove(target) else {
            return UnregisterOutcome::NotFound;
        };

        let outcome = pool.unregister_worker(&worker_id);
        info!(target = %target, worker_id = %worker_id, outcome = ?outcome, "Repository unregistered");
        self.events.publish(SchedulerEvent::RepositoryUnregistered {
            target: target.to_string(),
        });
        outcome
    }

    /// Registered repositories, sorted.
    pub async fn repositories(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut targets: Vec<String> = state.repositories.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Enqueues a workflow run, registering the repository if needed.
    ///
    /// Returns the job id.
    pub async fn dispatch_job(&self, request: DispatchRequest) -> Result<String, SchedulerError> {
        let job_id = request
            .job_id
            .unwrap_or_else(|| format!("job-{}", Uuid::new_v4()));
        let git_ref = request
            .git_ref
            .unwrap_or_else(|| self.config.default_ref.clone());
        let payload = json!({
            "workflow": request.workflow,
            "ref": git_ref,
            "inputs": request.inputs,
        });

        let job = JobSubmission::new(job_id, request.job_type.unwrap_or_else(|| WORKFLOW_JOB_TYPE.to_string()))
            .with_priority(request.priority)
            .with_payload(payload)
            .with_target(request.target.clone())
            .into_job()?;

        self.register_repository(&request.target).await?;

        let job_id = job.id.clone();
        self.queue.lock().await.enqueue(job)?;
        info!(job_id = %job_id, target = %request.target, "Workflow dispatch queued");
        Ok(job_id)
    }

    // ------------------------------------------------------------------
    // Polling tick
    // ------------------------------------------------------------------

    /// Runs one polling tick at the current time.
    pub async fn tick(self: &Arc<Self>) -> TickReport {
        self.tick_at(Utc::now()).await
    }

    /// Runs one polling tick as of `now`.
    pub async fn tick_at(self: &Arc<Self>, now: DateTime<Utc>) -> TickReport {
        let retries_released = self.release_due_retries_at(now).await;
        let (unhealthy_workers, evicted_workers, failed_over) = self.check_worker_health_at(now).await;
        let dispatched = self.process_queue_at(now).await;
        let metrics = self.emit_metrics_at(now).await;

        TickReport {
            retries_released,
            unhealthy_workers,
            evicted_workers,
            failed_over,
            dispatched,
            metrics,
        }
    }

    /// Moves retries whose backoff has elapsed back into the queue.
    pub async fn release_due_retries_at(&self, now: DateTime<Utc>) -> usize {
        let mut queue = self.queue.lock().await;
        let mut state = self.state.lock().await;

        let mut released = 0;
        for job in state.retries.pop_ready(now) {
            let job_id = job.id.clone();
            match queue.enqueue_at(job.clone(), now) {
                Ok(()) => {
                    released += 1;
                    debug!(job_id = %job_id, retry_count = job.retry_count, "Retry released to queue");
                }
                Err(QueueError::CapacityExceeded { .. }) => {
                    warn!(job_id = %job_id, "Queue full, postponing retry");
                    state.retries.push(add_duration(now, self.retry.base_delay), job);
                }
                Err(e) => {
                    let code = e.code();
                    self.fail_terminally(&mut state, job, None, now, now, code, e.to_string());
                }
            }
        }
        released
    }

    /// Runs the health sweep and fails over jobs on evicted workers.
    ///
    /// Returns the unhealthy and evicted worker ids and the number of jobs
    /// failed over.
    pub async fn check_worker_health_at(&self, now: DateTime<Utc>) -> (Vec<String>, Vec<String>, usize) {
        let report = {
            let mut pool = self.pool.lock().await;
            if self.config.heartbeat_repositories {
                let state = self.state.lock().await;
                for worker_id in state.repositories.values() {
                    if let Err(e) = pool.update_heartbeat_at(worker_id, now) {
                        debug!(worker_id = %worker_id, error = %e, "Repository worker missing");
                    }
                }
            }
            pool.health_check_at(now)
        };

        if report.evicted.is_empty() {
            return (report.unhealthy, Vec::new(), 0);
        }

        let mut state = self.state.lock().await;
        let mut failed_over = 0;
        for evicted in &report.evicted {
            state.repositories.retain(|_, worker_id| worker_id != &evicted.id);

            let lost: Vec<String> = state
                .running
                .iter()
                .filter(|(_, running)| running.worker_id == evicted.id)
                .map(|(job_id, _)| job_id.clone())
                .collect();

            for job_id in lost {
                let Some(running) = state.running.remove(&job_id) else {
                    continue;
                };
                running.abort.abort();
                warn!(job_id = %job_id, worker_id = %evicted.id, "Job lost with evicted worker");
                self.handle_failure(
                    &mut state,
                    running,
                    DispatchError::WorkerLost {
                        worker_id: evicted.id.clone(),
                    },
                    now,
                );
                failed_over += 1;
            }
        }

        let evicted = report.evicted.into_iter().map(|w| w.id).collect();
        (report.unhealthy, evicted, failed_over)
    }

    /// Dequeues and dispatches as many jobs as free capacity allows.
    ///
    /// The budget is `min(available capacity, max_parallel_jobs - running)`.
    /// Only jobs some available worker can run are dequeued.
    pub async fn process_queue_at(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<JoinHandle<()>> {
        let mut queue = self.queue.lock().await;
        let mut pool = self.pool.lock().await;
        let mut state = self.state.lock().await;

        let running = state.running.len();
        let capacity = pool.available_capacity();
        let budget = capacity.min(self.config.max_parallel_jobs.saturating_sub(running));
        if budget == 0 {
            debug!(running, capacity, queued = queue.len(), "No dispatch capacity this tick");
            return Vec::new();
        }

        let mut handles = Vec::with_capacity(budget);
        while handles.len() < budget {
            let Some(job) = queue.dequeue_matching_at(|job| pool.can_accept(job), now) else {
                break;
            };

            let assignment = match pool.assign_job(&job) {
                Ok(assignment) => assignment,
                Err(e) => {
                    debug!(job_id = %job.id, error = %e, "Assignment failed, job returned to queue");
                    queue.requeue_front(job);
                    break;
                }
            };

            let target = job
                .target
                .clone()
                .unwrap_or_else(|| assignment.bound_target.clone());
            state.stats.dispatched += 1;

            info!(
                job_id = %job.id,
                worker_id = %assignment.worker_id,
                target = %target,
                attempt = job.retry_count + 1,
                "Dispatching job"
            );
            self.events.publish(SchedulerEvent::JobDispatched {
                job_id: job.id.clone(),
                worker_id: assignment.worker_id.clone(),
                target: target.clone(),
                attempt: job.retry_count + 1,
            });

            let supervisor = Arc::clone(self);
            let task_job = job.clone();
            let handle = tokio::spawn(async move {
                supervisor.run_job(task_job, target).await;
            });

            state.running.insert(
                job.id.clone(),
                RunningJob {
                    job,
                    worker_id: assignment.worker_id,
                    started_at: now,
                    abort: handle.abort_handle(),
                },
            );
            handles.push(handle);
        }

        handles
    }

    /// Publishes metrics and any advisory alerts.
    pub async fn emit_metrics_at(&self, now: DateTime<Utc>) -> SupervisorMetrics {
        let metrics = self.metrics_at(now).await;

        debug!(
            active_jobs = metrics.active_jobs,
            queued_jobs = metrics.queued_jobs,
            available_workers = metrics.available_workers,
            total_workers = metrics.total_workers,
            "Supervisor metrics"
        );
        self.events.publish(SchedulerEvent::Metrics(metrics.clone()));

        if metrics.queued_jobs > self.config.high_queue_threshold {
            warn!(
                queued = metrics.queued_jobs,
                threshold = self.config.high_queue_threshold,
                "High queue depth"
            );
            self.events.publish(SchedulerEvent::HighQueueAlert {
                queued: metrics.queued_jobs,
                threshold: self.config.high_queue_threshold,
            });
        }

        if metrics.available_workers < self.config.low_workers_threshold {
            warn!(
                available = metrics.available_workers,
                threshold = self.config.low_workers_threshold,
                "Low available workers"
            );
            self.events.publish(SchedulerEvent::LowWorkersAlert {
                available: metrics.available_workers,
                threshold: self.config.low_workers_threshold,
            });
        }

        metrics
    }

    // ------------------------------------------------------------------
    // Job execution
    // ------------------------------------------------------------------

    async fn run_job(self: Arc<Self>, job: Job, target: String) {
        let outcome = self.execute(&job, &target).await;
        self.finish_job(&job.id, outcome).await;
    }

    fn trigger_request(&self, job: &Job, target: &str) -> TriggerRequest {
        TriggerRequest {
            job_id: job.id.clone(),
            target: target.to_string(),
            task_name: job.payload_str("workflow").unwrap_or(&job.job_type).to_string(),
            git_ref: job
                .payload_str("ref")
                .unwrap_or(&self.config.default_ref)
                .to_string(),
            inputs: job.payload.get("inputs").cloned().unwrap_or_else(|| json!({})),
        }
    }

    async fn execute(&self, job: &Job, target: &str) -> Result<String, DispatchError> {
        let request = self.trigger_request(job, target);
        let receipt = self.dispatcher.trigger(&request).await?;
        debug!(job_id = %job.id, run_id = %receipt.run_id, "Run triggered");

        if self.config.await_completion {
            self.wait_for_completion(target, &receipt.run_id).await?;
        }
        Ok(receipt.run_id)
    }

    async fn wait_for_completion(&self, target: &str, run_id: &str) -> Result<(), DispatchError> {
        let attempts = self.config.completion_max_attempts;

        for attempt in 1..=attempts {
            match self.dispatcher.poll_status(target, run_id).await {
                Ok(status) if status.is_completed() => {
                    if status.is_success() {
                        return Ok(());
                    }
                    return Err(DispatchError::RunFailed {
                        run_id: run_id.to_string(),
                        conclusion: status
                            .conclusion
                            .map(|c| c.to_string())
                            .unwrap_or_else(|| "unknown".to_string()),
                    });
                }
                Ok(status) => {
                    debug!(run_id = %run_id, attempt, state = ?status.state, "Run still in progress");
                }
                Err(e) => {
                    warn!(run_id = %run_id, attempt, error = %e, "Status check failed, will retry");
                }
            }

            if attempt < attempts {
                tokio::time::sleep(self.config.completion_poll_interval).await;
            }
        }

        Err(DispatchError::Timeout {
            run_id: run_id.to_string(),
            attempts,
        })
    }

    async fn finish_job(&self, job_id: &str, outcome: Result<String, DispatchError>) {
        let now = Utc::now();
        let mut pool = self.pool.lock().await;
        let mut state = self.state.lock().await;

        let Some(running) = state.running.remove(job_id) else {
            debug!(job_id = %job_id, "Job already finalized");
            return;
        };

        if let Err(e) = pool.release_worker(&running.worker_id, outcome.is_ok()) {
            debug!(job_id = %job_id, error = %e, "Worker gone before release");
        }
        drop(pool);

        let duration_ms = elapsed_ms(running.started_at, now);
        state.stats.total_execution_ms += duration_ms;

        match outcome {
            Ok(run_id) => {
                state.stats.completed += 1;
                info!(
                    job_id = %job_id,
                    worker_id = %running.worker_id,
                    run_id = %run_id,
                    duration_ms,
                    retry_count = running.job.retry_count,
                    "Job completed"
                );
                self.events.publish(SchedulerEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    worker_id: running.worker_id.clone(),
                    run_id: Some(run_id.clone()),
                    duration_ms,
                    retry_count: running.job.retry_count,
                });

                let record = JobRecord {
                    job_id: running.job.id,
                    job_type: running.job.job_type,
                    target: running.job.target,
                    worker_id: Some(running.worker_id),
                    outcome: JobOutcome::Completed,
                    retry_count: running.job.retry_count,
                    started_at: running.started_at,
                    finished_at: now,
                    duration_ms,
                    run_id: Some(run_id),
                    error: None,
                    code: None,
                };
                push_bounded(&mut state.completed, record, self.config.history_limit);
            }
            Err(error) => self.handle_failure(&mut state, running, error, now),
        }
    }

    /// Schedules a retry or fails the job for good.
    fn handle_failure(&self, state: &mut SupervisorState, running: RunningJob, error: DispatchError, now: DateTime<Utc>) {
        let job = running.job;

        if error.is_retryable() && self.retry.should_retry(job.retry_count) {
            let delay = self.retry.delay_for(job.retry_count);
            let next = job.next_attempt();
            state.stats.retried += 1;

            warn!(
                job_id = %job.id,
                error = %error,
                retry_count = next.retry_count,
                delay_ms = delay.as_millis() as u64,
                remaining_retries = self.retry.remaining_retries(next.retry_count),
                "Job failed, scheduling retry"
            );
            self.events.publish(SchedulerEvent::JobRetryScheduled {
                job_id: next.id.clone(),
                retry_count: next.retry_count,
                delay_ms: delay.as_millis() as u64,
                error: error.to_string(),
            });
            state.retries.push(add_duration(now, delay), next);
            return;
        }

        self.fail_terminally(
            state,
            job,
            Some(running.worker_id),
            running.started_at,
            now,
            error.code(),
            error.to_string(),
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn fail_terminally(
        &self,
        state: &mut SupervisorState,
        job: Job,
        worker_id: Option<String>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        code: ErrorCode,
        message: String,
    ) {
        state.stats.failed += 1;

        error!(
            job_id = %job.id,
            code = %code,
            error = %message,
            retry_count = job.retry_count,
            "Job failed permanently"
        );
        self.events.publish(SchedulerEvent::JobFailed {
            job_id: job.id.clone(),
            retry_count: job.retry_count,
            code,
            error: message.clone(),
        });

        let record = JobRecord {
            job_id: job.id,
            job_type: job.job_type,
            target: job.target,
            worker_id,
            outcome: JobOutcome::Failed,
            retry_count: job.retry_count,
            started_at,
            finished_at: now,
            duration_ms: elapsed_ms(started_at, now),
            run_id: None,
            error: Some(message),
            code: Some(code),
        };
        push_bounded(&mut state.failed, record, self.config.history_limit);
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub async fn metrics(&self) -> SupervisorMetrics {
        self.metrics_at(Utc::now()).await
    }

    pub async fn report(&self) -> SupervisorReport {
        self.report_at(Utc::now()).await
    }

    /// Metrics snapshot as of `now`.
    pub async fn metrics_at(&self, now: DateTime<Utc>) -> SupervisorMetrics {
        let queue = self.queue.lock().await;
        let pool = self.pool.lock().await;
        let state = self.state.lock().await;

        SupervisorMetrics {
            timestamp: now,
            active_jobs: state.running.len(),
            queued_jobs: queue.len(),
            pending_retries: state.retries.len(),
            available_workers: pool.available_workers(None).len(),
            total_workers: pool.len(),
            available_capacity: pool.available_capacity(),
            registered_repositories: state.repositories.len(),
            stats: state.stats,
            average_execution_ms: state.stats.average_execution_ms(),
        }
    }

    /// Summary report including queue and pool metrics.
    pub async fn report_at(&self, now: DateTime<Utc>) -> SupervisorReport {
        let metrics = self.metrics_at(now).await;
        let queue = self.queue.lock().await.metrics_at(now);
        let pool = self.pool.lock().await.metrics();
        let state = self.state.lock().await;

        let finished = state.stats.total_finished();
        let (completion_rate, failure_rate) = if finished > 0 {
            (
                state.stats.completed as f64 / finished as f64 * 100.0,
                state.stats.failed as f64 / finished as f64 * 100.0,
            )
        } else {
            (0.0, 0.0)
        };

        SupervisorReport {
            generated_at: now,
            metrics,
            queue,
            pool,
            completion_rate,
            failure_rate,
            completed_history: state.completed.len(),
            failed_history: state.failed.len(),
            recent_failures: state.failed.iter().rev().take(10).cloned().collect(),
        }
    }

    /// Completed jobs, oldest first.
    pub async fn completed_jobs(&self) -> Vec<JobRecord> {
        self.state.lock().await.completed.iter().cloned().collect()
    }

    /// Terminally failed jobs, oldest first.
    pub async fn failed_jobs(&self) -> Vec<JobRecord> {
        self.state.lock().await.failed.iter().cloned().collect()
    }

    /// Jobs currently dispatched.
    pub async fn running_count(&self) -> usize {
        self.state.lock().await.running.len()
    }

    /// Retries waiting for their backoff to elapse.
    pub async fn pending_retries(&self) -> usize {
        self.state.lock().await.retries.len()
    }

    /// Lifetime counters.
    pub async fn stats(&self) -> SupervisorStats {
        self.state.lock().await.stats
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Moves every pending retry into the queue immediately.
    ///
    /// Used on shutdown so retries are persisted with the rest of the queue.
    pub async fn flush_retries(&self) -> usize {
        let mut queue = self.queue.lock().await;
        let mut state = self.state.lock().await;
        let now = Utc::now();

        let mut flushed = 0;
        for job in state.retries.drain_all() {
            let job_id = job.id.clone();
            match queue.enqueue_at(job, now) {
                Ok(()) => flushed += 1,
                Err(e) => warn!(job_id = %job_id, error = %e, "Dropping pending retry on shutdown"),
            }
        }
        flushed
    }

    /// Waits for running jobs to finish.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if jobs are still running
    /// after `timeout`. Their remote runs are not interrupted.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), SchedulerError> {
        info!(running = self.running_count().await, "Waiting for running jobs");

        let drained = async {
            loop {
                if self.state.lock().await.running.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };

        match tokio::time::timeout(timeout, drained).await {
            Ok(()) => {
                info!("Supervisor shutdown complete");
                Ok(())
            }
            Err(_) => Err(SchedulerError::ShutdownTimeout {
                timeout,
                remaining: self.running_count().await,
            }),
        }
    }
}
