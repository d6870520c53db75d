//! Top-level orchestrator owning the scheduler components and their timers.
//!
//! The `Orchestrator` constructs and injects everything:
//! - The event bus shared by queue, pool and supervisor
//! - The priority queue, optionally mirrored to a job store
//! - The worker pool and the supervisor driving it
//! - The slot optimizer fed from periodic samples and completion events
//!
//! [`Orchestrator::run`] drives five timers (poll tick, expiry sweep, health
//! sweep, slot sampling, summary report) until a shutdown signal arrives.
//! [`Orchestrator::shutdown`] then waits for running jobs and persists the
//! queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::SchedulerError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{
    DispatchRequest, EventBus, ExternalDispatcher, Job, JobSubmission, PriorityJobQueue, SchedulerEvent,
    SlotAllocation, SlotOptimizer, Supervisor, SupervisorReport, UtilizationReport, UtilizationStatus,
    WorkerPool, WorkerSpec,
};
use crate::storage::{spawn_persistence, JobStore, RedisJobStore};

/// How long shutdown waits for the persistence writer to drain.
const PERSISTENCE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns and runs the scheduling core.
pub struct Orchestrator {
    config: OrchestratorConfig,
    events: EventBus,
    supervisor: Arc<Supervisor>,
    slots: Mutex<SlotOptimizer>,
    writer: Mutex<Option<JoinHandle<()>>>,
    collector: MetricsCollector,
}

impl Orchestrator {
    /// Builds an orchestrator with an in-memory queue only.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Config` if the configuration is invalid.
    pub fn new(config: OrchestratorConfig, dispatcher: Arc<dyn ExternalDispatcher>) -> Result<Self, SchedulerError> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);
        let queue = PriorityJobQueue::new(config.queue.clone(), events.clone());
        Ok(Self::assemble(config, dispatcher, events, queue, None))
    }

    /// Builds an orchestrator whose queue is mirrored to `store`.
    ///
    /// Jobs already in the store are restored into the queue first. A store
    /// that cannot be read is logged and the queue starts empty.
    pub async fn with_store(
        config: OrchestratorConfig,
        dispatcher: Arc<dyn ExternalDispatcher>,
        store: Arc<dyn JobStore>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let events = EventBus::new(config.event_capacity);

        let persisted = match store.load_all().await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted jobs, starting with an empty queue");
                Vec::new()
            }
        };

        let (handle, writer) = spawn_persistence(store);
        let mut queue = PriorityJobQueue::new(config.queue.clone(), events.clone()).with_persistence(handle);
        if !persisted.is_empty() {
            queue.restore(persisted);
        }

        Ok(Self::assemble(config, dispatcher, events, queue, Some(writer)))
    }

    /// Builds an orchestrator, connecting to Redis when persistence is enabled.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::Store` if Redis cannot be reached.
    pub async fn connect(
        config: OrchestratorConfig,
        dispatcher: Arc<dyn ExternalDispatcher>,
    ) -> Result<Self, SchedulerError> {
        if !config.queue.persistence_enabled {
            return Self::new(config, dispatcher);
        }

        let store = RedisJobStore::connect(&config.redis_url, &config.queue.key_prefix).await?;
        Self::with_store(config, dispatcher, Arc::new(store)).await
    }

    fn assemble(
        config: OrchestratorConfig,
        dispatcher: Arc<dyn ExternalDispatcher>,
        events: EventBus,
        queue: PriorityJobQueue,
        writer: Option<JoinHandle<()>>,
    ) -> Self {
        let pool = WorkerPool::new(config.pool.clone(), events.clone());
        let supervisor = Supervisor::new(
            config.supervisor.clone(),
            Arc::new(Mutex::new(queue)),
            Arc::new(Mutex::new(pool)),
            dispatcher,
            events.clone(),
        );
        let slots = SlotOptimizer::new(config.slots.clone());

        info!(
            max_queue_size = config.queue.max_queue_size,
            max_workers = config.pool.max_workers,
            max_parallel_jobs = config.supervisor.max_parallel_jobs,
            persistence = writer.is_some(),
            "Orchestrator initialized"
        );

        Self {
            config,
            events,
            supervisor,
            slots: Mutex::new(slots),
            writer: Mutex::new(writer),
            collector: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    // ------------------------------------------------------------------
    // Producer API
    // ------------------------------------------------------------------

    /// Admits a job. Returns its id.
    pub async fn submit(&self, submission: JobSubmission) -> Result<String, SchedulerError> {
        Ok(self.supervisor.queue().lock().await.submit(submission)?)
    }

    /// Queues a workflow run on a repository. Returns the job id.
    pub async fn dispatch(&self, request: DispatchRequest) -> Result<String, SchedulerError> {
        self.supervisor.dispatch_job(request).await
    }

    /// Removes a queued job.
    pub async fn cancel(&self, job_id: &str) -> Option<Job> {
        self.supervisor.queue().lock().await.remove(job_id)
    }

    /// Registers a worker.
    pub async fn register_worker(&self, spec: WorkerSpec) -> Result<(), SchedulerError> {
        Ok(self.supervisor.pool().lock().await.register_worker(spec)?)
    }

    /// Refreshes a worker's heartbeat.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<(), SchedulerError> {
        Ok(self.supervisor.pool().lock().await.update_heartbeat(worker_id)?)
    }

    /// Registers repositories given on the command line or in config.
    pub async fn register_repositories<I, S>(&self, targets: I) -> Result<(), SchedulerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for target in targets {
            self.supervisor.register_repository(target.as_ref()).await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Slots
    // ------------------------------------------------------------------

    /// Samples current slot usage into the optimizer.
    pub async fn sample_slots(&self) -> UtilizationStatus {
        let used = self.supervisor.running_count().await;
        let queued = self.supervisor.queue().lock().await.len();

        let mut slots = self.slots.lock().await;
        let status = slots.record_sample(used, queued);
        let max_slots = slots.config().max_slots;
        if max_slots > 0 {
            self.collector.update_slot_utilization(used as f64 / max_slots as f64);
        }
        status
    }

    /// Plans slot usage for the jobs currently queued.
    pub async fn plan_queued(&self) -> SlotAllocation {
        let queued = self.supervisor.queue().lock().await.len();
        self.slots.lock().await.calculate_allocation(queued, None)
    }

    pub async fn slot_report(&self) -> UtilizationReport {
        self.slots.lock().await.utilization_report()
    }

    async fn record_event(&self, event: &SchedulerEvent) {
        if let SchedulerEvent::JobCompleted {
            job_id, duration_ms, ..
        } = event
        {
            let minutes = *duration_ms as f64 / 60_000.0;
            self.slots.lock().await.record_job_execution(job_id, minutes);
        }
    }

    // ------------------------------------------------------------------
    // Run loop
    // ------------------------------------------------------------------

    /// Runs the timers until `shutdown` fires or its sender is dropped.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut poll = tokio::time::interval(self.config.supervisor.polling_interval);
        let mut cleanup = tokio::time::interval(self.config.queue.cleanup_interval);
        let mut health = tokio::time::interval(self.config.pool.health_check_interval);
        let mut sample = tokio::time::interval(self.config.slots.sample_interval);
        let mut report = tokio::time::interval(self.config.report_interval);
        for timer in [&mut poll, &mut cleanup, &mut health, &mut sample, &mut report] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        // The first tick of an interval completes immediately.
        report.tick().await;

        let mut events = self.events.subscribe();

        info!(
            polling_interval_ms = self.config.supervisor.polling_interval.as_millis() as u64,
            "Orchestrator running"
        );

        loop {
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    info!("Orchestrator received shutdown signal");
                    break;
                }
                _ = poll.tick() => {
                    let tick = self.supervisor.tick().await;
                    debug!(
                        dispatched = tick.dispatched.len(),
                        retries_released = tick.retries_released,
                        evicted = tick.evicted_workers.len(),
                        "Poll tick complete"
                    );
                }
                _ = cleanup.tick() => {
                    let expired = self.supervisor.queue().lock().await.sweep_expired();
                    if expired > 0 {
                        info!(expired, "Expired jobs removed from queue");
                    }
                }
                _ = health.tick() => {
                    let (unhealthy, evicted, failed_over) =
                        self.supervisor.check_worker_health_at(Utc::now()).await;
                    if !unhealthy.is_empty() || !evicted.is_empty() {
                        warn!(
                            unhealthy = unhealthy.len(),
                            evicted = evicted.len(),
                            failed_over,
                            "Worker health sweep found problems"
                        );
                    }
                }
                _ = sample.tick() => {
                    self.sample_slots().await;
                }
                _ = report.tick() => {
                    self.log_report().await;
                }
                event = events.recv() => match event {
                    Ok(event) => self.record_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Orchestrator lagged behind event bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!("Event bus closed");
                        break;
                    }
                },
            }
        }

        info!("Orchestrator stopped");
    }

    async fn log_report(&self) {
        let report = self.supervisor.report().await;
        let slots = self.slot_report().await;
        info!(
            completed = report.metrics.stats.completed,
            failed = report.metrics.stats.failed,
            retried = report.metrics.stats.retried,
            completion_rate = report.completion_rate,
            queued = report.metrics.queued_jobs,
            workers = report.metrics.total_workers,
            slot_utilization = slots.average_utilization,
            "Orchestrator report"
        );
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stops scheduling gracefully.
    ///
    /// Pending retries are moved into the queue, running jobs are awaited up
    /// to the configured timeout, and every queued job is re-saved to the
    /// store. Returns the final report.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::ShutdownTimeout` if jobs were still running
    /// at the deadline. The queue is persisted either way.
    pub async fn shutdown(&self) -> Result<SupervisorReport, SchedulerError> {
        info!("Initiating orchestrator shutdown");

        let flushed = self.supervisor.flush_retries().await;
        if flushed > 0 {
            info!(flushed, "Pending retries returned to queue");
        }

        let waited = self
            .supervisor
            .shutdown(self.config.supervisor.shutdown_timeout)
            .await;
        if let Err(e) = &waited {
            warn!(error = %e, "Running jobs did not finish before shutdown deadline");
        }

        self.persist_queue().await;
        let report = self.supervisor.report().await;

        waited.map(|()| report)
    }

    async fn persist_queue(&self) {
        let handle = {
            let mut queue = self.supervisor.queue().lock().await;
            let saved = queue.persist_all();
            if saved > 0 {
                info!(saved, "Queued jobs persisted");
            }
            queue.detach_persistence()
        };
        drop(handle);

        let Some(writer) = self.writer.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(PERSISTENCE_DRAIN_TIMEOUT, writer).await {
            Ok(Ok(())) => debug!("Persistence writer drained"),
            Ok(Err(e)) => warn!(error = %e, "Persistence writer task failed"),
            Err(_) => warn!("Persistence writer did not drain in time"),
        }
    }
}
