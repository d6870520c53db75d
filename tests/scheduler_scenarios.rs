//! End-to-end scheduling scenarios across queue, pool and supervisor.
//!
//! Time-dependent steps use the `*_at(now)` variants so nothing sleeps.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use dispatch_forge::error::ErrorCode;
use dispatch_forge::scheduler::{
    DispatchError, DispatchRequest, EventBus, ExternalDispatcher, Job, JobOutcome, PriorityJobQueue, Priority,
    QueueConfig, RetryPolicy, RunConclusion, RunStatus, SchedulerEvent, Supervisor, SupervisorConfig,
    TriggerReceipt, TriggerRequest, UnregisterOutcome, WorkerPool, WorkerPoolConfig, WorkerSpec, WorkerStatus,
};

/// Dispatcher whose first `failures` triggers fail.
struct FlakyDispatcher {
    failures: StdMutex<u32>,
    triggers: StdMutex<u32>,
}

impl FlakyDispatcher {
    fn failing(failures: u32) -> Self {
        Self {
            failures: StdMutex::new(failures),
            triggers: StdMutex::new(0),
        }
    }

    fn trigger_count(&self) -> u32 {
        *self.triggers.lock().unwrap()
    }
}

#[async_trait]
impl ExternalDispatcher for FlakyDispatcher {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerReceipt, DispatchError> {
        let attempt = {
            let mut triggers = self.triggers.lock().unwrap();
            *triggers += 1;
            *triggers
        };

        let mut failures = self.failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(DispatchError::TriggerFailed {
                target: request.target.clone(),
                task: request.task_name.clone(),
                message: "502 Bad Gateway".to_string(),
            });
        }
        Ok(TriggerReceipt {
            run_id: format!("run-{}", attempt),
        })
    }

    async fn poll_status(&self, _target: &str, _run_id: &str) -> Result<RunStatus, DispatchError> {
        Ok(RunStatus::completed(RunConclusion::Success))
    }
}

fn queue() -> PriorityJobQueue {
    PriorityJobQueue::new(QueueConfig::default(), EventBus::default())
}

fn pool(config: WorkerPoolConfig) -> WorkerPool {
    WorkerPool::new(config, EventBus::default())
}

fn supervisor(dispatcher: Arc<FlakyDispatcher>, events: EventBus) -> Arc<Supervisor> {
    let config = SupervisorConfig::new(10)
        .with_retries(3, Duration::from_millis(1))
        .with_completion_wait(false, Duration::from_millis(1), 1);
    let queue = Arc::new(Mutex::new(PriorityJobQueue::new(QueueConfig::default(), events.clone())));
    let pool = Arc::new(Mutex::new(WorkerPool::new(WorkerPoolConfig::default(), events.clone())));
    Supervisor::new(config, queue, pool, dispatcher, events)
}

/// Ticks far enough ahead that every pending retry is due, then waits for
/// the dispatched jobs to finish.
async fn tick_until_idle(sup: &Arc<Supervisor>, max_ticks: usize) {
    for round in 1..=max_ticks {
        let now: DateTime<Utc> = Utc::now() + chrono::Duration::seconds(round as i64);
        let report = sup.tick_at(now).await;
        for handle in report.dispatched {
            handle.await.unwrap();
        }
        if sup.pending_retries().await == 0 && sup.running_count().await == 0 && sup.queue().lock().await.is_empty()
        {
            return;
        }
    }
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<SchedulerEvent>) -> Vec<SchedulerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ----------------------------------------------------------------------
// Scenarios
// ----------------------------------------------------------------------

#[test]
fn test_critical_job_dequeued_first() {
    let mut q = queue();
    q.enqueue(Job::new("1", "build", Priority::Low)).unwrap();
    q.enqueue(Job::new("2", "build", Priority::Critical)).unwrap();
    q.enqueue(Job::new("3", "build", Priority::Normal)).unwrap();

    let order: Vec<String> = std::iter::from_fn(|| q.dequeue(None)).map(|job| job.id).collect();
    assert_eq!(order, vec!["2", "3", "1"]);
}

#[test]
fn test_single_slot_worker_capacity() {
    let mut p = pool(WorkerPoolConfig::default());
    p.register_worker(
        WorkerSpec::new("w1", "org/app")
            .with_capabilities(["build"])
            .with_max_concurrent_jobs(1),
    )
    .unwrap();

    let first = p.assign_job_to_worker("build", None).unwrap();
    assert_eq!(first.worker_id, "w1");

    let err = p.assign_job_to_worker("build", None).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoAvailableWorker);

    p.release_worker("w1", true).unwrap();
    assert!(p.assign_job_to_worker("build", None).is_ok());
}

#[test]
fn test_expired_job_is_swept_once() {
    let now = Utc::now();
    let mut q = queue();
    q.enqueue_at(
        Job::new("stale", "build", Priority::High).with_max_wait(Duration::from_secs(1)),
        now - chrono::Duration::seconds(2),
    )
    .unwrap();

    assert_eq!(q.sweep_expired_at(now), 1);
    assert!(q.dequeue_at(None, now).is_none());
    assert_eq!(q.sweep_expired_at(now), 0);
}

#[test]
fn test_silent_worker_recovers_on_heartbeat() {
    let timeout = Duration::from_secs(30);
    let mut p = pool(WorkerPoolConfig::default().with_heartbeat_timeout(timeout));
    let registered = Utc::now();
    p.register_worker_at(WorkerSpec::new("w2", "org/app"), registered)
        .unwrap();

    let late = registered + chrono::Duration::milliseconds(30_001);
    let report = p.health_check_at(late);
    assert_eq!(report.unhealthy, vec!["w2".to_string()]);
    assert_eq!(p.get_worker("w2").unwrap().status, WorkerStatus::Unhealthy);

    p.update_heartbeat_at("w2", late).unwrap();
    assert_eq!(p.get_worker("w2").unwrap().status, WorkerStatus::Available);
}

#[tokio::test]
async fn test_dispatch_succeeds_after_two_failures() {
    let dispatcher = Arc::new(FlakyDispatcher::failing(2));
    let sup = supervisor(Arc::clone(&dispatcher), EventBus::default());

    let job_id = sup
        .dispatch_job(DispatchRequest::new("org/app", "ci.yml"))
        .await
        .unwrap();
    tick_until_idle(&sup, 10).await;

    let completed = sup.completed_jobs().await;
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].job_id, job_id);
    assert_eq!(completed[0].outcome, JobOutcome::Completed);
    assert_eq!(completed[0].retry_count, 2);
    assert!(sup.failed_jobs().await.is_empty());
    assert_eq!(dispatcher.trigger_count(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_fail_exactly_once() {
    let events = EventBus::default();
    let mut rx = events.subscribe();
    let dispatcher = Arc::new(FlakyDispatcher::failing(u32::MAX));
    let sup = supervisor(Arc::clone(&dispatcher), events);

    let job_id = sup
        .dispatch_job(DispatchRequest::new("org/app", "ci.yml"))
        .await
        .unwrap();
    tick_until_idle(&sup, 10).await;

    let failed = sup.failed_jobs().await;
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].job_id, job_id);
    assert_eq!(failed[0].retry_count, 3);
    assert_eq!(failed[0].code, Some(ErrorCode::DispatchFailed));
    assert!(sup.completed_jobs().await.is_empty());
    assert_eq!(dispatcher.trigger_count(), 4);

    let terminal = drain_events(&mut rx)
        .into_iter()
        .filter(|event| matches!(event, SchedulerEvent::JobFailed { .. }))
        .count();
    assert_eq!(terminal, 1);
    assert_eq!(sup.stats().await.retried, 3);
}

// ----------------------------------------------------------------------
// Properties
// ----------------------------------------------------------------------

#[test]
fn test_never_dequeues_normal_while_high_waits() {
    let mut q = queue();
    for i in 0..5 {
        q.enqueue(Job::new(format!("n{}", i), "build", Priority::Normal)).unwrap();
        q.enqueue(Job::new(format!("h{}", i), "build", Priority::High)).unwrap();
    }

    let mut seen_normal = false;
    while let Some(job) = q.dequeue(None) {
        match job.priority {
            Priority::Normal => seen_normal = true,
            Priority::High => assert!(!seen_normal, "high job {} dequeued after a normal job", job.id),
            _ => unreachable!(),
        }
    }
}

#[test]
fn test_fifo_within_tier() {
    let mut q = queue();
    for id in ["a", "b", "c"] {
        q.enqueue(Job::new(id, "build", Priority::Normal)).unwrap();
    }

    assert_eq!(q.dequeue(None).unwrap().id, "a");
    assert_eq!(q.dequeue(None).unwrap().id, "b");
    assert_eq!(q.dequeue(None).unwrap().id, "c");
}

#[test]
fn test_active_jobs_never_exceed_limit() {
    let mut p = pool(WorkerPoolConfig::default());
    p.register_worker(
        WorkerSpec::new("w1", "org/app")
            .with_capabilities(["build"])
            .with_max_concurrent_jobs(3),
    )
    .unwrap();

    let placed = (0..10)
        .filter(|_| p.assign_job_to_worker("build", None).is_ok())
        .count();
    assert_eq!(placed, 3);

    let worker = p.get_worker("w1").unwrap();
    assert!(worker.active_jobs <= worker.max_concurrent_jobs);
    assert_eq!(worker.status, WorkerStatus::Busy);
}

#[test]
fn test_draining_worker_removed_after_last_release() {
    let mut p = pool(WorkerPoolConfig::default());
    p.register_worker(
        WorkerSpec::new("w1", "org/app")
            .with_capabilities(["build"])
            .with_max_concurrent_jobs(2),
    )
    .unwrap();
    p.assign_job_to_worker("build", None).unwrap();
    p.assign_job_to_worker("build", None).unwrap();

    assert_eq!(p.unregister_worker("w1"), UnregisterOutcome::Draining);
    assert_eq!(p.get_worker("w1").unwrap().status, WorkerStatus::Draining);
    assert!(p.assign_job_to_worker("build", None).is_err());

    p.release_worker("w1", true).unwrap();
    assert!(p.get_worker("w1").is_some());
    p.release_worker("w1", true).unwrap();
    assert!(p.all_workers().is_empty());
}

#[test]
fn test_expired_jobs_never_dequeued_without_sweep() {
    let now = Utc::now();
    let mut q = queue();
    q.enqueue_at(
        Job::new("old", "build", Priority::Critical).with_max_wait(Duration::from_millis(10)),
        now - chrono::Duration::seconds(1),
    )
    .unwrap();
    q.enqueue_at(Job::new("fresh", "build", Priority::Low), now).unwrap();

    assert_eq!(q.dequeue_at(None, now).unwrap().id, "fresh");
    assert_eq!(q.sweep_expired_at(now), 0);
}

#[test]
fn test_retry_backoff_grows_until_ceiling() {
    let config = SupervisorConfig::new(10).with_retries(6, Duration::from_secs(5));
    let policy: RetryPolicy = config.retry_policy();
    assert!(policy.fits_ceiling());

    let delays: Vec<Duration> = (0..policy.max_retries).map(|n| policy.delay_for(n)).collect();
    for pair in delays.windows(2) {
        assert!(pair[1] > pair[0], "delay did not strictly increase: {:?} -> {:?}", pair[0], pair[1]);
    }
    assert_eq!(delays[0], Duration::from_secs(5));
    assert_eq!(delays[5], Duration::from_secs(160));
}

#[tokio::test]
async fn test_unregister_idle_repository() {
    let dispatcher = Arc::new(FlakyDispatcher::failing(0));
    let sup = supervisor(dispatcher, EventBus::default());
    sup.register_repository("org/app").await.unwrap();

    assert_eq!(sup.unregister_repository("org/app").await, UnregisterOutcome::Removed);
    assert_eq!(sup.unregister_repository("org/app").await, UnregisterOutcome::NotFound);
    assert!(sup.repositories().await.is_empty());
}
