//! Typed scheduler events and the broadcast bus that carries them.
//!
//! Every state transition in the queue, pool and supervisor publishes a
//! [`SchedulerEvent`]. Consumers (log sinks, Prometheus, tests) subscribe
//! explicitly through [`EventBus::subscribe`]. Publishing never blocks and
//! never fails: with no subscribers the event is dropped, and a subscriber
//! that falls behind sees `Lagged` instead of slowing the scheduler down.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::job::Priority;
use super::supervisor::SupervisorMetrics;
use crate::error::ErrorCode;

/// Default number of events buffered per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// State-change notification published by the scheduling core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobEnqueued {
        job_id: String,
        job_type: String,
        priority: Priority,
        queue_size: usize,
    },
    JobDequeued {
        job_id: String,
        priority: Priority,
        wait_ms: u64,
    },
    JobRemoved {
        job_id: String,
        priority: Priority,
    },
    JobPriorityChanged {
        job_id: String,
        from: Priority,
        to: Priority,
    },
    JobExpired {
        job_id: String,
        priority: Priority,
        waited_ms: u64,
    },
    WorkerRegistered {
        worker_id: String,
        target: String,
        capabilities: Vec<String>,
        updated: bool,
    },
    WorkerUnregistered {
        worker_id: String,
    },
    WorkerDraining {
        worker_id: String,
        active_jobs: usize,
    },
    WorkerUnhealthy {
        worker_id: String,
        since_heartbeat_ms: u64,
    },
    WorkerRecovered {
        worker_id: String,
    },
    WorkerEvicted {
        worker_id: String,
        active_jobs: usize,
    },
    JobAssigned {
        worker_id: String,
        job_type: String,
        active_jobs: usize,
    },
    JobReleased {
        worker_id: String,
        success: bool,
        active_jobs: usize,
    },
    RepositoryRegistered {
        target: String,
        worker_id: String,
    },
    RepositoryUnregistered {
        target: String,
    },
    JobDispatched {
        job_id: String,
        worker_id: String,
        target: String,
        attempt: u32,
    },
    JobCompleted {
        job_id: String,
        worker_id: String,
        run_id: Option<String>,
        duration_ms: u64,
        retry_count: u32,
    },
    JobRetryScheduled {
        job_id: String,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    JobFailed {
        job_id: String,
        retry_count: u32,
        code: ErrorCode,
        error: String,
    },
    Metrics(SupervisorMetrics),
    HighQueueAlert {
        queued: usize,
        threshold: usize,
    },
    LowWorkersAlert {
        available: usize,
        threshold: usize,
    },
}

impl SchedulerEvent {
    /// Stable `domain:action` name, used as the metric/log label.
    pub fn name(&self) -> &'static str {
        match self {
            SchedulerEvent::JobEnqueued { .. } => "job:enqueued",
            SchedulerEvent::JobDequeued { .. } => "job:dequeued",
            SchedulerEvent::JobRemoved { .. } => "job:removed",
            SchedulerEvent::JobPriorityChanged { .. } => "job:priority_changed",
            SchedulerEvent::JobExpired { .. } => "job:expired",
            SchedulerEvent::WorkerRegistered { .. } => "worker:registered",
            SchedulerEvent::WorkerUnregistered { .. } => "worker:unregistered",
            SchedulerEvent::WorkerDraining { .. } => "worker:draining",
            SchedulerEvent::WorkerUnhealthy { .. } => "worker:unhealthy",
            SchedulerEvent::WorkerRecovered { .. } => "worker:recovered",
            SchedulerEvent::WorkerEvicted { .. } => "worker:evicted",
            SchedulerEvent::JobAssigned { .. } => "job:assigned",
            SchedulerEvent::JobReleased { .. } => "job:released",
            SchedulerEvent::RepositoryRegistered { .. } => "repository:registered",
            SchedulerEvent::RepositoryUnregistered { .. } => "repository:unregistered",
            SchedulerEvent::JobDispatched { .. } => "job:dispatched",
            SchedulerEvent::JobCompleted { .. } => "job:completed",
            SchedulerEvent::JobRetryScheduled { .. } => "job:retry_scheduled",
            SchedulerEvent::JobFailed { .. } => "job:failed",
            SchedulerEvent::Metrics(_) => "metrics",
            SchedulerEvent::HighQueueAlert { .. } => "alert:high_queue",
            SchedulerEvent::LowWorkersAlert { .. } => "alert:low_workers",
        }
    }

    /// Returns true for advisory alert events.
    pub fn is_alert(&self) -> bool {
        matches!(
            self,
            SchedulerEvent::HighQueueAlert { .. } | SchedulerEvent::LowWorkersAlert { .. }
        )
    }
}

/// Cloneable handle to the broadcast channel carrying [`SchedulerEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Creates a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to all events published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Publishes an event. Dropped silently when nobody is listening.
    pub fn publish(&self, event: SchedulerEvent) {
        let _ = self.tx.send(event);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = SchedulerEvent::JobExpired {
            job_id: "j1".to_string(),
            priority: Priority::Low,
            waited_ms: 10,
        };
        assert_eq!(event.name(), "job:expired");
        assert!(!event.is_alert());

        let alert = SchedulerEvent::HighQueueAlert {
            queued: 150,
            threshold: 100,
        };
        assert_eq!(alert.name(), "alert:high_queue");
        assert!(alert.is_alert());
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = SchedulerEvent::WorkerRecovered {
            worker_id: "w1".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "worker_recovered");
        assert_eq!(value["worker_id"], "w1");
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(SchedulerEvent::WorkerUnregistered {
            worker_id: "w1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "worker:unregistered");
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(SchedulerEvent::RepositoryUnregistered {
            target: "org/repo".to_string(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }
}
