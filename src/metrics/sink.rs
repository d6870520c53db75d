//! Observability sinks fed from the scheduler event bus.
//!
//! A sink receives every [`SchedulerEvent`] on its own task. Sinks never
//! block scheduling: if one falls behind the bus, the missed events are
//! dropped and a warning is logged.

use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use super::collectors::MetricsCollector;
use crate::scheduler::{EventBus, SchedulerEvent};

/// Destination for scheduler events.
pub trait MetricsSink: Send + Sync {
    /// Handles one event. Must not block.
    fn emit(&self, event: &SchedulerEvent);
}

/// Writes every event as a structured log line.
#[derive(Debug, Clone, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn new() -> Self {
        Self
    }
}

impl MetricsSink for TracingSink {
    fn emit(&self, event: &SchedulerEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        if event.is_alert() {
            warn!(event = event.name(), payload = %payload, "Scheduler alert");
        } else {
            debug!(event = event.name(), payload = %payload, "Scheduler event");
        }
    }
}

/// Updates the Prometheus registry from events.
#[derive(Debug, Clone, Default)]
pub struct PrometheusSink {
    collector: MetricsCollector,
}

impl PrometheusSink {
    pub fn new() -> Self {
        Self {
            collector: MetricsCollector::new(),
        }
    }
}

impl MetricsSink for PrometheusSink {
    fn emit(&self, event: &SchedulerEvent) {
        match event {
            SchedulerEvent::JobEnqueued { priority, .. } => self.collector.record_enqueued(priority.as_str()),
            SchedulerEvent::JobDequeued { priority, wait_ms, .. } => {
                self.collector.record_wait(priority.as_str(), *wait_ms)
            }
            SchedulerEvent::JobExpired { .. } => self.collector.record_outcome("expired", None),
            SchedulerEvent::JobCompleted { duration_ms, .. } => {
                self.collector.record_outcome("completed", Some(*duration_ms))
            }
            SchedulerEvent::JobRetryScheduled { .. } => self.collector.record_outcome("retried", None),
            SchedulerEvent::JobFailed { .. } => self.collector.record_outcome("failed", None),
            SchedulerEvent::WorkerRegistered { .. } => self.collector.record_worker_event("registered"),
            SchedulerEvent::WorkerUnregistered { .. } => self.collector.record_worker_event("unregistered"),
            SchedulerEvent::WorkerDraining { .. } => self.collector.record_worker_event("draining"),
            SchedulerEvent::WorkerUnhealthy { .. } => self.collector.record_worker_event("unhealthy"),
            SchedulerEvent::WorkerRecovered { .. } => self.collector.record_worker_event("recovered"),
            SchedulerEvent::WorkerEvicted { .. } => self.collector.record_worker_event("evicted"),
            SchedulerEvent::Metrics(metrics) => self.collector.update_snapshot(metrics),
            SchedulerEvent::HighQueueAlert { .. } => self.collector.record_alert("high_queue"),
            SchedulerEvent::LowWorkersAlert { .. } => self.collector.record_alert("low_workers"),
            _ => {}
        }
    }
}

/// Forwards every event on `bus` to `sink` until the bus closes.
pub fn spawn_sink<S>(bus: &EventBus, sink: S) -> JoinHandle<()>
where
    S: MetricsSink + 'static,
{
    let mut stream = BroadcastStream::new(bus.subscribe());

    tokio::spawn(async move {
        while let Some(item) = stream.next().await {
            match item {
                Ok(event) => sink.emit(&event),
                Err(BroadcastStreamRecvError::Lagged(missed)) => {
                    warn!(missed, "Metrics sink lagged behind event bus");
                }
            }
        }
        info!("Event bus closed, metrics sink stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::Priority;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct RecordingSink {
        names: Arc<Mutex<Vec<&'static str>>>,
    }

    impl MetricsSink for RecordingSink {
        fn emit(&self, event: &SchedulerEvent) {
            self.names.lock().unwrap().push(event.name());
        }
    }

    #[tokio::test]
    async fn test_spawn_sink_forwards_events() {
        let bus = EventBus::new(16);
        let sink = RecordingSink::default();
        let handle = spawn_sink(&bus, sink.clone());

        bus.publish(SchedulerEvent::WorkerRecovered {
            worker_id: "w1".to_string(),
        });
        bus.publish(SchedulerEvent::LowWorkersAlert {
            available: 0,
            threshold: 2,
        });
        drop(bus);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            *sink.names.lock().unwrap(),
            vec!["worker:recovered", "alert:low_workers"]
        );
    }

    #[test]
    fn test_prometheus_sink_handles_all_events() {
        let _ = crate::metrics::init_metrics();
        let sink = PrometheusSink::new();

        sink.emit(&SchedulerEvent::JobEnqueued {
            job_id: "j1".to_string(),
            job_type: "build".to_string(),
            priority: Priority::High,
            queue_size: 1,
        });
        sink.emit(&SchedulerEvent::HighQueueAlert {
            queued: 150,
            threshold: 100,
        });

        let text = crate::metrics::export_metrics();
        assert!(text.contains("kind=\"high_queue\""));
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        let sink = TracingSink::new();
        sink.emit(&SchedulerEvent::RepositoryUnregistered {
            target: "org/app".to_string(),
        });
    }
}
