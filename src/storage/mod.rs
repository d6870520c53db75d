//! Best-effort persistence for queued jobs.
//!
//! The in-memory queue is the source of truth. When persistence is enabled it
//! mirrors every admission and removal to a [`JobStore`] through a
//! [`PersistenceHandle`]: operations go over an unbounded channel to a
//! background writer task that applies them in order and logs failures. The
//! queue never awaits a store call, so a slow or broken store cannot fail or
//! stall scheduling.
//!
//! # Usage
//!
//! ```rust,ignore
//! use dispatch_forge::storage::{spawn_persistence, RedisJobStore};
//! use std::sync::Arc;
//!
//! let store = Arc::new(RedisJobStore::connect("redis://localhost:6379", "dispatch").await?);
//! let (handle, writer) = spawn_persistence(store.clone());
//! let queue = PriorityJobQueue::new(config, events).with_persistence(handle);
//!
//! // On restart
//! let jobs = store.load_all().await?;
//! queue.restore(jobs);
//! ```

pub mod redis_store;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::scheduler::job::Job;

pub use redis_store::RedisJobStore;

/// Errors raised by a job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to connect to the backing store.
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    /// Failed to (de)serialize a job record.
    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store-specific failure.
    #[error("Store operation failed: {0}")]
    Backend(String),
}

/// Key-value mirror of queued jobs.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Saves (or overwrites) a job.
    async fn save(&self, job: &Job) -> Result<(), StoreError>;

    /// Removes a job by id. Removing an unknown id is not an error.
    async fn remove(&self, job_id: &str) -> Result<(), StoreError>;

    /// Loads every stored job.
    async fn load_all(&self) -> Result<Vec<Job>, StoreError>;
}

/// A single mirrored mutation.
#[derive(Debug, Clone)]
pub enum PersistOp {
    Save(Box<Job>),
    Remove(String),
}

/// Fire-and-log sender used by the queue.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistOp>,
}

impl PersistenceHandle {
    /// Queues a save of `job`.
    pub fn save(&self, job: &Job) {
        self.send(PersistOp::Save(Box::new(job.clone())));
    }

    /// Queues a removal of `job_id`.
    pub fn remove(&self, job_id: &str) {
        self.send(PersistOp::Remove(job_id.to_string()));
    }

    fn send(&self, op: PersistOp) {
        if self.tx.send(op).is_err() {
            debug!("Persistence writer stopped, dropping operation");
        }
    }
}

/// Starts the background writer for `store`.
///
/// The writer exits once every [`PersistenceHandle`] clone has been dropped
/// and the backlog is drained.
pub fn spawn_persistence(store: Arc<dyn JobStore>) -> (PersistenceHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();

    let writer = tokio::spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                PersistOp::Save(job) => {
                    if let Err(e) = store.save(&job).await {
                        warn!(job_id = %job.id, error = %e, "Failed to persist job");
                    }
                }
                PersistOp::Remove(job_id) => {
                    if let Err(e) = store.remove(&job_id).await {
                        warn!(job_id = %job_id, error = %e, "Failed to remove persisted job");
                    }
                }
            }
        }
        debug!("Persistence writer finished");
    });

    (PersistenceHandle { tx }, writer)
}

/// In-process store, mainly for tests and single-node runs.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns a stored job by id.
    pub fn get(&self, job_id: &str) -> Option<Job> {
        self.jobs
            .lock()
            .ok()
            .and_then(|jobs| jobs.get(job_id).cloned())
    }

    fn poisoned() -> StoreError {
        StoreError::Backend("memory store lock poisoned".to_string())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::poisoned())?;
        jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock().map_err(|_| Self::poisoned())?;
        jobs.remove(job_id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let jobs = self.jobs.lock().map_err(|_| Self::poisoned())?;
        Ok(jobs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::Priority;

    struct FailingStore;

    #[async_trait]
    impl JobStore for FailingStore {
        async fn save(&self, _job: &Job) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".to_string()))
        }

        async fn remove(&self, _job_id: &str) -> Result<(), StoreError> {
            Err(StoreError::Backend("disk full".to_string()))
        }

        async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_memory_store_roundtrip() {
        let store = MemoryJobStore::new();
        let job = Job::new("j1", "build", Priority::High);

        store.save(&job).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("j1").unwrap().priority, Priority::High);

        store.remove("j1").await.unwrap();
        store.remove("missing").await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_writer_applies_ops_in_order() {
        let store = Arc::new(MemoryJobStore::new());
        let (handle, writer) = spawn_persistence(store.clone());

        let job = Job::new("j1", "build", Priority::Normal);
        handle.save(&job);
        handle.remove("j1");
        handle.save(&Job::new("j2", "build", Priority::Low));
        drop(handle);

        writer.await.unwrap();
        assert!(store.get("j1").is_none());
        assert!(store.get("j2").is_some());
    }

    #[tokio::test]
    async fn test_writer_survives_store_failures() {
        let (handle, writer) = spawn_persistence(Arc::new(FailingStore));

        handle.save(&Job::new("j1", "build", Priority::Normal));
        handle.remove("j1");
        drop(handle);

        // Failures are logged, the writer still drains and exits cleanly.
        writer.await.unwrap();
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("refused"));
    }
}
