//! Redis-backed job store.
//!
//! Each queued job is stored as a JSON string under
//! `{prefix}:queue:{priority}:{job_id}` with a TTL equal to the job's
//! remaining max-wait, so Redis expires abandoned entries on its own.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, warn};

use super::{JobStore, StoreError};
use crate::scheduler::job::{Job, Priority};

/// Shortest TTL written to Redis.
const MIN_TTL_SECS: u64 = 1;

/// Job store backed by Redis string keys.
pub struct RedisJobStore {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    /// Key prefix shared by every job key.
    prefix: String,
}

impl RedisJobStore {
    /// Connects to Redis.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, prefix))
    }

    /// Creates a store from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, prefix: &str) -> Self {
        Self {
            redis,
            prefix: prefix.to_string(),
        }
    }

    /// Key under which `job_id` is stored for `priority`.
    pub fn job_key(&self, priority: Priority, job_id: &str) -> String {
        job_key(&self.prefix, priority, job_id)
    }

    fn scan_pattern(&self) -> String {
        format!("{}:queue:*", self.prefix)
    }
}

pub(crate) fn job_key(prefix: &str, priority: Priority, job_id: &str) -> String {
    format!("{}:queue:{}:{}", prefix, priority, job_id)
}

/// TTL in seconds for a job saved at the current time.
pub(crate) fn ttl_secs(job: &Job) -> u64 {
    let remaining: Duration = job.remaining_ttl(Utc::now());
    remaining.as_secs().max(MIN_TTL_SECS)
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn save(&self, job: &Job) -> Result<(), StoreError> {
        let serialized = serde_json::to_string(job)?;
        let key = self.job_key(job.priority, &job.id);
        let mut conn = self.redis.clone();
        redis::cmd("SET")
            .arg(&key)
            .arg(serialized)
            .arg("EX")
            .arg(ttl_secs(job))
            .query_async::<_, ()>(&mut conn)
            .await?;
        debug!(job_id = %job.id, key = %key, "Persisted job");
        Ok(())
    }

    async fn remove(&self, job_id: &str) -> Result<(), StoreError> {
        // The priority may have changed since the last save, so clear every tier.
        let mut pipe = redis::pipe();
        for priority in Priority::ALL {
            pipe.del(self.job_key(priority, job_id)).ignore();
        }
        let mut conn = self.redis.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Job>, StoreError> {
        let mut conn = self.redis.clone();
        let keys: Vec<String> = conn.keys(self.scan_pattern()).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await?;

        let mut jobs = Vec::with_capacity(values.len());
        for (key, value) in keys.iter().zip(values) {
            let Some(raw) = value else {
                continue;
            };
            match serde_json::from_str::<Job>(&raw) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(key = %key, error = %e, "Skipping unreadable persisted job"),
            }
        }

        Ok(jobs)
    }
}
