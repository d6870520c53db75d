//! Job definitions for the scheduler.
//!
//! This module defines the core job types used in the scheduling system:
//!
//! - `Priority`: One of the four fixed queue tiers
//! - `Job`: A unit of work waiting in, or dispatched from, the queue
//! - `JobSubmission`: The string-typed form producers submit
//! - `JobRecord`: A finished job kept in the supervisor's history

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::queue::QueueError;
use crate::error::ErrorCode;

/// Payload key listing additional capabilities a job can be matched on.
const CAPABILITIES_KEY: &str = "capabilities";

/// Queue tier of a job. Lower tiers are never dequeued while a higher tier
/// has an eligible job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

impl Priority {
    /// All tiers in dequeue order.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    /// Position of the tier in dequeue order.
    pub fn index(self) -> usize {
        match self {
            Priority::Critical => 0,
            Priority::High => 1,
            Priority::Normal => 2,
            Priority::Low => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            _ => Err(QueueError::InvalidPriority(s.to_string())),
        }
    }
}

/// A unit of work tracked by the queue.
///
/// `enqueued_at` and `expires_at` are stamped by the queue on admission;
/// the values set by [`Job::new`] are placeholders until then.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    /// Unique identifier for the job.
    pub id: String,
    /// Job type, used for capability matching.
    #[serde(rename = "type")]
    pub job_type: String,
    /// Queue tier.
    pub priority: Priority,
    /// Opaque payload handed to the dispatcher.
    #[serde(default)]
    pub payload: Value,
    /// Preferred target (repository or endpoint) for worker affinity.
    #[serde(default)]
    pub target: Option<String>,
    /// When the job entered the queue.
    pub enqueued_at: DateTime<Utc>,
    /// When the job expires if still queued.
    pub expires_at: DateTime<Utc>,
    /// Number of retries already consumed.
    #[serde(default)]
    pub retry_count: u32,
    /// Per-job override of the queue's maximum wait, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_wait_ms: Option<u64>,
}

impl Job {
    /// Creates a new job with an empty payload.
    pub fn new(id: impl Into<String>, job_type: impl Into<String>, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            job_type: job_type.into(),
            priority,
            payload: Value::Null,
            target: None,
            enqueued_at: now,
            expires_at: now,
            retry_count: 0,
            max_wait_ms: None,
        }
    }

    /// Sets the payload.
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the preferred target.
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Overrides the queue's maximum wait for this job.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait_ms = Some(max_wait.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    /// Sets the retry count.
    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }

    /// Stamps admission timestamps. The job's own max-wait wins over `default_max_wait`.
    pub fn stamp(&mut self, now: DateTime<Utc>, default_max_wait: Duration) {
        let max_wait = self
            .max_wait_ms
            .map(Duration::from_millis)
            .unwrap_or(default_max_wait);
        self.enqueued_at = now;
        self.expires_at = add_duration(now, max_wait);
    }

    /// Returns true once `expires_at` lies strictly in the past.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    /// Time spent queued as of `now`, in milliseconds.
    pub fn wait_ms(&self, now: DateTime<Utc>) -> u64 {
        (now - self.enqueued_at).num_milliseconds().max(0) as u64
    }

    /// Remaining time before expiry as of `now`.
    pub fn remaining_ttl(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Returns true if the job can run on a worker declaring `capability`.
    ///
    /// A job matches its own type, plus any string listed under the
    /// payload's `capabilities` array.
    pub fn matches_capability(&self, capability: &str) -> bool {
        self.capability_tags().any(|tag| tag == capability)
    }

    /// Every capability tag this job can be matched on.
    pub fn capability_tags(&self) -> impl Iterator<Item = &str> {
        let extra = self
            .payload
            .get(CAPABILITIES_KEY)
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str);
        std::iter::once(self.job_type.as_str()).chain(extra)
    }

    /// Builds the next attempt of this job.
    pub fn next_attempt(&self) -> Job {
        let mut job = self.clone();
        job.retry_count += 1;
        job
    }

    /// Reads a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// Adds a std duration to a timestamp, saturating at the maximum timestamp.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn default_priority() -> String {
    Priority::Normal.as_str().to_string()
}

/// Producer-facing job description.
///
/// Priority is a free string here; converting to a [`Job`] rejects anything
/// outside the four tiers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobSubmission {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub max_wait_ms: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
}

impl JobSubmission {
    pub fn new(id: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_type: job_type.into(),
            priority: default_priority(),
            payload: Value::Null,
            target: None,
            max_wait_ms: None,
            retry_count: 0,
        }
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    /// Validates the submission and converts it into a queueable job.
    pub fn into_job(self) -> Result<Job, QueueError> {
        if self.id.trim().is_empty() {
            return Err(QueueError::InvalidJob("job id cannot be empty".to_string()));
        }
        if self.job_type.trim().is_empty() {
            return Err(QueueError::InvalidJob(format!(
                "job {} has an empty type",
                self.id
            )));
        }
        let priority: Priority = self.priority.parse()?;

        let mut job = Job::new(self.id, self.job_type, priority)
            .with_payload(self.payload)
            .with_retry_count(self.retry_count);
        job.target = self.target;
        job.max_wait_ms = self.max_wait_ms;
        Ok(job)
    }
}

/// Final outcome of a job in the supervisor's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcome {
    Completed,
    Failed,
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Completed => write!(f, "completed"),
            JobOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// A finished job as kept in the supervisor's bounded history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobRecord {
    pub job_id: String,
    pub job_type: String,
    pub target: Option<String>,
    #[serde(default)]
    pub worker_id: Option<String>,
    pub outcome: JobOutcome,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default)]
    pub run_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub code: Option<ErrorCode>,
}

impl JobRecord {
    pub fn is_success(&self) -> bool {
        self.outcome == JobOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_priority_parse() {
        assert_eq!("critical".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!(" HIGH ".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("low".parse::<Priority>().unwrap(), Priority::Low);

        let err = "urgent".parse::<Priority>().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPriority);
        assert!(err.to_string().contains("urgent"));
    }

    #[test]
    fn test_priority_order() {
        let indices: Vec<usize> = Priority::ALL.iter().map(|p| p.index()).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        assert!(Priority::Critical < Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_job_stamp_uses_override() {
        let now = Utc::now();
        let mut job = Job::new("j1", "build", Priority::Normal);
        job.stamp(now, Duration::from_secs(300));
        assert_eq!(job.enqueued_at, now);
        assert_eq!(job.expires_at, now + chrono::Duration::seconds(300));

        let mut job = Job::new("j2", "build", Priority::Normal).with_max_wait(Duration::from_secs(5));
        job.stamp(now, Duration::from_secs(300));
        assert_eq!(job.expires_at, now + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_job_expiry() {
        let now = Utc::now();
        let mut job = Job::new("j1", "build", Priority::Low);
        job.stamp(now, Duration::from_secs(1));

        assert!(!job.is_expired_at(now));
        assert!(!job.is_expired_at(now + chrono::Duration::seconds(1)));
        assert!(job.is_expired_at(now + chrono::Duration::milliseconds(1001)));
        assert_eq!(job.remaining_ttl(now + chrono::Duration::seconds(5)), Duration::ZERO);
    }

    #[test]
    fn test_capability_matching() {
        let job = Job::new("j1", "mod_analysis", Priority::Normal)
            .with_payload(json!({ "capabilities": ["lint", "format"] }));

        assert!(job.matches_capability("mod_analysis"));
        assert!(job.matches_capability("lint"));
        assert!(job.matches_capability("format"));
        assert!(!job.matches_capability("deploy"));

        let plain = Job::new("j2", "build", Priority::Normal).with_payload(json!({ "capabilities": "lint" }));
        assert!(!plain.matches_capability("lint"));
    }

    #[test]
    fn test_next_attempt() {
        let job = Job::new("j1", "build", Priority::High).with_retry_count(1);
        let next = job.next_attempt();
        assert_eq!(next.retry_count, 2);
        assert_eq!(next.id, job.id);
        assert_eq!(next.priority, Priority::High);
    }

    #[test]
    fn test_submission_into_job() {
        let job = JobSubmission::new("j1", "build")
            .with_priority("critical")
            .with_target("org/repo")
            .into_job()
            .unwrap();
        assert_eq!(job.priority, Priority::Critical);
        assert_eq!(job.target.as_deref(), Some("org/repo"));

        let err = JobSubmission::new("j1", "build")
            .with_priority("whenever")
            .into_job()
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPriority);

        let err = JobSubmission::new(" ", "build").into_job().unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJob);
    }

    #[test]
    fn test_job_serialization_uses_type_key() {
        let job = Job::new("j1", "build", Priority::Low);
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["type"], "build");
        assert_eq!(value["priority"], "low");
        assert!(value.get("max_wait_ms").is_none());

        let restored: Job = serde_json::from_value(value).unwrap();
        assert_eq!(restored, job);
    }

    #[test]
    fn test_submission_deserialize_defaults() {
        let sub: JobSubmission = serde_json::from_str(r#"{"id":"a","type":"build"}"#).unwrap();
        assert_eq!(sub.priority, "normal");
        assert_eq!(sub.retry_count, 0);
        assert!(sub.target.is_none());
    }
}
