//! Persisted queue jobs and retry timing
//!
//! A [`QueueJob`] is the deferred-execution record of one post's publish. A
//! worker owns a job only while it holds an unexpired lease on it; all claim,
//! completion and failure bookkeeping happens through conditional updates in
//! the repository so two workers can never both own the same job.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Result, ValidationError};
use crate::repository::QueueRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(ValidationError::Invalid(format!("unknown job status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueJob {
    pub id: Uuid,
    pub post_id: Uuid,
    pub status: JobStatus,
    pub priority: i32,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub scheduled_for: DateTime<Utc>,
    pub locked_at: Option<DateTime<Utc>>,
    pub locked_by: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn new(
        post_id: Uuid,
        scheduled_for: DateTime<Utc>,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_id,
            status: JobStatus::Pending,
            priority: 0,
            attempt_count: 0,
            max_attempts,
            scheduled_for,
            locked_at: None,
            locked_by: None,
            lock_expires_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// A claim is only valid while `now < lock_expires_at`
    pub fn holds_lease(&self, worker_id: &str, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Processing
            && self.locked_by.as_deref() == Some(worker_id)
            && self.lock_expires_at.is_some_and(|expires| now < expires)
    }
}

/// A worker's hold on a claimed job
///
/// Renewed before every platform call so a publish that runs longer than one
/// lease is never reclaimed and re-run by another worker while in flight.
#[derive(Clone)]
pub struct Lease {
    queue: Arc<dyn QueueRepository>,
    job_id: Uuid,
    worker_id: String,
    duration: chrono::Duration,
}

impl Lease {
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        job: &QueueJob,
        worker_id: impl Into<String>,
        duration: chrono::Duration,
    ) -> Self {
        Self {
            queue,
            job_id: job.id,
            worker_id: worker_id.into(),
            duration,
        }
    }

    /// `Conflict` if the lease expired or another worker took the job
    pub async fn renew(&self) -> Result<()> {
        let job = self
            .queue
            .renew_lease(self.job_id, &self.worker_id, Utc::now(), self.duration)
            .await?;
        debug!(
            job_id = %self.job_id,
            worker_id = %self.worker_id,
            expires_at = ?job.lock_expires_at,
            "lease renewed"
        );
        Ok(())
    }
}

/// Linear backoff: the n-th retry waits `n × base`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub jitter: Duration,
}

impl Backoff {
    pub fn linear(base: Duration) -> Self {
        Self {
            base,
            jitter: Duration::ZERO,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(attempt)
    }

    /// `delay` plus a uniformly random share of the jitter bound
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Time spent waiting across `retries` consecutive retries
    pub fn total(&self, retries: u32) -> Duration {
        (1..=retries).map(|attempt| self.delay(attempt)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_linear_backoff_schedule() {
        let backoff = Backoff::linear(Duration::from_secs(5));
        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(2), Duration::from_secs(10));
        assert_eq!(backoff.delay(3), Duration::from_secs(15));
        // three retries after a 429 wait 5s + 10s + 15s
        assert_eq!(backoff.total(3), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_is_bounded() {
        let backoff = Backoff::linear(Duration::from_secs(60)).with_jitter(Duration::from_secs(5));
        for _ in 0..50 {
            let delay = backoff.jittered_delay(2);
            assert!(delay >= Duration::from_secs(120));
            assert!(delay <= Duration::from_secs(125));
        }
    }

    #[test]
    fn test_lease_checks() {
        let now = Utc::now();
        let mut job = QueueJob::new(Uuid::new_v4(), now, 3, now);
        assert!(!job.holds_lease("worker-a", now));

        job.status = JobStatus::Processing;
        job.locked_by = Some("worker-a".to_string());
        job.lock_expires_at = Some(now + ChronoDuration::seconds(30));

        assert!(job.holds_lease("worker-a", now));
        assert!(!job.holds_lease("worker-b", now));
        assert!(!job.holds_lease("worker-a", now + ChronoDuration::seconds(30)));
    }
}
