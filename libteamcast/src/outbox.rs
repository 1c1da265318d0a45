//! Outbound side effects
//!
//! Notifications about account and post state changes are written to the
//! `outbound_tasks` table first and delivered later by [`Outbox::drain`], so a
//! failing notifier is retried with backoff and a task that runs out of
//! attempts ends up `failed` with its last error instead of vanishing.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::OutboxConfig;
use crate::error::{Result, ValidationError};
use crate::queue::Backoff;
use crate::repository::OutboxRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    AccountReconnectRequired,
    AccountRevoked,
    PostPublished,
    PostFailed,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::AccountReconnectRequired => "account.reconnect_required",
            TaskKind::AccountRevoked => "account.revoked",
            TaskKind::PostPublished => "post.published",
            TaskKind::PostFailed => "post.failed",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "account.reconnect_required" => Ok(TaskKind::AccountReconnectRequired),
            "account.revoked" => Ok(TaskKind::AccountRevoked),
            "post.published" => Ok(TaskKind::PostPublished),
            "post.failed" => Ok(TaskKind::PostFailed),
            other => Err(ValidationError::Invalid(format!("unknown task kind: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Delivered,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Delivered => "delivered",
            TaskStatus::Failed => "failed",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "delivered" => Ok(TaskStatus::Delivered),
            "failed" => Ok(TaskStatus::Failed),
            other => Err(ValidationError::Invalid(format!("unknown task status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboundTask {
    pub id: Uuid,
    pub kind: TaskKind,
    pub payload: Value,
    pub status: TaskStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OutboundTask {
    pub fn new(kind: TaskKind, payload: Value, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            payload,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            next_attempt_at: now,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_delivered(&mut self, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = TaskStatus::Delivered;
        self.last_error = None;
        self.updated_at = now;
    }

    pub fn mark_attempt_failed(&mut self, error: String, backoff: &Backoff, now: DateTime<Utc>) {
        self.attempts += 1;
        self.last_error = Some(error);
        self.updated_at = now;
        if self.attempts >= self.max_attempts {
            self.status = TaskStatus::Failed;
        } else {
            let delay = chrono::Duration::from_std(backoff.delay(self.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
            self.next_attempt_at = now + delay;
        }
    }
}

/// Delivers one outbound task. Webhooks, email and chat integrations plug in here.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, task: &OutboundTask) -> std::result::Result<(), String>;
}

/// Writes notifications to the log
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, task: &OutboundTask) -> std::result::Result<(), String> {
        info!(kind = %task.kind, task_id = %task.id, payload = %task.payload, "notification");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retrying: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Outbox {
    repo: Arc<dyn OutboxRepository>,
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(repo: Arc<dyn OutboxRepository>, config: OutboxConfig) -> Self {
        Self { repo, config }
    }

    /// Persist a task. A storage failure is logged at error level and not
    /// propagated: the state change that triggered it has already happened.
    pub async fn submit(&self, kind: TaskKind, payload: Value, now: DateTime<Utc>) {
        let task = OutboundTask::new(kind, payload, self.config.max_attempts, now);
        if let Err(e) = self.repo.insert_task(&task).await {
            error!(
                kind = %kind,
                error = %e,
                payload = %task.payload,
                "failed to queue notification"
            );
        }
    }

    /// Attempt every due task once
    pub async fn drain(&self, notifier: &dyn Notifier, now: DateTime<Utc>) -> Result<DrainReport> {
        let backoff = Backoff::linear(Duration::from_secs(self.config.retry_delay_secs));
        let mut report = DrainReport::default();

        for mut task in self.repo.due_tasks(now, self.config.batch_size).await? {
            match notifier.deliver(&task).await {
                Ok(()) => {
                    task.mark_delivered(now);
                    report.delivered += 1;
                }
                Err(e) => {
                    task.mark_attempt_failed(e, &backoff, now);
                    if task.status == TaskStatus::Failed {
                        error!(
                            kind = %task.kind,
                            task_id = %task.id,
                            attempts = task.attempts,
                            error = task.last_error.as_deref().unwrap_or_default(),
                            "notification abandoned"
                        );
                        report.failed += 1;
                    } else {
                        warn!(
                            kind = %task.kind,
                            task_id = %task.id,
                            attempts = task.attempts,
                            error = task.last_error.as_deref().unwrap_or_default(),
                            "notification delivery failed, will retry"
                        );
                        report.retrying += 1;
                    }
                }
            }
            self.repo.update_task(&task).await?;
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct FlakyNotifier {
        failures_left: AtomicUsize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn deliver(&self, _task: &OutboundTask) -> std::result::Result<(), String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                Err("webhook endpoint returned 502".to_string())
            } else {
                Ok(())
            }
        }
    }

    async fn setup() -> (TempDir, Arc<Database>) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, Arc::new(db))
    }

    fn config(max_attempts: u32) -> OutboxConfig {
        OutboxConfig {
            max_attempts,
            retry_delay_secs: 10,
            batch_size: 10,
        }
    }

    #[tokio::test]
    async fn test_failed_delivery_is_retried_later() {
        let (_temp, db) = setup().await;
        let outbox = Outbox::new(db.clone(), config(3));
        let now = Utc::now();
        outbox
            .submit(TaskKind::PostPublished, json!({"post_id": "p1"}), now)
            .await;

        let notifier = FlakyNotifier {
            failures_left: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
        };

        let report = outbox.drain(&notifier, now).await.unwrap();
        assert_eq!(report.retrying, 1);

        // not due again until the backoff passes
        let report = outbox.drain(&notifier, now + chrono::Duration::seconds(5)).await.unwrap();
        assert_eq!(report, DrainReport::default());

        let report = outbox
            .drain(&notifier, now + chrono::Duration::seconds(11))
            .await
            .unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);

        // delivered tasks are not picked up again
        let report = outbox.drain(&notifier, now + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(report, DrainReport::default());
    }

    #[tokio::test]
    async fn test_exhausted_task_is_marked_failed() {
        let (_temp, db) = setup().await;
        let outbox = Outbox::new(db.clone(), config(2));
        let now = Utc::now();
        outbox
            .submit(TaskKind::AccountReconnectRequired, json!({"account_id": "a1"}), now)
            .await;

        let notifier = FlakyNotifier {
            failures_left: AtomicUsize::new(10),
            calls: AtomicUsize::new(0),
        };
        outbox.drain(&notifier, now).await.unwrap();
        let report = outbox
            .drain(&notifier, now + chrono::Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(report.failed, 1);

        let report = outbox.drain(&notifier, now + chrono::Duration::hours(5)).await.unwrap();
        assert_eq!(report, DrainReport::default());
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 2);
    }
}
