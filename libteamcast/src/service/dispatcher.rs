//! Queue worker
//!
//! One tick reaps expired leases, claims and processes due jobs up to the
//! batch size, drains the outbox, then prunes throttle windows, abandoned
//! account authorizations and stale analytics cache entries. Several dispatchers may run against
//! the same database; the conditional claim keeps them off each other's jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};

use super::analytics::AnalyticsService;
use super::publishing::PublishingService;
use super::ServiceContext;
use crate::accounts::PendingAuthorization;
use crate::error::Result;
use crate::outbox::{DrainReport, LogNotifier, Notifier, TaskKind};
use crate::posts::PostStatus;
use crate::queue::JobStatus;

/// Throttle windows older than this are deleted on every tick
const THROTTLE_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs whose lease had expired
    pub reaped: usize,
    pub processed: usize,
    pub published: usize,
    /// Posts that settled as Failed
    pub failed: usize,
    /// Attempts that broke and were handed back to the queue
    pub errored: usize,
    pub notifications: DrainReport,
    /// Analytics cache entries past their TTL
    pub evicted: usize,
}

pub struct Dispatcher {
    context: Arc<ServiceContext>,
    publishing: PublishingService,
    analytics: AnalyticsService,
    worker_id: String,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub(crate) fn new(
        context: Arc<ServiceContext>,
        publishing: PublishingService,
        analytics: AnalyticsService,
        worker_id: String,
    ) -> Self {
        Self {
            context,
            publishing,
            analytics,
            worker_id,
            notifier: Arc::new(LogNotifier),
        }
    }

    /// Deliver outbox tasks through `notifier` instead of the log
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub async fn run_once(&self) -> Result<TickReport> {
        let mut report = TickReport {
            reaped: self.reap(Utc::now()).await?,
            ..TickReport::default()
        };

        let queue = &self.context.config.queue;
        for _ in 0..queue.batch_size {
            let Some(job) = self
                .context
                .repos
                .queue
                .claim_next(&self.worker_id, Utc::now(), queue.lease())
                .await?
            else {
                break;
            };

            report.processed += 1;
            match self.publishing.process_job(job, &self.worker_id).await {
                Ok(outcome) if outcome.status == PostStatus::Published => report.published += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(worker_id = %self.worker_id, error = %e, "publish attempt failed");
                    report.errored += 1;
                }
            }
        }

        report.notifications = self.context.outbox.drain(self.notifier.as_ref(), Utc::now()).await?;

        let cutoff = Utc::now() - chrono::Duration::hours(THROTTLE_RETENTION_HOURS);
        if let Err(e) = self.context.throttle.cleanup_old_windows(cutoff).await {
            warn!(error = %e, "failed to clean up throttle windows");
        }
        let abandoned = Utc::now() - chrono::Duration::minutes(PendingAuthorization::TTL_MINUTES);
        let authorizations = &self.context.repos.authorizations;
        if let Err(e) = authorizations.delete_authorizations_before(abandoned).await {
            warn!(error = %e, "failed to clean up abandoned authorizations");
        }
        report.evicted = self.analytics.evict_expired();

        if report.processed > 0 || report.reaped > 0 {
            info!(
                worker_id = %self.worker_id,
                reaped = report.reaped,
                processed = report.processed,
                published = report.published,
                failed = report.failed,
                errored = report.errored,
                "dispatcher tick"
            );
        } else {
            debug!(worker_id = %self.worker_id, "nothing due");
        }
        Ok(report)
    }

    /// Return jobs with expired leases to the queue and move their posts back
    /// to `Queued`, or to `Failed` once the job is out of attempts
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<usize> {
        let reclaimed = self.context.repos.queue.reclaim_expired(now).await?;

        for job in &reclaimed {
            let Some(mut post) = self.context.repos.posts.get_post(job.post_id).await? else {
                continue;
            };
            let expected = post.status();
            let exhausted = job.status == JobStatus::Failed;

            let moved = if exhausted {
                post.fail(
                    format!("lease expired; gave up after {} attempts", job.attempt_count),
                    now,
                )
            } else if expected == PostStatus::Processing {
                post.release("lease expired before the publish attempt finished", now)
            } else {
                // the worker died before moving the post; it is still Queued
                continue;
            };
            if let Err(e) = moved {
                warn!(post_id = %post.id, error = %e, "reaped job left post untouched");
                continue;
            }

            if let Err(e) = self.context.repos.posts.update_post(&post, expected).await {
                warn!(post_id = %post.id, error = %e, "post changed while reaping its job");
                continue;
            }
            warn!(
                post_id = %post.id,
                job_id = %job.id,
                attempts = job.attempt_count,
                status = %post.status(),
                "reclaimed expired lease"
            );

            if exhausted {
                self.context
                    .outbox
                    .submit(
                        TaskKind::PostFailed,
                        json!({
                            "post_id": post.id,
                            "team_id": post.team_id,
                            "error": post.error_message,
                        }),
                        now,
                    )
                    .await;
            }
        }
        Ok(reclaimed.len())
    }
}
