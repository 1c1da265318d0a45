//! Running posts through the publisher
//!
//! A post is only ever published by the worker holding its queue job's
//! lease. "Publish now" takes the same path: it enqueues an urgent job and
//! claims it inline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::ServiceContext;
use crate::error::{Result, TeamcastError, ValidationError};
use crate::outbox::TaskKind;
use crate::permissions::Capability;
use crate::posts::{PlatformSuccess, Post, PostStatus, PublishOutcome};
use crate::publisher::PublishReport;
use crate::queue::{Backoff, JobStatus, Lease, QueueJob};

/// Jobs created by "publish now" jump ahead of scheduled ones
pub const PUBLISH_NOW_PRIORITY: i32 = 10;

#[derive(Clone)]
pub struct PublishingService {
    context: Arc<ServiceContext>,
}

impl PublishingService {
    pub(crate) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Publish a draft, scheduled or queued post immediately
    pub async fn publish_now(&self, post_id: Uuid, user_id: Uuid) -> Result<PublishOutcome> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::PublishPosts, Some(post.created_by))
            .await?;

        let now = Utc::now();
        match post.status() {
            PostStatus::Draft | PostStatus::Scheduled => {
                let expected = post.status();
                post.enqueue(now)?;
                self.context.repos.posts.update_post(&post, expected).await?;
            }
            PostStatus::Queued => {}
            other => {
                return Err(ValidationError::InvalidTransition {
                    entity: "post",
                    from: other.to_string(),
                    action: "publish",
                }
                .into())
            }
        }

        let job = QueueJob::new(post_id, now, self.context.config.queue.max_attempts, now)
            .with_priority(PUBLISH_NOW_PRIORITY);
        self.context.repos.queue.enqueue(&job).await?;

        let worker_id = format!("inline-{}", Uuid::new_v4());
        let job = self
            .context
            .repos
            .queue
            .claim_post(post_id, &worker_id, now, self.context.config.queue.lease())
            .await?
            .ok_or_else(|| {
                TeamcastError::Conflict(format!("post {post_id} was claimed by another worker"))
            })?;

        self.process_job(job, &worker_id).await
    }

    /// Publish the post behind a claimed job and settle both
    ///
    /// `Ok` carries the per-platform outcome, including a post that ended
    /// `Failed` because some platform rejected it. `Err` means the attempt
    /// itself broke: the job is failed with backoff and the post goes back to
    /// `Queued`, or to `Failed` once the job is out of attempts.
    pub async fn process_job(&self, job: QueueJob, worker_id: &str) -> Result<PublishOutcome> {
        let now = Utc::now();
        if !job.holds_lease(worker_id, now) {
            return Err(TeamcastError::Conflict(format!(
                "worker {worker_id} no longer holds the lease on job {}",
                job.id
            )));
        }
        let mut post = self.require(job.post_id).await?;
        let expected = post.status();

        match expected {
            PostStatus::Scheduled => {
                post.enqueue(now)?;
                post.start_processing(now)?;
            }
            PostStatus::Queued => post.start_processing(now)?,
            // an earlier worker lost its lease mid-flight; pick up where it stopped
            PostStatus::Processing => {}
            other => {
                warn!(
                    post_id = %post.id,
                    job_id = %job.id,
                    status = %other,
                    "job for a post that cannot be published"
                );
                self.context.repos.queue.complete(job.id, worker_id, now).await?;
                return self.outcome_from_records(&post).await;
            }
        }
        if post.status() != expected {
            self.context.repos.posts.update_post(&post, expected).await?;
        }

        info!(
            post_id = %post.id,
            job_id = %job.id,
            attempt = job.attempt_count + 1,
            worker_id,
            "publishing post"
        );
        let lease = Lease::new(
            self.context.repos.queue.clone(),
            &job,
            worker_id,
            self.context.config.queue.lease(),
        );
        match self.context.publisher.publish(&post, Some(&lease)).await {
            Ok(report) => self.settle(post, &job, worker_id, report).await,
            Err(e) => {
                if let Err(settle_error) = self.fail_job(post, &job, worker_id, &e).await {
                    error!(
                        job_id = %job.id,
                        error = %settle_error,
                        "could not record failed attempt"
                    );
                }
                Err(e)
            }
        }
    }

    async fn settle(
        &self,
        mut post: Post,
        job: &QueueJob,
        worker_id: &str,
        report: PublishReport,
    ) -> Result<PublishOutcome> {
        let now = Utc::now();
        post.finish(&report.records, now)?;
        self.context
            .repos
            .posts
            .update_post(&post, PostStatus::Processing)
            .await?;

        if let Err(e) = self.context.repos.queue.complete(job.id, worker_id, now).await {
            // records are terminal already; whoever reclaims the job will find nothing to do
            warn!(job_id = %job.id, error = %e, "lease lost before completing job");
        }

        let outcome = PublishOutcome {
            post_id: post.id,
            status: post.status(),
            succeeded: report.succeeded,
            failed: report.failed,
        };
        self.notify(&post, &outcome, now).await;

        info!(
            post_id = %post.id,
            status = %outcome.status,
            succeeded = outcome.succeeded.len(),
            failed = outcome.failed.len(),
            "post settled"
        );
        Ok(outcome)
    }

    async fn fail_job(
        &self,
        mut post: Post,
        job: &QueueJob,
        worker_id: &str,
        cause: &TeamcastError,
    ) -> Result<()> {
        let now = Utc::now();
        let retry_at = now + to_chrono(self.job_backoff().jittered_delay(job.attempt_count + 1));
        let job = self
            .context
            .repos
            .queue
            .fail(job.id, worker_id, now, &cause.to_string(), retry_at)
            .await?;

        if job.status == JobStatus::Failed {
            post.fail(
                format!("gave up after {} attempts: {cause}", job.attempt_count),
                now,
            )?;
            warn!(
                post_id = %post.id,
                attempts = job.attempt_count,
                error = %cause,
                "job out of attempts"
            );
        } else {
            post.release(cause.to_string(), now)?;
            warn!(
                post_id = %post.id,
                retry_at = %retry_at,
                error = %cause,
                "publish attempt failed, job requeued"
            );
        }
        self.context
            .repos
            .posts
            .update_post(&post, PostStatus::Processing)
            .await?;

        if post.status() == PostStatus::Failed {
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
        Ok(())
    }

    async fn notify(&self, post: &Post, outcome: &PublishOutcome, now: DateTime<Utc>) {
        let succeeded: Vec<Value> = outcome
            .succeeded
            .iter()
            .map(|s| json!({ "platform": s.platform, "url": s.url }))
            .collect();
        let failed: Vec<Value> = outcome
            .failed
            .iter()
            .map(|f| json!({ "platform": f.platform, "error": f.error.to_string() }))
            .collect();
        let kind = if outcome.status == PostStatus::Published {
            TaskKind::PostPublished
        } else {
            TaskKind::PostFailed
        };

        self.context
            .outbox
            .submit(
                kind,
                json!({
                    "post_id": post.id,
                    "team_id": post.team_id,
                    "created_by": post.created_by,
                    "succeeded": succeeded,
                    "failed": failed,
                }),
                now,
            )
            .await;
    }

    async fn outcome_from_records(&self, post: &Post) -> Result<PublishOutcome> {
        let records = self.context.repos.posts.records_for_post(post.id).await?;
        let succeeded = records
            .iter()
            .filter_map(|r| {
                Some(PlatformSuccess {
                    platform: r.platform,
                    account_id: r.account_id,
                    platform_post_id: r.platform_post_id.clone()?,
                    url: r.url.clone()?,
                })
            })
            .collect();
        Ok(PublishOutcome {
            post_id: post.id,
            status: post.status(),
            succeeded,
            failed: Vec::new(),
        })
    }

    fn job_backoff(&self) -> Backoff {
        let queue = &self.context.config.queue;
        Backoff::linear(Duration::from_secs(queue.retry_delay_secs))
            .with_jitter(Duration::from_secs(queue.retry_jitter_secs))
    }

    async fn require(&self, post_id: Uuid) -> Result<Post> {
        self.context
            .repos
            .posts
            .get_post(post_id)
            .await?
            .ok_or_else(|| TeamcastError::NotFound(format!("post {post_id}")))
    }
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero())
}
