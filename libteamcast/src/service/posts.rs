//! Post authoring and scheduling
//!
//! A post's status and its queue job move together: scheduling creates the
//! job, cancelling removes it. Every status write is a compare-and-set on the
//! status the post was read in, so a dispatcher that claimed the post in the
//! meantime wins and the caller gets `Conflict`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;
use uuid::Uuid;

use super::ServiceContext;
use crate::error::{Result, TeamcastError};
use crate::permissions::Capability;
use crate::posts::{Post, PostStatus, PublishingRecord, RecordStatus};
use crate::queue::{JobStatus, QueueJob};
use crate::types::{Content, Platform};

#[derive(Debug, Clone)]
pub struct CreatePostRequest {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub content: Content,
    pub platforms: Vec<Platform>,
}

#[derive(Clone)]
pub struct PostService {
    context: Arc<ServiceContext>,
}

impl PostService {
    pub(crate) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Create a draft
    pub async fn create(&self, request: CreatePostRequest) -> Result<Post> {
        self.context
            .authorize(request.team_id, request.user_id, Capability::EditPosts, None)
            .await?;

        let post = Post::draft(
            request.team_id,
            request.user_id,
            request.content,
            request.platforms,
            self.context.config.publishing.max_retries,
            Utc::now(),
        )?;
        self.context.repos.posts.insert_post(&post).await?;
        info!(
            post_id = %post.id,
            team_id = %post.team_id,
            platforms = ?post.platforms,
            "draft created"
        );
        Ok(post)
    }

    pub async fn get(&self, post_id: Uuid, user_id: Uuid) -> Result<Post> {
        let post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::ViewPosts, None)
            .await?;
        Ok(post)
    }

    pub async fn list(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        status: Option<PostStatus>,
    ) -> Result<Vec<Post>> {
        self.context
            .authorize(team_id, user_id, Capability::ViewPosts, None)
            .await?;
        self.context.repos.posts.list_posts(team_id, status).await
    }

    /// Per-platform publishing records of a post
    pub async fn records(&self, post_id: Uuid, user_id: Uuid) -> Result<Vec<PublishingRecord>> {
        self.get(post_id, user_id).await?;
        self.context.repos.posts.records_for_post(post_id).await
    }

    pub async fn update_content(
        &self,
        post_id: Uuid,
        user_id: Uuid,
        content: Content,
    ) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::EditPosts, None)
            .await?;

        let expected = post.status();
        post.update_content(content, Utc::now())?;
        self.context.repos.posts.update_post(&post, expected).await?;
        Ok(post)
    }

    pub async fn update_platforms(
        &self,
        post_id: Uuid,
        user_id: Uuid,
        platforms: Vec<Platform>,
    ) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::EditPosts, None)
            .await?;

        let expected = post.status();
        post.update_platforms(platforms, Utc::now())?;
        self.context.repos.posts.update_post(&post, expected).await?;
        Ok(post)
    }

    /// Schedule for `at` and create (or move) the post's job
    pub async fn schedule(&self, post_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::PublishPosts, Some(post.created_by))
            .await?;

        let now = Utc::now();
        let expected = post.status();
        post.schedule(at, now)?;
        self.context.repos.posts.update_post(&post, expected).await?;
        self.enqueue_job(post.id, at, now).await?;

        info!(%post_id, scheduled_at = %at, "post scheduled");
        Ok(post)
    }

    /// Hand a draft or scheduled post to the dispatcher. The job is due at
    /// the scheduled time, or immediately if there is none.
    pub async fn queue(&self, post_id: Uuid, user_id: Uuid) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::PublishPosts, Some(post.created_by))
            .await?;

        let now = Utc::now();
        let expected = post.status();
        post.enqueue(now)?;
        self.context.repos.posts.update_post(&post, expected).await?;
        let due = post.scheduled_at.filter(|at| *at > now).unwrap_or(now);
        self.enqueue_job(post.id, due, now).await?;

        info!(%post_id, due = %due, "post queued");
        Ok(post)
    }

    /// Cancel a scheduled or queued post
    ///
    /// Fails with `Conflict` once a worker holds the post's job: the publish
    /// attempt is already under way.
    pub async fn cancel(&self, post_id: Uuid, user_id: Uuid) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::DeletePosts, None)
            .await?;

        let now = Utc::now();
        let expected = post.status();
        if expected == PostStatus::Processing {
            return Err(being_published(post_id));
        }
        post.cancel(now)?;

        // remove the job first so no worker can claim it after this point
        if !self.context.repos.queue.cancel_pending(post_id).await? {
            if let Some(job) = self.context.repos.queue.job_for_post(post_id).await? {
                if job.status == JobStatus::Processing {
                    return Err(being_published(post_id));
                }
            }
        }
        self.context.repos.posts.update_post(&post, expected).await?;

        info!(%post_id, "post cancelled");
        Ok(post)
    }

    /// Manual retry of a failed post
    ///
    /// Failed platform records get a fresh retry budget. Platforms that
    /// already succeeded are not published again.
    pub async fn requeue(&self, post_id: Uuid, user_id: Uuid) -> Result<Post> {
        let mut post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::PublishPosts, Some(post.created_by))
            .await?;

        let now = Utc::now();
        post.requeue(now)?;
        post.retry_count = 0;
        self.context.repos.posts.update_post(&post, PostStatus::Failed).await?;

        for mut record in self.context.repos.posts.records_for_post(post_id).await? {
            if record.status == RecordStatus::Failed {
                record.reset(now);
                self.context.repos.posts.upsert_record(&record).await?;
            }
        }
        self.enqueue_job(post.id, now, now).await?;

        info!(%post_id, "failed post requeued");
        Ok(post)
    }

    pub async fn delete(&self, post_id: Uuid, user_id: Uuid) -> Result<()> {
        let post = self.require(post_id).await?;
        self.context
            .authorize(post.team_id, user_id, Capability::DeletePosts, None)
            .await?;

        if post.status() == PostStatus::Processing {
            return Err(being_published(post_id));
        }
        if let Some(job) = self.context.repos.queue.job_for_post(post_id).await? {
            if job.status == JobStatus::Processing {
                return Err(being_published(post_id));
            }
        }

        self.context.repos.posts.delete_post(post_id).await?;
        info!(%post_id, "post deleted");
        Ok(())
    }

    async fn enqueue_job(
        &self,
        post_id: Uuid,
        due: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<QueueJob> {
        let job = QueueJob::new(post_id, due, self.context.config.queue.max_attempts, now);
        self.context.repos.queue.enqueue(&job).await
    }

    pub(crate) async fn require(&self, post_id: Uuid) -> Result<Post> {
        self.context
            .repos
            .posts
            .get_post(post_id)
            .await?
            .ok_or_else(|| TeamcastError::NotFound(format!("post {post_id}")))
    }
}

fn being_published(post_id: Uuid) -> TeamcastError {
    TeamcastError::Conflict(format!("post {post_id} is being published"))
}
