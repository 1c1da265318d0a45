//! Posts and their per-platform publishing records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::accounts::AccountStatus;
use crate::error::{CredentialError, PlatformError, ValidationError};
use crate::types::{Content, Platform, PublishResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Queued,
    Processing,
    Published,
    Failed,
    Cancelled,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Queued => "queued",
            PostStatus::Processing => "processing",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
            PostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for PostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PostStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(PostStatus::Draft),
            "scheduled" => Ok(PostStatus::Scheduled),
            "queued" => Ok(PostStatus::Queued),
            "processing" => Ok(PostStatus::Processing),
            "published" => Ok(PostStatus::Published),
            "failed" => Ok(PostStatus::Failed),
            "cancelled" => Ok(PostStatus::Cancelled),
            other => Err(ValidationError::Invalid(format!("unknown post status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Post {
    pub id: Uuid,
    pub team_id: Uuid,
    pub created_by: Uuid,
    pub content: Content,
    pub platforms: Vec<Platform>,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    status: PostStatus,
}

impl Post {
    pub fn draft(
        team_id: Uuid,
        created_by: Uuid,
        content: Content,
        platforms: Vec<Platform>,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        Ok(Self {
            id: Uuid::new_v4(),
            team_id,
            created_by,
            content,
            platforms: normalize_platforms(platforms)?,
            scheduled_at: None,
            published_at: None,
            retry_count: 0,
            max_retries,
            error_message: None,
            created_at: now,
            updated_at: now,
            status: PostStatus::Draft,
        })
    }

    /// Rebuild a post from storage
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        team_id: Uuid,
        created_by: Uuid,
        content: Content,
        platforms: Vec<Platform>,
        status: PostStatus,
        scheduled_at: Option<DateTime<Utc>>,
        published_at: Option<DateTime<Utc>>,
        retry_count: u32,
        max_retries: u32,
        error_message: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            team_id,
            created_by,
            content,
            platforms,
            scheduled_at,
            published_at,
            retry_count,
            max_retries,
            error_message,
            created_at,
            updated_at,
            status,
        }
    }

    pub fn status(&self) -> PostStatus {
        self.status
    }

    pub fn schedule(
        &mut self,
        at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Draft, PostStatus::Scheduled], "schedule")?;
        self.ensure_publishable()?;
        if at <= now {
            return Err(ValidationError::ScheduleTimeInPast);
        }
        self.scheduled_at = Some(at);
        self.set(PostStatus::Scheduled, now);
        Ok(())
    }

    pub fn enqueue(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Draft, PostStatus::Scheduled], "queue")?;
        self.ensure_publishable()?;
        self.set(PostStatus::Queued, now);
        Ok(())
    }

    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Queued], "process")?;
        self.set(PostStatus::Processing, now);
        Ok(())
    }

    /// Processing → Queued after an attempt that will be retried
    pub fn release(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Processing], "release")?;
        self.retry_count += 1;
        self.error_message = Some(reason.into());
        self.set(PostStatus::Queued, now);
        Ok(())
    }

    /// Settle a processing post from its records: Published only if every
    /// targeted platform succeeded
    pub fn finish(
        &mut self,
        records: &[PublishingRecord],
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Processing], "finish")?;

        let mut failures = Vec::new();
        for platform in &self.platforms {
            match records.iter().find(|r| r.platform == *platform) {
                Some(record) if record.status == RecordStatus::Success => {}
                Some(record) => failures.push(format!(
                    "{}: {}",
                    platform,
                    record.error.as_deref().unwrap_or("not published")
                )),
                None => failures.push(format!("{}: not attempted", platform)),
            }
        }

        if failures.is_empty() {
            self.published_at = Some(now);
            self.error_message = None;
            self.set(PostStatus::Published, now);
        } else {
            self.error_message = Some(failures.join("; "));
            self.set(PostStatus::Failed, now);
        }
        Ok(())
    }

    /// Give up without a publishing attempt result, e.g. the job ran out of attempts
    pub fn fail(
        &mut self,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.expect(
            &[PostStatus::Scheduled, PostStatus::Queued, PostStatus::Processing],
            "fail",
        )?;
        self.error_message = Some(reason.into());
        self.set(PostStatus::Failed, now);
        Ok(())
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Scheduled, PostStatus::Queued], "cancel")?;
        self.set(PostStatus::Cancelled, now);
        Ok(())
    }

    /// Manual retry of a failed post
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.expect(&[PostStatus::Failed], "requeue")?;
        self.error_message = None;
        self.set(PostStatus::Queued, now);
        Ok(())
    }

    pub fn update_content(
        &mut self,
        content: Content,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.ensure_editable()?;
        self.content = content;
        self.updated_at = now;
        Ok(())
    }

    pub fn update_platforms(
        &mut self,
        platforms: Vec<Platform>,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.ensure_editable()?;
        self.platforms = normalize_platforms(platforms)?;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_editable(&self) -> Result<(), ValidationError> {
        match self.status {
            PostStatus::Draft | PostStatus::Scheduled => Ok(()),
            PostStatus::Published => Err(ValidationError::CannotEditPublished),
            other => Err(ValidationError::InvalidTransition {
                entity: "post",
                from: other.to_string(),
                action: "edit",
            }),
        }
    }

    fn ensure_publishable(&self) -> Result<(), ValidationError> {
        if self.content.is_blank() {
            return Err(ValidationError::EmptyContent);
        }
        Ok(())
    }

    fn expect(&self, allowed: &[PostStatus], action: &'static str) -> Result<(), ValidationError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(ValidationError::InvalidTransition {
                entity: "post",
                from: self.status.to_string(),
                action,
            })
        }
    }

    fn set(&mut self, status: PostStatus, now: DateTime<Utc>) {
        self.status = status;
        self.updated_at = now;
    }
}

fn normalize_platforms(platforms: Vec<Platform>) -> Result<Vec<Platform>, ValidationError> {
    let mut unique = Vec::with_capacity(platforms.len());
    for platform in platforms {
        if !unique.contains(&platform) {
            unique.push(platform);
        }
    }
    if unique.is_empty() {
        return Err(ValidationError::NoPlatforms);
    }
    Ok(unique)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Pending => "pending",
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
            RecordStatus::Retrying => "retrying",
        }
    }
}

impl FromStr for RecordStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RecordStatus::Pending),
            "success" => Ok(RecordStatus::Success),
            "failed" => Ok(RecordStatus::Failed),
            "retrying" => Ok(RecordStatus::Retrying),
            other => Err(ValidationError::Invalid(format!("unknown record status: {other}"))),
        }
    }
}

/// Outcome of one post on one platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishingRecord {
    pub id: Uuid,
    pub post_id: Uuid,
    pub platform: Platform,
    pub account_id: Option<Uuid>,
    pub platform_post_id: Option<String>,
    pub url: Option<String>,
    pub status: RecordStatus,
    pub published_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub retry_count: u32,
    pub updated_at: DateTime<Utc>,
}

impl PublishingRecord {
    pub fn pending(post_id: Uuid, platform: Platform, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            post_id,
            platform,
            account_id: None,
            platform_post_id: None,
            url: None,
            status: RecordStatus::Pending,
            published_at: None,
            error: None,
            retry_count: 0,
            updated_at: now,
        }
    }

    pub fn begin_retry(&mut self, now: DateTime<Utc>) {
        self.retry_count += 1;
        self.status = RecordStatus::Retrying;
        self.updated_at = now;
    }

    pub fn succeed(&mut self, result: &PublishResult, now: DateTime<Utc>) {
        self.status = RecordStatus::Success;
        self.platform_post_id = Some(result.platform_post_id.clone());
        self.url = Some(result.url.clone());
        self.published_at = Some(result.published_at);
        self.error = None;
        self.updated_at = now;
    }

    pub fn fail(&mut self, error: &PublishFailure, now: DateTime<Utc>) {
        self.status = RecordStatus::Failed;
        self.error = Some(error.to_string());
        self.updated_at = now;
    }

    /// Start a fresh retry budget after a manual re-queue. Successful records are left alone.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        if self.status != RecordStatus::Success {
            self.status = RecordStatus::Pending;
            self.retry_count = 0;
            self.error = None;
            self.updated_at = now;
        }
    }
}

/// Why a platform was not published to
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PublishFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error("no connected {0} account for this team")]
    NoAccount(Platform),

    #[error("account cannot publish while {0}")]
    AccountUnavailable(AccountStatus),

    #[error("no adapter registered for {0}")]
    NoAdapter(Platform),

    /// Failure written by an earlier attempt; terminal records are not retried
    #[error("{0}")]
    Recorded(String),

    #[error("{0}")]
    Internal(String),
}

impl PublishFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            PublishFailure::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformSuccess {
    pub platform: Platform,
    pub account_id: Option<Uuid>,
    pub platform_post_id: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformFailure {
    pub platform: Platform,
    pub account_id: Option<Uuid>,
    pub error: PublishFailure,
}

/// Mixed result of publishing one post to all of its platforms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOutcome {
    pub post_id: Uuid,
    pub status: PostStatus,
    pub succeeded: Vec<PlatformSuccess>,
    pub failed: Vec<PlatformFailure>,
}

impl PublishOutcome {
    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty() && self.status == PostStatus::Published
    }

    pub fn succeeded_on(&self, platform: Platform) -> Option<&PlatformSuccess> {
        self.succeeded.iter().find(|s| s.platform == platform)
    }

    pub fn failed_on(&self, platform: Platform) -> Option<&PlatformFailure> {
        self.failed.iter().find(|f| f.platform == platform)
    }
}
