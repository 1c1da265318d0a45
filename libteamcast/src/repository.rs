//! Persistence seams
//!
//! The orchestrator only talks to storage through these traits. The SQLite
//! [`Database`](crate::db::Database) implements every one of them; tests may
//! swap any single trait out.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::accounts::{Account, PendingAuthorization};
use crate::db::Database;
use crate::error::Result;
use crate::outbox::OutboundTask;
use crate::permissions::Member;
use crate::posts::{Post, PostStatus, PublishingRecord};
use crate::queue::QueueJob;
use crate::types::{Analytics, Platform};

#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Fails with `Duplicate` if a live account already holds the identity
    async fn insert_account(&self, account: &Account) -> Result<()>;
    async fn update_account(&self, account: &Account) -> Result<()>;
    /// Tombstoned accounts are returned too
    async fn get_account(&self, id: Uuid) -> Result<Option<Account>>;
    async fn find_live_by_identity(
        &self,
        team_id: Uuid,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<Account>>;
    /// Live accounts of a team, oldest first
    async fn list_live_accounts(
        &self,
        team_id: Uuid,
        platform: Option<Platform>,
    ) -> Result<Vec<Account>>;
    /// Live accounts for an identity across all teams
    async fn find_live_by_platform_user(
        &self,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Vec<Account>>;
}

/// A vault row. Token fields are age ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedCredentials {
    pub account_id: Uuid,
    pub access_token: Vec<u8>,
    pub refresh_token: Option<Vec<u8>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub platform_user_id: String,
    pub key_version: u32,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn upsert_tokens(&self, row: &EncryptedCredentials) -> Result<()>;
    async fn get_tokens(&self, account_id: Uuid) -> Result<Option<EncryptedCredentials>>;
    async fn delete_tokens(&self, account_id: Uuid) -> Result<bool>;
    async fn accounts_with_key_version_below(&self, version: u32) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait PostRepository: Send + Sync {
    async fn insert_post(&self, post: &Post) -> Result<()>;
    /// Compare-and-set on the previous status; `Conflict` if someone moved it first
    async fn update_post(&self, post: &Post, expected: PostStatus) -> Result<()>;
    async fn get_post(&self, id: Uuid) -> Result<Option<Post>>;
    async fn list_posts(&self, team_id: Uuid, status: Option<PostStatus>) -> Result<Vec<Post>>;
    /// Removes the post together with its job and records
    async fn delete_post(&self, id: Uuid) -> Result<bool>;
    async fn upsert_record(&self, record: &PublishingRecord) -> Result<()>;
    async fn records_for_post(&self, post_id: Uuid) -> Result<Vec<PublishingRecord>>;
    async fn find_record(
        &self,
        post_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<PublishingRecord>>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    /// Create the post's job, or reset its existing job to pending at the new
    /// time. `Conflict` while the existing job is being processed.
    async fn enqueue(&self, job: &QueueJob) -> Result<QueueJob>;
    async fn job_for_post(&self, post_id: Uuid) -> Result<Option<QueueJob>>;
    /// Atomically claim the most urgent due job
    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueJob>>;
    /// Atomically claim one post's job if it is pending and due
    async fn claim_post(
        &self,
        post_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueJob>>;
    /// Push the lease out to `now + lease`. `Conflict` once the worker no
    /// longer holds it.
    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<QueueJob>;
    /// Only the lease holder may complete, and only before the lease expires
    async fn complete(&self, job_id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<()>;
    /// Count a failed attempt. The job goes back to pending at `retry_at`, or
    /// to failed once attempts are exhausted.
    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<QueueJob>;
    /// Return jobs with expired leases to pending, counting the lost attempt
    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<QueueJob>>;
    /// Remove the post's job if it is still pending
    async fn cancel_pending(&self, post_id: Uuid) -> Result<bool>;
}

#[async_trait]
pub trait MemberRepository: Send + Sync {
    async fn upsert_member(&self, member: &Member) -> Result<()>;
    async fn get_member(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<Member>>;
    async fn count_active_owners(&self, team_id: Uuid) -> Result<usize>;
}

#[async_trait]
pub trait WebhookRepository: Send + Sync {
    /// Returns false if the event was seen before
    async fn record_webhook_event(
        &self,
        platform: Platform,
        event_id: &str,
        payload: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool>;
}

#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn insert_task(&self, task: &OutboundTask) -> Result<()>;
    async fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundTask>>;
    async fn update_task(&self, task: &OutboundTask) -> Result<()>;
}

#[async_trait]
pub trait AnalyticsRepository: Send + Sync {
    async fn record_snapshot(
        &self,
        account_id: Uuid,
        post_id: Uuid,
        platform_post_id: &str,
        analytics: &Analytics,
        fetched_at: DateTime<Utc>,
    ) -> Result<()>;
    async fn latest_snapshot(
        &self,
        account_id: Uuid,
        post_id: Uuid,
    ) -> Result<Option<(Analytics, DateTime<Utc>)>>;
}

#[async_trait]
pub trait ThrottleRepository: Send + Sync {
    /// Add one 429 to the account's window and return the new count
    async fn increment_throttle(&self, account_id: Uuid, window_start: i64) -> Result<u32>;
    async fn throttle_count(&self, account_id: Uuid, window_start: i64) -> Result<u32>;
    async fn clear_throttle(&self, account_id: Uuid) -> Result<()>;
    async fn delete_throttle_windows_before(&self, cutoff: i64) -> Result<u64>;
}

#[async_trait]
pub trait AuthorizationRepository: Send + Sync {
    async fn insert_authorization(&self, authorization: &PendingAuthorization) -> Result<()>;
    /// Remove and return the authorization for `state`. A state is only ever
    /// returned once.
    async fn take_authorization(&self, state: &str) -> Result<Option<PendingAuthorization>>;
    async fn delete_authorizations_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

/// Every repository the service layer needs
#[derive(Clone)]
pub struct Repositories {
    pub accounts: Arc<dyn AccountRepository>,
    pub tokens: Arc<dyn TokenRepository>,
    pub authorizations: Arc<dyn AuthorizationRepository>,
    pub posts: Arc<dyn PostRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub members: Arc<dyn MemberRepository>,
    pub webhooks: Arc<dyn WebhookRepository>,
    pub outbox: Arc<dyn OutboxRepository>,
    pub analytics: Arc<dyn AnalyticsRepository>,
    pub throttle: Arc<dyn ThrottleRepository>,
}

impl Repositories {
    /// All repositories backed by one SQLite database
    pub fn sqlite(db: Database) -> Self {
        let db = Arc::new(db);
        Self {
            accounts: db.clone(),
            tokens: db.clone(),
            authorizations: db.clone(),
            posts: db.clone(),
            queue: db.clone(),
            members: db.clone(),
            webhooks: db.clone(),
            outbox: db.clone(),
            analytics: db.clone(),
            throttle: db,
        }
    }
}
