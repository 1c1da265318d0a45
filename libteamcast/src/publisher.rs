//! Multi-platform publishing
//!
//! Publishes one post to every platform it targets, concurrently. Each
//! platform gets its own [`PublishingRecord`]; retries for one record are
//! strictly sequential and bounded by the post's `max_retries`. A record that ends
//! `Success` or `Failed` is never attempted again.
//!
//! When the pass runs under a queue [`Lease`], the lease is renewed before
//! every platform call and the pass aborts with `Conflict` once it is lost.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::accounts::{Account, AccountStatus, Credentials};
use crate::config::PublishingConfig;
use crate::error::{PlatformError, Result, TeamcastError};
use crate::platforms::{with_timeout, AdapterRegistry, PlatformAdapter};
use crate::posts::{
    PlatformFailure, PlatformSuccess, Post, PublishFailure, PublishingRecord, RecordStatus,
};
use crate::queue::{Backoff, Lease};
use crate::rate_limiter::ThrottleTracker;
use crate::refresh::TokenRefresher;
use crate::repository::{AccountRepository, PostRepository};
use crate::types::{Platform, PublishResult};

/// Records and per-platform outcome of one publishing pass
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub records: Vec<PublishingRecord>,
    pub succeeded: Vec<PlatformSuccess>,
    pub failed: Vec<PlatformFailure>,
}

pub struct Publisher {
    accounts: Arc<dyn AccountRepository>,
    posts: Arc<dyn PostRepository>,
    registry: AdapterRegistry,
    refresher: Arc<TokenRefresher>,
    throttle: ThrottleTracker,
    config: PublishingConfig,
}

impl Publisher {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        posts: Arc<dyn PostRepository>,
        registry: AdapterRegistry,
        refresher: Arc<TokenRefresher>,
        throttle: ThrottleTracker,
        config: PublishingConfig,
    ) -> Self {
        Self {
            accounts,
            posts,
            registry,
            refresher,
            throttle,
            config,
        }
    }

    /// Publish to every targeted platform
    ///
    /// Platform failures are reported in the returned report. An `Err` means
    /// the pass itself broke (storage, not the platforms) and the whole job
    /// should be retried.
    pub async fn publish(&self, post: &Post, lease: Option<&Lease>) -> Result<PublishReport> {
        let existing = self.posts.records_for_post(post.id).await?;
        let now = Utc::now();

        let attempts = post.platforms.iter().map(|&platform| {
            let record = existing
                .iter()
                .find(|r| r.platform == platform)
                .cloned()
                .unwrap_or_else(|| PublishingRecord::pending(post.id, platform, now));
            self.publish_to(post, record, lease)
        });
        let results = join_all(attempts).await;

        let mut report = PublishReport::default();
        for result in results {
            let (record, failure) = result?;
            match failure {
                None => report.succeeded.push(PlatformSuccess {
                    platform: record.platform,
                    account_id: record.account_id,
                    platform_post_id: record.platform_post_id.clone().unwrap_or_default(),
                    url: record.url.clone().unwrap_or_default(),
                }),
                Some(error) => report.failed.push(PlatformFailure {
                    platform: record.platform,
                    account_id: record.account_id,
                    error,
                }),
            }
            report.records.push(record);
        }

        info!(
            post_id = %post.id,
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "publishing pass finished"
        );
        Ok(report)
    }

    async fn publish_to(
        &self,
        post: &Post,
        mut record: PublishingRecord,
        lease: Option<&Lease>,
    ) -> Result<(PublishingRecord, Option<PublishFailure>)> {
        match record.status {
            RecordStatus::Success => {
                debug!(
                    post_id = %post.id,
                    platform = %record.platform,
                    "already published, skipping"
                );
                return Ok((record, None));
            }
            RecordStatus::Failed => {
                let failure = PublishFailure::Recorded(record.error.clone().unwrap_or_default());
                return Ok((record, Some(failure)));
            }
            RecordStatus::Pending | RecordStatus::Retrying => {}
        }

        let outcome = self.attempt(post, &mut record, lease).await?;
        let now = Utc::now();
        let failure = match outcome {
            Ok(result) => {
                record.succeed(&result, now);
                info!(
                    post_id = %post.id,
                    platform = %record.platform,
                    url = %result.url,
                    "published"
                );
                None
            }
            Err(failure) => {
                record.fail(&failure, now);
                warn!(
                    post_id = %post.id,
                    platform = %record.platform,
                    error = %failure,
                    "publishing failed"
                );
                Some(failure)
            }
        };
        self.posts.upsert_record(&record).await?;
        Ok((record, failure))
    }

    /// Resolve, pre-flight and publish with retries. The outer `Result`
    /// carries storage errors only.
    async fn attempt(
        &self,
        post: &Post,
        record: &mut PublishingRecord,
        lease: Option<&Lease>,
    ) -> Result<std::result::Result<PublishResult, PublishFailure>> {
        let platform = record.platform;
        let mut account = match self.resolve_account(post, platform).await? {
            Ok(account) => account,
            Err(failure) => return Ok(Err(failure)),
        };
        record.account_id = Some(account.id);

        let Some(adapter) = self.registry.get(platform) else {
            return Ok(Err(PublishFailure::NoAdapter(platform)));
        };

        // nothing goes over the network for content the platform would refuse
        if let Err(e) = adapter.validate_content(&post.content) {
            return Ok(Err(e.into()));
        }

        let credentials = match self
            .refresher
            .refresh_if_expiring(account.id, self.config.publish_refresh_skew())
            .await
        {
            Ok(credentials) => credentials,
            Err(e) => return failure_or_error(e).map(Err),
        };

        let call = PublishCall {
            adapter: adapter.as_ref(),
            post,
            lease,
        };
        self.publish_with_retry(call, record, &mut account, credentials).await
    }

    async fn publish_with_retry(
        &self,
        call: PublishCall<'_>,
        record: &mut PublishingRecord,
        account: &mut Account,
        mut credentials: Credentials,
    ) -> Result<std::result::Result<PublishResult, PublishFailure>> {
        let backoff = Backoff::linear(self.config.retry_base_delay());
        let timeout = self.config.adapter_timeout();
        let mut refreshed = false;
        let PublishCall { adapter, post, lease } = call;

        loop {
            if let Some(lease) = lease {
                lease.renew().await?;
            }
            let error = match with_timeout(timeout, adapter.publish(&credentials, &post.content))
                .await
            {
                Ok(result) => {
                    self.on_success(account).await?;
                    return Ok(Ok(result));
                }
                Err(e) => e,
            };

            if matches!(error, PlatformError::TokenExpired(_)) && !refreshed {
                // one forced refresh and one extra attempt, outside the retry budget
                refreshed = true;
                info!(
                    account_id = %account.id,
                    platform = %record.platform,
                    "access token rejected, refreshing"
                );
                credentials = match self.refresher.force_refresh(account.id, &credentials).await {
                    Ok(credentials) => credentials,
                    Err(e) => return failure_or_error(e).map(Err),
                };
                continue;
            }

            if error.is_rate_limit() {
                self.on_rate_limited(account).await?;
            }

            if error.is_retryable() && record.retry_count < post.max_retries {
                record.begin_retry(Utc::now());
                self.posts.upsert_record(record).await?;

                let delay = backoff.delay(record.retry_count);
                warn!(
                    post_id = %post.id,
                    platform = %record.platform,
                    attempt = record.retry_count,
                    max_retries = post.max_retries,
                    retry_after = ?error.retry_after(),
                    error = %error,
                    "transient publishing error, retrying in {:?}",
                    delay
                );
                sleep(delay).await;
                continue;
            }

            if error.requires_reconnect() || matches!(error, PlatformError::TokenExpired(_)) {
                self.refresher
                    .require_reconnect(account, &error.to_string(), Utc::now())
                    .await?;
            }
            return Ok(Err(error.into()));
        }
    }

    /// Oldest live account of the team on this platform that may publish
    async fn resolve_account(
        &self,
        post: &Post,
        platform: Platform,
    ) -> Result<std::result::Result<Account, PublishFailure>> {
        let accounts = self.accounts.list_live_accounts(post.team_id, Some(platform)).await?;
        if let Some(account) = accounts.iter().find(|a| a.status().can_publish()) {
            return Ok(Ok(account.clone()));
        }
        Ok(Err(match accounts.first() {
            Some(account) => PublishFailure::AccountUnavailable(account.status()),
            None => PublishFailure::NoAccount(platform),
        }))
    }

    async fn on_success(&self, account: &mut Account) -> Result<()> {
        if account.status() == AccountStatus::RateLimited {
            self.throttle.reset(account.id).await?;
        }
        self.refresher.apply(account, Utc::now(), Account::activate).await
    }

    async fn on_rate_limited(&self, account: &mut Account) -> Result<()> {
        let now = Utc::now();
        if self.throttle.record(account.id, now).await? {
            self.refresher.apply(account, now, Account::mark_rate_limited).await?;
        }
        Ok(())
    }
}

/// What one record is published with
struct PublishCall<'a> {
    adapter: &'a dyn PlatformAdapter,
    post: &'a Post,
    lease: Option<&'a Lease>,
}

/// Platform, credential and validation errors fail the record; anything
/// else is an infrastructure error for the caller
fn failure_or_error(error: TeamcastError) -> Result<PublishFailure> {
    match error {
        TeamcastError::Platform(e) => Ok(e.into()),
        TeamcastError::Credential(e) => Ok(e.into()),
        TeamcastError::Validation(e) => Ok(e.into()),
        // the account went away mid-pass
        TeamcastError::NotFound(what) => Ok(PublishFailure::Internal(format!("{what} not found"))),
        other => Err(other),
    }
}

/// Total time the retry policy waits for one record at most
pub fn max_backoff(config: &PublishingConfig) -> Duration {
    Backoff::linear(config.retry_base_delay()).total(config.max_retries)
}
