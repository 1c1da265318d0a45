//! Engagement analytics with a read-through cache
//!
//! Entries are keyed by (account, post) and live for
//! `publishing.analytics_cache_ttl_secs`. Every fetch that reaches the
//! platform also writes a snapshot row; that write is advisory.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::ServiceContext;
use crate::error::{Result, TeamcastError};
use crate::permissions::Capability;
use crate::platforms::with_timeout;
use crate::posts::RecordStatus;
use crate::types::Analytics;

type CacheKey = (Uuid, Uuid);

#[derive(Clone)]
pub struct AnalyticsService {
    context: Arc<ServiceContext>,
    cache: Arc<Mutex<HashMap<CacheKey, (Analytics, Instant)>>>,
}

impl AnalyticsService {
    pub(crate) fn new(context: Arc<ServiceContext>) -> Self {
        Self {
            context,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Metrics for the post published through `account_id`
    pub async fn get_analytics(
        &self,
        account_id: Uuid,
        post_id: Uuid,
        user_id: Uuid,
    ) -> Result<Analytics> {
        let account = self
            .context
            .repos
            .accounts
            .get_account(account_id)
            .await?
            .ok_or_else(|| TeamcastError::NotFound(format!("account {account_id}")))?;
        self.context
            .authorize(account.team_id, user_id, Capability::ViewAnalytics, None)
            .await?;

        let key = (account_id, post_id);
        if let Some(cached) = self.cached(&key) {
            debug!(%account_id, %post_id, "analytics cache hit");
            return Ok(cached);
        }

        let record = self
            .context
            .repos
            .posts
            .find_record(post_id, account_id)
            .await?
            .filter(|r| r.status == RecordStatus::Success)
            .ok_or_else(|| {
                TeamcastError::NotFound(format!(
                    "post {post_id} was not published through account {account_id}"
                ))
            })?;
        let platform_post_id = record
            .platform_post_id
            .ok_or_else(|| TeamcastError::NotFound(format!("platform id of post {post_id}")))?;

        let adapter = self.context.adapter(account.platform)?;
        let credentials = self
            .context
            .refresher
            .refresh_if_expiring(account_id, self.context.config.publishing.publish_refresh_skew())
            .await?;
        let analytics = with_timeout(
            self.context.adapter_timeout(),
            adapter.fetch_analytics(&credentials, &platform_post_id),
        )
        .await?;

        self.lock().insert(key, (analytics, Instant::now()));
        if let Err(e) = self
            .context
            .repos
            .analytics
            .record_snapshot(account_id, post_id, &platform_post_id, &analytics, Utc::now())
            .await
        {
            warn!(%account_id, %post_id, error = %e, "failed to write analytics snapshot");
        }
        Ok(analytics)
    }

    /// Drop cached entries past their TTL
    pub fn evict_expired(&self) -> usize {
        let ttl = self.context.config.publishing.analytics_cache_ttl();
        let mut cache = self.lock();
        let before = cache.len();
        cache.retain(|_, (_, fetched)| fetched.elapsed() < ttl);
        before - cache.len()
    }

    fn cached(&self, key: &CacheKey) -> Option<Analytics> {
        let ttl = self.context.config.publishing.analytics_cache_ttl();
        self.lock()
            .get(key)
            .filter(|(_, fetched)| fetched.elapsed() < ttl)
            .map(|(analytics, _)| *analytics)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<CacheKey, (Analytics, Instant)>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;
    use crate::permissions::Role;
    use crate::service::test_support::{fast_config, harness, harness_with};
    use crate::types::Platform;

    #[tokio::test]
    async fn test_second_read_within_ttl_is_cached() {
        let h = harness().await;
        let account = h.connect(Platform::Twitter).await;
        let post = h.draft(h.owner, vec![Platform::Twitter]).await;
        h.service.publishing().publish_now(post.id, h.owner).await.unwrap();
        let viewer = h.member(Role::Viewer).await;

        let analytics = h.service.analytics();
        let first = analytics.get_analytics(account.id, post.id, viewer).await.unwrap();
        let second = analytics.get_analytics(account.id, post.id, viewer).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.impressions, 100);
        assert_eq!(h.twitter.analytics_calls(), 1);

        let snapshot = h
            .service
            .context
            .repos
            .analytics
            .latest_snapshot(account.id, post.id)
            .await
            .unwrap();
        assert_eq!(snapshot.map(|(a, _)| a), Some(first));
    }

    #[tokio::test]
    async fn test_zero_ttl_always_fetches() {
        let mut config = fast_config();
        config.publishing.analytics_cache_ttl_secs = 0;
        let h = harness_with(config).await;
        let account = h.connect(Platform::Twitter).await;
        let post = h.draft(h.owner, vec![Platform::Twitter]).await;
        h.service.publishing().publish_now(post.id, h.owner).await.unwrap();

        for _ in 0..2 {
            h.service
                .analytics()
                .get_analytics(account.id, post.id, h.owner)
                .await
                .unwrap();
        }
        assert_eq!(h.twitter.analytics_calls(), 2);
        assert_eq!(h.service.analytics().evict_expired(), 1);
    }

    #[tokio::test]
    async fn test_unpublished_post_has_no_analytics() {
        let h = harness().await;
        let account = h.connect(Platform::Twitter).await;
        let post = h.draft(h.owner, vec![Platform::Twitter]).await;

        let err = h
            .service
            .analytics()
            .get_analytics(account.id, post.id, h.owner)
            .await
            .unwrap_err();
        assert!(matches!(err, TeamcastError::NotFound(_)));
        assert_eq!(h.twitter.analytics_calls(), 0);
    }

    #[tokio::test]
    async fn test_platform_errors_are_not_cached() {
        let h = harness().await;
        let account = h.connect(Platform::Twitter).await;
        let post = h.draft(h.owner, vec![Platform::Twitter]).await;
        h.service.publishing().publish_now(post.id, h.owner).await.unwrap();
        h.twitter.push_analytics(Err(PlatformError::Server {
            status: 503,
            body: "over capacity".to_string(),
        }));

        let err = h
            .service
            .analytics()
            .get_analytics(account.id, post.id, h.owner)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        h.service
            .analytics()
            .get_analytics(account.id, post.id, h.owner)
            .await
            .unwrap();
        assert_eq!(h.twitter.analytics_calls(), 2);
    }

    #[tokio::test]
    async fn test_non_member_cannot_read() {
        let h = harness().await;
        let account = h.connect(Platform::Twitter).await;
        let err = h
            .service
            .analytics()
            .get_analytics(account.id, Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, TeamcastError::Authorization(_)));
    }
}
