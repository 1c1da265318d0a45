//! Mock platform adapter for testing
//!
//! A scriptable [`PlatformAdapter`] that never touches the network. Each
//! operation answers from a queue of scripted results first and falls back
//! to a deterministic success once the queue is empty. Calls are counted and
//! published content is recorded so tests can assert on what the
//! orchestrator actually did.
//!
//! Tests keep an `Arc<MockAdapter>` and register a clone of it, so the same
//! instance can be inspected after the orchestrator has used it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;

use super::{Pkce, PlatformAdapter, PlatformResult};
use crate::accounts::Credentials;
use crate::types::{AccountType, Analytics, Content, Platform, ProfileInfo, PublishResult};

#[derive(Default)]
struct Script {
    exchange: VecDeque<PlatformResult<Credentials>>,
    refresh: VecDeque<PlatformResult<Credentials>>,
    validate: VecDeque<PlatformResult<bool>>,
    publish: VecDeque<PlatformResult<PublishResult>>,
    analytics: VecDeque<PlatformResult<Analytics>>,
}

#[derive(Default)]
struct Calls {
    exchange: AtomicUsize,
    refresh: AtomicUsize,
    validate: AtomicUsize,
    publish: AtomicUsize,
    analytics: AtomicUsize,
}

pub struct MockAdapter {
    platform: Platform,
    user_id: String,
    profile: ProfileInfo,
    delay: Duration,
    script: Mutex<Script>,
    calls: Calls,
    published: Mutex<Vec<Content>>,
    publish_tokens: Mutex<Vec<String>>,
    exchange_verifiers: Mutex<Vec<String>>,
}

impl MockAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            user_id: format!("{platform}-user-1"),
            profile: ProfileInfo {
                username: format!("mock_{platform}"),
                display_name: Some(format!("Mock {platform}")),
                avatar_url: None,
                profile_url: Some(format!("https://mock.example/{platform}/mock_{platform}")),
                account_type: match platform {
                    Platform::Facebook => AccountType::Page,
                    _ => AccountType::Personal,
                },
            },
            delay: Duration::ZERO,
            script: Mutex::new(Script::default()),
            calls: Calls::default(),
            published: Mutex::new(Vec::new()),
            publish_tokens: Mutex::new(Vec::new()),
            exchange_verifiers: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every network-shaped call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Platform user id reported by exchange and profile calls
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_profile(mut self, profile: ProfileInfo) -> Self {
        self.profile = profile;
        self
    }

    pub fn push_exchange(&self, result: PlatformResult<Credentials>) {
        self.script().exchange.push_back(result);
    }

    pub fn push_refresh(&self, result: PlatformResult<Credentials>) {
        self.script().refresh.push_back(result);
    }

    pub fn push_validate(&self, result: PlatformResult<bool>) {
        self.script().validate.push_back(result);
    }

    pub fn push_publish(&self, result: PlatformResult<PublishResult>) {
        self.script().publish.push_back(result);
    }

    pub fn push_analytics(&self, result: PlatformResult<Analytics>) {
        self.script().analytics.push_back(result);
    }

    pub fn exchange_calls(&self) -> usize {
        self.calls.exchange.load(Ordering::SeqCst)
    }

    pub fn refresh_calls(&self) -> usize {
        self.calls.refresh.load(Ordering::SeqCst)
    }

    pub fn validate_calls(&self) -> usize {
        self.calls.validate.load(Ordering::SeqCst)
    }

    pub fn publish_calls(&self) -> usize {
        self.calls.publish.load(Ordering::SeqCst)
    }

    pub fn analytics_calls(&self) -> usize {
        self.calls.analytics.load(Ordering::SeqCst)
    }

    /// Content of every successful publish, in call order
    pub fn published(&self) -> Vec<Content> {
        lock(&self.published).clone()
    }

    /// Access token presented on every publish attempt
    pub fn publish_tokens(&self) -> Vec<String> {
        lock(&self.publish_tokens).clone()
    }

    /// PKCE verifier presented on every code exchange
    pub fn exchange_verifiers(&self) -> Vec<String> {
        lock(&self.exchange_verifiers).clone()
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        lock(&self.script)
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }

    fn issue_credentials(&self, n: usize) -> Credentials {
        Credentials::new(format!("{}-access-{n}", self.platform), self.user_id.clone())
            .with_refresh_token(format!("{}-refresh-{n}", self.platform))
            .with_expiry(Utc::now() + chrono::Duration::hours(2))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl PlatformAdapter for MockAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        pkce: &Pkce,
    ) -> PlatformResult<String> {
        Ok(format!(
            "https://mock.example/{}/authorize?state={}&scope={}&code_challenge={}",
            self.platform,
            state,
            scopes.join("+"),
            pkce.challenge()
        ))
    }

    async fn exchange_code(&self, _code: &str, pkce: &Pkce) -> PlatformResult<Credentials> {
        let n = self.calls.exchange.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.exchange_verifiers).push(pkce.verifier().to_string());
        self.pause().await;
        let scripted = self.script().exchange.pop_front();
        scripted.unwrap_or_else(|| Ok(self.issue_credentials(n)))
    }

    async fn refresh_token(&self, credentials: &Credentials) -> PlatformResult<Credentials> {
        let n = self.calls.refresh.fetch_add(1, Ordering::SeqCst) + 1;
        self.pause().await;
        let scripted = self.script().refresh.pop_front();
        scripted.unwrap_or_else(|| {
            let refreshed = Credentials::new(format!("{}-refreshed-{n}", self.platform), "")
                .with_expiry(Utc::now() + chrono::Duration::hours(2));
            Ok(refreshed.carry_forward(credentials))
        })
    }

    async fn validate_credentials(&self, _credentials: &Credentials) -> PlatformResult<bool> {
        self.calls.validate.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.script().validate.pop_front();
        scripted.unwrap_or(Ok(true))
    }

    async fn fetch_profile(&self, _credentials: &Credentials) -> PlatformResult<ProfileInfo> {
        self.pause().await;
        Ok(self.profile.clone())
    }

    async fn publish(
        &self,
        credentials: &Credentials,
        content: &Content,
    ) -> PlatformResult<PublishResult> {
        let n = self.calls.publish.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.publish_tokens).push(credentials.access_token.expose().to_string());
        self.validate_content(content)?;
        self.pause().await;

        let scripted = self.script().publish.pop_front();
        let result = scripted.unwrap_or_else(|| {
            let id = format!("{}-post-{n}", self.platform);
            Ok(PublishResult {
                url: format!("https://mock.example/{}/posts/{id}", self.platform),
                platform_post_id: id,
                published_at: Utc::now(),
            })
        });
        if result.is_ok() {
            lock(&self.published).push(content.clone());
        }
        result
    }

    async fn fetch_analytics(
        &self,
        _credentials: &Credentials,
        _platform_post_id: &str,
    ) -> PlatformResult<Analytics> {
        self.calls.analytics.fetch_add(1, Ordering::SeqCst);
        self.pause().await;
        let scripted = self.script().analytics.pop_front();
        scripted.unwrap_or(Ok(Analytics {
            impressions: 100,
            likes: 10,
            comments: 2,
            shares: 1,
            clicks: 5,
            engagements: 13,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlatformError;

    #[tokio::test]
    async fn test_defaults_succeed() {
        let mock = MockAdapter::new(Platform::Twitter);
        let pkce = Pkce::generate();
        let credentials = mock.exchange_code("code", &pkce).await.unwrap();
        assert_eq!(credentials.platform_user_id, "twitter-user-1");
        assert_eq!(mock.exchange_verifiers(), vec![pkce.verifier().to_string()]);
        assert!(credentials.refresh_token.is_some());

        let result = mock.publish(&credentials, &Content::text("hello")).await.unwrap();
        assert_eq!(result.platform_post_id, "twitter-post-1");
        assert_eq!(mock.published(), vec![Content::text("hello")]);
        assert_eq!(mock.publish_tokens(), vec!["twitter-access-1".to_string()]);
    }

    #[tokio::test]
    async fn test_scripted_results_come_first() {
        let mock = MockAdapter::new(Platform::Facebook);
        mock.push_publish(Err(PlatformError::Network("reset".to_string())));
        let credentials = Credentials::new("token", "1");

        let err = mock.publish(&credentials, &Content::text("a")).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(mock.publish(&credentials, &Content::text("a")).await.is_ok());
        assert_eq!(mock.publish_calls(), 2);
        assert_eq!(mock.published().len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_carries_forward() {
        let mock = MockAdapter::new(Platform::Twitter);
        let old = Credentials::new("old", "42").with_refresh_token("keep-me");
        let refreshed = mock.refresh_token(&old).await.unwrap();
        assert_eq!(refreshed.access_token.expose(), "twitter-refreshed-1");
        assert_eq!(refreshed.refresh_token.unwrap().expose(), "keep-me");
        assert_eq!(refreshed.platform_user_id, "42");
        assert_eq!(mock.refresh_calls(), 1);
    }
}
