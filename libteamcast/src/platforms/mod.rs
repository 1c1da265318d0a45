//! Platform adapters
//!
//! Every social network is reached through one [`PlatformAdapter`]. The
//! orchestrator never talks HTTP itself: it looks the adapter up in the
//! [`AdapterRegistry`] by [`Platform`] and hands it decrypted
//! [`Credentials`] for the duration of a single call.
//!
//! # Examples
//!
//! ```no_run
//! use libteamcast::config::Config;
//! use libteamcast::platforms::{AdapterRegistry, Pkce};
//! use libteamcast::types::Platform;
//!
//! # fn example() -> libteamcast::error::Result<()> {
//! let config = Config::load()?;
//! let registry = AdapterRegistry::from_config(&config)?;
//!
//! if let Some(twitter) = registry.get(Platform::Twitter) {
//!     let pkce = Pkce::generate();
//!     let url = twitter.authorization_url("csrf-state", &twitter.default_scopes(), &pkce)?;
//!     println!("Authorize at {}", url);
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::accounts::Credentials;
use crate::config::Config;
use crate::error::{PlatformError, Result};
use crate::types::{
    Analytics, Capabilities, Content, Platform, ProfileInfo, PublishResult, RateLimitStatus,
};

pub mod facebook;
mod http;
pub mod twitter;

// Mock adapter is available for all builds (not just tests) to support integration tests
pub mod mock;

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Capability contract of one social platform
///
/// Adapters are stateless with respect to accounts: every call receives the
/// credentials it acts with. They must be cheap to share behind an `Arc`.
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Static limits used for pre-flight validation
    fn capabilities(&self) -> Capabilities {
        self.platform().capabilities()
    }

    /// Scopes requested when the caller does not name any
    fn default_scopes(&self) -> Vec<String> {
        Vec::new()
    }

    /// URL the user is sent to in order to grant access. Platforms that
    /// support PKCE carry the challenge of `pkce`.
    fn authorization_url(
        &self,
        state: &str,
        scopes: &[String],
        pkce: &Pkce,
    ) -> PlatformResult<String>;

    /// Trade an authorization code for credentials. `pkce` must be the pair
    /// the authorization URL was built with. Adapters that can upgrade a
    /// short-lived token to a long-lived one do so here.
    async fn exchange_code(&self, code: &str, pkce: &Pkce) -> PlatformResult<Credentials>;

    /// Obtain fresh credentials. Returns `RefreshNotSupported` when the
    /// platform's tokens cannot be renewed without the user.
    async fn refresh_token(&self, credentials: &Credentials) -> PlatformResult<Credentials>;

    /// Whether the platform still accepts these credentials
    async fn validate_credentials(&self, credentials: &Credentials) -> PlatformResult<bool>;

    async fn fetch_profile(&self, credentials: &Credentials) -> PlatformResult<ProfileInfo>;

    /// Publish content. Implementations call [`PlatformAdapter::validate_content`]
    /// before making any request.
    async fn publish(
        &self,
        credentials: &Credentials,
        content: &Content,
    ) -> PlatformResult<PublishResult>;

    async fn fetch_analytics(
        &self,
        credentials: &Credentials,
        platform_post_id: &str,
    ) -> PlatformResult<Analytics>;

    async fn fetch_rate_limits(
        &self,
        _credentials: &Credentials,
    ) -> PlatformResult<RateLimitStatus> {
        Ok(RateLimitStatus::unknown())
    }

    fn validate_content(&self, content: &Content) -> PlatformResult<()> {
        self.capabilities()
            .check(self.platform(), content)
            .map_err(|e| PlatformError::Validation(e.to_string()))
    }
}

/// PKCE verifier of one authorization (RFC 7636)
#[derive(Clone)]
pub struct Pkce {
    verifier: String,
}

impl Pkce {
    /// 32 random bytes, base64url encoded to 43 characters
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            verifier: URL_SAFE_NO_PAD.encode(bytes),
        }
    }

    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        Self {
            verifier: verifier.into(),
        }
    }

    pub fn verifier(&self) -> &str {
        &self.verifier
    }

    /// S256 challenge sent with the authorization URL
    pub fn challenge(&self) -> String {
        URL_SAFE_NO_PAD.encode(Sha256::digest(self.verifier.as_bytes()))
    }
}

impl std::fmt::Debug for Pkce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pkce([REDACTED])")
    }
}

/// Bound an adapter call. Running out of time is a retryable network error.
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> PlatformResult<T>
where
    F: Future<Output = PlatformResult<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(PlatformError::Network(format!(
            "adapter call timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

/// Platform → adapter map, fixed once built
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistry {
    pub fn builder() -> AdapterRegistryBuilder {
        AdapterRegistryBuilder::default()
    }

    /// Register an adapter for every platform with a config section
    pub fn from_config(config: &Config) -> Result<Self> {
        let timeout = config.publishing.adapter_timeout();
        let mut builder = Self::builder();

        if let Some(twitter) = &config.twitter {
            let adapter = twitter::TwitterAdapter::new(twitter.clone(), timeout)?;
            builder = builder.register(Arc::new(adapter));
        }
        if let Some(facebook) = &config.facebook {
            let adapter = facebook::FacebookAdapter::new(facebook.clone(), timeout)?;
            builder = builder.register(Arc::new(adapter));
        }

        let registry = builder.build();
        tracing::debug!(platforms = ?registry.platforms(), "adapter registry ready");
        Ok(registry)
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn PlatformAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    pub fn contains(&self, platform: Platform) -> bool {
        self.adapters.contains_key(&platform)
    }

    /// Registered platforms in declaration order
    pub fn platforms(&self) -> Vec<Platform> {
        Platform::ALL
            .into_iter()
            .filter(|p| self.adapters.contains_key(p))
            .collect()
    }
}

#[derive(Default)]
pub struct AdapterRegistryBuilder {
    adapters: HashMap<Platform, Arc<dyn PlatformAdapter>>,
}

impl AdapterRegistryBuilder {
    /// Add an adapter under its own platform. A later registration for the
    /// same platform replaces the earlier one.
    pub fn register(mut self, adapter: Arc<dyn PlatformAdapter>) -> Self {
        self.adapters.insert(adapter.platform(), adapter);
        self
    }

    pub fn build(self) -> AdapterRegistry {
        AdapterRegistry {
            adapters: self.adapters,
        }
    }
}
