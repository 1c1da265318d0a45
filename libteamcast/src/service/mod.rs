//! Service layer for Teamcast
//!
//! A facade over everything the orchestrator does, consumed by the daemon and
//! the key tool alike.
//!
//! # Architecture
//!
//! `TeamcastService` is the entry point. It owns the shared state (storage,
//! vault, adapters, outbox) and hands out specialized sub-services:
//!
//! - `AccountService`: connecting, refreshing and disconnecting social accounts
//! - `MemberService`: team roles and the owner invariant
//! - `PostService`: drafts, scheduling, cancellation
//! - `PublishingService`: running a queued post through the publisher
//! - `AnalyticsService`: cached engagement numbers
//! - `Dispatcher`: the worker side of the queue
//!
//! # Example
//!
//! ```no_run
//! use libteamcast::service::TeamcastService;
//! use libteamcast::service::posts::CreatePostRequest;
//! use libteamcast::types::{Content, Platform};
//! use uuid::Uuid;
//!
//! # async fn example() -> libteamcast::Result<()> {
//! let service = TeamcastService::new().await?;
//! let owner = Uuid::new_v4();
//! let team = service.members().create_team(owner).await?;
//!
//! let post = service
//!     .posts()
//!     .create(CreatePostRequest {
//!         team_id: team.team_id,
//!         user_id: owner,
//!         content: Content::text("Hello from the team"),
//!         platforms: vec![Platform::Twitter],
//!     })
//!     .await?;
//!
//! let outcome = service.publishing().publish_now(post.id, owner).await?;
//! println!("published to {} platforms", outcome.succeeded.len());
//! # Ok(())
//! # }
//! ```

pub mod accounts;
pub mod analytics;
pub mod dispatcher;
pub mod members;
pub mod posts;
pub mod publishing;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use self::accounts::AccountService;
use self::analytics::AnalyticsService;
use self::dispatcher::Dispatcher;
use self::members::MemberService;
use self::posts::PostService;
use self::publishing::PublishingService;
use crate::config::Config;
use crate::credentials::{CredentialVault, KeyRing};
use crate::db::Database;
use crate::error::{ConfigError, Result, TeamcastError};
use crate::outbox::Outbox;
use crate::permissions::{authorize, Capability, Member};
use crate::platforms::{AdapterRegistry, PlatformAdapter};
use crate::publisher::Publisher;
use crate::rate_limiter::ThrottleTracker;
use crate::refresh::TokenRefresher;
use crate::repository::Repositories;
use crate::types::Platform;

/// State shared by every sub-service
pub(crate) struct ServiceContext {
    pub(crate) repos: Repositories,
    pub(crate) config: Config,
    pub(crate) vault: CredentialVault,
    pub(crate) registry: AdapterRegistry,
    pub(crate) outbox: Outbox,
    pub(crate) throttle: ThrottleTracker,
    pub(crate) refresher: Arc<TokenRefresher>,
    pub(crate) publisher: Publisher,
}

impl ServiceContext {
    /// Gate a caller against the role matrix for one team
    pub(crate) async fn authorize(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        capability: Capability,
        creator: Option<Uuid>,
    ) -> Result<Member> {
        let member = self.repos.members.get_member(team_id, user_id).await?;
        authorize(member.as_ref(), capability, creator)?;
        // authorize only passes for members
        member.ok_or_else(|| TeamcastError::Authorization(format!("caller cannot {capability}")))
    }

    pub(crate) fn adapter(&self, platform: Platform) -> Result<Arc<dyn PlatformAdapter>> {
        self.registry
            .get(platform)
            .ok_or_else(|| TeamcastError::NotFound(format!("no adapter registered for {platform}")))
    }

    pub(crate) fn adapter_timeout(&self) -> Duration {
        self.config.publishing.adapter_timeout()
    }
}

/// Main service facade that coordinates all sub-services
///
/// All sub-services share one [`ServiceContext`] behind an `Arc`, so the
/// facade is cheap to share between the dispatcher loop and request handlers.
pub struct TeamcastService {
    context: Arc<ServiceContext>,
    accounts: AccountService,
    members: MemberService,
    posts: PostService,
    publishing: PublishingService,
    analytics: AnalyticsService,
}

impl TeamcastService {
    /// Create a service from the configuration file at the default location
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration cannot be loaded
    /// - The vault key file cannot be read or created
    /// - Database cannot be initialized or migrated
    pub async fn new() -> Result<Self> {
        let config = Config::load()?;
        Self::from_config(config).await
    }

    /// Create a service from a loaded configuration
    pub async fn from_config(config: Config) -> Result<Self> {
        let registry = AdapterRegistry::from_config(&config)?;
        if registry.platforms().is_empty() {
            return Err(ConfigError::MissingField(
                "at least one platform section ([twitter] or [facebook])".to_string(),
            )
            .into());
        }

        let db_path = shellexpand::tilde(&config.database.path).to_string();
        let db = Database::new(&db_path).await?;

        let keys_file = PathBuf::from(shellexpand::tilde(&config.vault.keys_file).to_string());
        let keys = KeyRing::load_or_create(&keys_file)?;

        Ok(Self::with_parts(config, Repositories::sqlite(db), keys, registry))
    }

    /// Assemble a service from already-built parts
    ///
    /// Used by tests to inject mock adapters and an in-memory key ring.
    pub fn with_parts(
        config: Config,
        repos: Repositories,
        keys: KeyRing,
        registry: AdapterRegistry,
    ) -> Self {
        let vault = CredentialVault::new(repos.tokens.clone(), keys);
        let outbox = Outbox::new(repos.outbox.clone(), config.outbox.clone());
        let throttle =
            ThrottleTracker::new(repos.throttle.clone(), config.publishing.rate_limit_threshold);
        let refresher = Arc::new(TokenRefresher::new(
            repos.accounts.clone(),
            vault.clone(),
            registry.clone(),
            outbox.clone(),
            config.publishing.adapter_timeout(),
        ));
        let publisher = Publisher::new(
            repos.accounts.clone(),
            repos.posts.clone(),
            registry.clone(),
            Arc::clone(&refresher),
            throttle.clone(),
            config.publishing.clone(),
        );

        let context = Arc::new(ServiceContext {
            repos,
            config,
            vault,
            registry,
            outbox,
            throttle,
            refresher,
            publisher,
        });

        Self {
            accounts: AccountService::new(Arc::clone(&context)),
            members: MemberService::new(Arc::clone(&context)),
            posts: PostService::new(Arc::clone(&context)),
            publishing: PublishingService::new(Arc::clone(&context)),
            analytics: AnalyticsService::new(Arc::clone(&context)),
            context,
        }
    }

    pub fn accounts(&self) -> &AccountService {
        &self.accounts
    }

    pub fn members(&self) -> &MemberService {
        &self.members
    }

    pub fn posts(&self) -> &PostService {
        &self.posts
    }

    pub fn publishing(&self) -> &PublishingService {
        &self.publishing
    }

    pub fn analytics(&self) -> &AnalyticsService {
        &self.analytics
    }

    /// A queue worker identified by `worker_id`
    pub fn dispatcher(&self, worker_id: impl Into<String>) -> Dispatcher {
        Dispatcher::new(
            Arc::clone(&self.context),
            self.publishing.clone(),
            self.analytics.clone(),
            worker_id.into(),
        )
    }

    pub fn vault(&self) -> &CredentialVault {
        &self.context.vault
    }

    pub fn outbox(&self) -> &Outbox {
        &self.context.outbox
    }

    pub fn config(&self) -> &Config {
        &self.context.config
    }
}
