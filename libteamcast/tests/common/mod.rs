//! Shared setup for integration tests
//!
//! Builds a `TeamcastService` over a temporary SQLite database with mock
//! adapters for every platform, and a team owned by one user.

#![allow(dead_code)]

use std::sync::Arc;

use libteamcast::config::Config;
use libteamcast::platforms::mock::MockAdapter;
use libteamcast::platforms::AdapterRegistry;
use libteamcast::repository::Repositories;
use libteamcast::service::accounts::ConnectRequest;
use libteamcast::service::posts::CreatePostRequest;
use libteamcast::{Account, Content, Database, KeyRing, Platform, Post, Role, TeamcastService};
use tempfile::TempDir;
use uuid::Uuid;

pub struct TestEnv {
    pub _temp_dir: TempDir,
    pub service: TeamcastService,
    pub repos: Repositories,
    pub twitter: Arc<MockAdapter>,
    pub facebook: Arc<MockAdapter>,
    pub team_id: Uuid,
    pub owner: Uuid,
}

/// Retries without waiting
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.publishing.retry_base_delay_secs = 0;
    config.queue.retry_delay_secs = 0;
    config.queue.retry_jitter_secs = 0;
    config
}

pub async fn setup() -> TestEnv {
    setup_with(fast_config()).await
}

pub async fn setup_with(config: Config) -> TestEnv {
    setup_with_adapters(
        config,
        MockAdapter::new(Platform::Twitter),
        MockAdapter::new(Platform::Facebook),
    )
    .await
}

pub async fn setup_with_adapters(
    config: Config,
    twitter: MockAdapter,
    facebook: MockAdapter,
) -> TestEnv {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("teamcast.db");
    let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
    let repos = Repositories::sqlite(db);

    let twitter = Arc::new(twitter);
    let facebook = Arc::new(facebook);
    let registry = AdapterRegistry::builder()
        .register(twitter.clone())
        .register(facebook.clone())
        .build();

    let service = TeamcastService::with_parts(config, repos.clone(), KeyRing::generate(), registry);
    let owner = Uuid::new_v4();
    let team = service.members().create_team(owner).await.unwrap();

    TestEnv {
        _temp_dir: temp_dir,
        service,
        repos,
        twitter,
        facebook,
        team_id: team.team_id,
        owner,
    }
}

impl TestEnv {
    pub async fn member(&self, role: Role) -> Uuid {
        let user_id = Uuid::new_v4();
        self.service
            .members()
            .add_member(self.team_id, self.owner, user_id, role)
            .await
            .unwrap();
        user_id
    }

    /// Authorization URL then callback, as `user_id`
    pub async fn connect_as(
        &self,
        platform: Platform,
        user_id: Uuid,
    ) -> libteamcast::Result<Account> {
        let accounts = self.service.accounts();
        let authorization = accounts
            .authorization_url(self.team_id, user_id, platform, None)
            .await?;
        accounts
            .connect(ConnectRequest {
                team_id: self.team_id,
                user_id,
                platform,
                code: "abc".to_string(),
                state: authorization.state,
            })
            .await
    }

    pub async fn connect(&self, platform: Platform) -> Account {
        self.connect_as(platform, self.owner).await.unwrap()
    }

    pub async fn draft(&self, user_id: Uuid, platforms: Vec<Platform>) -> Post {
        self.draft_text(user_id, "Quarterly results are out", platforms).await
    }

    pub async fn draft_text(&self, user_id: Uuid, text: &str, platforms: Vec<Platform>) -> Post {
        self.service
            .posts()
            .create(CreatePostRequest {
                team_id: self.team_id,
                user_id,
                content: Content::text(text),
                platforms,
            })
            .await
            .unwrap()
    }
}
