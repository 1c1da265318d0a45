//! Vault key rotation across service restarts

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::fast_config;
use libteamcast::error::CredentialError;
use libteamcast::platforms::mock::MockAdapter;
use libteamcast::platforms::AdapterRegistry;
use libteamcast::posts::PublishFailure;
use libteamcast::repository::Repositories;
use libteamcast::service::accounts::ConnectRequest;
use libteamcast::service::posts::CreatePostRequest;
use libteamcast::{AccountStatus, Content, Database, KeyRing, Platform, PostStatus, TeamcastService};
use tempfile::TempDir;
use uuid::Uuid;

struct Deployment {
    _temp_dir: TempDir,
    repos: Repositories,
    twitter: Arc<MockAdapter>,
    team_id: Uuid,
    owner: Uuid,
}

impl Deployment {
    async fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("teamcast.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        Self {
            _temp_dir: temp_dir,
            repos: Repositories::sqlite(db),
            twitter: Arc::new(MockAdapter::new(Platform::Twitter)),
            team_id: Uuid::nil(),
            owner: Uuid::new_v4(),
        }
    }

    /// A service process over the shared database holding `keys`
    fn start(&self, keys: KeyRing) -> TeamcastService {
        let registry = AdapterRegistry::builder().register(self.twitter.clone()).build();
        TeamcastService::with_parts(fast_config(), self.repos.clone(), keys, registry)
    }

    async fn publish(&self, service: &TeamcastService) -> libteamcast::posts::PublishOutcome {
        let post = service
            .posts()
            .create(CreatePostRequest {
                team_id: self.team_id,
                user_id: self.owner,
                content: Content::text("Rotation test"),
                platforms: vec![Platform::Twitter],
            })
            .await
            .unwrap();
        service.publishing().publish_now(post.id, self.owner).await.unwrap()
    }
}

async fn connected(deployment: &mut Deployment, keys: KeyRing) -> (TeamcastService, Uuid) {
    let service = deployment.start(keys);
    let team = service.members().create_team(deployment.owner).await.unwrap();
    deployment.team_id = team.team_id;
    let authorization = service
        .accounts()
        .authorization_url(team.team_id, deployment.owner, Platform::Twitter, None)
        .await
        .unwrap();
    let account = service
        .accounts()
        .connect(ConnectRequest {
            team_id: team.team_id,
            user_id: deployment.owner,
            platform: Platform::Twitter,
            code: "abc".to_string(),
            state: authorization.state,
        })
        .await
        .unwrap();
    (service, account.id)
}

#[tokio::test]
async fn test_rotation_reencrypt_and_retire() {
    let mut deployment = Deployment::new().await;
    let original = KeyRing::generate().to_toml().unwrap();
    let (_first, account_id) = connected(&mut deployment, KeyRing::parse(&original).unwrap()).await;

    let mut rotated = KeyRing::parse(&original).unwrap();
    assert_eq!(rotated.rotate(), 2);
    let rotated_toml = rotated.to_toml().unwrap();

    // rows written under version 1 stay readable after the rotation
    let service = deployment.start(rotated);
    assert_eq!(service.vault().key_version(), 2);
    let outcome = deployment.publish(&service).await;
    assert_eq!(outcome.status, PostStatus::Published);

    let report = service.vault().reencrypt_all(Utc::now()).await.unwrap();
    assert!(report.is_success());
    assert_eq!(report.migrated, vec![account_id]);
    let row = deployment.repos.tokens.get_tokens(account_id).await.unwrap().unwrap();
    assert_eq!(row.key_version, 2);

    // nothing left to migrate
    let again = service.vault().reencrypt_all(Utc::now()).await.unwrap();
    assert!(again.migrated.is_empty());

    let mut retired = KeyRing::parse(&rotated_toml).unwrap();
    retired.retire(1).unwrap();
    assert_eq!(retired.versions(), vec![2]);
    let service = deployment.start(retired);
    let credentials = service.vault().get(account_id).await.unwrap();
    assert_eq!(credentials.platform_user_id, "twitter-user-1");
}

#[tokio::test]
async fn test_current_key_cannot_be_retired() {
    let mut keys = KeyRing::generate();
    let err = keys.retire(1).unwrap_err();
    assert!(matches!(err, CredentialError::KeyRing(_)));

    keys.rotate();
    assert!(matches!(keys.retire(7), Err(CredentialError::UnknownKeyVersion(7))));
}

#[tokio::test]
async fn test_unreadable_credentials_require_reconnect() {
    let mut deployment = Deployment::new().await;
    let (_first, account_id) = connected(&mut deployment, KeyRing::generate()).await;

    // a process holding an unrelated key cannot open the row
    let service = deployment.start(KeyRing::generate());
    let outcome = deployment.publish(&service).await;
    assert_eq!(outcome.status, PostStatus::Failed);
    assert!(matches!(outcome.failed[0].error, PublishFailure::Credential(_)));
    assert_eq!(deployment.twitter.publish_calls(), 0);

    let account = service.accounts().get(account_id, deployment.owner).await.unwrap();
    assert_eq!(account.status(), AccountStatus::ReconnectRequired);
}

#[tokio::test]
async fn test_missing_key_version_requires_reconnect() {
    let mut deployment = Deployment::new().await;
    let original = KeyRing::generate().to_toml().unwrap();
    let mut rotated = KeyRing::parse(&original).unwrap();
    rotated.rotate();
    let (_first, account_id) = connected(&mut deployment, rotated).await;

    // the row is on version 2 but this process only knows version 1
    let service = deployment.start(KeyRing::parse(&original).unwrap());
    let err = service.vault().get(account_id).await.unwrap_err();
    assert!(err.to_string().contains("unknown key version 2"));

    let outcome = deployment.publish(&service).await;
    assert_eq!(outcome.status, PostStatus::Failed);
    let account = service.accounts().get(account_id, deployment.owner).await.unwrap();
    assert_eq!(account.status(), AccountStatus::ReconnectRequired);
}
