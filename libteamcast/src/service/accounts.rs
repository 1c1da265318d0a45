//! Social account lifecycle
//!
//! Connecting starts with an authorization URL bound to a fresh OAuth state
//! and PKCE verifier. The callback's code is traded for credentials with that
//! verifier, checked against the platform and stored in the vault. Connecting an identity the team
//! already holds is rejected, unless that account is waiting for the user to
//! reconnect, in which case it is re-authorized in place.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ServiceContext;
use crate::accounts::{Account, AccountStatus, Credentials, PendingAuthorization};
use crate::error::{CredentialError, Result, TeamcastError, ValidationError};
use crate::outbox::TaskKind;
use crate::permissions::{permits, Capability, Role};
use crate::platforms::with_timeout;
use crate::types::{Platform, ProfileInfo};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    /// Authorization code from the OAuth callback
    pub code: String,
    /// `state` echoed by the OAuth callback
    pub state: String,
}

/// Where to send the user, and the state their callback will carry
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
}

#[derive(Clone)]
pub struct AccountService {
    context: Arc<ServiceContext>,
}

impl AccountService {
    pub(crate) fn new(context: Arc<ServiceContext>) -> Self {
        Self { context }
    }

    /// Start connecting an account. `scopes` falls back to the adapter's
    /// defaults. The returned state must come back with the code within
    /// [`PendingAuthorization::TTL_MINUTES`].
    pub async fn authorization_url(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        platform: Platform,
        scopes: Option<Vec<String>>,
    ) -> Result<AuthorizationRequest> {
        self.context
            .authorize(team_id, user_id, Capability::ManageAccounts, None)
            .await?;
        let adapter = self.context.adapter(platform)?;
        let scopes = scopes.unwrap_or_else(|| adapter.default_scopes());

        let authorization = PendingAuthorization::new(team_id, user_id, platform, Utc::now());
        let url = adapter.authorization_url(&authorization.state, &scopes, &authorization.pkce)?;
        self.context
            .repos
            .authorizations
            .insert_authorization(&authorization)
            .await?;

        debug!(%team_id, %user_id, %platform, "authorization started");
        Ok(AuthorizationRequest {
            url,
            state: authorization.state,
        })
    }

    /// Consume the authorization behind `state`. Single use, and only for
    /// the user, team and platform it was issued to.
    async fn take_authorization(
        &self,
        state: &str,
        team_id: Uuid,
        user_id: Uuid,
        platform: Platform,
    ) -> Result<PendingAuthorization> {
        let authorization = self
            .context
            .repos
            .authorizations
            .take_authorization(state)
            .await?
            .filter(|a| a.matches(team_id, user_id, platform))
            .ok_or_else(|| {
                ValidationError::Invalid("unknown or already used authorization state".to_string())
            })?;
        if authorization.is_expired(Utc::now()) {
            let reason = "authorization expired; start connecting again".to_string();
            return Err(ValidationError::Invalid(reason).into());
        }
        Ok(authorization)
    }

    pub async fn connect(&self, request: ConnectRequest) -> Result<Account> {
        let ConnectRequest {
            team_id,
            user_id,
            platform,
            code,
            state,
        } = request;
        self.context
            .authorize(team_id, user_id, Capability::ManageAccounts, None)
            .await?;
        let authorization = self.take_authorization(&state, team_id, user_id, platform).await?;

        let adapter = self.context.adapter(platform)?;
        let timeout = self.context.adapter_timeout();

        let credentials =
            with_timeout(timeout, adapter.exchange_code(&code, &authorization.pkce)).await?;
        if !with_timeout(timeout, adapter.validate_credentials(&credentials)).await? {
            return Err(CredentialError::InvalidToken(format!(
                "{platform} rejected the credentials it just issued"
            ))
            .into());
        }
        if credentials.platform_user_id.is_empty() {
            let reason = format!("{platform} did not identify the account");
            return Err(CredentialError::InvalidToken(reason).into());
        }
        let profile = with_timeout(timeout, adapter.fetch_profile(&credentials)).await?;

        let existing = self
            .context
            .repos
            .accounts
            .find_live_by_identity(team_id, platform, &credentials.platform_user_id)
            .await?;

        match existing {
            // a connect that died between insert and activation left this row behind
            Some(account) if account.status() == AccountStatus::Pending => {
                self.finish_pending(account, &credentials, profile).await
            }
            Some(account) if account.status().awaits_reconnect() => {
                self.reconnect(account, &credentials, profile).await
            }
            Some(account) => Err(TeamcastError::Duplicate(format!(
                "{platform} account {} is already connected to this team as {}",
                credentials.platform_user_id, account.id
            ))),
            None => self.create(team_id, user_id, platform, &credentials, profile).await,
        }
    }

    async fn create(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        platform: Platform,
        credentials: &Credentials,
        profile: ProfileInfo,
    ) -> Result<Account> {
        let now = Utc::now();
        let mut account = Account::pending(
            team_id,
            user_id,
            platform,
            credentials.platform_user_id.clone(),
            profile,
            now,
        );

        // the unique index turns a concurrent connect of the same identity into Duplicate
        self.context.repos.accounts.insert_account(&account).await?;
        if let Err(e) = self.store_and_activate(&mut account, credentials, now).await {
            self.discard_pending(account).await;
            return Err(e);
        }

        info!(
            account_id = %account.id,
            %team_id,
            platform = %account.platform,
            username = %account.profile.username,
            "account connected"
        );
        Ok(account)
    }

    async fn store_and_activate(
        &self,
        account: &mut Account,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.context.vault.save(account.id, credentials, now).await?;
        account.activate(now)?;
        self.context.repos.accounts.update_account(account).await?;
        Ok(())
    }

    /// Tombstone a half-connected account so the identity can be connected again
    async fn discard_pending(&self, mut account: Account) {
        let now = Utc::now();
        if let Err(e) = self.context.vault.delete(account.id).await {
            warn!(
                account_id = %account.id,
                error = %e,
                "failed to remove tokens of abandoned connect"
            );
        }
        let discarded = match account.disconnect(now) {
            Ok(()) => self.context.repos.accounts.update_account(&account).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = discarded {
            warn!(account_id = %account.id, error = %e, "failed to discard pending account");
        }
    }

    async fn finish_pending(
        &self,
        mut account: Account,
        credentials: &Credentials,
        profile: ProfileInfo,
    ) -> Result<Account> {
        let now = Utc::now();
        account.account_type = profile.account_type;
        account.profile = profile;
        self.store_and_activate(&mut account, credentials, now).await?;

        info!(account_id = %account.id, platform = %account.platform, "pending account connected");
        Ok(account)
    }

    async fn reconnect(
        &self,
        mut account: Account,
        credentials: &Credentials,
        profile: ProfileInfo,
    ) -> Result<Account> {
        let now = Utc::now();
        let from = account.status();
        self.context.vault.save(account.id, credentials, now).await?;
        account.reauthorize(profile, now)?;
        self.context.repos.accounts.update_account(&account).await?;
        self.context.throttle.reset(account.id).await?;

        info!(account_id = %account.id, platform = %account.platform, %from, "account reconnected");
        Ok(account)
    }

    /// Refresh an account's token if it expires within the configured threshold
    pub async fn refresh_tokens(&self, account_id: Uuid) -> Result<Credentials> {
        self.context
            .refresher
            .refresh_if_expiring(account_id, self.context.config.publishing.refresh_threshold())
            .await
    }

    /// Soft-delete an account and drop its credentials
    ///
    /// Allowed for owners and admins, and for the member who connected the
    /// account while they are still an active editor.
    pub async fn disconnect(&self, account_id: Uuid, user_id: Uuid) -> Result<()> {
        let mut account = self.live(account_id).await?;
        let member = self.context.repos.members.get_member(account.team_id, user_id).await?;

        let allowed = member.as_ref().is_some_and(|m| {
            permits(m.role, m.status, Capability::ManageAccounts, false)
                || (m.user_id == account.connected_by && m.is_active() && m.role != Role::Viewer)
        });
        if !allowed {
            return Err(TeamcastError::Authorization(format!(
                "user {user_id} cannot disconnect account {account_id}"
            )));
        }

        let now = Utc::now();
        account.disconnect(now)?;
        self.context.repos.accounts.update_account(&account).await?;
        self.context.vault.delete(account_id).await?;
        self.context.throttle.reset(account_id).await?;

        info!(
            %account_id,
            platform = %account.platform,
            disconnected_by = %user_id,
            "account disconnected"
        );
        Ok(())
    }

    /// Apply a platform's deauthorization callback
    ///
    /// Delivery is at-least-once; an `event_id` seen before is ignored.
    /// Returns how many accounts were revoked.
    pub async fn handle_revocation(
        &self,
        platform: Platform,
        platform_user_id: &str,
        event_id: &str,
        payload: &str,
    ) -> Result<usize> {
        let now = Utc::now();
        let first_delivery = self
            .context
            .repos
            .webhooks
            .record_webhook_event(platform, event_id, payload, now)
            .await?;
        if !first_delivery {
            info!(%platform, event_id, "duplicate revocation event ignored");
            return Ok(0);
        }

        let accounts = self
            .context
            .repos
            .accounts
            .find_live_by_platform_user(platform, platform_user_id)
            .await?;

        let mut revoked = 0;
        for mut account in accounts {
            if let Err(e) = account.revoke(now) {
                warn!(account_id = %account.id, error = %e, "could not revoke account");
                continue;
            }
            self.context.repos.accounts.update_account(&account).await?;
            self.context
                .outbox
                .submit(
                    TaskKind::AccountRevoked,
                    json!({
                        "account_id": account.id,
                        "team_id": account.team_id,
                        "platform": platform,
                        "event_id": event_id,
                    }),
                    now,
                )
                .await;
            info!(account_id = %account.id, %platform, event_id, "account revoked by platform");
            revoked += 1;
        }
        Ok(revoked)
    }

    pub async fn get(&self, account_id: Uuid, user_id: Uuid) -> Result<Account> {
        let account = self.live(account_id).await?;
        self.context
            .authorize(account.team_id, user_id, Capability::ViewPosts, None)
            .await?;
        Ok(account)
    }

    /// Live accounts of a team, oldest first
    pub async fn list(
        &self,
        team_id: Uuid,
        user_id: Uuid,
        platform: Option<Platform>,
    ) -> Result<Vec<Account>> {
        self.context
            .authorize(team_id, user_id, Capability::ViewPosts, None)
            .await?;
        self.context.repos.accounts.list_live_accounts(team_id, platform).await
    }

    async fn live(&self, account_id: Uuid) -> Result<Account> {
        match self.context.repos.accounts.get_account(account_id).await? {
            Some(account) if account.is_live() => Ok(account),
            _ => Err(TeamcastError::NotFound(format!("account {account_id}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::credentials::KeyRing;
    use crate::db::test_support::setup_test_db;
    use crate::error::DbError;
    use crate::platforms::mock::MockAdapter;
    use crate::platforms::{AdapterRegistry, Pkce};
    use crate::repository::{EncryptedCredentials, Repositories, TokenRepository};
    use crate::service::test_support::{fast_config, harness, Harness};
    use crate::service::TeamcastService;

    async fn connect(h: &Harness, platform: Platform, user_id: Uuid) -> Result<Account> {
        h.connect_as(platform, user_id).await
    }

    #[tokio::test]
    async fn test_connect_stores_credentials_and_activates() {
        let h = harness().await;
        let account = connect(&h, Platform::Twitter, h.owner).await.unwrap();

        assert_eq!(account.status(), AccountStatus::Active);
        assert_eq!(account.platform_user_id, "twitter-user-1");
        assert_eq!(account.profile.username, "mock_twitter");

        let credentials = h.service.vault().get(account.id).await.unwrap();
        assert_eq!(credentials.access_token.expose(), "twitter-access-1");
        assert_eq!(credentials.platform_user_id, "twitter-user-1");
        assert_eq!(h.twitter.validate_calls(), 1);
    }

    #[tokio::test]
    async fn test_connecting_same_identity_twice_is_duplicate() {
        let h = harness().await;
        connect(&h, Platform::Twitter, h.owner).await.unwrap();
        let err = connect(&h, Platform::Twitter, h.owner).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Duplicate(_)));

        let accounts = h.service.accounts().list(h.team_id, h.owner, None).await.unwrap();
        assert_eq!(accounts.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_create_nothing() {
        let h = harness().await;
        h.twitter.push_validate(Ok(false));
        let err = connect(&h, Platform::Twitter, h.owner).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Credential(CredentialError::InvalidToken(_))));

        let accounts = h.service.accounts().list(h.team_id, h.owner, None).await.unwrap();
        assert!(accounts.is_empty());
    }

    #[tokio::test]
    async fn test_editor_cannot_connect() {
        let h = harness().await;
        let editor = h.member(Role::Editor).await;
        let err = connect(&h, Platform::Twitter, editor).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Authorization(_)));
        assert_eq!(h.twitter.exchange_calls(), 0);
    }

    #[tokio::test]
    async fn test_revoked_account_is_reconnected_in_place() {
        let h = harness().await;
        let account = connect(&h, Platform::Twitter, h.owner).await.unwrap();

        let revoked = h
            .service
            .accounts()
            .handle_revocation(Platform::Twitter, "twitter-user-1", "evt-1", "{}")
            .await
            .unwrap();
        assert_eq!(revoked, 1);

        let again = connect(&h, Platform::Twitter, h.owner).await.unwrap();
        assert_eq!(again.id, account.id);
        assert_eq!(again.status(), AccountStatus::Active);
        let credentials = h.service.vault().get(account.id).await.unwrap();
        assert_eq!(credentials.access_token.expose(), "twitter-access-2");
    }

    #[tokio::test]
    async fn test_revocation_events_are_deduplicated() {
        let h = harness().await;
        let account = connect(&h, Platform::Facebook, h.owner).await.unwrap();
        let accounts = h.service.accounts();

        assert_eq!(
            accounts
                .handle_revocation(Platform::Facebook, "facebook-user-1", "evt-9", "{}")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            accounts
                .handle_revocation(Platform::Facebook, "facebook-user-1", "evt-9", "{}")
                .await
                .unwrap(),
            0
        );

        let stored = accounts.get(account.id, h.owner).await.unwrap();
        assert_eq!(stored.status(), AccountStatus::Revoked);

        let tasks = h
            .service
            .context
            .repos
            .outbox
            .due_tasks(Utc::now(), 10)
            .await
            .unwrap();
        let revocations: Vec<_> = tasks
            .iter()
            .filter(|t| t.kind == TaskKind::AccountRevoked)
            .collect();
        assert_eq!(revocations.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_permissions() {
        let h = harness().await;
        let admin = h.member(Role::Admin).await;
        let viewer = h.member(Role::Viewer).await;
        let account = connect(&h, Platform::Twitter, admin).await.unwrap();

        let err = h.service.accounts().disconnect(account.id, viewer).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Authorization(_)));
        let unchanged = h.service.accounts().get(account.id, viewer).await.unwrap();
        assert_eq!(unchanged.status(), AccountStatus::Active);

        h.service.accounts().disconnect(account.id, admin).await.unwrap();
        let err = h.service.accounts().get(account.id, admin).await.unwrap_err();
        assert!(matches!(err, TeamcastError::NotFound(_)));
        let err = h.service.vault().get(account.id).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Credential(CredentialError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_connecting_editor_may_disconnect_own_account() {
        let h = harness().await;
        let editor = h.member(Role::Editor).await;
        let account = connect(&h, Platform::Twitter, h.owner).await.unwrap();

        // not theirs
        let err = h.service.accounts().disconnect(account.id, editor).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Authorization(_)));

        // an admin who connected an account and was later demoted still owns it
        let admin = h.member(Role::Admin).await;
        let own = connect(&h, Platform::Facebook, admin).await.unwrap();
        h.service
            .members()
            .change_role(h.team_id, h.owner, admin, Role::Editor)
            .await
            .unwrap();
        h.service.accounts().disconnect(own.id, admin).await.unwrap();
    }

    /// Token store whose first write fails
    struct FlakyTokens {
        inner: Arc<dyn TokenRepository>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl TokenRepository for FlakyTokens {
        async fn upsert_tokens(&self, row: &EncryptedCredentials) -> Result<()> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(DbError::IoError(std::io::Error::other("disk full")).into());
            }
            self.inner.upsert_tokens(row).await
        }
        async fn get_tokens(&self, account_id: Uuid) -> Result<Option<EncryptedCredentials>> {
            self.inner.get_tokens(account_id).await
        }
        async fn delete_tokens(&self, account_id: Uuid) -> Result<bool> {
            self.inner.delete_tokens(account_id).await
        }
        async fn accounts_with_key_version_below(&self, version: u32) -> Result<Vec<Uuid>> {
            self.inner.accounts_with_key_version_below(version).await
        }
    }

    fn code_challenge(url: &str) -> String {
        url.split("code_challenge=").nth(1).unwrap().to_string()
    }

    #[tokio::test]
    async fn test_each_authorization_has_its_own_verifier() {
        let h = harness().await;
        let accounts = h.service.accounts();
        let first = accounts
            .authorization_url(h.team_id, h.owner, Platform::Twitter, None)
            .await
            .unwrap();
        let second = accounts
            .authorization_url(h.team_id, h.owner, Platform::Twitter, None)
            .await
            .unwrap();
        assert_ne!(first.state, second.state);
        assert_ne!(code_challenge(&first.url), code_challenge(&second.url));

        accounts
            .connect(ConnectRequest {
                team_id: h.team_id,
                user_id: h.owner,
                platform: Platform::Twitter,
                code: "auth-code".to_string(),
                state: second.state.clone(),
            })
            .await
            .unwrap();

        // the exchange carries the verifier behind the second URL's challenge
        let verifiers = h.twitter.exchange_verifiers();
        assert_eq!(verifiers.len(), 1);
        assert_eq!(Pkce::from_verifier(&verifiers[0]).challenge(), code_challenge(&second.url));
    }

    #[tokio::test]
    async fn test_state_is_single_use_and_bound_to_its_user() {
        let h = harness().await;
        let admin = h.member(Role::Admin).await;
        let accounts = h.service.accounts();
        let request = |user_id: Uuid, state: &str| ConnectRequest {
            team_id: h.team_id,
            user_id,
            platform: Platform::Twitter,
            code: "auth-code".to_string(),
            state: state.to_string(),
        };

        let err = accounts.connect(request(h.owner, "made-up")).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Validation(_)));

        // issued to the owner, presented by someone else
        let issued = accounts
            .authorization_url(h.team_id, h.owner, Platform::Twitter, None)
            .await
            .unwrap();
        let err = accounts.connect(request(admin, &issued.state)).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Validation(_)));
        // and the mismatch burned it
        let err = accounts.connect(request(h.owner, &issued.state)).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Validation(_)));

        let issued = accounts
            .authorization_url(h.team_id, h.owner, Platform::Twitter, None)
            .await
            .unwrap();
        accounts.connect(request(h.owner, &issued.state)).await.unwrap();
        let err = accounts.connect(request(h.owner, &issued.state)).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Validation(_)));

        assert_eq!(h.twitter.exchange_calls(), 1);
    }

    #[tokio::test]
    async fn test_expired_authorization_is_rejected() {
        let h = harness().await;
        let ttl = chrono::Duration::minutes(PendingAuthorization::TTL_MINUTES);
        let issued_at = Utc::now() - ttl - chrono::Duration::minutes(1);
        let stale = PendingAuthorization::new(h.team_id, h.owner, Platform::Twitter, issued_at);
        h.service
            .context
            .repos
            .authorizations
            .insert_authorization(&stale)
            .await
            .unwrap();

        let err = h
            .service
            .accounts()
            .connect(ConnectRequest {
                team_id: h.team_id,
                user_id: h.owner,
                platform: Platform::Twitter,
                code: "auth-code".to_string(),
                state: stale.state.clone(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("expired"));
        assert_eq!(h.twitter.exchange_calls(), 0);
    }

    async fn connect_owner(
        service: &TeamcastService,
        team_id: Uuid,
        owner: Uuid,
    ) -> Result<Account> {
        let authorization = service
            .accounts()
            .authorization_url(team_id, owner, Platform::Twitter, None)
            .await?;
        service
            .accounts()
            .connect(ConnectRequest {
                team_id,
                user_id: owner,
                platform: Platform::Twitter,
                code: "auth-code".to_string(),
                state: authorization.state,
            })
            .await
    }

    #[tokio::test]
    async fn test_failed_vault_write_does_not_block_a_second_connect() {
        let (_temp_dir, db) = setup_test_db().await;
        let mut repos = Repositories::sqlite(db);
        repos.tokens = Arc::new(FlakyTokens {
            inner: repos.tokens.clone(),
            failed: AtomicBool::new(false),
        });
        let registry = AdapterRegistry::builder()
            .register(Arc::new(MockAdapter::new(Platform::Twitter)))
            .build();
        let keys = KeyRing::generate();
        let service = TeamcastService::with_parts(fast_config(), repos.clone(), keys, registry);
        let owner = Uuid::new_v4();
        let team = service.members().create_team(owner).await.unwrap();
        let err = connect_owner(&service, team.team_id, owner).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Database(_)));
        let left = repos
            .accounts
            .find_live_by_identity(team.team_id, Platform::Twitter, "twitter-user-1")
            .await
            .unwrap();
        assert!(left.is_none());

        let account = connect_owner(&service, team.team_id, owner).await.unwrap();
        assert_eq!(account.status(), AccountStatus::Active);
        assert!(service.vault().get(account.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_pending_account_is_taken_over_by_next_connect() {
        let h = harness().await;
        // the row an interrupted connect leaves behind
        let orphan = Account::pending(
            h.team_id,
            h.owner,
            Platform::Twitter,
            "twitter-user-1",
            ProfileInfo::default(),
            Utc::now(),
        );
        h.service.context.repos.accounts.insert_account(&orphan).await.unwrap();

        let account = connect(&h, Platform::Twitter, h.owner).await.unwrap();
        assert_eq!(account.id, orphan.id);
        assert_eq!(account.status(), AccountStatus::Active);
        assert_eq!(account.profile.username, "mock_twitter");
        assert!(h.service.vault().get(account.id).await.is_ok());

        let err = connect(&h, Platform::Twitter, h.owner).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_refresh_tokens_within_threshold() {
        let h = harness().await;
        let account = connect(&h, Platform::Twitter, h.owner).await.unwrap();

        // mock tokens live two hours, well inside the 24h threshold
        let refreshed = h.service.accounts().refresh_tokens(account.id).await.unwrap();
        assert_eq!(refreshed.access_token.expose(), "twitter-refreshed-1");
        assert_eq!(refreshed.refresh_token.as_ref().unwrap().expose(), "twitter-refresh-1");
        assert_eq!(h.twitter.refresh_calls(), 1);
    }
}
