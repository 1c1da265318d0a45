//! Connected social accounts
//!
//! An [`Account`] is one social identity connected to a team. Its OAuth
//! [`Credentials`] live in the credential vault under the account id and are
//! only decrypted for the duration of a single call. Status changes go through
//! the transition methods here; nothing else assigns `status` directly.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;
use crate::platforms::Pkce;
use crate::types::{AccountType, Platform, ProfileInfo};

/// An OAuth token held in memory
///
/// Debug output is redacted and the buffer is zeroed on drop.
pub struct Token(SecretString);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for Token {
    fn clone(&self) -> Self {
        Self::new(self.expose().to_owned())
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token([REDACTED])")
    }
}

/// OAuth credentials of one connected account
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_token: Token,
    pub refresh_token: Option<Token>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub platform_user_id: String,
}

impl Credentials {
    pub fn new(access_token: impl Into<String>, platform_user_id: impl Into<String>) -> Self {
        Self {
            access_token: Token::new(access_token),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
            platform_user_id: platform_user_id.into(),
        }
    }

    pub fn with_refresh_token(mut self, token: impl Into<String>) -> Self {
        self.refresh_token = Some(Token::new(token));
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// True when the token expires within `window` of `now`.
    /// Tokens without an expiry never do.
    pub fn expires_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now <= window,
            None => false,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_within(Duration::zero(), now)
    }

    /// Fill in what a refresh response may omit from the credentials it replaces
    pub fn carry_forward(mut self, previous: &Credentials) -> Credentials {
        if self.refresh_token.is_none() {
            self.refresh_token = previous.refresh_token.clone();
        }
        if self.scopes.is_empty() {
            self.scopes = previous.scopes.clone();
        }
        if self.platform_user_id.is_empty() {
            self.platform_user_id = previous.platform_user_id.clone();
        }
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    Expired,
    Revoked,
    RateLimited,
    ReconnectRequired,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Active => "active",
            AccountStatus::Expired => "expired",
            AccountStatus::Revoked => "revoked",
            AccountStatus::RateLimited => "rate_limited",
            AccountStatus::ReconnectRequired => "reconnect_required",
        }
    }

    /// Statuses the publisher will still attempt to use. Expired accounts get a
    /// refresh attempt first.
    pub fn can_publish(&self) -> bool {
        matches!(
            self,
            AccountStatus::Active | AccountStatus::RateLimited | AccountStatus::Expired
        )
    }

    /// Statuses in which connecting the same identity again re-authorizes the
    /// existing account instead of being rejected as a duplicate
    pub fn awaits_reconnect(&self) -> bool {
        matches!(
            self,
            AccountStatus::Expired | AccountStatus::Revoked | AccountStatus::ReconnectRequired
        )
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AccountStatus {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(AccountStatus::Pending),
            "active" => Ok(AccountStatus::Active),
            "expired" => Ok(AccountStatus::Expired),
            "revoked" => Ok(AccountStatus::Revoked),
            "rate_limited" => Ok(AccountStatus::RateLimited),
            "reconnect_required" => Ok(AccountStatus::ReconnectRequired),
            other => Err(ValidationError::Invalid(format!("unknown account status: {other}"))),
        }
    }
}

/// An authorization URL handed out and not yet completed
///
/// Binds the OAuth `state` to the team, user and platform it was issued for
/// and keeps the PKCE verifier until the code comes back.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    pub state: String,
    pub team_id: Uuid,
    pub user_id: Uuid,
    pub platform: Platform,
    pub pkce: Pkce,
    pub created_at: DateTime<Utc>,
}

impl PendingAuthorization {
    /// How long a user has to complete the platform's consent screen
    pub const TTL_MINUTES: i64 = 10;

    pub fn new(team_id: Uuid, user_id: Uuid, platform: Platform, now: DateTime<Utc>) -> Self {
        Self {
            state: Uuid::new_v4().simple().to_string(),
            team_id,
            user_id,
            platform,
            pkce: Pkce::generate(),
            created_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now - self.created_at >= Duration::minutes(Self::TTL_MINUTES)
    }

    /// Whether the callback comes from the same user, team and platform
    pub fn matches(&self, team_id: Uuid, user_id: Uuid, platform: Platform) -> bool {
        self.team_id == team_id && self.user_id == user_id && self.platform == platform
    }
}

/// Soft-delete marker. Disconnected accounts keep their row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tombstone {
    #[default]
    Live,
    Tombstoned { at: DateTime<Utc> },
}

impl Tombstone {
    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Tombstone::Live => None,
            Tombstone::Tombstoned { at } => Some(*at),
        }
    }

    pub fn from_deleted_at(deleted_at: Option<DateTime<Utc>>) -> Self {
        match deleted_at {
            Some(at) => Tombstone::Tombstoned { at },
            None => Tombstone::Live,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: Uuid,
    pub team_id: Uuid,
    pub connected_by: Uuid,
    pub platform: Platform,
    pub platform_user_id: String,
    pub account_type: AccountType,
    pub profile: ProfileInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    status: AccountStatus,
    tombstone: Tombstone,
}

impl Account {
    /// A freshly authorized account awaiting validation
    pub fn pending(
        team_id: Uuid,
        connected_by: Uuid,
        platform: Platform,
        platform_user_id: impl Into<String>,
        profile: ProfileInfo,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            team_id,
            connected_by,
            platform,
            platform_user_id: platform_user_id.into(),
            account_type: profile.account_type,
            profile,
            created_at: now,
            updated_at: now,
            status: AccountStatus::Pending,
            tombstone: Tombstone::Live,
        }
    }

    /// Rebuild an account from storage
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        id: Uuid,
        team_id: Uuid,
        connected_by: Uuid,
        platform: Platform,
        platform_user_id: String,
        account_type: AccountType,
        profile: ProfileInfo,
        status: AccountStatus,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        tombstone: Tombstone,
    ) -> Self {
        Self {
            id,
            team_id,
            connected_by,
            platform,
            platform_user_id,
            account_type,
            profile,
            created_at,
            updated_at,
            status,
            tombstone,
        }
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn tombstone(&self) -> Tombstone {
        self.tombstone
    }

    pub fn is_live(&self) -> bool {
        self.tombstone == Tombstone::Live
    }

    /// Pending, Expired or RateLimited → Active
    pub fn activate(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition(
            "activate",
            &[
                AccountStatus::Pending,
                AccountStatus::Active,
                AccountStatus::Expired,
                AccountStatus::RateLimited,
            ],
            AccountStatus::Active,
            now,
        )
    }

    /// A fresh authorization for an account that needed one
    pub fn reauthorize(
        &mut self,
        profile: ProfileInfo,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.transition(
            "reauthorize",
            &[
                AccountStatus::Expired,
                AccountStatus::Revoked,
                AccountStatus::ReconnectRequired,
            ],
            AccountStatus::Active,
            now,
        )?;
        self.account_type = profile.account_type;
        self.profile = profile;
        Ok(())
    }

    pub fn mark_expired(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition(
            "expire",
            &[
                AccountStatus::Active,
                AccountStatus::Expired,
                AccountStatus::RateLimited,
            ],
            AccountStatus::Expired,
            now,
        )
    }

    pub fn mark_rate_limited(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition(
            "rate-limit",
            &[AccountStatus::Active, AccountStatus::RateLimited],
            AccountStatus::RateLimited,
            now,
        )
    }

    pub fn require_reconnect(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition(
            "require reconnection for",
            &[
                AccountStatus::Active,
                AccountStatus::Expired,
                AccountStatus::RateLimited,
                AccountStatus::Revoked,
                AccountStatus::ReconnectRequired,
            ],
            AccountStatus::ReconnectRequired,
            now,
        )
    }

    /// The platform told us the user withdrew access
    pub fn revoke(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.transition(
            "revoke",
            &[
                AccountStatus::Pending,
                AccountStatus::Active,
                AccountStatus::Expired,
                AccountStatus::Revoked,
                AccountStatus::RateLimited,
                AccountStatus::ReconnectRequired,
            ],
            AccountStatus::Revoked,
            now,
        )
    }

    /// Soft delete. Terminal.
    pub fn disconnect(&mut self, now: DateTime<Utc>) -> Result<(), ValidationError> {
        self.ensure_live("disconnect")?;
        self.tombstone = Tombstone::Tombstoned { at: now };
        self.updated_at = now;
        Ok(())
    }

    fn ensure_live(&self, action: &'static str) -> Result<(), ValidationError> {
        match self.tombstone {
            Tombstone::Live => Ok(()),
            Tombstone::Tombstoned { .. } => Err(ValidationError::InvalidTransition {
                entity: "account",
                from: "disconnected".to_string(),
                action,
            }),
        }
    }

    fn transition(
        &mut self,
        action: &'static str,
        allowed_from: &[AccountStatus],
        to: AccountStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ValidationError> {
        self.ensure_live(action)?;
        if !allowed_from.contains(&self.status) {
            return Err(ValidationError::InvalidTransition {
                entity: "account",
                from: self.status.to_string(),
                action,
            });
        }
        if self.status != to {
            self.status = to;
            self.updated_at = now;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> Account {
        Account::pending(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Platform::Twitter,
            "12345",
            ProfileInfo {
                username: "teamcast".to_string(),
                ..Default::default()
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_token_debug_is_redacted() {
        let creds = Credentials::new("super-secret-access", "42")
            .with_refresh_token("super-secret-refresh");
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("super-secret"), "token leaked: {}", debug);
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_expires_within() {
        let now = Utc::now();
        let creds = Credentials::new("t", "1").with_expiry(now + Duration::hours(25));
        assert!(!creds.expires_within(Duration::hours(24), now));
        assert!(creds.expires_within(Duration::hours(26), now));
        assert!(!creds.is_expired(now));

        let forever = Credentials::new("t", "1");
        assert!(!forever.expires_within(Duration::days(365), now));
    }

    #[test]
    fn test_carry_forward_keeps_refresh_token() {
        let previous = Credentials::new("old", "99")
            .with_refresh_token("refresh-1")
            .with_scopes(["tweet.write"]);
        let refreshed = Credentials::new("new", "").carry_forward(&previous);
        assert_eq!(refreshed.access_token.expose(), "new");
        assert_eq!(refreshed.refresh_token.unwrap().expose(), "refresh-1");
        assert_eq!(refreshed.scopes, vec!["tweet.write".to_string()]);
        assert_eq!(refreshed.platform_user_id, "99");
    }

    #[test]
    fn test_lifecycle_happy_path() {
        let now = Utc::now();
        let mut account = account();
        assert_eq!(account.status(), AccountStatus::Pending);
        account.activate(now).unwrap();
        account.mark_expired(now).unwrap();
        account.activate(now).unwrap();
        account.mark_rate_limited(now).unwrap();
        account.require_reconnect(now).unwrap();
        assert_eq!(account.status(), AccountStatus::ReconnectRequired);
        account.reauthorize(ProfileInfo::default(), now).unwrap();
        assert_eq!(account.status(), AccountStatus::Active);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let now = Utc::now();
        let mut account = account();
        assert!(account.mark_expired(now).is_err());
        assert!(account.require_reconnect(now).is_err());

        account.activate(now).unwrap();
        account.revoke(now).unwrap();
        let err = account.activate(now).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidTransition { entity: "account", .. }));
    }

    #[test]
    fn test_disconnect_is_terminal() {
        let now = Utc::now();
        let mut account = account();
        account.activate(now).unwrap();
        account.disconnect(now).unwrap();
        assert!(!account.is_live());
        assert_eq!(account.tombstone().deleted_at(), Some(now));
        assert!(account.disconnect(now).is_err());
        assert!(account.activate(now).is_err());
    }

    #[test]
    fn test_pending_authorization_expiry_and_binding() {
        let now = Utc::now();
        let (team, user) = (Uuid::new_v4(), Uuid::new_v4());
        let authorization = PendingAuthorization::new(team, user, Platform::Twitter, now);
        assert!(!authorization.is_expired(now + Duration::minutes(9)));
        assert!(authorization.is_expired(now + Duration::minutes(10)));

        assert!(authorization.matches(team, user, Platform::Twitter));
        assert!(!authorization.matches(team, user, Platform::Facebook));
        assert!(!authorization.matches(team, Uuid::new_v4(), Platform::Twitter));
        assert_ne!(
            authorization.state,
            PendingAuthorization::new(team, user, Platform::Twitter, now).state
        );
    }
}
