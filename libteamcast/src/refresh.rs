//! Token refresh and credential-driven account transitions
//!
//! Refresh for one account is single-flighted: callers take a per-account
//! async mutex and re-read the vault after acquiring it, so a refresh that
//! finished while they waited is reused instead of spending the refresh token
//! a second time.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::accounts::{Account, AccountStatus, Credentials};
use crate::credentials::CredentialVault;
use crate::error::{Result, TeamcastError, ValidationError};
use crate::outbox::{Outbox, TaskKind};
use crate::platforms::{with_timeout, AdapterRegistry};
use crate::repository::AccountRepository;

type AccountLock = Arc<tokio::sync::Mutex<()>>;

pub struct TokenRefresher {
    accounts: Arc<dyn AccountRepository>,
    vault: CredentialVault,
    registry: AdapterRegistry,
    outbox: Outbox,
    timeout: Duration,
    locks: Mutex<HashMap<Uuid, AccountLock>>,
}

impl TokenRefresher {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        vault: CredentialVault,
        registry: AdapterRegistry,
        outbox: Outbox,
        timeout: Duration,
    ) -> Self {
        Self {
            accounts,
            vault,
            registry,
            outbox,
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Decrypt an account's credentials. Unreadable credentials move the
    /// account to `ReconnectRequired` before the error is returned.
    pub async fn credentials(&self, account_id: Uuid) -> Result<Credentials> {
        match self.vault.get(account_id).await {
            Ok(credentials) => Ok(credentials),
            Err(TeamcastError::Credential(e)) => {
                let mut account = self.live_account(account_id).await?;
                self.require_reconnect(&mut account, &e.to_string(), Utc::now()).await?;
                Err(e.into())
            }
            Err(e) => Err(e),
        }
    }

    /// Refresh unless the token stays valid for longer than `window`.
    /// Tokens without an expiry are returned unchanged.
    pub async fn refresh_if_expiring(
        &self,
        account_id: Uuid,
        window: chrono::Duration,
    ) -> Result<Credentials> {
        let credentials = self.credentials(account_id).await?;
        if !credentials.expires_within(window, Utc::now()) {
            return Ok(credentials);
        }

        let lock = self.lock_for(account_id);
        let result: Result<Credentials> = async {
            let _guard = lock.lock().await;
            // someone may have refreshed while we waited
            let current = self.credentials(account_id).await?;
            if current.expires_within(window, Utc::now()) {
                self.refresh_locked(account_id, &current).await
            } else {
                debug!(%account_id, "credentials refreshed by a concurrent caller");
                Ok(current)
            }
        }
        .await;
        self.release(account_id, lock);
        result
    }

    /// Refresh after the platform rejected `stale` as expired. If the vault
    /// already holds a different token, that one is returned instead.
    pub async fn force_refresh(
        &self,
        account_id: Uuid,
        stale: &Credentials,
    ) -> Result<Credentials> {
        let lock = self.lock_for(account_id);
        let result: Result<Credentials> = async {
            let _guard = lock.lock().await;
            let current = self.credentials(account_id).await?;
            if current.access_token.expose() != stale.access_token.expose() {
                debug!(%account_id, "token already replaced by a concurrent refresh");
                Ok(current)
            } else {
                self.refresh_locked(account_id, &current).await
            }
        }
        .await;
        self.release(account_id, lock);
        result
    }

    async fn refresh_locked(&self, account_id: Uuid, current: &Credentials) -> Result<Credentials> {
        let mut account = self.live_account(account_id).await?;
        let adapter = self.registry.get(account.platform).ok_or_else(|| {
            TeamcastError::NotFound(format!("no adapter registered for {}", account.platform))
        })?;

        let now = Utc::now();
        match with_timeout(self.timeout, adapter.refresh_token(current)).await {
            Ok(fresh) => {
                let saved = self.vault.rotate(account_id, fresh, now).await?;
                info!(
                    %account_id,
                    platform = %account.platform,
                    expires_at = ?saved.expires_at,
                    "refreshed access token"
                );
                self.apply(&mut account, now, Account::activate).await?;
                Ok(saved)
            }
            Err(e) if e.requires_reconnect() || !e.is_retryable() => {
                warn!(
                    %account_id,
                    platform = %account.platform,
                    error = %e,
                    "token refresh rejected"
                );
                self.require_reconnect(&mut account, &e.to_string(), now).await?;
                Err(e.into())
            }
            Err(e) => {
                warn!(
                    %account_id,
                    platform = %account.platform,
                    error = %e,
                    "token refresh failed"
                );
                self.apply(&mut account, now, Account::mark_expired).await?;
                Err(e.into())
            }
        }
    }

    /// Move an account to `ReconnectRequired` and tell someone about it
    pub async fn require_reconnect(
        &self,
        account: &mut Account,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let before = account.status();
        self.apply(account, now, Account::require_reconnect).await?;
        let now_required = account.status() == AccountStatus::ReconnectRequired;
        if before != AccountStatus::ReconnectRequired && now_required {
            self.outbox
                .submit(
                    TaskKind::AccountReconnectRequired,
                    json!({
                        "account_id": account.id,
                        "team_id": account.team_id,
                        "platform": account.platform,
                        "reason": reason,
                    }),
                    now,
                )
                .await;
        }
        Ok(())
    }

    /// Run an entity transition and persist it if the status changed. A
    /// transition the current status does not allow is skipped.
    pub async fn apply<F>(
        &self,
        account: &mut Account,
        now: DateTime<Utc>,
        transition: F,
    ) -> Result<()>
    where
        F: FnOnce(&mut Account, DateTime<Utc>) -> std::result::Result<(), ValidationError>,
    {
        let before = account.status();
        if let Err(e) = transition(account, now) {
            debug!(account_id = %account.id, error = %e, "account transition skipped");
            return Ok(());
        }
        if account.status() != before {
            self.accounts.update_account(account).await?;
            info!(
                account_id = %account.id,
                from = %before,
                to = %account.status(),
                "account status changed"
            );
        }
        Ok(())
    }

    async fn live_account(&self, account_id: Uuid) -> Result<Account> {
        match self.accounts.get_account(account_id).await? {
            Some(account) if account.is_live() => Ok(account),
            _ => Err(TeamcastError::NotFound(format!("account {account_id}"))),
        }
    }

    fn lock_for(&self, account_id: Uuid) -> AccountLock {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(account_id).or_default().clone()
    }

    /// Drop the map entry once nobody else holds or waits on it
    fn release(&self, account_id: Uuid, lock: AccountLock) {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        drop(lock);
        if locks.get(&account_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&account_id);
        }
    }

    #[cfg(test)]
    fn tracked_locks(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// Whether a credential failure is one that forces reconnection
pub fn forces_reconnect(error: &TeamcastError) -> bool {
    match error {
        TeamcastError::Credential(_) => true,
        TeamcastError::Platform(e) => e.requires_reconnect(),
        _ => false,
    }
}
