use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{
    from_millis, from_opt_millis, is_unique_violation, millis, opt_millis, parse_column,
    parse_uuid, sqlx_error, Database,
};
use crate::accounts::{Account, PendingAuthorization, Tombstone};
use crate::error::{Result, TeamcastError};
use crate::platforms::Pkce;
use crate::repository::{AccountRepository, AuthorizationRepository};
use crate::types::{Platform, ProfileInfo};

const TABLE: &str = "social_accounts";

const COLUMNS: &str = "id, team_id, connected_by, platform, platform_user_id, account_type, \
     status, username, display_name, avatar_url, profile_url, created_at, updated_at, deleted_at";

fn account_from_row(r: &SqliteRow) -> Result<Account> {
    let account_type = parse_column(TABLE, r.get::<String, _>("account_type").as_str())?;
    let profile = ProfileInfo {
        username: r.get("username"),
        display_name: r.get("display_name"),
        avatar_url: r.get("avatar_url"),
        profile_url: r.get("profile_url"),
        account_type,
    };

    Ok(Account::restore(
        parse_uuid(TABLE, r.get::<String, _>("id").as_str())?,
        parse_uuid(TABLE, r.get::<String, _>("team_id").as_str())?,
        parse_uuid(TABLE, r.get::<String, _>("connected_by").as_str())?,
        parse_column(TABLE, r.get::<String, _>("platform").as_str())?,
        r.get("platform_user_id"),
        account_type,
        profile,
        parse_column(TABLE, r.get::<String, _>("status").as_str())?,
        from_millis(TABLE, r.get("created_at"))?,
        from_millis(TABLE, r.get("updated_at"))?,
        Tombstone::from_deleted_at(from_opt_millis(TABLE, r.get("deleted_at"))?),
    ))
}

#[async_trait]
impl AccountRepository for Database {
    async fn insert_account(&self, account: &Account) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO social_accounts (id, team_id, connected_by, platform, platform_user_id,
                account_type, status, username, display_name, avatar_url, profile_url,
                created_at, updated_at, deleted_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account.id.to_string())
        .bind(account.team_id.to_string())
        .bind(account.connected_by.to_string())
        .bind(account.platform.as_str())
        .bind(&account.platform_user_id)
        .bind(account.account_type.as_str())
        .bind(account.status().as_str())
        .bind(&account.profile.username)
        .bind(&account.profile.display_name)
        .bind(&account.profile.avatar_url)
        .bind(&account.profile.profile_url)
        .bind(millis(account.created_at))
        .bind(millis(account.updated_at))
        .bind(opt_millis(account.tombstone().deleted_at()))
        .execute(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamcastError::Duplicate(format!(
                    "{} account {} is already connected to this team",
                    account.platform, account.platform_user_id
                ))
            } else {
                sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn update_account(&self, account: &Account) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE social_accounts
            SET account_type = ?, status = ?, username = ?, display_name = ?, avatar_url = ?,
                profile_url = ?, updated_at = ?, deleted_at = ?
            WHERE id = ?
            "#,
        )
        .bind(account.account_type.as_str())
        .bind(account.status().as_str())
        .bind(&account.profile.username)
        .bind(&account.profile.display_name)
        .bind(&account.profile.avatar_url)
        .bind(&account.profile.profile_url)
        .bind(millis(account.updated_at))
        .bind(opt_millis(account.tombstone().deleted_at()))
        .bind(account.id.to_string())
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(TeamcastError::NotFound(format!("account {}", account.id)));
        }
        Ok(())
    }

    async fn get_account(&self, id: Uuid) -> Result<Option<Account>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM social_accounts WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn find_live_by_identity(
        &self,
        team_id: Uuid,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Option<Account>> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM social_accounts \
             WHERE team_id = ? AND platform = ? AND platform_user_id = ? AND deleted_at IS NULL"
        ))
        .bind(team_id.to_string())
        .bind(platform.as_str())
        .bind(platform_user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_live_accounts(
        &self,
        team_id: Uuid,
        platform: Option<Platform>,
    ) -> Result<Vec<Account>> {
        let rows = match platform {
            Some(platform) => sqlx::query(&format!(
                "SELECT {COLUMNS} FROM social_accounts \
                 WHERE team_id = ? AND platform = ? AND deleted_at IS NULL \
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(team_id.to_string())
            .bind(platform.as_str())
            .fetch_all(self.pool())
            .await,
            None => sqlx::query(&format!(
                "SELECT {COLUMNS} FROM social_accounts \
                 WHERE team_id = ? AND deleted_at IS NULL \
                 ORDER BY created_at ASC, id ASC"
            ))
            .bind(team_id.to_string())
            .fetch_all(self.pool())
            .await,
        }
        .map_err(sqlx_error)?;

        rows.iter().map(account_from_row).collect()
    }

    async fn find_live_by_platform_user(
        &self,
        platform: Platform,
        platform_user_id: &str,
    ) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM social_accounts \
             WHERE platform = ? AND platform_user_id = ? AND deleted_at IS NULL \
             ORDER BY created_at ASC"
        ))
        .bind(platform.as_str())
        .bind(platform_user_id)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error)?;

        rows.iter().map(account_from_row).collect()
    }
}

const AUTHORIZATIONS: &str = "oauth_authorizations";

fn authorization_from_row(r: &SqliteRow) -> Result<PendingAuthorization> {
    Ok(PendingAuthorization {
        state: r.get("state"),
        team_id: parse_uuid(AUTHORIZATIONS, r.get::<String, _>("team_id").as_str())?,
        user_id: parse_uuid(AUTHORIZATIONS, r.get::<String, _>("user_id").as_str())?,
        platform: parse_column(AUTHORIZATIONS, r.get::<String, _>("platform").as_str())?,
        pkce: Pkce::from_verifier(r.get::<String, _>("code_verifier")),
        created_at: from_millis(AUTHORIZATIONS, r.get("created_at"))?,
    })
}

#[async_trait]
impl AuthorizationRepository for Database {
    async fn insert_authorization(&self, authorization: &PendingAuthorization) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO oauth_authorizations
                (state, team_id, user_id, platform, code_verifier, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&authorization.state)
        .bind(authorization.team_id.to_string())
        .bind(authorization.user_id.to_string())
        .bind(authorization.platform.as_str())
        .bind(authorization.pkce.verifier())
        .bind(millis(authorization.created_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn take_authorization(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let row = sqlx::query(
            "DELETE FROM oauth_authorizations WHERE state = ? \
             RETURNING state, team_id, user_id, platform, code_verifier, created_at",
        )
        .bind(state)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(authorization_from_row).transpose()
    }

    async fn delete_authorizations_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM oauth_authorizations WHERE created_at < ?")
            .bind(millis(cutoff))
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountStatus;
    use crate::db::test_support::setup_test_db;
    use crate::types::AccountType;
    use chrono::Duration;

    fn profile(username: &str) -> ProfileInfo {
        ProfileInfo {
            username: username.to_string(),
            display_name: Some("Acme".to_string()),
            avatar_url: None,
            profile_url: Some(format!("https://x.com/{username}")),
            account_type: AccountType::Business,
        }
    }

    /// A pending account connected by a random user
    fn pending(
        team: Uuid,
        platform: Platform,
        platform_user_id: &str,
        username: &str,
        at: DateTime<Utc>,
    ) -> Account {
        Account::pending(team, Uuid::new_v4(), platform, platform_user_id, profile(username), at)
    }

    fn authorization(platform: Platform, at: DateTime<Utc>) -> PendingAuthorization {
        PendingAuthorization::new(Uuid::new_v4(), Uuid::new_v4(), platform, at)
    }

    #[tokio::test]
    async fn test_insert_and_get_account() {
        let (_temp, db) = setup_test_db().await;
        let now = Utc::now();
        let mut account = pending(Uuid::new_v4(), Platform::Twitter, "123", "acme", now);
        account.activate(now).unwrap();
        db.insert_account(&account).await.unwrap();

        let loaded = db.get_account(account.id).await.unwrap().unwrap();
        assert_eq!(loaded.status(), AccountStatus::Active);
        assert_eq!(loaded.profile.username, "acme");
        assert_eq!(loaded.account_type, AccountType::Business);
        assert_eq!(loaded.created_at.timestamp_millis(), now.timestamp_millis());
        assert!(loaded.is_live());
    }

    #[tokio::test]
    async fn test_duplicate_live_identity_rejected() {
        let (_temp, db) = setup_test_db().await;
        let team = Uuid::new_v4();
        let now = Utc::now();
        let first = pending(team, Platform::Twitter, "123", "acme", now);
        db.insert_account(&first).await.unwrap();

        let second = pending(team, Platform::Twitter, "123", "acme", now);
        let err = db.insert_account(&second).await.unwrap_err();
        assert!(matches!(err, TeamcastError::Duplicate(_)));

        // another team may connect the same identity
        let other_team = pending(Uuid::new_v4(), Platform::Twitter, "123", "acme", now);
        db.insert_account(&other_team).await.unwrap();
    }

    #[tokio::test]
    async fn test_tombstoned_identity_can_reconnect() {
        let (_temp, db) = setup_test_db().await;
        let team = Uuid::new_v4();
        let now = Utc::now();
        let mut first = pending(team, Platform::Facebook, "page-1", "acme", now);
        db.insert_account(&first).await.unwrap();
        first.disconnect(now).unwrap();
        db.update_account(&first).await.unwrap();

        assert!(db
            .find_live_by_identity(team, Platform::Facebook, "page-1")
            .await
            .unwrap()
            .is_none());

        let second = pending(team, Platform::Facebook, "page-1", "acme", now);
        db.insert_account(&second).await.unwrap();

        // the tombstone is still readable by id
        let old = db.get_account(first.id).await.unwrap().unwrap();
        assert!(!old.is_live());
    }

    #[tokio::test]
    async fn test_list_live_accounts_oldest_first() {
        let (_temp, db) = setup_test_db().await;
        let team = Uuid::new_v4();
        let now = Utc::now();
        let newer = pending(team, Platform::Twitter, "2", "b", now);
        let older = pending(team, Platform::Twitter, "1", "a", now - Duration::days(1));
        let facebook = pending(team, Platform::Facebook, "3", "c", now);
        for account in [&newer, &older, &facebook] {
            db.insert_account(account).await.unwrap();
        }

        let twitter = db.list_live_accounts(team, Some(Platform::Twitter)).await.unwrap();
        assert_eq!(twitter.iter().map(|a| a.id).collect::<Vec<_>>(), vec![older.id, newer.id]);

        let all = db.list_live_accounts(team, None).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_update_missing_account() {
        let (_temp, db) = setup_test_db().await;
        let account = pending(Uuid::new_v4(), Platform::Twitter, "1", "a", Utc::now());
        let err = db.update_account(&account).await.unwrap_err();
        assert!(matches!(err, TeamcastError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_authorization_is_taken_once() {
        let (_temp, db) = setup_test_db().await;
        let now = Utc::now();
        let authorization = authorization(Platform::Twitter, now);
        db.insert_authorization(&authorization).await.unwrap();

        let taken = db.take_authorization(&authorization.state).await.unwrap().unwrap();
        assert_eq!(taken.team_id, authorization.team_id);
        assert_eq!(taken.platform, Platform::Twitter);
        assert_eq!(taken.pkce.verifier(), authorization.pkce.verifier());
        assert_eq!(taken.created_at.timestamp_millis(), now.timestamp_millis());

        assert!(db.take_authorization(&authorization.state).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_old_authorizations_are_purged() {
        let (_temp, db) = setup_test_db().await;
        let now = Utc::now();
        let old = authorization(Platform::Facebook, now - Duration::hours(1));
        let fresh = authorization(Platform::Facebook, now);
        db.insert_authorization(&old).await.unwrap();
        db.insert_authorization(&fresh).await.unwrap();

        let purged = db.delete_authorizations_before(now - Duration::minutes(10)).await.unwrap();
        assert_eq!(purged, 1);
        assert!(db.take_authorization(&old.state).await.unwrap().is_none());
        assert!(db.take_authorization(&fresh.state).await.unwrap().is_some());
    }
}
