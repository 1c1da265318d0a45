use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{
    from_millis, from_opt_millis, millis, opt_millis, parse_json, parse_uuid, sqlx_error, to_json,
    Database,
};
use crate::error::Result;
use crate::repository::{EncryptedCredentials, TokenRepository};

const TABLE: &str = "social_tokens";

fn tokens_from_row(r: &SqliteRow) -> Result<EncryptedCredentials> {
    Ok(EncryptedCredentials {
        account_id: parse_uuid(TABLE, r.get::<String, _>("account_id").as_str())?,
        access_token: r.get("access_token"),
        refresh_token: r.get("refresh_token"),
        expires_at: from_opt_millis(TABLE, r.get("expires_at"))?,
        scopes: parse_json(TABLE, r.get::<String, _>("scopes").as_str())?,
        platform_user_id: r.get("platform_user_id"),
        key_version: r.get::<i64, _>("key_version") as u32,
        updated_at: from_millis(TABLE, r.get("updated_at"))?,
    })
}

#[async_trait]
impl TokenRepository for Database {
    async fn upsert_tokens(&self, row: &EncryptedCredentials) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO social_tokens (account_id, access_token, refresh_token, expires_at, scopes,
                platform_user_id, key_version, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (account_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                scopes = excluded.scopes,
                platform_user_id = excluded.platform_user_id,
                key_version = excluded.key_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(row.account_id.to_string())
        .bind(&row.access_token)
        .bind(&row.refresh_token)
        .bind(opt_millis(row.expires_at))
        .bind(to_json(TABLE, &row.scopes)?)
        .bind(&row.platform_user_id)
        .bind(row.key_version as i64)
        .bind(millis(row.updated_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn get_tokens(&self, account_id: Uuid) -> Result<Option<EncryptedCredentials>> {
        let row = sqlx::query(
            r#"
            SELECT account_id, access_token, refresh_token, expires_at, scopes, platform_user_id,
                key_version, updated_at
            FROM social_tokens WHERE account_id = ?
            "#,
        )
        .bind(account_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(tokens_from_row).transpose()
    }

    async fn delete_tokens(&self, account_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM social_tokens WHERE account_id = ?")
            .bind(account_id.to_string())
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn accounts_with_key_version_below(&self, version: u32) -> Result<Vec<Uuid>> {
        let rows = sqlx::query(
            "SELECT account_id FROM social_tokens WHERE key_version < ? ORDER BY account_id",
        )
        .bind(version as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error)?;

        rows.iter()
            .map(|r| parse_uuid(TABLE, r.get::<String, _>("account_id").as_str()))
            .collect()
    }
}
