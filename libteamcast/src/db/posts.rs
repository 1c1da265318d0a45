use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{
    from_millis, from_opt_millis, is_unique_violation, millis, opt_millis, parse_column,
    parse_json, parse_uuid, sqlx_error, to_json, Database,
};
use crate::error::{Result, TeamcastError};
use crate::posts::{Post, PostStatus, PublishingRecord};
use crate::repository::PostRepository;
use crate::types::Content;

const POSTS: &str = "scheduled_posts";
const RECORDS: &str = "publishing_records";

const POST_COLUMNS: &str = "id, team_id, created_by, text, media_urls, platforms, status, \
     scheduled_at, published_at, retry_count, max_retries, error_message, created_at, updated_at";

const RECORD_COLUMNS: &str = "id, post_id, platform, account_id, platform_post_id, url, status, \
     published_at, error, retry_count, updated_at";

fn post_from_row(r: &SqliteRow) -> Result<Post> {
    let content = Content {
        text: r.get("text"),
        media_urls: parse_json(POSTS, r.get::<String, _>("media_urls").as_str())?,
    };

    Ok(Post::restore(
        parse_uuid(POSTS, r.get::<String, _>("id").as_str())?,
        parse_uuid(POSTS, r.get::<String, _>("team_id").as_str())?,
        parse_uuid(POSTS, r.get::<String, _>("created_by").as_str())?,
        content,
        parse_json(POSTS, r.get::<String, _>("platforms").as_str())?,
        parse_column(POSTS, r.get::<String, _>("status").as_str())?,
        from_opt_millis(POSTS, r.get("scheduled_at"))?,
        from_opt_millis(POSTS, r.get("published_at"))?,
        r.get::<i64, _>("retry_count") as u32,
        r.get::<i64, _>("max_retries") as u32,
        r.get("error_message"),
        from_millis(POSTS, r.get("created_at"))?,
        from_millis(POSTS, r.get("updated_at"))?,
    ))
}

fn record_from_row(r: &SqliteRow) -> Result<PublishingRecord> {
    let account_id: Option<String> = r.get("account_id");
    Ok(PublishingRecord {
        id: parse_uuid(RECORDS, r.get::<String, _>("id").as_str())?,
        post_id: parse_uuid(RECORDS, r.get::<String, _>("post_id").as_str())?,
        platform: parse_column(RECORDS, r.get::<String, _>("platform").as_str())?,
        account_id: account_id.as_deref().map(|id| parse_uuid(RECORDS, id)).transpose()?,
        platform_post_id: r.get("platform_post_id"),
        url: r.get("url"),
        status: parse_column(RECORDS, r.get::<String, _>("status").as_str())?,
        published_at: from_opt_millis(RECORDS, r.get("published_at"))?,
        error: r.get("error"),
        retry_count: r.get::<i64, _>("retry_count") as u32,
        updated_at: from_millis(RECORDS, r.get("updated_at"))?,
    })
}

#[async_trait]
impl PostRepository for Database {
    async fn insert_post(&self, post: &Post) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scheduled_posts (id, team_id, created_by, text, media_urls, platforms,
                status, scheduled_at, published_at, retry_count, max_retries, error_message,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(post.id.to_string())
        .bind(post.team_id.to_string())
        .bind(post.created_by.to_string())
        .bind(&post.content.text)
        .bind(to_json(POSTS, &post.content.media_urls)?)
        .bind(to_json(POSTS, &post.platforms)?)
        .bind(post.status().as_str())
        .bind(opt_millis(post.scheduled_at))
        .bind(opt_millis(post.published_at))
        .bind(post.retry_count as i64)
        .bind(post.max_retries as i64)
        .bind(&post.error_message)
        .bind(millis(post.created_at))
        .bind(millis(post.updated_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn update_post(&self, post: &Post, expected: PostStatus) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE scheduled_posts
            SET text = ?, media_urls = ?, platforms = ?, status = ?, scheduled_at = ?,
                published_at = ?, retry_count = ?, max_retries = ?, error_message = ?,
                updated_at = ?
            WHERE id = ? AND status = ?
            "#,
        )
        .bind(&post.content.text)
        .bind(to_json(POSTS, &post.content.media_urls)?)
        .bind(to_json(POSTS, &post.platforms)?)
        .bind(post.status().as_str())
        .bind(opt_millis(post.scheduled_at))
        .bind(opt_millis(post.published_at))
        .bind(post.retry_count as i64)
        .bind(post.max_retries as i64)
        .bind(&post.error_message)
        .bind(millis(post.updated_at))
        .bind(post.id.to_string())
        .bind(expected.as_str())
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_post(post.id).await? {
            None => Err(TeamcastError::NotFound(format!("post {}", post.id))),
            Some(current) => Err(TeamcastError::Conflict(format!(
                "post {} is {}, expected {}",
                post.id,
                current.status(),
                expected
            ))),
        }
    }

    async fn get_post(&self, id: Uuid) -> Result<Option<Post>> {
        let row = sqlx::query(&format!("SELECT {POST_COLUMNS} FROM scheduled_posts WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error)?;

        row.as_ref().map(post_from_row).transpose()
    }

    async fn list_posts(&self, team_id: Uuid, status: Option<PostStatus>) -> Result<Vec<Post>> {
        let rows = match status {
            Some(status) => sqlx::query(&format!(
                "SELECT {POST_COLUMNS} FROM scheduled_posts WHERE team_id = ? AND status = ? \
                 ORDER BY created_at DESC"
            ))
            .bind(team_id.to_string())
            .bind(status.as_str())
            .fetch_all(self.pool())
            .await,
            None => sqlx::query(&format!(
                "SELECT {POST_COLUMNS} FROM scheduled_posts WHERE team_id = ? \
                 ORDER BY created_at DESC"
            ))
            .bind(team_id.to_string())
            .fetch_all(self.pool())
            .await,
        }
        .map_err(sqlx_error)?;

        rows.iter().map(post_from_row).collect()
    }

    async fn delete_post(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM scheduled_posts WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn upsert_record(&self, record: &PublishingRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO publishing_records (id, post_id, platform, account_id, platform_post_id,
                url, status, published_at, error, retry_count, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (post_id, platform) DO UPDATE SET
                account_id = excluded.account_id,
                platform_post_id = excluded.platform_post_id,
                url = excluded.url,
                status = excluded.status,
                published_at = excluded.published_at,
                error = excluded.error,
                retry_count = excluded.retry_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(record.id.to_string())
        .bind(record.post_id.to_string())
        .bind(record.platform.as_str())
        .bind(record.account_id.map(|id| id.to_string()))
        .bind(&record.platform_post_id)
        .bind(&record.url)
        .bind(record.status.as_str())
        .bind(opt_millis(record.published_at))
        .bind(&record.error)
        .bind(record.retry_count as i64)
        .bind(millis(record.updated_at))
        .execute(self.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                TeamcastError::Duplicate(format!(
                    "{} post {} is already recorded for this account",
                    record.platform,
                    record.platform_post_id.as_deref().unwrap_or_default()
                ))
            } else {
                sqlx_error(e)
            }
        })?;

        Ok(())
    }

    async fn records_for_post(&self, post_id: Uuid) -> Result<Vec<PublishingRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM publishing_records WHERE post_id = ? ORDER BY platform"
        ))
        .bind(post_id.to_string())
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error)?;

        rows.iter().map(record_from_row).collect()
    }

    async fn find_record(
        &self,
        post_id: Uuid,
        account_id: Uuid,
    ) -> Result<Option<PublishingRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM publishing_records WHERE post_id = ? AND account_id = ?"
        ))
        .bind(post_id.to_string())
        .bind(account_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(record_from_row).transpose()
    }
}
