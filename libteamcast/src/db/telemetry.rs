//! Webhook dedupe, analytics snapshots and 429 windows

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::{from_millis, is_unique_violation, millis, sqlx_error, Database};
use crate::error::Result;
use crate::repository::{AnalyticsRepository, ThrottleRepository, WebhookRepository};
use crate::types::{Analytics, Platform};

#[async_trait]
impl WebhookRepository for Database {
    async fn record_webhook_event(
        &self,
        platform: Platform,
        event_id: &str,
        payload: &str,
        received_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO webhook_events (platform, event_id, payload, received_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(platform.as_str())
        .bind(event_id)
        .bind(payload)
        .bind(millis(received_at))
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => Ok(true),
            Err(e) if is_unique_violation(&e) => Ok(false),
            Err(e) => Err(sqlx_error(e)),
        }
    }
}

#[async_trait]
impl AnalyticsRepository for Database {
    async fn record_snapshot(
        &self,
        account_id: Uuid,
        post_id: Uuid,
        platform_post_id: &str,
        analytics: &Analytics,
        fetched_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO analytics_events (account_id, post_id, platform_post_id, impressions, likes,
                comments, shares, clicks, engagements, fetched_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(account_id.to_string())
        .bind(post_id.to_string())
        .bind(platform_post_id)
        .bind(analytics.impressions as i64)
        .bind(analytics.likes as i64)
        .bind(analytics.comments as i64)
        .bind(analytics.shares as i64)
        .bind(analytics.clicks as i64)
        .bind(analytics.engagements as i64)
        .bind(millis(fetched_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn latest_snapshot(
        &self,
        account_id: Uuid,
        post_id: Uuid,
    ) -> Result<Option<(Analytics, DateTime<Utc>)>> {
        let row = sqlx::query(
            r#"
            SELECT impressions, likes, comments, shares, clicks, engagements, fetched_at
            FROM analytics_events
            WHERE account_id = ? AND post_id = ?
            ORDER BY fetched_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(account_id.to_string())
        .bind(post_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        let Some(r) = row else {
            return Ok(None);
        };

        let analytics = Analytics {
            impressions: r.get::<i64, _>("impressions") as u64,
            likes: r.get::<i64, _>("likes") as u64,
            comments: r.get::<i64, _>("comments") as u64,
            shares: r.get::<i64, _>("shares") as u64,
            clicks: r.get::<i64, _>("clicks") as u64,
            engagements: r.get::<i64, _>("engagements") as u64,
        };
        Ok(Some((analytics, from_millis("analytics_events", r.get("fetched_at"))?)))
    }
}

#[async_trait]
impl ThrottleRepository for Database {
    async fn increment_throttle(&self, account_id: Uuid, window_start: i64) -> Result<u32> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            INSERT INTO rate_limits (account_id, window_start, throttle_count)
            VALUES (?, ?, 1)
            ON CONFLICT (account_id, window_start) DO UPDATE SET
                throttle_count = throttle_count + 1
            RETURNING throttle_count
            "#,
        )
        .bind(account_id.to_string())
        .bind(window_start)
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(count as u32)
    }

    async fn throttle_count(&self, account_id: Uuid, window_start: i64) -> Result<u32> {
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT throttle_count FROM rate_limits WHERE account_id = ? AND window_start = ?",
        )
        .bind(account_id.to_string())
        .bind(window_start)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(count.unwrap_or(0) as u32)
    }

    async fn clear_throttle(&self, account_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM rate_limits WHERE account_id = ?")
            .bind(account_id.to_string())
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(())
    }

    async fn delete_throttle_windows_before(&self, cutoff: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM rate_limits WHERE window_start < ?")
            .bind(cutoff)
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::setup_test_db;
    use chrono::Duration;

    #[tokio::test]
    async fn test_webhook_event_recorded_once() {
        let (_temp, db) = setup_test_db().await;
        let now = Utc::now();
        assert!(db
            .record_webhook_event(Platform::Facebook, "evt-1", "{}", now)
            .await
            .unwrap());
        assert!(!db
            .record_webhook_event(Platform::Facebook, "evt-1", "{}", now)
            .await
            .unwrap());
        // ids are scoped per platform
        assert!(db
            .record_webhook_event(Platform::Twitter, "evt-1", "{}", now)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_latest_snapshot() {
        let (_temp, db) = setup_test_db().await;
        let account = Uuid::new_v4();
        let post = Uuid::new_v4();
        let now = Utc::now();
        assert!(db.latest_snapshot(account, post).await.unwrap().is_none());

        let old = Analytics {
            likes: 1,
            ..Analytics::default()
        };
        let new = Analytics {
            likes: 9,
            impressions: 120,
            ..Analytics::default()
        };
        db.record_snapshot(account, post, "p1", &old, now - Duration::hours(1))
            .await
            .unwrap();
        db.record_snapshot(account, post, "p1", &new, now).await.unwrap();

        let (latest, fetched_at) = db.latest_snapshot(account, post).await.unwrap().unwrap();
        assert_eq!(latest, new);
        assert_eq!(fetched_at.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_throttle_windows() {
        let (_temp, db) = setup_test_db().await;
        let account = Uuid::new_v4();
        assert_eq!(db.increment_throttle(account, 3600).await.unwrap(), 1);
        assert_eq!(db.increment_throttle(account, 3600).await.unwrap(), 2);
        assert_eq!(db.increment_throttle(account, 7200).await.unwrap(), 1);
        assert_eq!(db.throttle_count(account, 3600).await.unwrap(), 2);

        assert_eq!(db.delete_throttle_windows_before(7200).await.unwrap(), 1);
        assert_eq!(db.throttle_count(account, 3600).await.unwrap(), 0);

        db.clear_throttle(account).await.unwrap();
        assert_eq!(db.throttle_count(account, 7200).await.unwrap(), 0);
    }
}
