use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{from_millis, from_opt_millis, millis, parse_column, parse_uuid, sqlx_error, Database};
use crate::error::{Result, TeamcastError};
use crate::queue::QueueJob;
use crate::repository::QueueRepository;

const TABLE: &str = "post_queue";

const COLUMNS: &str = "id, post_id, status, priority, attempt_count, max_attempts, scheduled_for, \
     locked_at, locked_by, lock_expires_at, completed_at, last_error, created_at";

fn job_from_row(r: &SqliteRow) -> Result<QueueJob> {
    Ok(QueueJob {
        id: parse_uuid(TABLE, r.get::<String, _>("id").as_str())?,
        post_id: parse_uuid(TABLE, r.get::<String, _>("post_id").as_str())?,
        status: parse_column(TABLE, r.get::<String, _>("status").as_str())?,
        priority: r.get::<i64, _>("priority") as i32,
        attempt_count: r.get::<i64, _>("attempt_count") as u32,
        max_attempts: r.get::<i64, _>("max_attempts") as u32,
        scheduled_for: from_millis(TABLE, r.get("scheduled_for"))?,
        locked_at: from_opt_millis(TABLE, r.get("locked_at"))?,
        locked_by: r.get("locked_by"),
        lock_expires_at: from_opt_millis(TABLE, r.get("lock_expires_at"))?,
        completed_at: from_opt_millis(TABLE, r.get("completed_at"))?,
        last_error: r.get("last_error"),
        created_at: from_millis(TABLE, r.get("created_at"))?,
    })
}

fn lease_lost(job_id: Uuid, worker_id: &str) -> TeamcastError {
    TeamcastError::Conflict(format!("worker {worker_id} no longer holds the lease on job {job_id}"))
}

#[async_trait]
impl QueueRepository for Database {
    async fn enqueue(&self, job: &QueueJob) -> Result<QueueJob> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO post_queue (id, post_id, status, priority, attempt_count, max_attempts,
                scheduled_for, locked_at, locked_by, lock_expires_at, completed_at, last_error,
                created_at)
            VALUES (?, ?, 'pending', ?, 0, ?, ?, NULL, NULL, NULL, NULL, NULL, ?)
            ON CONFLICT (post_id) DO UPDATE SET
                status = 'pending',
                priority = excluded.priority,
                attempt_count = 0,
                max_attempts = excluded.max_attempts,
                scheduled_for = excluded.scheduled_for,
                locked_at = NULL,
                locked_by = NULL,
                lock_expires_at = NULL,
                completed_at = NULL,
                last_error = NULL
            WHERE post_queue.status != 'processing'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job.id.to_string())
        .bind(job.post_id.to_string())
        .bind(job.priority as i64)
        .bind(job.max_attempts as i64)
        .bind(millis(job.scheduled_for))
        .bind(millis(job.created_at))
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(TeamcastError::Conflict(format!(
                "post {} is being published and cannot be re-queued",
                job.post_id
            ))),
        }
    }

    async fn job_for_post(&self, post_id: Uuid) -> Result<Option<QueueJob>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM post_queue WHERE post_id = ?"))
            .bind(post_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueJob>> {
        // Select and lock in one statement; the outer status check makes a
        // concurrent claimer's update a no-op
        let row = sqlx::query(&format!(
            r#"
            UPDATE post_queue
            SET status = 'processing', locked_at = ?1, locked_by = ?2, lock_expires_at = ?3
            WHERE id = (
                SELECT id FROM post_queue
                WHERE status = 'pending' AND scheduled_for <= ?1
                ORDER BY priority DESC, scheduled_for ASC, created_at ASC
                LIMIT 1
            )
            AND status = 'pending'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(millis(now))
        .bind(worker_id)
        .bind(millis(now + lease))
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn claim_post(
        &self,
        post_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<Option<QueueJob>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE post_queue
            SET status = 'processing', locked_at = ?1, locked_by = ?2, lock_expires_at = ?3
            WHERE post_id = ?4 AND status = 'pending' AND scheduled_for <= ?1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(millis(now))
        .bind(worker_id)
        .bind(millis(now + lease))
        .bind(post_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn renew_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<QueueJob> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE post_queue
            SET lock_expires_at = ?4
            WHERE id = ?2 AND status = 'processing' AND locked_by = ?3 AND lock_expires_at > ?1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(millis(now))
        .bind(job_id.to_string())
        .bind(worker_id)
        .bind(millis(now + lease))
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(lease_lost(job_id, worker_id)),
        }
    }

    async fn complete(&self, job_id: Uuid, worker_id: &str, now: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE post_queue
            SET status = 'completed', completed_at = ?1, locked_at = NULL, locked_by = NULL,
                lock_expires_at = NULL, last_error = NULL
            WHERE id = ?2 AND status = 'processing' AND locked_by = ?3 AND lock_expires_at > ?1
            "#,
        )
        .bind(millis(now))
        .bind(job_id.to_string())
        .bind(worker_id)
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(lease_lost(job_id, worker_id));
        }
        Ok(())
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<QueueJob> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE post_queue
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= max_attempts
                    THEN 'failed' ELSE 'pending' END,
                scheduled_for = CASE WHEN attempt_count + 1 >= max_attempts
                    THEN scheduled_for ELSE ?4 END,
                completed_at = CASE WHEN attempt_count + 1 >= max_attempts THEN ?1 ELSE NULL END,
                last_error = ?5,
                locked_at = NULL, locked_by = NULL, lock_expires_at = NULL
            WHERE id = ?2 AND status = 'processing' AND locked_by = ?3 AND lock_expires_at > ?1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(millis(now))
        .bind(job_id.to_string())
        .bind(worker_id)
        .bind(millis(retry_at))
        .bind(error)
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(lease_lost(job_id, worker_id)),
        }
    }

    async fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<Vec<QueueJob>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE post_queue
            SET attempt_count = attempt_count + 1,
                status = CASE WHEN attempt_count + 1 >= max_attempts
                    THEN 'failed' ELSE 'pending' END,
                scheduled_for = ?1,
                completed_at = CASE WHEN attempt_count + 1 >= max_attempts THEN ?1 ELSE NULL END,
                last_error = 'lease expired before the job finished',
                locked_at = NULL, locked_by = NULL, lock_expires_at = NULL
            WHERE status = 'processing' AND lock_expires_at <= ?1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(millis(now))
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn cancel_pending(&self, post_id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM post_queue WHERE post_id = ? AND status = 'pending'")
            .bind(post_id.to_string())
            .execute(self.pool())
            .await
            .map_err(sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}
