use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::{
    from_millis, millis, parse_column, parse_json, parse_uuid, sqlx_error, to_json, Database,
};
use crate::error::Result;
use crate::outbox::OutboundTask;
use crate::repository::OutboxRepository;

const TABLE: &str = "outbound_tasks";

fn task_from_row(r: &SqliteRow) -> Result<OutboundTask> {
    Ok(OutboundTask {
        id: parse_uuid(TABLE, r.get::<String, _>("id").as_str())?,
        kind: parse_column(TABLE, r.get::<String, _>("kind").as_str())?,
        payload: parse_json(TABLE, r.get::<String, _>("payload").as_str())?,
        status: parse_column(TABLE, r.get::<String, _>("status").as_str())?,
        attempts: r.get::<i64, _>("attempts") as u32,
        max_attempts: r.get::<i64, _>("max_attempts") as u32,
        next_attempt_at: from_millis(TABLE, r.get("next_attempt_at"))?,
        last_error: r.get("last_error"),
        created_at: from_millis(TABLE, r.get("created_at"))?,
        updated_at: from_millis(TABLE, r.get("updated_at"))?,
    })
}

#[async_trait]
impl OutboxRepository for Database {
    async fn insert_task(&self, task: &OutboundTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbound_tasks (id, kind, payload, status, attempts, max_attempts,
                next_attempt_at, last_error, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(task.id.to_string())
        .bind(task.kind.as_str())
        .bind(to_json(TABLE, &task.payload)?)
        .bind(task.status.as_str())
        .bind(task.attempts as i64)
        .bind(task.max_attempts as i64)
        .bind(millis(task.next_attempt_at))
        .bind(&task.last_error)
        .bind(millis(task.created_at))
        .bind(millis(task.updated_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn due_tasks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboundTask>> {
        let rows = sqlx::query(
            r#"
            SELECT id, kind, payload, status, attempts, max_attempts, next_attempt_at, last_error,
                created_at, updated_at
            FROM outbound_tasks
            WHERE status = 'pending' AND next_attempt_at <= ?
            ORDER BY next_attempt_at ASC, created_at ASC
            LIMIT ?
            "#,
        )
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(self.pool())
        .await
        .map_err(sqlx_error)?;

        rows.iter().map(task_from_row).collect()
    }

    async fn update_task(&self, task: &OutboundTask) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbound_tasks
            SET status = ?, attempts = ?, next_attempt_at = ?, last_error = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(task.status.as_str())
        .bind(task.attempts as i64)
        .bind(millis(task.next_attempt_at))
        .bind(&task.last_error)
        .bind(millis(task.updated_at))
        .bind(task.id.to_string())
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }
}
