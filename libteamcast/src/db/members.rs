use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use super::{from_millis, millis, parse_column, parse_uuid, sqlx_error, Database};
use crate::error::Result;
use crate::permissions::Member;
use crate::repository::MemberRepository;

const TABLE: &str = "team_members";

fn member_from_row(r: &SqliteRow) -> Result<Member> {
    Ok(Member {
        team_id: parse_uuid(TABLE, r.get::<String, _>("team_id").as_str())?,
        user_id: parse_uuid(TABLE, r.get::<String, _>("user_id").as_str())?,
        role: parse_column(TABLE, r.get::<String, _>("role").as_str())?,
        status: parse_column(TABLE, r.get::<String, _>("status").as_str())?,
        joined_at: from_millis(TABLE, r.get("joined_at"))?,
    })
}

#[async_trait]
impl MemberRepository for Database {
    async fn upsert_member(&self, member: &Member) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO team_members (team_id, user_id, role, status, joined_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (team_id, user_id) DO UPDATE SET
                role = excluded.role,
                status = excluded.status
            "#,
        )
        .bind(member.team_id.to_string())
        .bind(member.user_id.to_string())
        .bind(member.role.as_str())
        .bind(member.status.as_str())
        .bind(millis(member.joined_at))
        .execute(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(())
    }

    async fn get_member(&self, team_id: Uuid, user_id: Uuid) -> Result<Option<Member>> {
        let row = sqlx::query(
            "SELECT team_id, user_id, role, status, joined_at FROM team_members \
             WHERE team_id = ? AND user_id = ?",
        )
        .bind(team_id.to_string())
        .bind(user_id.to_string())
        .fetch_optional(self.pool())
        .await
        .map_err(sqlx_error)?;

        row.as_ref().map(member_from_row).transpose()
    }

    async fn count_active_owners(&self, team_id: Uuid) -> Result<usize> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM team_members \
             WHERE team_id = ? AND role = 'owner' AND status = 'active'",
        )
        .bind(team_id.to_string())
        .fetch_one(self.pool())
        .await
        .map_err(sqlx_error)?;

        Ok(count as usize)
    }
}
