//! SQLite storage for Teamcast
//!
//! [`Database`] owns the connection pool, runs the embedded migrations and
//! implements every repository trait in [`crate::repository`]. Timestamps are
//! stored as unix epoch milliseconds, ids as UUID strings.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use uuid::Uuid;

use crate::error::{DbError, Result, TeamcastError};

mod accounts;
mod members;
mod outbox;
mod posts;
mod queue;
mod telemetry;
mod tokens;

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if needed) the database at `db_path` and migrate it
    pub async fn new(db_path: &str) -> Result<Self> {
        // Expand path and create parent directories
        let expanded_path = shellexpand::tilde(db_path).to_string();
        let path = Path::new(&expanded_path);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(DbError::IoError)?;
        }

        // Forward slashes work for SQLite URLs on every platform
        let db_url = format!("sqlite://{}", expanded_path.replace('\\', "/"));
        let options = SqliteConnectOptions::from_str(&db_url)
            .map_err(DbError::SqlxError)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(DbError::SqlxError)?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(DbError::MigrationError)?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(millis)
}

pub(crate) fn from_millis(table: &'static str, ms: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| {
        DbError::CorruptRow {
            table,
            reason: format!("timestamp out of range: {ms}"),
        }
        .into()
    })
}

pub(crate) fn from_opt_millis(
    table: &'static str,
    ms: Option<i64>,
) -> Result<Option<DateTime<Utc>>> {
    ms.map(|ms| from_millis(table, ms)).transpose()
}

pub(crate) fn parse_uuid(table: &'static str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| {
        DbError::CorruptRow {
            table,
            reason: format!("bad id {value:?}: {e}"),
        }
        .into()
    })
}

/// Parse an enum column through its `FromStr` impl
pub(crate) fn parse_column<T>(table: &'static str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    value.parse::<T>().map_err(|e| {
        DbError::CorruptRow {
            table,
            reason: e.to_string(),
        }
        .into()
    })
}

pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    table: &'static str,
    value: &str,
) -> Result<T> {
    serde_json::from_str(value).map_err(|e| {
        DbError::CorruptRow {
            table,
            reason: format!("bad json: {e}"),
        }
        .into()
    })
}

pub(crate) fn to_json<T: serde::Serialize>(table: &'static str, value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| {
        DbError::CorruptRow {
            table,
            reason: format!("cannot encode json: {e}"),
        }
        .into()
    })
}

pub(crate) fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map(|e| e.is_unique_violation())
        .unwrap_or(false)
}

pub(crate) fn sqlx_error(error: sqlx::Error) -> TeamcastError {
    DbError::SqlxError(error).into()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Database;
    use tempfile::TempDir;

    pub async fn setup_test_db() -> (TempDir, Database) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path.to_string_lossy()).await.unwrap();
        (temp_dir, db)
    }
}
