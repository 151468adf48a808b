//! Database module for SQLite persistence.
//!
//! SQLite is the source of truth for meetings, votings and vote ledgers.

mod repository;

pub use repository::*;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

use crate::errors::AppError;

/// Initialize the database connection pool and run migrations.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Ensure the parent directory exists
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await.ok();
    }

    let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
        .busy_timeout(std::time::Duration::from_secs(30));

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    // Run embedded migrations
    run_migrations(&pool).await?;

    Ok(pool)
}

/// Run database migrations.
async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS meetings (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            description TEXT,
            created_by TEXT NOT NULL,
            access_pin TEXT NOT NULL,
            start_at TEXT NOT NULL,
            end_at TEXT,
            anonymous_voting INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            archived INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 1
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            meeting_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            name TEXT NOT NULL,
            email TEXT,
            google_id TEXT,
            joined_at TEXT NOT NULL,
            PRIMARY KEY (meeting_id, participant_id),
            FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS votings (
            id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL,
            title TEXT NOT NULL,
            duration_minutes INTEGER NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            has_minerva_vote INTEGER NOT NULL DEFAULT 0,
            minerva_option TEXT,
            minerva_voted_by TEXT,
            minerva_voted_at TEXT,
            created_at TEXT NOT NULL,
            revision INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY (meeting_id) REFERENCES meetings(id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS voting_options (
            voting_id TEXT NOT NULL,
            label TEXT NOT NULL,
            position INTEGER NOT NULL,
            votes INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (voting_id, label),
            FOREIGN KEY (voting_id) REFERENCES votings(id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(pool)
    .await?;

    // The primary key is the one-vote-per-participant guard
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS voting_ledger (
            voting_id TEXT NOT NULL,
            participant_id TEXT NOT NULL,
            option_label TEXT NOT NULL,
            voted_at TEXT NOT NULL,
            PRIMARY KEY (voting_id, participant_id),
            FOREIGN KEY (voting_id) REFERENCES votings(id) ON DELETE CASCADE
        );
        "#,
    )
    .execute(pool)
    .await?;

    // PIN is unique among live meetings only
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_meetings_live_pin
            ON meetings(access_pin) WHERE active = 1 AND archived = 0;
        CREATE INDEX IF NOT EXISTS idx_meetings_created_by ON meetings(created_by);
        CREATE INDEX IF NOT EXISTS idx_votings_meeting ON votings(meeting_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_votings_active_end ON votings(active, end_time);
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Fixed-width RFC 3339 so stored timestamps compare correctly as text.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a stored timestamp.
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Internal(format!("Corrupt timestamp {:?}: {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_as_text() {
        let early = Utc.with_ymd_and_hms(2026, 1, 9, 23, 59, 59).unwrap();
        let late = Utc.with_ymd_and_hms(2026, 1, 10, 0, 0, 0).unwrap();
        assert!(fmt_ts(early) < fmt_ts(late));
        assert_eq!(parse_ts(&fmt_ts(late)).unwrap(), late);
    }

    #[test]
    fn test_parse_ts_rejects_garbage() {
        assert!(parse_ts("yesterday").is_err());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("db.sqlite");
        let pool = init_database(&path).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
