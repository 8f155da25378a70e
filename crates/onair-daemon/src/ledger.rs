//! Durable append-only record of every submitted request.
//!
//! The ledger is the source of truth for pending requests: whenever the
//! in-memory moderation view and this table disagree, the `sent` rows here
//! win.  Rows are never deleted; a decided request keeps its row as a
//! permanent record.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use thiserror::Error;

use onair_proto::model::{Genre, Platform, Request, RequestStatus};

const MIGRATION: &str = "CREATE TABLE IF NOT EXISTS requests (
    id TEXT PRIMARY KEY,
    genre TEXT NOT NULL,
    platform TEXT NOT NULL,
    track TEXT NOT NULL,
    username TEXT NOT NULL,
    message TEXT NOT NULL,
    title TEXT NOT NULL,
    user_id TEXT NOT NULL,
    status TEXT NOT NULL,
    duration_secs INTEGER,
    timestamp INTEGER NOT NULL,
    started_at INTEGER
)";

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("duplicate request id {0}")]
    DuplicateId(String),

    #[error("request {0} not found or already decided")]
    NotFound(String),

    #[error("unreadable ledger row {id}: {reason}")]
    InvalidRow { id: String, reason: String },

    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

/// A decided row as served by the playback history endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PlaybackRecord {
    #[serde(flatten)]
    pub request: Request,
    pub duration_secs: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
}

pub struct Ledger {
    pool: SqlitePool,
}

impl Ledger {
    pub async fn open(path: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory ledger for tests.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(MIGRATION).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Record a freshly submitted request.  A duplicate id is rejected so
    /// at-least-once submission cannot produce two rows.
    pub async fn insert_request(&self, request: &Request) -> Result<()> {
        sqlx::query(
            "INSERT INTO requests
             (id, genre, platform, track, username, message, title, user_id, status, timestamp)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.id)
        .bind(request.genre.as_str())
        .bind(request.platform.as_str())
        .bind(&request.track)
        .bind(&request.username)
        .bind(&request.message)
        .bind(&request.title)
        .bind(&request.user_id)
        .bind(request.status.as_str())
        .bind(request.timestamp.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                LedgerError::DuplicateId(request.id.clone())
            }
            _ => e.into(),
        })?;
        Ok(())
    }

    pub async fn mark_approved(
        &self,
        id: &str,
        duration_secs: u32,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'approved', duration_secs = ?, started_at = ?
             WHERE id = ? AND status = 'sent'",
        )
        .bind(i64::from(duration_secs))
        .bind(started_at.timestamp_millis())
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn mark_rejected(&self, id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE requests SET status = 'rejected' WHERE id = ? AND status = 'sent'")
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        Ok(())
    }

    /// All undecided rows, oldest first.
    pub async fn select_pending(&self) -> Result<Vec<Request>> {
        let rows = sqlx::query(
            "SELECT id, genre, platform, track, username, message, title, user_id, status, timestamp
             FROM requests WHERE status = 'sent' ORDER BY timestamp ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_request).collect()
    }

    /// Most recently decided playback row for a genre.
    pub async fn latest_for_genre(&self, genre: Genre) -> Result<Option<PlaybackRecord>> {
        let row = sqlx::query(
            "SELECT id, genre, platform, track, username, message, title, user_id, status,
                    timestamp, duration_secs, started_at
             FROM requests WHERE genre = ? AND status = 'approved'
             ORDER BY timestamp DESC, id DESC LIMIT 1",
        )
        .bind(genre.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref()
            .map(|row| {
                let request = row_to_request(row)?;
                let duration_secs: Option<i64> = row.get("duration_secs");
                let started_at: Option<i64> = row.get("started_at");
                Ok(PlaybackRecord {
                    request,
                    duration_secs: duration_secs.map(|d| d.max(0) as u32),
                    started_at: started_at.and_then(DateTime::from_timestamp_millis),
                })
            })
            .transpose()
    }
}

fn row_to_request(row: &sqlx::sqlite::SqliteRow) -> Result<Request> {
    let id: String = row.get("id");
    let invalid = |reason: String| LedgerError::InvalidRow {
        id: id.clone(),
        reason,
    };

    let genre = row
        .get::<String, _>("genre")
        .parse::<Genre>()
        .map_err(|e| invalid(e.to_string()))?;
    let platform = row
        .get::<String, _>("platform")
        .parse::<Platform>()
        .map_err(|e| invalid(e.to_string()))?;
    let status = row
        .get::<String, _>("status")
        .parse::<RequestStatus>()
        .map_err(|e| invalid(e.to_string()))?;
    let timestamp = DateTime::from_timestamp_millis(row.get::<i64, _>("timestamp"))
        .ok_or_else(|| invalid("invalid timestamp".to_string()))?;

    Ok(Request {
        id: id.clone(),
        genre,
        platform,
        track: row.get("track"),
        username: row.get("username"),
        message: row.get("message"),
        title: row.get("title"),
        user_id: row.get("user_id"),
        status,
        timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn request(id: &str, offset_secs: i64) -> Request {
        Request {
            id: id.to_string(),
            genre: Genre::Rock,
            platform: Platform::Youtube,
            track: format!("https://www.youtube.com/watch?v={}", id),
            username: "ada".into(),
            message: "please".into(),
            title: format!("Track {}", id),
            user_id: "u1".into(),
            status: RequestStatus::Sent,
            timestamp: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[tokio::test]
    async fn test_insert_and_select_pending_in_order() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.insert_request(&request("b", 10)).await.unwrap();
        ledger.insert_request(&request("a", 0)).await.unwrap();

        let pending = ledger.select_pending().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(pending[0].status, RequestStatus::Sent);
    }

    #[tokio::test]
    async fn test_duplicate_id_is_rejected() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.insert_request(&request("a", 0)).await.unwrap();
        let err = ledger.insert_request(&request("a", 5)).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateId(id) if id == "a"));
    }

    #[tokio::test]
    async fn test_mark_approved_removes_from_pending() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.insert_request(&request("a", 0)).await.unwrap();

        ledger.mark_approved("a", 240, Utc::now()).await.unwrap();
        assert!(ledger.select_pending().await.unwrap().is_empty());

        let record = ledger
            .latest_for_genre(Genre::Rock)
            .await
            .unwrap()
            .expect("approved row should exist");
        assert_eq!(record.request.id, "a");
        assert_eq!(record.request.status, RequestStatus::Approved);
        assert_eq!(record.duration_secs, Some(240));
        assert!(record.started_at.is_some());
    }

    #[tokio::test]
    async fn test_decided_row_cannot_be_decided_again() {
        let ledger = Ledger::in_memory().await.unwrap();
        ledger.insert_request(&request("a", 0)).await.unwrap();
        ledger.mark_rejected("a").await.unwrap();

        let err = ledger.mark_approved("a", 100, Utc::now()).await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
        let err = ledger.mark_rejected("a").await.unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_latest_for_genre_ignores_other_genres() {
        let ledger = Ledger::in_memory().await.unwrap();
        let mut other = request("h", 0);
        other.genre = Genre::Hiphop;
        ledger.insert_request(&other).await.unwrap();
        ledger.mark_approved("h", 90, Utc::now()).await.unwrap();

        assert!(ledger.latest_for_genre(Genre::Rock).await.unwrap().is_none());
        assert!(ledger
            .latest_for_genre(Genre::Hiphop)
            .await
            .unwrap()
            .is_some());
    }
}
