//! Durable persistence for pending timers.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::info;

use crate::{Payload, StoreError, Timer};

/// Async persistence boundary for pending timers.
///
/// The production implementation is [`SqliteStore`]. The dispatch loop
/// treats every error from this trait as transient and restarts from a
/// fresh fetch; tests substitute fault-injecting wrappers to exercise
/// that path.
///
/// Bulk operations match on `event` plus equality between one top-level
/// payload field and a JSON value (per-user listing and clearing).
#[async_trait]
pub trait TimerStore: Send + Sync {
    /// Durably insert a job, returning the store-assigned id.
    async fn insert(
        &self,
        event: &str,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: &Payload,
    ) -> Result<i64, StoreError>;

    /// The pending job with the smallest expiry below `now + horizon`,
    /// ties broken by ascending id.
    async fn next_before(&self, horizon: Duration) -> Result<Option<Timer>, StoreError>;

    /// Fetch a job by id.
    async fn fetch(&self, id: i64) -> Result<Option<Timer>, StoreError>;

    /// Delete a job. Idempotent: returns false when no row matched.
    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Delete a job and return it. This is the claim the dispatch loop
    /// makes at firing time: exactly one caller gets the row.
    async fn remove(&self, id: i64) -> Result<Option<Timer>, StoreError>;

    /// Replace a job's payload in place. Id, event, created and expiry
    /// are untouched. Returns false when no row matched.
    async fn update_payload(&self, id: i64, payload: &Payload) -> Result<bool, StoreError>;

    /// Number of jobs matching the event/payload-field filter.
    async fn count_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<u64, StoreError>;

    /// Matching jobs ordered by expiry ascending.
    async fn fetch_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
        limit: u32,
    ) -> Result<Vec<Timer>, StoreError>;

    /// Delete matching jobs, returning the ids that were removed.
    async fn delete_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<i64>, StoreError>;
}

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS timers (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        event TEXT NOT NULL,
        created TEXT NOT NULL,
        expiry TEXT NOT NULL,
        payload TEXT NOT NULL DEFAULT '{}'
    );
    CREATE INDEX IF NOT EXISTS idx_timers_expiry ON timers(expiry);
";

/// SQLite-backed timer store.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if missing) the timer database at `url`,
    /// e.g. `sqlite:chime.db`.
    pub async fn open(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!(url, "timer database opened");
        Ok(Self { pool })
    }

    /// Open an in-memory database. Single connection so every query
    /// sees the same data.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }
}

/// Timestamps are stored as fixed-width RFC 3339 text so lexicographic
/// comparison in SQL matches chronological order.
fn encode_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Decode(format!("bad timestamp {text:?}: {e}")))
}

fn decode_payload(text: &str) -> Result<Payload, StoreError> {
    match serde_json::from_str(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(StoreError::Decode(format!(
            "payload is not an object: {other}"
        ))),
        Err(e) => Err(StoreError::Decode(format!("bad payload json: {e}"))),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Timer, StoreError> {
    let created: String = row.try_get("created")?;
    let expiry: String = row.try_get("expiry")?;
    let payload: String = row.try_get("payload")?;
    Ok(Timer {
        id: Some(row.try_get("id")?),
        event: row.try_get("event")?,
        created: decode_ts(&created)?,
        expiry: decode_ts(&expiry)?,
        payload: decode_payload(&payload)?,
    })
}

fn json_path(field: &str) -> String {
    format!("$.{field}")
}

#[async_trait]
impl TimerStore for SqliteStore {
    async fn insert(
        &self,
        event: &str,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: &Payload,
    ) -> Result<i64, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO timers (event, created, expiry, payload)
             VALUES (?1, ?2, ?3, ?4)
             RETURNING id",
        )
        .bind(event)
        .bind(encode_ts(created))
        .bind(encode_ts(expiry))
        .bind(Value::Object(payload.clone()).to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn next_before(&self, horizon: Duration) -> Result<Option<Timer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, event, created, expiry, payload FROM timers
             WHERE expiry < ?1
             ORDER BY expiry ASC, id ASC
             LIMIT 1",
        )
        .bind(encode_ts(Utc::now() + horizon))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn fetch(&self, id: i64) -> Result<Option<Timer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, event, created, expiry, payload FROM timers WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM timers WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove(&self, id: i64) -> Result<Option<Timer>, StoreError> {
        let row = sqlx::query(
            "DELETE FROM timers WHERE id = ?1
             RETURNING id, event, created, expiry, payload",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn update_payload(&self, id: i64, payload: &Payload) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE timers SET payload = ?1 WHERE id = ?2")
            .bind(Value::Object(payload.clone()).to_string())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM timers
             WHERE event = ?1 AND json_extract(payload, ?2) = json_extract(?3, '$')",
        )
        .bind(event)
        .bind(json_path(field))
        .bind(value.to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }

    async fn fetch_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
        limit: u32,
    ) -> Result<Vec<Timer>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, event, created, expiry, payload FROM timers
             WHERE event = ?1 AND json_extract(payload, ?2) = json_extract(?3, '$')
             ORDER BY expiry ASC, id ASC
             LIMIT ?4",
        )
        .bind(event)
        .bind(json_path(field))
        .bind(value.to_string())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn delete_matching(
        &self,
        event: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "DELETE FROM timers
             WHERE event = ?1 AND json_extract(payload, ?2) = json_extract(?3, '$')
             RETURNING id",
        )
        .bind(event)
        .bind(json_path(field))
        .bind(value.to_string())
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}
