use std::{str::FromStr, time::Duration};

use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous},
    Sqlite, QueryBuilder,
};

use super::{SampleStore, SettingsStore, WindowSnapshot};
use crate::{domain::Sample, error::StorageError};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        ts          INTEGER NOT NULL,
        count       INTEGER NOT NULL,
        received_ts INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_ts ON events(ts)",
    r#"
    CREATE TABLE IF NOT EXISTS settings (
        k TEXT PRIMARY KEY,
        v TEXT NOT NULL
    )
    "#,
];

/// Keeps each multi-row insert under SQLite's bound-parameter limit.
const MAX_ROWS_PER_INSERT: usize = 300;

/// Sample and settings store backed by a single SQLite database.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `url` and applies the schema.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        Self::from_pool(pool).await
    }

    /// A private in-memory database. The pool holds exactly one connection for
    /// its whole life, since each sqlite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StorageError> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        for stmt in SCHEMA {
            sqlx::query(stmt).execute(&pool).await?;
        }
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn received_now() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

#[async_trait::async_trait]
impl SampleStore for SqliteStore {
    async fn append(&self, sample: Sample) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO events (ts, count, received_ts) VALUES (?, ?, ?)")
            .bind(sample.timestamp)
            .bind(sample.count)
            .bind(received_now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn append_batch(&self, samples: &[Sample]) -> Result<(), StorageError> {
        if samples.is_empty() {
            return Ok(());
        }

        let received = received_now();
        let mut tx = self.pool.begin().await?;
        for chunk in samples.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder =
                QueryBuilder::<Sqlite>::new("INSERT INTO events (ts, count, received_ts) ");
            builder.push_values(chunk, |mut b, s| {
                b.push_bind(s.timestamp).push_bind(s.count).push_bind(received);
            });

            // Row ids follow the VALUES order, which preserves arrival order for ties.
            builder.build().execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query_range(&self, start: i64, end: i64) -> Result<Vec<Sample>, StorageError> {
        let rows = sqlx::query_as::<_, Sample>(
            r#"
            SELECT ts AS timestamp, count
            FROM events
            WHERE ts >= ?
              AND ts <  ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn most_recent_before(&self, ts: i64) -> Result<Option<Sample>, StorageError> {
        let row = sqlx::query_as::<_, Sample>(
            "SELECT ts AS timestamp, count FROM events WHERE ts < ? ORDER BY ts DESC, id DESC LIMIT 1",
        )
        .bind(ts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn most_recent(&self) -> Result<Option<Sample>, StorageError> {
        let row = sqlx::query_as::<_, Sample>(
            "SELECT ts AS timestamp, count FROM events ORDER BY ts DESC, id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row)
    }

    async fn all(&self) -> Result<Vec<Sample>, StorageError> {
        let rows = sqlx::query_as::<_, Sample>(
            "SELECT ts AS timestamp, count FROM events ORDER BY ts ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn recent(&self, limit: usize) -> Result<Vec<Sample>, StorageError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, Sample>(
            "SELECT ts AS timestamp, count FROM events ORDER BY ts DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn window(&self, start: i64, end: i64) -> Result<WindowSnapshot, StorageError> {
        // Both reads share one transaction so a concurrent insert is seen by
        // both or by neither.
        let mut tx = self.pool.begin().await?;

        let carry_in = sqlx::query_scalar::<_, i64>(
            "SELECT count FROM events WHERE ts < ? ORDER BY ts DESC, id DESC LIMIT 1",
        )
        .bind(start)
        .fetch_optional(&mut *tx)
        .await?;

        let samples = sqlx::query_as::<_, Sample>(
            r#"
            SELECT ts AS timestamp, count
            FROM events
            WHERE ts >= ?
              AND ts <  ?
            ORDER BY ts ASC, id ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(WindowSnapshot { carry_in, samples })
    }
}

#[async_trait::async_trait]
impl SettingsStore for SqliteStore {
    async fn get(&self, key: &str, default: &str) -> Result<String, StorageError> {
        let value = sqlx::query_scalar::<_, String>("SELECT v FROM settings WHERE k = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(value.unwrap_or_else(|| default.to_string()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO settings (k, v) VALUES (?, ?) ON CONFLICT(k) DO UPDATE SET v = excluded.v")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_many(&self, entries: &[(String, String)]) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        for (k, v) in entries {
            sqlx::query("INSERT INTO settings (k, v) VALUES (?, ?) ON CONFLICT(k) DO UPDATE SET v = excluded.v")
                .bind(k.as_str())
                .bind(v.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
