//! Watcher state database backed by SQLite.
//!
//! Persists the set of known senders across restarts. Migration is applied
//! inline via `include_str!` on first open.

use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

/// The watcher's own SQLite state database.
pub struct StateDb {
    pool: SqlitePool,
}

impl StateDb {
    /// Open (or create) the state database at the given path and apply migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or migration fails.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create state db directory {}", parent.display())
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .pragma("trusted_schema", "OFF");

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open state db at {}", path.display()))?;

        let migration_sql = include_str!("../migrations/001_watcher_schema.sql");
        sqlx::raw_sql(migration_sql)
            .execute(&pool)
            .await
            .context("failed to apply watcher schema migration")?;

        Ok(Self { pool })
    }

    /// Record a sender. Returns `true` if the pair was not already stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the database write fails.
    pub async fn insert_sender(
        &self,
        channel: &str,
        sender: &str,
        first_seen: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "INSERT OR IGNORE INTO known_senders (channel, sender, first_seen) VALUES (?1, ?2, ?3)",
        )
        .bind(channel)
        .bind(sender)
        .bind(first_seen.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("failed to insert known sender")?;

        Ok(result.rows_affected() > 0)
    }

    /// Load every stored `(channel, sender)` pair.
    ///
    /// # Errors
    ///
    /// Returns an error if the database query fails.
    pub async fn load_senders(&self) -> anyhow::Result<Vec<(String, String)>> {
        let rows = sqlx::query("SELECT channel, sender FROM known_senders ORDER BY first_seen")
            .fetch_all(&self.pool)
            .await
            .context("failed to load known senders")?;

        rows.iter()
            .map(|row| {
                let channel: String = row.try_get("channel").context("missing channel column")?;
                let sender: String = row.try_get("sender").context("missing sender column")?;
                Ok((channel, sender))
            })
            .collect()
    }

    /// Close the connection pool, flushing the WAL.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
