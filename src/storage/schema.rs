use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Sqlite, SqlitePool, Transaction,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::DatabaseError;

/// Schema version this build writes. Stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 3;

// ============================================================================
// Database
// ============================================================================

/// Handle to the feedmailer store. Cheap to clone (shares the pool).
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations
    ///
    /// `":memory:"` opens a private in-memory database shared by the pool.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::Busy` if another process holds the write lock
    /// for longer than the busy timeout, `DatabaseError::Migration` if the
    /// schema could not be brought up to date.
    pub async fn open(path: &str) -> Result<Self, DatabaseError> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout=5000: overlapping runs (cron + manual) wait for the
        // writer instead of failing with SQLITE_BUSY straight away.
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .foreign_keys(true)
            .pragma("busy_timeout", "5000");
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(DatabaseError::from_sqlx)?;
        let db = Self { pool };
        db.migrate().await.map_err(|e| match e {
            DatabaseError::Busy => DatabaseError::Busy,
            other => DatabaseError::Migration(other.to_string()),
        })?;
        Ok(db)
    }

    /// Currently applied schema version.
    pub async fn schema_version(&self) -> Result<i64, DatabaseError> {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// Apply pending migrations in order within one transaction.
    ///
    /// Each step is gated on `user_version`, so re-running against a current
    /// schema is a no-op. `user_version` is part of the database header and
    /// commits or rolls back together with the DDL.
    async fn migrate(&self) -> Result<(), DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let (mut version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;

        if version > SCHEMA_VERSION {
            return Err(DatabaseError::Migration(format!(
                "database schema version {} is newer than supported version {}",
                version, SCHEMA_VERSION
            )));
        }

        if version < 1 {
            create_tables(&mut tx).await?;
            version = 1;
        }

        if version < 2 {
            sqlx::query(
                "ALTER TABLE subscriptions ADD COLUMN desc_length INTEGER NOT NULL DEFAULT 300",
            )
            .execute(&mut *tx)
            .await?;
            version = 2;
        }

        if version < 3 {
            sqlx::query(
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_subscriptions_feed_email ON subscriptions(feed_id, email)",
            )
            .execute(&mut *tx)
            .await?;
            // Covers the delivery selection: filter by feed, compare coalesced timestamps
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_articles_feed_published ON articles(feed_id, published_at, created_at)",
            )
            .execute(&mut *tx)
            .await?;
            version = 3;
        }

        // PRAGMA does not accept bound parameters
        sqlx::query(&format!("PRAGMA user_version = {}", version))
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        tracing::debug!(version = version, "Database schema up to date");
        Ok(())
    }
}

async fn create_tables(tx: &mut Transaction<'_, Sqlite>) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS feeds (
            feed_id INTEGER PRIMARY KEY NOT NULL,
            title TEXT NOT NULL,
            url TEXT UNIQUE NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER,
            refreshed_at INTEGER
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS subscriptions (
            subscription_id INTEGER PRIMARY KEY NOT NULL,
            email TEXT NOT NULL,
            feed_id INTEGER NOT NULL REFERENCES feeds(feed_id),
            digest BOOLEAN NOT NULL DEFAULT FALSE,
            attempted_delivery_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS articles (
            article_id INTEGER PRIMARY KEY NOT NULL,
            title TEXT,
            url TEXT NOT NULL,
            author TEXT,
            feed_id INTEGER NOT NULL REFERENCES feeds(feed_id),
            category TEXT,
            description TEXT,
            published_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER,
            UNIQUE(feed_id, url)
        )
    "#,
    )
    .execute(&mut **tx)
    .await?;

    Ok(())
}
