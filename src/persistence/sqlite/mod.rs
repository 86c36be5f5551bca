//! This module provides a concrete implementation of the StateRepository using
//! SQLite.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Sqlite, SqlitePool, Transaction,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
};

mod alert_store;
mod app_repository;
mod rows;

use crate::persistence::{error::PersistenceError, traits::StateRepository};

/// How long a connection waits for another writer before reporting busy.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// A concrete implementation of the StateRepository using SQLite.
pub struct SqliteStateRepository {
    /// The SQLite connection pool used for database operations.
    pool: SqlitePool,
    in_memory: bool,
}

impl SqliteStateRepository {
    /// Creates a new instance of SqliteStateRepository with the provided
    /// database URL. This will create the database file if it does not
    /// exist. An in-memory database lives on a single connection that is
    /// never recycled.
    #[tracing::instrument(level = "info")]
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        tracing::debug!(database_url, "Attempting to connect to SQLite database.");
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| PersistenceError::InvalidInput(e.to_string()))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);
        let pool_options = if in_memory {
            SqlitePoolOptions::new().max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new()
        };
        let pool = pool_options.connect_with(options).await.map_err(|e| {
            PersistenceError::OperationFailed(format!("Failed to connect to database: {}", e))
        })?;
        tracing::info!(database_url, "Successfully connected to SQLite database.");
        Ok(Self { pool, in_memory })
    }

    /// Opens a write transaction holding the database lock from the start.
    /// Concurrent writers wait out the busy timeout instead of failing a
    /// read-to-write upgrade halfway through.
    pub(crate) async fn begin_write(&self) -> Result<Transaction<'static, Sqlite>, PersistenceError> {
        self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(db_error("begin transaction"))
    }

    /// Runs database migrations.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        tracing::debug!("Running database migrations.");
        sqlx::migrate!("./migrations").run(&self.pool).await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run database migrations.");
            PersistenceError::MigrationError(e.to_string())
        })?;
        tracing::info!("Database migrations completed successfully.");
        Ok(())
    }

    /// Gets access to the underlying connection pool for advanced operations.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Closes the connection pool gracefully.
    #[tracing::instrument(skip(self), level = "info")]
    pub async fn close(&self) {
        tracing::debug!("Closing SQLite connection pool.");
        self.pool.close().await;
        tracing::info!("SQLite connection pool closed successfully.");
    }

    /// Internal helper to execute a PRAGMA command with error handling
    async fn execute_pragma(&self, pragma: &str, operation: &str) -> Result<(), PersistenceError> {
        sqlx::query(pragma)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, pragma = %pragma, operation = %operation, "Failed to execute PRAGMA command.");
                PersistenceError::OperationFailed(e.to_string())
            })?;
        Ok(())
    }

    /// Performs a WAL checkpoint with the specified mode
    async fn checkpoint_wal(&self, mode: &str) -> Result<(), PersistenceError> {
        let allowed_modes = ["PASSIVE", "TRUNCATE", "RESTART"];
        if !allowed_modes.contains(&mode) {
            return Err(PersistenceError::InvalidInput(format!(
                "Invalid WAL checkpoint mode: {}",
                mode
            )));
        }
        if self.in_memory {
            return Ok(());
        }
        let pragma = format!("PRAGMA wal_checkpoint({mode})");
        self.execute_pragma(&pragma, &format!("WAL checkpoint {mode}")).await
    }

    /// Helper to execute database queries with consistent error handling
    async fn execute_query_with_error_handling<F, T>(
        &self,
        operation: &str,
        query_fn: F,
    ) -> Result<T, PersistenceError>
    where
        F: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        query_fn.await.map_err(|e| map_db_error(operation, e))
    }
}

#[async_trait]
impl StateRepository for SqliteStateRepository {
    #[tracing::instrument(skip(self), level = "debug")]
    async fn flush(&self) -> Result<(), PersistenceError> {
        self.checkpoint_wal("PASSIVE").await
    }

    #[tracing::instrument(skip(self), level = "info")]
    async fn cleanup(&self) -> Result<(), PersistenceError> {
        self.checkpoint_wal("TRUNCATE").await?;
        self.execute_pragma("PRAGMA optimize", "optimize").await
    }
}

/// Maps a driver error onto the persistence taxonomy. Unique violations and
/// busy/locked databases surface as [`PersistenceError::Conflict`] so callers
/// can retry.
pub(crate) fn map_db_error(operation: &str, e: sqlx::Error) -> PersistenceError {
    if let sqlx::Error::Database(db) = &e {
        let busy = matches!(db.code().as_deref(), Some("5" | "6" | "261" | "517"));
        if db.is_unique_violation() || busy {
            tracing::debug!(error = %e, operation = %operation, "Database write conflict.");
            return PersistenceError::Conflict(format!("{operation}: {e}"));
        }
    }
    tracing::error!(error = %e, operation = %operation, "Database operation failed.");
    PersistenceError::OperationFailed(e.to_string())
}

/// Builds a `map_err` adapter for queries run inside a transaction.
pub(crate) fn db_error(operation: &'static str) -> impl Fn(sqlx::Error) -> PersistenceError {
    move |e| map_db_error(operation, e)
}

/// Timestamps are stored as unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| PersistenceError::SerializationError(format!("invalid timestamp {ms}")))
}

pub(crate) fn opt_from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, PersistenceError> {
    ms.map(from_millis).transpose()
}
