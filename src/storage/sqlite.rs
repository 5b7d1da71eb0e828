use async_trait::async_trait;
use chrono::Utc;
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::{debug, info};

use super::{write_order, StorageBackend, SQLITE_LOCATION};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::state::SessionState;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// SQLite-backed storage of session states
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    location: String,
}

impl SqliteBackend {
    /// Open (or create) the database file and run migrations
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        Self::from_pool(pool).await
    }

    /// In-memory database, mainly for tests.
    ///
    /// A single connection keeps every query on the same memory database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to open in-memory database: {}", e),
            })?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> StorageResult<Self> {
        let backend = Self {
            pool,
            location: SQLITE_LOCATION.to_string(),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Use a different location identifier.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for health checks
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    fn location(&self) -> &str {
        &self.location
    }

    async fn write(&self, state: &SessionState) -> StorageResult<()> {
        if state.session_id.trim().is_empty() {
            return Err(StorageError::Query {
                message: "session id must not be empty".to_string(),
            });
        }
        let payload = serde_json::to_string(state)?;

        // The WHERE clause on the upsert keeps a newer stored copy in place.
        let result = sqlx::query(
            r#"
            INSERT INTO session_states
                (session_id, timestamp_micros, last_completed_phase, progress_percentage, payload, written_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(session_id) DO UPDATE SET
                timestamp_micros = excluded.timestamp_micros,
                last_completed_phase = excluded.last_completed_phase,
                progress_percentage = excluded.progress_percentage,
                payload = excluded.payload,
                written_at = excluded.written_at
            WHERE excluded.timestamp_micros >= session_states.timestamp_micros
            "#,
        )
        .bind(&state.session_id)
        .bind(write_order(state))
        .bind(&state.last_completed_phase)
        .bind(state.progress_percentage)
        .bind(&payload)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                session_id = %state.session_id,
                location = %self.location,
                "Stored copy is newer; write skipped"
            );
        }

        Ok(())
    }

    async fn read(&self, session_id: &str) -> StorageResult<Option<SessionState>> {
        let row: Option<SessionStateRow> = sqlx::query_as(
            r#"
            SELECT session_id, timestamp_micros, payload
            FROM session_states
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_state(&self.location)).transpose()
    }
}

// Internal row type for SQLx mapping
#[derive(sqlx::FromRow)]
struct SessionStateRow {
    session_id: String,
    timestamp_micros: i64,
    payload: String,
}

impl SessionStateRow {
    fn into_state(self, location: &str) -> StorageResult<SessionState> {
        let state: SessionState =
            serde_json::from_str(&self.payload).map_err(|e| StorageError::Corrupt {
                location: location.to_string(),
                message: e.to_string(),
            })?;

        if state.session_id != self.session_id || write_order(&state) != self.timestamp_micros {
            return Err(StorageError::Corrupt {
                location: location.to_string(),
                message: format!("payload does not match row key {}", self.session_id),
            });
        }

        Ok(state)
    }
}
