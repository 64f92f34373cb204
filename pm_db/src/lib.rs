//! ABOUTME: Database layer with SQLite, migrations, and stores
//! ABOUTME: Handles all durable state for jobs, results, and the catalog

use pm_core::{Error, Result};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use tracing::{debug, info, instrument};

pub mod catalog;
pub mod jobs;
pub mod migrations;
pub mod params;
pub mod servers;

pub use catalog::sync_catalog;
pub use jobs::{
    Job, JobKind, JobState, JobStore, NewJob, NewRepoResult, RepoTaskResult, RepoTaskState,
};
pub use params::JobParams;
pub use servers::{PulpServerRepo, ServerRepoStore};

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Db {
    pool: SqlitePool,
}

impl Db {
    /// Open (creating if missing) the database at `db_path` and run migrations
    #[instrument(skip(db_path))]
    pub async fn new(db_path: &str) -> Result<Self> {
        info!(path = %db_path, "Initializing database");

        let connect_options = SqliteConnectOptions::new()
            .filename(db_path)
            .journal_mode(SqliteJournalMode::Wal)
            .create_if_missing(true)
            .pragma("foreign_keys", "ON")
            .pragma("synchronous", "NORMAL")
            .pragma("busy_timeout", "30000");

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .min_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| Error::Database(format!("Failed to create connection pool: {}", e)))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        migrations::run(&self.pool).await
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create a Db instance from an existing pool (for testing/reuse)
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<()> {
        debug!("Performing database health check");

        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Health check failed: {}", e)))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_support::temp_db_path;

    #[tokio::test]
    async fn test_database_initialization() {
        let (_dir, path) = temp_db_path();
        let db = Db::new(&path).await.expect("database should initialize");

        db.health_check().await.expect("health check should pass");

        // Migrations are idempotent
        db.migrate().await.expect("second migrate should succeed");
    }
}
