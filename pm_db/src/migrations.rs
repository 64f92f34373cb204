//! ABOUTME: Programmatic schema migrations for the pulp-manager database
//! ABOUTME: Creates job, result, server, and catalog tables with indexes

use pm_core::{Error, Result};
use sqlx::SqlitePool;
use tracing::debug;

/// Run all schema migrations; every statement is idempotent
pub async fn run(pool: &SqlitePool) -> Result<()> {
    debug!("Running database migrations");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS pulp_servers (
            name TEXT PRIMARY KEY,
            base_url TEXT NOT NULL,
            credentials_ref TEXT NOT NULL,
            snapshot_supported INTEGER NOT NULL DEFAULT 0,
            max_concurrent_snapshots INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS pulp_server_repos (
            id TEXT PRIMARY KEY,
            server_name TEXT NOT NULL,
            name TEXT NOT NULL,
            kind TEXT NOT NULL,
            pulp_href TEXT NOT NULL,
            remote_href TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE (server_name, name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS repo_groups (
            name TEXT PRIMARY KEY,
            regex_include TEXT,
            regex_exclude TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS server_repo_groups (
            id TEXT PRIMARY KEY,
            server_name TEXT NOT NULL,
            group_name TEXT NOT NULL,
            schedule TEXT NOT NULL,
            max_concurrent_sync INTEGER NOT NULL,
            max_runtime_secs INTEGER NOT NULL,
            source_server TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT NOT NULL,
            UNIQUE (server_name, group_name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
            id TEXT PRIMARY KEY,
            parent_id TEXT,
            kind TEXT NOT NULL,
            server TEXT NOT NULL,
            state TEXT NOT NULL,
            params TEXT NOT NULL,
            claimed_repos TEXT,
            error TEXT,
            owner TEXT,
            enqueued_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS repo_task_results (
            id TEXT PRIMARY KEY,
            job_id TEXT NOT NULL,
            repo_name TEXT NOT NULL,
            state TEXT NOT NULL,
            task_href TEXT,
            error TEXT,
            started_at TEXT NOT NULL,
            finished_at TEXT NOT NULL,
            FOREIGN KEY (job_id) REFERENCES jobs (id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs (state)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_server_kind ON jobs (server, kind)",
        "CREATE INDEX IF NOT EXISTS idx_jobs_enqueued_at ON jobs (enqueued_at)",
        "CREATE INDEX IF NOT EXISTS idx_repo_results_job ON repo_task_results (job_id)",
        "CREATE INDEX IF NOT EXISTS idx_server_repos_server ON pulp_server_repos (server_name)",
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Migration failed: {}", e)))?;
    }

    debug!("Database migrations completed");
    Ok(())
}
