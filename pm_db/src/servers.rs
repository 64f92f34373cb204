//! ABOUTME: Cache of repositories discovered on each Pulp server
//! ABOUTME: Refreshed by the syncher pre-scan and the reconciler

use chrono::Utc;
use pm_core::{Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::debug;

/// A repository known to exist on a Pulp server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulpServerRepo {
    pub server_name: String,
    pub name: String,
    /// Content plugin kind: deb, rpm, file, python, container
    pub kind: String,
    pub pulp_href: String,
    pub remote_href: Option<String>,
}

/// Store for the per-server repository cache
#[derive(Debug, Clone)]
pub struct ServerRepoStore {
    pool: SqlitePool,
}

impl ServerRepoStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh a repo row; Pulp is authoritative for hrefs
    pub async fn upsert(&self, repo: &PulpServerRepo) -> Result<()> {
        let id = Id::new().to_string();
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO pulp_server_repos
                (id, server_name, name, kind, pulp_href, remote_href, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (server_name, name) DO UPDATE SET
                kind = excluded.kind,
                pulp_href = excluded.pulp_href,
                remote_href = excluded.remote_href,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&id)
        .bind(&repo.server_name)
        .bind(&repo.name)
        .bind(&repo.kind)
        .bind(&repo.pulp_href)
        .bind(&repo.remote_href)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert server repo: {}", e)))?;

        Ok(())
    }

    /// All cached repos for a server, ordered by name
    pub async fn list(&self, server: &str) -> Result<Vec<PulpServerRepo>> {
        let rows = sqlx::query(
            "SELECT * FROM pulp_server_repos WHERE server_name = ? ORDER BY name",
        )
        .bind(server)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list server repos: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| PulpServerRepo {
                server_name: row.get("server_name"),
                name: row.get("name"),
                kind: row.get("kind"),
                pulp_href: row.get("pulp_href"),
                remote_href: row.get("remote_href"),
            })
            .collect())
    }

    /// Drop cached repos Pulp no longer reports
    pub async fn remove_missing(&self, server: &str, present_names: &[String]) -> Result<u64> {
        if present_names.is_empty() {
            let result = sqlx::query("DELETE FROM pulp_server_repos WHERE server_name = ?")
                .bind(server)
                .execute(&self.pool)
                .await
                .map_err(|e| Error::Database(format!("Failed to prune server repos: {}", e)))?;
            return Ok(result.rows_affected());
        }

        let placeholders = vec!["?"; present_names.len()].join(", ");
        let sql = format!(
            "DELETE FROM pulp_server_repos WHERE server_name = ? AND name NOT IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql).bind(server);
        for name in present_names {
            query = query.bind(name);
        }

        let result = query
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to prune server repos: {}", e)))?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            debug!(server = %server, pruned = pruned, "Pruned repos no longer on Pulp");
        }
        Ok(pruned)
    }
}
