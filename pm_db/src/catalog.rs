//! ABOUTME: Persists the fleet catalog into server and group tables
//! ABOUTME: Upserts by natural key; missing entries go inactive, never deleted

use chrono::Utc;
use pm_config::Catalog;
use pm_core::{Error, Id, Result};
use sqlx::SqlitePool;
use std::collections::HashSet;
use tracing::info;

/// Reconcile the catalog tables with a freshly loaded fleet catalog.
///
/// Entries absent from the catalog are marked inactive so historical job
/// records stay attributable to the server and group rows they reference.
pub async fn sync_catalog(pool: &SqlitePool, catalog: &Catalog) -> Result<()> {
    let now = Utc::now().to_rfc3339();

    let mut server_names = HashSet::new();
    let mut group_names = HashSet::new();
    let mut binding_keys = HashSet::new();

    for server in &catalog.servers {
        server_names.insert(server.name.clone());

        sqlx::query(
            r#"
            INSERT INTO pulp_servers
                (name, base_url, credentials_ref, snapshot_supported,
                 max_concurrent_snapshots, active, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 1, ?, ?)
            ON CONFLICT (name) DO UPDATE SET
                base_url = excluded.base_url,
                credentials_ref = excluded.credentials_ref,
                snapshot_supported = excluded.snapshot_supported,
                max_concurrent_snapshots = excluded.max_concurrent_snapshots,
                active = 1,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&server.name)
        .bind(&server.base_url)
        .bind(&server.credentials.name)
        .bind(server.snapshot.is_some())
        .bind(server.snapshot.as_ref().map(|s| s.max_concurrent_snapshots as i64))
        .bind(&now)
        .bind(&now)
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to upsert server: {}", e)))?;

        for binding in &server.repo_groups {
            group_names.insert(binding.group.name.clone());
            binding_keys.insert((server.name.clone(), binding.group.name.clone()));

            sqlx::query(
                r#"
                INSERT INTO repo_groups (name, regex_include, regex_exclude, active, updated_at)
                VALUES (?, ?, ?, 1, ?)
                ON CONFLICT (name) DO UPDATE SET
                    regex_include = excluded.regex_include,
                    regex_exclude = excluded.regex_exclude,
                    active = 1,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&binding.group.name)
            .bind(&binding.group.regex_include)
            .bind(&binding.group.regex_exclude)
            .bind(&now)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to upsert repo group: {}", e)))?;

            sqlx::query(
                r#"
                INSERT INTO server_repo_groups
                    (id, server_name, group_name, schedule, max_concurrent_sync,
                     max_runtime_secs, source_server, active, updated_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?)
                ON CONFLICT (server_name, group_name) DO UPDATE SET
                    schedule = excluded.schedule,
                    max_concurrent_sync = excluded.max_concurrent_sync,
                    max_runtime_secs = excluded.max_runtime_secs,
                    source_server = excluded.source_server,
                    active = 1,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(Id::new().to_string())
            .bind(&server.name)
            .bind(&binding.group.name)
            .bind(&binding.schedule)
            .bind(binding.max_concurrent_sync as i64)
            .bind(binding.max_runtime.as_secs() as i64)
            .bind(&binding.source_server)
            .bind(&now)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to upsert binding: {}", e)))?;
        }
    }

    deactivate_missing(pool, "pulp_servers", "name", &server_names, &now).await?;
    deactivate_missing(pool, "repo_groups", "name", &group_names, &now).await?;
    deactivate_missing_bindings(pool, &binding_keys, &now).await?;

    info!(
        servers = catalog.servers.len(),
        groups = group_names.len(),
        "Catalog persisted"
    );
    Ok(())
}

async fn deactivate_missing(
    pool: &SqlitePool,
    table: &str,
    key: &str,
    present: &HashSet<String>,
    now: &str,
) -> Result<()> {
    let sql = if present.is_empty() {
        format!("UPDATE {} SET active = 0, updated_at = ? WHERE active = 1", table)
    } else {
        let placeholders = vec!["?"; present.len()].join(", ");
        format!(
            "UPDATE {} SET active = 0, updated_at = ? WHERE active = 1 AND {} NOT IN ({})",
            table, key, placeholders
        )
    };

    let mut query = sqlx::query(&sql).bind(now);
    for name in present {
        query = query.bind(name);
    }

    query
        .execute(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to deactivate {} rows: {}", table, e)))?;
    Ok(())
}

async fn deactivate_missing_bindings(
    pool: &SqlitePool,
    present: &HashSet<(String, String)>,
    now: &str,
) -> Result<()> {
    // Bindings key on (server, group), so prune row by row
    let rows = sqlx::query("SELECT server_name, group_name FROM server_repo_groups WHERE active = 1")
        .fetch_all(pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list bindings: {}", e)))?;

    for row in rows {
        use sqlx::Row;
        let server: String = row.get("server_name");
        let group: String = row.get("group_name");
        if !present.contains(&(server.clone(), group.clone())) {
            sqlx::query(
                "UPDATE server_repo_groups SET active = 0, updated_at = ? \
                 WHERE server_name = ? AND group_name = ?",
            )
            .bind(now)
            .bind(&server)
            .bind(&group)
            .execute(pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to deactivate binding: {}", e)))?;
        }
    }
    Ok(())
}
