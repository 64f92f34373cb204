//! ABOUTME: Shared testing utilities and helper functions
//! ABOUTME: Common fixtures and mock Pulp payload builders for all crates

use serde_json::{json, Value};

pub mod fake_pulp;

/// Create a scratch SQLite path inside a temp dir the caller keeps alive
pub fn temp_db_path() -> (tempfile::TempDir, String) {
    let dir = tempfile::TempDir::new().expect("temp dir should be creatable");
    let path = dir
        .path()
        .join("pulp_manager_test.db")
        .to_string_lossy()
        .into_owned();
    (dir, path)
}

/// A small two-server fleet file used across crate tests
pub fn sample_fleet_yaml() -> String {
    r#"
pulp_servers:
  pulp-primary.example.com:
    credentials: pulp_admin
    repo_config_registration:
      schedule: "0 1 * * *"
      max_runtime: 2h
  pulp-secondary.example.com:
    credentials: pulp_admin
    repo_groups:
      external:
        schedule: "30 2 * * *"
        max_concurrent_sync: 2
        max_runtime: 1h
        pulp_master: pulp-primary.example.com
    snapshot_support:
      max_concurrent_snapshots: 2
credentials:
  pulp_admin:
    username: admin
    vault_service_account_mount: secret/pulp/admin
repo_groups:
  external:
    regex_include: "^ext-"
"#
    .to_string()
}

/// Body of a Pulp task resource in the given state
pub fn task_body(href: &str, state: &str) -> Value {
    json!({
        "pulp_href": href,
        "state": state,
        "created_resources": [],
    })
}

/// Task body carrying an error payload (state is "failed")
pub fn failed_task_body(href: &str, description: &str) -> Value {
    json!({
        "pulp_href": href,
        "state": "failed",
        "error": {"description": description},
        "created_resources": [],
    })
}

/// Completed task body listing created resource hrefs
pub fn completed_task_body(href: &str, created: &[&str]) -> Value {
    json!({
        "pulp_href": href,
        "state": "completed",
        "created_resources": created,
    })
}

/// One page of a paginated Pulp collection
pub fn page_body(count: usize, next: Option<&str>, results: Vec<Value>) -> Value {
    json!({
        "count": count,
        "next": next,
        "previous": null,
        "results": results,
    })
}

/// A deb repository resource as Pulp returns it
pub fn repository_body(href: &str, name: &str, remote: Option<&str>) -> Value {
    json!({
        "pulp_href": href,
        "name": name,
        "description": null,
        "remote": remote,
        "latest_version_href": format!("{}versions/1/", href),
    })
}

/// A minimal repository descriptor as found in the git catalog
pub fn descriptor_json(name: &str, url: Option<&str>) -> Value {
    let mut body = json!({
        "name": name,
        "content_repo_type": "deb",
        "description": format!("{} packages", name),
        "owner": "platform-team",
        "base_url": "pool/main",
        "distributions": ["stable"],
        "components": ["main"],
        "architectures": ["amd64"],
    });
    if let Some(url) = url {
        body["url"] = json!(url);
    }
    body
}
