//! Integration tests for catalog reconciliation against a fake Pulp

use pm_db::{Db, JobKind, JobState, JobStore, NewJob, RepoTaskState};
use pm_pulp::{PollSettings, PulpClient, PulpClientConfig};
use pm_reconcile::{NamingRules, ReconcileOptions, Reconciler};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_support::fake_pulp::FakePulp;
use test_support::{descriptor_json, temp_db_path};
use tokio_util::sync::CancellationToken;
use wiremock::MockServer;

fn fast_poll() -> PollSettings {
    PollSettings {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(10),
        multiplier: 1.5,
        max_consecutive_errors: 3,
    }
}

fn client_for(server: &MockServer) -> Arc<PulpClient> {
    Arc::new(
        PulpClient::new(PulpClientConfig {
            base_url: server.uri(),
            username: "admin".to_string(),
            password: "hunter2".to_string(),
            connect_timeout: 5,
            read_timeout: 10,
            page_size: 100,
        })
        .unwrap(),
    )
}

fn options(internal_prefix: &str) -> ReconcileOptions {
    ReconcileOptions {
        naming: NamingRules::new(internal_prefix),
        deb_signing_service: None,
        default_tls_validation: true,
        poll: fast_poll(),
    }
}

async fn store() -> (tempfile::TempDir, JobStore) {
    let (dir, path) = temp_db_path();
    let db = Db::new(&path).await.unwrap();
    (dir, JobStore::new(db.pool().clone()))
}

async fn claimed_job(store: &JobStore) -> String {
    let id = store
        .create(NewJob {
            parent_id: None,
            kind: JobKind::Reconcile,
            server: "pulp-primary".to_string(),
            params: json!({}),
        })
        .await
        .unwrap();
    assert!(store.claim(&id, "test-worker").await.unwrap());
    id
}

fn write_catalog(dir: &std::path::Path) {
    std::fs::write(
        dir.join("nginx.json"),
        serde_json::to_string_pretty(&descriptor_json(
            "nginx",
            Some("https://nginx.org/packages/debian"),
        ))
        .unwrap(),
    )
    .unwrap();
    std::fs::write(
        dir.join("myapp.json"),
        serde_json::to_string_pretty(&descriptor_json("myapp", None)).unwrap(),
    )
    .unwrap();
}

#[tokio::test]
async fn test_reconcile_empty_pulp_then_idempotent() {
    let server = MockServer::start().await;
    let fake = FakePulp::new();
    fake.mount(&server).await;

    let catalog_dir = tempfile::TempDir::new().unwrap();
    write_catalog(catalog_dir.path());

    let (_dir, job_store) = store().await;
    let reconciler = Reconciler::new(client_for(&server), job_store.clone(), options("int-"));

    // First run builds everything: 2 repos, 1 remote, 2 distributions
    let job_id = claimed_job(&job_store).await;
    let report = reconciler
        .run(&job_id, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.job_state(false), JobState::Succeeded);
    assert_eq!(report.applied, 2);
    assert_eq!(report.failed, 0);
    assert!(report.mutations > 0);
    assert_eq!(fake.repository_count(), 2);
    assert_eq!(fake.remote_count(), 1);
    assert_eq!(fake.distribution_count(), 2);

    let names: Vec<String> = fake
        .repositories()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    assert!(names.contains(&"ext-nginx".to_string()));
    assert!(names.contains(&"int-myapp".to_string()));

    let results = job_store.repo_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.state == RepoTaskState::Completed));

    // Second run against a converged catalog performs only reads
    let second_job = claimed_job(&job_store).await;
    let report = reconciler
        .run(&second_job, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.job_state(false), JobState::Succeeded);
    assert_eq!(report.mutations, 0);
    assert_eq!(fake.repository_count(), 2);
    assert_eq!(fake.remote_count(), 1);
    assert_eq!(fake.distribution_count(), 2);
}

#[tokio::test]
async fn test_changed_prefix_renames_instead_of_recreating() {
    let server = MockServer::start().await;
    let fake = FakePulp::new();
    fake.mount(&server).await;

    let catalog_dir = tempfile::TempDir::new().unwrap();
    std::fs::write(
        catalog_dir.path().join("myapp.json"),
        serde_json::to_string(&descriptor_json("myapp", None)).unwrap(),
    )
    .unwrap();

    let (_dir, job_store) = store().await;

    let reconciler = Reconciler::new(client_for(&server), job_store.clone(), options("int-"));
    let job_id = claimed_job(&job_store).await;
    reconciler
        .run(&job_id, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.repository_count(), 1);

    // The internal prefix policy changes; the marker maps the existing repo
    let renamer = Reconciler::new(client_for(&server), job_store.clone(), options("corp-"));
    let job_id = claimed_job(&job_store).await;
    let report = renamer
        .run(&job_id, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.job_state(false), JobState::Succeeded);
    assert_eq!(fake.repository_count(), 1, "rename must not create a second repo");
    let names: Vec<String> = fake
        .repositories()
        .iter()
        .map(|r| r["name"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(names, vec!["corp-myapp".to_string()]);
}

#[tokio::test]
async fn test_unclaimed_managed_repo_reported_as_orphan() {
    let server = MockServer::start().await;
    let fake = FakePulp::new();
    fake.mount(&server).await;
    fake.seed_repository("deb/apt", "ext-legacy");

    let catalog_dir = tempfile::TempDir::new().unwrap();
    write_catalog(catalog_dir.path());

    let (_dir, job_store) = store().await;
    let reconciler = Reconciler::new(client_for(&server), job_store.clone(), options("int-"));

    let job_id = claimed_job(&job_store).await;
    let report = reconciler
        .run(&job_id, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.orphans, vec!["ext-legacy".to_string()]);
    // Orphans are left untouched
    assert!(fake
        .repositories()
        .iter()
        .any(|r| r["name"] == json!("ext-legacy")));
}

#[tokio::test]
async fn test_broken_descriptor_does_not_abort_batch() {
    let server = MockServer::start().await;
    let fake = FakePulp::new();
    fake.mount(&server).await;

    let catalog_dir = tempfile::TempDir::new().unwrap();
    write_catalog(catalog_dir.path());
    std::fs::write(catalog_dir.path().join("broken.json"), "{ not json").unwrap();

    let (_dir, job_store) = store().await;
    let reconciler = Reconciler::new(client_for(&server), job_store.clone(), options("int-"));

    let job_id = claimed_job(&job_store).await;
    let report = reconciler
        .run(&job_id, catalog_dir.path(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.job_state(false), JobState::Failed);
    assert_eq!(report.applied, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(fake.repository_count(), 2);

    let results = job_store.repo_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 3);
    let failed = results
        .iter()
        .find(|r| r.state == RepoTaskState::Failed)
        .unwrap();
    assert_eq!(failed.repo_name, "broken.json");
}
