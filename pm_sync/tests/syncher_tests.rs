//! Integration tests driving the syncher against a simulated Pulp server

use pm_db::{Db, JobKind, JobState, JobStore, NewJob, RepoTaskState, ServerRepoStore};
use pm_pulp::{PollSettings, PulpClient, PulpClientConfig};
use pm_sync::{MatchRule, RepoSyncher, SyncSettings};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_support::{page_body, repository_body, temp_db_path};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, path_regex};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Simulated Pulp task engine shared between sync and task endpoints.
///
/// Tracks how many submitted syncs are in a non-terminal state at any
/// observed instant so tests can assert the concurrency bound.
#[derive(Default)]
struct PulpSim {
    tasks: Mutex<HashMap<String, TaskSim>>,
    inflight: AtomicUsize,
    max_inflight: AtomicUsize,
}

struct TaskSim {
    polls_left: i32,
    failed_with: Option<String>,
    done: bool,
}

impl PulpSim {
    fn submit(&self, repo: &str, polls_left: i32, failed_with: Option<String>) -> String {
        let href = format!("/pulp/api/v3/tasks/{}/", repo);
        self.tasks.lock().unwrap().insert(
            href.clone(),
            TaskSim {
                polls_left,
                failed_with,
                done: false,
            },
        );
        let now = self.inflight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_inflight.fetch_max(now, Ordering::SeqCst);
        href
    }

    fn poll(&self, href: &str) -> Value {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks.get_mut(href).expect("poll of unknown task");
        if task.polls_left > 0 {
            task.polls_left -= 1;
            return json!({"pulp_href": href, "state": "running", "created_resources": []});
        }
        if !task.done {
            task.done = true;
            self.inflight.fetch_sub(1, Ordering::SeqCst);
        }
        match &task.failed_with {
            Some(description) => json!({
                "pulp_href": href,
                "state": "failed",
                "error": {"description": description},
                "created_resources": [],
            }),
            None => json!({
                "pulp_href": href,
                "state": "completed",
                "created_resources": [],
            }),
        }
    }
}

struct SyncEndpoint {
    sim: Arc<PulpSim>,
    /// Poll counts per repo; negative means the task never finishes
    behavior: HashMap<String, (i32, Option<String>)>,
}

impl Respond for SyncEndpoint {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let path = request.url.path();
        let repo = path
            .trim_end_matches("/sync/")
            .rsplit('/')
            .next()
            .unwrap()
            .to_string();
        let (polls, error) = self
            .behavior
            .get(&repo)
            .cloned()
            .unwrap_or((1, None));
        let href = self.sim.submit(&repo, polls, error);
        ResponseTemplate::new(202).set_body_json(json!({ "task": href }))
    }
}

struct TaskEndpoint {
    sim: Arc<PulpSim>,
}

impl Respond for TaskEndpoint {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(self.sim.poll(request.url.path()))
    }
}

/// Mount the repository catalog plus sync/task endpoints on a mock server
async fn mount_pulp(
    server: &MockServer,
    repo_names: &[&str],
    behavior: HashMap<String, (i32, Option<String>)>,
) -> Arc<PulpSim> {
    let sim = Arc::new(PulpSim::default());

    let repos: Vec<Value> = repo_names
        .iter()
        .map(|name| {
            repository_body(
                &format!("/pulp/api/v3/repositories/deb/apt/{}/", name),
                name,
                None,
            )
        })
        .collect();

    Mock::given(method("GET"))
        .and(path("/pulp/api/v3/repositories/deb/apt/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(repos.len(), None, repos)))
        .mount(server)
        .await;

    Mock::given(method("POST"))
        .and(path_regex(r"^/pulp/api/v3/repositories/deb/apt/.+/sync/$"))
        .respond_with(SyncEndpoint {
            sim: Arc::clone(&sim),
            behavior,
        })
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path_regex(r"^/pulp/api/v3/tasks/.+/$"))
        .respond_with(TaskEndpoint {
            sim: Arc::clone(&sim),
        })
        .mount(server)
        .await;

    Mock::given(method("PATCH"))
        .and(path_regex(r"^/pulp/api/v3/tasks/.+/$"))
        .respond_with(ResponseTemplate::new(409))
        .mount(server)
        .await;

    // Remaining content plugins report no repositories
    Mock::given(method("GET"))
        .and(path_regex(r"^/pulp/api/v3/repositories/.+/$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(0, None, vec![])))
        .mount(server)
        .await;

    sim
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

fn fast_poll() -> PollSettings {
    PollSettings {
        initial_interval: Duration::from_millis(10),
        max_interval: Duration::from_millis(20),
        multiplier: 1.5,
        max_consecutive_errors: 3,
    }
}

async fn stores() -> (tempfile::TempDir, JobStore, ServerRepoStore) {
    let (dir, path) = temp_db_path();
    let db = Db::new(&path).await.unwrap();
    (
        dir,
        JobStore::new(db.pool().clone()),
        ServerRepoStore::new(db.pool().clone()),
    )
}

async fn claimed_sync_job(store: &JobStore, server: &str) -> String {
    let job_id = store
        .create(NewJob {
            parent_id: None,
            kind: JobKind::Sync,
            server: server.to_string(),
            params: json!({"regex_include": "^ext-"}),
        })
        .await
        .unwrap();
    assert!(store.claim(&job_id, "test-worker").await.unwrap());
    job_id
}

#[tokio::test]
async fn test_bounded_concurrency_over_ten_repos() {
    let server = MockServer::start().await;
    let names: Vec<String> = (0..10).map(|i| format!("ext-{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let sim = mount_pulp(&server, &name_refs, HashMap::new()).await;

    let (_dir, job_store, repo_cache) = stores().await;
    let job_id = claimed_sync_job(&job_store, "pulp1").await;

    let syncher = RepoSyncher::new(
        client_for(&server),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        SyncSettings::new(2, Duration::from_secs(60)).with_poll(fast_poll()),
    );

    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher
        .run(&job_id, &rule, CancellationToken::new())
        .await
        .unwrap();

    assert!(
        sim.max_inflight.load(Ordering::SeqCst) <= 2,
        "no more than 2 syncs may be in flight, saw {}",
        sim.max_inflight.load(Ordering::SeqCst)
    );
    assert_eq!(summary.job_state(false), JobState::Succeeded);
    assert_eq!(summary.completed, 10);

    let results = job_store.repo_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.state == RepoTaskState::Completed));
}

#[tokio::test]
async fn test_deadline_abandons_slow_tasks() {
    let server = MockServer::start().await;
    // These tasks never leave the running state
    let behavior: HashMap<String, (i32, Option<String>)> = (0..4)
        .map(|i| (format!("ext-{}", i), (i32::MAX, None)))
        .collect();
    let names: Vec<String> = (0..4).map(|i| format!("ext-{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    mount_pulp(&server, &name_refs, behavior).await;

    let (_dir, job_store, repo_cache) = stores().await;
    let job_id = claimed_sync_job(&job_store, "pulp1").await;

    let settings = SyncSettings::new(2, Duration::from_millis(200))
        .with_grace(Duration::from_millis(100))
        .with_poll(fast_poll());
    let syncher = RepoSyncher::new(
        client_for(&server),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        settings,
    );

    let started = std::time::Instant::now();
    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher
        .run(&job_id, &rule, CancellationToken::new())
        .await
        .unwrap();

    // Budget 200ms + grace 100ms, with slack for polling ticks
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(summary.job_state(false), JobState::TimedOut);
    assert!(summary.timed_out >= 1);

    let results = job_store.repo_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().any(|r| r.state == RepoTaskState::TimedOut));
}

#[tokio::test]
async fn test_partial_failure_isolates_repos() {
    let server = MockServer::start().await;
    let mut behavior = HashMap::new();
    behavior.insert("ext-b".to_string(), (1, Some("bad remote".to_string())));
    mount_pulp(&server, &["ext-a", "ext-b", "ext-c"], behavior).await;

    let (_dir, job_store, repo_cache) = stores().await;
    let job_id = claimed_sync_job(&job_store, "pulp1").await;

    let syncher = RepoSyncher::new(
        client_for(&server),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        SyncSettings::new(3, Duration::from_secs(60)).with_poll(fast_poll()),
    );

    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher
        .run(&job_id, &rule, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.job_state(false), JobState::Failed);
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);

    let results = job_store.repo_results(&job_id).await.unwrap();
    let failed = results.iter().find(|r| r.repo_name == "ext-b").unwrap();
    assert_eq!(failed.state, RepoTaskState::Failed);
    assert!(failed.error.as_deref().unwrap().contains("bad remote"));
    assert!(results
        .iter()
        .filter(|r| r.repo_name != "ext-b")
        .all(|r| r.state == RepoTaskState::Completed));
}

#[tokio::test]
async fn test_conflicting_repos_are_skipped() {
    let server = MockServer::start().await;
    mount_pulp(&server, &["ext-a", "ext-b"], HashMap::new()).await;

    let (_dir, job_store, repo_cache) = stores().await;

    // Another running sync job already claims ext-a
    let other = claimed_sync_job(&job_store, "pulp1").await;
    job_store
        .set_claimed_repos(&other, &["ext-a".to_string()])
        .await
        .unwrap();

    let job_id = claimed_sync_job(&job_store, "pulp1").await;
    let syncher = RepoSyncher::new(
        client_for(&server),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        SyncSettings::new(2, Duration::from_secs(60)).with_poll(fast_poll()),
    );

    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher
        .run(&job_id, &rule, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.job_state(false), JobState::Succeeded);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.completed, 1);

    let results = job_store.repo_results(&job_id).await.unwrap();
    let skipped = results.iter().find(|r| r.repo_name == "ext-a").unwrap();
    assert_eq!(skipped.state, RepoTaskState::SkippedConflict);
}

#[tokio::test]
async fn test_targets_missing_on_source_are_skipped() {
    let target = MockServer::start().await;
    mount_pulp(&target, &["ext-a", "ext-b"], HashMap::new()).await;

    // The primary only knows ext-a
    let source = MockServer::start().await;
    let source_repos = vec![repository_body(
        "/pulp/api/v3/repositories/deb/apt/ext-a/",
        "ext-a",
        None,
    )];
    Mock::given(method("GET"))
        .and(path("/pulp/api/v3/repositories/deb/apt/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(1, None, source_repos)))
        .mount(&source)
        .await;
    Mock::given(method("GET"))
        .and(path_regex(r"^/pulp/api/v3/repositories/.+/$"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(0, None, vec![])))
        .mount(&source)
        .await;

    let (_dir, job_store, repo_cache) = stores().await;
    let job_id = claimed_sync_job(&job_store, "pulp1").await;

    let syncher = RepoSyncher::new(
        client_for(&target),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        SyncSettings::new(2, Duration::from_secs(60)).with_poll(fast_poll()),
    )
    .with_source(client_for(&source));

    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher
        .run(&job_id, &rule, CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(summary.job_state(false), JobState::Succeeded);
    let results = job_store.repo_results(&job_id).await.unwrap();
    let missing = results.iter().find(|r| r.repo_name == "ext-b").unwrap();
    assert_eq!(missing.state, RepoTaskState::SkippedMissingOnSource);
    let synced = results.iter().find(|r| r.repo_name == "ext-a").unwrap();
    assert_eq!(synced.state, RepoTaskState::Completed);
}

#[tokio::test]
async fn test_cancellation_stops_submissions() {
    let server = MockServer::start().await;
    let behavior: HashMap<String, (i32, Option<String>)> = (0..4)
        .map(|i| (format!("ext-{}", i), (i32::MAX, None)))
        .collect();
    let names: Vec<String> = (0..4).map(|i| format!("ext-{}", i)).collect();
    let name_refs: Vec<&str> = names.iter().map(String::as_str).collect();
    mount_pulp(&server, &name_refs, behavior).await;

    let (_dir, job_store, repo_cache) = stores().await;
    let job_id = claimed_sync_job(&job_store, "pulp1").await;

    let syncher = RepoSyncher::new(
        client_for(&server),
        job_store.clone(),
        repo_cache,
        "pulp1".to_string(),
        SyncSettings::new(2, Duration::from_secs(60)).with_poll(fast_poll()),
    );

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });

    let rule = MatchRule::compile(Some("^ext-"), None).unwrap();
    let summary = syncher.run(&job_id, &rule, cancel.clone()).await.unwrap();

    assert_eq!(summary.job_state(cancel.is_cancelled()), JobState::Canceled);
    assert!(summary.canceled >= 1);

    let results = job_store.repo_results(&job_id).await.unwrap();
    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| r.state == RepoTaskState::Canceled));
}
