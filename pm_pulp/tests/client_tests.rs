//! Integration tests for the Pulp client against a mock server

use pm_pulp::{wait_for_task, PollSettings, PulpClient, PulpClientConfig, RepoKind, Repository, TaskState};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use test_support::{failed_task_body, page_body, repository_body, task_body};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn client_for(server: &MockServer) -> PulpClient {
    PulpClient::new(PulpClientConfig {
        base_url: server.uri(),
        username: "admin".to_string(),
        password: "hunter2".to_string(),
        connect_timeout: 5,
        read_timeout: 10,
        page_size: 2,
    })
    .expect("client should build")
}

fn fast_poll() -> PollSettings {
    PollSettings {
        initial_interval: Duration::from_millis(5),
        max_interval: Duration::from_millis(20),
        multiplier: 2.0,
        max_consecutive_errors: 3,
    }
}

#[tokio::test]
async fn test_list_all_drains_pages() {
    let server = MockServer::start().await;

    let second_page = format!(
        "{}/pulp/api/v3/repositories/deb/apt/?limit=2&offset=2",
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/pulp/api/v3/repositories/deb/apt/"))
        .and(query_param("offset", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
            3,
            None,
            vec![repository_body("/pulp/api/v3/repositories/deb/apt/3/", "ext-c", None)],
        )))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/pulp/api/v3/repositories/deb/apt/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body(
            3,
            Some(&second_page),
            vec![
                repository_body("/pulp/api/v3/repositories/deb/apt/1/", "ext-a", None),
                repository_body("/pulp/api/v3/repositories/deb/apt/2/", "ext-b", None),
            ],
        )))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let repos: Vec<Repository> = client.list_repositories(RepoKind::Deb).await.unwrap();

    assert_eq!(repos.len(), 3);
    assert_eq!(repos[2].name, "ext-c");
}

/// Responds "running" a fixed number of times, then "completed"
struct DelayedCompletion {
    polls_until_done: u32,
    seen: AtomicU32,
    href: String,
}

impl Respond for DelayedCompletion {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst);
        if seen < self.polls_until_done {
            ResponseTemplate::new(200).set_body_json(task_body(&self.href, "running"))
        } else {
            ResponseTemplate::new(200).set_body_json(task_body(&self.href, "completed"))
        }
    }
}

#[tokio::test]
async fn test_wait_for_task_polls_until_completed() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/42/";

    Mock::given(method("GET"))
        .and(path(href))
        .respond_with(DelayedCompletion {
            polls_until_done: 3,
            seen: AtomicU32::new(0),
            href: href.to_string(),
        })
        .mount(&server)
        .await;

    let client = client_for(&server);
    let task = wait_for_task(&client, href, &fast_poll(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(task.state, TaskState::Completed);
}

/// Fails with 503 a fixed number of times, then completes
struct FlakyThenDone {
    failures: u32,
    seen: AtomicU32,
    href: String,
}

impl Respond for FlakyThenDone {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let seen = self.seen.fetch_add(1, Ordering::SeqCst);
        if seen < self.failures {
            ResponseTemplate::new(503)
        } else {
            ResponseTemplate::new(200).set_body_json(task_body(&self.href, "completed"))
        }
    }
}

#[tokio::test]
async fn test_wait_for_task_retries_transient_errors() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/7/";

    Mock::given(method("GET"))
        .and(path(href))
        .respond_with(FlakyThenDone {
            failures: 2,
            seen: AtomicU32::new(0),
            href: href.to_string(),
        })
        .mount(&server)
        .await;

    let client = client_for(&server);
    let task = wait_for_task(&client, href, &fast_poll(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Completed);
}

#[tokio::test]
async fn test_wait_for_task_gives_up_after_error_ceiling() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/8/";

    Mock::given(method("GET"))
        .and(path(href))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = wait_for_task(&client, href, &fast_poll(), None, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_failed_task_carries_error_payload() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/9/";

    Mock::given(method("GET"))
        .and(path(href))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(failed_task_body(href, "bad remote")),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let task = wait_for_task(&client, href, &fast_poll(), None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(task.state, TaskState::Failed);
    assert_eq!(task.error_payload(), "bad remote");
}

#[tokio::test]
async fn test_submit_4xx_surfaces_server_payload() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/pulp/api/v3/repositories/deb/apt/1/sync/"))
        .respond_with(
            ResponseTemplate::new(400).set_body_json(json!({"remote": ["Invalid hyperlink"]})),
        )
        .mount(&server)
        .await;

    let client = client_for(&server);
    let err = client
        .sync_repository("/pulp/api/v3/repositories/deb/apt/1/", &json!({}))
        .await
        .unwrap_err();

    assert!(!err.is_transient());
    assert!(err.to_string().contains("Invalid hyperlink"));
}

#[tokio::test]
async fn test_cancel_tolerates_terminal_task() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/10/";

    Mock::given(method("PATCH"))
        .and(path(href))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let client = client_for(&server);
    client.cancel_task(href).await.expect("409 should be ok");
}

#[tokio::test]
async fn test_cancellation_interrupts_polling() {
    let server = MockServer::start().await;
    let href = "/pulp/api/v3/tasks/11/";

    Mock::given(method("GET"))
        .and(path(href))
        .respond_with(ResponseTemplate::new(200).set_body_json(task_body(href, "running")))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let cancel = CancellationToken::new();
    let poller = {
        let client = client.clone();
        let cancel = cancel.clone();
        let mut settings = fast_poll();
        settings.max_interval = Duration::from_secs(5);
        tokio::spawn(async move {
            wait_for_task(&client, "/pulp/api/v3/tasks/11/", &settings, None, &cancel).await
        })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let result = poller.await.unwrap();
    assert!(matches!(result, Err(pm_core::Error::Canceled(_))));
}
