//! ABOUTME: Session-authenticated Pulp 3 client with pagination support
//! ABOUTME: Typed endpoint helpers for repositories, remotes, and distributions

use pm_core::{Error, Result};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

pub mod tasks;
pub mod types;

pub use tasks::{wait_for_task, PollSettings};
pub use types::{
    ContentUnit, Distribution, Paginated, Publication, Remote, RepoKind, Repository, Task,
    TaskError, TaskRef, TaskState,
};

/// Connection parameters for one Pulp server session
#[derive(Clone)]
pub struct PulpClientConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    /// Socket connect timeout in seconds
    pub connect_timeout: u64,
    /// Socket read timeout in seconds
    pub read_timeout: u64,
    pub page_size: u32,
}

impl std::fmt::Debug for PulpClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PulpClientConfig")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"[REDACTED]")
            .field("page_size", &self.page_size)
            .finish()
    }
}

/// HTTP client for one Pulp server
///
/// Every mutating call returns a task href; callers follow it with
/// [`wait_for_task`] until the task reaches a terminal state.
#[derive(Debug, Clone)]
pub struct PulpClient {
    http: Client,
    base_url: Url,
    username: String,
    password: String,
    page_size: u32,
}

impl PulpClient {
    pub fn new(config: PulpClientConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| Error::Config(format!("Invalid Pulp URL '{}': {}", config.base_url, e)))?;

        let http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout))
            .timeout(Duration::from_secs(config.read_timeout))
            .user_agent("pulp-manager/0.1")
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            username: config.username,
            password: config.password,
            page_size: config.page_size,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        if path.starts_with("http://") || path.starts_with("https://") {
            return Url::parse(path)
                .map_err(|e| Error::Validation(format!("Invalid URL '{}': {}", path, e)));
        }
        self.base_url
            .join(path)
            .map_err(|e| Error::Validation(format!("Invalid Pulp path '{}': {}", path, e)))
    }

    /// GET a JSON resource
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.resolve(path)?;
        let response = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Validation(format!("Failed to parse Pulp response: {}", e)))
    }

    /// Drain every page of a collection
    pub async fn list_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>> {
        let mut url = self.resolve(path)?;
        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("limit", &self.page_size.to_string());
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }

        let mut results = Vec::new();
        let mut next: Option<String> = Some(url.to_string());

        while let Some(page_url) = next {
            let page: Paginated<T> = self.get_json(&page_url).await?;
            results.extend(page.results);
            next = page.next;
        }

        Ok(results)
    }

    /// POST a mutation; returns the task href to follow
    pub async fn post_task(&self, path: &str, body: &Value) -> Result<String> {
        let url = self.resolve(path)?;
        debug!(url = %url, "POST to Pulp");
        let response = self
            .http
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let task_ref: TaskRef = response
            .json()
            .await
            .map_err(|e| Error::Validation(format!("Pulp did not return a task ref: {}", e)))?;
        Ok(task_ref.task)
    }

    /// PATCH a mutation; returns the task href to follow
    pub async fn patch_task(&self, href: &str, body: &Value) -> Result<String> {
        let url = self.resolve(href)?;
        debug!(url = %url, "PATCH to Pulp");
        let response = self
            .http
            .patch(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response).await?;
        let task_ref: TaskRef = response
            .json()
            .await
            .map_err(|e| Error::Validation(format!("Pulp did not return a task ref: {}", e)))?;
        Ok(task_ref.task)
    }

    /// Fetch a task resource
    pub async fn get_task(&self, task_href: &str) -> Result<Task> {
        self.get_json(task_href).await
    }

    /// Request cancellation of a task; a conflict means it already finished
    pub async fn cancel_task(&self, task_href: &str) -> Result<()> {
        let url = self.resolve(task_href)?;
        let response = self
            .http
            .patch(url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&serde_json::json!({"state": "canceled"}))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::CONFLICT {
            debug!(task = %task_href, "Task already terminal, cancel ignored");
            return Ok(());
        }
        check_status(response).await?;
        Ok(())
    }

    // --- typed endpoint helpers ---

    pub async fn list_repositories(&self, kind: RepoKind) -> Result<Vec<Repository>> {
        self.list_all(&kind.repositories_path(), &[]).await
    }

    pub async fn find_repository(&self, kind: RepoKind, name: &str) -> Result<Option<Repository>> {
        let matches: Vec<Repository> = self
            .list_all(&kind.repositories_path(), &[("name", name.to_string())])
            .await?;
        Ok(matches.into_iter().find(|r| r.name == name))
    }

    pub async fn create_repository(&self, kind: RepoKind, body: &Value) -> Result<String> {
        self.post_task(&kind.repositories_path(), body).await
    }

    pub async fn update_repository(&self, repo_href: &str, body: &Value) -> Result<String> {
        self.patch_task(repo_href, body).await
    }

    /// Submit a sync; `body` carries the remote override when one is attached
    pub async fn sync_repository(&self, repo_href: &str, body: &Value) -> Result<String> {
        self.post_task(&format!("{}sync/", repo_href), body).await
    }

    /// Remove content units from a repository, creating a new version
    pub async fn modify_repository(&self, repo_href: &str, remove: &[String]) -> Result<String> {
        self.post_task(
            &format!("{}modify/", repo_href),
            &serde_json::json!({"remove_content_units": remove}),
        )
        .await
    }

    pub async fn find_remote(&self, kind: RepoKind, name: &str) -> Result<Option<Remote>> {
        let matches: Vec<Remote> = self
            .list_all(&kind.remotes_path(), &[("name", name.to_string())])
            .await?;
        Ok(matches.into_iter().find(|r| r.name == name))
    }

    pub async fn create_remote(&self, kind: RepoKind, body: &Value) -> Result<String> {
        self.post_task(&kind.remotes_path(), body).await
    }

    pub async fn update_remote(&self, remote_href: &str, body: &Value) -> Result<String> {
        self.patch_task(remote_href, body).await
    }

    pub async fn create_publication(&self, kind: RepoKind, repo_href: &str) -> Result<String> {
        self.post_task(
            &kind.publications_path(),
            &serde_json::json!({"repository": repo_href}),
        )
        .await
    }

    /// Most recent publication for a repository version, if any
    pub async fn latest_publication(
        &self,
        kind: RepoKind,
        repository_version: &str,
    ) -> Result<Option<Publication>> {
        let mut publications: Vec<Publication> = self
            .list_all(
                &kind.publications_path(),
                &[("repository_version", repository_version.to_string())],
            )
            .await?;
        Ok(publications.pop())
    }

    pub async fn find_distribution(
        &self,
        kind: RepoKind,
        base_path: &str,
    ) -> Result<Option<Distribution>> {
        let matches: Vec<Distribution> = self
            .list_all(
                &kind.distributions_path(),
                &[("base_path", base_path.to_string())],
            )
            .await?;
        Ok(matches.into_iter().find(|d| d.base_path == base_path))
    }

    pub async fn create_distribution(&self, kind: RepoKind, body: &Value) -> Result<String> {
        self.post_task(&kind.distributions_path(), body).await
    }

    pub async fn update_distribution(&self, dist_href: &str, body: &Value) -> Result<String> {
        self.patch_task(dist_href, body).await
    }

    /// Content units present in a repository version
    pub async fn list_content(
        &self,
        kind: RepoKind,
        repository_version: &str,
    ) -> Result<Vec<ContentUnit>> {
        self.list_all(
            &kind.content_path(),
            &[("repository_version", repository_version.to_string())],
        )
        .await
    }
}

fn transport_error(err: reqwest::Error) -> Error {
    Error::PulpUnreachable(err.to_string())
}

async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        warn!(status = %status, "Pulp server error");
        Err(Error::PulpUnreachable(format!("{}: {}", status, body)))
    } else {
        // 4xx payloads are recorded verbatim on job results
        Err(Error::PulpTask(if body.is_empty() {
            status.to_string()
        } else {
            body
        }))
    }
}
