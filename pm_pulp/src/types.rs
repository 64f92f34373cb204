//! ABOUTME: Wire types for the Pulp 3 API surface the engine consumes
//! ABOUTME: Tasks, paginated collections, and per-plugin resource objects

use pm_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Content plugin kinds the fleet manages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoKind {
    Deb,
    Rpm,
    File,
    Python,
    Container,
}

impl RepoKind {
    pub const ALL: [RepoKind; 5] = [
        RepoKind::Deb,
        RepoKind::Rpm,
        RepoKind::File,
        RepoKind::Python,
        RepoKind::Container,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deb => "deb",
            Self::Rpm => "rpm",
            Self::File => "file",
            Self::Python => "python",
            Self::Container => "container",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "deb" => Ok(Self::Deb),
            "rpm" => Ok(Self::Rpm),
            "file" => Ok(Self::File),
            "python" => Ok(Self::Python),
            "container" => Ok(Self::Container),
            other => Err(Error::Validation(format!("Unknown repo kind: {}", other))),
        }
    }

    /// Plugin path segment, e.g. `deb/apt`
    fn plugin_path(&self) -> &'static str {
        match self {
            Self::Deb => "deb/apt",
            Self::Rpm => "rpm/rpm",
            Self::File => "file/file",
            Self::Python => "python/python",
            Self::Container => "container/container",
        }
    }

    pub fn repositories_path(&self) -> String {
        format!("/pulp/api/v3/repositories/{}/", self.plugin_path())
    }

    pub fn remotes_path(&self) -> String {
        format!("/pulp/api/v3/remotes/{}/", self.plugin_path())
    }

    pub fn publications_path(&self) -> String {
        format!("/pulp/api/v3/publications/{}/", self.plugin_path())
    }

    pub fn distributions_path(&self) -> String {
        format!("/pulp/api/v3/distributions/{}/", self.plugin_path())
    }

    /// Content collection holding the plugin's package units
    pub fn content_path(&self) -> String {
        let segment = match self {
            Self::Deb => "deb/packages",
            Self::Rpm => "rpm/packages",
            Self::File => "file/files",
            Self::Python => "python/packages",
            Self::Container => "container/tags",
        };
        format!("/pulp/api/v3/content/{}/", segment)
    }
}

/// Task states reported by Pulp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Completed,
    Failed,
    Canceled,
    Canceling,
    Skipped,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled | Self::Skipped)
    }
}

/// Error payload embedded in a failed task; preserved verbatim
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskError {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A Pulp task resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub pulp_href: String,
    pub state: TaskState,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub created_resources: Vec<String>,
}

impl Task {
    /// The server's error payload, serialized verbatim for job records
    pub fn error_payload(&self) -> String {
        match &self.error {
            Some(err) => {
                if let Some(description) = &err.description {
                    if err.extra.is_empty() {
                        return description.clone();
                    }
                }
                serde_json::to_string(err).unwrap_or_else(|_| "task failed".to_string())
            }
            None => "task failed without error payload".to_string(),
        }
    }

    /// First created resource whose href contains the given fragment
    pub fn created_resource(&self, fragment: &str) -> Option<&str> {
        self.created_resources
            .iter()
            .find(|href| href.contains(fragment))
            .map(String::as_str)
    }
}

/// Reference returned by every mutating call
#[derive(Debug, Clone, Deserialize)]
pub struct TaskRef {
    pub task: String,
}

/// One page of a Pulp collection
#[derive(Debug, Clone, Deserialize)]
pub struct Paginated<T> {
    pub count: u64,
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub previous: Option<String>,
    pub results: Vec<T>,
}

/// A repository resource (any plugin)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub pulp_href: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub latest_version_href: Option<String>,
    #[serde(default)]
    pub signing_service: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A remote resource describing an upstream URL
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Remote {
    pub pulp_href: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub proxy_url: Option<String>,
    #[serde(default)]
    pub tls_validation: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A distribution binding a base path to served content
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Distribution {
    pub pulp_href: String,
    pub name: String,
    pub base_path: String,
    #[serde(default)]
    pub publication: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// An immutable rendered view of a repository version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publication {
    pub pulp_href: String,
    #[serde(default)]
    pub repository_version: Option<String>,
}

/// A content unit; only the package name matters to the engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentUnit {
    pub pulp_href: String,
    #[serde(default)]
    pub package: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ContentUnit {
    pub fn unit_name(&self) -> Option<&str> {
        self.package.as_deref().or(self.name.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_kind_paths() {
        assert_eq!(
            RepoKind::Deb.repositories_path(),
            "/pulp/api/v3/repositories/deb/apt/"
        );
        assert_eq!(RepoKind::Rpm.remotes_path(), "/pulp/api/v3/remotes/rpm/rpm/");
        assert_eq!(
            RepoKind::Deb.content_path(),
            "/pulp/api/v3/content/deb/packages/"
        );
    }

    #[test]
    fn test_task_state_terminality() {
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Canceled.is_terminal());
        assert!(!TaskState::Waiting.is_terminal());
        assert!(!TaskState::Running.is_terminal());
        assert!(!TaskState::Canceling.is_terminal());
    }

    #[test]
    fn test_unknown_task_state_tolerated() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "pulp_href": "/pulp/api/v3/tasks/1/",
            "state": "some-future-state",
        }))
        .unwrap();
        assert_eq!(task.state, TaskState::Unknown);
    }

    #[test]
    fn test_error_payload_verbatim() {
        let task: Task = serde_json::from_value(serde_json::json!({
            "pulp_href": "/pulp/api/v3/tasks/1/",
            "state": "failed",
            "error": {"description": "bad remote"},
        }))
        .unwrap();
        assert_eq!(task.error_payload(), "bad remote");
    }
}
