//! ABOUTME: Durable job store with the optimistic claim pattern
//! ABOUTME: Job lifecycle transitions and append-only per-repo task results

use chrono::{DateTime, Utc};
use pm_core::{Error, Id, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use tracing::{debug, warn};

/// The closed set of operations the engine executes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Sync,
    Snapshot,
    Publish,
    Distribute,
    Reconcile,
    RepoConfigRegistration,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::Snapshot => "snapshot",
            Self::Publish => "publish",
            Self::Distribute => "distribute",
            Self::Reconcile => "reconcile",
            Self::RepoConfigRegistration => "repo_config_registration",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "sync" => Ok(Self::Sync),
            "snapshot" => Ok(Self::Snapshot),
            "publish" => Ok(Self::Publish),
            "distribute" => Ok(Self::Distribute),
            "reconcile" => Ok(Self::Reconcile),
            "repo_config_registration" => Ok(Self::RepoConfigRegistration),
            other => Err(Error::Validation(format!("Unknown job kind: {}", other))),
        }
    }
}

/// Job lifecycle states; transitions are monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
    /// Terminal without running: another active job covered the same work
    SkippedDuplicate,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::SkippedDuplicate => "skipped_duplicate",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timed_out" => Ok(Self::TimedOut),
            "skipped_duplicate" => Ok(Self::SkippedDuplicate),
            other => Err(Error::Validation(format!("Unknown job state: {}", other))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }

    /// Terminal states reachable without the job ever running
    fn allowed_from_queued(&self) -> bool {
        matches!(self, Self::Canceled | Self::SkippedDuplicate)
    }
}

/// Per-repo outcome states recorded under a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoTaskState {
    Completed,
    Failed,
    TimedOut,
    Canceled,
    SkippedConflict,
    SkippedMissingOnSource,
}

impl RepoTaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
            Self::SkippedConflict => "skipped_conflict",
            Self::SkippedMissingOnSource => "skipped_missing_on_source",
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            "skipped_conflict" => Ok(Self::SkippedConflict),
            "skipped_missing_on_source" => Ok(Self::SkippedMissingOnSource),
            other => Err(Error::Validation(format!(
                "Unknown repo task state: {}",
                other
            ))),
        }
    }
}

/// Durable job record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub parent_id: Option<String>,
    pub kind: JobKind,
    pub server: String,
    pub state: JobState,
    pub params: serde_json::Value,
    pub claimed_repos: Option<Vec<String>>,
    pub error: Option<String>,
    pub owner: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Request to create a new job
#[derive(Debug, Clone)]
pub struct NewJob {
    pub parent_id: Option<String>,
    pub kind: JobKind,
    pub server: String,
    pub params: serde_json::Value,
}

/// Per-repo result appended under a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoTaskResult {
    pub id: String,
    pub job_id: String,
    pub repo_name: String,
    pub state: RepoTaskState,
    pub task_href: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Request to append a repo result
#[derive(Debug, Clone)]
pub struct NewRepoResult {
    pub repo_name: String,
    pub state: RepoTaskState,
    pub task_href: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Job store over the shared pool
///
/// All transitions run as single guarded UPDATE statements so concurrent
/// workers cannot double-claim or double-finish a job.
#[derive(Debug, Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a job in `queued`; returns its id
    pub async fn create(&self, new_job: NewJob) -> Result<String> {
        let id = Id::new();
        // The enqueue instant is the id's timestamp; ordering by either
        // column is equivalent
        let enqueued_at = id.created_at();
        let params = serde_json::to_string(&new_job.params)
            .map_err(|e| Error::Validation(format!("Failed to serialize job params: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO jobs (id, parent_id, kind, server, state, params, enqueued_at)
            VALUES (?, ?, ?, ?, 'queued', ?, ?)
            "#,
        )
        .bind(id.to_string())
        .bind(&new_job.parent_id)
        .bind(new_job.kind.as_str())
        .bind(&new_job.server)
        .bind(&params)
        .bind(enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to create job: {}", e)))?;

        debug!(job_id = %id, kind = new_job.kind.as_str(), server = %new_job.server, "Job enqueued");
        Ok(id.to_string())
    }

    /// Transition queued -> running iff the job is still queued.
    ///
    /// Returns false when the job was already claimed, finished, or skipped;
    /// this is the at-most-one-running guard.
    pub async fn claim(&self, job_id: &str, owner: &str) -> Result<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'running', owner = ?, started_at = ? \
             WHERE id = ? AND state = 'queued'",
        )
        .bind(owner)
        .bind(now.to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to claim job: {}", e)))?;

        Ok(result.rows_affected() == 1)
    }

    /// Transition into a terminal state.
    ///
    /// Allowed from `running` for every terminal state, and from `queued`
    /// only for the states a job can reach without executing. Re-marking the
    /// same terminal state is a no-op; any other transition is a conflict.
    pub async fn mark_terminal(
        &self,
        job_id: &str,
        state: JobState,
        error: Option<&str>,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(Error::Validation(format!(
                "mark_terminal called with non-terminal state '{}'",
                state.as_str()
            )));
        }

        let now = Utc::now();
        let query = if state.allowed_from_queued() {
            "UPDATE jobs SET state = ?, error = ?, finished_at = ? \
             WHERE id = ? AND state IN ('queued', 'running')"
        } else {
            "UPDATE jobs SET state = ?, error = ?, finished_at = ? \
             WHERE id = ? AND state = 'running'"
        };

        let result = sqlx::query(query)
            .bind(state.as_str())
            .bind(error)
            .bind(now.to_rfc3339())
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to finish job: {}", e)))?;

        if result.rows_affected() == 1 {
            debug!(job_id = %job_id, state = state.as_str(), "Job reached terminal state");
            return Ok(());
        }

        // Idempotent when the job already carries the requested terminal state
        let current = self
            .get(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("Job {} not found", job_id)))?;
        if current.state == state {
            return Ok(());
        }

        Err(Error::Conflict(format!(
            "Job {} is '{}', cannot transition to '{}'",
            job_id,
            current.state.as_str(),
            state.as_str()
        )))
    }

    /// Append a per-repo outcome under a job
    pub async fn record_repo_result(&self, job_id: &str, result: NewRepoResult) -> Result<()> {
        let id = Id::new().to_string();

        sqlx::query(
            r#"
            INSERT INTO repo_task_results
                (id, job_id, repo_name, state, task_href, error, started_at, finished_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(job_id)
        .bind(&result.repo_name)
        .bind(result.state.as_str())
        .bind(&result.task_href)
        .bind(&result.error)
        .bind(result.started_at.to_rfc3339())
        .bind(result.finished_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to record repo result: {}", e)))?;

        debug!(
            job_id = %job_id,
            repo = %result.repo_name,
            state = result.state.as_str(),
            "Repo result recorded"
        );
        Ok(())
    }

    /// List results recorded under a job, oldest first
    pub async fn repo_results(&self, job_id: &str) -> Result<Vec<RepoTaskResult>> {
        let rows = sqlx::query(
            "SELECT * FROM repo_task_results WHERE job_id = ? ORDER BY finished_at, repo_name",
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list repo results: {}", e)))?;

        rows.into_iter().map(row_to_repo_result).collect()
    }

    /// Get a job by id
    pub async fn get(&self, job_id: &str) -> Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to get job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Jobs in `queued` or `running` for a (server, kind); used for dedup
    pub async fn list_active(&self, server: &str, kind: JobKind) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs \
             WHERE server = ? AND kind = ? AND state IN ('queued', 'running') \
             ORDER BY enqueued_at",
        )
        .bind(server)
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to list active jobs: {}", e)))?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Most recent jobs, optionally filtered by server
    pub async fn list_recent(&self, server: Option<&str>, limit: u32) -> Result<Vec<Job>> {
        let rows = match server {
            Some(server) => {
                sqlx::query(
                    "SELECT * FROM jobs WHERE server = ? ORDER BY enqueued_at DESC LIMIT ?",
                )
                .bind(server)
                .bind(limit)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY enqueued_at DESC LIMIT ?")
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(|e| Error::Database(format!("Failed to list recent jobs: {}", e)))?;

        rows.into_iter().map(row_to_job).collect()
    }

    /// Oldest queued job, if any (FIFO dispatch order)
    pub async fn next_queued(&self) -> Result<Option<Job>> {
        let row = sqlx::query(
            "SELECT * FROM jobs WHERE state = 'queued' ORDER BY enqueued_at, id LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fetch queued job: {}", e)))?;

        row.map(row_to_job).transpose()
    }

    /// Record the resolved repo set a running job covers
    pub async fn set_claimed_repos(&self, job_id: &str, repos: &[String]) -> Result<()> {
        let json = serde_json::to_string(repos)
            .map_err(|e| Error::Validation(format!("Failed to serialize repo list: {}", e)))?;

        sqlx::query("UPDATE jobs SET claimed_repos = ? WHERE id = ?")
            .bind(&json)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("Failed to set claimed repos: {}", e)))?;

        Ok(())
    }

    /// Union of repo names claimed by other active jobs of the same kind on
    /// the same server; the syncher's per-repo conflict pre-scan
    pub async fn active_claimed_repos(
        &self,
        server: &str,
        kind: JobKind,
        exclude_job: &str,
    ) -> Result<HashSet<String>> {
        let jobs = self.list_active(server, kind).await?;
        let mut claimed = HashSet::new();
        for job in jobs {
            if job.id == exclude_job {
                continue;
            }
            if let Some(repos) = job.claimed_repos {
                claimed.extend(repos);
            }
        }
        Ok(claimed)
    }

    /// Crash recovery: fail every `running` job left behind by a dead worker
    pub async fn fail_orphaned(&self, reason: &str) -> Result<u64> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE jobs SET state = 'failed', error = ?, finished_at = ? \
             WHERE state = 'running'",
        )
        .bind(reason)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| Error::Database(format!("Failed to fail orphaned jobs: {}", e)))?;

        let count = result.rows_affected();
        if count > 0 {
            warn!(count = count, reason = %reason, "Failed orphaned running jobs");
        }
        Ok(count)
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<Job> {
    let params_str: String = row.get("params");
    let params = serde_json::from_str(&params_str)
        .map_err(|e| Error::Validation(format!("Failed to parse job params: {}", e)))?;

    let claimed_repos = row
        .get::<Option<String>, _>("claimed_repos")
        .map(|s| serde_json::from_str::<Vec<String>>(&s))
        .transpose()
        .map_err(|e| Error::Validation(format!("Failed to parse claimed repos: {}", e)))?;

    Ok(Job {
        id: row.get("id"),
        parent_id: row.get("parent_id"),
        kind: JobKind::parse(row.get::<String, _>("kind").as_str())?,
        server: row.get("server"),
        state: JobState::parse(row.get::<String, _>("state").as_str())?,
        params,
        claimed_repos,
        error: row.get("error"),
        owner: row.get("owner"),
        enqueued_at: parse_timestamp(row.get::<String, _>("enqueued_at").as_str())?,
        started_at: parse_optional_timestamp(row.get("started_at"))?,
        finished_at: parse_optional_timestamp(row.get("finished_at"))?,
    })
}

fn row_to_repo_result(row: sqlx::sqlite::SqliteRow) -> Result<RepoTaskResult> {
    Ok(RepoTaskResult {
        id: row.get("id"),
        job_id: row.get("job_id"),
        repo_name: row.get("repo_name"),
        state: RepoTaskState::parse(row.get::<String, _>("state").as_str())?,
        task_href: row.get("task_href"),
        error: row.get("error"),
        started_at: parse_timestamp(row.get::<String, _>("started_at").as_str())?,
        finished_at: parse_timestamp(row.get::<String, _>("finished_at").as_str())?,
    })
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Validation(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}
