//! ABOUTME: Per-repo publish then distribute under a dated base path
//! ABOUTME: Aborts a repo on first failure; failures never cross repos

use chrono::Utc;
use metrics::gauge;
use pm_core::{Error, Result};
use pm_db::{JobState, JobStore, NewRepoResult, PulpServerRepo, RepoTaskState};
use pm_pulp::{wait_for_task, PollSettings, PulpClient, RepoKind, Task, TaskState};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runtime knobs for one snapshot job
#[derive(Debug, Clone)]
pub struct SnapshotSettings {
    pub max_concurrent_snapshots: usize,
    /// Signing service ensured on deb repositories before publish
    pub deb_signing_service: Option<String>,
    pub poll: PollSettings,
    /// Snapshot date label; today (UTC) when unset
    pub date: Option<String>,
}

impl SnapshotSettings {
    pub fn new(max_concurrent_snapshots: usize) -> Self {
        Self {
            max_concurrent_snapshots: max_concurrent_snapshots.max(1),
            deb_signing_service: None,
            poll: PollSettings::default(),
            date: None,
        }
    }

    pub fn with_signing_service(mut self, service: Option<String>) -> Self {
        self.deb_signing_service = service;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_date(mut self, date: &str) -> Self {
        self.date = Some(date.to_string());
        self
    }

    fn date_label(&self) -> String {
        self.date
            .clone()
            .unwrap_or_else(|| Utc::now().format("%Y-%m-%d").to_string())
    }
}

/// Aggregate accounting for a finished snapshot batch
#[derive(Debug, Clone, Default)]
pub struct SnapshotSummary {
    pub completed: usize,
    pub failed: usize,
    pub canceled: usize,
}

impl SnapshotSummary {
    fn tally(&mut self, state: RepoTaskState) {
        match state {
            RepoTaskState::Completed => self.completed += 1,
            RepoTaskState::Canceled => self.canceled += 1,
            _ => self.failed += 1,
        }
    }

    pub fn job_state(&self, canceled: bool) -> JobState {
        if canceled {
            JobState::Canceled
        } else if self.failed > 0 {
            JobState::Failed
        } else {
            JobState::Succeeded
        }
    }

    pub fn describe(&self) -> Option<String> {
        if self.failed == 0 && self.canceled == 0 {
            return None;
        }
        Some(format!(
            "completed={} failed={} canceled={}",
            self.completed, self.failed, self.canceled
        ))
    }
}

/// Which slice of the snapshot workflow a job covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStep {
    /// Publish then distribute (the full snapshot)
    Full,
    /// Publish only; distribution left for a later distribute job
    PublishOnly,
    /// Distribute the newest existing publication
    DistributeOnly,
}

/// Creates dated snapshot distributions for a set of target repos
pub struct Snapshotter {
    client: Arc<PulpClient>,
    store: JobStore,
    settings: SnapshotSettings,
}

impl Snapshotter {
    pub fn new(client: Arc<PulpClient>, store: JobStore, settings: SnapshotSettings) -> Self {
        Self {
            client,
            store,
            settings,
        }
    }

    /// Run the given workflow slice over all targets.
    ///
    /// Per-repo steps run in order and abort that repo on first failure; up
    /// to `max_concurrent_snapshots` repos are in flight at once.
    #[instrument(skip(self, targets, cancel), fields(job_id = %job_id, targets = targets.len()))]
    pub async fn run(
        &self,
        job_id: &str,
        targets: &[PulpServerRepo],
        step: SnapshotStep,
        cancel: CancellationToken,
    ) -> Result<SnapshotSummary> {
        let date = self.settings.date_label();
        info!(date = %date, "Starting snapshot batch");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_snapshots));
        let mut join_set: JoinSet<RepoTaskState> = JoinSet::new();
        let mut summary = SnapshotSummary::default();

        for repo in targets.iter().cloned() {
            if cancel.is_cancelled() {
                let now = Utc::now();
                let record = NewRepoResult {
                    repo_name: repo.name.clone(),
                    state: RepoTaskState::Canceled,
                    task_href: None,
                    error: None,
                    started_at: now,
                    finished_at: now,
                };
                if let Err(err) = self.store.record_repo_result(job_id, record).await {
                    warn!(repo = %repo.name, error = %err, "Failed to record cancel result");
                }
                summary.tally(RepoTaskState::Canceled);
                continue;
            }

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let client = Arc::clone(&self.client);
            let store = self.store.clone();
            let settings = self.settings.clone();
            let job_id = job_id.to_string();
            let date = date.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let started = Utc::now();
                gauge!("snapshot_inflight").increment(1.0);

                let (state, task_href, error) =
                    snapshot_one(&client, &settings, &repo, &date, step, &cancel).await;

                gauge!("snapshot_inflight").decrement(1.0);

                let record = NewRepoResult {
                    repo_name: repo.name.clone(),
                    state,
                    task_href,
                    error,
                    started_at: started,
                    finished_at: Utc::now(),
                };
                if let Err(err) = store.record_repo_result(&job_id, record).await {
                    warn!(repo = %repo.name, error = %err, "Failed to record snapshot result");
                }
                state
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(state) => summary.tally(state),
                Err(err) => {
                    warn!(error = %err, "Snapshot task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            canceled = summary.canceled,
            "Snapshot batch finished"
        );
        Ok(summary)
    }
}

/// Execute the workflow slice for one repo
async fn snapshot_one(
    client: &PulpClient,
    settings: &SnapshotSettings,
    repo: &PulpServerRepo,
    date: &str,
    step: SnapshotStep,
    cancel: &CancellationToken,
) -> (RepoTaskState, Option<String>, Option<String>) {
    match drive_snapshot(client, settings, repo, date, step, cancel).await {
        Ok(task_href) => (RepoTaskState::Completed, task_href, None),
        Err(Error::Canceled(_)) => (RepoTaskState::Canceled, None, None),
        Err(err) => (RepoTaskState::Failed, None, Some(err.to_string())),
    }
}

async fn drive_snapshot(
    client: &PulpClient,
    settings: &SnapshotSettings,
    repo: &PulpServerRepo,
    date: &str,
    step: SnapshotStep,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let kind = RepoKind::parse(&repo.kind)?;

    let publication_href = match step {
        SnapshotStep::Full | SnapshotStep::PublishOnly => {
            // Signing is performed by Pulp as part of publish; the service
            // must be attached to the repository beforehand
            if kind == RepoKind::Deb {
                if let Some(service) = &settings.deb_signing_service {
                    ensure_signing_service(client, settings, repo, kind, service, cancel).await?;
                }
            }

            debug!(repo = %repo.name, "Publishing repository");
            let task_href = client.create_publication(kind, &repo.pulp_href).await?;
            let task = finish(client, &task_href, &settings.poll, cancel).await?;
            task.created_resource("/publications/")
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Validation(format!("Publish of '{}' produced no publication", repo.name))
                })?
        }
        SnapshotStep::DistributeOnly => {
            let current = client
                .find_repository(kind, &repo.name)
                .await?
                .ok_or_else(|| {
                    Error::NotFound(format!("Repository '{}' not found on Pulp", repo.name))
                })?;
            let version = current.latest_version_href.ok_or_else(|| {
                Error::Validation(format!("Repository '{}' has no version href", repo.name))
            })?;
            client
                .latest_publication(kind, &version)
                .await?
                .map(|publication| publication.pulp_href)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "Repository '{}' has no publication to distribute",
                        repo.name
                    ))
                })?
        }
    };

    if step == SnapshotStep::PublishOnly {
        return Ok(Some(publication_href));
    }

    // Dated, immutable serving path for the frozen publication
    let base_path = format!("{}/{}", repo.name, date);
    let dist_name = format!("{}-{}", repo.name, date);

    match client.find_distribution(kind, &base_path).await? {
        Some(distribution) => {
            if distribution.publication.as_deref() != Some(publication_href.as_str()) {
                let task_href = client
                    .update_distribution(
                        &distribution.pulp_href,
                        &json!({ "publication": publication_href }),
                    )
                    .await?;
                finish(client, &task_href, &settings.poll, cancel).await?;
            }
        }
        None => {
            debug!(repo = %repo.name, base_path = %base_path, "Creating snapshot distribution");
            let task_href = client
                .create_distribution(
                    kind,
                    &json!({
                        "name": dist_name,
                        "base_path": base_path,
                        "publication": publication_href,
                    }),
                )
                .await?;
            finish(client, &task_href, &settings.poll, cancel).await?;
        }
    }

    Ok(Some(publication_href))
}

async fn ensure_signing_service(
    client: &PulpClient,
    settings: &SnapshotSettings,
    repo: &PulpServerRepo,
    kind: RepoKind,
    service: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let current = client
        .find_repository(kind, &repo.name)
        .await?
        .ok_or_else(|| Error::NotFound(format!("Repository '{}' not found on Pulp", repo.name)))?;

    if current.signing_service.as_deref() != Some(service) {
        debug!(repo = %repo.name, "Attaching signing service before publish");
        let task_href = client
            .update_repository(&current.pulp_href, &json!({ "signing_service": service }))
            .await?;
        finish(client, &task_href, &settings.poll, cancel).await?;
    }
    Ok(())
}

async fn finish(
    client: &PulpClient,
    task_href: &str,
    poll: &PollSettings,
    cancel: &CancellationToken,
) -> Result<Task> {
    let task = wait_for_task(client, task_href, poll, None, cancel).await?;
    match task.state {
        TaskState::Completed | TaskState::Skipped => Ok(task),
        TaskState::Canceled => Err(Error::Canceled(format!("task {} canceled", task_href))),
        _ => Err(Error::PulpTask(task.error_payload())),
    }
}
