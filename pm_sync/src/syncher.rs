//! ABOUTME: Bounded-concurrency driver submitting Pulp syncs for a repo set
//! ABOUTME: Enforces the wall-clock deadline and records per-repo outcomes

use crate::banned::purge_banned_packages;
use crate::matcher::{match_repos, MatchRule};
use chrono::Utc;
use metrics::{counter, gauge};
use pm_core::{Deadline, Error, Result};
use pm_db::{JobKind, JobState, JobStore, NewRepoResult, PulpServerRepo, RepoTaskState, ServerRepoStore};
use pm_pulp::{wait_for_task, PollSettings, PulpClient, RepoKind, TaskState};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Runtime knobs for one sync job
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Worker pool size: in-flight sync submissions never exceed this
    pub max_concurrent_syncs: usize,
    /// Wall-clock budget over the whole batch
    pub max_runtime: Duration,
    /// Extra time in-flight tasks get once the budget elapses
    pub grace: Duration,
    pub poll: PollSettings,
}

impl SyncSettings {
    pub fn new(max_concurrent_syncs: usize, max_runtime: Duration) -> Self {
        Self {
            max_concurrent_syncs: max_concurrent_syncs.max(1),
            max_runtime,
            grace: Duration::from_secs(30),
            poll: PollSettings::default(),
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }
}

/// Aggregate accounting for a finished sync batch
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub completed: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub canceled: usize,
    pub skipped: usize,
}

impl SyncSummary {
    fn tally(&mut self, state: RepoTaskState) {
        match state {
            RepoTaskState::Completed => self.completed += 1,
            RepoTaskState::Failed => self.failed += 1,
            RepoTaskState::TimedOut => self.timed_out += 1,
            RepoTaskState::Canceled => self.canceled += 1,
            RepoTaskState::SkippedConflict | RepoTaskState::SkippedMissingOnSource => {
                self.skipped += 1
            }
        }
    }

    /// Aggregate job state: canceled and deadline trump per-repo failures
    pub fn job_state(&self, canceled: bool) -> JobState {
        if canceled {
            JobState::Canceled
        } else if self.timed_out > 0 {
            JobState::TimedOut
        } else if self.failed > 0 {
            JobState::Failed
        } else {
            JobState::Succeeded
        }
    }

    /// Human-readable error for the job record, if anything went wrong
    pub fn describe(&self) -> Option<String> {
        if self.failed == 0 && self.timed_out == 0 && self.canceled == 0 {
            return None;
        }
        Some(format!(
            "completed={} failed={} timed_out={} canceled={} skipped={}",
            self.completed, self.failed, self.timed_out, self.canceled, self.skipped
        ))
    }
}

/// Drives syncs for one server's matched repo set
pub struct RepoSyncher {
    client: Arc<PulpClient>,
    /// Primary server the targets must also exist on, when syncing a secondary
    source: Option<Arc<PulpClient>>,
    store: JobStore,
    repo_cache: ServerRepoStore,
    server: String,
    settings: SyncSettings,
    banned: Option<Regex>,
}

impl RepoSyncher {
    pub fn new(
        client: Arc<PulpClient>,
        store: JobStore,
        repo_cache: ServerRepoStore,
        server: String,
        settings: SyncSettings,
    ) -> Self {
        Self {
            client,
            source: None,
            store,
            repo_cache,
            server,
            settings,
            banned: None,
        }
    }

    pub fn with_source(mut self, source: Arc<PulpClient>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_banned_regex(mut self, banned: Regex) -> Self {
        self.banned = Some(banned);
        self
    }

    /// Run the batch to completion and return the aggregate summary.
    ///
    /// The job record itself is owned by the worker; this only appends
    /// per-repo results and the claimed-repo set.
    #[instrument(skip(self, rule, cancel), fields(server = %self.server, job_id = %job_id))]
    pub async fn run(
        &self,
        job_id: &str,
        rule: &MatchRule,
        cancel: CancellationToken,
    ) -> Result<SyncSummary> {
        let repos = self.refresh_repo_cache().await?;
        let mut targets = match_repos(&repos, rule);
        info!(matched = targets.len(), "Resolved sync targets");

        let mut summary = SyncSummary::default();

        // Targets must also exist on the source server when one is configured
        if let Some(source) = &self.source {
            let source_names = self.source_repo_names(source).await?;
            let (present, missing): (Vec<_>, Vec<_>) = targets
                .into_iter()
                .partition(|repo| source_names.contains(&repo.name));
            for repo in missing {
                self.record_skip(job_id, &repo, RepoTaskState::SkippedMissingOnSource)
                    .await;
                summary.tally(RepoTaskState::SkippedMissingOnSource);
            }
            targets = present;
        }

        // Repos already claimed by another active sync job are conflicts
        let claimed = self
            .store
            .active_claimed_repos(&self.server, JobKind::Sync, job_id)
            .await?;
        if !claimed.is_empty() {
            let (free, conflicting): (Vec<_>, Vec<_>) = targets
                .into_iter()
                .partition(|repo| !claimed.contains(&repo.name));
            for repo in conflicting {
                self.record_skip(job_id, &repo, RepoTaskState::SkippedConflict)
                    .await;
                summary.tally(RepoTaskState::SkippedConflict);
            }
            targets = free;
        }

        let names: Vec<String> = targets.iter().map(|r| r.name.clone()).collect();
        self.store.set_claimed_repos(job_id, &names).await?;

        let deadline =
            Deadline::new(self.settings.max_runtime).with_grace(self.settings.grace);
        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_syncs));
        let mut join_set: JoinSet<RepoTaskState> = JoinSet::new();

        // Submissions go out in lexicographic order; completions may not
        for repo in targets {
            if cancel.is_cancelled() {
                self.record_skip_state(job_id, &repo, RepoTaskState::Canceled, None)
                    .await;
                summary.tally(RepoTaskState::Canceled);
                continue;
            }
            if deadline.expired() {
                self.record_skip_state(
                    job_id,
                    &repo,
                    RepoTaskState::TimedOut,
                    Some("deadline expired before submission".to_string()),
                )
                .await;
                summary.tally(RepoTaskState::TimedOut);
                continue;
            }

            let permit = tokio::select! {
                permit = semaphore.clone().acquire_owned() => {
                    match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    }
                }
                _ = cancel.cancelled() => {
                    self.record_skip_state(job_id, &repo, RepoTaskState::Canceled, None)
                        .await;
                    summary.tally(RepoTaskState::Canceled);
                    continue;
                }
                _ = tokio::time::sleep(deadline.remaining()) => {
                    self.record_skip_state(
                        job_id,
                        &repo,
                        RepoTaskState::TimedOut,
                        Some("deadline expired awaiting a pool slot".to_string()),
                    )
                    .await;
                    summary.tally(RepoTaskState::TimedOut);
                    continue;
                }
            };

            let client = Arc::clone(&self.client);
            let store = self.store.clone();
            let job_id = job_id.to_string();
            let banned = self.banned.clone();
            let poll = self.settings.poll.clone();
            let deadline = deadline.clone();
            let cancel = cancel.clone();

            join_set.spawn(async move {
                let _permit = permit;
                let started = Utc::now();
                counter!("sync_submissions_total").increment(1);
                gauge!("sync_inflight").increment(1.0);

                let (state, task_href, error) =
                    drive_sync(&client, &repo, banned.as_ref(), &poll, &deadline, &cancel).await;

                gauge!("sync_inflight").decrement(1.0);

                let record = NewRepoResult {
                    repo_name: repo.name.clone(),
                    state,
                    task_href,
                    error,
                    started_at: started,
                    finished_at: Utc::now(),
                };
                if let Err(err) = store.record_repo_result(&job_id, record).await {
                    warn!(repo = %repo.name, error = %err, "Failed to record repo result");
                }
                state
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(state) => summary.tally(state),
                Err(err) => {
                    warn!(error = %err, "Sync task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            completed = summary.completed,
            failed = summary.failed,
            timed_out = summary.timed_out,
            canceled = summary.canceled,
            skipped = summary.skipped,
            "Sync batch finished"
        );
        Ok(summary)
    }

    async fn refresh_repo_cache(&self) -> Result<Vec<PulpServerRepo>> {
        refresh_server_repos(&self.client, &self.repo_cache, &self.server).await
    }

    async fn source_repo_names(&self, source: &PulpClient) -> Result<HashSet<String>> {
        let mut names = HashSet::new();
        for kind in RepoKind::ALL {
            for repo in source.list_repositories(kind).await? {
                names.insert(repo.name);
            }
        }
        Ok(names)
    }

    async fn record_skip(&self, job_id: &str, repo: &PulpServerRepo, state: RepoTaskState) {
        self.record_skip_state(job_id, repo, state, None).await;
    }

    async fn record_skip_state(
        &self,
        job_id: &str,
        repo: &PulpServerRepo,
        state: RepoTaskState,
        error: Option<String>,
    ) {
        let now = Utc::now();
        let record = NewRepoResult {
            repo_name: repo.name.clone(),
            state,
            task_href: None,
            error,
            started_at: now,
            finished_at: now,
        };
        if let Err(err) = self.store.record_repo_result(job_id, record).await {
            warn!(repo = %repo.name, error = %err, "Failed to record skip result");
        }
    }
}

/// Refresh the cached repo list for a server from live Pulp state.
///
/// Pulp is authoritative: new repos are upserted, vanished repos pruned.
/// Used by the syncher pre-scan and by the worker when resolving snapshot
/// targets.
pub async fn refresh_server_repos(
    client: &PulpClient,
    repo_cache: &ServerRepoStore,
    server: &str,
) -> Result<Vec<PulpServerRepo>> {
    let mut present = Vec::new();
    for kind in RepoKind::ALL {
        let repos = client.list_repositories(kind).await?;
        for repo in repos {
            let row = PulpServerRepo {
                server_name: server.to_string(),
                name: repo.name,
                kind: kind.as_str().to_string(),
                pulp_href: repo.pulp_href,
                remote_href: repo.remote,
            };
            repo_cache.upsert(&row).await?;
            present.push(row);
        }
    }

    let names: Vec<String> = present.iter().map(|r| r.name.clone()).collect();
    repo_cache.remove_missing(server, &names).await?;
    debug!(server = %server, count = present.len(), "Repo cache refreshed");
    Ok(present)
}

/// Submit one sync and follow it to a terminal per-repo outcome
async fn drive_sync(
    client: &PulpClient,
    repo: &PulpServerRepo,
    banned: Option<&Regex>,
    poll: &PollSettings,
    deadline: &Deadline,
    cancel: &CancellationToken,
) -> (RepoTaskState, Option<String>, Option<String>) {
    let body = match &repo.remote_href {
        Some(remote) => serde_json::json!({ "remote": remote }),
        None => serde_json::json!({}),
    };

    let task_href = match client.sync_repository(&repo.pulp_href, &body).await {
        Ok(href) => href,
        // Submission rejections carry the server payload verbatim
        Err(err) => return (RepoTaskState::Failed, None, Some(err.to_string())),
    };

    match wait_for_task(client, &task_href, poll, Some(deadline), cancel).await {
        Ok(task) => match task.state {
            TaskState::Completed | TaskState::Skipped => {
                if let Some(banned) = banned {
                    if let (Ok(kind), Some(version)) = (
                        RepoKind::parse(&repo.kind),
                        task.created_resource("/versions/"),
                    ) {
                        if let Err(err) = purge_banned_packages(
                            client,
                            &repo.pulp_href,
                            kind,
                            version,
                            banned,
                            poll,
                            cancel,
                        )
                        .await
                        {
                            return (
                                RepoTaskState::Failed,
                                Some(task_href),
                                Some(format!("banned package removal failed: {}", err)),
                            );
                        }
                    }
                }
                (RepoTaskState::Completed, Some(task_href), None)
            }
            TaskState::Failed => (
                RepoTaskState::Failed,
                Some(task_href),
                Some(task.error_payload()),
            ),
            TaskState::Canceled => (RepoTaskState::Canceled, Some(task_href), None),
            other => (
                RepoTaskState::Failed,
                Some(task_href),
                Some(format!("task ended in unexpected state {:?}", other)),
            ),
        },
        Err(Error::Canceled(_)) => {
            // Best effort: ask Pulp to stop the outstanding task
            if let Err(err) = client.cancel_task(&task_href).await {
                warn!(task = %task_href, error = %err, "Failed to cancel Pulp task");
            }
            (RepoTaskState::Canceled, Some(task_href), None)
        }
        Err(Error::Deadline(_)) => (
            RepoTaskState::TimedOut,
            Some(task_href),
            Some("runtime budget exhausted".to_string()),
        ),
        Err(err) => (RepoTaskState::Failed, Some(task_href), Some(err.to_string())),
    }
}
