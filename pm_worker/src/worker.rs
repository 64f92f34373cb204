//! ABOUTME: Job dispatch loop with dedup, claim, and crash recovery
//! ABOUTME: One cancellation context per job; at most one run per work unit

use pm_config::{Catalog, PulpServerSpec, Settings};
use pm_core::{Error, Result};
use pm_db::{Job, JobKind, JobParams, JobState, JobStore, ServerRepoStore};
use pm_pulp::{PollSettings, PulpClient, PulpClientConfig};
use pm_reconcile::{NamingRules, ReconcileOptions, Reconciler};
use pm_snapshot::{SnapshotSettings, SnapshotStep, Snapshotter};
use pm_sync::{match_repos, refresh_server_repos, MatchRule, RepoSyncher, SyncSettings};
use pm_vault::CredentialsResolver;
use regex::Regex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Worker runtime knobs
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Jobs executing concurrently within this worker process
    pub max_concurrent_jobs: usize,
    /// Queue poll interval while idle
    pub queue_poll_interval: Duration,
    /// Pulp task polling behavior handed to every component
    pub poll: PollSettings,
    /// Grace window granted past a sync deadline
    pub deadline_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 8,
            queue_poll_interval: Duration::from_secs(1),
            poll: PollSettings::default(),
            deadline_grace: Duration::from_secs(30),
        }
    }
}

struct Inner {
    store: JobStore,
    repo_cache: ServerRepoStore,
    catalog: RwLock<Arc<Catalog>>,
    settings: Settings,
    resolver: Arc<CredentialsResolver>,
    config: WorkerConfig,
    owner: String,
    active: Mutex<HashMap<String, CancellationToken>>,
}

/// Long-lived job consumer.
///
/// Dequeues FIFO, enforces the single-active-run rule, dispatches to the
/// syncher, snapshotter, or reconciler, and writes every lifecycle
/// transition to the job store before the corresponding Pulp traffic.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        store: JobStore,
        repo_cache: ServerRepoStore,
        catalog: Arc<Catalog>,
        settings: Settings,
        resolver: Arc<CredentialsResolver>,
        config: WorkerConfig,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        let owner = format!("{}-{}", host, std::process::id());

        Self {
            inner: Arc::new(Inner {
                store,
                repo_cache,
                catalog: RwLock::new(catalog),
                settings,
                resolver,
                config,
                owner,
                active: Mutex::new(HashMap::new()),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// Swap in a freshly loaded catalog (config reload)
    pub async fn reload_catalog(&self, catalog: Arc<Catalog>) {
        *self.inner.catalog.write().await = catalog;
        info!("Worker catalog swapped");
    }

    /// Crash recovery: running jobs with no live owner cannot be resumed
    pub async fn recover(&self) -> Result<u64> {
        self.inner.store.fail_orphaned("worker_crashed").await
    }

    /// Request cancellation of a job by id
    pub async fn cancel_job(&self, job_id: &str) -> Result<()> {
        if let Some(token) = self.inner.active.lock().await.get(job_id) {
            info!(job_id = %job_id, "Cancelling running job");
            token.cancel();
            return Ok(());
        }

        // Not running here; a queued job can be finished directly
        match self.inner.store.get(job_id).await? {
            Some(job) if job.state == JobState::Queued => {
                self.inner
                    .store
                    .mark_terminal(job_id, JobState::Canceled, Some("canceled before start"))
                    .await
            }
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("Job {} not found", job_id))),
        }
    }

    /// Number of jobs currently executing in this worker
    pub async fn active_jobs(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Signal shutdown: stop dispatching and cancel in-flight jobs
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Main loop: dispatch until shutdown, then drain in-flight jobs
    pub async fn run(&self) -> Result<()> {
        info!(owner = %self.inner.owner, "Worker starting");
        self.recover().await?;

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            if self.active_jobs().await >= self.inner.config.max_concurrent_jobs {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => {}
                    _ = self.shutdown.cancelled() => break,
                }
                continue;
            }

            match self.process_next().await {
                Ok(Some(_)) => continue,
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.inner.config.queue_poll_interval) => {}
                        _ = self.shutdown.cancelled() => break,
                    }
                }
                Err(err) => {
                    error!(error = %err, "Dispatch iteration failed");
                    tokio::time::sleep(self.inner.config.queue_poll_interval).await;
                }
            }
        }

        info!("Worker draining in-flight jobs");
        for token in self.inner.active.lock().await.values() {
            token.cancel();
        }
        let drain_deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        while self.active_jobs().await > 0 && tokio::time::Instant::now() < drain_deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        info!("Worker stopped");
        Ok(())
    }

    /// One dispatch iteration: dequeue, dedup, claim, spawn.
    ///
    /// Returns the id of the job handled this iteration, if any.
    pub async fn process_next(&self) -> Result<Option<String>> {
        let Some(job) = self.inner.store.next_queued().await? else {
            return Ok(None);
        };
        let job_id = job.id.clone();

        // Another active run covering the same work unit wins; no Pulp
        // traffic happens for the duplicate
        if self.is_duplicate(&job).await? {
            info!(job_id = %job_id, "Duplicate of an active job, skipping");
            self.inner
                .store
                .mark_terminal(&job_id, JobState::SkippedDuplicate, None)
                .await?;
            return Ok(Some(job_id));
        }

        if !self.inner.store.claim(&job_id, &self.inner.owner).await? {
            debug!(job_id = %job_id, "Job no longer claimable");
            return Ok(Some(job_id));
        }

        let token = CancellationToken::new();
        self.inner
            .active
            .lock()
            .await
            .insert(job_id.clone(), token.clone());

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            Inner::execute_and_finish(inner, job, token).await;
        });

        Ok(Some(job_id))
    }

    async fn is_duplicate(&self, job: &Job) -> Result<bool> {
        let active = self.inner.store.list_active(&job.server, job.kind).await?;
        Ok(active.iter().any(|other| {
            if other.id == job.id || other.state != JobState::Running {
                return false;
            }
            match job.kind {
                // Same regex set over the same server is the same work
                JobKind::Sync | JobKind::Snapshot | JobKind::Publish | JobKind::Distribute => {
                    other.params == job.params
                }
                JobKind::Reconcile | JobKind::RepoConfigRegistration => true,
            }
        }))
    }
}

impl Inner {
    #[instrument(skip(inner, job, cancel), fields(job_id = %job.id, kind = job.kind.as_str(), server = %job.server))]
    async fn execute_and_finish(inner: Arc<Inner>, job: Job, cancel: CancellationToken) {
        let job_id = job.id.clone();

        let (state, error) = match Self::execute(&inner, &job, &cancel).await {
            Ok((state, error)) => (state, error),
            Err(err) => {
                let state = match &err {
                    Error::Canceled(_) => JobState::Canceled,
                    Error::Deadline(_) => JobState::TimedOut,
                    _ => JobState::Failed,
                };
                (state, Some(err.to_string()))
            }
        };

        if let Err(err) = inner
            .store
            .mark_terminal(&job_id, state, error.as_deref())
            .await
        {
            error!(job_id = %job_id, error = %err, "Failed to finish job record");
        }

        inner.active.lock().await.remove(&job_id);
        info!(job_id = %job_id, state = state.as_str(), "Job finished");
    }

    async fn execute(
        inner: &Arc<Inner>,
        job: &Job,
        cancel: &CancellationToken,
    ) -> Result<(JobState, Option<String>)> {
        let params = JobParams::from_value(&job.params)?;
        let server = Self::server_spec(inner, &job.server).await?;
        let client = Self::client_for(inner, &server).await?;

        match job.kind {
            JobKind::Sync => {
                let rule = MatchRule::compile(
                    params.regex_include.as_deref(),
                    params.regex_exclude.as_deref(),
                )?;

                let settings =
                    SyncSettings::new(params.max_concurrent_syncs(), params.max_runtime())
                        .with_grace(inner.config.deadline_grace)
                        .with_poll(inner.config.poll.clone());

                let mut syncher = RepoSyncher::new(
                    client,
                    inner.store.clone(),
                    inner.repo_cache.clone(),
                    job.server.clone(),
                    settings,
                );

                if let Some(source_name) = &params.source_pulp_server_name {
                    let source_spec = Self::server_spec(inner, source_name).await?;
                    let source_client = Self::client_for(inner, &source_spec).await?;
                    syncher = syncher.with_source(source_client);
                }

                if let Some(pattern) = &inner.settings.pulp.banned_package_regex {
                    let banned = Regex::new(pattern).map_err(|e| {
                        Error::Config(format!("Invalid banned_package_regex: {}", e))
                    })?;
                    syncher = syncher.with_banned_regex(banned);
                }

                let summary = syncher.run(&job.id, &rule, cancel.clone()).await?;
                Ok((summary.job_state(cancel.is_cancelled()), summary.describe()))
            }

            JobKind::Snapshot | JobKind::Publish | JobKind::Distribute => {
                let rule = MatchRule::compile(
                    params.regex_include.as_deref(),
                    params.regex_exclude.as_deref(),
                )?;
                let repos =
                    refresh_server_repos(&client, &inner.repo_cache, &job.server).await?;
                let targets = match_repos(&repos, &rule);

                let cap = params
                    .max_concurrent_snapshots
                    .or(server.snapshot.as_ref().map(|s| s.max_concurrent_snapshots))
                    .unwrap_or(1);

                let settings = SnapshotSettings::new(cap)
                    .with_signing_service(inner.settings.pulp.deb_signing_service.clone())
                    .with_poll(inner.config.poll.clone());

                let step = match job.kind {
                    JobKind::Publish => SnapshotStep::PublishOnly,
                    JobKind::Distribute => SnapshotStep::DistributeOnly,
                    _ => SnapshotStep::Full,
                };

                let snapshotter = Snapshotter::new(client, inner.store.clone(), settings);
                let summary = snapshotter
                    .run(&job.id, &targets, step, cancel.clone())
                    .await?;
                Ok((summary.job_state(cancel.is_cancelled()), summary.describe()))
            }

            JobKind::Reconcile | JobKind::RepoConfigRegistration => {
                let pulp = &inner.settings.pulp;
                let mut naming = NamingRules::new(&pulp.internal_package_prefix);
                if let (Some(pattern), Some(rule)) = (
                    &pulp.package_name_replacement_pattern,
                    &pulp.package_name_replacement_rule,
                ) {
                    naming = naming.with_replacement(pattern, rule)?;
                }

                let options = ReconcileOptions {
                    naming,
                    deb_signing_service: pulp.deb_signing_service.clone(),
                    default_tls_validation: pulp.remote_tls_validation,
                    poll: inner.config.poll.clone(),
                };

                let reconciler = Reconciler::new(client, inner.store.clone(), options);
                let report = reconciler
                    .run(
                        &job.id,
                        Path::new(&pulp.git_repo_config_dir),
                        cancel.clone(),
                    )
                    .await?;
                Ok((report.job_state(cancel.is_cancelled()), report.describe()))
            }
        }
    }

    async fn server_spec(inner: &Arc<Inner>, name: &str) -> Result<PulpServerSpec> {
        inner
            .catalog
            .read()
            .await
            .find_server(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("Server '{}' is not in the catalog", name)))
    }

    /// One Pulp session per job: resolve credentials, build the client
    async fn client_for(inner: &Arc<Inner>, spec: &PulpServerSpec) -> Result<Arc<PulpClient>> {
        let credentials = inner.resolver.resolve(&spec.credentials).await?;
        let client = PulpClient::new(PulpClientConfig {
            base_url: spec.base_url.clone(),
            username: credentials.username,
            password: credentials.password,
            connect_timeout: inner.settings.remotes.sock_connect_timeout,
            read_timeout: inner.settings.remotes.sock_read_timeout,
            page_size: inner.settings.paging.default_page_size,
        })?;
        Ok(Arc::new(client))
    }
}
