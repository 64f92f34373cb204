//! ABOUTME: Diff-and-apply state machine converging Pulp to the catalog
//! ABOUTME: Each descriptor applies independently; outcomes recorded per repo

use crate::descriptor::{load_descriptors, RepoDescriptor};
use crate::naming::NamingRules;
use chrono::Utc;
use pm_core::{Error, Result};
use pm_db::{JobState, JobStore, NewRepoResult, RepoTaskState};
use pm_pulp::{wait_for_task, PollSettings, PulpClient, RepoKind, Repository, Task, TaskState};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Policy knobs for a reconcile run
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub naming: NamingRules,
    /// Signing service attached to deb repositories, when configured
    pub deb_signing_service: Option<String>,
    /// TLS validation for remotes without a per-descriptor override
    pub default_tls_validation: bool,
    pub poll: PollSettings,
}

/// Accounting for a finished reconcile run
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    pub applied: usize,
    pub failed: usize,
    /// Managed-namespace repositories no descriptor claims; left untouched
    pub orphans: Vec<String>,
    /// Pulp mutations issued; zero on a converged catalog
    pub mutations: u64,
}

impl ReconcileReport {
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
        if self.failed == 0 {
            return None;
        }
        Some(format!(
            "applied={} failed={} orphans={}",
            self.applied,
            self.failed,
            self.orphans.len()
        ))
    }
}

/// Converges one Pulp primary to the descriptor catalog
pub struct Reconciler {
    client: Arc<PulpClient>,
    store: JobStore,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(client: Arc<PulpClient>, store: JobStore, options: ReconcileOptions) -> Self {
        Self {
            client,
            store,
            options,
        }
    }

    /// Apply every descriptor in the checkout directory.
    ///
    /// One failing descriptor never aborts the batch; the report and the
    /// per-repo results carry the outcome of each.
    #[instrument(skip(self, cancel), fields(job_id = %job_id, dir = %descriptor_dir.display()))]
    pub async fn run(
        &self,
        job_id: &str,
        descriptor_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<ReconcileReport> {
        let descriptors = load_descriptors(descriptor_dir)?;
        info!(count = descriptors.len(), "Reconciling descriptors");

        let mut report = ReconcileReport::default();
        let mut canonical_names: HashSet<String> = HashSet::new();

        for (file, parsed) in descriptors {
            let started = Utc::now();

            if cancel.is_cancelled() {
                self.record(job_id, &file, RepoTaskState::Canceled, None, started)
                    .await;
                continue;
            }

            match parsed {
                Err(err) => {
                    report.failed += 1;
                    self.record(
                        job_id,
                        &file,
                        RepoTaskState::Failed,
                        Some(err.to_string()),
                        started,
                    )
                    .await;
                }
                Ok(descriptor) => {
                    let canonical = self.options.naming.canonical_name(&descriptor);
                    canonical_names.insert(canonical.clone());

                    match self.apply_one(&descriptor, &canonical, &cancel).await {
                        Ok(mutations) => {
                            report.applied += 1;
                            report.mutations += mutations;
                            self.record(job_id, &canonical, RepoTaskState::Completed, None, started)
                                .await;
                        }
                        Err(err) => {
                            warn!(repo = %canonical, error = %err, "Descriptor failed to apply");
                            report.failed += 1;
                            self.record(
                                job_id,
                                &canonical,
                                RepoTaskState::Failed,
                                Some(err.to_string()),
                                started,
                            )
                            .await;
                        }
                    }
                }
            }
        }

        report.orphans = self.find_orphans(&canonical_names).await?;
        if !report.orphans.is_empty() {
            info!(orphans = ?report.orphans, "Managed repositories without descriptors");
        }

        info!(
            applied = report.applied,
            failed = report.failed,
            mutations = report.mutations,
            "Reconcile finished"
        );
        Ok(report)
    }

    /// Apply one descriptor; returns the number of Pulp mutations issued
    async fn apply_one(
        &self,
        descriptor: &RepoDescriptor,
        canonical: &str,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let kind = descriptor.kind()?;
        let mut mutations = 0u64;

        let mut repo = self.client.find_repository(kind, canonical).await?;

        // A changed canonical name maps back via the identity marker; rename
        // instead of create-plus-orphan
        if repo.is_none() {
            if let Some(existing) = self.find_by_marker(kind, &descriptor.name).await? {
                info!(from = %existing.name, to = %canonical, "Renaming repository");
                let task_href = self
                    .client
                    .update_repository(&existing.pulp_href, &json!({ "name": canonical }))
                    .await?;
                self.wait(&task_href, cancel).await?;
                mutations += 1;
                repo = self.client.find_repository(kind, canonical).await?;
            }
        }

        let repo = match repo {
            Some(repo) => repo,
            None => {
                let mut body = json!({
                    "name": canonical,
                    "description": self.options.naming.description_with_marker(descriptor),
                });
                if kind == RepoKind::Deb {
                    if let Some(service) = &self.options.deb_signing_service {
                        body["signing_service"] = json!(service);
                    }
                }
                debug!(repo = %canonical, "Creating repository");
                let task_href = self.client.create_repository(kind, &body).await?;
                self.wait(&task_href, cancel).await?;
                mutations += 1;
                self.client
                    .find_repository(kind, canonical)
                    .await?
                    .ok_or_else(|| {
                        Error::NotFound(format!("Repository '{}' missing after create", canonical))
                    })?
            }
        };

        // Remote: externals track the descriptor settings, internals have none
        if descriptor.is_external() {
            let remote_href = self
                .ensure_remote(kind, canonical, descriptor, &mut mutations, cancel)
                .await?;
            if repo.remote.as_deref() != Some(remote_href.as_str()) {
                let task_href = self
                    .client
                    .update_repository(&repo.pulp_href, &json!({ "remote": remote_href }))
                    .await?;
                self.wait(&task_href, cancel).await?;
                mutations += 1;
            }
        } else if repo.remote.is_some() {
            let task_href = self
                .client
                .update_repository(&repo.pulp_href, &json!({ "remote": Value::Null }))
                .await?;
            self.wait(&task_href, cancel).await?;
            mutations += 1;
        }

        if kind == RepoKind::Deb {
            if let Some(service) = &self.options.deb_signing_service {
                if repo.signing_service.as_deref() != Some(service.as_str()) {
                    let task_href = self
                        .client
                        .update_repository(&repo.pulp_href, &json!({ "signing_service": service }))
                        .await?;
                    self.wait(&task_href, cancel).await?;
                    mutations += 1;
                }
            }
        }

        // Distribution bound to the latest publication under the canonical path
        let version = repo.latest_version_href.clone().ok_or_else(|| {
            Error::Validation(format!("Repository '{}' has no version href", canonical))
        })?;

        let publication_href = match self.client.latest_publication(kind, &version).await? {
            Some(publication) => publication.pulp_href,
            None => {
                debug!(repo = %canonical, "Publishing repository");
                let task_href = self.client.create_publication(kind, &repo.pulp_href).await?;
                let task = self.wait(&task_href, cancel).await?;
                mutations += 1;
                task.created_resource("/publications/")
                    .map(str::to_string)
                    .ok_or_else(|| {
                        Error::Validation(format!(
                            "Publish of '{}' produced no publication",
                            canonical
                        ))
                    })?
            }
        };

        match self.client.find_distribution(kind, canonical).await? {
            Some(distribution) => {
                if distribution.publication.as_deref() != Some(publication_href.as_str()) {
                    let task_href = self
                        .client
                        .update_distribution(
                            &distribution.pulp_href,
                            &json!({ "publication": publication_href }),
                        )
                        .await?;
                    self.wait(&task_href, cancel).await?;
                    mutations += 1;
                }
            }
            None => {
                debug!(repo = %canonical, "Creating distribution");
                let task_href = self
                    .client
                    .create_distribution(
                        kind,
                        &json!({
                            "name": canonical,
                            "base_path": canonical,
                            "publication": publication_href,
                        }),
                    )
                    .await?;
                self.wait(&task_href, cancel).await?;
                mutations += 1;
            }
        }

        Ok(mutations)
    }

    async fn ensure_remote(
        &self,
        kind: RepoKind,
        canonical: &str,
        descriptor: &RepoDescriptor,
        mutations: &mut u64,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let url = descriptor
            .url
            .as_ref()
            .ok_or_else(|| Error::Validation("External descriptor without url".to_string()))?;
        let tls_validation = descriptor
            .tls_validation
            .unwrap_or(self.options.default_tls_validation);

        match self.client.find_remote(kind, canonical).await? {
            Some(remote) => {
                let converged = remote.url == *url
                    && remote.proxy_url == descriptor.proxy
                    && remote.tls_validation == Some(tls_validation);
                if !converged {
                    debug!(remote = %canonical, "Patching drifted remote");
                    let body = remote_body(descriptor, tls_validation, kind, None);
                    let task_href = self.client.update_remote(&remote.pulp_href, &body).await?;
                    self.wait(&task_href, cancel).await?;
                    *mutations += 1;
                }
                Ok(remote.pulp_href)
            }
            None => {
                debug!(remote = %canonical, "Creating remote");
                let body = remote_body(descriptor, tls_validation, kind, Some(canonical));
                let task_href = self.client.create_remote(kind, &body).await?;
                let task = self.wait(&task_href, cancel).await?;
                *mutations += 1;
                match task.created_resource("/remotes/") {
                    Some(href) => Ok(href.to_string()),
                    None => self
                        .client
                        .find_remote(kind, canonical)
                        .await?
                        .map(|remote| remote.pulp_href)
                        .ok_or_else(|| {
                            Error::NotFound(format!("Remote '{}' missing after create", canonical))
                        }),
                }
            }
        }
    }

    async fn find_by_marker(&self, kind: RepoKind, descriptor_name: &str) -> Result<Option<Repository>> {
        let marker = NamingRules::marker(descriptor_name);
        let repos = self.client.list_repositories(kind).await?;
        Ok(repos.into_iter().find(|repo| {
            repo.description
                .as_deref()
                .is_some_and(|description| description.contains(&marker))
        }))
    }

    /// Managed-namespace repositories no descriptor claims
    async fn find_orphans(&self, canonical_names: &HashSet<String>) -> Result<Vec<String>> {
        let mut orphans = Vec::new();
        for kind in RepoKind::ALL {
            for repo in self.client.list_repositories(kind).await? {
                if self.options.naming.is_managed_name(&repo.name)
                    && !canonical_names.contains(&repo.name)
                {
                    orphans.push(repo.name);
                }
            }
        }
        orphans.sort();
        Ok(orphans)
    }

    async fn wait(&self, task_href: &str, cancel: &CancellationToken) -> Result<Task> {
        let task = wait_for_task(&self.client, task_href, &self.options.poll, None, cancel).await?;
        match task.state {
            TaskState::Completed | TaskState::Skipped => Ok(task),
            TaskState::Canceled => Err(Error::Canceled(format!("task {} canceled", task_href))),
            _ => Err(Error::PulpTask(task.error_payload())),
        }
    }

    async fn record(
        &self,
        job_id: &str,
        repo_name: &str,
        state: RepoTaskState,
        error: Option<String>,
        started_at: chrono::DateTime<Utc>,
    ) {
        let record = NewRepoResult {
            repo_name: repo_name.to_string(),
            state,
            task_href: None,
            error,
            started_at,
            finished_at: Utc::now(),
        };
        if let Err(err) = self.store.record_repo_result(job_id, record).await {
            warn!(repo = %repo_name, error = %err, "Failed to record reconcile result");
        }
    }
}

fn remote_body(
    descriptor: &RepoDescriptor,
    tls_validation: bool,
    kind: RepoKind,
    name: Option<&str>,
) -> Value {
    let mut body = json!({
        "url": descriptor.url,
        "proxy_url": descriptor.proxy,
        "tls_validation": tls_validation,
    });
    if let Some(name) = name {
        body["name"] = json!(name);
    }
    if kind == RepoKind::Deb {
        let distributions = descriptor
            .distributions
            .clone()
            .unwrap_or_else(|| vec!["stable".to_string()]);
        body["distributions"] = json!(distributions.join(" "));
        if let Some(components) = &descriptor.components {
            body["components"] = json!(components.join(" "));
        }
        if let Some(architectures) = &descriptor.architectures {
            body["architectures"] = json!(architectures.join(" "));
        }
        if let Some(sync_udebs) = descriptor.sync_udebs {
            body["sync_udebs"] = json!(sync_udebs);
        }
        if let Some(sync_installer) = descriptor.sync_installer {
            body["sync_installer"] = json!(sync_installer);
        }
        if let Some(sync_sources) = descriptor.sync_sources {
            body["sync_sources"] = json!(sync_sources);
        }
    }
    body
}
