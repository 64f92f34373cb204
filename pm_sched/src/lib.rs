//! ABOUTME: Scheduler owning the clock for recurring fleet jobs
//! ABOUTME: One cron timer per binding; missed firings are never replayed

use pm_config::Catalog;
use pm_core::{Error, Result};
use pm_db::{JobKind, JobParams, JobStore, NewJob};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job as CronJob, JobScheduler};
use tracing::{debug, error, info};

/// Evaluates cron schedules from the catalog and enqueues due jobs.
///
/// Timers fire against the local clock; a firing missed while the process
/// was down is simply skipped, the next regular firing applies. Ad-hoc
/// requests from the API layer go through [`Scheduler::enqueue`].
pub struct Scheduler {
    cron: Arc<Mutex<JobScheduler>>,
    store: JobStore,
    timer_ids: Arc<Mutex<Vec<uuid::Uuid>>>,
    running: Arc<AtomicBool>,
}

impl Scheduler {
    pub async fn new(store: JobStore) -> Result<Self> {
        let cron = JobScheduler::new()
            .await
            .map_err(|e| Error::Config(format!("Failed to create cron scheduler: {}", e)))?;

        Ok(Self {
            cron: Arc::new(Mutex::new(cron)),
            store,
            timer_ids: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Enqueue a job immediately; the ad-hoc path used by the API layer
    pub async fn enqueue(
        &self,
        kind: JobKind,
        server: &str,
        params: JobParams,
    ) -> Result<String> {
        self.store
            .create(NewJob {
                parent_id: None,
                kind,
                server: server.to_string(),
                params: params.to_value(),
            })
            .await
    }

    /// Register one timer per binding, replacing any previous registration.
    ///
    /// Called at startup and again on every config reload; the timer set
    /// always reflects exactly the current catalog.
    pub async fn register_catalog(&self, catalog: &Catalog) -> Result<usize> {
        self.clear_timers().await?;

        let mut count = 0;
        for server in &catalog.servers {
            if let Some(registration) = &server.repo_config_registration {
                let params = JobParams {
                    max_runtime_secs: Some(registration.max_runtime.as_secs()),
                    ..Default::default()
                };
                self.add_timer(
                    &registration.schedule,
                    JobKind::RepoConfigRegistration,
                    &server.name,
                    params,
                )
                .await?;
                count += 1;
            }

            for binding in &server.repo_groups {
                let params = JobParams {
                    regex_include: binding.group.regex_include.clone(),
                    regex_exclude: binding.group.regex_exclude.clone(),
                    max_runtime_secs: Some(binding.max_runtime.as_secs()),
                    max_concurrent_syncs: Some(binding.max_concurrent_sync),
                    source_pulp_server_name: binding.source_server.clone(),
                    ..Default::default()
                };
                self.add_timer(&binding.schedule, JobKind::Sync, &server.name, params)
                    .await?;
                count += 1;
            }
        }

        info!(timers = count, "Catalog timers registered");
        Ok(count)
    }

    async fn add_timer(
        &self,
        schedule: &str,
        kind: JobKind,
        server: &str,
        params: JobParams,
    ) -> Result<()> {
        let store = self.store.clone();
        let server = server.to_string();
        let params_value = params.to_value();

        let cron_job = CronJob::new_async(schedule, move |_uuid, _lock| {
            let store = store.clone();
            let server = server.clone();
            let params_value = params_value.clone();

            Box::pin(async move {
                debug!(kind = kind.as_str(), server = %server, "Timer fired, enqueueing job");
                let result = store
                    .create(NewJob {
                        parent_id: None,
                        kind,
                        server: server.clone(),
                        params: params_value,
                    })
                    .await;
                match result {
                    Ok(job_id) => {
                        info!(job_id = %job_id, kind = kind.as_str(), server = %server, "Job enqueued on schedule");
                    }
                    Err(err) => {
                        error!(kind = kind.as_str(), server = %server, error = %err, "Scheduled enqueue failed");
                    }
                }
            })
        })
        .map_err(|e| Error::Config(format!("Failed to create cron timer '{}': {}", schedule, e)))?;

        let timer_id = self
            .cron
            .lock()
            .await
            .add(cron_job)
            .await
            .map_err(|e| Error::Config(format!("Failed to register cron timer: {}", e)))?;
        self.timer_ids.lock().await.push(timer_id);

        debug!(schedule = %schedule, kind = kind.as_str(), "Timer registered");
        Ok(())
    }

    async fn clear_timers(&self) -> Result<()> {
        let mut ids = self.timer_ids.lock().await;
        if ids.is_empty() {
            return Ok(());
        }
        let mut scheduler = self.cron.lock().await;
        for id in ids.drain(..) {
            scheduler
                .remove(&id)
                .await
                .map_err(|e| Error::Config(format!("Failed to remove cron timer: {}", e)))?;
        }
        Ok(())
    }

    /// Start the timer loop
    pub async fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Starting scheduler");
        self.cron
            .lock()
            .await
            .start()
            .await
            .map_err(|e| Error::Config(format!("Failed to start scheduler: {}", e)))?;
        Ok(())
    }

    /// Stop the timer loop
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Stopping scheduler");
        self.cron
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| Error::Config(format!("Failed to stop scheduler: {}", e)))?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
