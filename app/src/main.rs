use clap::{Parser, Subcommand};
use pm_config::{FleetConfig, Settings};
use pm_core::telemetry::{self, LogFormat};
use pm_db::{Db, JobStore, ServerRepoStore};
use pm_sched::Scheduler;
use pm_vault::CredentialsResolver;
use pm_worker::{Worker, WorkerConfig};
use std::{process, sync::Arc};

#[derive(Parser)]
#[command(name = "pulp-manager")]
#[command(about = "Orchestration engine for a fleet of Pulp 3 servers")]
struct Cli {
    /// Path to the INI application settings file
    #[arg(long, env = "PULP_MANAGER_SETTINGS")]
    settings: Option<String>,

    /// Path to the YAML fleet description
    #[arg(long, env = "PULP_MANAGER_FLEET")]
    fleet: String,

    /// SQLite database path
    #[arg(long, env = "PULP_MANAGER_DB", default_value = "pulp_manager.db")]
    database: String,

    /// Environment name; "production" switches logs to JSON
    #[arg(long, env = "PULP_MANAGER_ENV", default_value = "development")]
    environment: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scheduler and worker (default)
    Start,
    /// Load and validate both config files, then exit
    Validate,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    telemetry::init_tracing(
        LogFormat::for_environment(&cli.environment),
        "pulp-manager",
    );

    // Both config files must load cleanly; exit non-zero otherwise
    let settings = match Settings::load_from(cli.settings.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!("Failed to load settings: {}", e);
            process::exit(1);
        }
    };

    let catalog = match FleetConfig::load(&cli.fleet) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            tracing::error!("Failed to load fleet configuration: {}", e);
            process::exit(1);
        }
    };

    if let Some(Commands::Validate) = cli.command {
        tracing::info!(
            servers = catalog.servers.len(),
            "Configuration is valid"
        );
        return;
    }

    tracing::info!("pulp-manager starting");
    if let Err(e) = run(cli, settings, catalog).await {
        tracing::error!("Fatal error: {}", e);
        process::exit(1);
    }
}

async fn run(
    cli: Cli,
    settings: Settings,
    catalog: Arc<pm_config::Catalog>,
) -> pm_core::Result<()> {
    let db = Db::new(&cli.database).await?;
    db.health_check().await?;

    pm_db::sync_catalog(db.pool(), &catalog).await?;

    let store = JobStore::new(db.pool().clone());
    let repo_cache = ServerRepoStore::new(db.pool().clone());
    let resolver = Arc::new(CredentialsResolver::new(&settings.vault.vault_addr)?);

    let worker = Worker::new(
        store.clone(),
        repo_cache,
        Arc::clone(&catalog),
        settings,
        resolver,
        WorkerConfig::default(),
    );

    let scheduler = Scheduler::new(store).await?;
    scheduler.register_catalog(&catalog).await?;
    scheduler.start().await?;

    let worker_handle = {
        let worker = worker.clone();
        tokio::spawn(async move { worker.run().await })
    };

    tracing::info!("pulp-manager running; waiting for shutdown signal");
    wait_for_shutdown().await;

    tracing::info!("Shutting down");
    scheduler.stop().await?;
    worker.shutdown();
    match worker_handle.await {
        Ok(result) => result?,
        Err(e) => tracing::warn!("Worker task ended abnormally: {}", e),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
