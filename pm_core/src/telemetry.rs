use std::sync::Once;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

/// Output shape for process logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable multi-line output for interactive use
    Pretty,
    /// One JSON object per line for log shippers
    Json,
}

impl LogFormat {
    /// Map a deployment environment name to its log format
    pub fn for_environment(environment: &str) -> Self {
        if environment.eq_ignore_ascii_case("production") {
            Self::Json
        } else {
            Self::Pretty
        }
    }
}

/// Initialize tracing - safe to call multiple times.
///
/// Without RUST_LOG the filter keeps the engine at info while silencing
/// sqlx's per-query logging.
pub fn init_tracing(format: LogFormat, service: &str) {
    INIT.call_once(|| {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,sqlx=warn"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().json())
                    .with(env_filter)
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(tracing_subscriber::fmt::layer().pretty())
                    .with(env_filter)
                    .init();
            }
        }

        tracing::info!(service = %service, format = ?format, "Tracing initialized");
    });
}
