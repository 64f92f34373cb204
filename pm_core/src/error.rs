/// Core error type for pulp-manager
///
/// The first group mirrors the operational failure kinds surfaced to
/// operators on job records; the second group covers ambient concerns.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    #[error("Pulp unreachable: {0}")]
    PulpUnreachable(String),

    #[error("Pulp task failed: {0}")]
    PulpTask(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Deadline exceeded: {0}")]
    Deadline(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Whether a retry at the request level can help.
    ///
    /// Only connectivity-shaped failures qualify; task failures, config and
    /// credential problems are terminal for the operation that hit them.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::PulpUnreachable(_))
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
