//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles application settings (INI) and the fleet catalog (YAML)

use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use pm_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

pub mod duration;
pub mod fleet;

pub use duration::parse_max_runtime;
pub use fleet::{
    Catalog, CredentialsSpec, FleetConfig, GroupBinding, PulpServerSpec, RegistrationSpec,
    RepoGroupSpec, SnapshotSupport,
};

/// Environment variable naming the INI settings file
pub const SETTINGS_PATH_VAR: &str = "PULP_MANAGER_SETTINGS";
/// Environment variable naming the YAML fleet file
pub const FLEET_PATH_VAR: &str = "PULP_MANAGER_FLEET";

/// Main application settings, one struct per INI section
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Settings {
    pub ca: CaSettings,
    pub auth: AuthSettings,
    #[validate(nested)]
    pub pulp: PulpSettings,
    #[validate(nested)]
    pub redis: RedisSettings,
    #[validate(nested)]
    pub remotes: RemoteSettings,
    #[validate(nested)]
    pub paging: PagingSettings,
    pub vault: VaultSettings,
}

/// TLS trust configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CaSettings {
    pub root_ca_file_path: Option<String>,
}

/// Authentication settings consumed by the API layer
///
/// The engine itself never reads these; they are parsed and validated here so
/// a bad file fails at startup rather than on first login.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthSettings {
    pub method: String,
    pub use_ssl: bool,
    pub ldap_servers: String,
    pub base_dn: String,
    pub default_domain: String,
    pub jwt_algorithm: String,
    pub jwt_token_lifetime_mins: u32,
    pub admin_group: String,
    pub require_jwt_auth: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            method: "ldap".to_string(),
            use_ssl: true,
            ldap_servers: String::new(),
            base_dn: String::new(),
            default_domain: String::new(),
            jwt_algorithm: "HS256".to_string(),
            jwt_token_lifetime_mins: 60,
            admin_group: String::new(),
            require_jwt_auth: true,
        }
    }
}

/// Engine-facing Pulp behavior with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PulpSettings {
    /// Name of the signing service attached to deb repositories
    pub deb_signing_service: Option<String>,
    /// Package names matching this regex are removed after sync
    pub banned_package_regex: Option<String>,
    /// Comma-separated domains treated as internal when classifying hosts
    pub internal_domains: Option<String>,
    /// Git URL holding the declarative repository catalog
    pub git_repo_config: Option<String>,
    /// Checkout directory the reconciler reads descriptors from
    pub git_repo_config_dir: String,
    /// Fallback Pulp admin password when no vault mount is configured
    pub password: Option<String>,
    /// Prefix applied to internal repository names
    pub internal_package_prefix: String,
    /// Regex applied to descriptor names before prefixing
    pub package_name_replacement_pattern: Option<String>,
    /// Replacement rule paired with the pattern above
    pub package_name_replacement_rule: Option<String>,
    pub remote_tls_validation: bool,
    pub use_https_for_sync: bool,
}

impl Default for PulpSettings {
    fn default() -> Self {
        Self {
            deb_signing_service: None,
            banned_package_regex: None,
            internal_domains: None,
            git_repo_config: None,
            git_repo_config_dir: "./repo-config".to_string(),
            password: None,
            internal_package_prefix: "int-".to_string(),
            package_name_replacement_pattern: None,
            package_name_replacement_rule: None,
            remote_tls_validation: true,
            use_https_for_sync: true,
        }
    }
}

impl fmt::Debug for PulpSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulpSettings")
            .field("deb_signing_service", &self.deb_signing_service)
            .field("banned_package_regex", &self.banned_package_regex)
            .field("git_repo_config_dir", &self.git_repo_config_dir)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .field("internal_package_prefix", &self.internal_package_prefix)
            .field("remote_tls_validation", &self.remote_tls_validation)
            .field("use_https_for_sync", &self.use_https_for_sync)
            .finish()
    }
}

/// Redis connection parameters
///
/// Retained for compatibility with existing deployments; the engine queues
/// jobs through the durable jobs table instead.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct RedisSettings {
    pub host: String,
    #[validate(range(min = 1, max = 65535))]
    pub port: u16,
    pub db: u8,
    #[validate(range(min = 1, max = 10000))]
    pub max_page_size: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            max_page_size: 1000,
        }
    }
}

/// Per-request socket timeouts for remote HTTP calls, in seconds
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct RemoteSettings {
    #[validate(range(min = 1, max = 300))]
    pub sock_connect_timeout: u64,
    #[validate(range(min = 1, max = 3600))]
    pub sock_read_timeout: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            sock_connect_timeout: 10,
            sock_read_timeout: 60,
        }
    }
}

/// Pagination bounds for Pulp collection listing
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
#[serde(default)]
pub struct PagingSettings {
    #[validate(range(min = 1, max = 10000))]
    pub default_page_size: u32,
    #[validate(range(min = 1, max = 10000))]
    pub max_page_size: u32,
}

impl Default for PagingSettings {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_page_size: 1000,
        }
    }
}

/// Secret store location
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct VaultSettings {
    pub vault_addr: String,
    pub repo_secret_namespace: String,
}

impl Default for VaultSettings {
    fn default() -> Self {
        Self {
            vault_addr: "http://127.0.0.1:8200".to_string(),
            repo_secret_namespace: "secret".to_string(),
        }
    }
}

impl Settings {
    /// Load settings from the file named by `PULP_MANAGER_SETTINGS` plus
    /// environment overrides
    pub fn load() -> Result<Self> {
        let path = std::env::var(SETTINGS_PATH_VAR).ok();
        Self::load_from(path.as_deref())
    }

    /// Load settings from an explicit file path (None uses pure defaults)
    pub fn load_from(path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::new(path, FileFormat::Ini).required(true));
        }

        // Env overrides, e.g. PULP_MANAGER_VAULT__VAULT_ADDR
        builder = builder.add_source(
            Environment::with_prefix("PULP_MANAGER")
                .try_parsing(true)
                .separator("__"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build settings: {}", e)))?;

        let parsed: Settings = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize settings: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Settings validation failed: {}", e)))?;

        if let Some(pattern) = &parsed.pulp.banned_package_regex {
            regex::Regex::new(pattern)
                .map_err(|e| Error::Config(format!("Invalid banned_package_regex: {}", e)))?;
        }
        if let Some(pattern) = &parsed.pulp.package_name_replacement_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                Error::Config(format!("Invalid package_name_replacement_pattern: {}", e))
            })?;
        }

        Ok(parsed)
    }
}
