//! ABOUTME: Fleet description parser producing the resolved server catalog
//! ABOUTME: Validates credentials references, cron schedules, and runtime caps

use crate::duration::parse_max_runtime;
use pm_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

/// Raw YAML shape of the fleet file
#[derive(Debug, Deserialize)]
struct FleetFile {
    #[serde(default)]
    pulp_servers: BTreeMap<String, ServerEntry>,
    #[serde(default)]
    credentials: BTreeMap<String, CredentialsEntry>,
    #[serde(default)]
    repo_groups: BTreeMap<String, GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct ServerEntry {
    credentials: String,
    /// Explicit base URL; defaults to https://<server name>
    url: Option<String>,
    repo_config_registration: Option<RegistrationEntry>,
    #[serde(default)]
    repo_groups: BTreeMap<String, BindingEntry>,
    snapshot_support: Option<SnapshotEntry>,
}

#[derive(Debug, Deserialize)]
struct RegistrationEntry {
    schedule: String,
    max_runtime: RuntimeValue,
}

#[derive(Debug, Deserialize)]
struct BindingEntry {
    schedule: String,
    max_concurrent_sync: usize,
    max_runtime: RuntimeValue,
    pulp_master: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SnapshotEntry {
    max_concurrent_snapshots: usize,
}

#[derive(Debug, Deserialize)]
struct CredentialsEntry {
    username: String,
    vault_service_account_mount: String,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    regex_include: Option<String>,
    regex_exclude: Option<String>,
}

/// Runtime caps may be written as a bare integer or a suffixed string
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RuntimeValue {
    Seconds(u64),
    Text(String),
}

impl RuntimeValue {
    fn parse(&self, context: &str) -> Result<Duration> {
        match self {
            RuntimeValue::Seconds(secs) => {
                if *secs == 0 {
                    return Err(Error::Config(format!(
                        "{}: max_runtime must be a positive duration",
                        context
                    )));
                }
                Ok(Duration::from_secs(*secs))
            }
            RuntimeValue::Text(text) => parse_max_runtime(text)
                .map_err(|e| Error::Config(format!("{}: {}", context, e))),
        }
    }
}

/// Fully-resolved fleet catalog
///
/// Immutable after load; a reload builds a fresh catalog and the process
/// swaps the shared reference wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Catalog {
    pub servers: Vec<PulpServerSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulpServerSpec {
    pub name: String,
    pub base_url: String,
    pub credentials: CredentialsSpec,
    pub repo_config_registration: Option<RegistrationSpec>,
    pub repo_groups: Vec<GroupBinding>,
    pub snapshot: Option<SnapshotSupport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CredentialsSpec {
    pub name: String,
    pub username: String,
    pub vault_service_account_mount: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistrationSpec {
    /// Normalized six-field cron expression
    pub schedule: String,
    pub max_runtime: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBinding {
    pub group: RepoGroupSpec,
    /// Normalized six-field cron expression
    pub schedule: String,
    pub max_concurrent_sync: usize,
    pub max_runtime: Duration,
    /// Primary server the targets must also exist on
    pub source_server: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoGroupSpec {
    pub name: String,
    pub regex_include: Option<String>,
    pub regex_exclude: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSupport {
    pub max_concurrent_snapshots: usize,
}

impl Catalog {
    pub fn find_server(&self, name: &str) -> Option<&PulpServerSpec> {
        self.servers.iter().find(|s| s.name == name)
    }
}

/// Loader for the fleet YAML file
pub struct FleetConfig;

impl FleetConfig {
    /// Load and resolve the fleet file named by `PULP_MANAGER_FLEET`
    pub fn load_from_env() -> Result<Catalog> {
        let path = std::env::var(crate::FLEET_PATH_VAR).map_err(|_| {
            Error::Config(format!("{} is not set", crate::FLEET_PATH_VAR))
        })?;
        Self::load(&path)
    }

    /// Load and resolve a fleet file from an explicit path
    pub fn load(path: &str) -> Result<Catalog> {
        debug!(path = %path, "Loading fleet configuration");
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read fleet file '{}': {}", path, e)))?;
        Self::parse(&raw)
    }

    /// Parse fleet YAML into a resolved catalog
    pub fn parse(raw: &str) -> Result<Catalog> {
        let file: FleetFile = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid fleet YAML: {}", e)))?;

        let mut seen_names: HashSet<String> = HashSet::new();
        let mut servers = Vec::new();

        for (name, entry) in &file.pulp_servers {
            if !seen_names.insert(name.to_lowercase()) {
                return Err(Error::Config(format!("Duplicate server name '{}'", name)));
            }

            let creds = file.credentials.get(&entry.credentials).ok_or_else(|| {
                Error::Config(format!(
                    "Server '{}' references unknown credentials '{}'",
                    name, entry.credentials
                ))
            })?;

            let registration = entry
                .repo_config_registration
                .as_ref()
                .map(|reg| -> Result<RegistrationSpec> {
                    Ok(RegistrationSpec {
                        schedule: normalize_cron(&reg.schedule)
                            .map_err(|e| annotate(name, "repo_config_registration", e))?,
                        max_runtime: reg
                            .max_runtime
                            .parse(&format!("{}/repo_config_registration", name))?,
                    })
                })
                .transpose()?;

            let mut bindings = Vec::new();
            for (group_name, binding) in &entry.repo_groups {
                let group = file.repo_groups.get(group_name).ok_or_else(|| {
                    Error::Config(format!(
                        "Server '{}' references unknown repo group '{}'",
                        name, group_name
                    ))
                })?;

                if let Some(pattern) = &group.regex_include {
                    regex::Regex::new(pattern).map_err(|e| {
                        Error::Config(format!(
                            "Group '{}': invalid regex_include: {}",
                            group_name, e
                        ))
                    })?;
                }
                if let Some(pattern) = &group.regex_exclude {
                    regex::Regex::new(pattern).map_err(|e| {
                        Error::Config(format!(
                            "Group '{}': invalid regex_exclude: {}",
                            group_name, e
                        ))
                    })?;
                }

                if binding.max_concurrent_sync == 0 {
                    return Err(Error::Config(format!(
                        "{}/{}: max_concurrent_sync must be at least 1",
                        name, group_name
                    )));
                }

                if let Some(master) = &binding.pulp_master {
                    if !file.pulp_servers.contains_key(master) {
                        return Err(Error::Config(format!(
                            "{}/{}: pulp_master '{}' is not a configured server",
                            name, group_name, master
                        )));
                    }
                }

                bindings.push(GroupBinding {
                    group: RepoGroupSpec {
                        name: group_name.clone(),
                        regex_include: group.regex_include.clone(),
                        regex_exclude: group.regex_exclude.clone(),
                    },
                    schedule: normalize_cron(&binding.schedule)
                        .map_err(|e| annotate(name, group_name, e))?,
                    max_concurrent_sync: binding.max_concurrent_sync,
                    max_runtime: binding
                        .max_runtime
                        .parse(&format!("{}/{}", name, group_name))?,
                    source_server: binding.pulp_master.clone(),
                });
            }

            servers.push(PulpServerSpec {
                name: name.clone(),
                base_url: entry
                    .url
                    .clone()
                    .unwrap_or_else(|| format!("https://{}", name)),
                credentials: CredentialsSpec {
                    name: entry.credentials.clone(),
                    username: creds.username.clone(),
                    vault_service_account_mount: creds.vault_service_account_mount.clone(),
                },
                repo_config_registration: registration,
                repo_groups: bindings,
                snapshot: entry.snapshot_support.as_ref().map(|snap| SnapshotSupport {
                    max_concurrent_snapshots: snap.max_concurrent_snapshots.max(1),
                }),
            });
        }

        info!(servers = servers.len(), "Fleet catalog loaded");
        Ok(Catalog { servers })
    }
}

fn annotate(server: &str, context: &str, err: Error) -> Error {
    Error::Config(format!("{}/{}: {}", server, context, err))
}

/// Normalize a five-field cron expression to the six-field form used by the
/// scheduler runtime (a leading seconds column pinned to zero), validating it
/// in the process.
pub fn normalize_cron(expr: &str) -> Result<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    let normalized = match fields.len() {
        5 => format!("0 {}", fields.join(" ")),
        6 | 7 => fields.join(" "),
        n => {
            return Err(Error::Config(format!(
                "Invalid cron expression '{}': expected 5 fields, found {}",
                expr, n
            )))
        }
    };

    cron::Schedule::from_str(&normalized)
        .map_err(|e| Error::Config(format!("Invalid cron expression '{}': {}", expr, e)))?;

    Ok(normalized)
}
