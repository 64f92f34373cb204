//! ABOUTME: Repository descriptor schema as stored in the git catalog
//! ABOUTME: Known fields validated strictly, unknown fields preserved verbatim

use pm_core::{Error, Result};
use pm_pulp::RepoKind;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// One repository descriptor from the catalog checkout.
///
/// Presence of `url` classifies the repository as external; its absence as
/// internal. Unknown fields ride along in `extra` and are forwarded to Pulp
/// untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepoDescriptor {
    pub name: String,
    pub content_repo_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default)]
    pub tls_validation: Option<bool>,
    #[serde(default)]
    pub distributions: Option<Vec<String>>,
    #[serde(default)]
    pub components: Option<Vec<String>>,
    #[serde(default)]
    pub architectures: Option<Vec<String>>,
    #[serde(default)]
    pub sync_sources: Option<bool>,
    #[serde(default)]
    pub sync_udebs: Option<bool>,
    #[serde(default)]
    pub sync_installer: Option<bool>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl RepoDescriptor {
    pub fn kind(&self) -> Result<RepoKind> {
        RepoKind::parse(&self.content_repo_type)
    }

    /// External repositories mirror an upstream and need a remote
    pub fn is_external(&self) -> bool {
        self.url.is_some()
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation(
                "Descriptor name must not be empty".to_string(),
            ));
        }
        self.kind()?;
        if let Some(url) = &self.url {
            url::parse_check(url)?;
        }
        Ok(())
    }
}

mod url {
    use pm_core::{Error, Result};

    pub fn parse_check(raw: &str) -> Result<()> {
        if raw.starts_with("http://") || raw.starts_with("https://") {
            Ok(())
        } else {
            Err(Error::Validation(format!(
                "Descriptor url '{}' must be http(s)",
                raw
            )))
        }
    }
}

/// Load every `.json` descriptor in a directory, sorted by file name.
///
/// Parse failures are isolated per file so one broken descriptor cannot
/// abort the batch.
pub fn load_descriptors(dir: &Path) -> Result<Vec<(String, Result<RepoDescriptor>)>> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)
        .map_err(|e| {
            Error::Config(format!(
                "Failed to read descriptor directory '{}': {}",
                dir.display(),
                e
            ))
        })?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
        .collect();
    entries.sort();

    let mut descriptors = Vec::new();
    for path in entries {
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let parsed = std::fs::read_to_string(&path)
            .map_err(Error::Io)
            .and_then(|raw| {
                serde_json::from_str::<RepoDescriptor>(&raw).map_err(|e| {
                    Error::Validation(format!("Invalid descriptor '{}': {}", file_name, e))
                })
            })
            .and_then(|descriptor| {
                descriptor.validate()?;
                Ok(descriptor)
            });

        descriptors.push((file_name, parsed));
    }

    Ok(descriptors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_external_classification() {
        let external: RepoDescriptor = serde_json::from_value(test_support::descriptor_json(
            "nginx",
            Some("https://nginx.org/packages/debian"),
        ))
        .unwrap();
        assert!(external.is_external());

        let internal: RepoDescriptor =
            serde_json::from_value(test_support::descriptor_json("myapp", None)).unwrap();
        assert!(!internal.is_external());
    }

    #[test]
    fn test_unknown_fields_preserved() {
        let mut body = test_support::descriptor_json("nginx", None);
        body["future_knob"] = serde_json::json!(true);

        let descriptor: RepoDescriptor = serde_json::from_value(body.clone()).unwrap();
        assert_eq!(descriptor.extra["future_knob"], serde_json::json!(true));

        // Round-trips back out for forwarding to Pulp
        let restored = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(restored["future_knob"], serde_json::json!(true));
    }

    #[test]
    fn test_validation_rejects_bad_descriptors() {
        let mut nameless = test_support::descriptor_json("", None);
        nameless["name"] = serde_json::json!("");
        let descriptor: RepoDescriptor = serde_json::from_value(nameless).unwrap();
        assert!(descriptor.validate().is_err());

        let mut unknown_kind = test_support::descriptor_json("x", None);
        unknown_kind["content_repo_type"] = serde_json::json!("tarball");
        let descriptor: RepoDescriptor = serde_json::from_value(unknown_kind).unwrap();
        assert!(descriptor.validate().is_err());

        let bad_url = test_support::descriptor_json("x", Some("ftp://mirror"));
        let descriptor: RepoDescriptor = serde_json::from_value(bad_url).unwrap();
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_load_descriptors_isolates_bad_files() {
        let dir = tempfile::TempDir::new().unwrap();

        let good = test_support::descriptor_json("nginx", None);
        std::fs::write(
            dir.path().join("a-nginx.json"),
            serde_json::to_string(&good).unwrap(),
        )
        .unwrap();

        let mut broken = std::fs::File::create(dir.path().join("b-broken.json")).unwrap();
        writeln!(broken, "{{ not json").unwrap();

        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let loaded = load_descriptors(dir.path()).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].0, "a-nginx.json");
        assert!(loaded[0].1.is_ok());
        assert!(loaded[1].1.is_err());
    }
}
