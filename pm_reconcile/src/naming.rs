//! ABOUTME: Canonical repository naming and the stable identity marker
//! ABOUTME: Prefix by classification, optional rewrite rule, rename tracking

use crate::descriptor::RepoDescriptor;
use pm_core::{Error, Result};
use regex::Regex;

/// Prefix applied to repositories mirroring an upstream
pub const EXTERNAL_PREFIX: &str = "ext-";

/// Naming policy for canonical repository names.
///
/// The rewrite rule applies during reconcile only, so repeated runs always
/// compute the same canonical name from the same descriptor.
#[derive(Debug, Clone)]
pub struct NamingRules {
    internal_prefix: String,
    replacement: Option<(Regex, String)>,
}

impl NamingRules {
    pub fn new(internal_prefix: &str) -> Self {
        Self {
            internal_prefix: internal_prefix.to_string(),
            replacement: None,
        }
    }

    /// Attach the configured name replacement pattern/rule pair
    pub fn with_replacement(mut self, pattern: &str, rule: &str) -> Result<Self> {
        let regex = Regex::new(pattern).map_err(|e| {
            Error::Config(format!("Invalid package_name_replacement_pattern: {}", e))
        })?;
        self.replacement = Some((regex, rule.to_string()));
        Ok(self)
    }

    /// Canonical name: rewritten descriptor name behind the class prefix
    pub fn canonical_name(&self, descriptor: &RepoDescriptor) -> String {
        let mut base = descriptor.name.clone();
        if let Some((regex, rule)) = &self.replacement {
            base = regex.replace_all(&base, rule.as_str()).into_owned();
        }

        let prefix = if descriptor.is_external() {
            EXTERNAL_PREFIX
        } else {
            self.internal_prefix.as_str()
        };

        if base.starts_with(prefix) {
            base
        } else {
            format!("{}{}", prefix, base)
        }
    }

    /// Stable identity marker embedded in the repository description.
    ///
    /// Keyed on the descriptor name so a changed canonical name maps back to
    /// the existing Pulp repository and triggers a rename instead of a
    /// create-plus-orphan.
    pub fn marker(descriptor_name: &str) -> String {
        format!("[managed:{}]", descriptor_name)
    }

    /// Description stored on the repository: human text plus the marker
    pub fn description_with_marker(&self, descriptor: &RepoDescriptor) -> String {
        let marker = Self::marker(&descriptor.name);
        match &descriptor.description {
            Some(text) if !text.is_empty() => format!("{} {}", text, marker),
            _ => marker,
        }
    }

    /// Whether a repository name belongs to either managed namespace
    pub fn is_managed_name(&self, name: &str) -> bool {
        name.starts_with(EXTERNAL_PREFIX) || name.starts_with(&self.internal_prefix)
    }
}
