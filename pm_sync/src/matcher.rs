//! ABOUTME: Deterministic repo group matching over a server's repositories
//! ABOUTME: Exclude wins over include; output is sorted lexicographically

use pm_core::{Error, Result};
use pm_db::PulpServerRepo;
use regex::Regex;

/// Compiled (include, exclude) pair for one repo group
#[derive(Debug, Clone)]
pub struct MatchRule {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl MatchRule {
    /// Compile a rule; an absent or empty include pattern matches everything
    pub fn compile(include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        let include = match include {
            Some(pattern) if !pattern.is_empty() => Some(
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("Invalid regex_include: {}", e)))?,
            ),
            _ => None,
        };
        let exclude = match exclude {
            Some(pattern) if !pattern.is_empty() => Some(
                Regex::new(pattern)
                    .map_err(|e| Error::Config(format!("Invalid regex_exclude: {}", e)))?,
            ),
            _ => None,
        };
        Ok(Self { include, exclude })
    }

    /// Whether a repo name is covered by this rule
    pub fn matches(&self, name: &str) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(name) {
                return false;
            }
        }
        match &self.include {
            Some(include) => include.is_match(name),
            None => true,
        }
    }
}

/// The subset of a server's repos covered by a rule, ordered by name.
///
/// Stable across calls with the same inputs.
pub fn match_repos(repos: &[PulpServerRepo], rule: &MatchRule) -> Vec<PulpServerRepo> {
    let mut matched: Vec<PulpServerRepo> = repos
        .iter()
        .filter(|repo| rule.matches(&repo.name))
        .cloned()
        .collect();
    matched.sort_by(|a, b| a.name.cmp(&b.name));
    matched
}
