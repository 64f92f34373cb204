//! ABOUTME: Parameter blob carried on every job record
//! ABOUTME: Written by the scheduler or the API layer, read at dispatch time

use pm_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

/// Parameters attached to a job at enqueue time.
///
/// All fields are optional; dispatch falls back to the defaults below so an
/// ad-hoc enqueue can be as small as a kind and a server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobParams {
    pub regex_include: Option<String>,
    pub regex_exclude: Option<String>,
    pub max_runtime_secs: Option<u64>,
    pub max_concurrent_syncs: Option<usize>,
    pub max_concurrent_snapshots: Option<usize>,
    pub source_pulp_server_name: Option<String>,
}

impl JobParams {
    /// Fallback runtime budget when no cap was configured
    pub const DEFAULT_MAX_RUNTIME: Duration = Duration::from_secs(3600);

    pub fn from_value(value: &Value) -> Result<Self> {
        serde_json::from_value(value.clone())
            .map_err(|e| Error::Validation(format!("Invalid job params: {}", e)))
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn max_runtime(&self) -> Duration {
        self.max_runtime_secs
            .map(Duration::from_secs)
            .unwrap_or(Self::DEFAULT_MAX_RUNTIME)
    }

    pub fn max_concurrent_syncs(&self) -> usize {
        self.max_concurrent_syncs.unwrap_or(1).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_roundtrip_through_job_blob() {
        let params = JobParams {
            regex_include: Some("^ext-".to_string()),
            max_runtime_secs: Some(7200),
            max_concurrent_syncs: Some(4),
            source_pulp_server_name: Some("pulp-primary".to_string()),
            ..Default::default()
        };
        let restored = JobParams::from_value(&params.to_value()).unwrap();
        assert_eq!(params, restored);
    }

    #[test]
    fn test_defaults_for_sparse_params() {
        let params = JobParams::from_value(&json!({})).unwrap();
        assert_eq!(params.max_runtime(), JobParams::DEFAULT_MAX_RUNTIME);
        assert_eq!(params.max_concurrent_syncs(), 1);
        assert!(params.regex_include.is_none());
    }
}
