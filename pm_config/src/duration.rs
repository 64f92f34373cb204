// ABOUTME: Parsing for the max_runtime duration forms accepted in fleet files.
// ABOUTME: Accepts <N>s/<N>m/<N>h/<N>d suffixes or a bare integer of seconds.
use pm_core::{Error, Result};
use std::time::Duration;

/// Parse a `max_runtime` value.
///
/// A bare integer means seconds; otherwise the value must carry a unit
/// suffix understood by humantime (`30s`, `15m`, `4h`, `1d`). Zero and
/// negative budgets are configuration errors.
pub fn parse_max_runtime(raw: &str) -> Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(Error::Config("max_runtime must not be empty".to_string()));
    }

    let duration = if trimmed.chars().all(|c| c.is_ascii_digit()) {
        let secs: u64 = trimmed
            .parse()
            .map_err(|e| Error::Config(format!("Invalid max_runtime '{}': {}", trimmed, e)))?;
        Duration::from_secs(secs)
    } else {
        humantime::parse_duration(trimmed)
            .map_err(|e| Error::Config(format!("Invalid max_runtime '{}': {}", trimmed, e)))?
    };

    if duration.is_zero() {
        return Err(Error::Config(format!(
            "max_runtime '{}' must be a positive duration",
            trimmed
        )));
    }

    Ok(duration)
}
