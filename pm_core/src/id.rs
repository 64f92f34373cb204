use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for jobs, repo results, and catalog rows.
///
/// ULID-backed: ids sort by creation time, so FIFO ordering over the jobs
/// table falls out of ordering on the id column, and the enqueue instant is
/// recoverable from the id itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id(ulid::Ulid);

impl Id {
    /// Generate a fresh id stamped with the current time
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Parse a stored id, rejecting anything that is not a valid ULID
    pub fn parse(raw: &str) -> Result<Self> {
        raw.parse::<ulid::Ulid>()
            .map(Self)
            .map_err(|e| Error::Validation(format!("Invalid id '{}': {}", raw, e)))
    }

    /// The instant this id was generated, from the ULID timestamp bits
    pub fn created_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.0.timestamp_ms() as i64).unwrap_or_default()
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_roundtrip() {
        let id = Id::new();
        let parsed = Id::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = Id::parse("not-a-ulid").unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(Id::parse("").is_err());
    }

    #[test]
    fn test_ids_sort_by_creation() {
        let a = Id::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let b = Id::new();
        assert!(a < b);
        assert!(a.to_string() < b.to_string());
    }

    #[test]
    fn test_created_at_matches_generation_time() {
        let before = Utc::now();
        let id = Id::new();
        let after = Utc::now();

        let created = id.created_at();
        // ULID timestamps have millisecond precision
        assert!(created >= before - chrono::Duration::milliseconds(1));
        assert!(created <= after + chrono::Duration::milliseconds(1));
    }
}
