//! ABOUTME: Repo group matching and the bounded-concurrency sync driver
//! ABOUTME: Submission ordering, deadline enforcement, and per-repo outcomes

pub mod banned;
pub mod matcher;
pub mod syncher;

pub use matcher::{match_repos, MatchRule};
pub use syncher::{refresh_server_repos, RepoSyncher, SyncSettings, SyncSummary};
