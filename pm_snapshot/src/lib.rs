//! ABOUTME: Snapshotter creating dated immutable copies of publications
//! ABOUTME: Multi-step publish/sign/distribute workflow per target repo

pub mod snapshotter;

pub use snapshotter::{SnapshotSettings, SnapshotStep, SnapshotSummary, Snapshotter};
