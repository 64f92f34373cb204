//! ABOUTME: Worker consuming jobs FIFO and dispatching to engine components
//! ABOUTME: Wraps execution with lifecycle updates and cancellation contexts

pub mod worker;

pub use pm_db::JobParams;
pub use worker::{Worker, WorkerConfig};
