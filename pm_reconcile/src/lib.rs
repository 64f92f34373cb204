//! ABOUTME: Reconciler converging a Pulp primary to the declarative catalog
//! ABOUTME: Applies JSON descriptors independently with per-repo outcomes

pub mod descriptor;
pub mod naming;
pub mod reconciler;

pub use descriptor::{load_descriptors, RepoDescriptor};
pub use naming::NamingRules;
pub use reconciler::{ReconcileOptions, ReconcileReport, Reconciler};
