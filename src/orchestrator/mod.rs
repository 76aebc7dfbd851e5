//! Declarative orchestrator integration: workload manifests, the
//! create-or-update reconciler and the ML-pipeline client.

pub mod pipelines;
pub mod reconciler;
pub mod resources;

pub use reconciler::{Reconciler, WorkloadPhase, WorkloadStatus};
