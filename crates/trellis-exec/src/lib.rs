//! Execution side of trellis: run a planned artifact graph in dependency
//! waves with content-hash skipping, blocked propagation on upstream
//! failure, per-wave snapshots, and resume from the first incomplete
//! wave.

pub mod change;
pub mod executor;
pub mod plan_store;
pub mod resume;
pub mod saved;

#[cfg(test)]
pub(crate) mod testing;

pub use change::{compute_rebuild_set, detect_changes, find_invalidated, ChangeReport};
pub use executor::{ExecutionReport, Executor};
pub use plan_store::PlanStore;
pub use resume::{resume_goal, resume_latest};
pub use saved::{ArtifactCompletion, RunStatus, SavedExecution, SNAPSHOT_VERSION};
