use tracing::info;

use trellis_core::{Result, TrellisError};

use crate::executor::{ExecutionReport, Executor};
use crate::plan_store::PlanStore;

/// Resume the most recently updated saved run.
pub async fn resume_latest(executor: &Executor, store: &PlanStore) -> Result<ExecutionReport> {
    let saved = store
        .most_recent()?
        .ok_or_else(|| TrellisError::Persistence("no saved runs to resume".to_string()))?;
    info!(goal = %saved.goal, wave = saved.get_resume_wave()?, "resuming latest run");
    executor.resume(saved).await
}

/// Resume the saved run for a specific goal.
pub async fn resume_goal(
    executor: &Executor,
    store: &PlanStore,
    goal: &str,
) -> Result<ExecutionReport> {
    let saved = store.find_by_goal(goal)?.ok_or_else(|| {
        TrellisError::Persistence(format!("no saved run for goal '{}'", goal))
    })?;
    executor.resume(saved).await
}
