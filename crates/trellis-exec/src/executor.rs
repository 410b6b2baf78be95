use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trellis_cache::{ExecutionCache, ExecutionStatus};
use trellis_core::{
    hash::{artifact_input_hash, hash_content},
    select_model_tier, ArtifactCreator, ArtifactSpec, CreateContext, ModelTier, Result,
    TrellisError,
};

use crate::plan_store::PlanStore;
use crate::saved::{ArtifactCompletion, RunStatus, SavedExecution};

/// Outcome of one run, aggregated for the caller. Failures are counts and
/// messages here, never bubbled errors: a run with failed artifacts still
/// returns a report.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub run_id: String,
    pub status: RunStatus,
    pub completed: Vec<String>,
    pub failed: BTreeMap<String, String>,
    pub blocked: BTreeSet<String>,
    pub skipped: Vec<String>,
    pub waves: usize,
    pub total_duration_ms: u64,
    pub model_distribution: BTreeMap<ModelTier, usize>,
}

impl ExecutionReport {
    pub fn summary(&self) -> String {
        format!(
            "run {}: {} completed ({} skipped from cache), {} failed, {} blocked \
             across {} waves in {}ms",
            self.run_id,
            self.completed.len(),
            self.skipped.len(),
            self.failed.len(),
            self.blocked.len(),
            self.waves,
            self.total_duration_ms,
        )
    }
}

/// Wave-based executor.
///
/// Runs each wave's members concurrently, never starts an artifact whose
/// dependencies failed or were blocked, skips artifacts whose input hash
/// matches a completed cache row, and persists a snapshot at every wave
/// boundary so an interrupted run resumes cleanly.
pub struct Executor {
    cache: Arc<ExecutionCache>,
    creator: Arc<dyn ArtifactCreator>,
    store: Option<PlanStore>,
}

impl Executor {
    pub fn new(cache: Arc<ExecutionCache>, creator: Arc<dyn ArtifactCreator>) -> Self {
        Self {
            cache,
            creator,
            store: None,
        }
    }

    /// Persist a snapshot after every wave into `store`.
    pub fn with_store(mut self, store: PlanStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Execute a fresh plan.
    pub async fn execute(
        &self,
        graph: trellis_core::ArtifactGraph,
        goal: &str,
    ) -> Result<ExecutionReport> {
        self.run(SavedExecution::new(goal, graph)).await
    }

    /// Pick a previous run back up at its first incomplete wave. Failed
    /// and blocked artifacts from the previous run are retried; completed
    /// ones are never re-created.
    pub async fn resume(&self, saved: SavedExecution) -> Result<ExecutionReport> {
        self.run(saved).await
    }

    async fn run(&self, mut saved: SavedExecution) -> Result<ExecutionReport> {
        // A cyclic plan is a planning failure; nothing starts.
        let graph = saved.graph.clone();
        let waves = graph.execution_waves()?;
        let start_wave = saved.get_resume_wave()?;

        saved.status = RunStatus::InProgress;
        saved.failed.clear();
        saved.blocked.clear();

        let run_id = Uuid::new_v4().to_string();
        let run_started = Instant::now();
        if let Err(e) = self.cache.start_run(&run_id, graph.len()) {
            warn!(run_id = %run_id, error = %e, "could not record run start");
        }
        info!(run_id = %run_id, artifacts = graph.len(), waves = waves.len(), start_wave, "run started");

        // Outputs produced or recovered this run, keyed by artifact id.
        let mut contents: BTreeMap<String, String> = BTreeMap::new();
        let mut skipped: Vec<String> = Vec::new();
        let mut executed = 0usize;

        for (wave_index, wave) in waves.iter().enumerate().skip(start_wave) {
            debug!(wave = wave_index, members = wave.len(), "wave starting");

            let mut to_run: Vec<(ArtifactSpec, String)> = Vec::new();
            for id in wave {
                if saved.completed.contains_key(id) {
                    continue;
                }
                let Some(spec) = graph.get(id) else { continue };

                // Upstream failure or block poisons the whole subtree.
                if spec
                    .requires
                    .iter()
                    .any(|r| saved.failed.contains_key(r) || saved.blocked.contains(r))
                {
                    warn!(artifact_id = %id, "blocked by upstream failure, not starting");
                    saved.mark_blocked(id.clone());
                    continue;
                }

                let input_hash = artifact_input_hash(spec, &saved.content_hashes);
                if self.try_skip(spec, &input_hash, &mut saved, &mut contents) {
                    skipped.push(id.clone());
                    continue;
                }
                to_run.push((spec.clone(), input_hash));
            }

            // Everything left in the wave runs concurrently.
            let mut tasks = Vec::with_capacity(to_run.len());
            for (spec, input_hash) in to_run {
                let ctx = CreateContext {
                    goal: saved.goal.clone(),
                    completed: self.dependency_outputs(&spec, &contents),
                };
                let creator = Arc::clone(&self.creator);
                tasks.push(async move {
                    let started = Instant::now();
                    let outcome = creator.create(&spec, &ctx).await;
                    (spec, input_hash, outcome, started.elapsed().as_millis() as u64)
                });
            }

            for (spec, input_hash, outcome, duration_ms) in join_all(tasks).await {
                match outcome {
                    Ok(content) => {
                        executed += 1;
                        self.record_success(
                            &spec, &input_hash, content, duration_ms, &graph, &mut saved,
                            &mut contents,
                        );
                    }
                    Err(e) => {
                        warn!(artifact_id = %spec.id, error = %e, "artifact failed");
                        let message = e.to_string();
                        if let Err(e) = self.cache.set(
                            &spec.id,
                            &input_hash,
                            ExecutionStatus::Failed,
                            None,
                            Some(&message),
                            duration_ms as i64,
                        ) {
                            warn!(artifact_id = %spec.id, error = %e, "cache write failed");
                        }
                        saved.mark_failed(spec.id, message);
                    }
                }
            }

            // Wave boundary: everything in this wave is terminal.
            saved.current_wave = wave_index + 1;
            self.persist(&saved);
        }

        let status = if saved.failed.is_empty() && saved.blocked.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Paused
        };
        saved.status = status;
        self.persist(&saved);

        let run_status = match status {
            RunStatus::Completed => "completed",
            _ => "paused",
        };
        if let Err(e) = self.cache.finish_run(
            &run_id,
            executed,
            skipped.len(),
            saved.failed.len(),
            run_status,
        ) {
            // The report survives even when the counters do not.
            warn!(run_id = %run_id, error = %e, "could not record run finish");
        }

        let report = ExecutionReport {
            run_id,
            status,
            completed: saved.completed.keys().cloned().collect(),
            failed: saved.failed.clone(),
            blocked: saved.blocked.clone(),
            skipped,
            waves: waves.len(),
            total_duration_ms: run_started.elapsed().as_millis() as u64,
            model_distribution: saved.model_distribution.clone(),
        };
        info!(run_id = %report.run_id, status = ?status, "{}", report.summary());
        Ok(report)
    }

    /// Probe the cache for a completed row with an equal input hash. On a
    /// hit the artifact never reaches the creator; its cached output is
    /// carried forward as if it had just been produced. A failing cache is
    /// a miss, never a failed run.
    fn try_skip(
        &self,
        spec: &ArtifactSpec,
        input_hash: &str,
        saved: &mut SavedExecution,
        contents: &mut BTreeMap<String, String>,
    ) -> bool {
        let entry = match self.cache.get_by_hash(&spec.id, input_hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => return false,
            Err(e) => {
                warn!(artifact_id = %spec.id, error = %e, "cache probe failed, treating as miss");
                return false;
            }
        };
        if entry.status != ExecutionStatus::Completed {
            return false;
        }
        let Some(content) = entry
            .result
            .as_ref()
            .and_then(|r| r.get("content"))
            .and_then(|c| c.as_str())
        else {
            warn!(artifact_id = %spec.id, "completed cache row has no content, treating as miss");
            return false;
        };

        debug!(artifact_id = %spec.id, "input hash unchanged, skipping");
        if let Err(e) = self.cache.record_skip(&spec.id) {
            warn!(artifact_id = %spec.id, error = %e, "could not record skip");
        }
        contents.insert(spec.id.clone(), content.to_string());
        saved.mark_completed(ArtifactCompletion {
            artifact_id: spec.id.clone(),
            content_hash: hash_content(content.as_bytes()),
            model_tier: select_model_tier(spec, &saved.graph),
            duration_ms: 0,
            completed_at: chrono::Utc::now(),
        });
        true
    }

    fn record_success(
        &self,
        spec: &ArtifactSpec,
        input_hash: &str,
        content: String,
        duration_ms: u64,
        graph: &trellis_core::ArtifactGraph,
        saved: &mut SavedExecution,
        contents: &mut BTreeMap<String, String>,
    ) {
        let result = serde_json::json!({ "content": content });
        if let Err(e) = self.cache.set(
            &spec.id,
            input_hash,
            ExecutionStatus::Completed,
            Some(&result),
            None,
            duration_ms as i64,
        ) {
            warn!(artifact_id = %spec.id, error = %e, "cache write failed");
        }
        for req in &spec.requires {
            if let Err(e) = self.cache.add_provenance(&spec.id, req) {
                warn!(artifact_id = %spec.id, error = %e, "provenance write failed");
            }
        }
        saved.mark_completed(ArtifactCompletion {
            artifact_id: spec.id.clone(),
            content_hash: hash_content(content.as_bytes()),
            model_tier: select_model_tier(spec, graph),
            duration_ms,
            completed_at: chrono::Utc::now(),
        });
        contents.insert(spec.id.clone(), content);
    }

    /// Outputs of a spec's dependencies: from this run when available,
    /// otherwise from the cache (resumed runs).
    fn dependency_outputs(
        &self,
        spec: &ArtifactSpec,
        contents: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut outputs = BTreeMap::new();
        for req in &spec.requires {
            if let Some(content) = contents.get(req) {
                outputs.insert(req.clone(), content.clone());
                continue;
            }
            match self.cache.get(req) {
                Ok(Some(entry)) => {
                    if let Some(content) = entry
                        .result
                        .as_ref()
                        .and_then(|r| r.get("content"))
                        .and_then(|c| c.as_str())
                    {
                        outputs.insert(req.clone(), content.to_string());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(dependency = %req, error = %e, "could not load dependency output");
                }
            }
        }
        outputs
    }

    fn persist(&self, saved: &SavedExecution) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(saved) {
                // Persistence trouble never stops the run; resume just
                // loses the most recent wave.
                warn!(error = %e, "snapshot save failed, continuing");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{failing_creator, recording_creator, RecordingCreator};
    use trellis_core::{ArtifactGraph, ArtifactSpec};

    fn spec(id: &str, requires: &[&str]) -> ArtifactSpec {
        ArtifactSpec::new(id, format!("{} artifact", id), format!("{} works", id))
            .with_requires(requires.iter().copied())
    }

    /// a, b -> c (c requires both)
    fn abc_graph() -> ArtifactGraph {
        let mut g = ArtifactGraph::new();
        g.add_all([spec("a", &[]), spec("b", &[]), spec("c", &["a", "b"])])
            .unwrap();
        g
    }

    fn executor(creator: Arc<RecordingCreator>) -> Executor {
        Executor::new(Arc::new(ExecutionCache::in_memory().unwrap()), creator)
    }

    #[tokio::test]
    async fn test_full_run_completes_in_waves() {
        let creator = recording_creator();
        let exec = executor(creator.clone());
        let report = exec.execute(abc_graph(), "goal").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(report.completed.len(), 3);
        assert!(report.failed.is_empty() && report.blocked.is_empty());
        assert_eq!(report.waves, 2);
        assert_eq!(creator.created(), vec!["a", "b", "c"]);

        // c saw both dependency outputs
        let ctxs = creator.contexts.lock().unwrap();
        let c_ctx = &ctxs["c"];
        assert_eq!(c_ctx.len(), 2);
        assert!(c_ctx.contains_key("a") && c_ctx.contains_key("b"));
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents_but_not_siblings() {
        let creator = recording_creator().failing_on("b");
        let exec = executor(creator.clone());
        let report = exec.execute(abc_graph(), "goal").await.unwrap();

        assert_eq!(report.status, RunStatus::Paused);
        assert_eq!(report.completed, vec!["a"]);
        assert!(report.failed.contains_key("b"));
        assert!(report.blocked.contains("c"));
        // c was never started
        assert_eq!(creator.created(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cyclic_plan_fails_before_any_work() {
        let mut g = ArtifactGraph::new();
        g.add_all([spec("a", &["b"]), spec("b", &["a"])]).unwrap();

        let creator = recording_creator();
        let exec = executor(creator.clone());
        let err = exec.execute(g, "goal").await.unwrap_err();
        assert!(matches!(err, TrellisError::CyclicDependency { .. }));
        assert!(creator.created().is_empty());
    }

    #[tokio::test]
    async fn test_unchanged_rerun_skips_everything() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());
        let creator = recording_creator();
        let exec = Executor::new(cache.clone(), creator.clone());

        let first = exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(first.completed.len(), 3);
        assert_eq!(creator.created().len(), 3);

        let second = exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(second.status, RunStatus::Completed);
        assert_eq!(second.skipped.len(), 3);
        // no new creation calls
        assert_eq!(creator.created().len(), 3);
        assert_eq!(cache.get("a").unwrap().unwrap().skip_count, 1);
    }

    #[tokio::test]
    async fn test_changed_spec_invalidates_downstream_only() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());
        let creator = recording_creator();
        let exec = Executor::new(cache.clone(), creator.clone());

        exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(creator.created().len(), 3);

        // change a's contract: a re-runs, and c re-runs because a's output
        // feeds its input hash; b is untouched
        let mut changed = ArtifactGraph::new();
        changed
            .add_all([
                ArtifactSpec::new("a", "a artifact", "a works differently"),
                spec("b", &[]),
                spec("c", &["a", "b"]),
            ])
            .unwrap();

        // the creator output depends on the contract, so a's content hash
        // changes and cascades into c's input hash
        let report = exec.execute(changed, "goal").await.unwrap();
        assert_eq!(report.skipped, vec!["b"]);
        let created = creator.created();
        assert_eq!(created.len(), 5);
        assert_eq!(&created[3..], ["a", "c"]);
    }

    #[tokio::test]
    async fn test_resume_retries_failed_and_blocked() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());

        let failing = recording_creator().failing_on("b");
        let exec = Executor::new(cache.clone(), failing);
        let first = exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(first.status, RunStatus::Paused);

        // same cache, healthy creator: resume finishes the run
        let healthy = recording_creator();
        let exec = Executor::new(cache, healthy.clone());
        let mut saved = SavedExecution::new("goal", abc_graph());
        saved.mark_completed(ArtifactCompletion {
            artifact_id: "a".to_string(),
            content_hash: hash_content(b"a artifact|a works"),
            model_tier: ModelTier::Small,
            duration_ms: 1,
            completed_at: chrono::Utc::now(),
        });
        saved.mark_failed("b", "boom");
        saved.mark_blocked("c");

        let report = exec.resume(saved).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        // a was already done: resume starts at wave 0 (b outstanding) but
        // a is skipped from the snapshot, and only b and c are created
        assert_eq!(healthy.created(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_resume_of_complete_snapshot_creates_nothing() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());
        let creator = recording_creator();
        let exec = Executor::new(cache.clone(), creator.clone());
        exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(creator.created().len(), 3);

        let store_dir = tempfile::tempdir().unwrap();
        let store = PlanStore::open(store_dir.path()).unwrap();
        let exec = Executor::new(cache, creator.clone()).with_store(store);
        let report = exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(creator.created().len(), 3);

        // and resuming the persisted snapshot is also a no-op
        let store = PlanStore::open(store_dir.path()).unwrap();
        let saved = store.find_by_goal("goal").unwrap().unwrap();
        assert!(saved.is_complete());
        let exec = Executor::new(
            Arc::new(ExecutionCache::in_memory().unwrap()),
            creator.clone(),
        );
        let report = exec.resume(saved).await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(creator.created().len(), 3);
    }

    #[tokio::test]
    async fn test_snapshot_persisted_at_wave_boundaries() {
        let store_dir = tempfile::tempdir().unwrap();
        let creator = recording_creator().failing_on("c");
        let exec = Executor::new(Arc::new(ExecutionCache::in_memory().unwrap()), creator)
            .with_store(PlanStore::open(store_dir.path()).unwrap());

        let report = exec.execute(abc_graph(), "goal").await.unwrap();
        assert_eq!(report.status, RunStatus::Paused);

        let store = PlanStore::open(store_dir.path()).unwrap();
        let saved = store.find_by_goal("goal").unwrap().unwrap();
        assert_eq!(saved.status, RunStatus::Paused);
        assert_eq!(saved.completed.len(), 2);
        assert!(saved.failed.contains_key("c"));
        // current_wave points past the last closed wave
        assert_eq!(saved.current_wave, 2);
    }

    #[tokio::test]
    async fn test_provenance_recorded_from_requires() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());
        let exec = Executor::new(cache.clone(), recording_creator());
        exec.execute(abc_graph(), "goal").await.unwrap();

        assert_eq!(cache.direct_dependencies("c").unwrap(), vec!["a", "b"]);
        assert_eq!(cache.downstream("a", u32::MAX).unwrap(), vec!["c"]);
    }

    #[tokio::test]
    async fn test_run_counters_recorded() {
        let cache = Arc::new(ExecutionCache::in_memory().unwrap());
        let creator = recording_creator().failing_on("b");
        let exec = Executor::new(cache.clone(), creator);
        let report = exec.execute(abc_graph(), "goal").await.unwrap();

        let run = cache.get_run(&report.run_id).unwrap().unwrap();
        assert_eq!(run.total_artifacts, 3);
        assert_eq!(run.executed, 1);
        assert_eq!(run.failed, 1);
        assert_eq!(run.status, "paused");
        assert!(run.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_run_survives_cache_write_failures() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.sqlite");
        let cache = Arc::new(ExecutionCache::open(&path).unwrap());

        // A second connection holding the write lock makes every cache
        // write during the run fail immediately; reads still work.
        let blocker = rusqlite::Connection::open(&path).unwrap();
        blocker.execute_batch("BEGIN IMMEDIATE").unwrap();

        let creator = recording_creator();
        let exec = Executor::new(cache.clone(), creator.clone());
        let report = exec.execute(abc_graph(), "goal").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(creator.created(), vec!["a", "b", "c"]);

        blocker.execute_batch("COMMIT").unwrap();
        // none of the writes landed, yet the run still produced a report
        assert!(cache.get_run(&report.run_id).unwrap().is_none());
        assert!(cache.get("a").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_summary_counts_never_bare_errors() {
        let creator = failing_creator();
        let exec = executor(creator);
        let report = exec.execute(abc_graph(), "goal").await.unwrap();
        let summary = report.summary();
        assert!(summary.contains("2 failed"));
        assert!(summary.contains("1 blocked"));
        assert!(summary.contains("0 completed"));
    }
}
