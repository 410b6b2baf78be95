use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use trellis_core::{
    hash::hash_goal, model_distribution, ArtifactGraph, ModelTier, Result, TrellisError,
};

pub const SNAPSHOT_VERSION: u32 = 1;

/// Where a run stands as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    /// Some artifacts failed or were blocked; the run can be resumed.
    Paused,
    Failed,
}

/// Record of one finished artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactCompletion {
    pub artifact_id: String,
    pub content_hash: String,
    pub model_tier: ModelTier,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

/// Versioned snapshot of a run, written at wave boundaries.
///
/// Invariants: `completed`, `failed`, and `blocked` are pairwise disjoint,
/// and together with `pending_ids()` they partition the graph's ids.
/// A reloaded snapshot therefore always describes a run paused between
/// waves, never inside one.
///
/// On disk the execution state lives under an `execution` object and the
/// derived counters under `metrics`; see [`SnapshotWire`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "SnapshotWire", into = "SnapshotWire")]
pub struct SavedExecution {
    pub version: u32,
    pub goal: String,
    pub goal_hash: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub graph: ArtifactGraph,
    pub completed: BTreeMap<String, ArtifactCompletion>,
    pub failed: BTreeMap<String, String>,
    pub blocked: BTreeSet<String>,
    /// Content hash of every produced artifact, feeding downstream input
    /// hashes.
    pub content_hashes: BTreeMap<String, String>,
    /// Index of the next wave to run.
    pub current_wave: usize,
    pub model_distribution: BTreeMap<ModelTier, usize>,
}

/// On-disk layout of a snapshot: flat header, execution state nested under
/// `execution`, derived counters under `metrics`.
#[derive(Serialize, Deserialize)]
struct SnapshotWire {
    version: u32,
    goal: String,
    goal_hash: String,
    status: RunStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    graph: ArtifactGraph,
    #[serde(default)]
    execution: ExecutionStateWire,
    #[serde(default)]
    content_hashes: BTreeMap<String, String>,
    #[serde(default)]
    metrics: MetricsWire,
}

#[derive(Default, Serialize, Deserialize)]
struct ExecutionStateWire {
    #[serde(default)]
    current_wave: usize,
    #[serde(default)]
    completed: BTreeMap<String, ArtifactCompletion>,
    #[serde(default)]
    failed: BTreeMap<String, String>,
    #[serde(default)]
    blocked: BTreeSet<String>,
}

#[derive(Default, Serialize, Deserialize)]
struct MetricsWire {
    #[serde(default)]
    model_distribution: BTreeMap<ModelTier, usize>,
}

impl From<SavedExecution> for SnapshotWire {
    fn from(saved: SavedExecution) -> Self {
        Self {
            version: saved.version,
            goal: saved.goal,
            goal_hash: saved.goal_hash,
            status: saved.status,
            created_at: saved.created_at,
            updated_at: saved.updated_at,
            graph: saved.graph,
            execution: ExecutionStateWire {
                current_wave: saved.current_wave,
                completed: saved.completed,
                failed: saved.failed,
                blocked: saved.blocked,
            },
            content_hashes: saved.content_hashes,
            metrics: MetricsWire {
                model_distribution: saved.model_distribution,
            },
        }
    }
}

impl From<SnapshotWire> for SavedExecution {
    fn from(wire: SnapshotWire) -> Self {
        Self {
            version: wire.version,
            goal: wire.goal,
            goal_hash: wire.goal_hash,
            status: wire.status,
            created_at: wire.created_at,
            updated_at: wire.updated_at,
            graph: wire.graph,
            completed: wire.execution.completed,
            failed: wire.execution.failed,
            blocked: wire.execution.blocked,
            content_hashes: wire.content_hashes,
            current_wave: wire.execution.current_wave,
            model_distribution: wire.metrics.model_distribution,
        }
    }
}

impl SavedExecution {
    pub fn new(goal: impl Into<String>, graph: ArtifactGraph) -> Self {
        let goal = goal.into();
        let now = Utc::now();
        Self {
            version: SNAPSHOT_VERSION,
            goal_hash: hash_goal(&goal),
            goal,
            status: RunStatus::InProgress,
            created_at: now,
            updated_at: now,
            model_distribution: model_distribution(&graph),
            graph,
            completed: BTreeMap::new(),
            failed: BTreeMap::new(),
            blocked: BTreeSet::new(),
            content_hashes: BTreeMap::new(),
            current_wave: 0,
        }
    }

    pub fn mark_completed(&mut self, completion: ArtifactCompletion) {
        let id = completion.artifact_id.clone();
        self.failed.remove(&id);
        self.blocked.remove(&id);
        self.content_hashes
            .insert(id.clone(), completion.content_hash.clone());
        self.completed.insert(id, completion);
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self, artifact_id: impl Into<String>, error: impl Into<String>) {
        let id = artifact_id.into();
        self.completed.remove(&id);
        self.blocked.remove(&id);
        self.content_hashes.remove(&id);
        self.failed.insert(id, error.into());
        self.updated_at = Utc::now();
    }

    pub fn mark_blocked(&mut self, artifact_id: impl Into<String>) {
        let id = artifact_id.into();
        if !self.completed.contains_key(&id) && !self.failed.contains_key(&id) {
            self.blocked.insert(id);
            self.updated_at = Utc::now();
        }
    }

    /// Ids with no terminal state yet.
    pub fn pending_ids(&self) -> BTreeSet<String> {
        self.graph
            .ids()
            .filter(|id| {
                !self.completed.contains_key(*id)
                    && !self.failed.contains_key(*id)
                    && !self.blocked.contains(*id)
            })
            .map(String::from)
            .collect()
    }

    /// Completed fraction, 0.0 to 1.0.
    pub fn progress(&self) -> f64 {
        if self.graph.is_empty() {
            return 1.0;
        }
        self.completed.len() as f64 / self.graph.len() as f64
    }

    pub fn is_complete(&self) -> bool {
        self.completed.len() == self.graph.len()
    }

    /// First wave containing any artifact that has not completed; equals
    /// the wave count when everything is done.
    pub fn get_resume_wave(&self) -> Result<usize> {
        let waves = self.graph.execution_waves()?;
        for (index, wave) in waves.iter().enumerate() {
            if wave.iter().any(|id| !self.completed.contains_key(id)) {
                return Ok(index);
            }
        }
        Ok(waves.len())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a snapshot, rejecting versions this build does not know.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        let version = value
            .get("version")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| {
                TrellisError::Persistence("snapshot has no version field".to_string())
            })?;
        if version != SNAPSHOT_VERSION as u64 {
            return Err(TrellisError::UnsupportedVersion(version as u32));
        }
        Ok(serde_json::from_value(value)?)
    }
}
