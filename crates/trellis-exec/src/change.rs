use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use trellis_core::ArtifactGraph;

use crate::saved::SavedExecution;

/// What differs between the current plan and a previous run's plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeReport {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
    pub contract_changed: BTreeSet<String>,
    pub deps_changed: BTreeSet<String>,
}

impl ChangeReport {
    /// Ids in the current plan that must re-run because they themselves
    /// changed. Removed ids are not rebuilt, only dropped.
    pub fn all_changed(&self) -> BTreeSet<String> {
        let mut all = self.added.clone();
        all.extend(self.contract_changed.iter().cloned());
        all.extend(self.deps_changed.iter().cloned());
        all
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty()
            || !self.removed.is_empty()
            || !self.contract_changed.is_empty()
            || !self.deps_changed.is_empty()
    }
}

/// Diff the current graph against the one a previous run executed.
pub fn detect_changes(graph: &ArtifactGraph, previous: &SavedExecution) -> ChangeReport {
    let mut report = ChangeReport::default();

    for spec in graph.artifacts() {
        match previous.graph.get(&spec.id) {
            None => {
                report.added.insert(spec.id.clone());
            }
            Some(old) => {
                if old.contract != spec.contract || old.description != spec.description {
                    report.contract_changed.insert(spec.id.clone());
                }
                if old.requires != spec.requires {
                    report.deps_changed.insert(spec.id.clone());
                }
            }
        }
    }
    for id in previous.graph.ids() {
        if !graph.contains(id) {
            report.removed.insert(id.to_string());
        }
    }
    report
}

/// Transitive dependents of the changed set, breadth-first. The changed
/// ids themselves are not included unless they sit downstream of another
/// change.
pub fn find_invalidated(graph: &ArtifactGraph, changed: &BTreeSet<String>) -> BTreeSet<String> {
    let mut invalidated = BTreeSet::new();
    let mut queue: VecDeque<String> = changed.iter().cloned().collect();
    while let Some(id) = queue.pop_front() {
        for dependent in graph.dependents_of(&id) {
            if invalidated.insert(dependent.clone()) {
                queue.push_back(dependent);
            }
        }
    }
    invalidated
}

/// Everything a resumed run must execute: the changed artifacts, their
/// downstream cascade, and whatever the previous run left unfinished.
/// Only ids present in the current graph are returned.
pub fn compute_rebuild_set(
    graph: &ArtifactGraph,
    report: &ChangeReport,
    previous: &SavedExecution,
) -> BTreeSet<String> {
    let changed = report.all_changed();
    let mut rebuild = changed.clone();
    rebuild.extend(find_invalidated(graph, &changed));
    rebuild.extend(previous.pending_ids());
    rebuild.extend(previous.failed.keys().cloned());
    rebuild.extend(previous.blocked.iter().cloned());
    rebuild.retain(|id| graph.contains(id));
    rebuild
}
