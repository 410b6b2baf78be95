use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::graph::ArtifactGraph;

/// Trit risk signal for one artifact: clean (0), watch (1), hot (2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskSignal {
    Clean,
    Watch,
    Hot,
}

/// Dependency count at which an artifact signals hot.
pub const HOT_DEPENDENCY_COUNT: usize = 5;
/// Dependency count at which an artifact signals watch.
pub const WATCH_DEPENDENCY_COUNT: usize = 3;
/// Graph-level average dependency count that adds a hot signal.
pub const AVG_DEPENDENCY_THRESHOLD: f64 = 2.5;

const HOT_SIGNAL_LIMIT: usize = 2;

/// Structural health of a candidate plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHealth {
    /// Per-artifact signal; graph-level findings only appear in `issues`.
    pub signals: BTreeMap<String, RiskSignal>,
    /// Total hot signals, including graph-level ones.
    pub hot_count: usize,
    /// Human-readable findings, one per problem.
    pub issues: Vec<String>,
    pub has_cycle: bool,
    /// True when the plan should be regenerated with a simplification hint
    /// instead of being executed as-is.
    pub needs_simplification: bool,
}

/// Score the structure of a plan without calling a model.
///
/// An artifact signals hot when it declares too many dependencies, sits in a
/// bidirectional pair, or requires an id the graph does not contain. A cycle
/// anywhere, any bidirectional pair, any unknown reference, or two hot
/// signals in total all flag the plan for simplification.
pub fn signal_plan_health(graph: &ArtifactGraph) -> PlanHealth {
    let mut signals: BTreeMap<String, RiskSignal> = BTreeMap::new();
    let mut issues = Vec::new();
    let mut bidirectional: BTreeSet<String> = BTreeSet::new();
    let mut unknown: BTreeSet<String> = BTreeSet::new();

    for spec in graph.artifacts() {
        for req in &spec.requires {
            match graph.get(req) {
                Some(other) => {
                    if other.requires.contains(&spec.id) && !bidirectional.contains(&spec.id) {
                        bidirectional.insert(spec.id.clone());
                        bidirectional.insert(req.clone());
                        issues.push(format!(
                            "bidirectional dependency between '{}' and '{}'",
                            spec.id, req
                        ));
                    }
                }
                None => {
                    unknown.insert(spec.id.clone());
                    issues.push(format!(
                        "artifact '{}' requires unknown artifact '{}'",
                        spec.id, req
                    ));
                }
            }
        }
    }

    let mut total_deps = 0usize;
    for spec in graph.artifacts() {
        total_deps += spec.requires.len();
        let signal = if bidirectional.contains(&spec.id) || unknown.contains(&spec.id) {
            RiskSignal::Hot
        } else if spec.requires.len() >= HOT_DEPENDENCY_COUNT {
            issues.push(format!(
                "artifact '{}' declares {} dependencies",
                spec.id,
                spec.requires.len()
            ));
            RiskSignal::Hot
        } else if spec.requires.len() >= WATCH_DEPENDENCY_COUNT {
            RiskSignal::Watch
        } else {
            RiskSignal::Clean
        };
        signals.insert(spec.id.clone(), signal);
    }

    let mut hot_count = signals.values().filter(|s| **s == RiskSignal::Hot).count();

    if !graph.is_empty() {
        let avg = total_deps as f64 / graph.len() as f64;
        if avg > AVG_DEPENDENCY_THRESHOLD {
            hot_count += 1;
            issues.push(format!(
                "average dependency count {:.1} exceeds {:.1}",
                avg, AVG_DEPENDENCY_THRESHOLD
            ));
        }
    }

    let cycle = graph.find_cycle();
    let has_cycle = cycle.is_some();
    if let Some(path) = cycle {
        issues.push(format!("dependency cycle: {}", path.join(" -> ")));
    }

    let needs_simplification = has_cycle
        || !bidirectional.is_empty()
        || !unknown.is_empty()
        || hot_count >= HOT_SIGNAL_LIMIT;

    PlanHealth {
        signals,
        hot_count,
        issues,
        has_cycle,
        needs_simplification,
    }
}

/// Turn health findings into a prompt fragment for regenerating the plan.
pub fn build_simplification_hint(health: &PlanHealth) -> String {
    if health.issues.is_empty() {
        return String::new();
    }
    let mut hint = String::from(
        "The previous plan had structural problems. Produce a simpler plan that avoids them:\n",
    );
    for issue in &health.issues {
        hint.push_str("- ");
        hint.push_str(issue);
        hint.push('\n');
    }
    hint.push_str(
        "Prefer fewer dependencies per artifact and no mutual or dangling references.",
    );
    hint
}
