use std::collections::{BTreeMap, BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSpec;
use crate::error::{Result, TrellisError};

/// Dependency graph of artifacts.
///
/// Edges run along `requires`: if `api` requires `models`, then `models`
/// must be produced before `api` starts. The graph keeps a reverse index
/// (dependents) so invalidation and fan-out queries are cheap.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, ArtifactSpec>",
    into = "BTreeMap<String, ArtifactSpec>"
)]
pub struct ArtifactGraph {
    artifacts: BTreeMap<String, ArtifactSpec>,
    dependents: BTreeMap<String, BTreeSet<String>>,
}

impl PartialEq for ArtifactGraph {
    fn eq(&self, other: &Self) -> bool {
        self.artifacts == other.artifacts
    }
}

impl TryFrom<BTreeMap<String, ArtifactSpec>> for ArtifactGraph {
    type Error = String;

    fn try_from(map: BTreeMap<String, ArtifactSpec>) -> std::result::Result<Self, String> {
        let mut graph = ArtifactGraph::new();
        for (key, spec) in map {
            if key != spec.id {
                return Err(format!("map key '{}' does not match artifact id '{}'", key, spec.id));
            }
            graph.add(spec).map_err(|e| e.to_string())?;
        }
        Ok(graph)
    }
}

impl From<ArtifactGraph> for BTreeMap<String, ArtifactSpec> {
    fn from(graph: ArtifactGraph) -> Self {
        graph.artifacts
    }
}

impl ArtifactGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an artifact. Duplicate ids are a planning error.
    pub fn add(&mut self, artifact: ArtifactSpec) -> Result<()> {
        if self.artifacts.contains_key(&artifact.id) {
            return Err(TrellisError::Planning(format!(
                "duplicate artifact id '{}'",
                artifact.id
            )));
        }
        self.dependents.entry(artifact.id.clone()).or_default();
        for req in &artifact.requires {
            self.dependents
                .entry(req.clone())
                .or_default()
                .insert(artifact.id.clone());
        }
        self.artifacts.insert(artifact.id.clone(), artifact);
        Ok(())
    }

    pub fn add_all(&mut self, artifacts: impl IntoIterator<Item = ArtifactSpec>) -> Result<()> {
        for artifact in artifacts {
            self.add(artifact)?;
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&ArtifactSpec> {
        self.artifacts.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.artifacts.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &ArtifactSpec> {
        self.artifacts.values()
    }

    /// Artifacts with no dependencies. These form wave 0.
    pub fn leaves(&self) -> Vec<String> {
        self.artifacts
            .values()
            .filter(|a| a.is_leaf())
            .map(|a| a.id.clone())
            .collect()
    }

    /// Artifacts nothing else depends on (final outputs).
    pub fn roots(&self) -> Vec<String> {
        self.artifacts
            .keys()
            .filter(|id| self.dependents.get(*id).map_or(true, BTreeSet::is_empty))
            .cloned()
            .collect()
    }

    /// Ids of artifacts that directly require `id`.
    pub fn dependents_of(&self, id: &str) -> BTreeSet<String> {
        self.dependents.get(id).cloned().unwrap_or_default()
    }

    /// How many artifacts directly depend on `id`.
    pub fn fan_in(&self, id: &str) -> usize {
        self.dependents.get(id).map_or(0, BTreeSet::len)
    }

    /// How many dependencies `id` declares.
    pub fn fan_out(&self, id: &str) -> usize {
        self.artifacts.get(id).map_or(0, |a| a.requires.len())
    }

    /// Longest chain of dependencies below `id` (a leaf has depth 0).
    /// `None` if the id is unknown or the graph is cyclic.
    pub fn depth(&self, id: &str) -> Option<usize> {
        self.depths().and_then(|d| d.get(id).copied())
    }

    /// Depth of the deepest artifact; equals wave count minus one on an
    /// acyclic non-empty graph.
    pub fn max_depth(&self) -> usize {
        self.depths()
            .and_then(|d| d.values().copied().max())
            .unwrap_or(0)
    }

    /// Fraction of artifacts runnable in the first wave.
    pub fn parallelism_factor(&self) -> f64 {
        if self.artifacts.is_empty() {
            return 0.0;
        }
        self.leaves().len() as f64 / self.artifacts.len() as f64
    }

    fn known_requires<'a>(&'a self, spec: &'a ArtifactSpec) -> impl Iterator<Item = &'a str> {
        spec.requires
            .iter()
            .map(String::as_str)
            .filter(|r| self.artifacts.contains_key(*r))
    }

    /// Depth per artifact, computed without recursion over a Kahn order.
    /// `None` if the graph has a cycle.
    fn depths(&self) -> Option<BTreeMap<&str, usize>> {
        let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
        for (id, spec) in &self.artifacts {
            in_degree.insert(id, self.known_requires(spec).count());
        }

        let mut queue: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut depths: BTreeMap<&str, usize> = BTreeMap::new();

        while let Some(id) = queue.pop_front() {
            let spec = &self.artifacts[id];
            let depth = self
                .known_requires(spec)
                .filter_map(|r| depths.get(r).copied())
                .max()
                .map_or(0, |d| d + 1);
            depths.insert(id, depth);

            if let Some(deps) = self.dependents.get(id) {
                for dep in deps {
                    if let Some(deg) = in_degree.get_mut(dep.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push_back(dep);
                        }
                    }
                }
            }
        }

        if depths.len() == self.artifacts.len() {
            Some(depths)
        } else {
            None
        }
    }

    /// Partition the graph into execution waves: wave k holds every artifact
    /// whose dependencies all sit in waves 0..k. Every artifact appears in
    /// exactly one wave. Errors with the concrete cycle path if the graph
    /// is cyclic.
    pub fn execution_waves(&self) -> Result<Vec<Vec<String>>> {
        let mut completed: BTreeSet<&str> = BTreeSet::new();
        let mut pending: BTreeSet<&str> =
            self.artifacts.keys().map(String::as_str).collect();
        let mut waves = Vec::new();

        while !pending.is_empty() {
            let ready: Vec<String> = pending
                .iter()
                .copied()
                .filter(|id| {
                    self.known_requires(&self.artifacts[*id])
                        .all(|r| completed.contains(r))
                })
                .map(str::to_string)
                .collect();

            if ready.is_empty() {
                let path = self.find_cycle().unwrap_or_default();
                return Err(TrellisError::CyclicDependency { path });
            }
            for id in &ready {
                pending.remove(id.as_str());
            }
            for id in &ready {
                // Re-borrow from the map so the lifetime outlives the loop.
                if let Some((key, _)) = self.artifacts.get_key_value(id.as_str()) {
                    completed.insert(key);
                }
            }
            waves.push(ready);
        }
        Ok(waves)
    }

    /// Flat dependency-respecting order (wave order, then id order).
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        Ok(self.execution_waves()?.into_iter().flatten().collect())
    }

    /// Find one dependency cycle, if any, as the concrete path of ids:
    /// `[a, b]` means a requires b and b requires a.
    ///
    /// Three-color depth-first search with an explicit stack and a parent
    /// map, so deep graphs cannot overflow the call stack.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut color: BTreeMap<&str, Color> = self
            .artifacts
            .keys()
            .map(|id| (id.as_str(), Color::White))
            .collect();
        let mut parent: BTreeMap<&str, &str> = BTreeMap::new();

        for start in self.artifacts.keys() {
            if color[start.as_str()] != Color::White {
                continue;
            }
            // (node, requires snapshot, next edge index)
            let mut stack: Vec<(&str, Vec<&str>, usize)> = Vec::new();
            color.insert(start, Color::Gray);
            let reqs: Vec<&str> = self.known_requires(&self.artifacts[start.as_str()]).collect();
            stack.push((start, reqs, 0));

            while let Some((node, reqs, idx)) = stack.last_mut() {
                if *idx < reqs.len() {
                    let req = reqs[*idx];
                    *idx += 1;
                    match color[req] {
                        Color::Gray => {
                            // Back edge: walk parents from here up to `req`.
                            let mut path = vec![*node];
                            let mut cur = *node;
                            while cur != req {
                                cur = parent[cur];
                                path.push(cur);
                            }
                            path.reverse();
                            return Some(path.into_iter().map(String::from).collect());
                        }
                        Color::White => {
                            let node = *node;
                            parent.insert(req, node);
                            color.insert(req, Color::Gray);
                            let child_reqs: Vec<&str> =
                                self.known_requires(&self.artifacts[req]).collect();
                            stack.push((req, child_reqs, 0));
                        }
                        Color::Black => {}
                    }
                } else {
                    color.insert(*node, Color::Black);
                    stack.pop();
                }
            }
        }
        None
    }

    /// Structural problems: unknown `requires` references and cycles.
    /// Empty means the graph is executable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for spec in self.artifacts.values() {
            for req in &spec.requires {
                if !self.artifacts.contains_key(req) {
                    errors.push(format!(
                        "artifact '{}' requires unknown artifact '{}'",
                        spec.id, req
                    ));
                }
            }
        }
        if let Some(path) = self.find_cycle() {
            errors.push(format!("dependency cycle: {}", path.join(" -> ")));
        }
        errors
    }

    /// Artifacts not reachable by walking `requires` edges down from any
    /// root. These would be built but never consumed.
    pub fn find_orphans(&self) -> Vec<String> {
        let mut reachable: BTreeSet<&str> = BTreeSet::new();
        let mut queue: VecDeque<&str> = self
            .roots()
            .into_iter()
            .filter_map(|id| self.artifacts.get_key_value(&id).map(|(k, _)| k.as_str()))
            .collect();

        while let Some(id) = queue.pop_front() {
            if !reachable.insert(id) {
                continue;
            }
            for req in self.known_requires(&self.artifacts[id]) {
                queue.push_back(req);
            }
        }

        self.artifacts
            .keys()
            .filter(|id| !reachable.contains(id.as_str()))
            .cloned()
            .collect()
    }

    /// Copy of the graph restricted to `keep`, with `requires` intersected
    /// so the result is self-contained.
    pub fn subgraph(&self, keep: &BTreeSet<String>) -> ArtifactGraph {
        let mut graph = ArtifactGraph::new();
        for (id, spec) in &self.artifacts {
            if !keep.contains(id) {
                continue;
            }
            let mut spec = spec.clone();
            spec.requires.retain(|r| keep.contains(r));
            // Fresh graph, subset of unique ids: insertion cannot collide.
            graph.dependents.entry(spec.id.clone()).or_default();
            for req in &spec.requires {
                graph
                    .dependents
                    .entry(req.clone())
                    .or_default()
                    .insert(spec.id.clone());
            }
            graph.artifacts.insert(spec.id.clone(), spec);
        }
        graph
    }

    /// Mermaid `graph TD` rendering for plan previews.
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("graph TD\n");
        for spec in self.artifacts.values() {
            if spec.requires.is_empty() {
                out.push_str(&format!("    {}\n", spec.id));
            } else {
                for req in &spec.requires {
                    out.push_str(&format!("    {} --> {}\n", req, spec.id));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str, requires: &[&str]) -> ArtifactSpec {
        ArtifactSpec::new(id, format!("{} artifact", id), format!("{} works", id))
            .with_requires(requires.iter().copied())
    }

    fn diamond() -> ArtifactGraph {
        // a and b are leaves, c needs both, d needs c
        let mut g = ArtifactGraph::new();
        g.add_all([
            spec("a", &[]),
            spec("b", &[]),
            spec("c", &["a", "b"]),
            spec("d", &["c"]),
        ])
        .unwrap();
        g
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut g = ArtifactGraph::new();
        g.add(spec("a", &[])).unwrap();
        let err = g.add(spec("a", &[])).unwrap_err();
        assert!(matches!(err, TrellisError::Planning(_)));
    }

    #[test]
    fn test_leaves_and_roots() {
        let g = diamond();
        assert_eq!(g.leaves(), vec!["a", "b"]);
        assert_eq!(g.roots(), vec!["d"]);
    }

    #[test]
    fn test_execution_waves_total_partition() {
        let g = diamond();
        let waves = g.execution_waves().unwrap();
        assert_eq!(waves, vec![vec!["a", "b"], vec!["c"], vec!["d"]]);

        let total: usize = waves.iter().map(Vec::len).sum();
        assert_eq!(total, g.len());
    }

    #[test]
    fn test_wave_members_only_depend_on_earlier_waves() {
        let g = diamond();
        let waves = g.execution_waves().unwrap();
        let mut seen: BTreeSet<String> = BTreeSet::new();
        for wave in &waves {
            for id in wave {
                let spec = g.get(id).unwrap();
                for req in &spec.requires {
                    assert!(seen.contains(req), "{} ran before its dep {}", id, req);
                }
            }
            seen.extend(wave.iter().cloned());
        }
    }

    #[test]
    fn test_depth_and_max_depth() {
        let g = diamond();
        assert_eq!(g.depth("a"), Some(0));
        assert_eq!(g.depth("c"), Some(1));
        assert_eq!(g.depth("d"), Some(2));
        assert_eq!(g.max_depth(), 2);
        assert_eq!(g.max_depth() + 1, g.execution_waves().unwrap().len());
    }

    #[test]
    fn test_two_node_cycle_detected_with_path() {
        let mut g = ArtifactGraph::new();
        g.add_all([spec("a", &["b"]), spec("b", &["a"])]).unwrap();

        let path = g.find_cycle().expect("cycle expected");
        assert_eq!(path.len(), 2);
        assert!(path.contains(&"a".to_string()));
        assert!(path.contains(&"b".to_string()));

        match g.execution_waves() {
            Err(TrellisError::CyclicDependency { path }) => assert_eq!(path.len(), 2),
            other => panic!("expected CyclicDependency, got {:?}", other),
        }
    }

    #[test]
    fn test_longer_cycle_path_is_concrete() {
        let mut g = ArtifactGraph::new();
        g.add_all([
            spec("a", &["c"]),
            spec("b", &["a"]),
            spec("c", &["b"]),
            spec("ok", &[]),
        ])
        .unwrap();

        let path = g.find_cycle().expect("cycle expected");
        assert_eq!(path.len(), 3);
        // Each hop in the path is a real `requires` edge.
        for pair in path.windows(2) {
            assert!(g.get(&pair[0]).unwrap().requires.contains(&pair[1]));
        }
        assert!(g.get(path.last().unwrap()).unwrap().requires.contains(&path[0]));
    }

    #[test]
    fn test_acyclic_graph_has_no_cycle() {
        assert!(diamond().find_cycle().is_none());
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let mut g = ArtifactGraph::new();
        g.add(spec("n0", &[])).unwrap();
        for i in 1..5_000 {
            let prev = format!("n{}", i - 1);
            g.add(spec(&format!("n{}", i), &[prev.as_str()])).unwrap();
        }
        assert!(g.find_cycle().is_none());
        assert_eq!(g.max_depth(), 4_999);
    }

    #[test]
    fn test_validate_unknown_reference() {
        let mut g = ArtifactGraph::new();
        g.add(spec("a", &["ghost"])).unwrap();
        let errors = g.validate();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("ghost"));
    }

    #[test]
    fn test_fan_in_fan_out() {
        let g = diamond();
        assert_eq!(g.fan_in("a"), 1);
        assert_eq!(g.fan_in("c"), 1);
        assert_eq!(g.fan_out("c"), 2);
        assert_eq!(g.fan_out("a"), 0);
    }

    #[test]
    fn test_dependents_of() {
        let g = diamond();
        assert_eq!(g.dependents_of("a"), BTreeSet::from(["c".to_string()]));
        assert!(g.dependents_of("d").is_empty());
    }

    #[test]
    fn test_find_orphans() {
        let mut g = diamond();
        // an isolated node is its own root, not an orphan
        g.add(spec("island", &[])).unwrap();
        assert!(g.find_orphans().is_empty());

        // a cycle hanging off no root is unreachable from every root
        g.add_all([spec("x", &["y"]), spec("y", &["x"])]).unwrap();
        assert_eq!(g.find_orphans(), vec!["x", "y"]);
    }

    #[test]
    fn test_subgraph_intersects_requires() {
        let g = diamond();
        let keep: BTreeSet<String> = ["c", "d"].into_iter().map(String::from).collect();
        let sub = g.subgraph(&keep);
        assert_eq!(sub.len(), 2);
        assert!(sub.get("c").unwrap().requires.is_empty());
        assert_eq!(sub.leaves(), vec!["c"]);
    }

    #[test]
    fn test_parallelism_factor() {
        // 6 leaves out of 8 artifacts
        let mut g = ArtifactGraph::new();
        for i in 0..6 {
            g.add(spec(&format!("leaf{}", i), &[])).unwrap();
        }
        g.add(spec("mid", &["leaf0", "leaf1"])).unwrap();
        g.add(spec("top", &["mid"])).unwrap();
        assert!((g.parallelism_factor() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_serde_roundtrip_rebuilds_dependents() {
        let g = diamond();
        let json = serde_json::to_string(&g).unwrap();
        let back: ArtifactGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(back, g);
        assert_eq!(back.fan_in("a"), 1);
        assert_eq!(back.dependents_of("c"), BTreeSet::from(["d".to_string()]));
    }

    #[test]
    fn test_to_mermaid_lists_edges() {
        let g = diamond();
        let mermaid = g.to_mermaid();
        assert!(mermaid.starts_with("graph TD"));
        assert!(mermaid.contains("a --> c"));
        assert!(mermaid.contains("c --> d"));
    }
}
