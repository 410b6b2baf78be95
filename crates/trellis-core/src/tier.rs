use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSpec;
use crate::graph::ArtifactGraph;

/// Which size of model an artifact should be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Small,
    Medium,
    Large,
}

impl ModelTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelTier::Small => "small",
            ModelTier::Medium => "medium",
            ModelTier::Large => "large",
        }
    }
}

/// Leaves are self-contained and cheap; shallow-fan-out artifacts get a
/// medium model; everything else gets the large one.
pub fn select_model_tier(spec: &ArtifactSpec, graph: &ArtifactGraph) -> ModelTier {
    if graph.depth(&spec.id).unwrap_or(0) == 0 {
        ModelTier::Small
    } else if spec.requires.len() <= 2 {
        ModelTier::Medium
    } else {
        ModelTier::Large
    }
}

/// How many artifacts land in each tier, for cost previews.
pub fn model_distribution(graph: &ArtifactGraph) -> BTreeMap<ModelTier, usize> {
    let mut dist = BTreeMap::new();
    for spec in graph.artifacts() {
        *dist.entry(select_model_tier(spec, graph)).or_insert(0) += 1;
    }
    dist
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph() -> ArtifactGraph {
        let mut g = ArtifactGraph::new();
        g.add_all([
            ArtifactSpec::new("a", "a", "a"),
            ArtifactSpec::new("b", "b", "b"),
            ArtifactSpec::new("c", "c", "c"),
            ArtifactSpec::new("mid", "mid", "mid").with_requires(["a", "b"]),
            ArtifactSpec::new("top", "top", "top").with_requires(["a", "b", "c"]),
        ])
        .unwrap();
        g
    }

    #[test]
    fn test_tier_selection() {
        let g = graph();
        assert_eq!(select_model_tier(g.get("a").unwrap(), &g), ModelTier::Small);
        assert_eq!(select_model_tier(g.get("mid").unwrap(), &g), ModelTier::Medium);
        assert_eq!(select_model_tier(g.get("top").unwrap(), &g), ModelTier::Large);
    }

    #[test]
    fn test_distribution_counts_every_artifact() {
        let g = graph();
        let dist = model_distribution(&g);
        assert_eq!(dist[&ModelTier::Small], 3);
        assert_eq!(dist[&ModelTier::Medium], 1);
        assert_eq!(dist[&ModelTier::Large], 1);
        assert_eq!(dist.values().sum::<usize>(), g.len());
    }

    #[test]
    fn test_tier_serializes_snake_case() {
        let json = serde_json::to_string(&ModelTier::Medium).unwrap();
        assert_eq!(json, r#""medium""#);
    }
}
