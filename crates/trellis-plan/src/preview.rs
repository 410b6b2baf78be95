use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use trellis_core::{model_distribution, select_model_tier, ArtifactGraph, ModelTier, Result};

/// Rough per-artifact cost of one creation call by tier.
#[derive(Debug, Clone, Copy)]
struct TierCost {
    tokens: u64,
    cost_usd: f64,
    duration_s: f64,
}

const fn tier_cost(tier: ModelTier) -> TierCost {
    match tier {
        ModelTier::Small => TierCost {
            tokens: 800,
            cost_usd: 0.001,
            duration_s: 2.0,
        },
        ModelTier::Medium => TierCost {
            tokens: 2_500,
            cost_usd: 0.01,
            duration_s: 5.0,
        },
        ModelTier::Large => TierCost {
            tokens: 6_000,
            cost_usd: 0.09,
            duration_s: 12.0,
        },
    }
}

/// What executing a plan would cost, shown to callers before they commit.
///
/// Duration assumes each wave runs fully parallel: the wave costs as much
/// as its slowest member, and waves run back to back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPreview {
    pub artifact_count: usize,
    pub wave_count: usize,
    pub model_distribution: BTreeMap<ModelTier, usize>,
    pub estimated_tokens: u64,
    pub estimated_cost_usd: f64,
    pub estimated_duration_s: f64,
    pub parallelism_factor: f64,
}

impl PlanPreview {
    pub fn build(graph: &ArtifactGraph) -> Result<Self> {
        let waves = graph.execution_waves()?;
        let distribution = model_distribution(graph);

        let mut tokens = 0u64;
        let mut cost = 0.0f64;
        for (tier, count) in &distribution {
            let per = tier_cost(*tier);
            tokens += per.tokens * *count as u64;
            cost += per.cost_usd * *count as f64;
        }

        let mut duration = 0.0f64;
        for wave in &waves {
            let slowest = wave
                .iter()
                .filter_map(|id| graph.get(id))
                .map(|spec| tier_cost(select_model_tier(spec, graph)).duration_s)
                .fold(0.0f64, f64::max);
            duration += slowest;
        }

        Ok(Self {
            artifact_count: graph.len(),
            wave_count: waves.len(),
            model_distribution: distribution,
            estimated_tokens: tokens,
            estimated_cost_usd: cost,
            estimated_duration_s: duration,
            parallelism_factor: graph.parallelism_factor(),
        })
    }

    pub fn summary(&self) -> String {
        format!(
            "{} artifacts in {} waves, ~{} tokens, ~${:.2}, ~{:.0}s wall clock ({:.0}% parallel)",
            self.artifact_count,
            self.wave_count,
            self.estimated_tokens,
            self.estimated_cost_usd,
            self.estimated_duration_s,
            self.parallelism_factor * 100.0,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::{ArtifactSpec, TrellisError};

    fn graph() -> ArtifactGraph {
        let mut g = ArtifactGraph::new();
        g.add_all([
            ArtifactSpec::new("a", "a", "a"),
            ArtifactSpec::new("b", "b", "b"),
            ArtifactSpec::new("mid", "mid", "mid").with_requires(["a", "b"]),
            ArtifactSpec::new("top", "top", "top").with_requires(["mid"]),
        ])
        .unwrap();
        g
    }

    #[test]
    fn test_preview_counts_and_waves() {
        let preview = PlanPreview::build(&graph()).unwrap();
        assert_eq!(preview.artifact_count, 4);
        assert_eq!(preview.wave_count, 3);
        assert!((preview.parallelism_factor - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_duration_sums_wave_maxima() {
        // wave 0: two small (2s max), wave 1: medium (5s), wave 2: medium (5s)
        let preview = PlanPreview::build(&graph()).unwrap();
        assert!((preview.estimated_duration_s - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_cost_follows_distribution() {
        let preview = PlanPreview::build(&graph()).unwrap();
        // 2 small + 2 medium
        assert_eq!(preview.estimated_tokens, 2 * 800 + 2 * 2_500);
        assert!((preview.estimated_cost_usd - (2.0 * 0.001 + 2.0 * 0.01)).abs() < 1e-9);
    }

    #[test]
    fn test_cyclic_graph_cannot_be_previewed() {
        let mut g = ArtifactGraph::new();
        g.add_all([
            ArtifactSpec::new("a", "a", "a").with_requires(["b"]),
            ArtifactSpec::new("b", "b", "b").with_requires(["a"]),
        ])
        .unwrap();
        assert!(matches!(
            PlanPreview::build(&g),
            Err(TrellisError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_summary_mentions_counts() {
        let summary = PlanPreview::build(&graph()).unwrap().summary();
        assert!(summary.contains("4 artifacts"));
        assert!(summary.contains("3 waves"));
    }
}
