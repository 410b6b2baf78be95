use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use trellis_core::{
    ArtifactGraph, ArtifactLimits, GenerateOptions, ModelClient, Result, TrellisError,
};

use crate::parse::{parse_plan, ParseOutcome};
use crate::variance::{apply_variance, variance_plan, VarianceConfig, VarianceStrategy};

/// One generated plan, immutable once produced. `index` is its position
/// in the candidate set and what voting/judging refer to.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub index: usize,
    pub graph: ArtifactGraph,
    pub config: VarianceConfig,
}

/// Fans out N concurrent plan-generation calls under a variance strategy
/// and keeps the candidates that parse and fit the structural limits.
pub struct CandidateGenerator {
    model: Arc<dyn ModelClient>,
    count: usize,
    strategy: VarianceStrategy,
    limits: ArtifactLimits,
}

impl CandidateGenerator {
    pub fn new(model: Arc<dyn ModelClient>, count: usize, strategy: VarianceStrategy) -> Self {
        Self {
            model,
            count,
            strategy,
            limits: ArtifactLimits::default(),
        }
    }

    pub fn with_limits(mut self, limits: ArtifactLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Generate candidates for a goal. A failed or malformed candidate is
    /// dropped with a warning; only an empty result set is an error.
    pub async fn generate(&self, goal: &str) -> Result<Vec<Candidate>> {
        let configs = variance_plan(self.strategy, self.count);
        debug!(count = configs.len(), strategy = ?self.strategy, "generating candidates");

        let calls = configs.iter().map(|config| {
            let prompt = apply_variance(goal, config);
            let options = GenerateOptions {
                temperature: config.temperature,
                max_tokens: None,
            };
            async move { self.model.generate(&prompt, &options).await }
        });
        let responses = join_all(calls).await;

        let mut candidates = Vec::new();
        for (slot, (response, config)) in responses.into_iter().zip(configs).enumerate() {
            let text = match response {
                Ok(text) => text,
                Err(e) => {
                    warn!(slot, error = %e, "candidate generation call failed");
                    continue;
                }
            };
            match parse_plan(&text) {
                ParseOutcome::Parsed(graph) => {
                    if let Some(reason) = self.exceeds_limits(&graph) {
                        warn!(slot, %reason, "candidate dropped");
                        continue;
                    }
                    candidates.push(Candidate {
                        index: candidates.len(),
                        graph,
                        config,
                    });
                }
                ParseOutcome::Malformed(reason) => {
                    warn!(slot, %reason, "candidate plan malformed");
                }
            }
        }

        if candidates.is_empty() {
            return Err(TrellisError::Planning(
                "no generation call produced a usable plan".to_string(),
            ));
        }
        Ok(candidates)
    }

    fn exceeds_limits(&self, graph: &ArtifactGraph) -> Option<String> {
        if graph.len() > self.limits.max_artifacts {
            return Some(format!(
                "{} artifacts exceeds the limit of {}",
                graph.len(),
                self.limits.max_artifacts
            ));
        }
        if graph.max_depth() > self.limits.max_depth {
            return Some(format!(
                "depth {} exceeds the limit of {}",
                graph.max_depth(),
                self.limits.max_depth
            ));
        }
        None
    }
}
