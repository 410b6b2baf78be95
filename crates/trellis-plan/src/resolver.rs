use std::sync::Arc;

use tracing::{info, warn};

use trellis_core::{
    ArtifactGraph, ArtifactSpec, GenerateOptions, ModelClient, Result, TrellisError,
};

use crate::parse::{parse_plan, ParseOutcome};

/// Model-assisted cycle repair.
///
/// Acyclic graphs pass straight through. A cyclic graph gets exactly one
/// repair call: the model sees the concrete cycle path, the complete
/// artifact list, and three diagnostic questions, and must answer with a
/// full replacement artifact list. If the repaired graph still has a
/// cycle the plan is unrecoverable.
pub struct CycleResolver {
    model: Arc<dyn ModelClient>,
}

impl CycleResolver {
    pub fn new(model: Arc<dyn ModelClient>) -> Self {
        Self { model }
    }

    pub async fn resolve(&self, graph: ArtifactGraph, goal: &str) -> Result<ArtifactGraph> {
        let Some(path) = graph.find_cycle() else {
            return Ok(graph);
        };
        warn!(cycle = %path.join(" -> "), "plan has a dependency cycle, attempting repair");

        let prompt = build_repair_prompt(&graph, goal, &path)?;
        let response = self
            .model
            .generate(&prompt, &GenerateOptions::default())
            .await?;

        match parse_plan(&response) {
            ParseOutcome::Parsed(repaired) => {
                if let Some(remaining) = repaired.find_cycle() {
                    return Err(TrellisError::Planning(format!(
                        "cycle remains after repair: {}",
                        remaining.join(" -> ")
                    )));
                }
                info!(artifacts = repaired.len(), "cycle repaired");
                Ok(repaired)
            }
            ParseOutcome::Malformed(reason) => Err(TrellisError::Planning(format!(
                "cycle repair returned an unusable plan: {}",
                reason
            ))),
        }
    }
}

fn build_repair_prompt(graph: &ArtifactGraph, goal: &str, path: &[String]) -> Result<String> {
    let artifacts: Vec<&ArtifactSpec> = graph.artifacts().collect();
    let listing = serde_json::to_string_pretty(&artifacts)?;
    Ok(format!(
        "This artifact plan for the goal below contains a dependency cycle \
         and cannot be executed.\n\n\
         Goal: {}\n\n\
         Cycle: {}\n\n\
         Current artifacts:\n{}\n\n\
         Break the cycle. Consider:\n\
         1. Is one of the dependencies in the cycle optional and removable?\n\
         2. Can one artifact be split into an interface artifact and an \
         implementation artifact so both sides depend on the interface?\n\
         3. Are two artifacts duplicates that should be merged?\n\n\
         Respond with ONLY the complete corrected JSON array of artifacts, \
         same schema as above.",
        goal.trim(),
        path.join(" -> "),
        listing
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedModel;

    fn spec(id: &str, requires: &[&str]) -> ArtifactSpec {
        ArtifactSpec::new(id, id, id).with_requires(requires.iter().copied())
    }

    fn cyclic_graph() -> ArtifactGraph {
        let mut g = ArtifactGraph::new();
        g.add_all([spec("a", &["b"]), spec("b", &["a"])]).unwrap();
        g
    }

    const REPAIRED: &str = r#"[
        {"id": "a", "description": "a", "contract": "a"},
        {"id": "b", "description": "b", "contract": "b", "requires": ["a"]}
    ]"#;

    #[tokio::test]
    async fn test_acyclic_graph_passes_through_without_model_call() {
        let mut g = ArtifactGraph::new();
        g.add_all([spec("a", &[]), spec("b", &["a"])]).unwrap();

        let model = Arc::new(ScriptedModel::failing());
        let resolver = CycleResolver::new(model.clone());
        let out = resolver.resolve(g.clone(), "goal").await.unwrap();
        assert_eq!(out, g);
        assert_eq!(model.call_count(), 0);
    }

    #[tokio::test]
    async fn test_cycle_repaired_in_one_call() {
        let model = Arc::new(ScriptedModel::new(vec![REPAIRED.to_string()]));
        let resolver = CycleResolver::new(model.clone());
        let out = resolver.resolve(cyclic_graph(), "goal").await.unwrap();
        assert!(out.find_cycle().is_none());
        assert_eq!(model.call_count(), 1);

        // the repair prompt names the cycle and asks the three questions
        let prompts = model.prompts.lock().unwrap();
        assert!(prompts[0].contains("Cycle:"));
        assert!(prompts[0].contains("optional"));
        assert!(prompts[0].contains("interface"));
        assert!(prompts[0].contains("duplicates") || prompts[0].contains("merged"));
    }

    #[tokio::test]
    async fn test_still_cyclic_repair_is_fatal_after_one_attempt() {
        let still_cyclic = r#"[
            {"id": "a", "description": "a", "contract": "a", "requires": ["b"]},
            {"id": "b", "description": "b", "contract": "b", "requires": ["a"]}
        ]"#;
        let model = Arc::new(ScriptedModel::repeating(still_cyclic));
        let resolver = CycleResolver::new(model.clone());
        let err = resolver.resolve(cyclic_graph(), "goal").await.unwrap_err();
        assert!(matches!(err, TrellisError::Planning(_)));
        // exactly one attempt, never a retry chain
        assert_eq!(model.call_count(), 1);
    }

    #[tokio::test]
    async fn test_unparseable_repair_is_fatal() {
        let model = Arc::new(ScriptedModel::repeating("cannot help"));
        let resolver = CycleResolver::new(model);
        let err = resolver.resolve(cyclic_graph(), "goal").await.unwrap_err();
        assert!(matches!(err, TrellisError::Planning(_)));
    }
}
