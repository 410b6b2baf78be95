use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use trellis_core::{GenerateOptions, ModelClient, Result, TrellisError};

use crate::generate::Candidate;
use crate::parse::extract_json;

/// How the winning candidate is picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// First candidate, no evaluation.
    Passthrough,
    /// Deterministic local scoring, no model calls.
    Heuristic,
    /// Three personas each vote for an index; most votes wins.
    Voting,
    /// One evaluator scores every candidate 0-10 against a rubric.
    Judge,
}

/// Picks one candidate out of a set. Voting and Judge need a model;
/// Passthrough and Heuristic never call one.
pub struct Selector {
    strategy: SelectionStrategy,
    model: Option<Arc<dyn ModelClient>>,
}

const PERSONAS: [(&str, &str); 3] = [
    (
        "architect",
        "You care about clean module boundaries and how the plan will hold up as the system grows.",
    ),
    (
        "maintainer",
        "You care about simplicity: the plan that is easiest to understand, debug, and change wins.",
    ),
    (
        "pragmatist",
        "You care about shipping: the fewest artifacts that reach a working result.",
    ),
];

const JUDGE_RUBRIC: &str = "Score the plan 0-10: completeness against the goal (does every \
     implied concern have an artifact?), dependency hygiene (no hub artifacts, no gratuitous \
     coupling), and executability (clear contracts, parallelizable waves).";

impl Selector {
    pub fn passthrough() -> Self {
        Self {
            strategy: SelectionStrategy::Passthrough,
            model: None,
        }
    }

    pub fn heuristic() -> Self {
        Self {
            strategy: SelectionStrategy::Heuristic,
            model: None,
        }
    }

    pub fn voting(model: Arc<dyn ModelClient>) -> Self {
        Self {
            strategy: SelectionStrategy::Voting,
            model: Some(model),
        }
    }

    pub fn judge(model: Arc<dyn ModelClient>) -> Self {
        Self {
            strategy: SelectionStrategy::Judge,
            model: Some(model),
        }
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Select the winning candidate. An empty set is an error under every
    /// strategy.
    pub async fn select<'a>(&self, candidates: &'a [Candidate], goal: &str) -> Result<&'a Candidate> {
        if candidates.is_empty() {
            return Err(TrellisError::NoCandidates);
        }
        match self.strategy {
            SelectionStrategy::Passthrough => Ok(&candidates[0]),
            SelectionStrategy::Heuristic => Ok(self.select_heuristic(candidates)),
            SelectionStrategy::Voting => self.select_by_voting(candidates, goal).await,
            SelectionStrategy::Judge => self.select_by_judge(candidates, goal).await,
        }
    }

    fn select_heuristic<'a>(&self, candidates: &'a [Candidate]) -> &'a Candidate {
        let mut best = 0;
        let mut best_score = f64::MIN;
        for (i, candidate) in candidates.iter().enumerate() {
            let score = heuristic_score(&render_candidate(candidate));
            debug!(candidate = i, score, "heuristic score");
            // strict comparison: ties keep the lowest index
            if score > best_score {
                best_score = score;
                best = i;
            }
        }
        &candidates[best]
    }

    async fn select_by_voting<'a>(
        &self,
        candidates: &'a [Candidate],
        goal: &str,
    ) -> Result<&'a Candidate> {
        let model = self.require_model()?;
        let listing = render_all(candidates);

        let calls = PERSONAS.iter().map(|(name, stance)| {
            let prompt = format!(
                "You are the {}. {}\n\nGoal: {}\n\n{}\n\
                 Which candidate is best? Respond with ONLY its number.",
                name, stance, goal, listing
            );
            async move { (*name, model.generate(&prompt, &GenerateOptions::default()).await) }
        });

        let mut tally = vec![0usize; candidates.len()];
        for (persona, outcome) in join_all(calls).await {
            let choice = match outcome {
                Ok(text) => match parse_index(&text, candidates.len()) {
                    Some(i) => i,
                    None => {
                        warn!(persona, response = %text, "unparseable vote, counting it for candidate 0");
                        0
                    }
                },
                Err(e) => {
                    warn!(persona, error = %e, "vote call failed, counting it for candidate 0");
                    0
                }
            };
            tally[choice] += 1;
        }

        let mut winner = 0;
        for i in 1..tally.len() {
            if tally[i] > tally[winner] {
                winner = i;
            }
        }
        info!(winner, ?tally, "voting complete");
        Ok(&candidates[winner])
    }

    async fn select_by_judge<'a>(
        &self,
        candidates: &'a [Candidate],
        goal: &str,
    ) -> Result<&'a Candidate> {
        let model = self.require_model()?;

        let calls = candidates.iter().enumerate().map(|(i, candidate)| {
            let prompt = format!(
                "{}\n\nGoal: {}\n\nCandidate {}:\n{}\n\
                 Respond with ONLY valid JSON: {{\"score\": <0-10>, \"reason\": \"...\"}}",
                JUDGE_RUBRIC,
                goal,
                i,
                render_candidate(candidate)
            );
            async move { model.generate(&prompt, &GenerateOptions::default()).await }
        });

        let mut winner = 0;
        let mut best_score = f64::MIN;
        for (i, outcome) in join_all(calls).await.into_iter().enumerate() {
            let score = match outcome {
                Ok(text) => parse_score(&text).unwrap_or_else(|| {
                    warn!(candidate = i, "unparseable judge score, scoring 0");
                    0.0
                }),
                Err(e) => {
                    warn!(candidate = i, error = %e, "judge call failed, scoring 0");
                    0.0
                }
            };
            debug!(candidate = i, score, "judge score");
            if score > best_score {
                best_score = score;
                winner = i;
            }
        }
        info!(winner, best_score, "judging complete");
        Ok(&candidates[winner])
    }

    fn require_model(&self) -> Result<&Arc<dyn ModelClient>> {
        self.model.as_ref().ok_or_else(|| {
            TrellisError::Planning("this selection strategy requires a model".to_string())
        })
    }
}

/// Render one candidate's graph as a compact plan summary.
fn render_candidate(candidate: &Candidate) -> String {
    let mut out = String::new();
    for spec in candidate.graph.artifacts() {
        out.push_str(&format!("- {}: {}\n", spec.id, spec.description));
        out.push_str(&format!("  contract: {}\n", spec.contract));
        if !spec.requires.is_empty() {
            let reqs: Vec<&str> = spec.requires.iter().map(String::as_str).collect();
            out.push_str(&format!("  requires: {}\n", reqs.join(", ")));
        }
    }
    out
}

fn render_all(candidates: &[Candidate]) -> String {
    let mut out = String::new();
    for (i, candidate) in candidates.iter().enumerate() {
        out.push_str(&format!("Candidate {}:\n{}\n", i, render_candidate(candidate)));
    }
    out
}

const HEDGING_PHRASES: [&str; 5] = ["might", "perhaps", "possibly", "not sure", "unclear"];
const UNFINISHED_MARKERS: [&str; 3] = ["...", "TODO", "TBD"];

/// Deterministic local score of a rendered plan. Favors summaries in a
/// completeness-appropriate length band with visible structure; penalizes
/// hedging and unfinished fragments.
fn heuristic_score(summary: &str) -> f64 {
    let mut score = 0.0;

    score += match summary.len() {
        200..=2000 => 2.0,
        100..=199 | 2001..=4000 => 1.0,
        _ => 0.0,
    };

    if summary.lines().filter(|l| l.trim_start().starts_with('-')).count() >= 3 {
        score += 1.0;
    }
    if summary.contains("contract:") {
        score += 0.5;
    }
    if summary.contains("requires:") {
        score += 0.5;
    }

    let lower = summary.to_lowercase();
    for phrase in HEDGING_PHRASES {
        if lower.contains(phrase) {
            score -= 1.0;
        }
    }
    for marker in UNFINISHED_MARKERS {
        if summary.contains(marker) {
            score -= 1.0;
        }
    }
    score
}

/// First integer in the response, if it is a valid candidate index.
fn parse_index(text: &str, len: usize) -> Option<usize> {
    text.split(|c: char| !c.is_ascii_digit())
        .find(|s| !s.is_empty())
        .and_then(|s| s.parse::<usize>().ok())
        .filter(|i| *i < len)
}

#[derive(Deserialize)]
struct JudgeScore {
    score: f64,
}

fn parse_score(text: &str) -> Option<f64> {
    serde_json::from_str::<JudgeScore>(extract_json(text))
        .ok()
        .map(|j| j.score.clamp(0.0, 10.0))
}
