//! Planning side of trellis: generate several candidate artifact graphs
//! for a goal under a variance strategy, repair cycles with one bounded
//! model call, pick a winner, and preview what executing it would cost.

pub mod generate;
pub mod parse;
pub mod preview;
pub mod resolver;
pub mod select;
pub mod variance;

#[cfg(test)]
pub(crate) mod testing;

pub use generate::{Candidate, CandidateGenerator};
pub use parse::{parse_plan, ParseOutcome};
pub use preview::PlanPreview;
pub use resolver::CycleResolver;
pub use select::{SelectionStrategy, Selector};
pub use variance::{
    apply_variance, variance_plan, PromptStyle, VarianceConfig, VarianceStrategy,
};
