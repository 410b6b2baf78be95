//! Core model for the trellis build agent: artifact specs, the dependency
//! graph with wave scheduling and cycle detection, structural health
//! signals, content hashing, model-tier selection, and the two injected
//! capability traits the rest of the workspace builds on.

pub mod artifact;
pub mod error;
pub mod graph;
pub mod hash;
pub mod health;
pub mod tier;
pub mod traits;

pub use artifact::{ArtifactLimits, ArtifactSpec};
pub use error::{Result, TrellisError};
pub use graph::ArtifactGraph;
pub use health::{build_simplification_hint, signal_plan_health, PlanHealth, RiskSignal};
pub use tier::{model_distribution, select_model_tier, ModelTier};
pub use traits::{ArtifactCreator, CreateContext, GenerateOptions, ModelClient};
