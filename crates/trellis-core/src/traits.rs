use std::collections::BTreeMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::artifact::ArtifactSpec;
use crate::error::Result;

/// Tuning knobs for a single generation call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
}

fn default_temperature() -> f32 {
    0.7
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: None,
        }
    }
}

/// Text-generation capability. Planning talks to the model only through
/// this; the engine never sees providers, wire formats, or retries.
pub trait ModelClient: Send + Sync + 'static {
    fn generate(&self, prompt: &str, options: &GenerateOptions) -> BoxFuture<'_, Result<String>>;
}

/// Everything a creation call may see: the overall goal and the outputs of
/// the dependencies that already completed.
#[derive(Debug, Clone, Default)]
pub struct CreateContext {
    pub goal: String,
    pub completed: BTreeMap<String, String>,
}

/// Artifact-creation capability. The executor hands over one spec plus its
/// dependency outputs and gets back the produced content.
pub trait ArtifactCreator: Send + Sync + 'static {
    fn create(&self, spec: &ArtifactSpec, ctx: &CreateContext) -> BoxFuture<'_, Result<String>>;
}
