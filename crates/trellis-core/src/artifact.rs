use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One planned unit of output: a file or module the agent must produce,
/// together with the contract it has to satisfy and the artifacts it
/// depends on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSpec {
    /// Unique identifier within a plan (e.g. "parser", "config_loader").
    pub id: String,
    /// What this artifact is, in one or two sentences.
    pub description: String,
    /// The interface or behavior the produced content must satisfy.
    pub contract: String,
    /// Target file path, if the artifact maps to a single file.
    #[serde(default)]
    pub produces_file: Option<String>,
    /// Ids of artifacts that must exist before this one can be created.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Free-form annotations carried through planning and execution.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl ArtifactSpec {
    pub fn new(
        id: impl Into<String>,
        description: impl Into<String>,
        contract: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            contract: contract.into(),
            produces_file: None,
            requires: BTreeSet::new(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_requires<I, S>(mut self, requires: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires = requires.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.produces_file = Some(path.into());
        self
    }

    /// An artifact with no dependencies can run in the first wave.
    pub fn is_leaf(&self) -> bool {
        self.requires.is_empty()
    }
}

/// Structural bounds a generated plan must stay inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactLimits {
    #[serde(default = "default_max_artifacts")]
    pub max_artifacts: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
}

fn default_max_artifacts() -> usize {
    50
}

fn default_max_depth() -> usize {
    10
}

impl Default for ArtifactLimits {
    fn default() -> Self {
        Self {
            max_artifacts: default_max_artifacts(),
            max_depth: default_max_depth(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_detection() {
        let leaf = ArtifactSpec::new("models", "data types", "structs compile");
        assert!(leaf.is_leaf());

        let inner = ArtifactSpec::new("api", "http layer", "routes respond")
            .with_requires(["models"]);
        assert!(!inner.is_leaf());
    }

    #[test]
    fn test_spec_serialization_defaults() {
        let json = r#"{"id": "a", "description": "d", "contract": "c"}"#;
        let spec: ArtifactSpec = serde_json::from_str(json).unwrap();
        assert!(spec.requires.is_empty());
        assert!(spec.produces_file.is_none());
        assert!(spec.metadata.is_null());
    }

    #[test]
    fn test_spec_roundtrip() {
        let spec = ArtifactSpec::new("api", "http layer", "routes respond")
            .with_requires(["models", "config"])
            .with_file("src/api.rs");
        let json = serde_json::to_string(&spec).unwrap();
        let back: ArtifactSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_default_limits() {
        let limits = ArtifactLimits::default();
        assert_eq!(limits.max_artifacts, 50);
        assert_eq!(limits.max_depth, 10);
    }
}
