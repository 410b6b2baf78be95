use thiserror::Error;

/// All errors produced by the trellis crates.
#[derive(Debug, Error)]
pub enum TrellisError {
    // Planning — fatal before execution starts
    #[error("planning failed: {0}")]
    Planning(String),

    #[error("cyclic dependency: {}", .path.join(" -> "))]
    CyclicDependency { path: Vec<String> },

    #[error("no candidate plans to select from")]
    NoCandidates,

    // Model access
    #[error("model request failed: {0}")]
    ModelRequest(String),

    #[error("could not parse model response: {0}")]
    ModelParse(String),

    // Execution — scoped to one artifact, never fatal to the run
    #[error("artifact '{artifact}' failed: {message}")]
    ArtifactExecution { artifact: String, message: String },

    // Cache
    #[error("cache integrity: {0}")]
    CacheIntegrity(String),

    #[error("database error: {0}")]
    Database(String),

    // Persistence
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;
