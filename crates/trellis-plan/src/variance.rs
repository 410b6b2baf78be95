use serde::{Deserialize, Serialize};

/// How a batch of candidate plans is made to differ from one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceStrategy {
    /// Rotate through prompt styles at a fixed temperature.
    Prompting,
    /// Same prompt, stepped temperatures.
    Temperature,
    /// Same prompt, rotated structural constraints.
    Constraints,
    /// Rotate style, temperature, and constraints together.
    Mixed,
}

/// Named prompt style. Each carries a structural target a reviewer can
/// check on the resulting graph, not just a tone of voice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStyle {
    MaximizeParallelism,
    Minimal,
    Thorough,
    Modular,
    RiskFirst,
}

impl PromptStyle {
    pub const ALL: [PromptStyle; 5] = [
        PromptStyle::MaximizeParallelism,
        PromptStyle::Minimal,
        PromptStyle::Thorough,
        PromptStyle::Modular,
        PromptStyle::RiskFirst,
    ];

    /// Prompt block appended to the goal. Targets are phrased so they can
    /// be verified against the parsed graph (leaf ratio, artifact count,
    /// per-artifact dependency count).
    pub fn prompt_block(&self) -> &'static str {
        match self {
            PromptStyle::MaximizeParallelism => {
                "Structure the plan for parallel execution: at least half of \
                 the artifacts must declare no dependencies so they can all \
                 start in the first wave."
            }
            PromptStyle::Minimal => {
                "Produce the smallest plan that satisfies the goal: at most \
                 seven artifacts, and none that exists only for bookkeeping."
            }
            PromptStyle::Thorough => {
                "Cover every concern the goal implies, including validation, \
                 error paths, and tests, each as its own artifact with an \
                 explicit contract."
            }
            PromptStyle::Modular => {
                "Group the work into modules with narrow seams: no artifact \
                 may declare more than three dependencies."
            }
            PromptStyle::RiskFirst => {
                "Put the riskiest, least-understood artifacts first: they \
                 must declare no dependencies so they execute in the first \
                 wave and fail fast."
            }
        }
    }
}

const TEMPERATURE_LADDER: [f32; 3] = [0.3, 0.6, 0.9];

const CONSTRAINT_SETS: [&str; 3] = [
    "No artifact may declare more than three dependencies.",
    "The plan must contain at most eight artifacts.",
    "Every artifact must map to exactly one produced file.",
];

const DEFAULT_TEMPERATURE: f32 = 0.7;

/// One candidate's generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarianceConfig {
    #[serde(default)]
    pub style: Option<PromptStyle>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub constraints: Vec<String>,
}

fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}

impl Default for VarianceConfig {
    fn default() -> Self {
        Self {
            style: None,
            temperature: DEFAULT_TEMPERATURE,
            constraints: Vec::new(),
        }
    }
}

/// The n configs a strategy produces. Fully deterministic: same strategy
/// and n always yield the same configs in the same order.
pub fn variance_plan(strategy: VarianceStrategy, n: usize) -> Vec<VarianceConfig> {
    (0..n)
        .map(|i| match strategy {
            VarianceStrategy::Prompting => VarianceConfig {
                style: Some(PromptStyle::ALL[i % PromptStyle::ALL.len()]),
                ..VarianceConfig::default()
            },
            VarianceStrategy::Temperature => VarianceConfig {
                temperature: TEMPERATURE_LADDER[i % TEMPERATURE_LADDER.len()],
                ..VarianceConfig::default()
            },
            VarianceStrategy::Constraints => VarianceConfig {
                constraints: vec![CONSTRAINT_SETS[i % CONSTRAINT_SETS.len()].to_string()],
                ..VarianceConfig::default()
            },
            VarianceStrategy::Mixed => VarianceConfig {
                style: Some(PromptStyle::ALL[i % PromptStyle::ALL.len()]),
                temperature: TEMPERATURE_LADDER[i % TEMPERATURE_LADDER.len()],
                constraints: vec![CONSTRAINT_SETS[i % CONSTRAINT_SETS.len()].to_string()],
            },
        })
        .collect()
}

/// Compose the full planning prompt for one config. Deterministic string
/// composition; the temperature travels separately in `GenerateOptions`.
pub fn apply_variance(goal: &str, config: &VarianceConfig) -> String {
    let mut prompt = format!(
        "Plan the following goal as a set of artifacts.\n\nGoal: {}\n\n\
         Respond with ONLY a JSON array of artifacts, each an object with \
         \"id\", \"description\", \"contract\", optional \"produces_file\", \
         and \"requires\" (an array of artifact ids).",
        goal.trim()
    );
    if let Some(style) = config.style {
        prompt.push_str("\n\n");
        prompt.push_str(style.prompt_block());
    }
    for constraint in &config.constraints {
        prompt.push_str("\nConstraint: ");
        prompt.push_str(constraint);
    }
    prompt
}
