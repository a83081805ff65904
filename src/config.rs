//! Benchmark run configuration.
//!
//! Configuration is read from a `sumarena.toml` file and validated before a
//! run starts; every field has a sensible default so a minimal file only
//! needs the model lists.
//!
//! # Configuration File Format
//!
//! ```toml
//! name = "summer-benchmark"
//!
//! [[generators]]
//! id = "claude-sonnet-4-5"
//! temperature = 0.3
//! max_tokens = 1024
//!
//! [[generators]]
//! id = "qwen2.5-coder-32b"
//! local = true
//!
//! judges = ["gpt-4o", "gemini-2.5-pro"]
//! min_judges = 2
//!
//! [evaluation.iterative]
//! enabled = true
//! sample_size = 50
//! max_rounds = 3
//! target_rank = 3
//!
//! [evaluation.judge]
//! enabled = true
//! pairwise = true
//! max_comparisons_per_judge = 600
//!
//! [evaluation.contrastive]
//! enabled = true
//! distractor_count = 9
//! method = "both"
//!
//! [evaluation.retrieval]
//! enabled = true
//! k_values = [1, 5, 10]
//!
//! [weights]
//! judge = 0.30
//! contrastive = 0.20
//! retrieval = 0.20
//! iterative = 0.20
//! downstream = 0.05
//! self = 0.05
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;
use crate::store::models::ScoringMethod;

/// One generator model under evaluation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    pub id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Local models are scheduled on their own stream to avoid GPU
    /// contention; cloud models all run concurrently.
    #[serde(default)]
    pub local: bool,
}

impl ModelSpec {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            local: false,
        }
    }

    /// Parameter count in billions parsed from the model id (`"-70b"`,
    /// `":8b"` and similar suffixes), if the id carries one.
    pub fn param_count_b(&self) -> Option<f64> {
        self.id
            .split(|c: char| !c.is_ascii_alphanumeric() && c != '.')
            .filter_map(|token| {
                let token = token.to_ascii_lowercase();
                let digits = token.strip_suffix('b')?;
                if digits.is_empty() {
                    return None;
                }
                digits.parse::<f64>().ok()
            })
            .next_back()
    }
}

/// Which contrastive scoring methods to run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MethodChoice {
    Embedding,
    Llm,
    #[default]
    Both,
}

impl MethodChoice {
    pub fn methods(&self) -> Vec<ScoringMethod> {
        match self {
            Self::Embedding => vec![ScoringMethod::Embedding],
            Self::Llm => vec![ScoringMethod::Llm],
            Self::Both => vec![ScoringMethod::Embedding, ScoringMethod::Llm],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterativeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    #[serde(default = "default_target_rank")]
    pub target_rank: usize,
}

impl Default for IterativeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: default_sample_size(),
            max_rounds: default_max_rounds(),
            target_rank: default_target_rank(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeEvalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub pairwise: bool,
    #[serde(default = "default_max_comparisons")]
    pub max_comparisons_per_judge: usize,
}

impl Default for JudgeEvalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pairwise: true,
            max_comparisons_per_judge: default_max_comparisons(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContrastiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_distractor_count")]
    pub distractor_count: usize,
    #[serde(default)]
    pub method: MethodChoice,
}

impl Default for ContrastiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            distractor_count: default_distractor_count(),
            method: MethodChoice::Both,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_k_values")]
    pub k_values: Vec<u32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            k_values: default_k_values(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct EvaluationConfig {
    #[serde(default)]
    pub iterative: IterativeConfig,
    #[serde(default)]
    pub judge: JudgeEvalConfig,
    #[serde(default)]
    pub contrastive: ContrastiveConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

/// Per-category weights for the overall score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CategoryWeights {
    #[serde(default = "default_judge_weight")]
    pub judge: f64,
    #[serde(default = "default_contrastive_weight")]
    pub contrastive: f64,
    #[serde(default = "default_retrieval_weight")]
    pub retrieval: f64,
    #[serde(default = "default_iterative_weight")]
    pub iterative: f64,
    #[serde(default = "default_optional_weight")]
    pub downstream: f64,
    #[serde(default = "default_optional_weight", rename = "self")]
    pub self_eval: f64,
}

impl Default for CategoryWeights {
    fn default() -> Self {
        Self {
            judge: default_judge_weight(),
            contrastive: default_contrastive_weight(),
            retrieval: default_retrieval_weight(),
            iterative: default_iterative_weight(),
            downstream: default_optional_weight(),
            self_eval: default_optional_weight(),
        }
    }
}

impl CategoryWeights {
    pub fn total(&self) -> f64 {
        self.judge + self.contrastive + self.retrieval + self.iterative + self.downstream
            + self.self_eval
    }
}

/// Worker-pool widths and local-model scheduling knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConcurrencyConfig {
    #[serde(default = "default_generation_pool")]
    pub generation_pool: usize,
    #[serde(default = "default_pointwise_pool")]
    pub judge_pointwise_pool: usize,
    #[serde(default = "default_pairwise_pool")]
    pub judge_pairwise_pool: usize,
    #[serde(default = "default_contrastive_pool")]
    pub contrastive_pool: usize,
    /// Parallelism for small local models; large ones are serialized.
    #[serde(default = "default_local_parallelism")]
    pub local_model_parallelism: usize,
    /// Parameter-count threshold (billions) above which a local model is
    /// considered large.
    #[serde(default = "default_large_threshold")]
    pub large_model_threshold_b: f64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            generation_pool: default_generation_pool(),
            judge_pointwise_pool: default_pointwise_pool(),
            judge_pairwise_pool: default_pairwise_pool(),
            contrastive_pool: default_contrastive_pool(),
            local_model_parallelism: default_local_parallelism(),
            large_model_threshold_b: default_large_threshold(),
        }
    }
}

/// Full benchmark configuration, persisted on the run row so resumed runs
/// always see the settings they started with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchConfig {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub generators: Vec<ModelSpec>,
    #[serde(default)]
    pub judges: Vec<String>,
    #[serde(default = "default_min_judges")]
    pub min_judges: usize,
    #[serde(default)]
    pub embedding_model: Option<String>,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    #[serde(default)]
    pub weights: CategoryWeights,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            name: None,
            generators: Vec::new(),
            judges: Vec::new(),
            min_judges: default_min_judges(),
            embedding_model: None,
            evaluation: EvaluationConfig::default(),
            weights: CategoryWeights::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl BenchConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFailed {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BenchConfig =
            toml::from_str(&content).map_err(|source| ConfigError::ParseFailed {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate invariants the pipeline depends on. Called before a run is
    /// created; failures abort immediately rather than mid-phase.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.generators.is_empty() {
            return Err(ConfigError::MissingKey("generators".into()));
        }
        for spec in &self.generators {
            if spec.id.trim().is_empty() {
                return Err(ConfigError::Invalid("generator with empty id".into()));
            }
            if !(0.0..=2.0).contains(&spec.temperature) {
                return Err(ConfigError::Invalid(format!(
                    "temperature {} for {} outside [0, 2]",
                    spec.temperature, spec.id
                )));
            }
        }
        let judge_needed = self.evaluation.judge.enabled
            || (self.evaluation.contrastive.enabled
                && self.evaluation.contrastive.method != MethodChoice::Embedding);
        if judge_needed && self.judges.is_empty() {
            return Err(ConfigError::MissingKey("judges".into()));
        }
        if self.min_judges == 0 {
            return Err(ConfigError::Invalid("min_judges must be at least 1".into()));
        }
        if self.evaluation.contrastive.distractor_count < 2 {
            return Err(ConfigError::Invalid(
                "contrastive.distractor_count must be at least 2".into(),
            ));
        }
        if self.evaluation.retrieval.k_values.is_empty() {
            return Err(ConfigError::Invalid(
                "retrieval.k_values must not be empty".into(),
            ));
        }
        if self.evaluation.iterative.target_rank == 0 {
            return Err(ConfigError::Invalid(
                "iterative.target_rank must be at least 1".into(),
            ));
        }
        let total = self.weights.total();
        if (total - 1.0).abs() > 1e-6 {
            return Err(ConfigError::Invalid(format!(
                "category weights sum to {:.4}, expected 1.0",
                total
            )));
        }
        Ok(())
    }

    pub fn generator_ids(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.id.clone()).collect()
    }

    pub fn generator(&self, model_id: &str) -> Option<&ModelSpec> {
        self.generators.iter().find(|g| g.id == model_id)
    }
}

fn default_true() -> bool {
    true
}
fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_sample_size() -> usize {
    50
}
fn default_max_rounds() -> u32 {
    3
}
fn default_target_rank() -> usize {
    3
}
fn default_max_comparisons() -> usize {
    600
}
fn default_distractor_count() -> usize {
    9
}
fn default_k_values() -> Vec<u32> {
    vec![1, 5, 10]
}
fn default_min_judges() -> usize {
    2
}
fn default_judge_weight() -> f64 {
    0.30
}
fn default_contrastive_weight() -> f64 {
    0.20
}
fn default_retrieval_weight() -> f64 {
    0.20
}
fn default_iterative_weight() -> f64 {
    0.20
}
fn default_optional_weight() -> f64 {
    0.05
}
fn default_generation_pool() -> usize {
    4
}
fn default_pointwise_pool() -> usize {
    30
}
fn default_pairwise_pool() -> usize {
    20
}
fn default_contrastive_pool() -> usize {
    30
}
fn default_local_parallelism() -> usize {
    2
}
fn default_large_threshold() -> f64 {
    30.0
}
