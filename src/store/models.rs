//! Persistent entities for the benchmark pipeline.
//!
//! Everything in this module round-trips through the store: enums carry
//! `as_str`/`from_str` pairs for their TEXT columns, and richer payloads
//! serialize to JSON blob columns via serde.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BenchConfig;
use crate::phase::Phase;

/// Fresh UUID string for a new row.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

// ── Runs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Paused,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Paused => "paused",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "paused" => Ok(Self::Paused),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Status transition graph: pending/paused start or resume into
    /// running; running ends in completed/failed or pauses; terminal
    /// states accept nothing further. Same-status writes are allowed so
    /// progress updates need no special casing.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Paused | Self::Failed),
            Self::Running => matches!(next, Self::Completed | Self::Failed | Self::Paused),
            Self::Paused => matches!(next, Self::Running | Self::Failed),
            Self::Completed | Self::Failed => false,
        }
    }
}

/// Snapshot of the benchmarked codebase, recorded at run creation.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CodebaseInfo {
    #[serde(default)]
    pub root: String,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub file_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    pub name: String,
    pub description: String,
    pub config: BenchConfig,
    pub codebase_info: CodebaseInfo,
    pub status: RunStatus,
    pub current_phase: Option<Phase>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ── Code units ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    Function,
    Class,
    Method,
    File,
    Module,
}

impl UnitKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Method => "method",
            Self::File => "file",
            Self::Module => "module",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "function" => Ok(Self::Function),
            "class" => Ok(Self::Class),
            "method" => Ok(Self::Method),
            "file" => Ok(Self::File),
            "module" => Ok(Self::Module),
            _ => Err(format!("Invalid unit kind: {}", s)),
        }
    }
}

/// Structural metadata extracted alongside a unit's content.
///
/// `signature` and `parameters` feed signature-similarity distractor
/// selection; absent values simply exclude the unit from that tier.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UnitMetadata {
    #[serde(default)]
    pub start_line: u32,
    #[serde(default)]
    pub end_line: u32,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub parameters: Vec<String>,
    #[serde(default)]
    pub doc_comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeUnit {
    pub id: String,
    pub run_id: String,
    pub path: String,
    pub name: String,
    pub kind: UnitKind,
    pub language: String,
    pub content: String,
    pub metadata: UnitMetadata,
    pub relationships: Vec<String>,
}

impl CodeUnit {
    /// Query text used when no LLM-generated query exists for this unit.
    pub fn fallback_query(&self) -> String {
        match self.kind {
            UnitKind::File => self
                .path
                .rsplit('/')
                .next()
                .unwrap_or(self.path.as_str())
                .to_string(),
            _ => format!("{} {} {}", self.kind.as_str(), self.name, self.language),
        }
    }
}

// ── Summaries ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SummaryMetadata {
    #[serde(default)]
    pub latency_ms: u64,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    /// Set when iterative refinement rewrote the summary; the value is
    /// the last refinement round applied.
    #[serde(default)]
    pub refinement_round: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedSummary {
    pub id: String,
    pub run_id: String,
    pub code_unit_id: String,
    pub model_id: String,
    pub text: String,
    pub metadata: SummaryMetadata,
}

// ── Evaluation results ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvalKind {
    Judge,
    Contrastive,
    Retrieval,
    Downstream,
    Iterative,
    #[serde(rename = "self")]
    SelfEval,
}

impl EvalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Judge => "judge",
            Self::Contrastive => "contrastive",
            Self::Retrieval => "retrieval",
            Self::Downstream => "downstream",
            Self::Iterative => "iterative",
            Self::SelfEval => "self",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "judge" => Ok(Self::Judge),
            "contrastive" => Ok(Self::Contrastive),
            "retrieval" => Ok(Self::Retrieval),
            "downstream" => Ok(Self::Downstream),
            "iterative" => Ok(Self::Iterative),
            "self" => Ok(Self::SelfEval),
            _ => Err(format!("Invalid evaluation kind: {}", s)),
        }
    }
}

/// Integer rubric scores on a 1–5 scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RubricScores {
    pub accuracy: u8,
    pub completeness: u8,
    pub semantic_richness: u8,
    pub abstraction: u8,
    pub conciseness: u8,
}

/// Fixed rubric weights; they sum to 1.
pub const RUBRIC_WEIGHTS: [(f64, &str); 5] = [
    (0.30, "accuracy"),
    (0.25, "completeness"),
    (0.20, "semantic_richness"),
    (0.15, "abstraction"),
    (0.10, "conciseness"),
];

impl RubricScores {
    /// Clamp a raw judge score into the 1–5 integer range.
    pub fn clamp_score(raw: f64) -> u8 {
        let rounded = raw.round();
        rounded.clamp(1.0, 5.0) as u8
    }

    pub fn weighted_average(&self) -> f64 {
        0.30 * f64::from(self.accuracy)
            + 0.25 * f64::from(self.completeness)
            + 0.20 * f64::from(self.semantic_richness)
            + 0.15 * f64::from(self.abstraction)
            + 0.10 * f64::from(self.conciseness)
    }
}

/// Which scoring method produced a contrastive outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    Embedding,
    Llm,
}

impl ScoringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Embedding => "embedding",
            Self::Llm => "llm",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JudgeOutcome {
    pub judge_model: String,
    pub scores: RubricScores,
    pub weighted_average: f64,
    pub rationale: String,
    #[serde(default)]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContrastiveOutcome {
    pub method: ScoringMethod,
    /// 1-based rank of the target among the candidates, when known.
    pub predicted_rank: Option<usize>,
    pub correct: bool,
    /// Embedding method only: top-1 minus top-2 cosine.
    #[serde(default)]
    pub confidence_gap: Option<f64>,
    pub candidate_count: usize,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub judge_model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalOutcome {
    pub query_id: String,
    pub query_type: String,
    /// 1-based rank of this model's target summary in the combined index.
    pub rank: usize,
    pub reciprocal_rank: f64,
    pub hit_at: BTreeMap<u32, bool>,
    /// 1-based position of this model when models are ordered by rank.
    pub model_rank: usize,
    pub is_winner: bool,
    pub pool_size: usize,
    pub total_models: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefinementRound {
    pub round: u32,
    pub rank: usize,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IterativeOutcome {
    pub rounds: u32,
    pub success: bool,
    pub initial_rank: usize,
    pub final_rank: usize,
    pub history: Vec<RefinementRound>,
    pub refinement_score: f64,
    pub duration_ms: u64,
}

/// Tagged evaluation payload; the tag doubles as the row's `kind` column.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvalPayload {
    Judge(JudgeOutcome),
    Contrastive(ContrastiveOutcome),
    Retrieval(RetrievalOutcome),
    Iterative(IterativeOutcome),
    Downstream { data: serde_json::Value },
    #[serde(rename = "self")]
    SelfEval { data: serde_json::Value },
}

impl EvalPayload {
    pub fn kind(&self) -> EvalKind {
        match self {
            Self::Judge(_) => EvalKind::Judge,
            Self::Contrastive(_) => EvalKind::Contrastive,
            Self::Retrieval(_) => EvalKind::Retrieval,
            Self::Iterative(_) => EvalKind::Iterative,
            Self::Downstream { .. } => EvalKind::Downstream,
            Self::SelfEval { .. } => EvalKind::SelfEval,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvaluationResult {
    pub id: String,
    pub run_id: String,
    pub summary_id: String,
    pub payload: EvalPayload,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn new(run_id: &str, summary_id: &str, payload: EvalPayload) -> Self {
        Self {
            id: new_id(),
            run_id: run_id.to_string(),
            summary_id: summary_id.to_string(),
            payload,
            evaluated_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> EvalKind {
        self.payload.kind()
    }
}

// ── Pairwise results ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    A,
    B,
    Tie,
}

impl Winner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
            Self::Tie => "tie",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "a" => Ok(Self::A),
            "b" => Ok(Self::B),
            "tie" => Ok(Self::Tie),
            _ => Err(format!("Invalid winner: {}", s)),
        }
    }

    /// Swap A and B; ties are unaffected.
    pub fn flipped(&self) -> Winner {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
            Self::Tie => Self::Tie,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JudgeConfidence {
    High,
    Medium,
    Low,
}

impl JudgeConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(format!("Invalid confidence: {}", s)),
        }
    }
}

/// One pairwise comparison verdict. `winner` is always expressed in terms
/// of the canonical `model_a`/`model_b` columns, regardless of the order
/// the judge actually saw.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PairwiseResult {
    pub id: String,
    pub run_id: String,
    pub model_a: String,
    pub model_b: String,
    pub code_unit_id: String,
    pub judge_model: String,
    pub winner: Winner,
    pub confidence: JudgeConfidence,
    pub position_swapped: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub criteria: Option<RubricScores>,
    #[serde(default)]
    pub cost: Option<f64>,
}

// ── Distractor sets ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

impl Difficulty {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Easy => "easy",
            Self::Medium => "medium",
            Self::Hard => "hard",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "easy" => Ok(Self::Easy),
            "medium" => Ok(Self::Medium),
            "hard" => Ok(Self::Hard),
            _ => Err(format!("Invalid difficulty: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DistractorSet {
    pub id: String,
    pub run_id: String,
    pub target_code_unit_id: String,
    /// Ordered, duplicate-free, target excluded.
    pub distractor_ids: Vec<String>,
    pub difficulty: Difficulty,
}

// ── Generated queries ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratedQuery {
    pub id: String,
    pub run_id: String,
    pub code_unit_id: String,
    pub query_type: String,
    pub text: String,
    pub should_find: bool,
}

// ── Phase progress ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseProgress {
    pub run_id: String,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total: u64,
    pub completed: u64,
    pub last_processed_id: Option<String>,
    pub error: Option<String>,
}

impl PhaseProgress {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}
