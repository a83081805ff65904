//! Pipeline phases and their dependency order.
//!
//! Phases execute strictly in the order of [`Phase::ORDER`]. Evaluation
//! sub-phases have independent inputs and could overlap, but they are kept
//! in a single total order so the resume cursor has one unambiguous "next
//! incomplete phase" to restart from.

use serde::{Deserialize, Serialize};

use crate::errors::PhaseError;

/// A pipeline phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extraction,
    Generation,
    EvalIterative,
    EvalJudge,
    EvalContrastive,
    EvalRetrieval,
    EvalDownstream,
    EvalSelf,
    Aggregation,
    Reporting,
}

impl Phase {
    /// All phases in dependency order.
    pub const ORDER: [Phase; 10] = [
        Phase::Extraction,
        Phase::Generation,
        Phase::EvalIterative,
        Phase::EvalJudge,
        Phase::EvalContrastive,
        Phase::EvalRetrieval,
        Phase::EvalDownstream,
        Phase::EvalSelf,
        Phase::Aggregation,
        Phase::Reporting,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extraction => "extraction",
            Phase::Generation => "generation",
            Phase::EvalIterative => "evaluation:iterative",
            Phase::EvalJudge => "evaluation:judge",
            Phase::EvalContrastive => "evaluation:contrastive",
            Phase::EvalRetrieval => "evaluation:retrieval",
            Phase::EvalDownstream => "evaluation:downstream",
            Phase::EvalSelf => "evaluation:self",
            Phase::Aggregation => "aggregation",
            Phase::Reporting => "reporting",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, PhaseError> {
        match s {
            "extraction" => Ok(Phase::Extraction),
            "generation" => Ok(Phase::Generation),
            "evaluation:iterative" => Ok(Phase::EvalIterative),
            "evaluation:judge" => Ok(Phase::EvalJudge),
            "evaluation:contrastive" => Ok(Phase::EvalContrastive),
            "evaluation:retrieval" => Ok(Phase::EvalRetrieval),
            "evaluation:downstream" => Ok(Phase::EvalDownstream),
            "evaluation:self" => Ok(Phase::EvalSelf),
            "aggregation" => Ok(Phase::Aggregation),
            "reporting" => Ok(Phase::Reporting),
            other => Err(PhaseError::InvalidPhaseTransition {
                from: None,
                to: other.to_string(),
            }),
        }
    }

    /// Position of this phase in the dependency order.
    pub fn index(&self) -> usize {
        Phase::ORDER
            .iter()
            .position(|p| p == self)
            .unwrap_or(Phase::ORDER.len())
    }

    /// The phase after this one, if any.
    pub fn next(&self) -> Option<Phase> {
        Phase::ORDER.get(self.index() + 1).copied()
    }

    /// Whether moving from `from` to `self` respects the dependency order.
    ///
    /// Forward moves and re-entry into the current phase (resume) are
    /// allowed; moving backwards is not.
    pub fn is_valid_transition(&self, from: Option<Phase>) -> bool {
        match from {
            None => true,
            Some(prev) => self.index() >= prev.index(),
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
