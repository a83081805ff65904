//! Typed error hierarchy for the benchmark pipeline.
//!
//! Five top-level enums cover the five subsystems:
//! - `StoreError` — persistence failures, including corrupted blob rows
//! - `PhaseError` — state-machine and phase-execution failures
//! - `LlmError` — classified remote-call failures (the retry layer keys off these)
//! - `SelectorError` — judge selection failures
//! - `ConfigError` — configuration validation failures

use thiserror::Error;

/// Errors from the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Corrupted data in row {row_id}: {detail}")]
    CorruptedData { row_id: String, detail: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Errors from the phase state machine and orchestrator.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("Invalid phase transition from {from:?} to {to}")]
    InvalidPhaseTransition { from: Option<String>, to: String },

    #[error("Phase {phase} incomplete: {completed}/{total} items")]
    IncompleteProgress {
        phase: String,
        completed: u64,
        total: u64,
    },

    #[error("Invalid run status transition from {from} to {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Classified failures from LLM and embedding calls.
///
/// The variant determines the retry policy (see `clients::retry`): rate
/// limits back off with jitter, content filters get two short retries,
/// max-tokens and unknown failures are not retried.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Rate limited (retry after {retry_after_ms:?} ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Response truncated at max tokens")]
    MaxTokens,

    #[error("Content filtered by provider")]
    ContentFilter,

    #[error("Model call timed out after {budget_secs}s")]
    Timeout { budget_secs: u64 },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Call cancelled")]
    Cancelled,

    #[error("Model call failed: {0}")]
    Unknown(String),
}

impl LlmError {
    /// Whether the retry layer may reissue the call at all.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LlmError::RateLimited { .. } | LlmError::ContentFilter)
    }
}

/// Errors from judge selection.
#[derive(Debug, Error)]
pub enum SelectorError {
    #[error(
        "Insufficient judges for generator {generator}: need {needed}, {available} eligible after family exclusion"
    )]
    InsufficientJudges {
        generator: String,
        needed: usize,
        available: usize,
    },
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required config key: {0}")]
    MissingKey(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("Failed to read config file {path}: {source}")]
    ReadFailed {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    ParseFailed {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
