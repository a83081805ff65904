//! Phase executors and the plumbing they share.
//!
//! Each evaluator is a [`crate::orchestrator::PhaseExecutor`] that reads
//! the store, fans out remote calls under its phase's pool policy, and
//! writes results back under an idempotence key so a resumed run never
//! reprocesses finished items.

pub mod contrastive;
pub mod extraction;
pub mod generation;
pub mod iterative;
pub mod judge;
pub mod retrieval;

use std::collections::HashMap;

use crate::errors::LlmError;
use crate::orchestrator::PhaseFailure;

/// Parse a JSON object out of model output, tolerating markdown fences,
/// leading prose, and truncation. Truncated objects get a best-effort
/// repair (closing unbalanced strings, braces, and brackets) before the
/// item is declared a failure.
pub fn parse_json_lenient(text: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }

    let start = trimmed
        .find('{')
        .ok_or_else(|| LlmError::InvalidResponse("no JSON object in response".into()))?;
    let mut candidate = trimmed[start..].trim_end();
    // Strip a trailing markdown fence if the object closed before it.
    if let Some(stripped) = candidate.strip_suffix("```") {
        candidate = stripped.trim_end();
    }
    if let Ok(value) = serde_json::from_str(candidate) {
        return Ok(value);
    }

    let repaired = repair_json(candidate);
    serde_json::from_str(&repaired)
        .map_err(|e| LlmError::InvalidResponse(format!("unparseable JSON: {}", e)))
}

/// Close unbalanced strings, braces, and brackets. Anything beyond that
/// is not worth guessing at.
fn repair_json(text: &str) -> String {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => stack.push('}'),
            '[' if !in_string => stack.push(']'),
            '}' | ']' if !in_string => {
                stack.pop();
            }
            _ => {}
        }
    }

    let mut repaired = text.to_string();
    // A trailing escape would swallow the closing quote.
    if escaped {
        repaired.push('\\');
    }
    if in_string {
        repaired.push('"');
    }
    while let Some(closer) = stack.pop() {
        repaired.push(closer);
    }
    repaired
}

/// Evenly spaced sample of `quota` indices from `0..len`. Every caller's
/// stratum keeps representation: quota ≥ len returns everything.
pub fn sample_evenly(len: usize, quota: usize) -> Vec<usize> {
    if quota >= len {
        return (0..len).collect();
    }
    (0..quota).map(|i| i * len / quota).collect()
}

/// Accumulates per-item failures into the per-model tallies a
/// [`crate::orchestrator::PhaseOutcome`] carries.
#[derive(Debug, Default)]
pub struct FailureTally {
    counts: HashMap<(String, String), u32>,
}

impl FailureTally {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, model: &str, error: &LlmError) {
        *self
            .counts
            .entry((model.to_string(), error.to_string()))
            .or_insert(0) += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn total(&self) -> u64 {
        self.counts.values().map(|c| u64::from(*c)).sum()
    }

    pub fn into_failures(self) -> Vec<PhaseFailure> {
        let mut failures: Vec<PhaseFailure> = self
            .counts
            .into_iter()
            .map(|((model, error), count)| PhaseFailure {
                model,
                count,
                error,
            })
            .collect();
        failures.sort_by(|a, b| a.model.cmp(&b.model).then(a.error.cmp(&b.error)));
        failures
    }
}
