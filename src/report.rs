//! Reporting phase: hand aggregated scores to pluggable sinks.
//!
//! Rendering is an external concern; the only logic here is reading the
//! persisted scores and emitting them. A JSON sink is provided, richer
//! renderers (Markdown, HTML, leaderboard upload) implement [`ReportSink`]
//! outside this crate.

use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tracing::info;

use crate::aggregate::NormalizedScores;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::store::models::Run;

pub trait ReportSink: Send + Sync {
    /// Short name for progress reporting.
    fn name(&self) -> &str;

    fn write(&self, run: &Run, scores: &[(String, NormalizedScores)]) -> Result<()>;
}

/// Writes one pretty-printed JSON report file per run.
pub struct JsonReportSink {
    path: PathBuf,
}

impl JsonReportSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl ReportSink for JsonReportSink {
    fn name(&self) -> &str {
        "json"
    }

    fn write(&self, run: &Run, scores: &[(String, NormalizedScores)]) -> Result<()> {
        let mut models: Vec<serde_json::Value> = Vec::with_capacity(scores.len());
        let mut ranked: Vec<&(String, NormalizedScores)> = scores.iter().collect();
        ranked.sort_by(|a, b| {
            b.1.overall
                .partial_cmp(&a.1.overall)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        for (rank, (model_id, model_scores)) in ranked.iter().enumerate() {
            models.push(serde_json::json!({
                "rank": rank + 1,
                "model_id": model_id,
                "scores": model_scores,
            }));
        }
        let report = serde_json::json!({
            "run_id": run.id,
            "run_name": run.name,
            "status": run.status.as_str(),
            "generated_at": Utc::now().to_rfc3339(),
            "models": models,
        });

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create report directory {}", parent.display()))?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&report)?)
            .with_context(|| format!("Failed to write report to {}", self.path.display()))?;
        Ok(())
    }
}

pub struct ReportingExecutor {
    sinks: Vec<Box<dyn ReportSink>>,
}

impl ReportingExecutor {
    pub fn new(sinks: Vec<Box<dyn ReportSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl PhaseExecutor for ReportingExecutor {
    fn phase(&self) -> Phase {
        Phase::Reporting
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        let scores = cx.store.get_aggregated_scores(&cx.run.id)?;
        if scores.is_empty() {
            return Ok(PhaseOutcome::skipped("no aggregated scores to report"));
        }

        let total = self.sinks.len() as u64;
        cx.state.start_phase(Phase::Reporting, total)?;
        let mut completed = 0u64;
        for sink in &self.sinks {
            sink.write(&cx.run, &scores)
                .with_context(|| format!("Report sink {} failed", sink.name()))?;
            completed += 1;
            cx.state
                .update_progress(Phase::Reporting, completed, Some(sink.name()))?;
            cx.report_progress(
                Phase::Reporting,
                completed,
                total,
                Some(sink.name().to_string()),
            );
        }

        info!(run = %cx.run.id, sinks = completed, "reporting complete");
        Ok(PhaseOutcome::completed(completed))
    }
}
