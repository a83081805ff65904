//! Iterative refinement evaluation.
//!
//! A generator gets up to `max_rounds` attempts to move its summary's
//! rank among competitors for the same code unit to within the target,
//! guided by rank feedback. Everything embeddable is embedded up front in
//! two batches (summaries, queries); competitor and query vectors carry
//! through every round untouched, and only the freshly refined text is
//! re-embedded. Scoring is rounds-to-success: `1 / log₂(rounds + 2)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::info;

use crate::clients::retry::{RetryPolicy, complete_with_retry};
use crate::clients::{ChatMessage, CompletionRequest};
use crate::config::ModelSpec;
use crate::errors::LlmError;
use crate::index::cosine;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::store::models::{
    CodeUnit, EvalKind, EvalPayload, EvaluationResult, GeneratedSummary, IterativeOutcome,
    RefinementRound, new_id,
};

/// Maps rounds-to-success into `(0, 1]`: 0 rounds scores 1, each extra
/// round decays sub-linearly.
pub fn refinement_score(rounds: u32) -> f64 {
    1.0 / (f64::from(rounds) + 2.0).log2()
}

/// Clamp the configured target to half the candidate pool (rounded up)
/// so tiny pools don't make the goal unachievable: with one competitor
/// the target becomes 1 and a pass requires outranking them.
pub(crate) fn effective_target_rank(configured: usize, competitors: usize) -> usize {
    let clamp = (((competitors + 1) as f64) * 0.5).ceil() as usize;
    configured.min(clamp.max(1))
}

fn refinement_request(
    spec: &ModelSpec,
    unit: &CodeUnit,
    current: &str,
    competitor_texts: &[&str],
    rank: usize,
    pool: usize,
) -> CompletionRequest {
    let mut competitors = String::new();
    for (i, text) in competitor_texts.iter().enumerate() {
        competitors.push_str(&format!("Competitor {}:\n{}\n\n", i + 1, text));
    }
    CompletionRequest::new(vec![
        ChatMessage::system(
            "You are refining your own code summary. A retrieval query derived from the code \
             currently ranks your summary below competitors'. Rewrite your summary so it \
             captures the code's purpose more distinctively. Respond with the new summary \
             only.",
        ),
        ChatMessage::user(format!(
            "Code ({}):\n```\n{}\n```\n\nYour current summary (ranked {} of {}):\n{}\n\n{}",
            unit.language, unit.content, rank, pool, current, competitors
        )),
    ])
    .with_temperature(spec.temperature)
    .with_max_tokens(spec.max_tokens)
}

/// Rank of `mine` among `[mine] + competitors` by cosine against the
/// query; ties keep list order, which favors the candidate under test
/// deterministically.
fn rank_against(query: &[f32], mine: &[f32], competitors: &[Arc<Vec<f32>>]) -> (usize, f64) {
    let my_score = cosine(query, mine);
    let mut scores = vec![my_score];
    scores.extend(competitors.iter().map(|c| cosine(query, c)));
    let rank = 1 + scores[1..].iter().filter(|s| **s > my_score).count();
    (rank, f64::from(my_score))
}

pub struct IterativeEvaluator;

impl IterativeEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for IterativeEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

struct WorkItem {
    spec: ModelSpec,
    summary: GeneratedSummary,
}

#[async_trait]
impl PhaseExecutor for IterativeEvaluator {
    fn phase(&self) -> Phase {
        Phase::EvalIterative
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        if !cx.config.evaluation.iterative.enabled {
            return Ok(PhaseOutcome::skipped("iterative evaluation disabled"));
        }
        let summaries = cx.store.get_summaries(&cx.run.id, None)?;
        if summaries.is_empty() {
            return Ok(PhaseOutcome::skipped("no summaries to evaluate"));
        }
        for spec in &cx.config.generators {
            if cx.clients.generator(&spec.id).is_none() {
                bail!("no client registered for generator {}", spec.id);
            }
        }
        let units = cx.store.get_code_units(&cx.run.id)?;
        let units_by_id: HashMap<&str, &CodeUnit> =
            units.iter().map(|u| (u.id.as_str(), u)).collect();

        let evaluated: HashSet<String> = cx
            .store
            .get_evaluation_results(&cx.run.id, Some(EvalKind::Iterative))?
            .into_iter()
            .filter(|r| matches!(r.payload, EvalPayload::Iterative(_)))
            .map(|r| r.summary_id)
            .collect();

        // Per-model uniform sample without replacement, seeded from the
        // run id so a resumed run draws the same subset.
        let sample_size = cx.config.evaluation.iterative.sample_size;
        let mut rng = {
            let digest = Sha256::digest(cx.run.id.as_bytes());
            let mut seed = [0u8; 8];
            seed.copy_from_slice(&digest[..8]);
            rand::rngs::StdRng::seed_from_u64(u64::from_le_bytes(seed))
        };
        let mut work: Vec<WorkItem> = Vec::new();
        for spec in &cx.config.generators {
            let mine: Vec<&GeneratedSummary> = summaries
                .iter()
                .filter(|s| s.model_id == spec.id)
                .collect();
            let sampled: Vec<&GeneratedSummary> = if mine.len() > sample_size {
                mine.choose_multiple(&mut rng, sample_size).copied().collect()
            } else {
                mine
            };
            for summary in sampled {
                work.push(WorkItem {
                    spec: spec.clone(),
                    summary: summary.clone(),
                });
            }
        }

        let total = work.len() as u64;
        cx.state.start_phase(Phase::EvalIterative, total)?;
        let done_already = work
            .iter()
            .filter(|w| evaluated.contains(&w.summary.id))
            .count() as u64;
        let completed = AtomicU64::new(done_already);
        cx.state
            .update_progress(Phase::EvalIterative, completed.load(Ordering::SeqCst), None)?;

        // Pre-embed once: every summary of every unit, and every derived
        // query, in one batch each. Competitors are never re-embedded.
        let embedder = cx.clients.embedder();
        let summary_texts: Vec<String> = summaries.iter().map(|s| s.text.clone()).collect();
        let summary_vec_list = cx
            .cache
            .embed_all(&embedder, &summary_texts, &cx.cancel)
            .await
            .context("Failed to pre-embed summaries")?;
        let summary_vectors: HashMap<String, Arc<Vec<f32>>> = summaries
            .iter()
            .map(|s| s.id.clone())
            .zip(summary_vec_list)
            .collect();
        let query_texts: Vec<String> = units.iter().map(|u| u.fallback_query()).collect();
        cx.cache
            .embed_all(&embedder, &query_texts, &cx.cancel)
            .await
            .context("Failed to pre-embed queries")?;

        let competitor_map: HashMap<String, Vec<&GeneratedSummary>> = {
            let mut map: HashMap<String, Vec<&GeneratedSummary>> = HashMap::new();
            for summary in &summaries {
                map.entry(summary.code_unit_id.clone())
                    .or_default()
                    .push(summary);
            }
            map
        };

        let tally = Mutex::new(super::FailureTally::new());
        let pending: Vec<&WorkItem> = work
            .iter()
            .filter(|w| !evaluated.contains(&w.summary.id))
            .collect();

        // Two streams: cloud models all run concurrently; local models get
        // their own lane where large ones are serialized (GPU contention)
        // and small ones run at the configured parallelism.
        let threshold = cx.config.concurrency.large_model_threshold_b;
        let is_large = |spec: &ModelSpec| spec.param_count_b().unwrap_or(0.0) >= threshold;
        let cloud: Vec<&WorkItem> = pending.iter().copied().filter(|w| !w.spec.local).collect();
        let local_large: Vec<&WorkItem> = pending
            .iter()
            .copied()
            .filter(|w| w.spec.local && is_large(&w.spec))
            .collect();
        let local_small: Vec<&WorkItem> = pending
            .iter()
            .copied()
            .filter(|w| w.spec.local && !is_large(&w.spec))
            .collect();

        let shared = ItemContext {
            cx,
            total,
            completed: &completed,
            tally: &tally,
            summary_vectors: &summary_vectors,
            competitor_map: &competitor_map,
            units_by_id: &units_by_id,
        };

        let cloud_stream = async {
            // One lane per cloud model; lanes run concurrently, each lane
            // walks its own summaries in order.
            let mut by_model: HashMap<&str, Vec<&WorkItem>> = HashMap::new();
            for item in cloud.iter().copied() {
                by_model.entry(item.spec.id.as_str()).or_default().push(item);
            }
            futures::future::join_all(by_model.into_values().map(|items| async {
                for item in items {
                    process_item(&shared, item).await;
                }
            }))
            .await;
        };
        let local_stream = async {
            for item in &local_large {
                process_item(&shared, item).await;
            }
            let parallelism = cx.config.concurrency.local_model_parallelism.max(1);
            futures::stream::iter(local_small.iter().copied())
                .for_each_concurrent(parallelism, |item| process_item(&shared, item))
                .await;
        };
        tokio::join!(cloud_stream, local_stream);

        if cx.cancel.is_cancelled() {
            bail!("iterative evaluation cancelled");
        }

        let tally = tally.into_inner();
        let attempted = completed.load(Ordering::SeqCst);
        info!(run = %cx.run.id, items = attempted, "iterative evaluation complete");
        Ok(PhaseOutcome::completed(attempted).with_failures(tally.into_failures()))
    }
}

/// Borrowed state shared by every work item in the phase.
struct ItemContext<'a> {
    cx: &'a PhaseContext,
    total: u64,
    completed: &'a AtomicU64,
    tally: &'a Mutex<super::FailureTally>,
    summary_vectors: &'a HashMap<String, Arc<Vec<f32>>>,
    competitor_map: &'a HashMap<String, Vec<&'a GeneratedSummary>>,
    units_by_id: &'a HashMap<&'a str, &'a CodeUnit>,
}

/// Drive one work item: run the round loop, tally failures, advance the
/// cursor.
async fn process_item(shared: &ItemContext<'_>, item: &WorkItem) {
    let cx = shared.cx;
    if cx.cancel.is_cancelled() {
        return;
    }
    let result = refine_one(
        cx,
        item,
        shared.summary_vectors,
        shared.competitor_map,
        shared.units_by_id,
    )
    .await;
    match result {
        Ok(()) => {}
        Err(LlmError::Cancelled) => return,
        Err(err) => {
            shared.tally.lock().await.record(&item.spec.id, &err);
        }
    }
    let done = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
    let _ = cx
        .state
        .update_progress(Phase::EvalIterative, done, Some(&item.summary.id));
    cx.report_progress(
        Phase::EvalIterative,
        done,
        shared.total,
        Some(item.spec.id.clone()),
    );
}

/// Run the full round loop for one summary and persist the outcome.
async fn refine_one(
    cx: &PhaseContext,
    item: &WorkItem,
    summary_vectors: &HashMap<String, Arc<Vec<f32>>>,
    competitor_map: &HashMap<String, Vec<&GeneratedSummary>>,
    units_by_id: &HashMap<&str, &CodeUnit>,
) -> Result<(), LlmError> {
    let start = Instant::now();
    let summary = &item.summary;
    let unit = units_by_id
        .get(summary.code_unit_id.as_str())
        .ok_or_else(|| LlmError::InvalidResponse("unknown code unit".into()))?;

    let competitors: Vec<&GeneratedSummary> = competitor_map
        .get(&summary.code_unit_id)
        .map(|all| {
            all.iter()
                .copied()
                .filter(|s| s.model_id != summary.model_id)
                .collect()
        })
        .unwrap_or_default();
    let competitor_vectors: Vec<Arc<Vec<f32>>> = competitors
        .iter()
        .filter_map(|c| summary_vectors.get(&c.id).cloned())
        .collect();
    let competitor_texts: Vec<&str> = competitors.iter().map(|c| c.text.as_str()).collect();

    let target = effective_target_rank(
        cx.config.evaluation.iterative.target_rank,
        competitor_vectors.len(),
    );
    let max_rounds = cx.config.evaluation.iterative.max_rounds;
    let pool = competitor_vectors.len() + 1;

    let query_text = unit.fallback_query();
    let query_vec = cx
        .cache
        .get(&query_text)
        .ok_or_else(|| LlmError::InvalidResponse("query embedding missing from cache".into()))?;

    let client = cx
        .clients
        .generator(&item.spec.id)
        .ok_or_else(|| LlmError::Unknown(format!("no client for {}", item.spec.id)))?;

    let mut current_text = summary.text.clone();
    let mut current_vec = summary_vectors
        .get(&summary.id)
        .cloned()
        .ok_or_else(|| LlmError::InvalidResponse("summary embedding missing".into()))?;

    let mut history: Vec<RefinementRound> = Vec::new();
    let mut success = false;
    let mut rounds = 0u32;

    for round in 0..=max_rounds {
        let (rank, similarity) = rank_against(&query_vec, &current_vec, &competitor_vectors);
        history.push(RefinementRound {
            round,
            rank,
            similarity,
        });
        if rank <= target {
            success = true;
            rounds = round;
            break;
        }
        if round == max_rounds {
            rounds = max_rounds;
            break;
        }

        let request = refinement_request(
            &item.spec,
            unit,
            &current_text,
            &competitor_texts,
            rank,
            pool,
        );
        let completion =
            complete_with_retry(&client, request, &RetryPolicy::default(), &cx.cancel).await?;
        current_text = completion.content.trim().to_string();
        if current_text.is_empty() {
            return Err(LlmError::InvalidResponse("empty refinement".into()));
        }
        // Only the refined text is re-embedded; the content-hash cache
        // absorbs a model that returns the same text twice.
        current_vec = cx
            .cache
            .embed_one(&cx.clients.embedder(), &current_text, &cx.cancel)
            .await?;

        let mut metadata = summary.metadata.clone();
        metadata.refinement_round = Some(round + 1);
        cx.store
            .update_summary(&cx.run.id, &summary.id, Some(&current_text), Some(&metadata))
            .map_err(|e| LlmError::Unknown(e.to_string()))?;
    }

    let outcome = IterativeOutcome {
        rounds,
        success,
        initial_rank: history.first().map(|h| h.rank).unwrap_or(0),
        final_rank: history.last().map(|h| h.rank).unwrap_or(0),
        history,
        refinement_score: refinement_score(rounds),
        duration_ms: start.elapsed().as_millis() as u64,
    };
    let row = EvaluationResult::new(&cx.run.id, &summary.id, EvalPayload::Iterative(outcome));
    cx.store
        .insert_evaluation_result(&row)
        .map_err(|e| LlmError::Unknown(e.to_string()))?;
    Ok(())
}
