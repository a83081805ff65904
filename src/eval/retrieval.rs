//! Cross-model retrieval evaluation.
//!
//! One combined index holds every model's summary of every code unit, so
//! for each query the models compete directly: a model scores well only
//! if its summary of the query's target outranks everyone else's. Queries
//! run sequentially after a single batched embedding pass; index reads
//! are cheap, the embedding batch is the expensive part.

use std::collections::{BTreeMap, HashMap};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tracing::info;

use crate::index::EmbeddingIndex;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::store::models::{
    EvalKind, EvalPayload, EvaluationResult, GeneratedQuery, RetrievalOutcome, new_id,
};

pub struct RetrievalEvaluator;

impl RetrievalEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RetrievalEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseExecutor for RetrievalEvaluator {
    fn phase(&self) -> Phase {
        Phase::EvalRetrieval
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        if !cx.config.evaluation.retrieval.enabled {
            return Ok(PhaseOutcome::skipped("retrieval evaluation disabled"));
        }
        let summaries = cx.store.get_summaries(&cx.run.id, None)?;
        if summaries.is_empty() {
            return Ok(PhaseOutcome::skipped("no summaries to evaluate"));
        }
        let units = cx.store.get_code_units(&cx.run.id)?;

        // Without LLM-generated queries, fall back to one simple query per
        // unit and persist them so a resumed run sees the same probe set.
        let mut queries = cx.store.get_queries(&cx.run.id)?;
        if queries.is_empty() {
            queries = units
                .iter()
                .map(|unit| GeneratedQuery {
                    id: new_id(),
                    run_id: cx.run.id.clone(),
                    code_unit_id: unit.id.clone(),
                    query_type: "fallback".to_string(),
                    text: unit.fallback_query(),
                    should_find: true,
                })
                .collect();
            cx.store.insert_queries(&queries)?;
        }

        // Resume: a query's rows are written atomically, so any existing
        // row marks the whole query as done.
        let evaluated: std::collections::HashSet<String> = cx
            .store
            .get_evaluation_results(&cx.run.id, Some(EvalKind::Retrieval))?
            .into_iter()
            .filter_map(|r| match r.payload {
                EvalPayload::Retrieval(outcome) => Some(outcome.query_id),
                _ => None,
            })
            .collect();

        let total = queries.len() as u64;
        cx.state.start_phase(Phase::EvalRetrieval, total)?;
        let mut completed = evaluated.len() as u64;
        cx.state
            .update_progress(Phase::EvalRetrieval, completed, None)?;

        // One batched embedding pass covers the whole index and every
        // query; per-query lookups below are pure cache hits.
        let embedder = cx.clients.embedder();
        let summary_texts: Vec<String> = summaries.iter().map(|s| s.text.clone()).collect();
        let summary_vectors = cx
            .cache
            .embed_all(&embedder, &summary_texts, &cx.cancel)
            .await
            .context("Failed to embed summaries for the retrieval index")?;
        let query_texts: Vec<String> = queries.iter().map(|q| q.text.clone()).collect();
        cx.cache
            .embed_all(&embedder, &query_texts, &cx.cancel)
            .await
            .context("Failed to embed retrieval queries")?;

        let mut index = EmbeddingIndex::new();
        let mut summary_ids: HashMap<(String, String), String> = HashMap::new();
        for (summary, vector) in summaries.iter().zip(summary_vectors) {
            summary_ids.insert(
                (summary.model_id.clone(), summary.code_unit_id.clone()),
                summary.id.clone(),
            );
            index.add(crate::index::IndexEntry {
                model_id: summary.model_id.clone(),
                code_unit_id: summary.code_unit_id.clone(),
                summary_id: summary.id.clone(),
                embedding: vector,
            })?;
        }

        let k_values = &cx.config.evaluation.retrieval.k_values;
        let pool_size = index.len();
        let total_models = index.model_count();

        for query in &queries {
            if cx.cancel.is_cancelled() {
                bail!("retrieval evaluation cancelled");
            }
            if evaluated.contains(&query.id) {
                continue;
            }
            let query_vector = cx
                .cache
                .get(&query.text)
                .ok_or_else(|| anyhow::anyhow!("query embedding missing from cache"))?;

            let ranks = index.model_ranks(&query_vector, &query.code_unit_id);
            let mut rows = Vec::with_capacity(ranks.len());
            for (model, placement) in &ranks {
                let Some(summary_id) =
                    summary_ids.get(&(model.clone(), query.code_unit_id.clone()))
                else {
                    continue;
                };
                let hit_at: BTreeMap<u32, bool> = k_values
                    .iter()
                    .map(|k| (*k, placement.rank <= *k as usize))
                    .collect();
                rows.push(EvaluationResult::new(
                    &cx.run.id,
                    summary_id,
                    EvalPayload::Retrieval(RetrievalOutcome {
                        query_id: query.id.clone(),
                        query_type: query.query_type.clone(),
                        rank: placement.rank,
                        reciprocal_rank: 1.0 / placement.rank as f64,
                        hit_at,
                        model_rank: placement.model_rank,
                        is_winner: placement.is_winner,
                        pool_size,
                        total_models,
                    }),
                ));
            }
            cx.store.insert_evaluation_results(&rows)?;

            completed += 1;
            cx.state
                .update_progress(Phase::EvalRetrieval, completed, Some(&query.id))?;
            cx.report_progress(
                Phase::EvalRetrieval,
                completed,
                total,
                Some(query.query_type.clone()),
            );
        }

        info!(run = %cx.run.id, queries = completed, "retrieval evaluation complete");
        Ok(PhaseOutcome::completed(completed))
    }
}
