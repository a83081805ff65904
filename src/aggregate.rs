//! Score aggregation: collapse per-summary evaluation rows into one
//! normalized score record per model.
//!
//! Every category lands in `[0, 1]`; the overall score is the weighted
//! sum of the category combines under the configured weights. A category
//! with no rows is absent and contributes nothing.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::eval::judge::tournament_standings;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::store::Store;
use crate::store::models::{EvalPayload, ScoringMethod};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JudgeScores {
    /// Mean rubric weighted average, normalized to `[0, 1]`.
    pub pointwise: f64,
    /// Tournament win rate.
    pub pairwise: f64,
    pub combined: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContrastiveScores {
    pub embedding: Option<f64>,
    pub llm: Option<f64>,
    pub combined: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryTypeBreakdown {
    pub queries: u64,
    pub mrr: f64,
    pub win_rate: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RetrievalScores {
    pub precision_at_1: f64,
    pub precision_at_5: f64,
    pub mrr: f64,
    pub win_rate: f64,
    pub combined: f64,
    pub by_query_type: std::collections::BTreeMap<String, QueryTypeBreakdown>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IterativeScores {
    pub avg_rounds: f64,
    pub success_rate: f64,
    /// Mean refinement score over successful summaries.
    pub avg_refinement_score: f64,
    /// Success-weighted mean refinement score over all evaluated
    /// summaries (failures contribute 0).
    pub combined: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NormalizedScores {
    pub judge: Option<JudgeScores>,
    pub contrastive: Option<ContrastiveScores>,
    pub retrieval: Option<RetrievalScores>,
    pub iterative: Option<IterativeScores>,
    pub overall: f64,
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Compute normalized scores for every model in the run.
pub fn compute_scores(
    store: &Store,
    run_id: &str,
    config: &crate::config::BenchConfig,
) -> Result<Vec<(String, NormalizedScores)>> {
    let summaries = store.get_summaries(run_id, None)?;
    let model_of: HashMap<&str, &str> = summaries
        .iter()
        .map(|s| (s.id.as_str(), s.model_id.as_str()))
        .collect();

    let results = store.get_evaluation_results(run_id, None)?;
    let pairwise = store.get_pairwise_results(run_id)?;
    let standings = tournament_standings(&pairwise);

    #[derive(Default)]
    struct Acc {
        judge_averages: Vec<f64>,
        contrastive_embedding: Vec<f64>,
        contrastive_llm: Vec<f64>,
        retrieval_p1: Vec<f64>,
        retrieval_p5: Vec<f64>,
        retrieval_rr: Vec<f64>,
        retrieval_wins: Vec<f64>,
        retrieval_by_type: std::collections::BTreeMap<String, (Vec<f64>, Vec<f64>)>,
        iterative_rounds: Vec<f64>,
        iterative_success: Vec<f64>,
        iterative_scores_on_success: Vec<f64>,
        iterative_weighted: Vec<f64>,
    }

    let mut accs: HashMap<String, Acc> = HashMap::new();
    for result in &results {
        let Some(model) = model_of.get(result.summary_id.as_str()) else {
            continue;
        };
        let acc = accs.entry((*model).to_string()).or_default();
        match &result.payload {
            EvalPayload::Judge(j) => acc.judge_averages.push(j.weighted_average),
            EvalPayload::Contrastive(c) => {
                let hit = if c.correct { 1.0 } else { 0.0 };
                match c.method {
                    ScoringMethod::Embedding => acc.contrastive_embedding.push(hit),
                    ScoringMethod::Llm => acc.contrastive_llm.push(hit),
                }
            }
            EvalPayload::Retrieval(r) => {
                acc.retrieval_p1.push(if r.rank == 1 { 1.0 } else { 0.0 });
                acc.retrieval_p5.push(if r.rank <= 5 { 1.0 } else { 0.0 });
                acc.retrieval_rr.push(r.reciprocal_rank);
                acc.retrieval_wins.push(if r.is_winner { 1.0 } else { 0.0 });
                let (type_rr, type_wins) = acc
                    .retrieval_by_type
                    .entry(r.query_type.clone())
                    .or_default();
                type_rr.push(r.reciprocal_rank);
                type_wins.push(if r.is_winner { 1.0 } else { 0.0 });
            }
            EvalPayload::Iterative(i) => {
                acc.iterative_rounds.push(f64::from(i.rounds));
                acc.iterative_success.push(if i.success { 1.0 } else { 0.0 });
                if i.success {
                    acc.iterative_scores_on_success.push(i.refinement_score);
                    acc.iterative_weighted.push(i.refinement_score);
                } else {
                    acc.iterative_weighted.push(0.0);
                }
            }
            EvalPayload::Downstream { .. } | EvalPayload::SelfEval { .. } => {}
        }
    }

    let weights = &config.weights;
    let mut scores = Vec::new();
    for spec in &config.generators {
        let acc = accs.remove(&spec.id).unwrap_or_default();
        let standing = standings.get(&spec.id);

        let judge = if acc.judge_averages.is_empty() && standing.is_none() {
            None
        } else {
            let pointwise = mean(&acc.judge_averages) / 5.0;
            let pairwise_rate = standing.map(|s| s.win_rate()).unwrap_or(0.0);
            Some(JudgeScores {
                pointwise,
                pairwise: pairwise_rate,
                combined: 0.4 * pointwise + 0.6 * pairwise_rate,
            })
        };

        let contrastive = {
            let embedding = (!acc.contrastive_embedding.is_empty())
                .then(|| mean(&acc.contrastive_embedding));
            let llm = (!acc.contrastive_llm.is_empty()).then(|| mean(&acc.contrastive_llm));
            match (embedding, llm) {
                (None, None) => None,
                // A missing method carries zero weight, not a zero score.
                (Some(e), None) => Some(ContrastiveScores {
                    embedding: Some(e),
                    llm: None,
                    combined: e,
                }),
                (None, Some(l)) => Some(ContrastiveScores {
                    embedding: None,
                    llm: Some(l),
                    combined: l,
                }),
                (Some(e), Some(l)) => Some(ContrastiveScores {
                    embedding: Some(e),
                    llm: Some(l),
                    combined: 0.5 * e + 0.5 * l,
                }),
            }
        };

        let retrieval = (!acc.retrieval_rr.is_empty()).then(|| {
            let precision_at_1 = mean(&acc.retrieval_p1);
            let precision_at_5 = mean(&acc.retrieval_p5);
            let mrr = mean(&acc.retrieval_rr);
            let by_query_type = acc
                .retrieval_by_type
                .iter()
                .map(|(query_type, (rr, wins))| {
                    (
                        query_type.clone(),
                        QueryTypeBreakdown {
                            queries: rr.len() as u64,
                            mrr: mean(rr),
                            win_rate: mean(wins),
                        },
                    )
                })
                .collect();
            RetrievalScores {
                precision_at_1,
                precision_at_5,
                mrr,
                win_rate: mean(&acc.retrieval_wins),
                combined: 0.3 * precision_at_1 + 0.4 * precision_at_5 + 0.3 * mrr,
                by_query_type,
            }
        });

        let iterative = (!acc.iterative_rounds.is_empty()).then(|| IterativeScores {
            avg_rounds: mean(&acc.iterative_rounds),
            success_rate: mean(&acc.iterative_success),
            avg_refinement_score: mean(&acc.iterative_scores_on_success),
            combined: mean(&acc.iterative_weighted),
        });

        let overall = weights.judge * judge.as_ref().map(|j| j.combined).unwrap_or(0.0)
            + weights.contrastive * contrastive.as_ref().map(|c| c.combined).unwrap_or(0.0)
            + weights.retrieval * retrieval.as_ref().map(|r| r.combined).unwrap_or(0.0)
            + weights.iterative * iterative.as_ref().map(|i| i.combined).unwrap_or(0.0);

        scores.push((
            spec.id.clone(),
            NormalizedScores {
                judge,
                contrastive,
                retrieval,
                iterative,
                overall,
            },
        ));
    }
    Ok(scores)
}

/// Aggregation phase: computes and persists one score row per model.
/// The upsert makes a rerun converge on the same rows.
pub struct AggregationExecutor;

impl AggregationExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AggregationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseExecutor for AggregationExecutor {
    fn phase(&self) -> Phase {
        Phase::Aggregation
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        let scores = compute_scores(&cx.store, &cx.run.id, &cx.config)?;
        let total = scores.len() as u64;
        cx.state.start_phase(Phase::Aggregation, total)?;

        let mut completed = 0u64;
        for (model_id, model_scores) in &scores {
            cx.store
                .save_aggregated_scores(&cx.run.id, model_id, model_scores)?;
            completed += 1;
            cx.state
                .update_progress(Phase::Aggregation, completed, Some(model_id))?;
            cx.report_progress(Phase::Aggregation, completed, total, Some(model_id.clone()));
        }

        info!(run = %cx.run.id, models = completed, "aggregation complete");
        Ok(PhaseOutcome::completed(completed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::clients::mock::MockEmbedder;
    use crate::config::{BenchConfig, ModelSpec};
    use crate::store::models::{
        CodeUnit, CodebaseInfo, ContrastiveOutcome, Difficulty, EvaluationResult,
        GeneratedSummary, IterativeOutcome, JudgeConfidence, JudgeOutcome, PairwiseResult,
        RetrievalOutcome, RubricScores, SummaryMetadata, UnitKind, UnitMetadata, Winner, new_id,
    };
    use crate::test_support::phase_context;
    use std::sync::Arc;

    fn config() -> BenchConfig {
        BenchConfig {
            generators: vec![ModelSpec::new("m1"), ModelSpec::new("m2")],
            judges: vec!["gpt-4o".into()],
            ..BenchConfig::default()
        }
    }

    struct Fixture {
        store: Arc<Store>,
        run: crate::store::models::Run,
        unit: CodeUnit,
        summary_m1: GeneratedSummary,
        summary_m2: GeneratedSummary,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = store
            .create_run("t", "", &config(), &CodebaseInfo::default())
            .unwrap();
        let unit = CodeUnit {
            id: new_id(),
            run_id: run.id.clone(),
            path: "src/a.rs".into(),
            name: "alpha".into(),
            kind: UnitKind::Function,
            language: "rust".into(),
            content: "fn alpha() {}".into(),
            metadata: UnitMetadata::default(),
            relationships: vec![],
        };
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();
        let summary_m1 = GeneratedSummary {
            id: new_id(),
            run_id: run.id.clone(),
            code_unit_id: unit.id.clone(),
            model_id: "m1".into(),
            text: "one".into(),
            metadata: SummaryMetadata::default(),
        };
        let summary_m2 = GeneratedSummary {
            id: new_id(),
            run_id: run.id.clone(),
            code_unit_id: unit.id.clone(),
            model_id: "m2".into(),
            text: "two".into(),
            metadata: SummaryMetadata::default(),
        };
        store
            .insert_summaries(&run.id, &[summary_m1.clone(), summary_m2.clone()])
            .unwrap();
        Fixture {
            store,
            run,
            unit,
            summary_m1,
            summary_m2,
        }
    }

    fn judge_row(f: &Fixture, summary_id: &str, avg: f64) -> EvaluationResult {
        EvaluationResult::new(
            &f.run.id,
            summary_id,
            EvalPayload::Judge(JudgeOutcome {
                judge_model: "gpt-4o".into(),
                scores: RubricScores {
                    accuracy: 4,
                    completeness: 4,
                    semantic_richness: 4,
                    abstraction: 4,
                    conciseness: 4,
                },
                weighted_average: avg,
                rationale: String::new(),
                cost: None,
            }),
        )
    }

    #[test]
    fn test_judge_combine_formula() {
        let f = fixture();
        f.store
            .insert_evaluation_result(&judge_row(&f, &f.summary_m1.id, 4.0))
            .unwrap();
        // m1 wins 3 of 4 comparisons against m2, ties 1.
        let mut rows = Vec::new();
        for winner in [Winner::A, Winner::A, Winner::A, Winner::Tie] {
            rows.push(PairwiseResult {
                id: new_id(),
                run_id: f.run.id.clone(),
                model_a: "m1".into(),
                model_b: "m2".into(),
                code_unit_id: f.unit.id.clone(),
                judge_model: "gpt-4o".into(),
                winner,
                confidence: JudgeConfidence::High,
                position_swapped: false,
                reasoning: None,
                criteria: None,
                cost: None,
            });
        }
        f.store.insert_pairwise_results(&rows).unwrap();

        let scores = compute_scores(&f.store, &f.run.id, &config()).unwrap();
        let m1 = &scores.iter().find(|(m, _)| m == "m1").unwrap().1;
        let judge = m1.judge.as_ref().unwrap();
        assert!((judge.pointwise - 0.8).abs() < 1e-9);
        assert!((judge.pairwise - 0.75).abs() < 1e-9);
        assert!((judge.combined - (0.4 * 0.8 + 0.6 * 0.75)).abs() < 1e-9);
    }

    #[test]
    fn test_contrastive_missing_method_has_zero_weight() {
        let f = fixture();
        // m1: embedding only, 1 of 2 correct.
        for correct in [true, false] {
            // Two rows need two distinct summaries; reuse m1's summary id
            // twice is fine for aggregation (grouping is by model).
            f.store
                .insert_evaluation_result(&EvaluationResult::new(
                    &f.run.id,
                    &f.summary_m1.id,
                    EvalPayload::Contrastive(ContrastiveOutcome {
                        method: ScoringMethod::Embedding,
                        predicted_rank: Some(if correct { 1 } else { 3 }),
                        correct,
                        confidence_gap: None,
                        candidate_count: 5,
                        difficulty: Difficulty::Easy,
                        judge_model: None,
                    }),
                ))
                .unwrap();
        }

        let scores = compute_scores(&f.store, &f.run.id, &config()).unwrap();
        let m1 = &scores.iter().find(|(m, _)| m == "m1").unwrap().1;
        let contrastive = m1.contrastive.as_ref().unwrap();
        assert_eq!(contrastive.embedding, Some(0.5));
        assert_eq!(contrastive.llm, None);
        // Missing llm method contributes zero weight: combined == embedding.
        assert!((contrastive.combined - 0.5).abs() < 1e-9);

        let m2 = &scores.iter().find(|(m, _)| m == "m2").unwrap().1;
        assert!(m2.contrastive.is_none());
    }

    #[test]
    fn test_retrieval_combine_formula() {
        let f = fixture();
        let mut hit_at = std::collections::BTreeMap::new();
        hit_at.insert(1, false);
        hit_at.insert(5, true);
        f.store
            .insert_evaluation_result(&EvaluationResult::new(
                &f.run.id,
                &f.summary_m1.id,
                EvalPayload::Retrieval(RetrievalOutcome {
                    query_id: "q1".into(),
                    query_type: "fallback".into(),
                    rank: 2,
                    reciprocal_rank: 0.5,
                    hit_at,
                    model_rank: 2,
                    is_winner: false,
                    pool_size: 4,
                    total_models: 2,
                }),
            ))
            .unwrap();

        let scores = compute_scores(&f.store, &f.run.id, &config()).unwrap();
        let retrieval = scores
            .iter()
            .find(|(m, _)| m == "m1")
            .unwrap()
            .1
            .retrieval
            .as_ref()
            .unwrap()
            .clone();
        assert_eq!(retrieval.precision_at_1, 0.0);
        assert_eq!(retrieval.precision_at_5, 1.0);
        assert!((retrieval.mrr - 0.5).abs() < 1e-9);
        assert_eq!(retrieval.win_rate, 0.0);
        assert!((retrieval.combined - (0.3 * 0.0 + 0.4 * 1.0 + 0.3 * 0.5)).abs() < 1e-9);

        let fallback = &retrieval.by_query_type["fallback"];
        assert_eq!(fallback.queries, 1);
        assert!((fallback.mrr - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_iterative_failures_depress_combined() {
        let f = fixture();
        let success = IterativeOutcome {
            rounds: 1,
            success: true,
            initial_rank: 2,
            final_rank: 1,
            history: vec![],
            refinement_score: crate::eval::iterative::refinement_score(1),
            duration_ms: 10,
        };
        let failure = IterativeOutcome {
            rounds: 3,
            success: false,
            initial_rank: 3,
            final_rank: 3,
            history: vec![],
            refinement_score: crate::eval::iterative::refinement_score(3),
            duration_ms: 10,
        };
        f.store
            .insert_evaluation_result(&EvaluationResult::new(
                &f.run.id,
                &f.summary_m1.id,
                EvalPayload::Iterative(success.clone()),
            ))
            .unwrap();
        f.store
            .insert_evaluation_result(&EvaluationResult::new(
                &f.run.id,
                &f.summary_m1.id,
                EvalPayload::Iterative(failure),
            ))
            .unwrap();

        let scores = compute_scores(&f.store, &f.run.id, &config()).unwrap();
        let iterative = scores
            .iter()
            .find(|(m, _)| m == "m1")
            .unwrap()
            .1
            .iterative
            .as_ref()
            .unwrap()
            .clone();
        assert!((iterative.avg_rounds - 2.0).abs() < 1e-9);
        assert!((iterative.success_rate - 0.5).abs() < 1e-9);
        assert!((iterative.avg_refinement_score - success.refinement_score).abs() < 1e-9);
        // Failure contributes zero to the combined mean.
        assert!((iterative.combined - success.refinement_score / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_overall_uses_configured_weights() {
        let f = fixture();
        f.store
            .insert_evaluation_result(&judge_row(&f, &f.summary_m1.id, 5.0))
            .unwrap();

        let scores = compute_scores(&f.store, &f.run.id, &config()).unwrap();
        let m1 = &scores.iter().find(|(m, _)| m == "m1").unwrap().1;
        // Only the judge category exists: pointwise 1.0, pairwise 0.
        let expected = 0.30 * (0.4 * 1.0);
        assert!((m1.overall - expected).abs() < 1e-9);

        // A model with no rows at all scores zero everywhere.
        let m2 = &scores.iter().find(|(m, _)| m == "m2").unwrap().1;
        assert_eq!(m2.overall, 0.0);
        assert!(m2.judge.is_none());
    }

    #[tokio::test]
    async fn test_executor_persists_one_row_per_model() {
        let f = fixture();
        f.store
            .insert_evaluation_result(&judge_row(&f, &f.summary_m1.id, 4.0))
            .unwrap();

        let registry = Arc::new(ClientRegistry::new(MockEmbedder::new(4)));
        let cx = phase_context(f.store.clone(), f.run.clone(), registry.clone());
        let outcome = AggregationExecutor::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.items_processed, 2);

        let saved = f.store.get_aggregated_scores(&f.run.id).unwrap();
        assert_eq!(saved.len(), 2);

        // Idempotent rerun: same rows, same values.
        let cx = phase_context(f.store.clone(), f.run.clone(), registry);
        AggregationExecutor::new().execute(&cx).await.unwrap();
        let saved_again = f.store.get_aggregated_scores(&f.run.id).unwrap();
        assert_eq!(saved, saved_again);
    }
}
