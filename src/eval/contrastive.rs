//! Contrastive matching evaluation.
//!
//! For each summary, can a matcher pick the summarized code unit out of a
//! lineup? Distractors are drawn hardest-first: same-file units share
//! context, signature-similar units share shape, semantically similar
//! units share meaning, and random units pad the rest. Two scoring
//! methods run side by side, a pure embedding ranking and an LLM
//! multiple-choice probe, stored separately so resumption is keyed by
//! `(summary, method)`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::info;

use crate::clients::retry::{RetryPolicy, complete_with_retry};
use crate::clients::{ChatMessage, CompletionRequest};
use crate::errors::LlmError;
use crate::index::cosine;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::selector::select_judges;
use crate::store::models::{
    CodeUnit, ContrastiveOutcome, Difficulty, DistractorSet, EvalKind, EvalPayload,
    EvaluationResult, GeneratedSummary, ScoringMethod, UnitMetadata, new_id,
};

/// Near-duplicate cutoff for the semantic tier: candidates this close to
/// the target are the target in all but name and would make the lineup
/// unanswerable.
const NEAR_DUPLICATE_COSINE: f32 = 0.95;

const SAME_FILE_CAP: usize = 3;
const SIGNATURE_CAP: usize = 3;

/// Minimum same-language cohort for the evaluation to be meaningful.
const MIN_COHORT: usize = 5;

// ── Distractor selection ──────────────────────────────────────────────

/// Mean of parameter-count similarity and parameter-name overlap.
pub(crate) fn signature_similarity(a: &UnitMetadata, b: &UnitMetadata) -> f64 {
    let na = a.parameters.len();
    let nb = b.parameters.len();
    let count_sim = 1.0 - (na.abs_diff(nb) as f64) / (na.max(nb).max(1) as f64);

    let set_a: HashSet<&String> = a.parameters.iter().collect();
    let set_b: HashSet<&String> = b.parameters.iter().collect();
    let union = set_a.union(&set_b).count();
    let overlap = if union == 0 {
        1.0
    } else {
        set_a.intersection(&set_b).count() as f64 / union as f64
    };

    (count_sim + overlap) / 2.0
}

/// Select up to `count` distractors for `target`, consuming tiers in
/// order. All tiers restrict to the target's language and exclude the
/// target; same-kind candidates are preferred but the restriction is
/// relaxed when the pool runs short.
pub(crate) fn select_distractors(
    target: &CodeUnit,
    candidates: &[CodeUnit],
    count: usize,
    code_vectors: Option<&HashMap<String, Arc<Vec<f32>>>>,
    rng: &mut impl rand::Rng,
) -> DistractorSet {
    let same_language: Vec<&CodeUnit> = candidates
        .iter()
        .filter(|c| c.id != target.id && c.language == target.language)
        .collect();
    let same_kind: Vec<&CodeUnit> = same_language
        .iter()
        .copied()
        .filter(|c| c.kind == target.kind)
        .collect();
    let pool: Vec<&CodeUnit> = if same_kind.len() >= count {
        same_kind
    } else {
        same_language
    };

    let mut chosen: Vec<String> = Vec::with_capacity(count);
    let mut push = |id: &str, chosen: &mut Vec<String>| {
        if chosen.len() < count && !chosen.iter().any(|c| c == id) {
            chosen.push(id.to_string());
        }
    };

    // Tier 1 — same file.
    for unit in pool.iter().filter(|c| c.path == target.path).take(SAME_FILE_CAP) {
        push(&unit.id, &mut chosen);
    }

    // Tier 2 — signature-similar.
    if target.metadata.signature.is_some() {
        let mut scored: Vec<(&CodeUnit, f64)> = pool
            .iter()
            .filter(|c| c.metadata.signature.is_some())
            .map(|c| (*c, signature_similarity(&target.metadata, &c.metadata)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let before = chosen.len();
        for (unit, _) in scored {
            if chosen.len() >= count || chosen.len() - before >= SIGNATURE_CAP {
                break;
            }
            push(&unit.id, &mut chosen);
        }
    }

    // Tier 3 — semantically similar, near-duplicates dropped.
    if let Some(vectors) = code_vectors {
        if let Some(target_vec) = vectors.get(&target.id) {
            let mut scored: Vec<(&CodeUnit, f32)> = pool
                .iter()
                .filter_map(|c| vectors.get(&c.id).map(|v| (*c, cosine(target_vec, v))))
                .filter(|(_, sim)| *sim < NEAR_DUPLICATE_COSINE)
                .collect();
            scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (unit, _) in scored {
                if chosen.len() >= count {
                    break;
                }
                push(&unit.id, &mut chosen);
            }
        }
    }

    // Tier 4 — random padding.
    let mut remaining: Vec<&CodeUnit> = pool
        .iter()
        .copied()
        .filter(|c| !chosen.iter().any(|id| id == &c.id))
        .collect();
    remaining.shuffle(rng);
    for unit in remaining {
        if chosen.len() >= count {
            break;
        }
        push(&unit.id, &mut chosen);
    }

    let by_id: HashMap<&str, &CodeUnit> = pool.iter().map(|c| (c.id.as_str(), *c)).collect();
    let same_file_count = chosen
        .iter()
        .filter(|id| by_id.get(id.as_str()).is_some_and(|c| c.path == target.path))
        .count();
    let difficulty = if same_file_count >= 3 {
        Difficulty::Hard
    } else if same_file_count >= 1 {
        Difficulty::Medium
    } else {
        Difficulty::Easy
    };

    DistractorSet {
        id: new_id(),
        run_id: target.run_id.clone(),
        target_code_unit_id: target.id.clone(),
        distractor_ids: chosen,
        difficulty,
    }
}

fn cohort_sizes(units: &[CodeUnit]) -> Vec<(String, usize)> {
    let mut sizes: HashMap<&str, usize> = HashMap::new();
    for unit in units {
        *sizes.entry(unit.language.as_str()).or_insert(0) += 1;
    }
    let mut sizes: Vec<(String, usize)> = sizes
        .into_iter()
        .map(|(language, n)| (language.to_string(), n))
        .collect();
    sizes.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    sizes
}

// ── Scoring ───────────────────────────────────────────────────────────

fn score_by_embedding(
    summary_vec: &[f32],
    target_id: &str,
    lineup: &[&CodeUnit],
    vectors: &HashMap<String, Arc<Vec<f32>>>,
    difficulty: Difficulty,
) -> Result<ContrastiveOutcome, LlmError> {
    let mut scored: Vec<(&str, f32)> = Vec::with_capacity(lineup.len());
    for unit in lineup {
        let vector = vectors
            .get(&unit.id)
            .ok_or_else(|| LlmError::InvalidResponse("missing code embedding".into()))?;
        scored.push((unit.id.as_str(), cosine(summary_vec, vector)));
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let rank = scored
        .iter()
        .position(|(id, _)| *id == target_id)
        .map(|p| p + 1)
        .ok_or_else(|| LlmError::InvalidResponse("target missing from lineup".into()))?;
    let confidence_gap = if scored.len() >= 2 {
        Some(f64::from(scored[0].1 - scored[1].1))
    } else {
        None
    };

    Ok(ContrastiveOutcome {
        method: ScoringMethod::Embedding,
        predicted_rank: Some(rank),
        correct: rank == 1,
        confidence_gap,
        candidate_count: lineup.len(),
        difficulty,
        judge_model: None,
    })
}

fn lineup_prompt(summary: &str, lineup: &[&CodeUnit]) -> CompletionRequest {
    let mut options = String::new();
    for (i, unit) in lineup.iter().enumerate() {
        options.push_str(&format!("Option {}:\n```\n{}\n```\n\n", i + 1, unit.content));
    }
    CompletionRequest::new(vec![
        ChatMessage::system(
            "You match code summaries to code. Given a summary and numbered code options, \
             answer with the number of the option the summary describes. Respond with JSON: \
             {\"choice\": <number>}",
        ),
        ChatMessage::user(format!("Summary:\n{}\n\n{}", summary, options)),
    ])
    .with_temperature(0.0)
}

fn parse_choice(text: &str, option_count: usize) -> Result<usize, LlmError> {
    if let Ok(value) = super::parse_json_lenient(text) {
        if let Some(choice) = value.get("choice").and_then(|c| c.as_u64()) {
            let choice = choice as usize;
            if choice >= 1 && choice <= option_count {
                return Ok(choice);
            }
        }
    }
    // Plain "3" or "Option 3" style answers.
    let digits: String = text
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(|c| c.is_ascii_digit())
        .collect();
    match digits.parse::<usize>() {
        Ok(choice) if choice >= 1 && choice <= option_count => Ok(choice),
        _ => Err(LlmError::InvalidResponse(format!(
            "no option number in: {}",
            text.chars().take(80).collect::<String>()
        ))),
    }
}

// ── Executor ──────────────────────────────────────────────────────────

pub struct ContrastiveEvaluator;

impl ContrastiveEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ContrastiveEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseExecutor for ContrastiveEvaluator {
    fn phase(&self) -> Phase {
        Phase::EvalContrastive
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        if !cx.config.evaluation.contrastive.enabled {
            return Ok(PhaseOutcome::skipped("contrastive evaluation disabled"));
        }
        let summaries = cx.store.get_summaries(&cx.run.id, None)?;
        if summaries.is_empty() {
            return Ok(PhaseOutcome::skipped("no summaries to evaluate"));
        }
        let units = cx.store.get_code_units(&cx.run.id)?;

        let sizes = cohort_sizes(&units);
        if sizes.first().map(|(_, n)| *n).unwrap_or(0) < MIN_COHORT {
            let detail = sizes
                .iter()
                .map(|(language, n)| format!("{}: {}", language, n))
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(PhaseOutcome::skipped(format!(
                "largest same-language cohort below {} units ({})",
                MIN_COHORT, detail
            )));
        }

        let methods = cx.config.evaluation.contrastive.method.methods();
        let evaluated: HashSet<(String, ScoringMethod)> = cx
            .store
            .get_evaluation_results(&cx.run.id, Some(EvalKind::Contrastive))?
            .into_iter()
            .filter_map(|r| match r.payload {
                EvalPayload::Contrastive(outcome) => Some((r.summary_id, outcome.method)),
                _ => None,
            })
            .collect();

        let total = (summaries.len() * methods.len()) as u64;
        cx.state.start_phase(Phase::EvalContrastive, total)?;
        let completed = Arc::new(AtomicU64::new(evaluated.len() as u64));
        cx.state
            .update_progress(Phase::EvalContrastive, completed.load(Ordering::SeqCst), None)?;

        // Pre-embed all unit contents (tier 3 + embedding scoring) and all
        // summary texts in two batches.
        let embedder = cx.clients.embedder();
        let unit_texts: Vec<String> = units.iter().map(|u| u.content.clone()).collect();
        let unit_vectors_list = cx
            .cache
            .embed_all(&embedder, &unit_texts, &cx.cancel)
            .await
            .context("Failed to embed code units")?;
        let code_vectors: HashMap<String, Arc<Vec<f32>>> = units
            .iter()
            .map(|u| u.id.clone())
            .zip(unit_vectors_list)
            .collect();
        let summary_texts: Vec<String> = summaries.iter().map(|s| s.text.clone()).collect();
        let summary_vectors_list = cx
            .cache
            .embed_all(&embedder, &summary_texts, &cx.cancel)
            .await
            .context("Failed to embed summaries")?;
        let summary_vectors: HashMap<String, Arc<Vec<f32>>> = summaries
            .iter()
            .map(|s| s.id.clone())
            .zip(summary_vectors_list)
            .collect();

        // Distractor sets are selected once per target and persisted, so a
        // resumed run (and every method) sees identical lineups.
        let mut sets: HashMap<String, DistractorSet> = cx
            .store
            .get_distractor_sets(&cx.run.id)?
            .into_iter()
            .map(|s| (s.target_code_unit_id.clone(), s))
            .collect();
        let targets: HashSet<&String> = summaries.iter().map(|s| &s.code_unit_id).collect();
        let mut new_sets = Vec::new();
        {
            let mut rng = rand::thread_rng();
            for target_id in targets {
                if sets.contains_key(target_id) {
                    continue;
                }
                let Some(target) = units.iter().find(|u| &u.id == target_id) else {
                    continue;
                };
                let set = select_distractors(
                    target,
                    &units,
                    cx.config.evaluation.contrastive.distractor_count,
                    Some(&code_vectors),
                    &mut rng,
                );
                new_sets.push(set.clone());
                sets.insert(target_id.clone(), set);
            }
        }
        if !new_sets.is_empty() {
            cx.store.insert_distractor_sets(&new_sets)?;
        }

        let units_by_id: HashMap<&str, &CodeUnit> =
            units.iter().map(|u| (u.id.as_str(), u)).collect();
        let tally = Arc::new(Mutex::new(super::FailureTally::new()));
        let pool_width = cx.config.concurrency.contrastive_pool.max(1);

        let method_streams = methods.iter().map(|method| {
            let method = *method;
            let summaries = &summaries;
            let sets = &sets;
            let units_by_id = &units_by_id;
            let code_vectors = &code_vectors;
            let summary_vectors = &summary_vectors;
            let evaluated = &evaluated;
            let completed = completed.clone();
            let tally = tally.clone();
            async move {
                let pending: Vec<&GeneratedSummary> = summaries
                    .iter()
                    .filter(|s| !evaluated.contains(&(s.id.clone(), method)))
                    .collect();
                futures::stream::iter(pending)
                    .for_each_concurrent(pool_width, |summary| {
                        let completed = completed.clone();
                        let tally = tally.clone();
                        async move {
                            if cx.cancel.is_cancelled() {
                                return;
                            }
                            let outcome =
                                score_one(cx, method, summary, sets, units_by_id, code_vectors, summary_vectors)
                                    .await;
                            match outcome {
                                Ok(Some(payload)) => {
                                    let row = EvaluationResult::new(
                                        &cx.run.id,
                                        &summary.id,
                                        EvalPayload::Contrastive(payload),
                                    );
                                    if let Err(err) = cx.store.insert_evaluation_result(&row) {
                                        tally.lock().await.record(
                                            &summary.model_id,
                                            &LlmError::Unknown(err.to_string()),
                                        );
                                    }
                                }
                                // Per-item skip: no lineup for this target.
                                Ok(None) => {}
                                Err(LlmError::Cancelled) => return,
                                Err(err) => {
                                    tally.lock().await.record(&summary.model_id, &err);
                                }
                            }
                            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = cx.state.update_progress(
                                Phase::EvalContrastive,
                                done,
                                Some(&summary.id),
                            );
                            cx.report_progress(
                                Phase::EvalContrastive,
                                done,
                                total,
                                Some(format!("{} · {}", method.as_str(), summary.model_id)),
                            );
                        }
                    })
                    .await;
            }
        });
        futures::future::join_all(method_streams).await;

        if cx.cancel.is_cancelled() {
            bail!("contrastive evaluation cancelled");
        }

        let tally = Arc::try_unwrap(tally)
            .map_err(|_| anyhow::anyhow!("failure tally still shared"))?
            .into_inner();
        let attempted = completed.load(Ordering::SeqCst);
        info!(run = %cx.run.id, items = attempted, "contrastive evaluation complete");
        Ok(PhaseOutcome::completed(attempted).with_failures(tally.into_failures()))
    }
}

/// Score one `(summary, method)` task. `Ok(None)` is a per-item skip
/// (missing lineup data) that still advances the cursor.
async fn score_one(
    cx: &PhaseContext,
    method: ScoringMethod,
    summary: &GeneratedSummary,
    sets: &HashMap<String, DistractorSet>,
    units_by_id: &HashMap<&str, &CodeUnit>,
    code_vectors: &HashMap<String, Arc<Vec<f32>>>,
    summary_vectors: &HashMap<String, Arc<Vec<f32>>>,
) -> Result<Option<ContrastiveOutcome>, LlmError> {
    let Some(set) = sets.get(&summary.code_unit_id) else {
        return Ok(None);
    };
    let Some(target) = units_by_id.get(summary.code_unit_id.as_str()).copied() else {
        return Ok(None);
    };
    // Target first, distractors in stored order; embedding ties favor the
    // target deterministically.
    let mut lineup: Vec<&CodeUnit> = vec![target];
    for id in &set.distractor_ids {
        if let Some(unit) = units_by_id.get(id.as_str()).copied() {
            lineup.push(unit);
        }
    }
    if lineup.len() < 2 {
        return Err(LlmError::InvalidResponse(
            "distractor set resolved to fewer than two candidates".into(),
        ));
    }

    match method {
        ScoringMethod::Embedding => {
            let summary_vec = summary_vectors
                .get(&summary.id)
                .ok_or_else(|| LlmError::InvalidResponse("missing summary embedding".into()))?;
            score_by_embedding(summary_vec, &target.id, &lineup, code_vectors, set.difficulty)
                .map(Some)
        }
        ScoringMethod::Llm => {
            let judges = select_judges(&summary.model_id, &cx.config.judges, 1)
                .map_err(|e| LlmError::Unknown(e.to_string()))?;
            let judge_id = &judges[0];
            let judge = cx
                .clients
                .judge(judge_id)
                .ok_or_else(|| LlmError::Unknown(format!("no client for judge {}", judge_id)))?;

            // Shuffle so the target's position carries no signal.
            let mut shuffled = lineup.clone();
            shuffled.shuffle(&mut rand::thread_rng());
            let target_position = shuffled
                .iter()
                .position(|u| u.id == target.id)
                .map(|p| p + 1)
                .ok_or_else(|| LlmError::InvalidResponse("target lost in shuffle".into()))?;

            let request = lineup_prompt(&summary.text, &shuffled);
            let completion =
                complete_with_retry(&judge, request, &RetryPolicy::default(), &cx.cancel).await?;
            let choice = parse_choice(&completion.content, shuffled.len())?;

            Ok(Some(ContrastiveOutcome {
                method: ScoringMethod::Llm,
                predicted_rank: None,
                correct: choice == target_position,
                confidence_gap: None,
                candidate_count: shuffled.len(),
                difficulty: set.difficulty,
                judge_model: Some(judge_id.clone()),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::clients::mock::{MockEmbedder, MockLlm};
    use crate::config::{BenchConfig, MethodChoice, ModelSpec};
    use crate::store::Store;
    use crate::store::models::{CodebaseInfo, SummaryMetadata, UnitKind};
    use crate::test_support::phase_context;

    fn unit_with(
        run_id: &str,
        path: &str,
        name: &str,
        params: &[&str],
        language: &str,
    ) -> CodeUnit {
        CodeUnit {
            id: new_id(),
            run_id: run_id.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            kind: UnitKind::Function,
            language: language.to_string(),
            content: format!("fn {}({}) {{}}", name, params.join(", ")),
            metadata: UnitMetadata {
                start_line: 1,
                end_line: 5,
                signature: Some(format!("fn {}({})", name, params.join(", "))),
                parameters: params.iter().map(|p| p.to_string()).collect(),
                doc_comment: None,
            },
            relationships: vec![],
        }
    }

    #[test]
    fn test_signature_similarity() {
        let a = unit_with("r", "f.rs", "a", &["user_id", "token"], "rust").metadata;
        let same = unit_with("r", "f.rs", "b", &["user_id", "token"], "rust").metadata;
        assert!((signature_similarity(&a, &same) - 1.0).abs() < 1e-9);

        let disjoint = unit_with("r", "f.rs", "c", &["x", "y"], "rust").metadata;
        // Counts match (1.0), names disjoint (0.0).
        assert!((signature_similarity(&a, &disjoint) - 0.5).abs() < 1e-9);

        let none = unit_with("r", "f.rs", "d", &[], "rust").metadata;
        // Count similarity 0, overlap 0.
        assert!(signature_similarity(&a, &none).abs() < 1e-9);
    }

    #[test]
    fn test_distractor_tiering_same_file_first() {
        let run_id = "r";
        let target = unit_with(run_id, "src/auth.rs", "login", &["user", "pass"], "rust");
        let mut candidates = vec![target.clone()];
        // Five same-file units of the same kind.
        for i in 0..5 {
            candidates.push(unit_with(
                run_id,
                "src/auth.rs",
                &format!("auth_helper_{}", i),
                &["user"],
                "rust",
            ));
        }
        // Plenty of units elsewhere.
        for i in 0..10 {
            candidates.push(unit_with(
                run_id,
                &format!("src/other_{}.rs", i),
                &format!("other_{}", i),
                &["x"],
                "rust",
            ));
        }

        let mut rng = rand::thread_rng();
        let set = select_distractors(&target, &candidates, 9, None, &mut rng);

        assert_eq!(set.distractor_ids.len(), 9);
        assert!(!set.distractor_ids.contains(&target.id));
        let unique: HashSet<&String> = set.distractor_ids.iter().collect();
        assert_eq!(unique.len(), 9);

        // Tier 1 contributes its cap of 3 same-file distractors (later
        // tiers may add more), so difficulty is hard.
        let same_file = set
            .distractor_ids
            .iter()
            .filter(|id| {
                candidates
                    .iter()
                    .any(|c| &c.id == *id && c.path == "src/auth.rs")
            })
            .count();
        assert!(same_file >= 3);
        assert_eq!(set.difficulty, Difficulty::Hard);
        // The first three chosen are the same-file tier.
        for id in set.distractor_ids.iter().take(3) {
            assert!(
                candidates
                    .iter()
                    .any(|c| &c.id == id && c.path == "src/auth.rs")
            );
        }
    }

    #[test]
    fn test_distractors_restricted_to_language() {
        let run_id = "r";
        let target = unit_with(run_id, "a.rs", "alpha", &["x"], "rust");
        let mut candidates = vec![target.clone()];
        for i in 0..4 {
            candidates.push(unit_with(run_id, "b.rs", &format!("r{}", i), &["x"], "rust"));
        }
        for i in 0..10 {
            candidates.push(unit_with(run_id, "c.go", &format!("g{}", i), &["x"], "go"));
        }

        let mut rng = rand::thread_rng();
        let set = select_distractors(&target, &candidates, 9, None, &mut rng);
        // Only the four same-language units qualify.
        assert_eq!(set.distractor_ids.len(), 4);
        assert_eq!(set.difficulty, Difficulty::Easy);
    }

    #[test]
    fn test_semantic_tier_drops_near_duplicates() {
        let run_id = "r";
        let target = unit_with(run_id, "a.rs", "alpha", &[], "rust");
        let twin = unit_with(run_id, "b.rs", "alpha_copy", &[], "rust");
        let cousin = unit_with(run_id, "c.rs", "related", &[], "rust");
        let stranger = unit_with(run_id, "d.rs", "unrelated", &[], "rust");
        let candidates = vec![target.clone(), twin.clone(), cousin.clone(), stranger.clone()];

        let mut vectors: HashMap<String, Arc<Vec<f32>>> = HashMap::new();
        vectors.insert(target.id.clone(), Arc::new(vec![1.0, 0.0]));
        vectors.insert(twin.id.clone(), Arc::new(vec![0.999, 0.04]));
        vectors.insert(cousin.id.clone(), Arc::new(vec![0.8, 0.6]));
        vectors.insert(stranger.id.clone(), Arc::new(vec![0.0, 1.0]));

        // Strip signatures so tier 2 stays out of the way; ask for one
        // distractor so only the semantic tier picks.
        let mut target = target;
        target.metadata.signature = None;
        let mut rng = rand::thread_rng();
        let set = select_distractors(&target, &candidates, 1, Some(&vectors), &mut rng);
        // The twin (cosine ≈ 0.999) is dropped; the cousin wins.
        assert_eq!(set.distractor_ids, vec![cousin.id.clone()]);
    }

    // ── Executor tests ────────────────────────────────────────────────

    fn config(method: MethodChoice) -> BenchConfig {
        BenchConfig {
            generators: vec![ModelSpec::new("claude-sonnet-4-5")],
            judges: vec!["gpt-4o".into(), "gemini-2.5-pro".into()],
            evaluation: crate::config::EvaluationConfig {
                contrastive: crate::config::ContrastiveConfig {
                    enabled: true,
                    distractor_count: 4,
                    method,
                },
                ..Default::default()
            },
            ..BenchConfig::default()
        }
    }

    fn seed_run(
        store: &Arc<Store>,
        method: MethodChoice,
    ) -> (crate::store::models::Run, Vec<CodeUnit>, GeneratedSummary) {
        let run = store
            .create_run("t", "", &config(method), &CodebaseInfo::default())
            .unwrap();
        let mut units = Vec::new();
        for i in 0..6 {
            units.push(unit_with(
                &run.id,
                &format!("src/m{}.rs", i),
                &format!("func_{}", i),
                &["a", "b"],
                "rust",
            ));
        }
        store.insert_code_units(&run.id, &units).unwrap();

        let summary = GeneratedSummary {
            id: new_id(),
            run_id: run.id.clone(),
            code_unit_id: units[0].id.clone(),
            model_id: "claude-sonnet-4-5".to_string(),
            text: "describes func_0".to_string(),
            metadata: SummaryMetadata::default(),
        };
        store.insert_summaries(&run.id, &[summary.clone()]).unwrap();
        (run, units, summary)
    }

    #[tokio::test]
    async fn test_embedding_method_correct_when_target_ranks_first() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, units, summary) = seed_run(&store, MethodChoice::Embedding);

        let embedder = MockEmbedder::new(2);
        embedder.pin(&summary.text, vec![1.0, 0.0]);
        embedder.pin(&units[0].content, vec![0.98, (1.0f32 - 0.98 * 0.98).sqrt()]);
        for unit in &units[1..] {
            embedder.pin(&unit.content, vec![0.1, (1.0f32 - 0.01).sqrt()]);
        }
        let registry = Arc::new(ClientRegistry::new(embedder));
        let cx = phase_context(store.clone(), run.clone(), registry);

        let outcome = ContrastiveEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert!(outcome.failures.is_empty());

        let results = store
            .get_evaluation_results(&run.id, Some(EvalKind::Contrastive))
            .unwrap();
        assert_eq!(results.len(), 1);
        match &results[0].payload {
            EvalPayload::Contrastive(c) => {
                assert_eq!(c.method, ScoringMethod::Embedding);
                assert_eq!(c.predicted_rank, Some(1));
                assert!(c.correct);
                assert!(c.confidence_gap.unwrap() > 0.5);
                assert_eq!(c.candidate_count, 5);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_llm_method_uses_cross_family_judge() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, _units, _summary) = seed_run(&store, MethodChoice::Llm);

        let embedder = MockEmbedder::new(4);
        // The judge always answers option 1; whether that is correct
        // depends on the shuffle, so just assert a row lands.
        let judge = MockLlm::fixed("gpt-4o", r#"{"choice": 1}"#);
        let mut registry = ClientRegistry::new(embedder);
        registry.register_judge(judge.clone());
        registry.register_judge(MockLlm::fixed("gemini-2.5-pro", r#"{"choice": 1}"#));
        let cx = phase_context(store.clone(), run.clone(), Arc::new(registry));

        let outcome = ContrastiveEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success, "failures: {:?}", outcome.failures);
        assert!(judge.call_count() > 0);

        let results = store
            .get_evaluation_results(&run.id, Some(EvalKind::Contrastive))
            .unwrap();
        assert_eq!(results.len(), 1);
        match &results[0].payload {
            EvalPayload::Contrastive(c) => {
                assert_eq!(c.method, ScoringMethod::Llm);
                assert_eq!(c.judge_model.as_deref(), Some("gpt-4o"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_small_cohort_skips_phase_with_sizes() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = store
            .create_run("t", "", &config(MethodChoice::Embedding), &CodebaseInfo::default())
            .unwrap();
        let units = vec![
            unit_with(&run.id, "a.rs", "a", &[], "rust"),
            unit_with(&run.id, "b.rs", "b", &[], "rust"),
            unit_with(&run.id, "c.go", "c", &[], "go"),
        ];
        store.insert_code_units(&run.id, &units).unwrap();
        store
            .insert_summaries(
                &run.id,
                &[GeneratedSummary {
                    id: new_id(),
                    run_id: run.id.clone(),
                    code_unit_id: units[0].id.clone(),
                    model_id: "claude-sonnet-4-5".to_string(),
                    text: "x".to_string(),
                    metadata: SummaryMetadata::default(),
                }],
            )
            .unwrap();

        let registry = Arc::new(ClientRegistry::new(MockEmbedder::new(4)));
        let cx = phase_context(store, run, registry);
        let outcome = ContrastiveEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        let reason = outcome.skip_reason.unwrap();
        assert!(reason.contains("rust: 2"));
        assert!(reason.contains("go: 1"));
    }

    #[tokio::test]
    async fn test_resume_skips_scored_pairs_and_reuses_sets() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, _units, _summary) = seed_run(&store, MethodChoice::Embedding);
        let registry = Arc::new(ClientRegistry::new(MockEmbedder::new(4)));

        let cx = phase_context(store.clone(), run.clone(), registry.clone());
        ContrastiveEvaluator::new().execute(&cx).await.unwrap();
        let sets_after_first = store.get_distractor_sets(&run.id).unwrap();
        let rows_after_first = store
            .get_evaluation_results(&run.id, Some(EvalKind::Contrastive))
            .unwrap()
            .len();

        let cx = phase_context(store.clone(), run.clone(), registry);
        ContrastiveEvaluator::new().execute(&cx).await.unwrap();
        let sets_after_second = store.get_distractor_sets(&run.id).unwrap();
        let rows_after_second = store
            .get_evaluation_results(&run.id, Some(EvalKind::Contrastive))
            .unwrap()
            .len();

        assert_eq!(rows_after_first, rows_after_second);
        assert_eq!(sets_after_first, sets_after_second);
    }
}
