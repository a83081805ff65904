//! Judge evaluation: pointwise rubric scoring and the pairwise tournament.
//!
//! Pointwise sends every `(summary, judge)` pair a five-criterion rubric;
//! pairwise runs head-to-head comparisons for every generator pair, once
//! per ordering to cancel position bias, under a hard per-judge
//! comparison budget stratified across pairs. Judges never score their
//! own provider family.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::clients::retry::{RetryPolicy, complete_with_retry};
use crate::clients::{ChatMessage, CompletionRequest};
use crate::errors::LlmError;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::selector::{family_of, select_judges};
use crate::store::models::{
    CodeUnit, EvalKind, EvalPayload, EvaluationResult, GeneratedSummary, JudgeConfidence,
    JudgeOutcome, PairwiseResult, RubricScores, Winner, new_id,
};

// ── Pairwise planning ─────────────────────────────────────────────────

/// One head-to-head task; a task issues both orderings to each judge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct PairTask {
    pub model_a: String,
    pub model_b: String,
    pub code_unit_id: String,
}

/// Stratified sampling under the comparison budget: when the full task
/// list exceeds `cap_comparisons / 2`, every pair receives
/// `⌈task_budget / num_pairs⌉` tasks taken at evenly spaced indices from
/// its own eligible list, so no pair loses representation to a larger one.
pub(crate) fn plan_pairwise_tasks(
    eligible: &BTreeMap<(String, String), Vec<String>>,
    cap_comparisons: usize,
) -> Vec<PairTask> {
    let num_pairs = eligible.len();
    if num_pairs == 0 {
        return Vec::new();
    }
    let task_budget = cap_comparisons / 2;
    let total_tasks: usize = eligible.values().map(Vec::len).sum();

    let mut tasks = Vec::new();
    if total_tasks <= task_budget {
        for ((a, b), units) in eligible {
            for unit in units {
                tasks.push(PairTask {
                    model_a: a.clone(),
                    model_b: b.clone(),
                    code_unit_id: unit.clone(),
                });
            }
        }
        return tasks;
    }

    let quota = task_budget.div_ceil(num_pairs);
    for ((a, b), units) in eligible {
        for index in super::sample_evenly(units.len(), quota) {
            tasks.push(PairTask {
                model_a: a.clone(),
                model_b: b.clone(),
                code_unit_id: units[index].clone(),
            });
        }
    }
    tasks
}

// ── Tournament aggregation ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Standing {
    pub wins: u64,
    pub losses: u64,
    pub ties: u64,
}

impl Standing {
    pub fn win_rate(&self) -> f64 {
        let total = self.wins + self.losses + self.ties;
        if total == 0 {
            return 0.0;
        }
        self.wins as f64 / total as f64
    }
}

/// Collapse raw pairwise rows into per-model standings. Rows already
/// carry canonical winners, so arrival order and position swaps are
/// invisible here.
pub fn tournament_standings(rows: &[PairwiseResult]) -> HashMap<String, Standing> {
    let mut standings: HashMap<String, Standing> = HashMap::new();
    for row in rows {
        let a = standings.entry(row.model_a.clone()).or_default();
        match row.winner {
            Winner::A => a.wins += 1,
            Winner::B => a.losses += 1,
            Winner::Tie => a.ties += 1,
        }
        let b = standings.entry(row.model_b.clone()).or_default();
        match row.winner {
            Winner::A => b.losses += 1,
            Winner::B => b.wins += 1,
            Winner::Tie => b.ties += 1,
        }
    }
    standings
}

// ── Prompts and parsing ───────────────────────────────────────────────

fn pointwise_request(unit: &CodeUnit, summary: &GeneratedSummary) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(
            "You grade code summaries. Score the summary against the code on five criteria, \
             each an integer from 1 to 5: accuracy, completeness, semantic_richness, \
             abstraction, conciseness. Respond with JSON only: {\"accuracy\": n, \
             \"completeness\": n, \"semantic_richness\": n, \"abstraction\": n, \
             \"conciseness\": n, \"rationale\": \"...\"}",
        ),
        ChatMessage::user(format!(
            "Code ({}):\n```\n{}\n```\n\nSummary:\n{}",
            unit.language, unit.content, summary.text
        )),
    ])
    .with_temperature(0.0)
}

fn parse_rubric(text: &str) -> Result<(RubricScores, String), LlmError> {
    let value = super::parse_json_lenient(text)?;
    let score = |key: &str| -> Result<u8, LlmError> {
        value
            .get(key)
            .and_then(|v| v.as_f64())
            .map(RubricScores::clamp_score)
            .ok_or_else(|| LlmError::InvalidResponse(format!("missing rubric score: {}", key)))
    };
    let scores = RubricScores {
        accuracy: score("accuracy")?,
        completeness: score("completeness")?,
        semantic_richness: score("semantic_richness")?,
        abstraction: score("abstraction")?,
        conciseness: score("conciseness")?,
    };
    let rationale = value
        .get("rationale")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    Ok((scores, rationale))
}

fn pairwise_request(unit: &CodeUnit, first: &str, second: &str) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(
            "You compare two code summaries of the same code. Decide which summary is better \
             or whether they tie. Respond with JSON only: {\"winner\": \"1\" | \"2\" | \
             \"tie\", \"confidence\": \"high\" | \"medium\" | \"low\", \"reasoning\": \
             \"...\"}",
        ),
        ChatMessage::user(format!(
            "Code ({}):\n```\n{}\n```\n\nSummary 1:\n{}\n\nSummary 2:\n{}",
            unit.language, unit.content, first, second
        )),
    ])
    .with_temperature(0.0)
}

/// The winner as presented to the judge (first/second position).
#[derive(Debug, Clone, Copy, PartialEq)]
enum PresentedWinner {
    First,
    Second,
    Tie,
}

fn parse_verdict(
    text: &str,
) -> Result<(PresentedWinner, JudgeConfidence, Option<String>, Option<RubricScores>), LlmError> {
    let value = super::parse_json_lenient(text)?;
    let winner = match value.get("winner") {
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "1" | "a" | "first" => PresentedWinner::First,
            "2" | "b" | "second" => PresentedWinner::Second,
            "tie" | "draw" => PresentedWinner::Tie,
            other => {
                return Err(LlmError::InvalidResponse(format!(
                    "unrecognized winner: {}",
                    other
                )));
            }
        },
        Some(serde_json::Value::Number(n)) => match n.as_u64() {
            Some(1) => PresentedWinner::First,
            Some(2) => PresentedWinner::Second,
            _ => {
                return Err(LlmError::InvalidResponse(format!(
                    "unrecognized winner number: {}",
                    n
                )));
            }
        },
        _ => return Err(LlmError::InvalidResponse("missing winner".into())),
    };
    let confidence = value
        .get("confidence")
        .and_then(|v| v.as_str())
        .and_then(|s| JudgeConfidence::from_str(&s.to_ascii_lowercase()).ok())
        .unwrap_or(JudgeConfidence::Medium);
    let reasoning = value
        .get("reasoning")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    let criteria = value.get("criteria").and_then(|c| {
        let score = |key: &str| c.get(key).and_then(|v| v.as_f64()).map(RubricScores::clamp_score);
        Some(RubricScores {
            accuracy: score("accuracy")?,
            completeness: score("completeness")?,
            semantic_richness: score("semantic_richness")?,
            abstraction: score("abstraction")?,
            conciseness: score("conciseness")?,
        })
    });
    Ok((winner, confidence, reasoning, criteria))
}

fn canonical_winner(presented: PresentedWinner, swapped: bool) -> Winner {
    match (presented, swapped) {
        (PresentedWinner::Tie, _) => Winner::Tie,
        (PresentedWinner::First, false) | (PresentedWinner::Second, true) => Winner::A,
        (PresentedWinner::First, true) | (PresentedWinner::Second, false) => Winner::B,
    }
}

// ── Executor ──────────────────────────────────────────────────────────

pub struct JudgeEvaluator;

impl JudgeEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl Default for JudgeEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PhaseExecutor for JudgeEvaluator {
    fn phase(&self) -> Phase {
        Phase::EvalJudge
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        if !cx.config.evaluation.judge.enabled {
            return Ok(PhaseOutcome::skipped("judge evaluation disabled"));
        }
        let summaries = cx.store.get_summaries(&cx.run.id, None)?;
        if summaries.is_empty() {
            return Ok(PhaseOutcome::skipped("no summaries to evaluate"));
        }
        let units = cx.store.get_code_units(&cx.run.id)?;
        let units_by_id: HashMap<&str, &CodeUnit> =
            units.iter().map(|u| (u.id.as_str(), u)).collect();

        let tally = Arc::new(Mutex::new(super::FailureTally::new()));

        // ── Pointwise planning ────────────────────────────────────────
        let mut judges_by_model: HashMap<String, Vec<String>> = HashMap::new();
        {
            let mut models: Vec<&str> = summaries.iter().map(|s| s.model_id.as_str()).collect();
            models.sort_unstable();
            models.dedup();
            for model in models {
                match select_judges(model, &cx.config.judges, cx.config.min_judges) {
                    Ok(judges) => {
                        judges_by_model.insert(model.to_string(), judges);
                    }
                    Err(err) => {
                        tally
                            .lock()
                            .await
                            .record(model, &LlmError::Unknown(err.to_string()));
                    }
                }
            }
        }

        let existing_pointwise: HashSet<(String, String)> = cx
            .store
            .get_evaluation_results(&cx.run.id, Some(EvalKind::Judge))?
            .into_iter()
            .filter_map(|r| match r.payload {
                EvalPayload::Judge(outcome) => Some((r.summary_id, outcome.judge_model)),
                _ => None,
            })
            .collect();

        // judge id → summaries it still owes a verdict on.
        let mut pointwise_pending: HashMap<String, Vec<&GeneratedSummary>> = HashMap::new();
        let mut pointwise_done = 0u64;
        let mut pointwise_total = 0u64;
        for summary in &summaries {
            let Some(judges) = judges_by_model.get(&summary.model_id) else {
                continue;
            };
            for judge in judges {
                pointwise_total += 1;
                if existing_pointwise.contains(&(summary.id.clone(), judge.clone())) {
                    pointwise_done += 1;
                } else {
                    pointwise_pending
                        .entry(judge.clone())
                        .or_default()
                        .push(summary);
                }
            }
        }

        // ── Pairwise planning ─────────────────────────────────────────
        let mut pair_work: Vec<(PairTask, String)> = Vec::new();
        let mut pairwise_total = 0u64;
        let mut pairwise_done = 0u64;
        let existing_pairwise: HashSet<(String, String, String, String, bool)> = cx
            .store
            .get_pairwise_results(&cx.run.id)?
            .into_iter()
            .map(|r| {
                (
                    r.code_unit_id,
                    r.model_a,
                    r.model_b,
                    r.judge_model,
                    r.position_swapped,
                )
            })
            .collect();

        if cx.config.evaluation.judge.pairwise {
            let mut models: Vec<String> = summaries.iter().map(|s| s.model_id.clone()).collect();
            models.sort();
            models.dedup();

            let mut by_model_unit: HashMap<(&str, &str), &GeneratedSummary> = HashMap::new();
            for summary in &summaries {
                by_model_unit.insert(
                    (summary.model_id.as_str(), summary.code_unit_id.as_str()),
                    summary,
                );
            }

            let mut eligible: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
            for (i, a) in models.iter().enumerate() {
                for b in models.iter().skip(i + 1) {
                    let shared: Vec<String> = units
                        .iter()
                        .filter(|u| {
                            by_model_unit.contains_key(&(a.as_str(), u.id.as_str()))
                                && by_model_unit.contains_key(&(b.as_str(), u.id.as_str()))
                        })
                        .map(|u| u.id.clone())
                        .collect();
                    if !shared.is_empty() {
                        eligible.insert((a.clone(), b.clone()), shared);
                    }
                }
            }

            let tasks = plan_pairwise_tasks(
                &eligible,
                cx.config.evaluation.judge.max_comparisons_per_judge,
            );
            for task in tasks {
                let eligible_judges: Vec<String> = cx
                    .config
                    .judges
                    .iter()
                    .filter(|j| {
                        let family = family_of(j);
                        family != family_of(&task.model_a) && family != family_of(&task.model_b)
                    })
                    .cloned()
                    .collect();
                if eligible_judges.is_empty() {
                    tally.lock().await.record(
                        &format!("{} vs {}", task.model_a, task.model_b),
                        &LlmError::Unknown("no judge outside both model families".into()),
                    );
                    continue;
                }
                for judge in eligible_judges {
                    pairwise_total += 1;
                    let both_done = [false, true].iter().all(|swapped| {
                        existing_pairwise.contains(&(
                            task.code_unit_id.clone(),
                            task.model_a.clone(),
                            task.model_b.clone(),
                            judge.clone(),
                            *swapped,
                        ))
                    });
                    if both_done {
                        pairwise_done += 1;
                    } else {
                        pair_work.push((task.clone(), judge.clone()));
                    }
                }
            }
        }

        let total = pointwise_total + pairwise_total;
        cx.state.start_phase(Phase::EvalJudge, total)?;
        let completed = Arc::new(AtomicU64::new(pointwise_done + pairwise_done));
        cx.state
            .update_progress(Phase::EvalJudge, completed.load(Ordering::SeqCst), None)?;

        // ── Pointwise execution: 30-wide pool per judge, judges parallel.
        let pool = cx.config.concurrency.judge_pointwise_pool.max(1);
        let pointwise_streams = pointwise_pending.iter().map(|(judge_id, pending)| {
            let judge_id = judge_id.clone();
            let completed = completed.clone();
            let tally = tally.clone();
            let units_by_id = &units_by_id;
            async move {
                let Some(judge) = cx.clients.judge(&judge_id) else {
                    tally.lock().await.record(
                        &judge_id,
                        &LlmError::Unknown("no client registered for judge".into()),
                    );
                    return;
                };
                futures::stream::iter(pending.iter().copied())
                    .for_each_concurrent(pool, |summary| {
                        let judge = judge.clone();
                        let judge_id = judge_id.clone();
                        let completed = completed.clone();
                        let tally = tally.clone();
                        async move {
                            if cx.cancel.is_cancelled() {
                                return;
                            }
                            let Some(unit) = units_by_id.get(summary.code_unit_id.as_str())
                            else {
                                return;
                            };
                            let request = pointwise_request(unit, summary);
                            let result = async {
                                let completion = complete_with_retry(
                                    &judge,
                                    request,
                                    &RetryPolicy::default(),
                                    &cx.cancel,
                                )
                                .await?;
                                let (scores, rationale) = parse_rubric(&completion.content)?;
                                Ok::<_, LlmError>((scores, rationale, completion.usage.cost))
                            }
                            .await;
                            match result {
                                Ok((scores, rationale, cost)) => {
                                    let row = EvaluationResult::new(
                                        &cx.run.id,
                                        &summary.id,
                                        EvalPayload::Judge(JudgeOutcome {
                                            judge_model: judge_id.clone(),
                                            scores,
                                            weighted_average: scores.weighted_average(),
                                            rationale,
                                            cost,
                                        }),
                                    );
                                    if let Err(err) = cx.store.insert_evaluation_result(&row) {
                                        tally.lock().await.record(
                                            &summary.model_id,
                                            &LlmError::Unknown(err.to_string()),
                                        );
                                    }
                                }
                                Err(LlmError::Cancelled) => return,
                                Err(err) => {
                                    tally.lock().await.record(&summary.model_id, &err);
                                }
                            }
                            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = cx.state.update_progress(
                                Phase::EvalJudge,
                                done,
                                Some(&summary.id),
                            );
                            cx.report_progress(
                                Phase::EvalJudge,
                                done,
                                total,
                                Some(format!("pointwise · {}", judge_id)),
                            );
                        }
                    })
                    .await;
            }
        });
        futures::future::join_all(pointwise_streams).await;

        // ── Pairwise execution: 20-wide pool per judge, judges parallel.
        let mut work_by_judge: HashMap<String, Vec<PairTask>> = HashMap::new();
        for (task, judge) in pair_work {
            work_by_judge.entry(judge).or_default().push(task);
        }
        let pair_pool = cx.config.concurrency.judge_pairwise_pool.max(1);
        let existing_pairwise = Arc::new(existing_pairwise);
        let pairwise_streams = work_by_judge.iter().map(|(judge_id, tasks)| {
            let judge_id = judge_id.clone();
            let completed = completed.clone();
            let tally = tally.clone();
            let existing = existing_pairwise.clone();
            let units_by_id = &units_by_id;
            let summaries = &summaries;
            async move {
                let Some(judge) = cx.clients.judge(&judge_id) else {
                    tally.lock().await.record(
                        &judge_id,
                        &LlmError::Unknown("no client registered for judge".into()),
                    );
                    return;
                };
                futures::stream::iter(tasks.iter())
                    .for_each_concurrent(pair_pool, |task| {
                        let judge = judge.clone();
                        let judge_id = judge_id.clone();
                        let completed = completed.clone();
                        let tally = tally.clone();
                        let existing = existing.clone();
                        async move {
                            if cx.cancel.is_cancelled() {
                                return;
                            }
                            let outcome = run_pair_task(
                                cx, &judge, &judge_id, task, summaries, units_by_id, &existing,
                            )
                            .await;
                            if let Err(err) = outcome {
                                if matches!(err, LlmError::Cancelled) {
                                    return;
                                }
                                tally.lock().await.record(
                                    &format!("{} vs {}", task.model_a, task.model_b),
                                    &err,
                                );
                            }
                            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = cx.state.update_progress(
                                Phase::EvalJudge,
                                done,
                                Some(&task.code_unit_id),
                            );
                            cx.report_progress(
                                Phase::EvalJudge,
                                done,
                                total,
                                Some(format!("pairwise · {}", judge_id)),
                            );
                        }
                    })
                    .await;
            }
        });
        futures::future::join_all(pairwise_streams).await;

        if cx.cancel.is_cancelled() {
            bail!("judge evaluation cancelled");
        }

        let tally = Arc::try_unwrap(tally)
            .map_err(|_| anyhow::anyhow!("failure tally still shared"))?
            .into_inner();
        let attempted = completed.load(Ordering::SeqCst);
        info!(run = %cx.run.id, items = attempted, "judge evaluation complete");
        Ok(PhaseOutcome::completed(attempted).with_failures(tally.into_failures()))
    }
}

/// Issue both orderings of one pairwise task, skipping any ordering that
/// already has a row (resume after a mid-task crash).
#[allow(clippy::too_many_arguments)]
async fn run_pair_task(
    cx: &PhaseContext,
    judge: &Arc<dyn crate::clients::LlmClient>,
    judge_id: &str,
    task: &PairTask,
    summaries: &[GeneratedSummary],
    units_by_id: &HashMap<&str, &CodeUnit>,
    existing: &HashSet<(String, String, String, String, bool)>,
) -> Result<(), LlmError> {
    let unit = units_by_id
        .get(task.code_unit_id.as_str())
        .ok_or_else(|| LlmError::InvalidResponse("unknown code unit".into()))?;
    let find = |model: &str| {
        summaries
            .iter()
            .find(|s| s.model_id == model && s.code_unit_id == task.code_unit_id)
            .ok_or_else(|| LlmError::InvalidResponse(format!("no summary for {}", model)))
    };
    let summary_a = find(&task.model_a)?;
    let summary_b = find(&task.model_b)?;

    for swapped in [false, true] {
        let key = (
            task.code_unit_id.clone(),
            task.model_a.clone(),
            task.model_b.clone(),
            judge_id.to_string(),
            swapped,
        );
        if existing.contains(&key) {
            continue;
        }
        let (first, second) = if swapped {
            (&summary_b.text, &summary_a.text)
        } else {
            (&summary_a.text, &summary_b.text)
        };
        let request = pairwise_request(unit, first, second);
        let completion =
            complete_with_retry(judge, request, &RetryPolicy::default(), &cx.cancel).await?;
        let (presented, confidence, reasoning, criteria) = parse_verdict(&completion.content)?;

        let row = PairwiseResult {
            id: new_id(),
            run_id: cx.run.id.clone(),
            model_a: task.model_a.clone(),
            model_b: task.model_b.clone(),
            code_unit_id: task.code_unit_id.clone(),
            judge_model: judge_id.to_string(),
            winner: canonical_winner(presented, swapped),
            confidence,
            position_swapped: swapped,
            reasoning,
            criteria,
            cost: completion.usage.cost,
        };
        cx.store
            .insert_pairwise_results(&[row])
            .map_err(|e| LlmError::Unknown(e.to_string()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::clients::mock::{MockEmbedder, MockLlm};
    use crate::config::{BenchConfig, ModelSpec};
    use crate::store::Store;
    use crate::store::models::{CodebaseInfo, SummaryMetadata, UnitKind, UnitMetadata};
    use crate::test_support::phase_context;

    // ── Planning ──────────────────────────────────────────────────────

    fn pair(a: &str, b: &str) -> (String, String) {
        (a.to_string(), b.to_string())
    }

    #[test]
    fn test_pairwise_budget_stratification() {
        // 4 generators → 6 pairs, 600 eligible units each, cap 600
        // comparisons → 300 tasks → 50 per pair at every 12th unit.
        let models = ["m1", "m2", "m3", "m4"];
        let units: Vec<String> = (0..600).map(|i| format!("u{:03}", i)).collect();
        let mut eligible = BTreeMap::new();
        for (i, a) in models.iter().enumerate() {
            for b in models.iter().skip(i + 1) {
                eligible.insert(pair(a, b), units.clone());
            }
        }

        let tasks = plan_pairwise_tasks(&eligible, 600);
        assert_eq!(tasks.len(), 300);
        for (i, a) in models.iter().enumerate() {
            for b in models.iter().skip(i + 1) {
                let pair_tasks: Vec<&PairTask> = tasks
                    .iter()
                    .filter(|t| t.model_a == *a && t.model_b == *b)
                    .collect();
                assert_eq!(pair_tasks.len(), 50);
                assert_eq!(pair_tasks[0].code_unit_id, "u000");
                assert_eq!(pair_tasks[1].code_unit_id, "u012");
                assert_eq!(pair_tasks[49].code_unit_id, "u588");
            }
        }
    }

    #[test]
    fn test_pairwise_small_workload_untouched() {
        let mut eligible = BTreeMap::new();
        eligible.insert(pair("m1", "m2"), vec!["u1".to_string(), "u2".to_string()]);
        let tasks = plan_pairwise_tasks(&eligible, 600);
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn test_every_pair_keeps_representation() {
        // One giant pair and one tiny pair; the tiny pair still gets its
        // quota's worth of tasks.
        let mut eligible = BTreeMap::new();
        eligible.insert(
            pair("m1", "m2"),
            (0..1000).map(|i| format!("u{}", i)).collect(),
        );
        eligible.insert(pair("m1", "m3"), vec!["solo".to_string()]);
        let tasks = plan_pairwise_tasks(&eligible, 100);
        assert!(tasks.iter().any(|t| t.code_unit_id == "solo"));
    }

    // ── Aggregation ───────────────────────────────────────────────────

    fn row(a: &str, b: &str, winner: Winner, swapped: bool) -> PairwiseResult {
        PairwiseResult {
            id: new_id(),
            run_id: "r".to_string(),
            model_a: a.to_string(),
            model_b: b.to_string(),
            code_unit_id: "u".to_string(),
            judge_model: "j".to_string(),
            winner,
            confidence: JudgeConfidence::High,
            position_swapped: swapped,
            reasoning: None,
            criteria: None,
            cost: None,
        }
    }

    #[test]
    fn test_tournament_standings() {
        let rows = vec![
            row("a", "b", Winner::A, false),
            row("a", "b", Winner::A, true),
            row("a", "c", Winner::Tie, false),
            row("b", "c", Winner::B, false),
        ];
        let standings = tournament_standings(&rows);
        assert_eq!(standings["a"].wins, 2);
        assert_eq!(standings["a"].ties, 1);
        assert_eq!(standings["b"].losses, 3);
        assert_eq!(standings["c"].wins, 1);
        assert!((standings["a"].win_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_position_bias_neutrality() {
        // A judge that always prefers whichever summary is presented
        // first: on the unswapped ordering that is A, on the swapped one
        // it is B. Aggregated over both orderings the models tie.
        let rows = vec![
            row("a", "b", canonical_winner(PresentedWinner::First, false), false),
            row("a", "b", canonical_winner(PresentedWinner::First, true), true),
        ];
        let standings = tournament_standings(&rows);
        assert_eq!(standings["a"].wins, 1);
        assert_eq!(standings["b"].wins, 1);
        assert_eq!(standings["a"].win_rate(), standings["b"].win_rate());
    }

    // ── Parsing ───────────────────────────────────────────────────────

    #[test]
    fn test_parse_rubric_clamps() {
        let (scores, rationale) = parse_rubric(
            r#"{"accuracy": 7, "completeness": 0, "semantic_richness": 3.6,
                "abstraction": 2, "conciseness": 5, "rationale": "fine"}"#,
        )
        .unwrap();
        assert_eq!(scores.accuracy, 5);
        assert_eq!(scores.completeness, 1);
        assert_eq!(scores.semantic_richness, 4);
        assert_eq!(rationale, "fine");
    }

    #[test]
    fn test_parse_verdict_variants() {
        let (w, c, _, _) =
            parse_verdict(r#"{"winner": "1", "confidence": "high"}"#).unwrap();
        assert_eq!(w, PresentedWinner::First);
        assert_eq!(c, JudgeConfidence::High);

        let (w, c, _, _) = parse_verdict(r#"{"winner": 2}"#).unwrap();
        assert_eq!(w, PresentedWinner::Second);
        assert_eq!(c, JudgeConfidence::Medium);

        let (w, _, _, _) = parse_verdict(r#"{"winner": "tie"}"#).unwrap();
        assert_eq!(w, PresentedWinner::Tie);

        assert!(parse_verdict(r#"{"verdict": "good"}"#).is_err());
    }

    #[test]
    fn test_canonical_winner_mapping() {
        assert_eq!(canonical_winner(PresentedWinner::First, false), Winner::A);
        assert_eq!(canonical_winner(PresentedWinner::First, true), Winner::B);
        assert_eq!(canonical_winner(PresentedWinner::Second, false), Winner::B);
        assert_eq!(canonical_winner(PresentedWinner::Second, true), Winner::A);
        assert_eq!(canonical_winner(PresentedWinner::Tie, true), Winner::Tie);
    }

    // ── Executor ──────────────────────────────────────────────────────

    fn config() -> BenchConfig {
        BenchConfig {
            generators: vec![
                ModelSpec::new("claude-sonnet-4-5"),
                ModelSpec::new("llama-3.3-70b"),
            ],
            judges: vec!["gpt-4o".into(), "gemini-2.5-pro".into()],
            min_judges: 1,
            ..BenchConfig::default()
        }
    }

    fn seed(
        store: &Arc<Store>,
    ) -> (crate::store::models::Run, Vec<CodeUnit>) {
        let run = store
            .create_run("t", "", &config(), &CodebaseInfo::default())
            .unwrap();
        let units: Vec<CodeUnit> = (0..2)
            .map(|i| CodeUnit {
                id: new_id(),
                run_id: run.id.clone(),
                path: format!("src/f{}.rs", i),
                name: format!("func_{}", i),
                kind: UnitKind::Function,
                language: "rust".to_string(),
                content: format!("fn func_{}() {{}}", i),
                metadata: UnitMetadata::default(),
                relationships: vec![],
            })
            .collect();
        store.insert_code_units(&run.id, &units).unwrap();

        let mut summaries = Vec::new();
        for unit in &units {
            for model in ["claude-sonnet-4-5", "llama-3.3-70b"] {
                summaries.push(GeneratedSummary {
                    id: new_id(),
                    run_id: run.id.clone(),
                    code_unit_id: unit.id.clone(),
                    model_id: model.to_string(),
                    text: format!("{} on {}", model, unit.name),
                    metadata: SummaryMetadata::default(),
                });
            }
        }
        store.insert_summaries(&run.id, &summaries).unwrap();
        (run, units)
    }

    fn judge_client(id: &str) -> Arc<MockLlm> {
        MockLlm::with(id, |request, _| {
            let text = &request.messages.last().unwrap().content;
            if text.contains("Summary 1:") {
                Ok(r#"{"winner": "1", "confidence": "high", "reasoning": "tighter"}"#.to_string())
            } else {
                Ok(r#"{"accuracy": 4, "completeness": 4, "semantic_richness": 3,
                     "abstraction": 3, "conciseness": 5, "rationale": "solid"}"#
                    .to_string())
            }
        })
    }

    fn registry() -> (Arc<MockLlm>, Arc<MockLlm>, Arc<ClientRegistry>) {
        let gpt = judge_client("gpt-4o");
        let gemini = judge_client("gemini-2.5-pro");
        let mut registry = ClientRegistry::new(MockEmbedder::new(4));
        registry.register_judge(gpt.clone());
        registry.register_judge(gemini.clone());
        (gpt, gemini, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_pointwise_and_pairwise_rows_written() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, _units) = seed(&store);
        let (gpt, gemini, registry) = registry();
        let cx = phase_context(store.clone(), run.clone(), registry);

        let outcome = JudgeEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success, "failures: {:?}", outcome.failures);

        // Pointwise: 4 summaries × 2 judges (both judges are outside both
        // generator families).
        let pointwise = store
            .get_evaluation_results(&run.id, Some(EvalKind::Judge))
            .unwrap();
        assert_eq!(pointwise.len(), 8);
        for result in &pointwise {
            match &result.payload {
                EvalPayload::Judge(j) => {
                    assert!((j.weighted_average - 3.75).abs() < 1e-9);
                    assert!(!j.rationale.is_empty());
                }
                other => panic!("unexpected payload {:?}", other),
            }
        }

        // Pairwise: 1 pair × 2 units × 2 judges × 2 orderings.
        let pairwise = store.get_pairwise_results(&run.id).unwrap();
        assert_eq!(pairwise.len(), 8);
        assert_eq!(pairwise.iter().filter(|r| r.position_swapped).count(), 4);
        // A first-presented-wins judge maps to A on the plain ordering and
        // B on the swapped one.
        for row in &pairwise {
            if row.position_swapped {
                assert_eq!(row.winner, Winner::B);
            } else {
                assert_eq!(row.winner, Winner::A);
            }
        }
        assert!(gpt.call_count() > 0);
        assert!(gemini.call_count() > 0);

        let progress = store
            .get_phase_progress(&run.id, Phase::EvalJudge)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, progress.total);
    }

    #[tokio::test]
    async fn test_resume_issues_only_missing_calls() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, _units) = seed(&store);
        let (gpt, gemini, registry) = registry();

        let cx = phase_context(store.clone(), run.clone(), registry.clone());
        JudgeEvaluator::new().execute(&cx).await.unwrap();
        let calls_after_first = gpt.call_count() + gemini.call_count();
        let rows_after_first = store.get_pairwise_results(&run.id).unwrap().len()
            + store
                .get_evaluation_results(&run.id, Some(EvalKind::Judge))
                .unwrap()
                .len();

        let cx = phase_context(store.clone(), run.clone(), registry);
        let outcome = JudgeEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(gpt.call_count() + gemini.call_count(), calls_after_first);
        let rows_after_second = store.get_pairwise_results(&run.id).unwrap().len()
            + store
                .get_evaluation_results(&run.id, Some(EvalKind::Judge))
                .unwrap()
                .len();
        assert_eq!(rows_after_first, rows_after_second);
    }

    #[tokio::test]
    async fn test_invalid_judge_response_is_per_item_failure() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let (run, _units) = seed(&store);

        let broken = MockLlm::fixed("gpt-4o", "I refuse to answer in JSON");
        let working = judge_client("gemini-2.5-pro");
        let mut reg = ClientRegistry::new(MockEmbedder::new(4));
        reg.register_judge(broken);
        reg.register_judge(working);
        let cx = phase_context(store.clone(), run.clone(), Arc::new(reg));

        let outcome = JudgeEvaluator::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert!(!outcome.failures.is_empty());

        // The working judge's rows all landed.
        let pointwise = store
            .get_evaluation_results(&run.id, Some(EvalKind::Judge))
            .unwrap();
        assert_eq!(pointwise.len(), 4);
        // Progress still reached the total: failures count as attempted.
        let progress = store
            .get_phase_progress(&run.id, Phase::EvalJudge)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, progress.total);
    }
}
