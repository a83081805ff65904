//! Generation phase: one summary per `(code unit, generator model)`.
//!
//! Each model gets its own bounded worker pool; models run in parallel.
//! The summary table's insert-or-replace key makes the phase idempotent,
//! so a resumed run only issues calls for missing pairs. The progress
//! counter counts attempted items; a failed item is recorded in the
//! failure tally and retried on the next resume because no row exists
//! for it.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use anyhow::{Result, bail};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::info;

use crate::clients::retry::{RetryPolicy, complete_with_retry};
use crate::clients::{ChatMessage, CompletionRequest};
use crate::config::ModelSpec;
use crate::orchestrator::{PhaseContext, PhaseExecutor, PhaseOutcome};
use crate::phase::Phase;
use crate::store::models::{CodeUnit, GeneratedSummary, SummaryMetadata, new_id};

pub struct GenerationExecutor;

impl GenerationExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GenerationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

fn summarize_request(spec: &ModelSpec, unit: &CodeUnit) -> CompletionRequest {
    CompletionRequest::new(vec![
        ChatMessage::system(
            "You are an expert code reader. Summarize the given code unit in two or three \
             sentences: what it does, its key inputs and outputs, and any notable side \
             effects. Respond with the summary only.",
        ),
        ChatMessage::user(format!(
            "Language: {}\nPath: {}\nKind: {}\nName: {}\n\n```\n{}\n```",
            unit.language,
            unit.path,
            unit.kind.as_str(),
            unit.name,
            unit.content
        )),
    ])
    .with_temperature(spec.temperature)
    .with_max_tokens(spec.max_tokens)
}

#[async_trait]
impl PhaseExecutor for GenerationExecutor {
    fn phase(&self) -> Phase {
        Phase::Generation
    }

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome> {
        let units = cx.store.get_code_units(&cx.run.id)?;
        if units.is_empty() {
            return Ok(PhaseOutcome::skipped("no code units extracted"));
        }

        // Fail fast on configuration holes before spending any tokens.
        for spec in &cx.config.generators {
            if cx.clients.generator(&spec.id).is_none() {
                bail!("no client registered for generator {}", spec.id);
            }
        }

        let existing: HashSet<(String, String)> = cx
            .store
            .get_summaries(&cx.run.id, None)?
            .into_iter()
            .map(|s| (s.code_unit_id, s.model_id))
            .collect();

        let total = (units.len() * cx.config.generators.len()) as u64;
        cx.state.start_phase(Phase::Generation, total)?;

        let completed = Arc::new(AtomicU64::new(existing.len() as u64));
        cx.state
            .update_progress(Phase::Generation, completed.load(Ordering::SeqCst), None)?;

        let tally = Arc::new(Mutex::new(super::FailureTally::new()));
        let units = Arc::new(units);
        let pool_width = cx.config.concurrency.generation_pool.max(1);

        let model_streams = cx.config.generators.iter().map(|spec| {
            let spec = spec.clone();
            let units = units.clone();
            let existing = &existing;
            let completed = completed.clone();
            let tally = tally.clone();
            async move {
                let Some(client) = cx.clients.generator(&spec.id) else {
                    return;
                };
                let pending: Vec<&CodeUnit> = units
                    .iter()
                    .filter(|u| !existing.contains(&(u.id.clone(), spec.id.clone())))
                    .collect();

                futures::stream::iter(pending)
                    .for_each_concurrent(pool_width, |unit| {
                        let spec = spec.clone();
                        let client = client.clone();
                        let completed = completed.clone();
                        let tally = tally.clone();
                        async move {
                            if cx.cancel.is_cancelled() {
                                return;
                            }
                            let start = Instant::now();
                            let request = summarize_request(&spec, unit);
                            match complete_with_retry(
                                &client,
                                request,
                                &RetryPolicy::default(),
                                &cx.cancel,
                            )
                            .await
                            {
                                Ok(completion) => {
                                    let summary = GeneratedSummary {
                                        id: new_id(),
                                        run_id: cx.run.id.clone(),
                                        code_unit_id: unit.id.clone(),
                                        model_id: spec.id.clone(),
                                        text: completion.content,
                                        metadata: SummaryMetadata {
                                            latency_ms: start.elapsed().as_millis() as u64,
                                            cost: completion.usage.cost.unwrap_or(0.0),
                                            input_tokens: completion.usage.input_tokens,
                                            output_tokens: completion.usage.output_tokens,
                                            refinement_round: None,
                                        },
                                    };
                                    if let Err(err) =
                                        cx.store.insert_summaries(&cx.run.id, &[summary])
                                    {
                                        tally.lock().await.record(
                                            &spec.id,
                                            &crate::errors::LlmError::Unknown(err.to_string()),
                                        );
                                    }
                                }
                                Err(crate::errors::LlmError::Cancelled) => return,
                                Err(err) => {
                                    tally.lock().await.record(&spec.id, &err);
                                }
                            }
                            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                            let _ = cx.state.update_progress(
                                Phase::Generation,
                                done,
                                Some(&unit.id),
                            );
                            cx.report_progress(
                                Phase::Generation,
                                done,
                                total,
                                Some(format!("{} · {}", spec.id, unit.name)),
                            );
                        }
                    })
                    .await;
            }
        });
        futures::future::join_all(model_streams).await;

        if cx.cancel.is_cancelled() {
            bail!("generation cancelled");
        }

        let tally = Arc::try_unwrap(tally)
            .map_err(|_| anyhow::anyhow!("failure tally still shared"))?
            .into_inner();
        let failed = tally.total();
        let attempted = completed.load(Ordering::SeqCst);

        info!(
            run = %cx.run.id,
            generated = attempted - failed,
            failed,
            "generation complete"
        );
        Ok(PhaseOutcome::completed(attempted).with_failures(tally.into_failures()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::ClientRegistry;
    use crate::clients::mock::{MockEmbedder, MockLlm};
    use crate::config::BenchConfig;
    use crate::errors::LlmError;
    use crate::store::Store;
    use crate::store::models::{CodebaseInfo, UnitKind, UnitMetadata};
    use crate::test_support::phase_context;

    fn config() -> BenchConfig {
        BenchConfig {
            generators: vec![ModelSpec::new("model-a"), ModelSpec::new("model-b")],
            judges: vec!["gpt-4o".into()],
            ..BenchConfig::default()
        }
    }

    fn unit(run_id: &str, path: &str, name: &str) -> CodeUnit {
        CodeUnit {
            id: new_id(),
            run_id: run_id.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            kind: UnitKind::Function,
            language: "rust".to_string(),
            content: format!("fn {}() {{}}", name),
            metadata: UnitMetadata::default(),
            relationships: vec![],
        }
    }

    fn setup(
        model_a: Arc<MockLlm>,
        model_b: Arc<MockLlm>,
    ) -> (Arc<Store>, crate::store::models::Run, Arc<ClientRegistry>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = store
            .create_run("t", "", &config(), &CodebaseInfo::default())
            .unwrap();
        let units = vec![
            unit(&run.id, "src/a.rs", "alpha"),
            unit(&run.id, "src/b.rs", "beta"),
        ];
        store.insert_code_units(&run.id, &units).unwrap();

        let mut registry = ClientRegistry::new(MockEmbedder::new(4));
        registry.register_generator(model_a);
        registry.register_generator(model_b);
        (store, run, Arc::new(registry))
    }

    #[tokio::test]
    async fn test_generates_one_summary_per_pair() {
        let model_a = MockLlm::fixed("model-a", "summary from a");
        let model_b = MockLlm::fixed("model-b", "summary from b");
        let (store, run, registry) = setup(model_a.clone(), model_b.clone());
        let cx = phase_context(store.clone(), run.clone(), registry);

        let outcome = GenerationExecutor::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.items_processed, 4);
        assert!(outcome.failures.is_empty());

        let summaries = store.get_summaries(&run.id, None).unwrap();
        assert_eq!(summaries.len(), 4);
        assert_eq!(model_a.call_count(), 2);
        assert_eq!(model_b.call_count(), 2);

        let progress = store
            .get_phase_progress(&run.id, Phase::Generation)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.total, 4);

        // Latency and usage land in the summary metadata.
        assert!(summaries.iter().all(|s| s.metadata.output_tokens > 0));
    }

    #[tokio::test]
    async fn test_resume_skips_already_generated_pairs() {
        let model_a = MockLlm::fixed("model-a", "summary from a");
        let model_b = MockLlm::fixed("model-b", "summary from b");
        let (store, run, registry) = setup(model_a.clone(), model_b.clone());

        // First pass.
        let cx = phase_context(store.clone(), run.clone(), registry.clone());
        GenerationExecutor::new().execute(&cx).await.unwrap();
        assert_eq!(model_a.call_count(), 2);

        // Resume: nothing is missing, so no further calls are issued.
        let cx = phase_context(store.clone(), run.clone(), registry);
        let outcome = GenerationExecutor::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(model_a.call_count(), 2);
        assert_eq!(model_b.call_count(), 2);
        assert_eq!(store.get_summaries(&run.id, None).unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_per_item_failures_do_not_abort_phase() {
        let model_a = MockLlm::fixed("model-a", "summary from a");
        let model_b = MockLlm::with("model-b", |_, _| Err(LlmError::MaxTokens));
        let (store, run, registry) = setup(model_a, model_b);
        let cx = phase_context(store.clone(), run.clone(), registry);

        let outcome = GenerationExecutor::new().execute(&cx).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].model, "model-b");
        assert_eq!(outcome.failures[0].count, 2);

        // Only model-a's summaries were written; the counter still covers
        // every attempted item so the phase can complete.
        assert_eq!(store.get_summaries(&run.id, None).unwrap().len(), 2);
        let progress = store
            .get_phase_progress(&run.id, Phase::Generation)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, 4);
    }

    #[tokio::test]
    async fn test_missing_client_fails_fast() {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let run = store
            .create_run("t", "", &config(), &CodebaseInfo::default())
            .unwrap();
        store
            .insert_code_units(&run.id, &[unit(&run.id, "src/a.rs", "alpha")])
            .unwrap();
        // Registry lacks model-b.
        let mut registry = ClientRegistry::new(MockEmbedder::new(4));
        registry.register_generator(MockLlm::fixed("model-a", "s"));
        let cx = phase_context(store, run, Arc::new(registry));

        let err = GenerationExecutor::new().execute(&cx).await.unwrap_err();
        assert!(err.to_string().contains("model-b"));
    }
}
