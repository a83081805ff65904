//! Phase orchestration: executor registry, resume-aware phase walk, and
//! pause/abort propagation.
//!
//! The orchestrator owns the client registry and embedding cache for the
//! lifetime of a run and hands both to each phase executor. Phases run
//! strictly sequentially; fan-out happens inside an executor. Progress
//! events are forwarded verbatim over an mpsc channel for whatever
//! front-end cares to render them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clients::ClientRegistry;
use crate::config::BenchConfig;
use crate::index::EmbeddingCache;
use crate::phase::Phase;
use crate::statemachine::StateMachine;
use crate::store::Store;
use crate::store::models::{Run, RunStatus};

/// Per-model failure tally carried in a phase outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhaseFailure {
    pub model: String,
    pub count: u32,
    pub error: String,
}

/// What a phase executor reports back.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutcome {
    pub success: bool,
    pub items_processed: u64,
    pub skip_reason: Option<String>,
    pub failures: Vec<PhaseFailure>,
}

impl PhaseOutcome {
    pub fn completed(items_processed: u64) -> Self {
        Self {
            success: true,
            items_processed,
            skip_reason: None,
            failures: Vec::new(),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: true,
            items_processed: 0,
            skip_reason: Some(reason.into()),
            failures: Vec::new(),
        }
    }

    pub fn with_failures(mut self, failures: Vec<PhaseFailure>) -> Self {
        self.failures = failures;
        self
    }
}

/// Events emitted while a run executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
    },
    PhaseStarted {
        phase: String,
    },
    PhaseProgress {
        phase: String,
        completed: u64,
        total: u64,
        detail: Option<String>,
    },
    PhaseCompleted {
        phase: String,
        items_processed: u64,
        skipped: bool,
    },
    PhaseFailed {
        phase: String,
        error: String,
    },
    RunFinished {
        run_id: String,
        status: String,
    },
}

/// Everything an executor needs for one phase of one run.
pub struct PhaseContext {
    pub store: Arc<Store>,
    pub run: Run,
    pub config: BenchConfig,
    pub state: Arc<StateMachine>,
    pub clients: Arc<ClientRegistry>,
    /// Shared across phases so pre-embedded content is never paid twice.
    pub cache: Arc<EmbeddingCache>,
    pub cancel: CancellationToken,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl PhaseContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Arc<Store>,
        run: Run,
        config: BenchConfig,
        state: Arc<StateMachine>,
        clients: Arc<ClientRegistry>,
        cache: Arc<EmbeddingCache>,
        cancel: CancellationToken,
        progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    ) -> Self {
        Self {
            store,
            run,
            config,
            state,
            clients,
            cache,
            cancel,
            progress_tx,
        }
    }

    /// Forward a progress callback. Events are best-effort: a full or
    /// closed channel never blocks a phase.
    pub fn report_progress(
        &self,
        phase: Phase,
        completed: u64,
        total: u64,
        detail: Option<String>,
    ) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(ProgressEvent::PhaseProgress {
                phase: phase.as_str().to_string(),
                completed,
                total,
                detail,
            });
        }
    }
}

/// One pipeline phase. Executors fan out their own work; the orchestrator
/// only sequences them and reacts to the outcome.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    fn phase(&self) -> Phase;

    async fn execute(&self, cx: &PhaseContext) -> Result<PhaseOutcome>;
}

pub struct Orchestrator {
    store: Arc<Store>,
    clients: Arc<ClientRegistry>,
    cache: Arc<EmbeddingCache>,
    executors: HashMap<Phase, Box<dyn PhaseExecutor>>,
    progress_tx: Option<mpsc::Sender<ProgressEvent>>,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(store: Arc<Store>, clients: Arc<ClientRegistry>) -> Self {
        Self {
            store,
            clients,
            cache: Arc::new(EmbeddingCache::new()),
            executors: HashMap::new(),
            progress_tx: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_event_channel(mut self, tx: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    pub fn register(&mut self, executor: Box<dyn PhaseExecutor>) {
        self.executors.insert(executor.phase(), executor);
    }

    /// Token that pauses the run when cancelled. Cancelling mid-phase
    /// stops in-flight work; the persisted cursor resumes it later.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.try_send(event);
        }
    }

    /// Execute (or resume) a run to completion, pause, or failure.
    pub async fn run(&self, run_id: &str) -> Result<Run> {
        let run = self.store.get_run(run_id).context("Failed to load run")?;
        if run.status.is_terminal() {
            bail!("run {} is already {}", run_id, run.status.as_str());
        }
        run.config
            .validate()
            .context("Run configuration is invalid")?;

        let state = Arc::new(StateMachine::new(self.store.clone(), run_id));
        state.set_run_status(RunStatus::Running, None)?;
        self.emit(ProgressEvent::RunStarted {
            run_id: run_id.to_string(),
        });
        info!(run = run_id, "run started");

        for phase in Phase::ORDER {
            let Some(executor) = self.executors.get(&phase) else {
                continue;
            };
            if let Some(progress) = self.store.get_phase_progress(run_id, phase)? {
                if progress.is_complete() {
                    info!(run = run_id, phase = %phase, "phase already complete, skipping");
                    continue;
                }
            }
            if self.cancel.is_cancelled() {
                return self.pause(&state, run_id).await;
            }

            self.emit(ProgressEvent::PhaseStarted {
                phase: phase.as_str().to_string(),
            });
            info!(run = run_id, phase = %phase, "phase started");

            let cx = PhaseContext {
                store: self.store.clone(),
                run: self.store.get_run(run_id)?,
                config: run.config.clone(),
                state: state.clone(),
                clients: self.clients.clone(),
                cache: self.cache.clone(),
                cancel: self.cancel.child_token(),
                progress_tx: self.progress_tx.clone(),
            };

            match executor.execute(&cx).await {
                Ok(outcome) if outcome.success => {
                    for failure in &outcome.failures {
                        warn!(
                            run = run_id,
                            phase = %phase,
                            model = %failure.model,
                            count = failure.count,
                            error = %failure.error,
                            "per-item failures in phase"
                        );
                    }
                    state.complete_phase(phase, outcome.skip_reason.as_deref())?;
                    self.emit(ProgressEvent::PhaseCompleted {
                        phase: phase.as_str().to_string(),
                        items_processed: outcome.items_processed,
                        skipped: outcome.skip_reason.is_some(),
                    });
                }
                Ok(outcome) => {
                    if self.cancel.is_cancelled() {
                        return self.pause(&state, run_id).await;
                    }
                    let error = summarize_failures(&outcome.failures);
                    return self.fail(&state, run_id, phase, &error).await;
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return self.pause(&state, run_id).await;
                    }
                    return self.fail(&state, run_id, phase, &format!("{:#}", err)).await;
                }
            }
        }

        let run = state.set_run_status(RunStatus::Completed, None)?;
        self.emit(ProgressEvent::RunFinished {
            run_id: run_id.to_string(),
            status: run.status.as_str().to_string(),
        });
        info!(run = run_id, "run completed");
        Ok(run)
    }

    async fn pause(&self, state: &StateMachine, run_id: &str) -> Result<Run> {
        let run = state.set_run_status(RunStatus::Paused, None)?;
        self.emit(ProgressEvent::RunFinished {
            run_id: run_id.to_string(),
            status: run.status.as_str().to_string(),
        });
        info!(run = run_id, "run paused");
        Ok(run)
    }

    async fn fail(
        &self,
        state: &StateMachine,
        run_id: &str,
        phase: Phase,
        error: &str,
    ) -> Result<Run> {
        self.store.set_phase_error(run_id, phase, error)?;
        let run = state.set_run_status(RunStatus::Failed, Some(error))?;
        self.emit(ProgressEvent::PhaseFailed {
            phase: phase.as_str().to_string(),
            error: error.to_string(),
        });
        self.emit(ProgressEvent::RunFinished {
            run_id: run_id.to_string(),
            status: run.status.as_str().to_string(),
        });
        warn!(run = run_id, phase = %phase, error, "run failed");
        Ok(run)
    }
}

fn summarize_failures(failures: &[PhaseFailure]) -> String {
    if failures.is_empty() {
        return "phase reported failure without details".to_string();
    }
    failures
        .iter()
        .map(|f| format!("{}: {} ({} items)", f.model, f.error, f.count))
        .collect::<Vec<_>>()
        .join("; ")
}
