//! Durable phase state machine for a single run.
//!
//! All phase-progress writes for a run go through this type, which
//! validates transitions against [`Phase::ORDER`] and the run status
//! graph before touching the store. Progress counters are monotone; a
//! phase completes only when its counter reaches the total or the phase
//! was explicitly skipped.

use std::sync::Arc;

use tracing::debug;

use crate::errors::PhaseError;
use crate::phase::Phase;
use crate::store::Store;
use crate::store::models::{PhaseProgress, Run, RunStatus};

pub struct StateMachine {
    store: Arc<Store>,
    run_id: String,
}

impl StateMachine {
    pub fn new(store: Arc<Store>, run_id: &str) -> Self {
        Self {
            store,
            run_id: run_id.to_string(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Enter a phase: validates the transition, sets the run's current
    /// phase, and writes (or refreshes, on resume) the progress row.
    pub fn start_phase(&self, phase: Phase, total: u64) -> Result<(), PhaseError> {
        let run = self.store.get_run(&self.run_id)?;

        if run.status.is_terminal() {
            return Err(PhaseError::InvalidStatusTransition {
                from: run.status.as_str().to_string(),
                to: RunStatus::Running.as_str().to_string(),
            });
        }
        if let Some(progress) = self.store.get_phase_progress(&self.run_id, phase)? {
            if progress.is_complete() {
                return Err(PhaseError::InvalidPhaseTransition {
                    from: run.current_phase.map(|p| p.as_str().to_string()),
                    to: phase.as_str().to_string(),
                });
            }
        }
        if !phase.is_valid_transition(run.current_phase) {
            return Err(PhaseError::InvalidPhaseTransition {
                from: run.current_phase.map(|p| p.as_str().to_string()),
                to: phase.as_str().to_string(),
            });
        }

        debug!(run = %self.run_id, phase = %phase, total, "starting phase");
        self.store
            .update_run_status(&self.run_id, RunStatus::Running, Some(phase), None)?;
        self.store.start_phase(&self.run_id, phase, total)?;
        Ok(())
    }

    /// Advance the completed counter; it never regresses.
    pub fn update_progress(
        &self,
        phase: Phase,
        completed: u64,
        last_processed_id: Option<&str>,
    ) -> Result<(), PhaseError> {
        self.store
            .update_phase_progress(&self.run_id, phase, completed, last_processed_id)?;
        Ok(())
    }

    /// Finish a phase. Requires the counter to have reached the total
    /// unless the phase was skipped, in which case the reason is recorded
    /// on the progress row.
    pub fn complete_phase(
        &self,
        phase: Phase,
        skip_reason: Option<&str>,
    ) -> Result<(), PhaseError> {
        let progress = match self.store.get_phase_progress(&self.run_id, phase)? {
            Some(p) => p,
            None => {
                // A skipped phase may never have been entered; give it an
                // empty progress row so the resume cursor sees it done.
                self.store.start_phase(&self.run_id, phase, 0)?;
                self.store
                    .get_phase_progress(&self.run_id, phase)?
                    .ok_or(PhaseError::IncompleteProgress {
                        phase: phase.as_str().to_string(),
                        completed: 0,
                        total: 0,
                    })?
            }
        };

        match skip_reason {
            Some(reason) => {
                self.store
                    .set_phase_error(&self.run_id, phase, &format!("skipped: {}", reason))?;
            }
            None if progress.completed < progress.total => {
                return Err(PhaseError::IncompleteProgress {
                    phase: phase.as_str().to_string(),
                    completed: progress.completed,
                    total: progress.total,
                });
            }
            None => {}
        }

        debug!(run = %self.run_id, phase = %phase, "phase complete");
        self.store.complete_phase(&self.run_id, phase)?;
        Ok(())
    }

    pub fn phase_progress(&self, phase: Phase) -> Result<Option<PhaseProgress>, PhaseError> {
        Ok(self.store.get_phase_progress(&self.run_id, phase)?)
    }

    /// Change the run status, enforcing the transition graph.
    pub fn set_run_status(
        &self,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<Run, PhaseError> {
        let run = self.store.get_run(&self.run_id)?;
        if !run.status.can_transition_to(status) {
            return Err(PhaseError::InvalidStatusTransition {
                from: run.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        Ok(self
            .store
            .update_run_status(&self.run_id, status, None, error)?)
    }

    /// The first phase in dependency order that has not completed.
    pub fn first_incomplete_phase(&self) -> Result<Option<Phase>, PhaseError> {
        for phase in Phase::ORDER {
            match self.store.get_phase_progress(&self.run_id, phase)? {
                Some(progress) if progress.is_complete() => continue,
                _ => return Ok(Some(phase)),
            }
        }
        Ok(None)
    }
}
