//! Durable SQLite-backed store for runs, code units, summaries, and
//! evaluation rows.
//!
//! Every batch insert is one transaction; foreign keys are enforced with
//! cascade deletes from `runs`; JSON blob columns that fail to parse
//! surface as [`StoreError::CorruptedData`] carrying the offending row id.

pub mod models;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::aggregate::NormalizedScores;
use crate::errors::StoreError;
use crate::phase::Phase;
use models::*;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (or create) a database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    /// In-memory database, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init()?;
        Ok(store)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn init(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS runs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                config_blob TEXT NOT NULL,
                codebase_info_blob TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending','running','completed','failed','paused')),
                current_phase TEXT,
                started_at TEXT,
                completed_at TEXT,
                paused_at TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS code_units (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                path TEXT NOT NULL,
                name TEXT NOT NULL,
                kind TEXT NOT NULL
                    CHECK (kind IN ('function','class','method','file','module')),
                language TEXT NOT NULL,
                content TEXT NOT NULL,
                metadata_blob TEXT NOT NULL DEFAULT '{}',
                relationships_blob TEXT NOT NULL DEFAULT '[]',
                UNIQUE(run_id, path, name)
            );

            CREATE TABLE IF NOT EXISTS generated_summaries (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                code_unit_id TEXT NOT NULL REFERENCES code_units(id) ON DELETE CASCADE,
                model_id TEXT NOT NULL,
                text TEXT NOT NULL,
                metadata_blob TEXT NOT NULL DEFAULT '{}',
                UNIQUE(run_id, code_unit_id, model_id)
            );

            CREATE TABLE IF NOT EXISTS evaluation_results (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                summary_id TEXT NOT NULL REFERENCES generated_summaries(id) ON DELETE CASCADE,
                kind TEXT NOT NULL
                    CHECK (kind IN ('judge','contrastive','retrieval','downstream','iterative','self')),
                payload_blob TEXT NOT NULL,
                evaluated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS pairwise_results (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                model_a TEXT NOT NULL,
                model_b TEXT NOT NULL,
                code_unit_id TEXT NOT NULL REFERENCES code_units(id) ON DELETE CASCADE,
                judge_model TEXT NOT NULL,
                winner TEXT NOT NULL CHECK (winner IN ('a','b','tie')),
                confidence TEXT NOT NULL CHECK (confidence IN ('high','medium','low')),
                position_swapped INTEGER NOT NULL DEFAULT 0,
                reasoning TEXT,
                criteria_blob TEXT,
                cost REAL
            );

            CREATE TABLE IF NOT EXISTS generated_queries (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                code_unit_id TEXT NOT NULL REFERENCES code_units(id) ON DELETE CASCADE,
                query_type TEXT NOT NULL,
                text TEXT NOT NULL,
                should_find INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS distractor_sets (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                target_code_unit_id TEXT NOT NULL REFERENCES code_units(id) ON DELETE CASCADE,
                distractor_ids_blob TEXT NOT NULL,
                difficulty TEXT NOT NULL CHECK (difficulty IN ('easy','medium','hard'))
            );

            CREATE TABLE IF NOT EXISTS aggregated_scores (
                id TEXT PRIMARY KEY,
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                model_id TEXT NOT NULL,
                scores_blob TEXT NOT NULL,
                UNIQUE(run_id, model_id)
            );

            CREATE TABLE IF NOT EXISTS phase_progress (
                run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
                phase TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                items_total INTEGER NOT NULL DEFAULT 0,
                items_completed INTEGER NOT NULL DEFAULT 0,
                last_processed_id TEXT,
                error TEXT,
                PRIMARY KEY (run_id, phase)
            );

            CREATE INDEX IF NOT EXISTS idx_code_units_run ON code_units(run_id);
            CREATE INDEX IF NOT EXISTS idx_code_units_kind ON code_units(kind);
            CREATE INDEX IF NOT EXISTS idx_code_units_language ON code_units(language);
            CREATE INDEX IF NOT EXISTS idx_code_units_path ON code_units(path);
            CREATE INDEX IF NOT EXISTS idx_summaries_run ON generated_summaries(run_id);
            CREATE INDEX IF NOT EXISTS idx_results_run ON evaluation_results(run_id);
            CREATE INDEX IF NOT EXISTS idx_results_summary ON evaluation_results(summary_id);
            CREATE INDEX IF NOT EXISTS idx_results_kind ON evaluation_results(kind);
            CREATE INDEX IF NOT EXISTS idx_pairwise_run ON pairwise_results(run_id);
            CREATE INDEX IF NOT EXISTS idx_queries_run ON generated_queries(run_id);
            CREATE INDEX IF NOT EXISTS idx_distractors_run ON distractor_sets(run_id);
            ",
        )?;
        Ok(())
    }

    /// Run `f` inside a single transaction, rolling back on failure.
    pub fn transaction<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ── Runs ──────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        name: &str,
        description: &str,
        config: &crate::config::BenchConfig,
        codebase_info: &CodebaseInfo,
    ) -> Result<Run, StoreError> {
        let id = new_id();
        let now = Utc::now();
        let config_blob = to_blob(&id, config)?;
        let codebase_blob = to_blob(&id, codebase_info)?;
        self.conn()?.execute(
            "INSERT INTO runs (id, name, description, config_blob, codebase_info_blob, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7)",
            params![
                id,
                name,
                description,
                config_blob,
                codebase_blob,
                now.to_rfc3339(),
                now.to_rfc3339()
            ],
        )?;
        self.get_run(&id)
    }

    pub fn get_run(&self, id: &str) -> Result<Run, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, name, description, config_blob, codebase_info_blob, status,
                        current_phase, started_at, completed_at, paused_at, error,
                        created_at, updated_at
                 FROM runs WHERE id = ?1",
                params![id],
                RunRow::from_row,
            )
            .optional()?;
        match row {
            Some(r) => r.into_run(),
            None => Err(StoreError::NotFound {
                entity: "run",
                id: id.to_string(),
            }),
        }
    }

    pub fn list_runs(&self, status: Option<RunStatus>) -> Result<Vec<Run>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, description, config_blob, codebase_info_blob, status,
                    current_phase, started_at, completed_at, paused_at, error,
                    created_at, updated_at
             FROM runs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![status.map(|s| s.as_str())], RunRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_run()?);
        }
        Ok(runs)
    }

    pub fn delete_run(&self, id: &str) -> Result<bool, StoreError> {
        let count = self
            .conn()?
            .execute("DELETE FROM runs WHERE id = ?1", params![id])?;
        Ok(count > 0)
    }

    /// Write a new run status. Transition validity is the state machine's
    /// responsibility; the store only maintains the timestamp columns.
    pub fn update_run_status(
        &self,
        id: &str,
        status: RunStatus,
        phase: Option<Phase>,
        error: Option<&str>,
    ) -> Result<Run, StoreError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "UPDATE runs SET
                status = ?2,
                current_phase = COALESCE(?3, current_phase),
                error = ?4,
                started_at = CASE WHEN ?2 = 'running' AND started_at IS NULL THEN ?5 ELSE started_at END,
                paused_at = CASE WHEN ?2 = 'paused' THEN ?5 ELSE paused_at END,
                completed_at = CASE WHEN ?2 IN ('completed', 'failed') THEN ?5 ELSE completed_at END,
                updated_at = ?5
             WHERE id = ?1",
            params![id, status.as_str(), phase.map(|p| p.as_str()), error, now],
        )?;
        self.get_run(id)
    }

    // ── Code units ────────────────────────────────────────────────────

    pub fn insert_code_units(&self, run_id: &str, units: &[CodeUnit]) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO code_units (id, run_id, path, name, kind, language, content, metadata_blob, relationships_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )?;
            for unit in units {
                stmt.execute(params![
                    unit.id,
                    run_id,
                    unit.path,
                    unit.name,
                    unit.kind.as_str(),
                    unit.language,
                    unit.content,
                    to_blob(&unit.id, &unit.metadata)?,
                    to_blob(&unit.id, &unit.relationships)?,
                ])?;
            }
            Ok(())
        })
    }

    pub fn get_code_units(&self, run_id: &str) -> Result<Vec<CodeUnit>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, path, name, kind, language, content, metadata_blob, relationships_blob
             FROM code_units WHERE run_id = ?1 ORDER BY path, name",
        )?;
        let rows = stmt.query_map(params![run_id], CodeUnitRow::from_row)?;
        let mut units = Vec::new();
        for row in rows {
            units.push(row?.into_unit()?);
        }
        Ok(units)
    }

    pub fn count_code_units(&self, run_id: &str) -> Result<u64, StoreError> {
        let count: i64 = self.conn()?.query_row(
            "SELECT COUNT(*) FROM code_units WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    // ── Summaries ─────────────────────────────────────────────────────

    /// Insert summaries; a conflict on `(run, code_unit, model)` replaces
    /// the text and metadata while keeping the original row id, so
    /// evaluation rows that reference the summary stay valid.
    pub fn insert_summaries(
        &self,
        run_id: &str,
        summaries: &[GeneratedSummary],
    ) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO generated_summaries (id, run_id, code_unit_id, model_id, text, metadata_blob)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(run_id, code_unit_id, model_id) DO UPDATE SET
                    text = excluded.text,
                    metadata_blob = excluded.metadata_blob",
            )?;
            for summary in summaries {
                stmt.execute(params![
                    summary.id,
                    run_id,
                    summary.code_unit_id,
                    summary.model_id,
                    summary.text,
                    to_blob(&summary.id, &summary.metadata)?,
                ])?;
            }
            Ok(())
        })
    }

    pub fn update_summary(
        &self,
        run_id: &str,
        summary_id: &str,
        text: Option<&str>,
        metadata: Option<&SummaryMetadata>,
    ) -> Result<GeneratedSummary, StoreError> {
        let metadata_blob = match metadata {
            Some(m) => Some(to_blob(summary_id, m)?),
            None => None,
        };
        self.conn()?.execute(
            "UPDATE generated_summaries SET
                text = COALESCE(?3, text),
                metadata_blob = COALESCE(?4, metadata_blob)
             WHERE run_id = ?1 AND id = ?2",
            params![run_id, summary_id, text, metadata_blob],
        )?;
        self.get_summary(summary_id)
    }

    pub fn get_summary(&self, summary_id: &str) -> Result<GeneratedSummary, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, run_id, code_unit_id, model_id, text, metadata_blob
                 FROM generated_summaries WHERE id = ?1",
                params![summary_id],
                SummaryRow::from_row,
            )
            .optional()?;
        match row {
            Some(r) => r.into_summary(),
            None => Err(StoreError::NotFound {
                entity: "summary",
                id: summary_id.to_string(),
            }),
        }
    }

    pub fn get_summaries(
        &self,
        run_id: &str,
        model_id: Option<&str>,
    ) -> Result<Vec<GeneratedSummary>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, code_unit_id, model_id, text, metadata_blob
             FROM generated_summaries
             WHERE run_id = ?1 AND (?2 IS NULL OR model_id = ?2)
             ORDER BY model_id, code_unit_id",
        )?;
        let rows = stmt.query_map(params![run_id, model_id], SummaryRow::from_row)?;
        let mut summaries = Vec::new();
        for row in rows {
            summaries.push(row?.into_summary()?);
        }
        Ok(summaries)
    }

    // ── Evaluation results ────────────────────────────────────────────

    pub fn insert_evaluation_result(&self, result: &EvaluationResult) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO evaluation_results (id, run_id, summary_id, kind, payload_blob, evaluated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                result.id,
                result.run_id,
                result.summary_id,
                result.kind().as_str(),
                to_blob(&result.id, &result.payload)?,
                result.evaluated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert a batch of evaluation rows in one transaction. Used where a
    /// unit of work (e.g. one retrieval query) produces one row per model
    /// and partial writes would break the resume key.
    pub fn insert_evaluation_results(
        &self,
        results: &[EvaluationResult],
    ) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO evaluation_results (id, run_id, summary_id, kind, payload_blob, evaluated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for result in results {
                stmt.execute(params![
                    result.id,
                    result.run_id,
                    result.summary_id,
                    result.kind().as_str(),
                    to_blob(&result.id, &result.payload)?,
                    result.evaluated_at.to_rfc3339(),
                ])?;
            }
            Ok(())
        })
    }

    pub fn get_evaluation_results(
        &self,
        run_id: &str,
        kind: Option<EvalKind>,
    ) -> Result<Vec<EvaluationResult>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, summary_id, payload_blob, evaluated_at
             FROM evaluation_results
             WHERE run_id = ?1 AND (?2 IS NULL OR kind = ?2)
             ORDER BY evaluated_at",
        )?;
        let rows = stmt.query_map(params![run_id, kind.map(|k| k.as_str())], |row| {
            Ok(ResultRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                summary_id: row.get(2)?,
                payload_blob: row.get(3)?,
                evaluated_at: row.get(4)?,
            })
        })?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_result()?);
        }
        Ok(results)
    }

    // ── Pairwise results ──────────────────────────────────────────────

    pub fn insert_pairwise_results(&self, rows: &[PairwiseResult]) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO pairwise_results
                    (id, run_id, model_a, model_b, code_unit_id, judge_model, winner,
                     confidence, position_swapped, reasoning, criteria_blob, cost)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            )?;
            for row in rows {
                let criteria_blob = match &row.criteria {
                    Some(c) => Some(to_blob(&row.id, c)?),
                    None => None,
                };
                stmt.execute(params![
                    row.id,
                    row.run_id,
                    row.model_a,
                    row.model_b,
                    row.code_unit_id,
                    row.judge_model,
                    row.winner.as_str(),
                    row.confidence.as_str(),
                    row.position_swapped,
                    row.reasoning,
                    criteria_blob,
                    row.cost,
                ])?;
            }
            Ok(())
        })
    }

    pub fn get_pairwise_results(&self, run_id: &str) -> Result<Vec<PairwiseResult>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, model_a, model_b, code_unit_id, judge_model, winner,
                    confidence, position_swapped, reasoning, criteria_blob, cost
             FROM pairwise_results WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id], PairwiseRow::from_row)?;
        let mut results = Vec::new();
        for row in rows {
            results.push(row?.into_pairwise()?);
        }
        Ok(results)
    }

    // ── Queries and distractor sets ───────────────────────────────────

    pub fn insert_queries(&self, queries: &[GeneratedQuery]) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO generated_queries (id, run_id, code_unit_id, query_type, text, should_find)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for query in queries {
                stmt.execute(params![
                    query.id,
                    query.run_id,
                    query.code_unit_id,
                    query.query_type,
                    query.text,
                    query.should_find,
                ])?;
            }
            Ok(())
        })
    }

    pub fn get_queries(&self, run_id: &str) -> Result<Vec<GeneratedQuery>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, code_unit_id, query_type, text, should_find
             FROM generated_queries WHERE run_id = ?1 ORDER BY code_unit_id, query_type",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(GeneratedQuery {
                id: row.get(0)?,
                run_id: row.get(1)?,
                code_unit_id: row.get(2)?,
                query_type: row.get(3)?,
                text: row.get(4)?,
                should_find: row.get(5)?,
            })
        })?;
        let mut queries = Vec::new();
        for row in rows {
            queries.push(row?);
        }
        Ok(queries)
    }

    pub fn insert_distractor_sets(&self, sets: &[DistractorSet]) -> Result<(), StoreError> {
        self.transaction(|tx| {
            let mut stmt = tx.prepare(
                "INSERT INTO distractor_sets (id, run_id, target_code_unit_id, distractor_ids_blob, difficulty)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for set in sets {
                stmt.execute(params![
                    set.id,
                    set.run_id,
                    set.target_code_unit_id,
                    to_blob(&set.id, &set.distractor_ids)?,
                    set.difficulty.as_str(),
                ])?;
            }
            Ok(())
        })
    }

    pub fn get_distractor_sets(&self, run_id: &str) -> Result<Vec<DistractorSet>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, target_code_unit_id, distractor_ids_blob, difficulty
             FROM distractor_sets WHERE run_id = ?1",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok(DistractorRow {
                id: row.get(0)?,
                run_id: row.get(1)?,
                target_code_unit_id: row.get(2)?,
                distractor_ids_blob: row.get(3)?,
                difficulty: row.get(4)?,
            })
        })?;
        let mut sets = Vec::new();
        for row in rows {
            sets.push(row?.into_set()?);
        }
        Ok(sets)
    }

    // ── Aggregated scores ─────────────────────────────────────────────

    pub fn save_aggregated_scores(
        &self,
        run_id: &str,
        model_id: &str,
        scores: &NormalizedScores,
    ) -> Result<(), StoreError> {
        let id = new_id();
        self.conn()?.execute(
            "INSERT INTO aggregated_scores (id, run_id, model_id, scores_blob)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(run_id, model_id) DO UPDATE SET scores_blob = excluded.scores_blob",
            params![id, run_id, model_id, to_blob(&id, scores)?],
        )?;
        Ok(())
    }

    pub fn get_aggregated_scores(
        &self,
        run_id: &str,
    ) -> Result<Vec<(String, NormalizedScores)>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, model_id, scores_blob FROM aggregated_scores
             WHERE run_id = ?1 ORDER BY model_id",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut scores = Vec::new();
        for row in rows {
            let (id, model_id, blob) = row?;
            scores.push((model_id, from_blob(&id, &blob)?));
        }
        Ok(scores)
    }

    // ── Phase progress ────────────────────────────────────────────────

    /// Start (or on resume, re-enter) a phase. The completed counter and
    /// original start time survive re-entry; only the total is refreshed.
    pub fn start_phase(&self, run_id: &str, phase: Phase, total: u64) -> Result<(), StoreError> {
        self.conn()?.execute(
            "INSERT INTO phase_progress (run_id, phase, started_at, items_total, items_completed)
             VALUES (?1, ?2, ?3, ?4, 0)
             ON CONFLICT(run_id, phase) DO UPDATE SET items_total = excluded.items_total",
            params![run_id, phase.as_str(), Utc::now().to_rfc3339(), total as i64],
        )?;
        Ok(())
    }

    /// Advance the progress counter. The counter never regresses, so
    /// late-arriving smaller values (e.g. from a racing worker) are kept
    /// at the high-water mark.
    pub fn update_phase_progress(
        &self,
        run_id: &str,
        phase: Phase,
        completed: u64,
        last_processed_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE phase_progress SET
                items_completed = MAX(items_completed, ?3),
                last_processed_id = COALESCE(?4, last_processed_id)
             WHERE run_id = ?1 AND phase = ?2",
            params![run_id, phase.as_str(), completed as i64, last_processed_id],
        )?;
        Ok(())
    }

    pub fn complete_phase(&self, run_id: &str, phase: Phase) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE phase_progress SET completed_at = ?3 WHERE run_id = ?1 AND phase = ?2",
            params![run_id, phase.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_phase_error(
        &self,
        run_id: &str,
        phase: Phase,
        error: &str,
    ) -> Result<(), StoreError> {
        self.conn()?.execute(
            "UPDATE phase_progress SET error = ?3 WHERE run_id = ?1 AND phase = ?2",
            params![run_id, phase.as_str(), error],
        )?;
        Ok(())
    }

    pub fn get_phase_progress(
        &self,
        run_id: &str,
        phase: Phase,
    ) -> Result<Option<PhaseProgress>, StoreError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT run_id, phase, started_at, completed_at, items_total, items_completed,
                        last_processed_id, error
                 FROM phase_progress WHERE run_id = ?1 AND phase = ?2",
                params![run_id, phase.as_str()],
                |row| {
                    Ok(ProgressRow {
                        run_id: row.get(0)?,
                        phase: row.get(1)?,
                        started_at: row.get(2)?,
                        completed_at: row.get(3)?,
                        items_total: row.get(4)?,
                        items_completed: row.get(5)?,
                        last_processed_id: row.get(6)?,
                        error: row.get(7)?,
                    })
                },
            )
            .optional()?;
        match row {
            Some(r) => Ok(Some(r.into_progress()?)),
            None => Ok(None),
        }
    }
}

// ── Blob helpers ──────────────────────────────────────────────────────

fn to_blob<T: serde::Serialize>(row_id: &str, value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::CorruptedData {
        row_id: row_id.to_string(),
        detail: e.to_string(),
    })
}

fn from_blob<T: serde::de::DeserializeOwned>(row_id: &str, blob: &str) -> Result<T, StoreError> {
    serde_json::from_str(blob).map_err(|e| StoreError::CorruptedData {
        row_id: row_id.to_string(),
        detail: e.to_string(),
    })
}

fn parse_timestamp(row_id: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::CorruptedData {
            row_id: row_id.to_string(),
            detail: format!("bad timestamp: {}", e),
        })
}

fn corrupted(row_id: &str, detail: String) -> StoreError {
    StoreError::CorruptedData {
        row_id: row_id.to_string(),
        detail,
    }
}

// ── Internal row structs ──────────────────────────────────────────────

/// Intermediate row for `runs` before blob and enum parsing.
struct RunRow {
    id: String,
    name: String,
    description: String,
    config_blob: String,
    codebase_info_blob: String,
    status: String,
    current_phase: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
    paused_at: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            config_blob: row.get(3)?,
            codebase_info_blob: row.get(4)?,
            status: row.get(5)?,
            current_phase: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
            paused_at: row.get(9)?,
            error: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        })
    }

    fn into_run(self) -> Result<Run, StoreError> {
        let status = RunStatus::from_str(&self.status).map_err(|e| corrupted(&self.id, e))?;
        let current_phase = match &self.current_phase {
            Some(p) => Some(Phase::from_str(p).map_err(|e| corrupted(&self.id, e.to_string()))?),
            None => None,
        };
        let parse_opt = |value: &Option<String>| -> Result<Option<DateTime<Utc>>, StoreError> {
            match value {
                Some(v) => Ok(Some(parse_timestamp(&self.id, v)?)),
                None => Ok(None),
            }
        };
        Ok(Run {
            config: from_blob(&self.id, &self.config_blob)?,
            codebase_info: from_blob(&self.id, &self.codebase_info_blob)?,
            status,
            current_phase,
            started_at: parse_opt(&self.started_at)?,
            completed_at: parse_opt(&self.completed_at)?,
            paused_at: parse_opt(&self.paused_at)?,
            created_at: parse_timestamp(&self.id, &self.created_at)?,
            updated_at: parse_timestamp(&self.id, &self.updated_at)?,
            id: self.id,
            name: self.name,
            description: self.description,
            error: self.error,
        })
    }
}

struct CodeUnitRow {
    id: String,
    run_id: String,
    path: String,
    name: String,
    kind: String,
    language: String,
    content: String,
    metadata_blob: String,
    relationships_blob: String,
}

impl CodeUnitRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            path: row.get(2)?,
            name: row.get(3)?,
            kind: row.get(4)?,
            language: row.get(5)?,
            content: row.get(6)?,
            metadata_blob: row.get(7)?,
            relationships_blob: row.get(8)?,
        })
    }

    fn into_unit(self) -> Result<CodeUnit, StoreError> {
        let kind = UnitKind::from_str(&self.kind).map_err(|e| corrupted(&self.id, e))?;
        Ok(CodeUnit {
            kind,
            metadata: from_blob(&self.id, &self.metadata_blob)?,
            relationships: from_blob(&self.id, &self.relationships_blob)?,
            id: self.id,
            run_id: self.run_id,
            path: self.path,
            name: self.name,
            language: self.language,
            content: self.content,
        })
    }
}

struct SummaryRow {
    id: String,
    run_id: String,
    code_unit_id: String,
    model_id: String,
    text: String,
    metadata_blob: String,
}

impl SummaryRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            code_unit_id: row.get(2)?,
            model_id: row.get(3)?,
            text: row.get(4)?,
            metadata_blob: row.get(5)?,
        })
    }

    fn into_summary(self) -> Result<GeneratedSummary, StoreError> {
        Ok(GeneratedSummary {
            metadata: from_blob(&self.id, &self.metadata_blob)?,
            id: self.id,
            run_id: self.run_id,
            code_unit_id: self.code_unit_id,
            model_id: self.model_id,
            text: self.text,
        })
    }
}

struct ResultRow {
    id: String,
    run_id: String,
    summary_id: String,
    payload_blob: String,
    evaluated_at: String,
}

impl ResultRow {
    fn into_result(self) -> Result<EvaluationResult, StoreError> {
        Ok(EvaluationResult {
            payload: from_blob(&self.id, &self.payload_blob)?,
            evaluated_at: parse_timestamp(&self.id, &self.evaluated_at)?,
            id: self.id,
            run_id: self.run_id,
            summary_id: self.summary_id,
        })
    }
}

struct PairwiseRow {
    id: String,
    run_id: String,
    model_a: String,
    model_b: String,
    code_unit_id: String,
    judge_model: String,
    winner: String,
    confidence: String,
    position_swapped: bool,
    reasoning: Option<String>,
    criteria_blob: Option<String>,
    cost: Option<f64>,
}

impl PairwiseRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            run_id: row.get(1)?,
            model_a: row.get(2)?,
            model_b: row.get(3)?,
            code_unit_id: row.get(4)?,
            judge_model: row.get(5)?,
            winner: row.get(6)?,
            confidence: row.get(7)?,
            position_swapped: row.get(8)?,
            reasoning: row.get(9)?,
            criteria_blob: row.get(10)?,
            cost: row.get(11)?,
        })
    }

    fn into_pairwise(self) -> Result<PairwiseResult, StoreError> {
        let winner = Winner::from_str(&self.winner).map_err(|e| corrupted(&self.id, e))?;
        let confidence =
            JudgeConfidence::from_str(&self.confidence).map_err(|e| corrupted(&self.id, e))?;
        let criteria = match &self.criteria_blob {
            Some(blob) => Some(from_blob(&self.id, blob)?),
            None => None,
        };
        Ok(PairwiseResult {
            winner,
            confidence,
            criteria,
            id: self.id,
            run_id: self.run_id,
            model_a: self.model_a,
            model_b: self.model_b,
            code_unit_id: self.code_unit_id,
            judge_model: self.judge_model,
            position_swapped: self.position_swapped,
            reasoning: self.reasoning,
            cost: self.cost,
        })
    }
}

struct DistractorRow {
    id: String,
    run_id: String,
    target_code_unit_id: String,
    distractor_ids_blob: String,
    difficulty: String,
}

impl DistractorRow {
    fn into_set(self) -> Result<DistractorSet, StoreError> {
        let difficulty =
            Difficulty::from_str(&self.difficulty).map_err(|e| corrupted(&self.id, e))?;
        Ok(DistractorSet {
            distractor_ids: from_blob(&self.id, &self.distractor_ids_blob)?,
            difficulty,
            id: self.id,
            run_id: self.run_id,
            target_code_unit_id: self.target_code_unit_id,
        })
    }
}

struct ProgressRow {
    run_id: String,
    phase: String,
    started_at: String,
    completed_at: Option<String>,
    items_total: i64,
    items_completed: i64,
    last_processed_id: Option<String>,
    error: Option<String>,
}

impl ProgressRow {
    fn into_progress(self) -> Result<PhaseProgress, StoreError> {
        let row_id = format!("{}/{}", self.run_id, self.phase);
        let phase = Phase::from_str(&self.phase).map_err(|e| corrupted(&row_id, e.to_string()))?;
        Ok(PhaseProgress {
            phase,
            started_at: parse_timestamp(&row_id, &self.started_at)?,
            completed_at: match &self.completed_at {
                Some(v) => Some(parse_timestamp(&row_id, v)?),
                None => None,
            },
            total: self.items_total as u64,
            completed: self.items_completed as u64,
            run_id: self.run_id,
            last_processed_id: self.last_processed_id,
            error: self.error,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BenchConfig, ModelSpec};

    fn test_config() -> BenchConfig {
        BenchConfig {
            generators: vec![ModelSpec::new("model-a"), ModelSpec::new("model-b")],
            judges: vec!["judge-x".into(), "judge-y".into()],
            ..BenchConfig::default()
        }
    }

    fn make_run(store: &Store) -> Run {
        store
            .create_run("bench", "test run", &test_config(), &CodebaseInfo::default())
            .unwrap()
    }

    fn make_unit(run_id: &str, path: &str, name: &str) -> CodeUnit {
        CodeUnit {
            id: new_id(),
            run_id: run_id.to_string(),
            path: path.to_string(),
            name: name.to_string(),
            kind: UnitKind::Function,
            language: "rust".to_string(),
            content: format!("fn {}() {{}}", name),
            metadata: UnitMetadata {
                start_line: 1,
                end_line: 3,
                signature: Some(format!("fn {}()", name)),
                parameters: vec![],
                doc_comment: None,
            },
            relationships: vec![],
        }
    }

    fn make_summary(run_id: &str, unit_id: &str, model: &str) -> GeneratedSummary {
        GeneratedSummary {
            id: new_id(),
            run_id: run_id.to_string(),
            code_unit_id: unit_id.to_string(),
            model_id: model.to_string(),
            text: format!("summary by {}", model),
            metadata: SummaryMetadata {
                latency_ms: 120,
                cost: 0.002,
                input_tokens: 400,
                output_tokens: 60,
                refinement_round: None,
            },
        }
    }

    #[test]
    fn test_create_and_get_run() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        assert_eq!(run.status, RunStatus::Pending);
        assert!(run.current_phase.is_none());
        assert!(run.started_at.is_none());

        let fetched = store.get_run(&run.id).unwrap();
        assert_eq!(fetched.name, "bench");
        assert_eq!(fetched.config, test_config());
    }

    #[test]
    fn test_get_run_not_found() {
        let store = Store::open_in_memory().unwrap();
        let err = store.get_run("missing").unwrap_err();
        assert!(matches!(err, StoreError::NotFound { entity: "run", .. }));
    }

    #[test]
    fn test_list_runs_filters_by_status() {
        let store = Store::open_in_memory().unwrap();
        let run1 = make_run(&store);
        let _run2 = make_run(&store);
        store
            .update_run_status(&run1.id, RunStatus::Running, Some(Phase::Extraction), None)
            .unwrap();

        assert_eq!(store.list_runs(None).unwrap().len(), 2);
        assert_eq!(store.list_runs(Some(RunStatus::Running)).unwrap().len(), 1);
        assert_eq!(store.list_runs(Some(RunStatus::Pending)).unwrap().len(), 1);
    }

    #[test]
    fn test_update_run_status_timestamps() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        let running = store
            .update_run_status(&run.id, RunStatus::Running, Some(Phase::Extraction), None)
            .unwrap();
        assert!(running.started_at.is_some());
        assert_eq!(running.current_phase, Some(Phase::Extraction));

        let paused = store
            .update_run_status(&run.id, RunStatus::Paused, None, None)
            .unwrap();
        assert!(paused.paused_at.is_some());
        // Pausing keeps the phase it was in.
        assert_eq!(paused.current_phase, Some(Phase::Extraction));

        let failed = store
            .update_run_status(&run.id, RunStatus::Failed, None, Some("boom"))
            .unwrap();
        assert!(failed.completed_at.is_some());
        assert_eq!(failed.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_code_units_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let units = vec![
            make_unit(&run.id, "src/a.rs", "alpha"),
            make_unit(&run.id, "src/b.rs", "beta"),
        ];
        store.insert_code_units(&run.id, &units).unwrap();

        let fetched = store.get_code_units(&run.id).unwrap();
        assert_eq!(fetched, units);
        assert_eq!(store.count_code_units(&run.id).unwrap(), 2);
    }

    #[test]
    fn test_code_unit_unique_per_run_path_name() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        store
            .insert_code_units(&run.id, &[make_unit(&run.id, "src/a.rs", "alpha")])
            .unwrap();
        let dup = make_unit(&run.id, "src/a.rs", "alpha");
        assert!(store.insert_code_units(&run.id, &[dup]).is_err());
    }

    #[test]
    fn test_batch_insert_is_atomic() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let good = make_unit(&run.id, "src/a.rs", "alpha");
        // Second unit collides with the first, so the whole batch must
        // roll back.
        let bad = make_unit(&run.id, "src/a.rs", "alpha");
        assert!(store.insert_code_units(&run.id, &[good, bad]).is_err());
        assert_eq!(store.count_code_units(&run.id).unwrap(), 0);
    }

    #[test]
    fn test_summary_replace_keeps_row_id() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();

        let original = make_summary(&run.id, &unit.id, "model-a");
        store.insert_summaries(&run.id, &[original.clone()]).unwrap();

        let mut replacement = make_summary(&run.id, &unit.id, "model-a");
        replacement.text = "rewritten".to_string();
        store.insert_summaries(&run.id, &[replacement]).unwrap();

        let fetched = store.get_summaries(&run.id, Some("model-a")).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].text, "rewritten");
        // Conflict resolution must preserve the original id so evaluation
        // rows keep a valid reference.
        assert_eq!(fetched[0].id, original.id);
    }

    #[test]
    fn test_update_summary_in_place() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();
        let summary = make_summary(&run.id, &unit.id, "model-a");
        store.insert_summaries(&run.id, &[summary.clone()]).unwrap();

        let mut meta = summary.metadata.clone();
        meta.refinement_round = Some(2);
        let updated = store
            .update_summary(&run.id, &summary.id, Some("refined text"), Some(&meta))
            .unwrap();
        assert_eq!(updated.text, "refined text");
        assert_eq!(updated.metadata.refinement_round, Some(2));

        // Text-only update keeps metadata.
        let updated = store
            .update_summary(&run.id, &summary.id, Some("again"), None)
            .unwrap();
        assert_eq!(updated.metadata.refinement_round, Some(2));
    }

    #[test]
    fn test_evaluation_result_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();
        let summary = make_summary(&run.id, &unit.id, "model-a");
        store.insert_summaries(&run.id, &[summary.clone()]).unwrap();

        let result = EvaluationResult::new(
            &run.id,
            &summary.id,
            EvalPayload::Judge(JudgeOutcome {
                judge_model: "judge-x".into(),
                scores: RubricScores {
                    accuracy: 4,
                    completeness: 3,
                    semantic_richness: 4,
                    abstraction: 5,
                    conciseness: 2,
                },
                weighted_average: 3.65,
                rationale: "solid".into(),
                cost: Some(0.001),
            }),
        );
        store.insert_evaluation_result(&result).unwrap();

        let all = store.get_evaluation_results(&run.id, None).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].payload, result.payload);

        let judged = store
            .get_evaluation_results(&run.id, Some(EvalKind::Judge))
            .unwrap();
        assert_eq!(judged.len(), 1);
        let retrieval = store
            .get_evaluation_results(&run.id, Some(EvalKind::Retrieval))
            .unwrap();
        assert!(retrieval.is_empty());
    }

    #[test]
    fn test_corrupted_payload_surfaces_row_id() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();
        let summary = make_summary(&run.id, &unit.id, "model-a");
        store.insert_summaries(&run.id, &[summary.clone()]).unwrap();

        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO evaluation_results (id, run_id, summary_id, kind, payload_blob, evaluated_at)
                 VALUES ('bad-row', ?1, ?2, 'judge', '{not json', ?3)",
                params![run.id, summary.id, Utc::now().to_rfc3339()],
            )
            .unwrap();
        }

        let err = store.get_evaluation_results(&run.id, None).unwrap_err();
        match err {
            StoreError::CorruptedData { row_id, .. } => assert_eq!(row_id, "bad-row"),
            other => panic!("Expected CorruptedData, got {:?}", other),
        }
    }

    #[test]
    fn test_pairwise_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();

        let rows = vec![PairwiseResult {
            id: new_id(),
            run_id: run.id.clone(),
            model_a: "model-a".into(),
            model_b: "model-b".into(),
            code_unit_id: unit.id.clone(),
            judge_model: "judge-x".into(),
            winner: Winner::B,
            confidence: JudgeConfidence::Medium,
            position_swapped: true,
            reasoning: Some("b is tighter".into()),
            criteria: None,
            cost: Some(0.0005),
        }];
        store.insert_pairwise_results(&rows).unwrap();

        let fetched = store.get_pairwise_results(&run.id).unwrap();
        assert_eq!(fetched, rows);
    }

    #[test]
    fn test_queries_and_distractors_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        let other = make_unit(&run.id, "src/b.rs", "beta");
        store
            .insert_code_units(&run.id, &[unit.clone(), other.clone()])
            .unwrap();

        let queries = vec![GeneratedQuery {
            id: new_id(),
            run_id: run.id.clone(),
            code_unit_id: unit.id.clone(),
            query_type: "functional".into(),
            text: "how is the password verified".into(),
            should_find: true,
        }];
        store.insert_queries(&queries).unwrap();
        assert_eq!(store.get_queries(&run.id).unwrap(), queries);

        let sets = vec![DistractorSet {
            id: new_id(),
            run_id: run.id.clone(),
            target_code_unit_id: unit.id.clone(),
            distractor_ids: vec![other.id.clone()],
            difficulty: Difficulty::Easy,
        }];
        store.insert_distractor_sets(&sets).unwrap();
        assert_eq!(store.get_distractor_sets(&run.id).unwrap(), sets);
    }

    #[test]
    fn test_aggregated_scores_upsert_unique_per_model() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        let scores = NormalizedScores::default();
        store
            .save_aggregated_scores(&run.id, "model-a", &scores)
            .unwrap();
        store
            .save_aggregated_scores(&run.id, "model-a", &scores)
            .unwrap();
        store
            .save_aggregated_scores(&run.id, "model-b", &scores)
            .unwrap();

        let all = store.get_aggregated_scores(&run.id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0, "model-a");
        assert_eq!(all[1].0, "model-b");
    }

    #[test]
    fn test_phase_progress_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        store.start_phase(&run.id, Phase::Generation, 10).unwrap();
        let progress = store
            .get_phase_progress(&run.id, Phase::Generation)
            .unwrap()
            .unwrap();
        assert_eq!(progress.total, 10);
        assert_eq!(progress.completed, 0);
        assert!(!progress.is_complete());

        store
            .update_phase_progress(&run.id, Phase::Generation, 4, Some("unit-4"))
            .unwrap();
        // A smaller racing update must not regress the counter.
        store
            .update_phase_progress(&run.id, Phase::Generation, 2, None)
            .unwrap();
        let progress = store
            .get_phase_progress(&run.id, Phase::Generation)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, 4);
        assert_eq!(progress.last_processed_id.as_deref(), Some("unit-4"));

        store.complete_phase(&run.id, Phase::Generation).unwrap();
        let progress = store
            .get_phase_progress(&run.id, Phase::Generation)
            .unwrap()
            .unwrap();
        assert!(progress.is_complete());
    }

    #[test]
    fn test_start_phase_on_resume_keeps_counter() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        store.start_phase(&run.id, Phase::EvalJudge, 500).unwrap();
        store
            .update_phase_progress(&run.id, Phase::EvalJudge, 200, None)
            .unwrap();

        // Simulated restart re-enters the phase.
        store.start_phase(&run.id, Phase::EvalJudge, 500).unwrap();
        let progress = store
            .get_phase_progress(&run.id, Phase::EvalJudge)
            .unwrap()
            .unwrap();
        assert_eq!(progress.completed, 200);
        assert!(progress.completed_at.is_none());
    }

    #[test]
    fn test_delete_run_cascades() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);
        let unit = make_unit(&run.id, "src/a.rs", "alpha");
        store.insert_code_units(&run.id, &[unit.clone()]).unwrap();
        let summary = make_summary(&run.id, &unit.id, "model-a");
        store.insert_summaries(&run.id, &[summary.clone()]).unwrap();
        store
            .insert_evaluation_result(&EvaluationResult::new(
                &run.id,
                &summary.id,
                EvalPayload::Downstream {
                    data: serde_json::json!({}),
                },
            ))
            .unwrap();
        store.start_phase(&run.id, Phase::Extraction, 1).unwrap();

        assert!(store.delete_run(&run.id).unwrap());
        assert!(store.get_run(&run.id).is_err());
        assert_eq!(store.count_code_units(&run.id).unwrap(), 0);
        assert!(store.get_summaries(&run.id, None).unwrap().is_empty());
        assert!(store.get_evaluation_results(&run.id, None).unwrap().is_empty());
        assert!(store
            .get_phase_progress(&run.id, Phase::Extraction)
            .unwrap()
            .is_none());

        // Deleting again reports nothing deleted.
        assert!(!store.delete_run(&run.id).unwrap());
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let run = make_run(&store);

        let result: Result<(), StoreError> = store.transaction(|tx| {
            tx.execute(
                "INSERT INTO generated_queries (id, run_id, code_unit_id, query_type, text, should_find)
                 VALUES ('q1', ?1, 'no-such-unit', 'functional', 'x', 1)",
                params![run.id],
            )?;
            Ok(())
        });
        // FK violation on code_unit_id aborts the transaction.
        assert!(result.is_err());
        assert!(store.get_queries(&run.id).unwrap().is_empty());
    }
}
