//! sumarena: a resumable benchmark pipeline for code-summarization
//! language models.
//!
//! A run extracts code units from a project, asks each generator model to
//! summarize each unit, evaluates the summaries along four orthogonal
//! axes (iterative refinement, cross-model retrieval, contrastive
//! matching, judge scoring), aggregates per-model scores, and persists
//! reports. Every phase is resumable: progress lives in a crash-safe
//! SQLite store and finished items are never reprocessed.

pub mod aggregate;
pub mod clients;
pub mod config;
pub mod errors;
pub mod eval;
pub mod index;
pub mod orchestrator;
pub mod phase;
pub mod report;
pub mod selector;
pub mod statemachine;
pub mod store;
