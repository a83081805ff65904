//! Cross-model embedding index and content-hash embedding cache.
//!
//! The index holds every model's summary of every code unit so models
//! compete on each query. It is built once per phase, append-only, and
//! scored by a linear cosine scan; benchmark pools are small enough
//! that nothing fancier pays for itself.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Result, bail};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::clients::EmbeddingClient;
use crate::errors::LlmError;

/// Cosine similarity; zero vectors score 0 against everything.
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub model_id: String,
    pub code_unit_id: String,
    pub summary_id: String,
    pub embedding: Arc<Vec<f32>>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub model_id: String,
    pub code_unit_id: String,
    pub summary_id: String,
    pub score: f32,
}

/// Per-model outcome of one query against the combined index.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRank {
    /// 1-based rank of the model's target summary in the full pool.
    pub rank: usize,
    pub score: f32,
    /// 1-based position among models ordered by `rank`.
    pub model_rank: usize,
    pub is_winner: bool,
}

pub struct EmbeddingIndex {
    entries: Vec<IndexEntry>,
    dim: Option<usize>,
}

impl Default for EmbeddingIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingIndex {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            dim: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn model_count(&self) -> usize {
        let mut models: Vec<&str> = self.entries.iter().map(|e| e.model_id.as_str()).collect();
        models.sort_unstable();
        models.dedup();
        models.len()
    }

    /// Append an entry. All entries must share one dimension.
    pub fn add(&mut self, entry: IndexEntry) -> Result<()> {
        match self.dim {
            None => self.dim = Some(entry.embedding.len()),
            Some(dim) if dim != entry.embedding.len() => {
                bail!(
                    "embedding dimension mismatch: index has {}, entry has {}",
                    dim,
                    entry.embedding.len()
                );
            }
            Some(_) => {}
        }
        self.entries.push(entry);
        Ok(())
    }

    /// All entries ranked by cosine against `query`, best first. The sort
    /// is stable, so equal scores keep insertion order, which is the tie
    /// break the retrieval metrics rely on.
    fn ranked(&self, query: &[f32]) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine(query, &e.embedding)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored
    }

    /// Top-`k` entries across the whole pool.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        self.ranked(query)
            .into_iter()
            .take(k)
            .map(|(i, score)| {
                let e = &self.entries[i];
                SearchHit {
                    model_id: e.model_id.clone(),
                    code_unit_id: e.code_unit_id.clone(),
                    summary_id: e.summary_id.clone(),
                    score,
                }
            })
            .collect()
    }

    /// For each model, the rank of its summary of `target_code_unit_id`
    /// (first occurrence per model), plus the cross-model placement.
    pub fn model_ranks(
        &self,
        query: &[f32],
        target_code_unit_id: &str,
    ) -> HashMap<String, ModelRank> {
        let ranked = self.ranked(query);
        let mut first_hit: HashMap<String, (usize, f32)> = HashMap::new();
        for (position, (index, score)) in ranked.iter().enumerate() {
            let entry = &self.entries[*index];
            if entry.code_unit_id == target_code_unit_id {
                first_hit
                    .entry(entry.model_id.clone())
                    .or_insert((position + 1, *score));
            }
        }

        let mut ordering: Vec<(&String, usize)> =
            first_hit.iter().map(|(m, (rank, _))| (m, *rank)).collect();
        ordering.sort_by_key(|(_, rank)| *rank);

        let mut out = HashMap::new();
        for (model_position, (model, _)) in ordering.iter().enumerate() {
            let (rank, score) = first_hit[*model];
            out.insert(
                (*model).clone(),
                ModelRank {
                    rank,
                    score,
                    model_rank: model_position + 1,
                    is_winner: model_position == 0,
                },
            );
        }
        out
    }
}

/// Content-hash-keyed embedding cache, shared across phases. Keying by
/// hash rather than object identity means a refined summary with the
/// same text as a previous round costs nothing to re-embed.
pub struct EmbeddingCache {
    entries: DashMap<String, Arc<Vec<f32>>>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn content_key(text: &str) -> String {
        hex::encode(Sha256::digest(text.as_bytes()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        self.entries
            .get(&Self::content_key(text))
            .map(|e| e.value().clone())
    }

    pub fn insert(&self, text: &str, embedding: Vec<f32>) -> Arc<Vec<f32>> {
        let shared = Arc::new(embedding);
        self.entries
            .insert(Self::content_key(text), shared.clone());
        shared
    }

    /// Embed all `texts`, batching only the cache misses, and return one
    /// vector per input text in order.
    pub async fn embed_all(
        &self,
        client: &Arc<dyn EmbeddingClient>,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> Result<Vec<Arc<Vec<f32>>>, LlmError> {
        let mut missing: Vec<String> = Vec::new();
        let mut missing_keys: Vec<String> = Vec::new();
        for text in texts {
            let key = Self::content_key(text);
            if !self.entries.contains_key(&key) && !missing_keys.contains(&key) {
                missing_keys.push(key);
                missing.push(text.clone());
            }
        }

        if !missing.is_empty() {
            let batch = client.embed(&missing, cancel).await?;
            if batch.embeddings.len() != missing.len() {
                return Err(LlmError::InvalidResponse(format!(
                    "embedding batch returned {} vectors for {} texts",
                    batch.embeddings.len(),
                    missing.len()
                )));
            }
            for (text, embedding) in missing.iter().zip(batch.embeddings) {
                self.insert(text, embedding);
            }
        }

        texts
            .iter()
            .map(|text| {
                self.get(text)
                    .ok_or_else(|| LlmError::InvalidResponse("cache miss after embed".into()))
            })
            .collect()
    }

    /// Single-text convenience over [`EmbeddingCache::embed_all`].
    pub async fn embed_one(
        &self,
        client: &Arc<dyn EmbeddingClient>,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Vec<f32>>, LlmError> {
        if let Some(hit) = self.get(text) {
            return Ok(hit);
        }
        let embedding = client.embed_one(text, cancel).await?;
        Ok(self.insert(text, embedding))
    }
}
