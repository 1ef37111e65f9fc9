//! Content-addressed embedding store.
//!
//! One row per embedding, keyed by a SHA-256 content hash of the
//! normalized text, model id, and model version. Backends implement
//! [`EmbeddingCache`]:
//!
//! - [`PgEmbeddingCache`] — Postgres + pgvector, the production backend,
//!   with a bounded in-memory hot layer in front of it.
//! - [`MemoryEmbeddingCache`] — process-local HashMap backend for tests
//!   and cache-less deployments.
//!
//! Hash equality is never trusted alone: every hit re-verifies the stored
//! text against the request text before being returned.

mod key;
mod memory;
mod pg;

pub use key::CacheKey;
pub use memory::MemoryEmbeddingCache;
pub use pg::{PgEmbeddingCache, run_migrations};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;
use crate::types::CachedEmbedding;

/// Optional predicate for similarity search.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    /// Restrict to rows produced by this model.
    pub model_id: Option<String>,
    /// Drop rows below this quality score.
    pub min_quality: Option<f32>,
}

/// Row count and quality/traffic statistics for the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub rows: i64,
    pub avg_quality: f64,
    /// Process-window lookup hits.
    pub hits: u64,
    /// Process-window lookup misses.
    pub misses: u64,
}

impl CacheStats {
    /// Hit rate over the process window; 0 when idle.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Persistent, content-addressed embedding cache.
///
/// Row-level updates are atomic at the backend. Failures surface as
/// `BackingStoreUnavailable`; callers degrade to non-cached paths.
#[async_trait]
pub trait EmbeddingCache: Send + Sync {
    /// Find the row for a content key.
    ///
    /// Returns `None` on miss, and also on hash-equal rows whose stored
    /// text differs from the key's text (treated as a collision).
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedEmbedding>>;

    /// Insert a row, idempotently by content hash.
    ///
    /// A second put with the same hash keeps the winner's identity fields,
    /// refreshes `last_accessed_at`, and bumps `usage_count`. Returns the
    /// row id either way (on a duplicate-key race the loser gets the
    /// winner's id).
    async fn put(&self, entry: CachedEmbedding) -> Result<i64>;

    /// Atomically fold one usage outcome into the row: counters, EWMA
    /// quality (`q <- 0.95q + 0.05` on success, `q <- 0.95q` on failure),
    /// and the rolling retrieval rank.
    async fn record_usage(&self, id: i64, successful: bool, retrieval_rank: Option<f32>)
    -> Result<()>;

    /// Cosine similarity search, best first.
    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<(i64, f32)>>;

    /// Remove rows whose `expires_at` has passed. Returns rows removed.
    async fn expire(&self, now: DateTime<Utc>) -> Result<u64>;

    /// Store statistics for operators.
    async fn stats(&self) -> Result<CacheStats>;
}

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0 for zero-magnitude inputs rather than NaN.
pub(crate) fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}
