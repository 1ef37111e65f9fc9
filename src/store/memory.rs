//! In-memory embedding cache backend.
//!
//! Same semantics as the Postgres backend, minus persistence and the ANN
//! index (search is exact). Used by tests and cache-less deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{CacheKey, CacheStats, EmbeddingCache, SearchFilter, cosine_similarity};
use crate::Result;
use crate::telemetry;
use crate::types::CachedEmbedding;

/// Process-local cache backend.
pub struct MemoryEmbeddingCache {
    /// Lock is never held across an await point.
    rows: Mutex<HashMap<[u8; 32], CachedEmbedding>>,
    next_id: AtomicI64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryEmbeddingCache {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Number of rows held.
    pub fn len(&self) -> usize {
        self.rows.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryEmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingCache for MemoryEmbeddingCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedEmbedding>> {
        let rows = self.rows.lock().expect("cache lock poisoned");
        let hit = rows
            .get(&key.hash)
            // Hash equality without text equality is a collision, not a hit.
            .filter(|row| row.text == key.text)
            .cloned();
        drop(rows);
        if hit.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "layer" => "memory").increment(1);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
        }
        Ok(hit)
    }

    async fn put(&self, mut entry: CachedEmbedding) -> Result<i64> {
        let hash: [u8; 32] = entry
            .text_hash
            .as_slice()
            .try_into()
            .map_err(|_| crate::MimirError::Client("text_hash must be 32 bytes".into()))?;
        let mut rows = self.rows.lock().expect("cache lock poisoned");
        if let Some(existing) = rows.get_mut(&hash) {
            existing.usage_count += 1;
            existing.last_accessed_at = entry.last_accessed_at;
            existing.quality_score = entry.quality_score;
            existing.expires_at = entry.expires_at;
            return Ok(existing.id);
        }
        entry.id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = entry.id;
        rows.insert(hash, entry);
        Ok(id)
    }

    async fn record_usage(
        &self,
        id: i64,
        successful: bool,
        retrieval_rank: Option<f32>,
    ) -> Result<()> {
        let mut rows = self.rows.lock().expect("cache lock poisoned");
        let Some(row) = rows.values_mut().find(|r| r.id == id) else {
            return Ok(()); // row expired between read and feedback
        };
        row.usage_count += 1;
        if successful {
            row.successful_uses += 1;
            row.quality_score = (row.quality_score * 0.95 + 0.05).min(1.0);
        } else {
            row.failed_uses += 1;
            row.quality_score *= 0.95;
        }
        if let Some(rank) = retrieval_rank {
            row.avg_retrieval_rank = Some(match row.avg_retrieval_rank {
                Some(avg) => avg * 0.9 + rank * 0.1,
                None => rank,
            });
        }
        row.last_accessed_at = Utc::now();
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<(i64, f32)>> {
        let rows = self.rows.lock().expect("cache lock poisoned");
        let filter = filter.unwrap_or_default();
        let mut scored: Vec<(i64, f32)> = rows
            .values()
            .filter(|r| {
                filter
                    .model_id
                    .as_deref()
                    .is_none_or(|m| r.model_id == m)
                    && filter.min_quality.is_none_or(|q| r.quality_score >= q)
                    && r.vector.len() == query.len()
            })
            .map(|r| (r.id, cosine_similarity(query, &r.vector)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut rows = self.rows.lock().expect("cache lock poisoned");
        let before = rows.len();
        rows.retain(|_, r| r.expires_at.is_none_or(|t| t >= now));
        Ok((before - rows.len()) as u64)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let rows = self.rows.lock().expect("cache lock poisoned");
        let count = rows.len() as i64;
        let avg_quality = if rows.is_empty() {
            0.0
        } else {
            rows.values().map(|r| r.quality_score as f64).sum::<f64>() / rows.len() as f64
        };
        Ok(CacheStats {
            rows: count,
            avg_quality,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}
