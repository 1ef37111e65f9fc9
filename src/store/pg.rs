//! Postgres + pgvector cache backend.
//!
//! One `smart_embeddings` row per content hash, with an ivfflat cosine
//! index on the full vector and another on the optional compressed
//! vector. A bounded moka hot layer sits in front of lookups; its entries
//! carry a short TTL, so usage counters read through it may lag the store
//! by up to that TTL.
//!
//! Row updates are single atomic statements; the `ON CONFLICT` upsert
//! resolves duplicate-key races by handing the loser the winner's id.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use std::sync::atomic::{AtomicU64, Ordering};

use super::{CacheKey, CacheStats, EmbeddingCache, SearchFilter};
use crate::types::CachedEmbedding;
use crate::{MimirError, Result, telemetry};

/// Hot-layer defaults.
const L1_MAX_ENTRIES: u64 = 10_000;
const L1_TTL: Duration = Duration::from_secs(60);

/// Candidate pool width for the coarse stage of hierarchical search.
const COARSE_CANDIDATES: i64 = 100;

/// Production cache backend over Postgres + pgvector.
pub struct PgEmbeddingCache {
    pool: PgPool,
    l1: moka::future::Cache<[u8; 32], CachedEmbedding>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl PgEmbeddingCache {
    /// Wrap a pool with default hot-layer sizing.
    pub fn new(pool: PgPool) -> Self {
        Self::with_l1(pool, L1_MAX_ENTRIES, L1_TTL)
    }

    /// Wrap a pool with explicit hot-layer sizing.
    pub fn with_l1(pool: PgPool, max_entries: u64, ttl: Duration) -> Self {
        Self {
            pool,
            l1: moka::future::Cache::builder()
                .max_capacity(max_entries)
                .time_to_live(ttl)
                .build(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Two-stage similarity search: coarse pass over the compressed
    /// vectors, exact rerank on the full vector among the candidates.
    ///
    /// Falls back to a plain [`EmbeddingCache::search`] when the caller
    /// has no compressed query vector.
    pub async fn hierarchical_search(
        &self,
        query: &[f32],
        query_compressed: Option<&[f32]>,
        k: usize,
    ) -> Result<Vec<(i64, f32)>> {
        let Some(coarse) = query_compressed else {
            return self.search(query, k, None).await;
        };

        let candidate_ids: Vec<i64> = sqlx::query(
            "SELECT id FROM smart_embeddings \
             WHERE vector_compressed IS NOT NULL \
             ORDER BY vector_compressed <=> $1 LIMIT $2",
        )
        .bind(Vector::from(coarse.to_vec()))
        .bind(COARSE_CANDIDATES)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|row| row.get::<i64, _>("id"))
        .collect();

        if candidate_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT id, 1 - (vector <=> $1) AS score FROM smart_embeddings \
             WHERE id = ANY($2) ORDER BY vector <=> $1 LIMIT $3",
        )
        .bind(Vector::from(query.to_vec()))
        .bind(&candidate_ids)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<i64, _>("id"), row.get::<f64, _>("score") as f32))
            .collect())
    }

    fn decode_row(row: &PgRow) -> Result<CachedEmbedding> {
        let vector: Vector = row.try_get("vector")?;
        let compressed: Option<Vector> = row.try_get("vector_compressed")?;
        Ok(CachedEmbedding {
            id: row.try_get("id")?,
            text_hash: row.try_get("text_hash")?,
            text: row.try_get("text")?,
            vector: vector.to_vec(),
            vector_compressed: compressed.map(|v| v.to_vec()),
            model_id: row.try_get("model_id")?,
            model_version: row.try_get("model_version")?,
            is_ensemble: row.try_get("is_ensemble")?,
            quality_score: row.try_get("quality_score")?,
            confidence_score: row.try_get("confidence_score")?,
            usage_count: row.try_get("usage_count")?,
            successful_uses: row.try_get("successful_uses")?,
            failed_uses: row.try_get("failed_uses")?,
            avg_retrieval_rank: row.try_get("avg_retrieval_rank")?,
            created_at: row.try_get("created_at")?,
            last_accessed_at: row.try_get("last_accessed_at")?,
            expires_at: row.try_get("expires_at")?,
            pos_feedback: row.try_get("pos_feedback")?,
            neg_feedback: row.try_get("neg_feedback")?,
        })
    }
}

#[async_trait]
impl EmbeddingCache for PgEmbeddingCache {
    async fn lookup(&self, key: &CacheKey) -> Result<Option<CachedEmbedding>> {
        if let Some(row) = self.l1.get(&key.hash).await
            && row.text == key.text
        {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(telemetry::CACHE_HITS_TOTAL, "layer" => "memory").increment(1);
            return Ok(Some(row));
        }

        let row = sqlx::query(
            "SELECT id, text_hash, text, vector, vector_compressed, model_id, \
                    model_version, is_ensemble, quality_score, confidence_score, \
                    usage_count, successful_uses, failed_uses, avg_retrieval_rank, \
                    created_at, last_accessed_at, expires_at, pos_feedback, neg_feedback \
             FROM smart_embeddings WHERE text_hash = $1",
        )
        .bind(key.hash.to_vec())
        .fetch_optional(&self.pool)
        .await?;

        let decoded = row.as_ref().map(Self::decode_row).transpose()?;
        // Hash equality without text equality is a collision, not a hit.
        let hit = decoded.filter(|r| r.text == key.text);

        match &hit {
            Some(row) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_HITS_TOTAL, "layer" => "store").increment(1);
                self.l1.insert(key.hash, row.clone()).await;
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
            }
        }
        Ok(hit)
    }

    async fn put(&self, entry: CachedEmbedding) -> Result<i64> {
        let hash: [u8; 32] = entry
            .text_hash
            .as_slice()
            .try_into()
            .map_err(|_| MimirError::Client("text_hash must be 32 bytes".into()))?;

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO smart_embeddings \
               (text_hash, text, vector, vector_compressed, model_id, model_version, \
                is_ensemble, quality_score, confidence_score, created_at, \
                last_accessed_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             ON CONFLICT (text_hash) DO UPDATE SET \
               usage_count = smart_embeddings.usage_count + 1, \
               last_accessed_at = EXCLUDED.last_accessed_at, \
               expires_at = EXCLUDED.expires_at \
             RETURNING id",
        )
        .bind(entry.text_hash.clone())
        .bind(&entry.text)
        .bind(Vector::from(entry.vector.clone()))
        .bind(entry.vector_compressed.clone().map(Vector::from))
        .bind(&entry.model_id)
        .bind(&entry.model_version)
        .bind(entry.is_ensemble)
        .bind(entry.quality_score)
        .bind(entry.confidence_score)
        .bind(entry.created_at)
        .bind(entry.last_accessed_at)
        .bind(entry.expires_at)
        .fetch_one(&self.pool)
        .await?;

        let mut cached = entry;
        cached.id = id;
        self.l1.insert(hash, cached).await;
        Ok(id)
    }

    async fn record_usage(
        &self,
        id: i64,
        successful: bool,
        retrieval_rank: Option<f32>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE smart_embeddings SET \
               usage_count = usage_count + 1, \
               successful_uses = successful_uses + CASE WHEN $2 THEN 1 ELSE 0 END, \
               failed_uses = failed_uses + CASE WHEN $2 THEN 0 ELSE 1 END, \
               quality_score = CASE WHEN $2 \
                 THEN LEAST(1.0, quality_score * 0.95 + 0.05) \
                 ELSE quality_score * 0.95 END, \
               avg_retrieval_rank = CASE \
                 WHEN $3::real IS NULL THEN avg_retrieval_rank \
                 WHEN avg_retrieval_rank IS NULL THEN $3 \
                 ELSE avg_retrieval_rank * 0.9 + $3 * 0.1 END, \
               last_accessed_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(successful)
        .bind(retrieval_rank)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn search(
        &self,
        query: &[f32],
        k: usize,
        filter: Option<SearchFilter>,
    ) -> Result<Vec<(i64, f32)>> {
        let filter = filter.unwrap_or_default();
        let rows = sqlx::query(
            "SELECT id, 1 - (vector <=> $1) AS score FROM smart_embeddings \
             WHERE ($2::text IS NULL OR model_id = $2) \
               AND ($3::real IS NULL OR quality_score >= $3) \
             ORDER BY vector <=> $1 LIMIT $4",
        )
        .bind(Vector::from(query.to_vec()))
        .bind(filter.model_id)
        .bind(filter.min_quality)
        .bind(k as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| (row.get::<i64, _>("id"), row.get::<f64, _>("score") as f32))
            .collect())
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM smart_embeddings \
             WHERE expires_at IS NOT NULL AND expires_at < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        self.l1.invalidate_all();
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS rows, COALESCE(AVG(quality_score), 0)::float8 AS avg_quality \
             FROM smart_embeddings",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(CacheStats {
            rows: row.get::<i64, _>("rows"),
            avg_quality: row.get::<f64, _>("avg_quality"),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}

/// Versioned, idempotent schema migrations.
///
/// Applied versions are recorded in `mimir_schema_migrations`; re-running
/// is a no-op. `full_dim`/`compressed_dim` fix the vector column widths
/// (the default embedding model's declared dimension and the coarse
/// representation's width).
pub async fn run_migrations(pool: &PgPool, full_dim: usize, compressed_dim: usize) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mimir_schema_migrations ( \
           version INT PRIMARY KEY, \
           applied_at TIMESTAMPTZ NOT NULL DEFAULT now())",
    )
    .execute(pool)
    .await?;

    let migrations: Vec<(i32, String)> = vec![
        (1, "CREATE EXTENSION IF NOT EXISTS vector".to_string()),
        (
            2,
            format!(
                "CREATE TABLE IF NOT EXISTS smart_embeddings ( \
                   id BIGSERIAL PRIMARY KEY, \
                   text_hash BYTEA NOT NULL UNIQUE, \
                   text TEXT NOT NULL, \
                   vector vector({full_dim}) NOT NULL, \
                   vector_compressed vector({compressed_dim}), \
                   model_id TEXT NOT NULL, \
                   model_version TEXT NOT NULL, \
                   is_ensemble BOOLEAN NOT NULL DEFAULT FALSE, \
                   quality_score REAL NOT NULL DEFAULT 0.8, \
                   confidence_score REAL NOT NULL DEFAULT 0.5, \
                   usage_count BIGINT NOT NULL DEFAULT 0, \
                   successful_uses BIGINT NOT NULL DEFAULT 0, \
                   failed_uses BIGINT NOT NULL DEFAULT 0, \
                   avg_retrieval_rank REAL, \
                   created_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                   last_accessed_at TIMESTAMPTZ NOT NULL DEFAULT now(), \
                   expires_at TIMESTAMPTZ, \
                   pos_feedback INT NOT NULL DEFAULT 0, \
                   neg_feedback INT NOT NULL DEFAULT 0); \
                 CREATE INDEX IF NOT EXISTS smart_embeddings_vector_idx \
                   ON smart_embeddings USING ivfflat (vector vector_cosine_ops) \
                   WITH (lists = 100); \
                 CREATE INDEX IF NOT EXISTS smart_embeddings_compressed_idx \
                   ON smart_embeddings USING ivfflat (vector_compressed vector_cosine_ops) \
                   WITH (lists = 100)"
            ),
        ),
        (
            3,
            "CREATE TABLE IF NOT EXISTS model_performance ( \
               model_id TEXT PRIMARY KEY, \
               avg_quality DOUBLE PRECISION NOT NULL DEFAULT 0, \
               avg_latency_ms DOUBLE PRECISION NOT NULL DEFAULT 0, \
               success_rate DOUBLE PRECISION NOT NULL DEFAULT 0, \
               sample_count BIGINT NOT NULL DEFAULT 0, \
               updated_at TIMESTAMPTZ NOT NULL DEFAULT now()); \
             CREATE TABLE IF NOT EXISTS audit_log ( \
               id BIGSERIAL PRIMARY KEY, \
               request_id UUID NOT NULL, \
               timestamp TIMESTAMPTZ NOT NULL, \
               user_id TEXT, \
               audit_reason TEXT, \
               model_id TEXT NOT NULL, \
               temperature REAL, \
               max_tokens INT, \
               processing_time_ms DOUBLE PRECISION NOT NULL, \
               success BOOLEAN NOT NULL, \
               error_kind TEXT, \
               error_detail TEXT, \
               input_tokens INT NOT NULL DEFAULT 0, \
               output_tokens INT NOT NULL DEFAULT 0); \
             CREATE INDEX IF NOT EXISTS audit_log_request_idx ON audit_log (request_id); \
             CREATE INDEX IF NOT EXISTS audit_log_timestamp_idx ON audit_log (timestamp)"
                .to_string(),
        ),
    ];

    for (version, sql) in migrations {
        let applied: Option<i32> =
            sqlx::query_scalar("SELECT version FROM mimir_schema_migrations WHERE version = $1")
                .bind(version)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }
        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&sql).execute(&mut *tx).await?;
        sqlx::query("INSERT INTO mimir_schema_migrations (version) VALUES ($1)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
    }
    Ok(())
}
