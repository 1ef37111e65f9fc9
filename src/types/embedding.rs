//! Embedding request/result types and cached-row entities

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single-text embedding request.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    pub text: String,
    /// Embedding model id; `None` = catalog default.
    pub model_id: Option<String>,
    /// Prefer the premium remote model over cheap local paths.
    pub require_high_quality: bool,
    /// Consult and populate the persistent cache.
    pub use_cache: bool,
    /// Wall-clock budget. `None` = profile default.
    pub deadline: Option<Duration>,
    /// Free-form routing tags (e.g. `domain = "legal"`).
    pub tags: BTreeMap<String, String>,
    /// Caller prefers low latency over embedding quality.
    pub latency_sensitive: bool,
}

impl EmbedRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            model_id: None,
            require_high_quality: false,
            use_cache: true,
            deadline: None,
            tags: BTreeMap::new(),
            latency_sensitive: false,
        }
    }

    pub fn model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn use_cache(mut self, yes: bool) -> Self {
        self.use_cache = yes;
        self
    }

    pub fn require_high_quality(mut self, yes: bool) -> Self {
        self.require_high_quality = yes;
        self
    }

    pub fn deadline(mut self, d: Duration) -> Self {
        self.deadline = Some(d);
        self
    }

    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn latency_sensitive(mut self, yes: bool) -> Self {
        self.latency_sensitive = yes;
        self
    }
}

/// Where an embedding vector came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    Cache,
    Local,
    Remote,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cache => "cache",
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

/// A served embedding.
///
/// `vector.len()` always equals the serving model's declared dimension;
/// a stored row with a mismatched dimension is surfaced as `Protocol`
/// rather than silently truncated.
#[derive(Debug, Clone)]
pub struct EmbedResult {
    pub vector: Vec<f32>,
    pub source: EmbeddingSource,
    pub model_used: String,
    /// Quality estimate in `[0, 1]`, EWMA-updated by usage feedback.
    pub quality_score: f32,
    /// Row id when the result is backed by the persistent cache.
    pub cache_id: Option<i64>,
}

/// One row of the content-addressed embedding store.
///
/// The row is keyed by `id` and uniquely indexed by `text_hash` (SHA-256 of
/// normalized text ‖ model id ‖ model version). Hash equality is NOT trusted
/// on read: the store re-verifies `text` before returning a hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedEmbedding {
    pub id: i64,
    /// 32-byte content hash.
    pub text_hash: Vec<u8>,
    pub text: String,
    pub vector: Vec<f32>,
    /// Optional coarse representation for the first search stage.
    pub vector_compressed: Option<Vec<f32>>,
    pub model_id: String,
    pub model_version: String,
    /// Whether the vector is an average of several local models.
    pub is_ensemble: bool,
    pub quality_score: f32,
    pub confidence_score: f32,
    pub usage_count: i64,
    pub successful_uses: i64,
    pub failed_uses: i64,
    pub avg_retrieval_rank: Option<f32>,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub pos_feedback: i32,
    pub neg_feedback: i32,
}

impl CachedEmbedding {
    /// A fresh, never-used row for insertion (`id` assigned by the store).
    pub fn new(
        text_hash: Vec<u8>,
        text: impl Into<String>,
        vector: Vec<f32>,
        model_id: impl Into<String>,
        model_version: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            text_hash,
            text: text.into(),
            vector,
            vector_compressed: None,
            model_id: model_id.into(),
            model_version: model_version.into(),
            is_ensemble: false,
            quality_score: 0.8,
            confidence_score: 0.5,
            usage_count: 0,
            successful_uses: 0,
            failed_uses: 0,
            avg_retrieval_rank: None,
            created_at: now,
            last_accessed_at: now,
            expires_at: None,
            pos_feedback: 0,
            neg_feedback: 0,
        }
    }
}

/// Rolling per-model statistics maintained by the audit aggregation job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPerformance {
    pub model_id: String,
    pub avg_quality: f64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub sample_count: i64,
    pub updated_at: DateTime<Utc>,
}
