//! The gateway façade.
//!
//! [`Gateway`] is the stable outward API: `generate`, `embed`,
//! `embed_batch`, `invoke`, and `health`. It owns its dependencies — the
//! session manager, router, cache, invoker, breakers, and audit recorder
//! are wired in by the builder, and dependencies flow one way (nothing
//! below calls back up into the façade).
//!
//! Every operation takes a cooperative deadline, checked before each
//! suspension point. Every outcome, including breaker short-circuits,
//! produces exactly one audit record. Cache-store trouble degrades the
//! embedding path to uncached compute rather than failing the request.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::audit::AuditRecorder;
use crate::breaker::{BreakerState, CircuitBreaker, RetryPolicy, with_retry};
use crate::config::ModelSpec;
use crate::deadline::Deadline;
use crate::error::ErrorKind;
use crate::flight::{FlightRole, SingleFlight};
use crate::invoker::{ModelInvoker, estimate_tokens};
use crate::local::{LocalEmbedder, ensemble_embed};
use crate::router::{EmbedStrategy, RouteHealth, Router, TextAnalysis};
use crate::session::SessionManager;
use crate::store::{CacheKey, CacheStats, EmbeddingCache, run_migrations};
use crate::types::{
    AuditRecord, BreakerHealth, CachedEmbedding, EmbedRequest, EmbedResult, EmbeddingSource,
    GenerateRequest, GenerateResponse, HealthReport, InvokeOptions, TokenUsage,
};
use crate::{MimirError, Result, telemetry};

/// Quality priors for freshly computed embeddings, refined later by
/// usage feedback.
const REMOTE_QUALITY: f32 = 0.8;
const LOCAL_QUALITY: f32 = 0.7;
const ENSEMBLE_QUALITY: f32 = 0.75;

/// Compressed-vector width used by the schema's coarse search stage.
const COMPRESSED_DIM: usize = 256;

/// The wired gateway. Construct via [`Mimir::builder()`](crate::Mimir::builder).
pub struct Gateway {
    pub(crate) session: Arc<SessionManager>,
    pub(crate) router: Router,
    pub(crate) cache: Option<Arc<dyn EmbeddingCache>>,
    pub(crate) invoker: Arc<dyn ModelInvoker>,
    pub(crate) locals: Vec<Arc<dyn LocalEmbedder>>,
    pub(crate) flight: SingleFlight<[u8; 32], EmbedResult>,
    pub(crate) provider_breaker: Arc<CircuitBreaker>,
    pub(crate) store_breaker: Arc<CircuitBreaker>,
    pub(crate) retry: RetryPolicy,
    pub(crate) audit: AuditRecorder,
    pub(crate) default_deadline: Duration,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    // ========================================================================
    // Generation
    // ========================================================================

    /// Run a generation request. Errors are carried in-band: the response
    /// always arrives with its audit trail, `success` flag, and error kind.
    pub async fn generate(&self, request: GenerateRequest) -> GenerateResponse {
        let deadline = Deadline::start(request.deadline.unwrap_or(self.default_deadline));
        let mut audit = AuditRecord::begin(&request.model_id, Utc::now());
        audit.user_id = request.user_id.clone();
        audit.audit_reason = request.audit_reason.clone();
        audit.temperature = Some(request.temperature);
        audit.max_tokens = Some(request.max_tokens);

        let family = self
            .router
            .catalog()
            .get(&request.model_id)
            .and_then(|s| s.family())
            .map(|f| f.as_str())
            .unwrap_or("unknown");

        let outcome = self.generate_inner(&request, deadline).await;
        audit.processing_time_ms = deadline.elapsed_ms() as f64;

        match outcome {
            Ok(generation) => {
                audit.success = true;
                audit.input_tokens = generation.usage.input;
                audit.output_tokens = generation.usage.output;
                self.audit.record(audit.clone());

                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "operation" => "generate", "status" => "ok")
                .increment(1);
                metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
                    "operation" => "generate", "family" => family.to_owned())
                .record(audit.processing_time_ms / 1000.0);
                metrics::counter!(telemetry::TOKENS_TOTAL,
                    "family" => family.to_owned(), "direction" => "input")
                .increment(generation.usage.input as u64);
                metrics::counter!(telemetry::TOKENS_TOTAL,
                    "family" => family.to_owned(), "direction" => "output")
                .increment(generation.usage.output as u64);

                GenerateResponse {
                    content: generation.content,
                    success: true,
                    model_used: request.model_id,
                    processing_time_ms: audit.processing_time_ms,
                    token_usage: generation.usage,
                    error: None,
                    audit,
                }
            }
            Err(e) => {
                audit.success = false;
                audit.error_kind = Some(e.kind());
                audit.error_detail = Some(e.to_string());
                self.audit.record(audit.clone());

                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "operation" => "generate", "status" => "error")
                .increment(1);

                GenerateResponse {
                    content: String::new(),
                    success: false,
                    model_used: request.model_id,
                    processing_time_ms: audit.processing_time_ms,
                    token_usage: TokenUsage::default(),
                    error: Some(e.kind()),
                    audit,
                }
            }
        }
    }

    async fn generate_inner(
        &self,
        request: &GenerateRequest,
        deadline: Deadline,
    ) -> Result<crate::invoker::Generation> {
        let (spec, max_tokens) = self
            .router
            .route_generation(&request.model_id, request.max_tokens)?;
        if deadline.expired() {
            return Err(deadline.to_timeout());
        }
        with_retry(
            &self.retry,
            &self.provider_breaker,
            deadline,
            "generate",
            || {
                self.invoker.generate(
                    spec,
                    &request.prompt,
                    request.temperature,
                    max_tokens,
                    deadline,
                )
            },
        )
        .await
    }

    /// Convenience wrapper over [`generate`](Self::generate): returns the
    /// bare completion text or the error that failed it.
    pub async fn invoke(
        &self,
        model_id: &str,
        prompt: &str,
        opts: InvokeOptions,
    ) -> Result<String> {
        let mut request = GenerateRequest::new(prompt, model_id);
        if let Some(t) = opts.temperature {
            request = request.temperature(t);
        }
        if let Some(n) = opts.max_tokens {
            request = request.max_tokens(n);
        }
        if let Some(d) = opts.deadline {
            request = request.deadline(d);
        }
        let response = self.generate(request).await;
        if response.success {
            Ok(response.content)
        } else {
            Err(error_from_audit(&response.audit))
        }
    }

    // ========================================================================
    // Embedding
    // ========================================================================

    /// Produce an embedding: cache first, then the routed compute path,
    /// with single-flight coalescing on the content key.
    pub async fn embed(&self, request: EmbedRequest) -> Result<EmbedResult> {
        let deadline = Deadline::start(request.deadline.unwrap_or(self.default_deadline));
        let requested_model = request
            .model_id
            .clone()
            .unwrap_or_else(|| {
                self.session
                    .config()
                    .provider
                    .default_embedding_model
                    .clone()
            });
        let mut audit = AuditRecord::begin(&requested_model, Utc::now());
        audit.input_tokens = estimate_tokens(&request.text);

        let outcome = self.embed_inner(&request, deadline).await;
        audit.processing_time_ms = deadline.elapsed_ms() as f64;

        match &outcome {
            Ok(result) => {
                audit.success = true;
                audit.model_id = result.model_used.clone();
                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "operation" => "embed", "status" => "ok")
                .increment(1);
                metrics::counter!(telemetry::EMBED_SOURCE_TOTAL,
                    "source" => result.source.as_str())
                .increment(1);
            }
            Err(e) => {
                audit.success = false;
                audit.error_kind = Some(e.kind());
                audit.error_detail = Some(e.to_string());
                metrics::counter!(telemetry::REQUESTS_TOTAL,
                    "operation" => "embed", "status" => "error")
                .increment(1);
            }
        }
        self.audit.record(audit);
        outcome
    }

    /// Batch embedding. Outcomes are independent per element; coalescing
    /// still applies per element, so duplicate texts inside one batch
    /// cost one upstream call.
    pub async fn embed_batch(&self, requests: Vec<EmbedRequest>) -> Vec<Result<EmbedResult>> {
        futures_util::future::join_all(requests.into_iter().map(|r| self.embed(r))).await
    }

    async fn embed_inner(&self, request: &EmbedRequest, deadline: Deadline) -> Result<EmbedResult> {
        if request.text.trim().is_empty() {
            return Err(MimirError::Client("text must not be empty".into()));
        }
        if deadline.expired() {
            return Err(deadline.to_timeout());
        }

        let spec = self.router.embedding_spec(request.model_id.as_deref())?;
        let key = CacheKey::compute(&request.text, &spec.id, &spec.version);

        let mut cache_degraded = false;
        let cache_enabled = request.use_cache && self.cache.is_some();

        if cache_enabled
            && self.store_breaker.state() != BreakerState::Open
            && let Some(cache) = &self.cache
        {
            match cache.lookup(&key).await {
                Ok(Some(row)) => {
                    self.store_breaker.record_success();
                    if let Some(dim) = spec.dimension
                        && row.vector.len() != dim
                    {
                        // The row stays; a mismatch is a contract violation
                        // to surface, not data to silently discard.
                        return Err(MimirError::Protocol(format!(
                            "cached vector has {} dimensions, model {} declares {dim}",
                            row.vector.len(),
                            spec.id
                        )));
                    }
                    self.record_usage_quietly(row.id).await;
                    return Ok(EmbedResult {
                        vector: row.vector,
                        source: EmbeddingSource::Cache,
                        model_used: row.model_id,
                        quality_score: row.quality_score,
                        cache_id: Some(row.id),
                    });
                }
                Ok(None) => {
                    self.store_breaker.record_success();
                }
                Err(e) => {
                    self.store_breaker.record_failure();
                    warn!(error = %e, "cache lookup failed, continuing uncached");
                    cache_degraded = true;
                }
            }
        }

        let analysis = TextAnalysis::of(&request.text, &request.tags);
        let health = RouteHealth {
            provider: self.provider_breaker.state(),
            has_local: !self.locals.is_empty(),
        };
        let strategy = self.router.route_embedding(request, &analysis, health)?;

        // The plain local fast path serves without a write-back; every
        // other compute path populates the cache when it is usable.
        let write_back =
            cache_enabled && !cache_degraded && !matches!(strategy, EmbedStrategy::Local);

        let mut retried_after_cancel = false;
        loop {
            let (outcome, role) = self
                .flight
                .run(key.hash, Some(deadline.remaining()), || {
                    self.compute_embedding(strategy.clone(), &key, spec, write_back, deadline)
                })
                .await;

            // A waiter whose winner was torn down may retry once as a
            // fresh winner if its own deadline still has room.
            if role == FlightRole::Waiter
                && !retried_after_cancel
                && matches!(outcome, Err(MimirError::Cancelled))
                && !deadline.expired()
            {
                retried_after_cancel = true;
                continue;
            }

            let result = outcome?;
            if let Some(id) = result.cache_id {
                self.record_usage_quietly(id).await;
            }
            return Ok(result);
        }
    }

    /// The single-flight winner's work: run the routed compute path and
    /// write the result back to the cache when allowed.
    async fn compute_embedding(
        &self,
        strategy: EmbedStrategy,
        key: &CacheKey,
        spec: &ModelSpec,
        write_back: bool,
        deadline: Deadline,
    ) -> Result<EmbedResult> {
        let (vector, model_used, model_version, source, quality, is_ensemble) = match strategy {
            EmbedStrategy::Local | EmbedStrategy::LocalThenCache => {
                let local = self
                    .locals
                    .first()
                    .ok_or_else(|| MimirError::Client("no local backends registered".into()))?;
                let vector = local.embed(&key.text).await?;
                (
                    vector,
                    local.model_id().to_string(),
                    "1".to_string(),
                    EmbeddingSource::Local,
                    LOCAL_QUALITY,
                    false,
                )
            }
            EmbedStrategy::Ensemble => {
                let vector = ensemble_embed(&self.locals, &key.text).await?;
                (
                    vector,
                    "local.ensemble".to_string(),
                    "1".to_string(),
                    EmbeddingSource::Local,
                    ENSEMBLE_QUALITY,
                    true,
                )
            }
            EmbedStrategy::Domain(model_id) | EmbedStrategy::Remote(model_id) => {
                let remote_spec = self.router.catalog().require(&model_id)?;
                let vector = with_retry(
                    &self.retry,
                    &self.provider_breaker,
                    deadline,
                    "embed",
                    || self.invoker.embed(remote_spec, &key.text, deadline),
                )
                .await?;
                (
                    vector,
                    model_id,
                    remote_spec.version.clone(),
                    EmbeddingSource::Remote,
                    REMOTE_QUALITY,
                    false,
                )
            }
        };

        let mut cache_id = None;
        if write_back && let Some(cache) = &self.cache {
            // Rows are addressed by the model that produced the vector;
            // when routing upgraded the request, the write-back key is
            // recomputed for the serving model.
            let write_key = if model_used == spec.id {
                key.clone()
            } else {
                CacheKey::compute(&key.text, &model_used, &model_version)
            };
            let now = Utc::now();
            let mut entry = CachedEmbedding::new(
                write_key.hash.to_vec(),
                write_key.text,
                vector.clone(),
                model_used.clone(),
                model_version,
                now,
            );
            entry.is_ensemble = is_ensemble;
            entry.quality_score = quality;
            match cache.put(entry).await {
                Ok(id) => {
                    self.store_breaker.record_success();
                    cache_id = Some(id);
                }
                Err(e) => {
                    self.store_breaker.record_failure();
                    warn!(error = %e, "cache write-back failed");
                }
            }
        }

        Ok(EmbedResult {
            vector,
            source,
            model_used,
            quality_score: quality,
            cache_id,
        })
    }

    /// Usage feedback is synchronous on the read path but must never fail
    /// the serving request.
    async fn record_usage_quietly(&self, id: i64) {
        if let Some(cache) = &self.cache
            && let Err(e) = cache.record_usage(id, true, None).await
        {
            self.store_breaker.record_failure();
            warn!(error = %e, id, "usage feedback failed");
        }
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Aggregate health: one probe per configured dependency plus breaker
    /// snapshots. Pure observation; mutates nothing.
    pub async fn health(&self) -> HealthReport {
        HealthReport {
            dependencies: self.session.probe_all().await,
            breakers: vec![
                BreakerHealth {
                    name: "provider".to_string(),
                    state: self.provider_breaker.state(),
                },
                BreakerHealth {
                    name: "relational_store".to_string(),
                    state: self.store_breaker.state(),
                },
            ],
        }
    }

    /// Cache statistics for operators.
    pub async fn cache_stats(&self) -> Result<CacheStats> {
        match &self.cache {
            Some(cache) => cache.stats().await,
            None => Err(MimirError::BackingStoreUnavailable(
                "no cache configured".into(),
            )),
        }
    }

    /// Remove expired cache rows now.
    pub async fn expire_cache(&self) -> Result<u64> {
        match &self.cache {
            Some(cache) => cache.expire(Utc::now()).await,
            None => Ok(0),
        }
    }

    /// Apply schema migrations to the relational store. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        let pool = self.session.relational_pool().await?;
        let full_dim = self
            .router
            .embedding_spec(None)
            .ok()
            .and_then(|s| s.dimension)
            .unwrap_or(1536);
        run_migrations(pool, full_dim, COMPRESSED_DIM).await
    }

    /// Drain audit, stop background tasks, close pooled connections.
    pub async fn close(&self) {
        self.audit.close().await;
        let tasks = std::mem::take(&mut *self.tasks.lock().expect("task lock poisoned"));
        for task in tasks {
            task.abort();
        }
        self.session.close().await;
    }
}

/// Rebuild a typed error from a settled audit record, for callers that
/// want `Result` semantics over the in-band response.
fn error_from_audit(audit: &AuditRecord) -> MimirError {
    let detail = audit.error_detail.clone().unwrap_or_default();
    match audit.error_kind {
        Some(ErrorKind::Auth) => MimirError::Auth {
            dependency: "provider".into(),
        },
        Some(ErrorKind::RateLimited) => MimirError::RateLimited { retry_after: None },
        Some(ErrorKind::Client) => MimirError::Client(detail),
        Some(ErrorKind::Protocol) => MimirError::Protocol(detail),
        Some(ErrorKind::Timeout) => MimirError::Timeout {
            elapsed_ms: audit.processing_time_ms as u64,
        },
        Some(ErrorKind::Cancelled) => MimirError::Cancelled,
        Some(ErrorKind::DependencyOpen) => MimirError::DependencyOpen {
            dependency: "provider".into(),
        },
        Some(ErrorKind::BackingStoreUnavailable) => MimirError::BackingStoreUnavailable(detail),
        Some(ErrorKind::ResourceExhausted) => MimirError::ResourceExhausted(detail),
        Some(ErrorKind::Config) => MimirError::Config(detail),
        Some(ErrorKind::Transient) | None => MimirError::Transient(detail),
    }
}
