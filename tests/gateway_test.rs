//! Gateway façade tests with fake backends injected through the
//! production traits.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use mimir::audit::AuditSink;
use mimir::config::{Config, ModelSpec};
use mimir::deadline::Deadline;
use mimir::invoker::{Generation, ModelInvoker};
use mimir::store::{CacheKey, EmbeddingCache, MemoryEmbeddingCache};
use mimir::types::AuditRecord;
use mimir::{
    CachedEmbedding, EmbedRequest, EmbeddingSource, ErrorKind, Gateway, GenerateRequest,
    InvokeOptions, Mimir, MimirError, TokenUsage,
};

const DEFAULT_EMBED_MODEL: &str = "amazon.titan-embed-text-v1";
const DIM: usize = 1536;

/// Provider fake: counts calls, can queue failures, honours deadlines.
struct FakeInvoker {
    calls: AtomicU32,
    queued_errors: Mutex<Vec<MimirError>>,
    work: Duration,
}

impl FakeInvoker {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
            queued_errors: Mutex::new(Vec::new()),
            work: Duration::ZERO,
        }
    }

    fn with_work(work: Duration) -> Self {
        Self {
            work,
            ..Self::new()
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn step(&self, deadline: Deadline) -> Result<(), MimirError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.queued_errors.lock().unwrap().pop() {
            return Err(err);
        }
        if !self.work.is_zero() {
            // A real invoker bounds its call by the remaining deadline.
            if self.work >= deadline.remaining() {
                tokio::time::sleep(deadline.remaining()).await;
                return Err(deadline.to_timeout());
            }
            tokio::time::sleep(self.work).await;
        }
        Ok(())
    }
}

#[async_trait]
impl ModelInvoker for FakeInvoker {
    async fn generate(
        &self,
        _spec: &ModelSpec,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
        deadline: Deadline,
    ) -> Result<Generation, MimirError> {
        self.step(deadline).await?;
        Ok(Generation {
            content: "the answer".to_string(),
            usage: TokenUsage::new(10, 5),
        })
    }

    async fn embed(
        &self,
        _spec: &ModelSpec,
        _text: &str,
        deadline: Deadline,
    ) -> Result<Vec<f32>, MimirError> {
        self.step(deadline).await?;
        Ok(vec![0.5; DIM])
    }
}

/// Audit sink fake collecting every record.
#[derive(Default)]
struct CollectingSink {
    records: Mutex<Vec<AuditRecord>>,
}

#[async_trait]
impl AuditSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    async fn append(&self, records: &[AuditRecord]) -> Result<(), MimirError> {
        self.records.lock().unwrap().extend_from_slice(records);
        Ok(())
    }
}

/// Cache fake that is permanently down.
struct DownCache;

#[async_trait]
impl EmbeddingCache for DownCache {
    async fn lookup(&self, _key: &CacheKey) -> Result<Option<CachedEmbedding>, MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }

    async fn put(&self, _entry: CachedEmbedding) -> Result<i64, MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }

    async fn record_usage(
        &self,
        _id: i64,
        _successful: bool,
        _rank: Option<f32>,
    ) -> Result<(), MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }

    async fn search(
        &self,
        _query: &[f32],
        _k: usize,
        _filter: Option<mimir::store::SearchFilter>,
    ) -> Result<Vec<(i64, f32)>, MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }

    async fn expire(&self, _now: chrono::DateTime<Utc>) -> Result<u64, MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }

    async fn stats(&self) -> Result<mimir::store::CacheStats, MimirError> {
        Err(MimirError::BackingStoreUnavailable("down".into()))
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.audit.sink = "log".to_string();
    config.audit.flush_interval_ms = 5;
    config
}

async fn gateway_with(
    invoker: Arc<FakeInvoker>,
    cache: Arc<dyn EmbeddingCache>,
    sink: Arc<CollectingSink>,
) -> Gateway {
    Mimir::builder()
        .config(test_config())
        .invoker(invoker)
        .cache(cache)
        .audit_sink(sink)
        .build()
        .await
        .unwrap()
}

async fn prepopulated_cache(text: &str) -> Arc<MemoryEmbeddingCache> {
    let cache = Arc::new(MemoryEmbeddingCache::new());
    let key = CacheKey::compute(text, DEFAULT_EMBED_MODEL, "1");
    cache
        .put(CachedEmbedding::new(
            key.hash.to_vec(),
            key.text,
            vec![0.25; DIM],
            DEFAULT_EMBED_MODEL,
            "1",
            Utc::now(),
        ))
        .await
        .unwrap();
    cache
}

// ============================================================================
// Embedding
// ============================================================================

#[tokio::test]
async fn cache_hit_serves_without_provider_call() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let cache = prepopulated_cache("hello world").await;
    let gateway = gateway_with(invoker.clone(), cache, sink.clone()).await;

    let result = gateway
        .embed(EmbedRequest::new("hello world").model(DEFAULT_EMBED_MODEL))
        .await
        .unwrap();

    assert_eq!(result.source, EmbeddingSource::Cache);
    assert_eq!(result.vector.len(), DIM);
    assert_eq!(result.model_used, DEFAULT_EMBED_MODEL);
    assert_eq!(invoker.call_count(), 0);

    gateway.close().await;
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].model_id, DEFAULT_EMBED_MODEL);
    assert_eq!(records[0].input_tokens, 2); // "hello world" ~ 11 chars / 4
}

#[tokio::test]
async fn second_embed_returns_identical_bytes_from_cache() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(
        invoker.clone(),
        Arc::new(MemoryEmbeddingCache::new()),
        sink,
    )
    .await;

    let first = gateway
        .embed(EmbedRequest::new("some fresh text"))
        .await
        .unwrap();
    assert_eq!(first.source, EmbeddingSource::Remote);

    let second = gateway
        .embed(EmbedRequest::new("some fresh text"))
        .await
        .unwrap();
    assert_eq!(second.source, EmbeddingSource::Cache);
    assert_eq!(first.vector, second.vector);
    assert_eq!(invoker.call_count(), 1);
}

#[tokio::test]
async fn use_cache_false_always_computes() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(
        invoker.clone(),
        Arc::new(MemoryEmbeddingCache::new()),
        sink,
    )
    .await;

    for _ in 0..2 {
        let result = gateway
            .embed(EmbedRequest::new("text").use_cache(false))
            .await
            .unwrap();
        assert_eq!(result.source, EmbeddingSource::Remote);
    }
    assert_eq!(invoker.call_count(), 2);
}

#[tokio::test]
async fn empty_text_is_a_client_error() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(
        invoker.clone(),
        Arc::new(MemoryEmbeddingCache::new()),
        sink,
    )
    .await;

    let err = gateway.embed(EmbedRequest::new("   ")).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn zero_deadline_times_out_before_any_remote_call() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(
        invoker.clone(),
        Arc::new(MemoryEmbeddingCache::new()),
        sink,
    )
    .await;

    let err = gateway
        .embed(EmbedRequest::new("text").deadline(Duration::ZERO))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn down_cache_degrades_to_uncached_compute() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker.clone(), Arc::new(DownCache), sink.clone()).await;

    let result = gateway
        .embed(EmbedRequest::new("hello world"))
        .await
        .unwrap();
    assert_eq!(result.source, EmbeddingSource::Remote);
    assert_eq!(result.vector.len(), DIM);
    assert_eq!(result.cache_id, None);
    assert_eq!(invoker.call_count(), 1);

    gateway.close().await;
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
}

#[tokio::test]
async fn dimension_mismatch_on_read_is_protocol_and_keeps_the_row() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let cache = Arc::new(MemoryEmbeddingCache::new());
    // Stored row has 3 dims; the model declares 1536.
    let key = CacheKey::compute("short vec", DEFAULT_EMBED_MODEL, "1");
    cache
        .put(CachedEmbedding::new(
            key.hash.to_vec(),
            key.text,
            vec![0.1, 0.2, 0.3],
            DEFAULT_EMBED_MODEL,
            "1",
            Utc::now(),
        ))
        .await
        .unwrap();
    let gateway = gateway_with(invoker.clone(), cache.clone(), sink).await;

    let err = gateway
        .embed(EmbedRequest::new("short vec").model(DEFAULT_EMBED_MODEL))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    // The row is not implicitly deleted.
    assert_eq!(cache.len(), 1);
    assert_eq!(invoker.call_count(), 0);
}

#[tokio::test]
async fn embed_batch_outcomes_are_independent() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink).await;

    let outcomes = gateway
        .embed_batch(vec![
            EmbedRequest::new("first"),
            EmbedRequest::new(""),
            EmbedRequest::new("third"),
        ])
        .await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes[0].is_ok());
    assert_eq!(outcomes[1].as_ref().unwrap_err().kind(), ErrorKind::Client);
    assert!(outcomes[2].is_ok());
}

// ============================================================================
// Generation
// ============================================================================

#[tokio::test]
async fn generate_success_has_consistent_token_usage() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink.clone()).await;

    let response = gateway
        .generate(GenerateRequest::new(
            "hi",
            "anthropic.claude-3-haiku-20240307-v1:0",
        ))
        .await;

    assert!(response.success);
    assert_eq!(response.content, "the answer");
    assert_eq!(
        response.token_usage.total,
        response.token_usage.input + response.token_usage.output
    );

    gateway.close().await;
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].success);
    assert_eq!(records[0].input_tokens, 10);
}

#[tokio::test]
async fn unknown_model_fails_in_band_with_audit() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(
        invoker.clone(),
        Arc::new(MemoryEmbeddingCache::new()),
        sink.clone(),
    )
    .await;

    let response = gateway
        .generate(GenerateRequest::new("hi", "made-up-model"))
        .await;

    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Client));
    assert!(response.content.is_empty());
    assert_eq!(invoker.call_count(), 0);

    gateway.close().await;
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert!(!records[0].success);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Client));
}

#[tokio::test]
async fn max_tokens_one_is_well_formed() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink).await;

    let response = gateway
        .generate(
            GenerateRequest::new("hi", "anthropic.claude-3-haiku-20240307-v1:0").max_tokens(1),
        )
        .await;
    assert!(response.success);
}

#[tokio::test]
async fn deadline_is_respected_within_tolerance() {
    let invoker = Arc::new(FakeInvoker::with_work(Duration::from_millis(500)));
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink.clone()).await;

    let started = std::time::Instant::now();
    let response = gateway
        .generate(
            GenerateRequest::new("hi", "anthropic.claude-3-haiku-20240307-v1:0")
                .deadline(Duration::from_millis(100)),
        )
        .await;
    let elapsed = started.elapsed();

    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Timeout));
    assert!(elapsed >= Duration::from_millis(90), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_millis(250), "elapsed {elapsed:?}");

    gateway.close().await;
    let records = sink.records.lock().unwrap();
    assert!(!records[0].success);
    assert_eq!(records[0].error_kind, Some(ErrorKind::Timeout));
}

#[tokio::test]
async fn invoke_returns_bare_content() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink).await;

    let content = gateway
        .invoke(
            "anthropic.claude-3-haiku-20240307-v1:0",
            "hi",
            InvokeOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(content, "the answer");
}

#[tokio::test]
async fn invoke_surfaces_typed_errors() {
    let invoker = Arc::new(FakeInvoker::new());
    let sink = Arc::new(CollectingSink::default());
    let gateway = gateway_with(invoker, Arc::new(MemoryEmbeddingCache::new()), sink).await;

    let err = gateway
        .invoke("made-up-model", "hi", InvokeOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
}
