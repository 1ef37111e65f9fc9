//! Retry and circuit-breaking behaviour through the gateway.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use mimir::config::{Config, ModelSpec};
use mimir::deadline::Deadline;
use mimir::invoker::{Generation, ModelInvoker};
use mimir::{
    ErrorKind, Gateway, GenerateRequest, Mimir, MimirError, RetryPolicy, TokenUsage,
};

const MODEL: &str = "anthropic.claude-3-haiku-20240307-v1:0";

/// Fails with the scripted errors, then succeeds forever.
struct ScriptedInvoker {
    calls: AtomicU32,
    script: Mutex<Vec<MimirError>>,
}

impl ScriptedInvoker {
    fn new(mut script: Vec<MimirError>) -> Self {
        script.reverse(); // pop() yields in the given order
        Self {
            calls: AtomicU32::new(0),
            script: Mutex::new(script),
        }
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelInvoker for ScriptedInvoker {
    async fn generate(
        &self,
        _spec: &ModelSpec,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
        _deadline: Deadline,
    ) -> Result<Generation, MimirError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(Generation {
            content: "ok".to_string(),
            usage: TokenUsage::new(1, 1),
        })
    }

    async fn embed(
        &self,
        _spec: &ModelSpec,
        _text: &str,
        _deadline: Deadline,
    ) -> Result<Vec<f32>, MimirError> {
        Ok(vec![0.0; 1536])
    }
}

struct NullSink;

#[async_trait]
impl mimir::audit::AuditSink for NullSink {
    fn name(&self) -> &str {
        "null"
    }

    async fn append(&self, _records: &[mimir::types::AuditRecord]) -> Result<(), MimirError> {
        Ok(())
    }
}

async fn build_gateway(invoker: Arc<ScriptedInvoker>, retry: RetryPolicy) -> Gateway {
    let mut config = Config::default();
    config.audit.sink = "log".to_string();
    Mimir::builder()
        .config(config)
        .invoker(invoker)
        .cache(Arc::new(mimir::store::MemoryEmbeddingCache::new()))
        .audit_sink(Arc::new(NullSink))
        .retry(retry)
        .build()
        .await
        .unwrap()
}

fn rate_limited() -> MimirError {
    MimirError::RateLimited { retry_after: None }
}

#[tokio::test]
async fn two_429s_then_success_lands_on_attempt_three() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![rate_limited(), rate_limited()]));
    let gateway = build_gateway(
        invoker.clone(),
        RetryPolicy::new().jitter(false), // 200ms + 400ms deterministic backoff
    )
    .await;

    let started = Instant::now();
    let response = gateway
        .generate(GenerateRequest::new("hi", MODEL).deadline(Duration::from_secs(10)))
        .await;
    let elapsed = started.elapsed();

    assert!(response.success);
    assert_eq!(invoker.call_count(), 3);
    assert!(elapsed >= Duration::from_millis(400), "elapsed {elapsed:?}");
    assert!(elapsed <= Duration::from_secs(4), "elapsed {elapsed:?}");
    gateway.close().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![MimirError::Client("bad".into())]));
    let gateway = build_gateway(invoker.clone(), RetryPolicy::new().jitter(false)).await;

    let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Client));
    assert_eq!(invoker.call_count(), 1);
    gateway.close().await;
}

#[tokio::test]
async fn breaker_opens_after_threshold_and_short_circuits() {
    // Five consecutive provider failures (retry disabled so each request
    // is exactly one attempt) trip the default threshold of 5.
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        MimirError::Transient("500".into()),
        MimirError::Transient("500".into()),
        MimirError::Transient("500".into()),
        MimirError::Transient("500".into()),
        MimirError::Transient("500".into()),
    ]));
    let gateway = build_gateway(invoker.clone(), RetryPolicy::disabled()).await;

    for _ in 0..5 {
        let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
        assert!(!response.success);
        assert_eq!(response.error, Some(ErrorKind::Transient));
    }
    assert_eq!(invoker.call_count(), 5);

    // Breaker is now open: the next request short-circuits fast without
    // reaching the provider.
    let started = Instant::now();
    let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::DependencyOpen));
    assert_eq!(invoker.call_count(), 5);
    assert!(started.elapsed() < Duration::from_millis(50));
    gateway.close().await;
}

#[tokio::test]
async fn half_open_probe_closes_the_breaker_on_success() {
    let mut config = Config::default();
    config.audit.sink = "log".to_string();
    config.breaker.failure_threshold = 2;
    config.breaker.reset_timeout_secs = 0; // next call after opening probes

    let invoker = Arc::new(ScriptedInvoker::new(vec![
        MimirError::Transient("500".into()),
        MimirError::Transient("500".into()),
    ]));
    let gateway = Mimir::builder()
        .config(config)
        .invoker(invoker.clone())
        .cache(Arc::new(mimir::store::MemoryEmbeddingCache::new()))
        .audit_sink(Arc::new(NullSink))
        .retry(RetryPolicy::disabled())
        .build()
        .await
        .unwrap();

    for _ in 0..2 {
        let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
        assert!(!response.success);
    }

    // Probe is admitted (reset timeout elapsed) and succeeds: closed again.
    let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
    assert!(response.success);
    assert_eq!(invoker.call_count(), 3);

    // Closed breaker keeps admitting calls.
    let response = gateway.generate(GenerateRequest::new("hi", MODEL)).await;
    assert!(response.success);
    assert_eq!(invoker.call_count(), 4);
    gateway.close().await;
}

#[tokio::test]
async fn backoff_that_cannot_fit_the_deadline_times_out() {
    let invoker = Arc::new(ScriptedInvoker::new(vec![rate_limited()]));
    let gateway = build_gateway(
        invoker.clone(),
        RetryPolicy::new()
            .jitter(false)
            .base_delay(Duration::from_secs(10)),
    )
    .await;

    let response = gateway
        .generate(GenerateRequest::new("hi", MODEL).deadline(Duration::from_millis(200)))
        .await;
    assert!(!response.success);
    assert_eq!(response.error, Some(ErrorKind::Timeout));
    assert_eq!(invoker.call_count(), 1);
    gateway.close().await;
}
