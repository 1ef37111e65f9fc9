//! Builder for configuring gateway instances.
//!
//! The builder resolves configuration, selects the provider transport
//! (bearer token → plain HTTP, otherwise SigV4), wires the cache, audit
//! sink, breakers, and optional background tasks, and hands back an
//! owned [`Gateway`]. There is no global singleton; embed the gateway in
//! whatever owns your process lifecycle. Tests swap any seam through the
//! same methods production uses.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::warn;

use super::Gateway;
use crate::audit::{
    AuditRecorder, AuditSink, LogAuditSink, ObjectStoreAuditSink, RelationalAuditSink,
    aggregate_model_performance,
};
use crate::breaker::{CircuitBreaker, RetryPolicy};
use crate::config::Config;
use crate::flight::SingleFlight;
use crate::invoker::{HttpTransport, ModelInvoker, RemoteInvoker, SigV4Transport};
use crate::local::LocalEmbedder;
use crate::object_store::ObjectStore;
use crate::router::Router;
use crate::session::SessionManager;
use crate::store::{EmbeddingCache, PgEmbeddingCache};
use crate::Result;

/// Trailing window the aggregation job folds into `model_performance`.
const AGGREGATION_WINDOW: Duration = Duration::from_secs(3600);

/// Main entry point for creating gateway instances.
pub struct Mimir;

impl Mimir {
    /// Create a new builder for configuring the gateway.
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::new()
    }
}

/// Builder for configuring gateway instances.
pub struct GatewayBuilder {
    config: Option<Config>,
    cache: Option<Arc<dyn EmbeddingCache>>,
    cache_disabled: bool,
    invoker: Option<Arc<dyn ModelInvoker>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    locals: Vec<Arc<dyn LocalEmbedder>>,
    retry: RetryPolicy,
    expiry_sweep: Option<Duration>,
    aggregation: Option<Duration>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            cache: None,
            cache_disabled: false,
            invoker: None,
            audit_sink: None,
            locals: Vec::new(),
            retry: RetryPolicy::default(),
            expiry_sweep: None,
            aggregation: None,
        }
    }

    /// Use an explicit configuration instead of the standard file/env
    /// resolution.
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Inject a cache backend (tests, or a non-default store).
    pub fn cache(mut self, cache: Arc<dyn EmbeddingCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Run without any embedding cache.
    pub fn without_cache(mut self) -> Self {
        self.cache_disabled = true;
        self
    }

    /// Inject a model invoker (tests inject fakes here).
    pub fn invoker(mut self, invoker: Arc<dyn ModelInvoker>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    /// Inject an audit sink.
    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    /// Register a local embedding backend. The first registered backend
    /// serves the fast path; all of them join the ensemble.
    pub fn local_backend(mut self, backend: Arc<dyn LocalEmbedder>) -> Self {
        self.locals.push(backend);
        self
    }

    /// Override the retry policy.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    /// Periodically remove expired cache rows.
    pub fn expiry_sweep(mut self, interval: Duration) -> Self {
        self.expiry_sweep = Some(interval);
        self
    }

    /// Periodically fold audit records into `model_performance`.
    pub fn aggregation(mut self, interval: Duration) -> Self {
        self.aggregation = Some(interval);
        self
    }

    /// Resolve everything and construct the gateway.
    pub async fn build(self) -> Result<Gateway> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load(None)?,
        };
        let session = Arc::new(SessionManager::new(config.clone()));

        let invoker: Arc<dyn ModelInvoker> = match self.invoker {
            Some(invoker) => invoker,
            None => {
                let transport: Arc<dyn crate::invoker::ProviderTransport> =
                    match &config.provider.bearer_token {
                        Some(token) => {
                            let base_url = config.provider.endpoint_url.clone().unwrap_or_else(
                                || {
                                    format!(
                                        "https://bedrock-runtime.{}.amazonaws.com",
                                        config.provider.region
                                    )
                                },
                            );
                            Arc::new(HttpTransport::new(base_url, token, &config.timeouts)?)
                        }
                        None => {
                            let client = session.runtime_client().await.clone();
                            Arc::new(SigV4Transport::new(client))
                        }
                    };
                Arc::new(RemoteInvoker::new(transport, config.timeouts.clone()))
            }
        };

        let cache: Option<Arc<dyn EmbeddingCache>> = if self.cache_disabled {
            None
        } else if let Some(cache) = self.cache {
            Some(cache)
        } else {
            match session.relational_pool().await {
                Ok(pool) => Some(Arc::new(PgEmbeddingCache::new(pool.clone()))),
                Err(e) => {
                    warn!(error = %e, "embedding cache unavailable, running uncached");
                    None
                }
            }
        };

        let audit_sink: Arc<dyn AuditSink> = match self.audit_sink {
            Some(sink) => sink,
            None => match config.audit.sink.as_str() {
                "log" => Arc::new(LogAuditSink),
                "object_store" => match &config.object_store.bucket {
                    Some(bucket) => {
                        let client = session.object_store_client().await.clone();
                        Arc::new(ObjectStoreAuditSink::new(ObjectStore::new(
                            client,
                            bucket.clone(),
                        )))
                    }
                    None => {
                        warn!("object_store audit sink configured without a bucket, using log");
                        Arc::new(LogAuditSink)
                    }
                },
                _ => match session.relational_pool().await {
                    Ok(pool) => Arc::new(RelationalAuditSink::new(pool.clone())),
                    Err(e) => {
                        warn!(error = %e, "relational audit sink unavailable, using log");
                        Arc::new(LogAuditSink)
                    }
                },
            },
        };

        let audit = AuditRecorder::spawn(
            audit_sink,
            config.audit.queue_capacity,
            config.audit.batch_size,
            Duration::from_millis(config.audit.flush_interval_ms),
        );

        let router = Router::new(
            config.model_catalog.clone(),
            config.provider.default_embedding_model.clone(),
        );
        let provider_breaker =
            Arc::new(CircuitBreaker::new("provider", config.breaker.clone()));
        let store_breaker =
            Arc::new(CircuitBreaker::new("relational_store", config.breaker.clone()));

        let mut tasks = Vec::new();
        if let (Some(interval), Some(cache)) = (self.expiry_sweep, cache.clone()) {
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if let Err(e) = cache.expire(Utc::now()).await {
                        warn!(error = %e, "cache expiry sweep failed");
                    }
                }
            }));
        }
        if let Some(interval) = self.aggregation {
            let session = session.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    match session.relational_pool().await {
                        Ok(pool) => {
                            if let Err(e) =
                                aggregate_model_performance(pool, AGGREGATION_WINDOW).await
                            {
                                warn!(error = %e, "model performance aggregation failed");
                            }
                        }
                        Err(e) => warn!(error = %e, "aggregation skipped, no pool"),
                    }
                }
            }));
        }

        Ok(Gateway {
            default_deadline: config.timeouts.default_deadline(),
            session,
            router,
            cache,
            invoker,
            locals: self.locals,
            flight: SingleFlight::new(),
            provider_breaker,
            store_breaker,
            retry: self.retry,
            audit,
            tasks: Mutex::new(tasks),
        })
    }
}
