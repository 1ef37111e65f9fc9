//! Process-wide session management for external clients.
//!
//! One [`SessionManager`] owns the credentialed clients for the model
//! provider (control plane + runtime), the object store, and the
//! relational pool. Construction is lazy and exactly-once per client:
//! concurrent first uses race through a `tokio::sync::OnceCell`, so one
//! construction wins and the rest share it. A failed construction is NOT
//! cached; the next caller retries, which lets transient credential
//! problems heal.
//!
//! Clients are never mutated after creation and are shared for the
//! process lifetime; `close()` drains the relational pool.

use std::time::Instant;

use aws_config::{BehaviorVersion, Region};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::Config;
use crate::types::DependencyHealth;
use crate::{MimirError, Result};

/// Lazily-initialized, thread-safe client pool.
pub struct SessionManager {
    config: Config,
    aws: OnceCell<aws_config::SdkConfig>,
    runtime: OnceCell<aws_sdk_bedrockruntime::Client>,
    control: OnceCell<aws_sdk_bedrock::Client>,
    object_store: OnceCell<aws_sdk_s3::Client>,
    pool: OnceCell<PgPool>,
}

impl SessionManager {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            aws: OnceCell::new(),
            runtime: OnceCell::new(),
            control: OnceCell::new(),
            object_store: OnceCell::new(),
            pool: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The shared SDK configuration: explicit credentials from the config
    /// when present, the ambient chain otherwise.
    async fn aws_config(&self) -> &aws_config::SdkConfig {
        self.aws
            .get_or_init(|| async {
                let provider = &self.config.provider;
                let mut loader = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(provider.region.clone()));
                if let (Some(key), Some(secret)) =
                    (&provider.access_key_id, &provider.secret_access_key)
                {
                    loader = loader.credentials_provider(
                        aws_sdk_bedrockruntime::config::Credentials::new(
                            key.clone(),
                            secret.clone(),
                            None,
                            None,
                            "mimir-config",
                        ),
                    );
                }
                if let Some(endpoint) = &provider.endpoint_url {
                    loader = loader.endpoint_url(endpoint.clone());
                }
                debug!(region = %provider.region, "resolved provider session");
                loader.load().await
            })
            .await
    }

    /// Runtime client used by the invoker (SigV4 path).
    pub async fn runtime_client(&self) -> &aws_sdk_bedrockruntime::Client {
        if let Some(client) = self.runtime.get() {
            return client;
        }
        let config = self.aws_config().await;
        self.runtime
            .get_or_init(|| async { aws_sdk_bedrockruntime::Client::new(config) })
            .await
    }

    /// Control-plane client used for catalog listing and health probes.
    pub async fn model_client(&self) -> &aws_sdk_bedrock::Client {
        if let Some(client) = self.control.get() {
            return client;
        }
        let config = self.aws_config().await;
        self.control
            .get_or_init(|| async { aws_sdk_bedrock::Client::new(config) })
            .await
    }

    /// Object store client. The bucket comes from configuration.
    pub async fn object_store_client(&self) -> &aws_sdk_s3::Client {
        if let Some(client) = self.object_store.get() {
            return client;
        }
        let base = self.aws_config().await;
        self.object_store
            .get_or_init(|| async {
                match &self.config.object_store.region {
                    Some(region) => {
                        let config = aws_sdk_s3::config::Builder::from(base)
                            .region(Region::new(region.clone()))
                            .build();
                        aws_sdk_s3::Client::from_conf(config)
                    }
                    None => aws_sdk_s3::Client::new(base),
                }
            })
            .await
    }

    /// Bounded relational pool.
    ///
    /// Connections are established lazily per checkout, so an unreachable
    /// store surfaces as `BackingStoreUnavailable` on use (and callers
    /// degrade) rather than failing construction. URL parse failures are
    /// surfaced and not cached, so later callers retry.
    pub async fn relational_pool(&self) -> Result<&PgPool> {
        self.pool
            .get_or_try_init(|| async {
                let settings = &self.config.pool;
                let url = self.config.relational_store.connection_url();
                PgPoolOptions::new()
                    .min_connections(settings.min_connections)
                    .max_connections(settings.max_connections)
                    .acquire_timeout(std::time::Duration::from_secs(
                        settings.checkout_timeout_secs,
                    ))
                    .connect_lazy(&url)
                    .map_err(|e| {
                        MimirError::Config(format!("invalid relational store URL: {e}"))
                    })
            })
            .await
    }

    /// Cheap non-mutating probe of one dependency.
    ///
    /// `name` is one of `provider`, `relational_store`, `object_store`.
    pub async fn probe(&self, name: &str) -> DependencyHealth {
        let started = Instant::now();
        let outcome: Result<String> = match name {
            "provider" => self.probe_provider().await,
            "relational_store" => self.probe_relational().await,
            "object_store" => self.probe_object_store().await,
            other => Err(MimirError::Client(format!("unknown dependency: {other}"))),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        match outcome {
            Ok(detail) => DependencyHealth {
                name: name.to_string(),
                ok: true,
                latency_ms,
                detail,
            },
            Err(e) => DependencyHealth {
                name: name.to_string(),
                ok: false,
                latency_ms,
                detail: e.to_string(),
            },
        }
    }

    /// Probe every configured dependency.
    pub async fn probe_all(&self) -> Vec<DependencyHealth> {
        let mut report = vec![
            self.probe("provider").await,
            self.probe("relational_store").await,
        ];
        if self.config.object_store.bucket.is_some() {
            report.push(self.probe("object_store").await);
        }
        report
    }

    async fn probe_provider(&self) -> Result<String> {
        let client = self.model_client().await;
        let listed = client
            .list_foundation_models()
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("provider probe failed: {e}")))?;
        Ok(format!(
            "{} models visible",
            listed.model_summaries().len()
        ))
    }

    async fn probe_relational(&self) -> Result<String> {
        let pool = self.relational_pool().await?;
        sqlx::query("SELECT 1").execute(pool).await?;
        Ok("select 1 ok".to_string())
    }

    async fn probe_object_store(&self) -> Result<String> {
        let bucket = self
            .config
            .object_store
            .bucket
            .as_ref()
            .ok_or_else(|| MimirError::Config("no object store bucket configured".into()))?;
        let client = self.object_store_client().await;
        client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| MimirError::Transient(format!("object store probe failed: {e}")))?;
        Ok(format!("bucket {bucket} reachable"))
    }

    /// Close pooled connections. Idempotent; clients constructed after
    /// this call would reconnect.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
        }
    }
}
