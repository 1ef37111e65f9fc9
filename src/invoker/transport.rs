//! Provider transports.
//!
//! Two ways to reach the model provider, selected by configuration:
//!
//! - [`SigV4Transport`] — the AWS SDK runtime client; request signing is
//!   handled by the resolved credential chain.
//! - [`HttpTransport`] — plain HTTPS with a bearer token against a
//!   Bedrock-compatible gateway. Same paths, same bodies; this is also
//!   the transport the wiremock tests drive.
//!
//! Both return the raw response body; the family codecs own the JSON.
//! Error classification follows one table: network trouble and 5xx are
//! `Transient`, 429 is `RateLimited` (with any `Retry-After` hint),
//! other 4xx are `Client`, credential rejections are `Auth`, and an
//! elapsed call budget is `Timeout`.

use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_bedrockruntime::error::SdkError;
use aws_sdk_bedrockruntime::operation::invoke_model::InvokeModelError;
use aws_sdk_bedrockruntime::primitives::Blob;
use reqwest::StatusCode;

use crate::config::TimeoutProfile;
use crate::{MimirError, Result};

/// Low-level model invocation: bytes in, bytes out.
#[async_trait]
pub trait ProviderTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Post a request body to a model and return the raw response body.
    /// `call_budget` bounds the whole call.
    async fn invoke(&self, model_id: &str, body: Vec<u8>, call_budget: Duration) -> Result<Vec<u8>>;
}

// ============================================================================
// SigV4 transport (AWS SDK)
// ============================================================================

/// Transport backed by the SDK runtime client (SigV4-signed requests).
pub struct SigV4Transport {
    client: aws_sdk_bedrockruntime::Client,
}

impl SigV4Transport {
    pub fn new(client: aws_sdk_bedrockruntime::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProviderTransport for SigV4Transport {
    fn name(&self) -> &str {
        "provider-sigv4"
    }

    async fn invoke(&self, model_id: &str, body: Vec<u8>, call_budget: Duration) -> Result<Vec<u8>> {
        let call = self
            .client
            .invoke_model()
            .model_id(model_id)
            .content_type("application/json")
            .accept("application/json")
            .body(Blob::new(body))
            .send();

        let output = match tokio::time::timeout(call_budget, call).await {
            Err(_) => {
                return Err(MimirError::Timeout {
                    elapsed_ms: call_budget.as_millis() as u64,
                });
            }
            Ok(result) => result.map_err(classify_sdk_error)?,
        };
        Ok(output.body.into_inner())
    }
}

fn classify_sdk_error(err: SdkError<InvokeModelError>) -> MimirError {
    match &err {
        SdkError::ServiceError(ctx) => {
            let service_err = ctx.err();
            if service_err.is_throttling_exception() {
                MimirError::RateLimited { retry_after: None }
            } else if service_err.is_access_denied_exception() {
                MimirError::Auth {
                    dependency: "provider".into(),
                }
            } else if service_err.is_validation_exception()
                || service_err.is_resource_not_found_exception()
            {
                MimirError::Client(redact(&err))
            } else {
                // Internal, unavailable, model-timeout: dependency-side.
                MimirError::Transient(redact(&err))
            }
        }
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => {
            MimirError::Transient(redact(&err))
        }
        SdkError::ConstructionFailure(_) => MimirError::Client(redact(&err)),
        _ => MimirError::Transient(redact(&err)),
    }
}

/// Keep the error class, drop anything that could carry request or
/// credential material.
fn redact(err: &SdkError<InvokeModelError>) -> String {
    match err {
        SdkError::ServiceError(ctx) => format!("provider error: {}", ctx.err()),
        SdkError::DispatchFailure(_) => "provider unreachable".to_string(),
        SdkError::TimeoutError(_) => "provider call timed out".to_string(),
        SdkError::ResponseError(_) => "provider returned an unreadable response".to_string(),
        SdkError::ConstructionFailure(_) => "request could not be constructed".to_string(),
        _ => "provider call failed".to_string(),
    }
}

// ============================================================================
// Bearer-token HTTP transport
// ============================================================================

/// Transport for Bedrock-compatible gateways that take a bearer token.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    bearer_token: String,
}

impl HttpTransport {
    /// Build the transport. The connect budget comes from the timeout
    /// profile; per-call read budgets are passed to each invoke.
    pub fn new(
        base_url: impl Into<String>,
        bearer_token: impl Into<String>,
        timeouts: &TimeoutProfile,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeouts.connect())
            .build()
            .map_err(|e| MimirError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bearer_token: bearer_token.into(),
        })
    }
}

#[async_trait]
impl ProviderTransport for HttpTransport {
    fn name(&self) -> &str {
        "provider-http"
    }

    async fn invoke(&self, model_id: &str, body: Vec<u8>, call_budget: Duration) -> Result<Vec<u8>> {
        let url = format!("{}/model/{}/invoke", self.base_url, model_id);
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.bearer_token)
            .header("content-type", "application/json")
            .body(body)
            .timeout(call_budget)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MimirError::Timeout {
                        elapsed_ms: call_budget.as_millis() as u64,
                    }
                } else {
                    MimirError::Transient("provider unreachable".to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|_| MimirError::Transient("response body read failed".into()))?;
            return Ok(bytes.to_vec());
        }

        match status {
            StatusCode::TOO_MANY_REQUESTS => Err(MimirError::RateLimited {
                retry_after: parse_retry_after(&response),
            }),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(MimirError::Auth {
                dependency: "provider".into(),
            }),
            s if s.is_client_error() => {
                let detail = response.text().await.unwrap_or_default();
                let detail = detail.chars().take(200).collect::<String>();
                Err(MimirError::Client(format!("provider rejected request ({s}): {detail}")))
            }
            s => Err(MimirError::Transient(format!("provider returned {s}"))),
        }
    }
}

fn parse_retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}
