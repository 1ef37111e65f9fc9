//! Generation request and response types

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::types::AuditRecord;

/// A generation request against a catalogued model.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Prompt text sent to the model.
    pub prompt: String,
    /// Catalogued model id (e.g. `anthropic.claude-3-sonnet`).
    pub model_id: String,
    /// Sampling temperature, clamped to `[0, 1]`.
    pub temperature: f32,
    /// Maximum completion tokens. Clamped to the model family cap.
    pub max_tokens: u32,
    /// Caller identity for the audit trail.
    pub user_id: Option<String>,
    /// Free-form reason recorded alongside the request.
    pub audit_reason: Option<String>,
    /// Total wall-clock budget including retries. `None` = profile default.
    pub deadline: Option<Duration>,
    /// Hint that the caller prefers the premium path over the cheap one.
    pub require_high_quality: bool,
}

impl GenerateRequest {
    /// Minimal request: prompt + model, defaults elsewhere.
    pub fn new(prompt: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model_id: model_id.into(),
            temperature: 0.7,
            max_tokens: 1024,
            user_id: None,
            audit_reason: None,
            deadline: None,
            require_high_quality: false,
        }
    }

    /// Set the sampling temperature.
    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 1.0);
        self
    }

    /// Set the completion token cap.
    pub fn max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    /// Attach a caller identity for audit.
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Attach an audit reason.
    pub fn audit_reason(mut self, reason: impl Into<String>) -> Self {
        self.audit_reason = Some(reason.into());
        self
    }

    /// Set the wall-clock deadline for the whole operation.
    pub fn deadline(mut self, d: Duration) -> Self {
        self.deadline = Some(d);
        self
    }

    /// Request the premium path.
    pub fn require_high_quality(mut self, yes: bool) -> Self {
        self.require_high_quality = yes;
        self
    }
}

/// Options for the `invoke` convenience wrapper.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub deadline: Option<Duration>,
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u32,
    pub output: u32,
    pub total: u32,
}

impl TokenUsage {
    /// Build usage from input/output counts; `total` is always the sum.
    pub fn new(input: u32, output: u32) -> Self {
        Self {
            input,
            output,
            total: input + output,
        }
    }
}

/// Outcome of a generation request.
///
/// Errors are carried in-band (`success = false`, `error` populated) so the
/// audit trail always accompanies the outcome; the façade never loses a
/// record to an early return.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    /// Model completion; empty on failure.
    pub content: String,
    pub success: bool,
    /// Model that served the request (may differ from the requested id
    /// when the catalog resolves an alias).
    pub model_used: String,
    pub processing_time_ms: f64,
    pub token_usage: TokenUsage,
    pub error: Option<ErrorKind>,
    pub audit: AuditRecord,
}
