//! Audit trail and health report types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::breaker::BreakerState;
use crate::error::ErrorKind;

/// One append-only record per outward call, success or failure.
///
/// Records are immutable once written. Ordering is monotonic per
/// `request_id` but not globally total. Error detail never carries
/// credential material or internal stack frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub user_id: Option<String>,
    pub audit_reason: Option<String>,
    pub model_id: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub processing_time_ms: f64,
    pub success: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_detail: Option<String>,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl AuditRecord {
    /// A skeleton record with a fresh request id; the façade fills in the
    /// outcome fields when the operation settles.
    pub fn begin(model_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            timestamp: now,
            user_id: None,
            audit_reason: None,
            model_id: model_id.into(),
            temperature: None,
            max_tokens: None,
            processing_time_ms: 0.0,
            success: false,
            error_kind: None,
            error_detail: None,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Health of one external dependency, from a cheap non-mutating probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub name: String,
    pub ok: bool,
    pub latency_ms: f64,
    pub detail: String,
}

/// Breaker snapshot for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerHealth {
    pub name: String,
    pub state: BreakerState,
}

/// Aggregate health view returned by `Gateway::health()` and the CLI.
///
/// Pure observation: probes are read-only and the report never mutates
/// gateway state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub dependencies: Vec<DependencyHealth>,
    pub breakers: Vec<BreakerHealth>,
}

impl HealthReport {
    /// True when every probed dependency is reachable.
    pub fn all_ok(&self) -> bool {
        self.dependencies.iter().all(|d| d.ok)
    }
}
