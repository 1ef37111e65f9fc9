//! Telemetry metric name constants.
//!
//! Centralised metric names for mimir operations. Consumers install their
//! own `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation` — façade operation ("generate", "embed", "embed_batch")
//! - `family` — model family ("claude", "titan-text", "titan-embed", ...)
//! - `dependency` — breaker/probe target ("provider", "relational_store", "object_store")
//! - `source` — embedding origin ("cache", "local", "remote")
//! - `status` — outcome: "ok" or "error"

/// Total requests dispatched through the gateway façade.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "mimir_requests_total";

/// Request duration in seconds.
///
/// Labels: `operation`, `family`.
pub const REQUEST_DURATION_SECONDS: &str = "mimir_request_duration_seconds";

/// Total retry attempts (not counting the initial request).
///
/// Labels: `dependency`, `operation`.
pub const RETRIES_TOTAL: &str = "mimir_retries_total";

/// Total tokens consumed.
///
/// Labels: `family`, `direction` ("input" | "output").
pub const TOKENS_TOTAL: &str = "mimir_tokens_total";

/// Total embedding cache hits.
///
/// Labels: `layer` ("memory" | "store").
pub const CACHE_HITS_TOTAL: &str = "mimir_cache_hits_total";

/// Total embedding cache misses.
pub const CACHE_MISSES_TOTAL: &str = "mimir_cache_misses_total";

/// Total callers coalesced onto an already-in-flight computation.
pub const FLIGHT_COALESCED_TOTAL: &str = "mimir_flight_coalesced_total";

/// Breaker state transitions.
///
/// Labels: `dependency`, `to` ("closed" | "open" | "half_open").
pub const BREAKER_TRANSITIONS_TOTAL: &str = "mimir_breaker_transitions_total";

/// Audit records dropped because the queue was full.
pub const AUDIT_DROPPED_TOTAL: &str = "mimir_audit_dropped_total";

/// Embeddings served per source.
///
/// Labels: `source`.
pub const EMBED_SOURCE_TOTAL: &str = "mimir_embed_source_total";
