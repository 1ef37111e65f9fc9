//! Circuit breaking and retry with jittered exponential backoff.
//!
//! One [`CircuitBreaker`] guards each external dependency. The common
//! Closed path is a single atomic load; state transitions take a
//! per-breaker mutex. Retry policy and breaker compose in
//! [`with_retry()`], which also enforces the caller's deadline budget:
//! a backoff that would outlive the deadline aborts with `Timeout`
//! instead of sleeping.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::BreakerSettings;
use crate::deadline::Deadline;
use crate::telemetry;
use crate::{MimirError, Result};

/// Breaker states. `Closed` passes calls, `Open` short-circuits them,
/// `HalfOpen` admits a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct BreakerInner {
    failure_count: u32,
    window_start: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Per-dependency circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    /// Mirror of the state for the lock-free Closed fast path.
    state: AtomicU8,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            state: AtomicU8::new(BreakerState::Closed.as_u8()),
            inner: Mutex::new(BreakerInner {
                failure_count: 0,
                window_start: None,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state without mutating anything.
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Gate a call. `Ok` admits it; `Err(DependencyOpen)` short-circuits.
    ///
    /// An `Open` breaker past its reset timeout transitions to `HalfOpen`
    /// and admits this caller as the probe; concurrent callers keep
    /// short-circuiting until the probe settles.
    pub fn check(&self) -> Result<()> {
        // Fast path: Closed with no contention.
        if self.state() == BreakerState::Closed {
            return Ok(());
        }

        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        match self.state() {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= Duration::from_secs(self.settings.reset_timeout_secs) {
                    self.transition(&mut inner, BreakerState::HalfOpen);
                    inner.probe_in_flight = true;
                    Ok(())
                } else {
                    Err(MimirError::DependencyOpen {
                        dependency: self.name.clone(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(MimirError::DependencyOpen {
                        dependency: self.name.clone(),
                    })
                } else {
                    inner.probe_in_flight = true;
                    Ok(())
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.probe_in_flight = false;
        inner.failure_count = 0;
        inner.window_start = None;
        if self.state() != BreakerState::Closed {
            self.transition(&mut inner, BreakerState::Closed);
        }
    }

    /// Record a failed call.
    ///
    /// Failures outside the rolling window restart the count; reaching the
    /// threshold within the window opens the breaker. A failed half-open
    /// probe re-opens immediately.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker lock poisoned");
        inner.probe_in_flight = false;
        match self.state() {
            BreakerState::HalfOpen => {
                inner.opened_at = Some(Instant::now());
                self.transition(&mut inner, BreakerState::Open);
            }
            BreakerState::Open => {}
            BreakerState::Closed => {
                let window = Duration::from_secs(self.settings.failure_window_secs);
                let now = Instant::now();
                match inner.window_start {
                    Some(start) if now.duration_since(start) <= window => {
                        inner.failure_count += 1;
                    }
                    _ => {
                        inner.window_start = Some(now);
                        inner.failure_count = 1;
                    }
                }
                if inner.failure_count >= self.settings.failure_threshold {
                    inner.opened_at = Some(now);
                    self.transition(&mut inner, BreakerState::Open);
                }
            }
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) {
        if to == BreakerState::Closed {
            inner.opened_at = None;
        }
        self.state.store(to.as_u8(), Ordering::Release);
        metrics::counter!(telemetry::BREAKER_TRANSITIONS_TOTAL,
            "dependency" => self.name.clone(),
            "to" => to.as_str(),
        )
        .increment(1);
    }
}

/// Retry policy for transient errors.
///
/// Backoff is `min(cap, base * 2^attempt)` plus uniform jitter, bounded by
/// the operation deadline.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts including the initial request. Default: 3.
    pub max_attempts: u32,
    /// Base delay before the first retry. Default: 200ms.
    pub base_delay: Duration,
    /// Cap on exponential growth. Default: 5s.
    pub max_delay: Duration,
    /// Whether to add uniform jitter in `[0, delay]`. Default: true.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn base_delay(mut self, d: Duration) -> Self {
        self.base_delay = d;
        self
    }

    pub fn max_delay(mut self, d: Duration) -> Self {
        self.max_delay = d;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Deterministic part of the delay for a 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Full delay: provider `retry_after` hint wins, otherwise backoff
    /// plus jitter.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }
        let base = self.delay_for_attempt(attempt);
        if self.jitter && !base.is_zero() {
            base + rand::thread_rng().gen_range(Duration::ZERO..=base)
        } else {
            base
        }
    }
}

/// Execute an async operation with breaker gating and retry.
///
/// Each attempt is gated by the breaker and recorded against it per
/// [`MimirError::counts_against_breaker()`]. Only transient errors are
/// retried, and only while the next backoff still fits inside `deadline`;
/// otherwise the call aborts with `Timeout`.
pub async fn with_retry<F, Fut, T>(
    policy: &RetryPolicy,
    breaker: &CircuitBreaker,
    deadline: Deadline,
    operation: &str,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if deadline.expired() {
            return Err(deadline.to_timeout());
        }
        breaker.check()?;

        match f().await {
            Ok(result) => {
                breaker.record_success();
                return Ok(result);
            }
            Err(e) => {
                if e.counts_against_breaker() {
                    breaker.record_failure();
                }
                if !e.is_transient() || attempt + 1 >= policy.max_attempts {
                    return Err(e);
                }

                metrics::counter!(telemetry::RETRIES_TOTAL,
                    "dependency" => breaker.name().to_owned(),
                    "operation" => operation.to_owned(),
                )
                .increment(1);

                let delay = policy.effective_delay(attempt, e.retry_after());
                if delay >= deadline.remaining() {
                    return Err(deadline.to_timeout());
                }
                warn!(
                    dependency = breaker.name(),
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
