//! Append-only audit recording and model-performance aggregation.
//!
//! Every outward call produces one [`AuditRecord`], including calls that
//! short-circuit at the breaker. Records flow through a bounded in-memory
//! queue to a batching writer task; when the queue is full the OLDEST
//! record is dropped and counted, and the caller is never blocked. Sink
//! failures are logged and swallowed: audit emission must not fail the
//! primary request.
//!
//! A periodic single-writer aggregation job folds recent records into the
//! `model_performance` table.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::object_store::ObjectStore;
use crate::telemetry;
use crate::types::AuditRecord;
use crate::Result;

/// Where audit batches land.
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    /// Append a batch. Implementations must be append-only.
    async fn append(&self, records: &[AuditRecord]) -> Result<()>;
}

// ============================================================================
// Sinks
// ============================================================================

/// Audit sink writing to the `audit_log` table.
pub struct RelationalAuditSink {
    pool: PgPool,
}

impl RelationalAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditSink for RelationalAuditSink {
    fn name(&self) -> &str {
        "relational"
    }

    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for record in records {
            sqlx::query(
                "INSERT INTO audit_log \
                   (request_id, timestamp, user_id, audit_reason, model_id, temperature, \
                    max_tokens, processing_time_ms, success, error_kind, error_detail, \
                    input_tokens, output_tokens) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            )
            .bind(record.request_id)
            .bind(record.timestamp)
            .bind(&record.user_id)
            .bind(&record.audit_reason)
            .bind(&record.model_id)
            .bind(record.temperature)
            .bind(record.max_tokens.map(|v| v as i32))
            .bind(record.processing_time_ms)
            .bind(record.success)
            .bind(record.error_kind.map(|k| k.to_string()))
            .bind(&record.error_detail)
            .bind(record.input_tokens as i32)
            .bind(record.output_tokens as i32)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Audit sink writing JSON-lines objects under an `audit/` prefix.
pub struct ObjectStoreAuditSink {
    store: ObjectStore,
}

impl ObjectStoreAuditSink {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl AuditSink for ObjectStoreAuditSink {
    fn name(&self) -> &str {
        "object_store"
    }

    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let mut body = Vec::new();
        for record in records {
            body.extend(serde_json::to_vec(record)?);
            body.push(b'\n');
        }
        let key = format!(
            "audit/{}-{}.jsonl",
            first.timestamp.format("%Y%m%dT%H%M%S%3f"),
            first.request_id
        );
        self.store.put_object(&key, body).await
    }
}

/// Fallback sink: structured log lines only.
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn append(&self, records: &[AuditRecord]) -> Result<()> {
        for record in records {
            info!(
                request_id = %record.request_id,
                model_id = %record.model_id,
                success = record.success,
                error_kind = record.error_kind.map(|k| k.to_string()).as_deref().unwrap_or("-"),
                processing_time_ms = record.processing_time_ms,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                "audit"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Recorder
// ============================================================================

struct Queue {
    buf: Mutex<VecDeque<AuditRecord>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
}

/// Non-blocking audit front door plus its batching writer task.
pub struct AuditRecorder {
    queue: Arc<Queue>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditRecorder {
    /// Start the recorder and its writer task.
    pub fn spawn(
        sink: Arc<dyn AuditSink>,
        queue_capacity: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let queue = Arc::new(Queue {
            buf: Mutex::new(VecDeque::with_capacity(queue_capacity)),
            capacity: queue_capacity.max(1),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let writer_queue = queue.clone();
        let writer = tokio::spawn(async move {
            loop {
                let batch: Vec<AuditRecord> = {
                    let mut buf = writer_queue.buf.lock().expect("audit lock poisoned");
                    let take = batch_size.min(buf.len());
                    buf.drain(..take).collect()
                };

                if !batch.is_empty() {
                    if let Err(e) = sink.append(&batch).await {
                        warn!(sink = sink.name(), error = %e, dropped = batch.len(),
                              "audit batch write failed");
                    }
                    continue;
                }

                if writer_queue.closed.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = writer_queue.notify.notified() => {}
                    _ = tokio::time::sleep(flush_interval) => {}
                }
            }
        });

        Self {
            queue,
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Enqueue a record. Never blocks; a full queue drops its oldest
    /// entry and bumps the drop counter.
    pub fn record(&self, record: AuditRecord) {
        {
            let mut buf = self.queue.buf.lock().expect("audit lock poisoned");
            if buf.len() >= self.queue.capacity {
                buf.pop_front();
                metrics::counter!(telemetry::AUDIT_DROPPED_TOTAL).increment(1);
            }
            buf.push_back(record);
        }
        self.queue.notify.notify_one();
    }

    /// Records waiting to be written.
    pub fn backlog(&self) -> usize {
        self.queue.buf.lock().expect("audit lock poisoned").len()
    }

    /// Drain the queue and stop the writer.
    pub async fn close(&self) {
        self.queue.closed.store(true, Ordering::Release);
        self.queue.notify.notify_one();
        let handle = self.writer.lock().expect("audit lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

// ============================================================================
// Aggregation
// ============================================================================

/// Fold audit records from the trailing `window` into `model_performance`.
///
/// Single-writer: run this from one place (the gateway's background task
/// or an operator cron), not concurrently.
pub async fn aggregate_model_performance(pool: &PgPool, window: Duration) -> Result<()> {
    let window_secs = window.as_secs() as f64;
    sqlx::query(
        "INSERT INTO model_performance \
           (model_id, avg_quality, avg_latency_ms, success_rate, sample_count, updated_at) \
         SELECT model_id, 0.0, AVG(processing_time_ms), \
                AVG(CASE WHEN success THEN 1.0 ELSE 0.0 END), COUNT(*), now() \
         FROM audit_log \
         WHERE timestamp > now() - make_interval(secs => $1) \
         GROUP BY model_id \
         ON CONFLICT (model_id) DO UPDATE SET \
           avg_latency_ms = EXCLUDED.avg_latency_ms, \
           success_rate = EXCLUDED.success_rate, \
           sample_count = EXCLUDED.sample_count, \
           updated_at = EXCLUDED.updated_at",
    )
    .bind(window_secs)
    .execute(pool)
    .await?;

    // Quality comes from the embedding rows, not the audit trail.
    sqlx::query(
        "UPDATE model_performance mp SET avg_quality = q.avg_quality \
         FROM (SELECT model_id, AVG(quality_score)::float8 AS avg_quality \
               FROM smart_embeddings GROUP BY model_id) q \
         WHERE mp.model_id = q.model_id",
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        appended: AtomicUsize,
        batches: AtomicUsize,
    }

    #[async_trait]
    impl AuditSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        async fn append(&self, records: &[AuditRecord]) -> Result<()> {
            self.appended.fetch_add(records.len(), Ordering::SeqCst);
            self.batches.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        async fn append(&self, _records: &[AuditRecord]) -> Result<()> {
            Err(crate::MimirError::BackingStoreUnavailable("down".into()))
        }
    }

    fn record() -> AuditRecord {
        AuditRecord::begin("test-model", Utc::now())
    }

    #[tokio::test]
    async fn records_flow_to_the_sink() {
        let sink = Arc::new(CountingSink {
            appended: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        });
        let recorder =
            AuditRecorder::spawn(sink.clone(), 100, 10, Duration::from_millis(5));
        for _ in 0..25 {
            recorder.record(record());
        }
        recorder.close().await;
        assert_eq!(sink.appended.load(Ordering::SeqCst), 25);
        assert_eq!(recorder.backlog(), 0);
    }

    #[tokio::test]
    async fn full_queue_drops_oldest_without_blocking() {
        let sink = Arc::new(CountingSink {
            appended: AtomicUsize::new(0),
            batches: AtomicUsize::new(0),
        });
        // Tiny queue, writer effectively stalled by a long flush interval
        // and no records to notify about yet.
        let recorder = AuditRecorder::spawn(sink.clone(), 4, 100, Duration::from_secs(3600));
        // Saturate synchronously before the writer can drain: record() is
        // sync, so no yield happens between these calls.
        for _ in 0..10 {
            recorder.record(record());
        }
        assert!(recorder.backlog() <= 4);
        recorder.close().await;
        // The sink received at most the queue capacity; the rest were
        // dropped oldest-first, and no call ever blocked.
        assert!(sink.appended.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test]
    async fn sink_failure_does_not_propagate() {
        let recorder =
            AuditRecorder::spawn(Arc::new(FailingSink), 100, 10, Duration::from_millis(5));
        recorder.record(record());
        // close() drains through the failing sink without erroring.
        recorder.close().await;
        assert_eq!(recorder.backlog(), 0);
    }
}
