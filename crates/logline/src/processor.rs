//! Batching consumers that drain the buffer into the storage sink.
//!
//! The pool runs `P` identical workers. Each worker polls the buffer
//! without blocking, accumulates records in a local batch, and flushes the
//! batch when it is full, when the batch timeout elapses, or on shutdown.
//! Workers coordinate through nothing but the shared buffer and sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::CircularBuffer;
use crate::record::{LogLevel, LogRecord};
use crate::storage::FileStorage;

/// A non-empty batch older than this is flushed regardless of size.
const BATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// Sleep between polls while the buffer is empty.
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Messages longer than this get tagged `truncated=true`.
const MESSAGE_TRUNCATION_BYTES: usize = 5_000;

/// Smallest batch target a worker will use.
const MIN_BATCH_SIZE: usize = 10;

#[derive(Debug, Default)]
pub struct ProcessorMetrics {
    records_processed: AtomicU64,
    batches_flushed: AtomicU64,
}

impl ProcessorMetrics {
    #[must_use]
    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn batches_flushed(&self) -> u64 {
        self.batches_flushed.load(Ordering::Relaxed)
    }
}

pub struct ProcessorPool {
    workers: JoinSet<()>,
    metrics: Arc<ProcessorMetrics>,
    cancel: CancellationToken,
}

impl ProcessorPool {
    /// Spawns `worker_count` workers consuming from `buffer` into `storage`.
    ///
    /// The per-worker batch target scales with the buffer so the pool can
    /// absorb a full buffer in a handful of flushes:
    /// `max(10, capacity / (10 * worker_count))`.
    #[must_use]
    pub fn start(
        buffer: Arc<CircularBuffer>,
        storage: Arc<FileStorage>,
        worker_count: usize,
        cancel: CancellationToken,
    ) -> Self {
        let worker_count = worker_count.max(1);
        let batch_size = MIN_BATCH_SIZE.max(buffer.capacity() / (worker_count * 10));
        let metrics = Arc::new(ProcessorMetrics::default());

        let mut workers = JoinSet::new();
        for idx in 0..worker_count {
            workers.spawn(run_worker(
                idx,
                batch_size,
                Arc::clone(&buffer),
                Arc::clone(&storage),
                Arc::clone(&metrics),
                cancel.clone(),
            ));
        }
        info!("processor pool started - workers: {worker_count}, batch size: {batch_size}");

        ProcessorPool {
            workers,
            metrics,
            cancel,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> Arc<ProcessorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Signals shutdown and waits for the workers to drain the buffer and
    /// flush their final batches, up to `budget`. Workers still running
    /// past the budget are aborted; whatever they held is lost.
    pub async fn shutdown(mut self, budget: Duration) {
        self.cancel.cancel();
        let drained = tokio::time::timeout(budget, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("processor shutdown budget exceeded, aborting remaining workers");
            self.workers.shutdown().await;
        }
    }
}

async fn run_worker(
    idx: usize,
    batch_size: usize,
    buffer: Arc<CircularBuffer>,
    storage: Arc<FileStorage>,
    metrics: Arc<ProcessorMetrics>,
    cancel: CancellationToken,
) {
    debug!("processor {idx} started");
    let mut batch: Vec<LogRecord> = Vec::with_capacity(batch_size);
    let mut last_flush = Instant::now();

    loop {
        match buffer.try_dequeue() {
            Some(record) => {
                batch.push(record);
                if batch.len() >= batch_size || last_flush.elapsed() >= BATCH_TIMEOUT {
                    flush_batch(idx, &mut batch, &storage, &metrics).await;
                    last_flush = Instant::now();
                }
            }
            None => {
                // on shutdown, keep polling until the buffer is drained
                if cancel.is_cancelled() {
                    break;
                }
                if !batch.is_empty() && last_flush.elapsed() >= BATCH_TIMEOUT {
                    flush_batch(idx, &mut batch, &storage, &metrics).await;
                    last_flush = Instant::now();
                }
                tokio::select! {
                    () = tokio::time::sleep(IDLE_POLL) => {}
                    () = cancel.cancelled() => {}
                }
            }
        }
    }

    if !batch.is_empty() {
        flush_batch(idx, &mut batch, &storage, &metrics).await;
    }
    debug!(
        "processor {idx} stopped - processed: {}, batches: {}",
        metrics.records_processed(),
        metrics.batches_flushed()
    );
}

async fn flush_batch(
    idx: usize,
    batch: &mut Vec<LogRecord>,
    storage: &FileStorage,
    metrics: &ProcessorMetrics,
) {
    for record in batch.iter_mut() {
        enrich(idx, record);
    }
    match storage.store_batch(batch).await {
        Ok(()) => {
            metrics
                .records_processed
                .fetch_add(batch.len() as u64, Ordering::Relaxed);
            metrics.batches_flushed.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            // durability is best effort; the batch is dropped
            error!("processor {idx}: dropping batch of {} records: {err}", batch.len());
        }
    }
    batch.clear();
}

fn enrich(worker: usize, record: &mut LogRecord) {
    record.insert_metadata("processor_thread", format!("processor-{worker}"));
    record.insert_metadata("processed_at", Utc::now().timestamp_millis().to_string());
    if record.message.len() > MESSAGE_TRUNCATION_BYTES {
        record.insert_metadata("truncated", "true");
    }
    if let Some(component) = classify_component(&record.message) {
        record.insert_metadata("component", component);
    }
    record.insert_metadata("severity", severity_tag(record.level));
}

fn classify_component(message: &str) -> Option<&'static str> {
    let message = message.to_lowercase();
    if message.contains("sql") || message.contains("database") || message.contains("query") {
        Some("database")
    } else if message.contains("http") || message.contains("request") || message.contains("response")
    {
        Some("web")
    } else if message.contains("memory") || message.contains("gc") || message.contains("heap") {
        Some("memory")
    } else if message.contains("security") || message.contains("auth") || message.contains("login")
    {
        Some("security")
    } else {
        None
    }
}

fn severity_tag(level: LogLevel) -> &'static str {
    if level >= LogLevel::Error {
        "high"
    } else if level == LogLevel::Warn {
        "medium"
    } else {
        "low"
    }
}
