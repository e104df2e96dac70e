//! Span export: bounded queueing of closed spans and asynchronous,
//! best-effort delivery to a collector.
//!
//! Per span, the queue completes the `CLOSED -> EXPORTED` or
//! `CLOSED -> DROPPED` half of the span state machine. Spans can be
//! dropped three ways, each with its own monotonically increasing
//! counter: queue overflow, transport failure after the retry budget,
//! and unflushed spans discarded at shutdown or by an explicit clear.

mod transport;

pub use transport::{MemoryTransport, TcpTransport, Transport, TransportError};

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};

use tracewire_proto::dto::span::{ExportBatch, SpanRecord};

/// Tuning knobs for the exporter.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Maximum number of closed spans held in the queue.
    pub capacity: usize,
    /// Maximum spans per transport send.
    pub batch_size: usize,
    /// How often the worker flushes when the queue stays below a full
    /// batch.
    pub flush_interval: Duration,
    /// Retries after the first failed send of a batch.
    pub retry_limit: u32,
    /// Initial retry delay; doubles per retry.
    pub retry_backoff: Duration,
    /// Bound on the final drain at shutdown.
    pub shutdown_timeout: Duration,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        ExporterConfig {
            capacity: 2048,
            batch_size: 128,
            flush_interval: Duration::from_secs(1),
            retry_limit: 3,
            retry_backoff: Duration::from_millis(200),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

/// Monotonic exporter counters.
#[derive(Debug, Default)]
pub struct ExporterStats {
    exported: AtomicU64,
    dropped_overflow: AtomicU64,
    dropped_transport: AtomicU64,
    dropped_flush: AtomicU64,
}

impl ExporterStats {
    fn add_exported(&self, n: u64) {
        self.exported.fetch_add(n, Ordering::Relaxed);
    }

    fn add_dropped_overflow(&self, n: u64) {
        self.dropped_overflow.fetch_add(n, Ordering::Relaxed);
    }

    fn add_dropped_transport(&self, n: u64) {
        self.dropped_transport.fetch_add(n, Ordering::Relaxed);
    }

    fn add_dropped_flush(&self, n: u64) {
        self.dropped_flush.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            exported: self.exported.load(Ordering::Relaxed),
            dropped_overflow: self.dropped_overflow.load(Ordering::Relaxed),
            dropped_transport: self.dropped_transport.load(Ordering::Relaxed),
            dropped_flush: self.dropped_flush.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the exporter counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub exported: u64,
    pub dropped_overflow: u64,
    pub dropped_transport: u64,
    pub dropped_flush: u64,
}

impl StatsSnapshot {
    /// Spans dropped for any reason.
    pub fn dropped_total(&self) -> u64 {
        self.dropped_overflow + self.dropped_transport + self.dropped_flush
    }
}

#[derive(Debug)]
struct SinkShared {
    queue: Mutex<VecDeque<SpanRecord>>,
    capacity: usize,
    batch_size: usize,
    notify: Notify,
    stats: Arc<ExporterStats>,
}

/// Clone-able handle the propagator pushes closed spans into.
///
/// The queue is bounded at `capacity` spans. Overflow policy is
/// **drop-oldest**: a new record is always admitted, and the displaced
/// oldest record is dropped and counted. Recent spans are the ones a
/// collector is usually still waiting for.
#[derive(Debug, Clone)]
pub struct SpanSink {
    shared: Arc<SinkShared>,
}

impl SpanSink {
    fn new(config: &ExporterConfig, stats: Arc<ExporterStats>) -> Self {
        SpanSink {
            shared: Arc::new(SinkShared {
                queue: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
                capacity: config.capacity.max(1),
                batch_size: config.batch_size.max(1),
                notify: Notify::new(),
                stats,
            }),
        }
    }

    /// A sink with no worker behind it, for tests and diagnostics.
    /// Queued records are read back with [`SpanSink::drain_pending`].
    pub fn detached(capacity: usize) -> Self {
        let config = ExporterConfig {
            capacity,
            ..ExporterConfig::default()
        };
        Self::new(&config, Arc::new(ExporterStats::default()))
    }

    /// Accept one closed span. Never blocks the caller.
    pub fn offer(&self, record: SpanRecord) {
        let should_notify = {
            let mut queue = self.shared.queue.lock().unwrap();
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                self.shared.stats.add_dropped_overflow(1);
            }
            queue.push_back(record);
            queue.len() >= self.shared.batch_size
        };
        if should_notify {
            self.shared.notify.notify_one();
        }
    }

    /// Number of spans waiting for export.
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Snapshot-and-remove every queued record, bypassing the
    /// transport. Diagnostic spans taken this way count as exported.
    pub fn drain_pending(&self) -> Vec<SpanRecord> {
        let drained: Vec<SpanRecord> = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.drain(..).collect()
        };
        self.shared.stats.add_exported(drained.len() as u64);
        drained
    }

    /// Discard every queued record, counting them as dropped. Returns
    /// the number discarded.
    pub fn clear(&self) -> usize {
        let cleared = {
            let mut queue = self.shared.queue.lock().unwrap();
            let n = queue.len();
            queue.clear();
            n
        };
        self.shared.stats.add_dropped_flush(cleared as u64);
        cleared
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    fn take_batch(&self, max: usize) -> Vec<SpanRecord> {
        let mut queue = self.shared.queue.lock().unwrap();
        let take = queue.len().min(max);
        queue.drain(..take).collect()
    }

    async fn wakeup(&self) {
        self.shared.notify.notified().await;
    }
}

/// Background exporter: owns the worker thread that drains the sink
/// into the transport.
///
/// The worker runs a single-threaded tokio runtime on a dedicated
/// thread, so export I/O never borrows time from the traced call path
/// or from the host application's runtime.
#[derive(Debug)]
pub struct Exporter {
    sink: SpanSink,
    stats: Arc<ExporterStats>,
    shutdown_tx: watch::Sender<bool>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl Exporter {
    pub fn spawn(config: ExporterConfig, transport: Arc<dyn Transport>) -> anyhow::Result<Self> {
        let stats = Arc::new(ExporterStats::default());
        let sink = SpanSink::new(&config, stats.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker_sink = sink.clone();
        let worker = std::thread::Builder::new()
            .name("tracewire-exporter".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        log::error!("exporter runtime failed to start: {e}");
                        return;
                    }
                };
                runtime.block_on(worker_loop(worker_sink, transport, config, shutdown_rx));
            })?;

        Ok(Exporter {
            sink,
            stats,
            shutdown_tx,
            worker: Some(worker),
        })
    }

    pub fn sink(&self) -> SpanSink {
        self.sink.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Drain pending spans within the configured shutdown timeout, then
    /// stop the worker. Spans not flushed in time are dropped and
    /// counted; shutdown always completes.
    pub fn shutdown(mut self) {
        self.stop_worker();
    }

    fn stop_worker(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                log::error!("exporter worker panicked");
            }
        }
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        self.stop_worker();
    }
}

async fn worker_loop(
    sink: SpanSink,
    transport: Arc<dyn Transport>,
    config: ExporterConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut seq: u64 = 0;
    let mut ticker = tokio::time::interval(config.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = sink.wakeup() => {}
            _ = shutdown_rx.changed() => break,
        }
        flush_queue(&sink, transport.as_ref(), &config, &mut seq).await;
    }

    // Final drain, bounded so the process can still exit.
    let drain = flush_queue(&sink, transport.as_ref(), &config, &mut seq);
    if tokio::time::timeout(config.shutdown_timeout, drain)
        .await
        .is_err()
    {
        let remaining = sink.clear();
        log::warn!("exporter shutdown timed out, dropped {remaining} pending spans");
    } else {
        let remaining = sink.clear();
        if remaining > 0 {
            log::warn!("dropped {remaining} spans enqueued during shutdown drain");
        }
    }
}

async fn flush_queue(
    sink: &SpanSink,
    transport: &dyn Transport,
    config: &ExporterConfig,
    seq: &mut u64,
) {
    loop {
        let spans = sink.take_batch(config.batch_size);
        if spans.is_empty() {
            break;
        }
        let count = spans.len() as u64;
        let batch = ExportBatch::new(*seq, spans);
        *seq += 1;
        send_with_retry(sink, transport, config, &batch, count).await;
    }
}

async fn send_with_retry(
    sink: &SpanSink,
    transport: &dyn Transport,
    config: &ExporterConfig,
    batch: &ExportBatch,
    count: u64,
) {
    let mut backoff = config.retry_backoff;
    let mut attempt: u32 = 0;
    loop {
        match transport.send(batch).await {
            Ok(()) => {
                sink.shared.stats.add_exported(count);
                return;
            }
            Err(TransportError::Fatal(reason)) => {
                log::error!("dropping batch {}: {reason}", batch.seq);
                break;
            }
            Err(TransportError::Transient(reason)) => {
                if attempt >= config.retry_limit {
                    log::error!(
                        "dropping batch {} after {} retries: {reason}",
                        batch.seq,
                        config.retry_limit
                    );
                    break;
                }
                attempt += 1;
                log::warn!("export attempt {attempt} failed, retrying in {backoff:?}: {reason}");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
        }
    }
    sink.shared.stats.add_dropped_transport(count);
}
