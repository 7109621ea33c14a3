//! Progress reporting for chunked transfers.
//!
//! Workers update shared atomic counters, which feed the final report, and
//! emit [`ProgressEvent`]s to an optional bounded channel for renderers.
//! Events are sent with `try_send`: a slow consumer loses events, it never
//! stalls a worker.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::trace;

use super::checksum::Digest;

/// Default capacity for progress channels.
pub const DEFAULT_PROGRESS_CAPACITY: usize = 256;

/// A transfer progress notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The transfer began; `to_fetch` of `total_chunks` need fetching.
    Started {
        backup_id: String,
        total_chunks: usize,
        to_fetch: usize,
        total_bytes: u64,
    },
    /// A chunk was already verified by an earlier run.
    ChunkSkipped { index: u32, bytes: u64 },
    /// A fetch attempt started.
    ChunkStarted { index: u32, attempt: u32 },
    /// A chunk was fetched and verified.
    ChunkVerified { index: u32, bytes: u64, digest: Digest },
    /// A fetch attempt failed; `terminal` when no attempts remain.
    ChunkFailed {
        index: u32,
        attempt: u32,
        error: String,
        terminal: bool,
    },
    /// The transfer ended.
    Finished { chunks_ok: usize, chunks_failed: usize },
}

/// Sender half used by the engine.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::Sender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn new(tx: Option<mpsc::Sender<ProgressEvent>>) -> Self {
        Self { tx }
    }

    /// Send an event without waiting. Dropped if the channel is full or closed.
    pub fn emit(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(event) {
                trace!(error = %e, "Progress event dropped");
            }
        }
    }
}

/// Create a bounded progress channel.
pub fn progress_channel(
    capacity: usize,
) -> (mpsc::Sender<ProgressEvent>, mpsc::Receiver<ProgressEvent>) {
    mpsc::channel(capacity.max(1))
}

/// Counters shared across workers.
#[derive(Debug, Default)]
pub struct TransferCounters {
    chunks_fetched: AtomicUsize,
    chunks_skipped: AtomicUsize,
    chunks_failed: AtomicUsize,
    bytes_fetched: AtomicU64,
    bytes_skipped: AtomicU64,
    range_requests: AtomicUsize,
    retries: AtomicUsize,
}

impl TransferCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.range_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_fetched(&self, bytes: u64) {
        self.chunks_fetched.fetch_add(1, Ordering::SeqCst);
        self.bytes_fetched.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_skipped(&self, bytes: u64) {
        self.chunks_skipped.fetch_add(1, Ordering::SeqCst);
        self.bytes_skipped.fetch_add(bytes, Ordering::SeqCst);
    }

    pub fn record_failed(&self) {
        self.chunks_failed.fetch_add(1, Ordering::SeqCst);
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            chunks_fetched: self.chunks_fetched.load(Ordering::SeqCst),
            chunks_skipped: self.chunks_skipped.load(Ordering::SeqCst),
            chunks_failed: self.chunks_failed.load(Ordering::SeqCst),
            bytes_fetched: self.bytes_fetched.load(Ordering::SeqCst),
            bytes_skipped: self.bytes_skipped.load(Ordering::SeqCst),
            range_requests: self.range_requests.load(Ordering::SeqCst),
            retries: self.retries.load(Ordering::SeqCst),
        }
    }
}

/// Plain copy of [`TransferCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub chunks_fetched: usize,
    pub chunks_skipped: usize,
    pub chunks_failed: usize,
    pub bytes_fetched: u64,
    pub bytes_skipped: u64,
    pub range_requests: usize,
    pub retries: usize,
}
