//! Chunked, resumable and verified transfer of a backup artifact.
//!
//! The flow is plan, execute, report:
//!
//! - [`TransferPlanner`] checks the descriptor and the destination's free
//!   space and produces an immutable [`TransferPlan`] of chunk ranges.
//! - [`DownloadEngine`] executes the plan, consulting the [`IntegrityLog`]
//!   for chunks an earlier run already verified.
//! - The engine returns a [`crate::report::Report`].

mod checksum;
mod engine;
mod integrity_log;
mod lock;
mod output;
mod plan;
mod progress;
mod retry;
mod space;

pub use checksum::{ChecksumVerifier, Digest, ParseDigestError, DIGEST_ALGORITHM};
pub use engine::{
    reconcile, DownloadEngine, EngineConfig, Reconciliation, TransferError, TransferResult,
    DEFAULT_CONCURRENCY, MAX_CONCURRENCY,
};
pub use integrity_log::{ChunkRecord, ChunkState, IntegrityLog, LogError, LogResult, LogSummary};
pub use lock::{LockError, TransferLock, TransferRegistry, LOCK_FILE};
pub use output::{
    artifact_path, output_dir_for, partial_path, sanitize_component, verify_output, Manifest,
    ManifestChunk, OutputError, VerificationSummary, MANIFEST_FILE,
};
pub use plan::{
    required_space, ChunkSpec, ExpectedDigests, PlanError, PlannerConfig, TransferPlan,
    TransferPlanner, DEFAULT_CHUNK_SIZE, DEFAULT_SAFETY_MARGIN_BYTES, MIN_CHUNK_SIZE,
};
pub use progress::{
    progress_channel, CounterSnapshot, ProgressEvent, ProgressSink, TransferCounters,
    DEFAULT_PROGRESS_CAPACITY,
};
pub use retry::{
    RetryPolicy, DEFAULT_INITIAL_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_SECS,
};
pub use space::Quota;
