//! Download engine.
//!
//! Executes a [`TransferPlan`] against a [`RemoteSource`]:
//!
//! 1. Reconcile the integrity log against the plan. Chunks whose latest
//!    record satisfies the plan, and was written into the same output
//!    directory, are skipped; everything else is fetched.
//! 2. Fetch the remaining chunks through a bounded pool
//!    (`buffer_unordered(concurrency)`). Each attempt records `InFlight`,
//!    then `Verified` or `Failed`, durably and in that order.
//! 3. Retry failed chunks with exponential backoff until the attempt limit,
//!    after which the chunk stays `Failed` and the transfer is incomplete.
//! 4. Once every chunk is verified, digest the whole artifact. A mismatch
//!    against the plan's artifact digest invalidates every chunk and forces
//!    one full re-fetch pass.
//! 5. Write the manifest, move the artifact into place and build the report.
//!
//! Chunks are written in place at their offset into a pre-sized
//! `<id>.bin.partial` file, so a verified chunk needs no further assembly.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::checksum::{ChecksumVerifier, Digest, DIGEST_ALGORITHM};
use super::integrity_log::{ChunkRecord, ChunkState, IntegrityLog, LogError};
use super::lock::{LockError, TransferRegistry};
use super::output::{artifact_path, partial_path, Manifest, ManifestChunk, OutputError, MANIFEST_VERSION};
use super::plan::{ChunkSpec, TransferPlan};
use super::progress::{ProgressEvent, ProgressSink, TransferCounters};
use super::retry::RetryPolicy;
use crate::report::{FinalStatus, Report, ReportBuilder};
use crate::source::{RemoteError, RemoteSource};

/// Default worker pool size.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Upper bound on the worker pool size.
pub const MAX_CONCURRENCY: usize = 64;

/// Errors from the download engine.
///
/// Per-chunk variants (`Remote`, `ShortRead`, `Integrity`) are absorbed by
/// the retry loop and end up in the integrity log; the rest abort the
/// transfer.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("backup {backup_id} is already being transferred ({holder})")]
    AlreadyInProgress { backup_id: String, holder: String },

    #[error(transparent)]
    Log(#[from] LogError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("chunk {chunk_index}: {source}")]
    Remote {
        chunk_index: u32,
        #[source]
        source: RemoteError,
    },

    #[error("chunk {chunk_index}: expected {expected} bytes, received {actual}")]
    ShortRead {
        chunk_index: u32,
        expected: u64,
        actual: u64,
    },

    #[error("chunk {chunk_index}: digest mismatch (expected {expected}, got {actual})")]
    Integrity {
        chunk_index: u32,
        expected: Digest,
        actual: Digest,
    },

    #[error("session expired during transfer")]
    SessionExpired,

    #[error("background task failed: {0}")]
    Task(String),
}

impl From<LockError> for TransferError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Held { backup_id, holder } => Self::AlreadyInProgress { backup_id, holder },
            LockError::Io { path, source } => Self::Io { path, source },
        }
    }
}

pub type TransferResult<T> = Result<T, TransferError>;

fn join_err(e: tokio::task::JoinError) -> TransferError {
    TransferError::Task(e.to_string())
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Worker pool size; also the cap on concurrent range requests.
    pub concurrency: usize,
    /// Per-chunk retry policy.
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
        }
    }
}

// =============================================================================
// Reconciliation
// =============================================================================

/// Split of a plan's chunks against the integrity log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Chunks that need fetching, in plan order.
    pub to_fetch: Vec<ChunkSpec>,
    /// Chunks already verified, with their recorded digests.
    pub skipped: Vec<(ChunkSpec, Digest)>,
}

/// Partition `plan` using the latest log records.
pub fn reconcile(plan: &TransferPlan, records: &BTreeMap<u32, ChunkRecord>) -> Reconciliation {
    let mut result = Reconciliation::default();
    for chunk in &plan.chunks {
        match records.get(&chunk.index) {
            Some(record) if record.satisfies(chunk, &plan.output_dir) => {
                if let Some(digest) = record.digest {
                    result.skipped.push((chunk.clone(), digest));
                    continue;
                }
                result.to_fetch.push(chunk.clone());
            }
            _ => result.to_fetch.push(chunk.clone()),
        }
    }
    result
}

/// A record for `chunk`, scoped to the plan's output directory.
fn chunk_record(plan: &TransferPlan, chunk: &ChunkSpec, state: ChunkState, attempts: u32) -> ChunkRecord {
    ChunkRecord::for_chunk(&plan.backup_id, chunk, state, attempts).with_output_dir(&plan.output_dir)
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkOutcome {
    Verified(u32, Digest),
    Failed,
    /// Not attempted (or abandoned between attempts) because of cancellation.
    Cancelled,
}

struct PassContext<'a> {
    plan: &'a TransferPlan,
    remote: &'a dyn RemoteSource,
    working: PathBuf,
    cancel: CancellationToken,
    session_expired: AtomicBool,
    counters: TransferCounters,
    sink: ProgressSink,
}

/// Executes transfer plans.
#[derive(Debug, Clone)]
pub struct DownloadEngine {
    log: Arc<IntegrityLog>,
    config: EngineConfig,
    registry: TransferRegistry,
    verifier: ChecksumVerifier,
}

impl DownloadEngine {
    /// Create an engine writing through `log`.
    pub fn new(log: Arc<IntegrityLog>, config: EngineConfig) -> Self {
        Self {
            log,
            config,
            registry: TransferRegistry::new(),
            verifier: ChecksumVerifier::new(),
        }
    }

    /// Share a transfer registry with other engines in this process.
    pub fn with_registry(mut self, registry: TransferRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn log(&self) -> &Arc<IntegrityLog> {
        &self.log
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `plan` against `remote`.
    ///
    /// Returns a report for every outcome the transfer itself decides
    /// (completed, incomplete, cancelled, session expired, integrity
    /// failure). `Err` means the transfer could not run or lost its
    /// durability guarantees: a second transfer of the same backup or
    /// output directory, or a failed log or output write.
    ///
    /// The log's append handle for the backup is released on return,
    /// whatever the outcome.
    pub async fn execute(
        &self,
        plan: &TransferPlan,
        remote: Arc<dyn RemoteSource>,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> TransferResult<Report> {
        let _lock = self.registry.acquire(&plan.backup_id, &plan.output_dir)?;
        let result = self.run_locked(plan, remote, cancel, progress).await;
        self.log.release(&plan.backup_id);
        result
    }

    async fn run_locked(
        &self,
        plan: &TransferPlan,
        remote: Arc<dyn RemoteSource>,
        cancel: CancellationToken,
        progress: Option<mpsc::Sender<ProgressEvent>>,
    ) -> TransferResult<Report> {
        let builder = ReportBuilder::new(&plan.backup_id, plan.total_bytes);

        let working = partial_path(&plan.output_dir, &plan.backup_id);
        let final_path = artifact_path(&plan.output_dir, &plan.backup_id);
        let had_output = self.prepare_working_file(&working, &final_path, plan.total_bytes).await?;

        let records = if had_output {
            self.load_state(&plan.backup_id).await?
        } else {
            // Verified records describe bytes that are no longer on disk.
            BTreeMap::new()
        };
        let reconciliation = reconcile(plan, &records);

        let ctx = PassContext {
            plan,
            remote: remote.as_ref(),
            working,
            cancel: cancel.child_token(),
            session_expired: AtomicBool::new(false),
            counters: TransferCounters::new(),
            sink: ProgressSink::new(progress),
        };

        info!(
            backup_id = %plan.backup_id,
            chunks = plan.chunk_count(),
            to_fetch = reconciliation.to_fetch.len(),
            skipped = reconciliation.skipped.len(),
            concurrency = self.concurrency(),
            "Starting transfer"
        );
        ctx.sink.emit(ProgressEvent::Started {
            backup_id: plan.backup_id.clone(),
            total_chunks: plan.chunk_count(),
            to_fetch: reconciliation.to_fetch.len(),
            total_bytes: plan.total_bytes,
        });

        let mut digests: BTreeMap<u32, Digest> = BTreeMap::new();
        for (chunk, digest) in &reconciliation.skipped {
            ctx.counters.record_skipped(chunk.len());
            ctx.sink.emit(ProgressEvent::ChunkSkipped {
                index: chunk.index,
                bytes: chunk.len(),
            });
            digests.insert(chunk.index, *digest);
        }

        let mut to_fetch = reconciliation.to_fetch;
        let mut reverified = false;
        let (status, artifact_digest) = loop {
            let outcomes = self.run_pass(&ctx, to_fetch).await?;

            let mut failed = 0;
            let mut cancelled = 0;
            for outcome in outcomes {
                match outcome {
                    ChunkOutcome::Verified(index, digest) => {
                        digests.insert(index, digest);
                    }
                    ChunkOutcome::Failed => failed += 1,
                    ChunkOutcome::Cancelled => cancelled += 1,
                }
            }

            if ctx.session_expired.load(Ordering::SeqCst) {
                break (FinalStatus::SessionExpired, None);
            }
            if cancelled > 0 {
                break (FinalStatus::Cancelled, None);
            }
            if failed > 0 {
                break (FinalStatus::Incomplete, None);
            }

            let actual = self.digest_artifact(&ctx.working).await?;
            match plan.artifact_digest {
                Some(expected) if !self.verifier.verify(&actual, &expected) => {
                    error!(
                        backup_id = %plan.backup_id,
                        expected = %expected,
                        actual = %actual,
                        "Artifact digest mismatch"
                    );
                    if reverified {
                        break (FinalStatus::IntegrityFailed, Some(actual));
                    }
                    reverified = true;
                    self.invalidate(plan).await?;
                    digests.clear();
                    to_fetch = plan.chunks.clone();
                }
                _ => break (FinalStatus::Completed, Some(actual)),
            }
        };

        let output_path = if status == FinalStatus::Completed {
            if let Some(artifact) = artifact_digest {
                self.write_manifest(plan, &digests, artifact, &final_path).await?;
            }
            self.finish_artifact(&ctx.working, &final_path).await?;
            if let Err(e) = self.compact(&plan.backup_id).await {
                warn!(backup_id = %plan.backup_id, error = %e, "Failed to compact integrity log");
            }
            Some(final_path)
        } else {
            Some(ctx.working.clone())
        };

        let chunks_ok = digests.len();
        let chunks_failed = plan.chunk_count().saturating_sub(chunks_ok);
        let files_failed = if status == FinalStatus::Cancelled {
            ctx.counters.snapshot().chunks_failed
        } else {
            chunks_failed
        };

        ctx.sink.emit(ProgressEvent::Finished {
            chunks_ok,
            chunks_failed: files_failed,
        });

        let report = builder
            .chunk_outcomes(chunks_ok, files_failed)
            .counters(ctx.counters.snapshot())
            .artifact_digest(artifact_digest)
            .output_path(output_path)
            .finish(status);

        info!(
            backup_id = %plan.backup_id,
            status = %report.final_status,
            ok = report.files_ok,
            failed = report.files_failed,
            fetched = report.chunks_fetched,
            retries = report.retries,
            "Transfer finished"
        );
        Ok(report)
    }

    fn concurrency(&self) -> usize {
        self.config.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    async fn run_pass(
        &self,
        ctx: &PassContext<'_>,
        chunks: Vec<ChunkSpec>,
    ) -> TransferResult<Vec<ChunkOutcome>> {
        let results: Vec<TransferResult<ChunkOutcome>> = stream::iter(chunks)
            .map(|chunk| self.fetch_chunk(ctx, chunk))
            .buffer_unordered(self.concurrency())
            .collect()
            .await;
        results.into_iter().collect()
    }

    /// Fetch one chunk with retries.
    async fn fetch_chunk(
        &self,
        ctx: &PassContext<'_>,
        chunk: ChunkSpec,
    ) -> TransferResult<ChunkOutcome> {
        let backup_id = &ctx.plan.backup_id;
        let max_attempts = self.config.retry.max_attempts().max(1);

        for attempt in 1..=max_attempts {
            if ctx.cancel.is_cancelled() {
                return Ok(ChunkOutcome::Cancelled);
            }

            self.record(chunk_record(ctx.plan, &chunk, ChunkState::InFlight, attempt))
                .await?;
            ctx.sink.emit(ProgressEvent::ChunkStarted {
                index: chunk.index,
                attempt,
            });
            ctx.counters.record_request();

            let error = match self.attempt(ctx, &chunk).await {
                Ok(digest) => {
                    self.record(
                        chunk_record(ctx.plan, &chunk, ChunkState::Verified, attempt)
                            .with_digest(digest),
                    )
                    .await?;
                    ctx.counters.record_fetched(chunk.len());
                    ctx.sink.emit(ProgressEvent::ChunkVerified {
                        index: chunk.index,
                        bytes: chunk.len(),
                        digest,
                    });
                    debug!(backup_id = %backup_id, chunk = chunk.index, attempt, "Chunk verified");
                    return Ok(ChunkOutcome::Verified(chunk.index, digest));
                }
                Err(e @ (TransferError::Log(_) | TransferError::Task(_))) => return Err(e),
                Err(e) => e,
            };

            self.record(
                chunk_record(ctx.plan, &chunk, ChunkState::Failed, attempt)
                    .with_error(error.to_string()),
            )
            .await?;

            if matches!(error, TransferError::SessionExpired) {
                warn!(backup_id = %backup_id, chunk = chunk.index, "Session expired, aborting transfer");
                ctx.session_expired.store(true, Ordering::SeqCst);
                ctx.cancel.cancel();
                ctx.sink.emit(ProgressEvent::ChunkFailed {
                    index: chunk.index,
                    attempt,
                    error: error.to_string(),
                    terminal: true,
                });
                return Ok(ChunkOutcome::Cancelled);
            }

            let terminal = attempt == max_attempts;
            match &error {
                TransferError::Integrity { .. } => {
                    warn!(backup_id = %backup_id, chunk = chunk.index, attempt, error = %error, "Chunk failed verification")
                }
                _ => {
                    warn!(backup_id = %backup_id, chunk = chunk.index, attempt, error = %error, "Chunk fetch failed")
                }
            }
            ctx.sink.emit(ProgressEvent::ChunkFailed {
                index: chunk.index,
                attempt,
                error: error.to_string(),
                terminal,
            });
            if terminal {
                break;
            }

            ctx.counters.record_retry();
            if let Some(delay) = self.config.retry.delay_for_attempt(attempt) {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.cancel.cancelled() => {
                        return Ok(ChunkOutcome::Cancelled);
                    }
                }
            }
        }

        error!(
            backup_id = %backup_id,
            chunk = chunk.index,
            attempts = max_attempts,
            "Chunk failed after all attempts"
        );
        ctx.counters.record_failed();
        Ok(ChunkOutcome::Failed)
    }

    /// One fetch attempt: request, verify, write in place.
    async fn attempt(&self, ctx: &PassContext<'_>, chunk: &ChunkSpec) -> TransferResult<Digest> {
        let bytes = ctx
            .remote
            .fetch_range(&ctx.plan.backup_id, chunk.start, chunk.end)
            .await
            .map_err(|source| match source {
                RemoteError::SessionExpired => TransferError::SessionExpired,
                source => TransferError::Remote {
                    chunk_index: chunk.index,
                    source,
                },
            })?;

        if bytes.len() as u64 != chunk.len() {
            return Err(TransferError::ShortRead {
                chunk_index: chunk.index,
                expected: chunk.len(),
                actual: bytes.len() as u64,
            });
        }

        let verifier = self.verifier;
        let path = ctx.working.clone();
        let chunk = chunk.clone();
        tokio::task::spawn_blocking(move || verify_and_write(verifier, &path, &chunk, bytes))
            .await
            .map_err(join_err)?
    }

    async fn record(&self, record: ChunkRecord) -> TransferResult<()> {
        let log = Arc::clone(&self.log);
        tokio::task::spawn_blocking(move || log.record_state(&record))
            .await
            .map_err(join_err)?
            .map_err(TransferError::from)
    }

    async fn load_state(&self, backup_id: &str) -> TransferResult<BTreeMap<u32, ChunkRecord>> {
        let log = Arc::clone(&self.log);
        let backup_id = backup_id.to_string();
        tokio::task::spawn_blocking(move || log.load_state(&backup_id))
            .await
            .map_err(join_err)?
            .map_err(TransferError::from)
    }

    async fn compact(&self, backup_id: &str) -> TransferResult<usize> {
        let log = Arc::clone(&self.log);
        let backup_id = backup_id.to_string();
        tokio::task::spawn_blocking(move || log.compact(&backup_id))
            .await
            .map_err(join_err)?
            .map_err(TransferError::from)
    }

    /// Mark every chunk `Pending` after a whole-artifact mismatch.
    async fn invalidate(&self, plan: &TransferPlan) -> TransferResult<()> {
        warn!(
            backup_id = %plan.backup_id,
            chunks = plan.chunk_count(),
            "Invalidating all chunks for re-verification"
        );
        for chunk in &plan.chunks {
            self.record(
                chunk_record(plan, chunk, ChunkState::Pending, 0)
                    .with_error("artifact digest mismatch"),
            )
            .await?;
        }
        Ok(())
    }

    /// Make sure a pre-sized working file exists.
    ///
    /// Returns whether earlier output (partial or final) was found. A
    /// completed artifact is moved back to the working name so a rerun
    /// re-verifies it the same way as a partial one.
    async fn prepare_working_file(
        &self,
        working: &Path,
        final_path: &Path,
        total_bytes: u64,
    ) -> TransferResult<bool> {
        let working = working.to_path_buf();
        let final_path = final_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> TransferResult<bool> {
            let io_err = |path: &Path| {
                let path = path.to_path_buf();
                move |source: io::Error| TransferError::Io { path, source }
            };

            let had_output = if working.exists() {
                true
            } else if final_path.exists() {
                fs::rename(&final_path, &working).map_err(io_err(&working))?;
                true
            } else {
                false
            };

            let file = OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&working)
                .map_err(io_err(&working))?;
            file.set_len(total_bytes).map_err(io_err(&working))?;
            file.sync_all().map_err(io_err(&working))?;
            Ok(had_output)
        })
        .await
        .map_err(join_err)?
    }

    async fn digest_artifact(&self, path: &Path) -> TransferResult<Digest> {
        let verifier = self.verifier;
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            verifier
                .digest_file(&path)
                .map_err(|source| TransferError::Io { path, source })
        })
        .await
        .map_err(join_err)?
    }

    async fn write_manifest(
        &self,
        plan: &TransferPlan,
        digests: &BTreeMap<u32, Digest>,
        artifact_digest: Digest,
        final_path: &Path,
    ) -> TransferResult<()> {
        let chunks = plan
            .chunks
            .iter()
            .filter_map(|chunk| {
                digests.get(&chunk.index).map(|digest| ManifestChunk {
                    index: chunk.index,
                    start: chunk.start,
                    end: chunk.end,
                    digest: *digest,
                })
            })
            .collect();
        let manifest = Manifest {
            format_version: MANIFEST_VERSION,
            backup_id: plan.backup_id.clone(),
            device_name: plan.device_name.clone(),
            created_at: plan.created_at,
            algorithm: DIGEST_ALGORITHM.to_string(),
            chunk_size: plan.chunk_size,
            total_bytes: plan.total_bytes,
            artifact_file: final_path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default(),
            artifact_digest,
            chunks,
            generator: format!("snapferry {}", crate::VERSION),
        };

        let output_dir = plan.output_dir.clone();
        tokio::task::spawn_blocking(move || manifest.write(&output_dir))
            .await
            .map_err(join_err)??;
        Ok(())
    }

    async fn finish_artifact(&self, working: &Path, final_path: &Path) -> TransferResult<()> {
        let working = working.to_path_buf();
        let final_path = final_path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            fs::rename(&working, &final_path).map_err(|source| TransferError::Io {
                path: final_path.clone(),
                source,
            })
        })
        .await
        .map_err(join_err)?
    }
}

fn verify_and_write(
    verifier: ChecksumVerifier,
    path: &Path,
    chunk: &ChunkSpec,
    bytes: Bytes,
) -> TransferResult<Digest> {
    let actual = verifier.digest(&bytes);
    if let Some(expected) = chunk.expected_digest {
        if !verifier.verify(&actual, &expected) {
            return Err(TransferError::Integrity {
                chunk_index: chunk.index,
                expected,
                actual,
            });
        }
    }

    let write = || -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(path)?;
        file.seek(SeekFrom::Start(chunk.start))?;
        file.write_all(&bytes)?;
        file.sync_data()
    };
    write().map_err(|source| TransferError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(actual)
}
