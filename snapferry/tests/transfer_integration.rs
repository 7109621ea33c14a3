//! End-to-end transfer properties: privilege refusal, resume, idempotence,
//! corruption handling, free-space checks and transfer exclusivity.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use snapferry::index::{BackupIndexer, ListOutcome};
use snapferry::report::FinalStatus;
use snapferry::session::{DenialReason, Session, SessionGate};
use snapferry::source::{BackupDescriptor, BoxFuture, Origin, RawBackup, RemoteError, RemoteSource};
use snapferry::transfer::{
    ChecksumVerifier, ChunkState, DownloadEngine, EngineConfig, ExpectedDigests, IntegrityLog,
    PlanError, PlannerConfig, Quota, RetryPolicy, TransferError, TransferPlan, TransferPlanner,
    TransferRegistry,
};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const CHUNK: u64 = 1024;
const BACKUP_ID: &str = "00008030-001A";

/// In-memory source that counts range fetches.
struct MemorySource {
    origin: Origin,
    data: Vec<u8>,
    fetches: AtomicUsize,
    /// Chunks at or beyond this index always fail.
    fail_from_chunk: Option<u64>,
    /// This chunk is always returned with a flipped byte.
    corrupt_chunk: Option<u64>,
}

impl MemorySource {
    fn new(data: Vec<u8>) -> Self {
        Self {
            origin: Origin::Local,
            data,
            fetches: AtomicUsize::new(0),
            fail_from_chunk: None,
            corrupt_chunk: None,
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

impl RemoteSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    fn origin(&self) -> Origin {
        self.origin
    }

    fn list_backups<'a>(
        &'a self,
        _session: &'a Session,
    ) -> BoxFuture<'a, Result<Vec<RawBackup>, RemoteError>> {
        Box::pin(async move { Ok(vec![raw(self.data.len() as u64)]) })
    }

    fn fetch_range<'a>(
        &'a self,
        backup_id: &'a str,
        start: u64,
        end: u64,
    ) -> BoxFuture<'a, Result<Bytes, RemoteError>> {
        Box::pin(async move {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let chunk = start / CHUNK;
            if self.fail_from_chunk.is_some_and(|n| chunk >= n) {
                return Err(RemoteError::RangeUnavailable {
                    backup_id: backup_id.to_string(),
                    start,
                    end,
                    reason: "connection reset".to_string(),
                });
            }
            let mut bytes = self.data[start as usize..end as usize].to_vec();
            if self.corrupt_chunk == Some(chunk) {
                bytes[0] ^= 0x5a;
            }
            Ok(Bytes::from(bytes))
        })
    }
}

fn raw(size: u64) -> RawBackup {
    RawBackup {
        id: BACKUP_ID.to_string(),
        device_name: "Work Phone".to_string(),
        device_os_version: "17.2".to_string(),
        created_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap(),
        approx_size_bytes: size,
    }
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) % 253) as u8).collect()
}

fn session(privileged: bool) -> Session {
    let mut session = Session::new("alice", "tok", true, Utc::now() + chrono::Duration::hours(1));
    session.privileged_access_allowed = privileged;
    session
}

fn planner() -> TransferPlanner {
    TransferPlanner::new(PlannerConfig {
        chunk_size: CHUNK,
        safety_margin_bytes: 0,
    })
}

fn plan(dest: &Path, size: u64, expected: ExpectedDigests) -> TransferPlan {
    let descriptor = BackupDescriptor::new(raw(size), Origin::Local);
    planner()
        .plan_with_digests(&descriptor, dest, Quota::new(u64::MAX), expected)
        .unwrap()
}

fn engine(log_root: &Path, attempts: u32) -> DownloadEngine {
    DownloadEngine::new(
        Arc::new(IntegrityLog::open(log_root).unwrap()),
        EngineConfig {
            concurrency: 4,
            retry: RetryPolicy::with_delays(
                attempts,
                Duration::from_millis(1),
                Duration::from_millis(4),
            ),
        },
    )
}

fn expected_for(data: &[u8]) -> ExpectedDigests {
    let verifier = ChecksumVerifier::new();
    ExpectedDigests {
        chunk_size: Some(CHUNK),
        chunks: data.chunks(CHUNK as usize).map(|c| verifier.digest(c)).collect(),
        artifact: Some(verifier.digest(data)),
    }
}

#[test]
fn test_privileged_backup_is_never_plannable() {
    let temp = TempDir::new().unwrap();
    let descriptor = BackupDescriptor::new(raw(4096), Origin::RemotePrivileged);

    for config in [
        PlannerConfig::default(),
        PlannerConfig {
            chunk_size: CHUNK,
            safety_margin_bytes: 0,
        },
    ] {
        let err = TransferPlanner::new(config)
            .plan(&descriptor, temp.path(), Quota::new(u64::MAX))
            .unwrap_err();
        assert!(matches!(err, PlanError::NotDownloadable { .. }));
    }
}

#[tokio::test]
async fn test_completed_transfer_rerun_fetches_nothing() {
    let temp = TempDir::new().unwrap();
    let data = payload(10 * CHUNK as usize + 17);
    let plan = plan(&temp.path().join("out"), data.len() as u64, ExpectedDigests::default());
    let engine = engine(&temp.path().join("log"), 3);

    let first = Arc::new(MemorySource::new(data.clone()));
    let report = engine
        .execute(&plan, first.clone(), CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Completed);
    assert_eq!(first.fetches(), 11);

    let second = Arc::new(MemorySource::new(data));
    let report = engine
        .execute(&plan, second.clone(), CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Completed);
    assert_eq!(second.fetches(), 0);
    assert_eq!(report.chunks_skipped, 11);
    assert_eq!(report.chunks_fetched, 0);
}

#[tokio::test]
async fn test_repeated_runs_are_byte_identical() {
    let temp = TempDir::new().unwrap();
    let data = payload(6 * CHUNK as usize);
    let verifier = ChecksumVerifier::new();

    let mut outputs = Vec::new();
    for run in 0..2 {
        let root = temp.path().join(format!("run{}", run));
        let plan = plan(&root.join("out"), data.len() as u64, ExpectedDigests::default());
        let report = engine(&root.join("log"), 3)
            .execute(
                &plan,
                Arc::new(MemorySource::new(data.clone())),
                CancellationToken::new(),
                None,
            )
            .await
            .unwrap();
        let bytes = std::fs::read(report.output_path.unwrap()).unwrap();
        outputs.push((bytes, report.artifact_digest.unwrap()));
    }

    assert_eq!(outputs[0].0, outputs[1].0);
    assert_eq!(outputs[0].0, data);
    assert_eq!(outputs[0].1, outputs[1].1);
    assert_eq!(outputs[0].1, verifier.digest(&data));
}

#[tokio::test]
async fn test_interrupted_transfer_resumes_remaining_chunks() {
    let temp = TempDir::new().unwrap();
    let total_chunks = 8;
    let verified_before_crash = 5;
    let data = payload(total_chunks * CHUNK as usize);
    let out = temp.path().join("out");
    let log = temp.path().join("log");

    let broken = Arc::new(MemorySource {
        fail_from_chunk: Some(verified_before_crash as u64),
        ..MemorySource::new(data.clone())
    });
    let report = engine(&log, 1)
        .execute(
            &plan(&out, data.len() as u64, ExpectedDigests::default()),
            broken,
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Incomplete);
    assert_eq!(report.files_ok, verified_before_crash);

    // A new engine and a freshly built plan, as after a restart.
    let healthy = Arc::new(MemorySource::new(data.clone()));
    let report = engine(&log, 3)
        .execute(
            &plan(&out, data.len() as u64, ExpectedDigests::default()),
            healthy.clone(),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    assert_eq!(report.final_status, FinalStatus::Completed);
    assert_eq!(healthy.fetches(), total_chunks - verified_before_crash);
    assert_eq!(report.chunks_fetched, total_chunks - verified_before_crash);
    assert_eq!(report.chunks_skipped, verified_before_crash);
    assert_eq!(std::fs::read(report.output_path.unwrap()).unwrap(), data);
}

#[tokio::test]
async fn test_resume_does_not_trust_other_destination() {
    let temp = TempDir::new().unwrap();
    let total_chunks = 6;
    let data = payload(total_chunks * CHUNK as usize);
    let log = temp.path().join("log");
    let plan_a = plan(&temp.path().join("a"), data.len() as u64, ExpectedDigests::default());
    let plan_b = plan(&temp.path().join("b"), data.len() as u64, ExpectedDigests::default());

    let broken = Arc::new(MemorySource {
        fail_from_chunk: Some(2),
        ..MemorySource::new(data.clone())
    });
    let report = engine(&log, 1)
        .execute(&plan_a, broken, CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Incomplete);

    // Same backup, same log, another destination.
    let report = engine(&log, 3)
        .execute(
            &plan_b,
            Arc::new(MemorySource::new(data.clone())),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Completed);

    // B's verified records say nothing about A's bytes.
    let healthy = Arc::new(MemorySource::new(data.clone()));
    let report = engine(&log, 3)
        .execute(&plan_a, healthy.clone(), CancellationToken::new(), None)
        .await
        .unwrap();
    assert_eq!(report.final_status, FinalStatus::Completed);
    assert_eq!(healthy.fetches(), total_chunks);
    assert_eq!(report.chunks_skipped, 0);
    assert_eq!(std::fs::read(report.output_path.unwrap()).unwrap(), data);
}

#[tokio::test]
async fn test_corrupted_chunk_retried_then_failed() {
    let temp = TempDir::new().unwrap();
    let data = payload(4 * CHUNK as usize);
    let attempts = 4;
    let plan = plan(&temp.path().join("out"), data.len() as u64, expected_for(&data));
    let engine = engine(&temp.path().join("log"), attempts);
    let source = Arc::new(MemorySource {
        corrupt_chunk: Some(1),
        ..MemorySource::new(data)
    });

    let report = engine
        .execute(&plan, source.clone(), CancellationToken::new(), None)
        .await
        .unwrap();

    assert_eq!(report.final_status, FinalStatus::Incomplete);
    assert!(!report.final_status.is_success());
    assert!(report.files_failed >= 1);
    assert_eq!(source.fetches(), 3 + attempts as usize);

    let state = engine.log().load_state(BACKUP_ID).unwrap();
    assert_eq!(state[&1].state, ChunkState::Failed);
    assert_eq!(state[&1].attempts, attempts);
    assert!(state[&1].last_error.is_some());
}

#[tokio::test]
async fn test_denied_listing_is_not_empty() {
    let source: Arc<dyn RemoteSource> = Arc::new(MemorySource {
        origin: Origin::RemotePrivileged,
        ..MemorySource::new(payload(100))
    });
    let indexer = BackupIndexer::new(Arc::new(SessionGate::new()));

    let listing = indexer.list(&[source.clone()], &session(false)).await;
    assert!(listing.backups.is_empty());
    assert_eq!(
        listing.outcome(),
        ListOutcome::Denied(DenialReason::NotPrivileged)
    );
    assert_ne!(listing.outcome(), ListOutcome::Empty);

    let listing = indexer.list(&[source], &session(true)).await;
    assert_eq!(listing.outcome(), ListOutcome::Found(1));
    assert!(!listing.backups[0].downloadable());
}

#[test]
fn test_insufficient_space_below_headroom() {
    let temp = TempDir::new().unwrap();
    let size = 1_000_000;
    let descriptor = BackupDescriptor::new(raw(size), Origin::Local);

    let err = planner()
        .plan(&descriptor, temp.path(), Quota::new(size * 105 / 100))
        .unwrap_err();
    match err {
        PlanError::InsufficientSpace {
            required,
            available,
            ..
        } => {
            assert_eq!(available, 1_050_000);
            assert_eq!(required, 1_150_000);
        }
        other => panic!("Expected InsufficientSpace, got {:?}", other),
    }

    assert!(planner()
        .plan(&descriptor, temp.path(), Quota::new(size * 115 / 100))
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_execute_is_exclusive() {
    let temp = TempDir::new().unwrap();
    let data = payload(12 * CHUNK as usize);
    let shared_plan = plan(&temp.path().join("out"), data.len() as u64, ExpectedDigests::default());
    let shared_engine = engine(&temp.path().join("log"), 3);
    let a = Arc::new(MemorySource::new(data.clone()));
    let b = Arc::new(MemorySource::new(data.clone()));

    let (first, second) = tokio::join!(
        shared_engine.execute(&shared_plan, a.clone(), CancellationToken::new(), None),
        shared_engine.execute(&shared_plan, b.clone(), CancellationToken::new(), None),
    );

    let mut completed = 0;
    for result in [first, second] {
        match result {
            Ok(report) => {
                assert_eq!(report.final_status, FinalStatus::Completed);
                completed += 1;
            }
            Err(TransferError::AlreadyInProgress { backup_id, .. }) => {
                assert_eq!(backup_id, BACKUP_ID);
            }
            Err(other) => panic!("Unexpected error: {}", other),
        }
    }
    assert!(completed >= 1);
    // Serialized or rejected, the chunks were fetched once in total.
    assert_eq!(a.fetches() + b.fetches(), 12);

    let sequential_root = temp.path().join("sequential");
    let sequential_plan = plan(
        &sequential_root.join("out"),
        data.len() as u64,
        ExpectedDigests::default(),
    );
    let sequential = engine(&sequential_root.join("log"), 3)
        .execute(
            &sequential_plan,
            Arc::new(MemorySource::new(data.clone())),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap();

    let concurrent_bytes =
        std::fs::read(snapferry::transfer::artifact_path(&shared_plan.output_dir, BACKUP_ID)).unwrap();
    let sequential_bytes = std::fs::read(sequential.output_path.unwrap()).unwrap();
    assert_eq!(concurrent_bytes, sequential_bytes);
    assert!(!snapferry::transfer::partial_path(&shared_plan.output_dir, BACKUP_ID).exists());
}

#[tokio::test]
async fn test_lock_file_blocks_other_process_registry() {
    let temp = TempDir::new().unwrap();
    let data = payload(2 * CHUNK as usize);
    let plan = plan(&temp.path().join("out"), data.len() as u64, ExpectedDigests::default());

    let registry = TransferRegistry::new();
    let _held = registry.acquire(BACKUP_ID, &plan.output_dir).unwrap();

    // A separate registry stands in for another process.
    let err = engine(&temp.path().join("log"), 3)
        .execute(
            &plan,
            Arc::new(MemorySource::new(data)),
            CancellationToken::new(),
            None,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TransferError::AlreadyInProgress { .. }));
}
