//! Chaos Testing for tristore-sync
//!
//! Failure scenarios driven by:
//! 1. **FailingStore wrappers** - precise error injection at specific call counts
//! 2. **Slow stores** - calls that outlive the adapter timeout
//! 3. **Divergent state** - copies seeded behind the engine's back
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;

use tristore_sync::{
    select_source, AdapterError, CrossRefs, FaultOp, InMemoryAdapter, LogicalRecord, MemoryLedger, ReconcileOutcome,
    RepairLedger, RetryEntry, RetryPolicy, StoreAdapter, StoreKind, StoreSet, StoreStatus, SyncConfig, SyncEngine,
};

// =============================================================================
// Failing Store Wrapper - Precise Error Injection
// =============================================================================

/// Wraps an in-memory store and fails chosen `write` calls.
pub struct FailingStore {
    inner: InMemoryAdapter,
    write_count: AtomicU64,
    /// Fail on these write numbers (1-indexed)
    fail_on_calls: Vec<u64>,
    /// Fail every write after this many, if set
    fail_after: Option<u64>,
    error: AdapterError,
    /// Sleep before every write
    delay: Option<Duration>,
}

impl FailingStore {
    pub fn new(kind: StoreKind, fail_on_calls: Vec<u64>, error: AdapterError) -> Self {
        Self {
            inner: InMemoryAdapter::new(kind),
            write_count: AtomicU64::new(0),
            fail_on_calls,
            fail_after: None,
            error,
            delay: None,
        }
    }

    /// Every write after the first `n` fails.
    pub fn fail_after(kind: StoreKind, n: u64, error: AdapterError) -> Self {
        Self { fail_after: Some(n), ..Self::new(kind, vec![], error) }
    }

    /// Every write takes `delay` before it succeeds.
    pub fn slow(kind: StoreKind, delay: Duration) -> Self {
        Self { delay: Some(delay), ..Self::new(kind, vec![], AdapterError::NotFound) }
    }

    pub fn write_attempts(&self) -> u64 {
        self.write_count.load(Ordering::SeqCst)
    }

    fn should_fail(&self) -> bool {
        let count = self.write_count.fetch_add(1, Ordering::SeqCst) + 1;
        match self.fail_after {
            Some(n) => count > n,
            None => self.fail_on_calls.contains(&count),
        }
    }
}

#[async_trait]
impl StoreAdapter for FailingStore {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError> {
        if let Some(delay) = self.delay {
            self.write_count.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
        } else if self.should_fail() {
            return Err(self.error.clone());
        }
        self.inner.write(record).await
    }

    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        self.inner.read(id).await
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        self.inner.delete(id).await
    }

    async fn attach_cross_refs(&self, id: &str, refs: &CrossRefs) -> Result<(), AdapterError> {
        self.inner.attach_cross_refs(id, refs).await
    }
}

// =============================================================================
// Helpers
// =============================================================================

const T: i64 = 1_700_000_000_000;

fn engine_over(
    relational: Arc<dyn StoreAdapter>,
    visual: Arc<dyn StoreAdapter>,
    vector: Arc<dyn StoreAdapter>,
    config: SyncConfig,
) -> (Arc<SyncEngine>, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::new());
    let stores = StoreSet::new(relational, visual, vector).expect("store kinds");
    let engine = SyncEngine::new(config, stores, ledger.clone()).with_retry_policy(RetryPolicy::immediate(5));
    (Arc::new(engine), ledger)
}

fn memory(kind: StoreKind) -> Arc<InMemoryAdapter> {
    Arc::new(InMemoryAdapter::new(kind))
}

fn test_record(id: &str) -> LogicalRecord {
    LogicalRecord::with_id(id, "content")
        .with_field("title", "X")
        .with_field("embedding", vec![0.25_f32, 0.5, 0.75])
}

fn unavailable() -> AdapterError {
    AdapterError::Unavailable("connection refused".into())
}

// =============================================================================
// Write Path
// =============================================================================

#[tokio::test]
async fn chaos_relational_down_three_attempts_then_recovers() {
    let relational = Arc::new(FailingStore::new(StoreKind::Relational, vec![1, 2, 3], unavailable()));
    let (engine, ledger) = engine_over(
        relational.clone(),
        memory(StoreKind::Visual),
        memory(StoreKind::Vector),
        SyncConfig::default(),
    );

    let result = engine
        .write(test_record("r1").with_sync_version(1))
        .await
        .expect("write");

    assert!(!result.partial);
    assert!(result.is_complete());
    assert_eq!(result.sync_version, 1);
    assert_eq!(result.cross_refs.len(), 3);
    assert_eq!(result.attempts(StoreKind::Relational), 4);
    assert_eq!(relational.write_attempts(), 4);
    assert_eq!(ledger.retry_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn chaos_vector_rejects_malformed_vector_without_retrying() {
    let vector = Arc::new(FailingStore::fail_after(
        StoreKind::Vector,
        0,
        AdapterError::Rejected("vector dimension 3 does not match index dimension 1536".into()),
    ));
    let ledger = Arc::new(MemoryLedger::new());
    let stores = StoreSet::new(memory(StoreKind::Relational), memory(StoreKind::Visual), vector.clone()).unwrap();
    // Production backoff: a retry would cost at least a second
    let engine = SyncEngine::new(SyncConfig::default(), stores, ledger.clone());

    let started = Instant::now();
    let result = engine.write(test_record("r1")).await.expect("partial write is Ok");

    assert!(started.elapsed() < Duration::from_millis(900));
    assert!(result.partial);
    assert!(!result.cross_refs.contains_key(&StoreKind::Vector));
    assert_eq!(result.failed_stores(), vec![StoreKind::Vector]);
    assert_eq!(result.status(StoreKind::Vector), Some(StoreStatus::FailedPermanent));
    assert_eq!(vector.write_attempts(), 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn chaos_slow_store_times_out_as_unavailable() {
    let vector = Arc::new(FailingStore::slow(StoreKind::Vector, Duration::from_secs(5)));
    let config = SyncConfig { adapter_timeout_seconds: 1, ..SyncConfig::default() };
    let ledger = Arc::new(MemoryLedger::new());
    let stores = StoreSet::new(memory(StoreKind::Relational), memory(StoreKind::Visual), vector.clone()).unwrap();
    let engine = SyncEngine::new(config, stores, ledger).with_retry_policy(RetryPolicy::immediate(2));

    let started = Instant::now();
    let result = engine.write(test_record("r1")).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert!(result.partial);
    assert_eq!(result.attempts(StoreKind::Vector), 2);
    let error = result.outcomes[&StoreKind::Vector].error.clone().unwrap();
    assert!(matches!(error, AdapterError::Unavailable(_)));
}

#[tokio::test]
async fn chaos_rate_limit_is_retried() {
    let visual = Arc::new(FailingStore::new(
        StoreKind::Visual,
        vec![1],
        AdapterError::RateLimited { retry_after: Some(Duration::from_millis(5)) },
    ));
    let (engine, _) = engine_over(memory(StoreKind::Relational), visual.clone(), memory(StoreKind::Vector), SyncConfig::default());

    let result = engine.write(test_record("r1")).await.unwrap();
    assert!(result.is_complete());
    assert_eq!(visual.write_attempts(), 2);
}

#[tokio::test]
async fn chaos_total_outage_is_the_only_write_error() {
    let (engine, ledger) = engine_over(
        Arc::new(FailingStore::fail_after(StoreKind::Relational, 0, unavailable())),
        Arc::new(FailingStore::fail_after(StoreKind::Visual, 0, unavailable())),
        Arc::new(FailingStore::fail_after(StoreKind::Vector, 0, unavailable())),
        SyncConfig::default(),
    );

    let err = engine.write(test_record("r1")).await.unwrap_err();
    assert!(matches!(err, tristore_sync::SyncError::AllStoresFailed(_)));
    assert_eq!(ledger.retry_depth().await.unwrap(), 3);
}

#[tokio::test]
async fn chaos_shutdown_aborts_backoff_and_queues() {
    let visual = Arc::new(FailingStore::fail_after(StoreKind::Visual, 0, unavailable()));
    let ledger = Arc::new(MemoryLedger::new());
    let stores = StoreSet::new(memory(StoreKind::Relational), visual.clone(), memory(StoreKind::Vector)).unwrap();
    // Default policy: the first backoff sleep is a full second
    let engine = Arc::new(SyncEngine::new(SyncConfig::default(), stores, ledger.clone()));

    let writer = engine.clone();
    let handle = tokio::spawn(async move { writer.write(test_record("r1")).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.shutdown();

    let result = tokio::time::timeout(Duration::from_millis(900), handle)
        .await
        .expect("shutdown should cut the backoff short")
        .unwrap()
        .unwrap();
    assert!(result.partial);
    assert_eq!(result.status(StoreKind::Visual), Some(StoreStatus::FailedRetryable));
    assert_eq!(visual.write_attempts(), 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 1);
}

#[tokio::test]
async fn chaos_concurrent_writes_to_one_id_are_serialized() {
    let relational = memory(StoreKind::Relational);
    let (engine, _) = engine_over(relational.clone(), memory(StoreKind::Visual), memory(StoreKind::Vector), SyncConfig::default());

    let writes = (0..20).map(|_| engine.write(test_record("hot")));
    let mut versions: Vec<u64> = join_all(writes)
        .await
        .into_iter()
        .map(|r| r.unwrap().sync_version)
        .collect();
    versions.sort_unstable();

    assert_eq!(versions, (1..=20).collect::<Vec<_>>());
    let stored = relational.read("hot").await.unwrap().unwrap();
    assert_eq!(stored.sync_version, 20);
    assert_eq!(engine.local_version("hot"), Some(20));
}

#[tokio::test]
async fn chaos_rewrites_never_duplicate_native_records() {
    let relational = memory(StoreKind::Relational);
    let visual = memory(StoreKind::Visual);
    let vector = memory(StoreKind::Vector);
    let (engine, _) = engine_over(relational.clone(), visual.clone(), vector.clone(), SyncConfig::default());

    let first = engine.write(test_record("r1")).await.unwrap();
    let second = engine.write(test_record("r1")).await.unwrap();

    assert_eq!((relational.len(), visual.len(), vector.len()), (1, 1, 1));
    assert_eq!(first.cross_refs, second.cross_refs);

    // Same id and version straight at the adapters
    let record = test_record("r2").with_sync_version(1);
    let a = visual.write(&record).await.unwrap();
    let b = visual.write(&record).await.unwrap();
    assert_eq!(a, b);
    assert_eq!(visual.len(), 2);
}

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn chaos_exhausted_retries_converge_on_next_pass() {
    let visual = Arc::new(FailingStore::new(StoreKind::Visual, vec![1, 2, 3, 4, 5], unavailable()));
    let relational = memory(StoreKind::Relational);
    let (engine, ledger) = engine_over(relational.clone(), visual.clone(), memory(StoreKind::Vector), SyncConfig::default());

    let result = engine.write(test_record("r1")).await.unwrap();
    assert!(result.partial);
    assert_eq!(result.attempts(StoreKind::Visual), 5);
    assert_eq!(ledger.retry_depth().await.unwrap(), 1);

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.repaired, 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 0);
    assert!(engine.consistency_report("r1").await.is_consistent);

    let row = relational.read("r1").await.unwrap().unwrap();
    assert_eq!(row.cross_refs.len(), 3);
}

#[tokio::test]
async fn chaos_skewed_copies_repair_from_highest_version() {
    let relational = memory(StoreKind::Relational);
    let visual = memory(StoreKind::Visual);
    let vector = memory(StoreKind::Vector);
    let (engine, _) = engine_over(relational.clone(), visual.clone(), vector.clone(), SyncConfig::default());

    let copy = |version: u64, updated_at: i64, title: &str| {
        LogicalRecord::with_id("r2", "content")
            .with_field("title", title)
            .with_field("embedding", vec![0.1_f32, 0.2, 0.3])
            .with_sync_version(version)
            .with_timestamps(T, updated_at)
    };
    relational.insert_raw(copy(2, T, "authoritative"));
    visual.insert_raw(copy(1, T + 2_000, "stale"));
    vector.insert_raw(copy(1, T + 10_000, "stale"));

    let report = engine.consistency_report("r2").await;
    assert!(!report.is_consistent);
    assert_eq!(report.max_skew_ms, 10_000);
    // Latest timestamp is the vector copy, but the version decides
    let (source, _) = select_source(&report).unwrap();
    assert_eq!(source, StoreKind::Relational);

    let outcome = engine.reconcile_now("r2").await.unwrap();
    assert_eq!(
        outcome,
        ReconcileOutcome::Repaired { source: StoreKind::Relational, stores: vec![StoreKind::Visual, StoreKind::Vector] }
    );
    let healed = engine.consistency_report("r2").await;
    assert!(healed.is_consistent);
    let title = &visual.read("r2").await.unwrap().unwrap().fields["title"];
    assert_eq!(*title, tristore_sync::FieldValue::String("authoritative".into()));
}

#[tokio::test]
async fn chaos_lower_version_never_overwrites_relational() {
    let relational = memory(StoreKind::Relational);
    let visual = memory(StoreKind::Visual);
    let (engine, _) = engine_over(relational.clone(), visual.clone(), memory(StoreKind::Vector), SyncConfig::default());
    for _ in 0..3 {
        engine.write(test_record("r1")).await.unwrap();
    }

    let older = test_record("r1").with_sync_version(1);
    assert!(matches!(relational.write(&older).await, Err(AdapterError::Rejected(_))));
    assert_eq!(relational.read("r1").await.unwrap().unwrap().sync_version, 3);

    // A lagging leaf is pulled up to the relational version
    visual.insert_raw(test_record("r1").with_sync_version(2));
    let outcome = engine.reconcile_now("r1").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::Repaired { ref stores, .. } if stores == &vec![StoreKind::Visual]));
    assert_eq!(visual.read("r1").await.unwrap().unwrap().sync_version, 3);
}

#[tokio::test]
async fn chaos_persistent_rejection_ends_in_manual_review() {
    let vector = Arc::new(FailingStore::fail_after(StoreKind::Vector, 0, AdapterError::Rejected("bad vector".into())));
    let (engine, ledger) = engine_over(memory(StoreKind::Relational), memory(StoreKind::Visual), vector.clone(), SyncConfig::default());

    assert!(engine.write(test_record("r1")).await.unwrap().partial);
    let first = engine.run_pass().await.unwrap();
    assert_eq!(first.flagged, 1);
    assert_eq!(vector.write_attempts(), 2);

    let parked = engine.review_list().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].record_id, "r1");

    // The queued retry is still there but the record is not touched again
    let second = engine.run_pass().await.unwrap();
    assert_eq!(second.checked, 0);
    assert_eq!(vector.write_attempts(), 2);
    assert!(ledger.retry_depth().await.unwrap() > 0);

    // Operator releases it; it comes back into the next pass
    assert!(engine.release_review("r1").await.unwrap());
    let third = engine.run_pass().await.unwrap();
    assert_eq!(third.checked, 1);
}

#[tokio::test]
async fn chaos_duplicate_queue_entries_reconcile_once() {
    let visual = memory(StoreKind::Visual);
    let (engine, ledger) = engine_over(memory(StoreKind::Relational), visual.clone(), memory(StoreKind::Vector), SyncConfig::default());
    engine.write(test_record("r1")).await.unwrap();
    engine.run_pass().await.unwrap();
    visual.remove_raw("r1");

    // Two coordinators queued the same failure, a third a different store
    let entry = |store: StoreKind, at: i64| RetryEntry {
        record_id: "r1".into(),
        sync_version: 1,
        store,
        error: "unavailable".into(),
        enqueued_at: at,
    };
    ledger.enqueue_retry(entry(StoreKind::Visual, 1)).await.unwrap();
    ledger.enqueue_retry(entry(StoreKind::Visual, 2)).await.unwrap();
    ledger.enqueue_retry(entry(StoreKind::Vector, 3)).await.unwrap();

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.repaired, 1);
    assert_eq!(visual.len(), 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 0);
}

#[tokio::test]
async fn chaos_total_failure_entries_drain_once_stores_agree() {
    let failing = |kind| Arc::new(FailingStore::new(kind, (2..=20).collect(), unavailable()));
    let (engine, ledger) = engine_over(
        failing(StoreKind::Relational),
        failing(StoreKind::Visual),
        failing(StoreKind::Vector),
        SyncConfig::default(),
    );
    engine.write(test_record("r1")).await.unwrap();

    // v2 reaches no store; every copy stays at v1
    let err = engine.write(test_record("r1").with_field("title", "Y")).await.unwrap_err();
    assert!(matches!(err, tristore_sync::SyncError::AllStoresFailed(_)));
    assert_eq!(ledger.retry_depth().await.unwrap(), 3);

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.consistent, 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 0);

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.checked, 0);
}

#[tokio::test]
async fn chaos_parked_records_do_not_starve_the_queue() {
    let visual = memory(StoreKind::Visual);
    let config = SyncConfig { sync_batch_size: 1, ..SyncConfig::default() };
    let (engine, ledger) = engine_over(memory(StoreKind::Relational), visual.clone(), memory(StoreKind::Vector), config);
    engine.write(test_record("r2")).await.unwrap();
    engine.run_pass().await.unwrap();
    visual.remove_raw("r2");

    let entry = |id: &str, store: StoreKind, at: i64| RetryEntry {
        record_id: id.into(),
        sync_version: 1,
        store,
        error: "rejected".into(),
        enqueued_at: at,
    };
    for (n, id) in ["p1", "p2", "p3"].into_iter().enumerate() {
        ledger.enqueue_retry(entry(id, StoreKind::Visual, n as i64)).await.unwrap();
        ledger.enqueue_retry(entry(id, StoreKind::Vector, n as i64 + 3)).await.unwrap();
        ledger.flag_for_review(id, "bad payload").await.unwrap();
    }
    ledger.enqueue_retry(entry("r2", StoreKind::Visual, 10)).await.unwrap();

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.checked, 1);
    assert_eq!(summary.repaired, 1);
    assert_eq!(visual.len(), 1);
    assert_eq!(ledger.retry_depth().await.unwrap(), 6);
}

#[tokio::test]
async fn chaos_stale_embedding_at_equal_version_is_repaired() {
    let relational = memory(StoreKind::Relational);
    let vector = memory(StoreKind::Vector);
    let (engine, _) = engine_over(relational.clone(), memory(StoreKind::Visual), vector.clone(), SyncConfig::default());
    engine.write(test_record("r1")).await.unwrap();

    // Same version and fields, but the vector store kept an old embedding
    let mut drifted = vector.read("r1").await.unwrap().unwrap();
    drifted.fields.insert("embedding".into(), tristore_sync::FieldValue::Vector(vec![0.9, 0.9, 0.9]));
    vector.insert_raw(drifted);

    let report = engine.consistency_report("r1").await;
    assert!(!report.is_consistent);

    let outcome = engine.reconcile_now("r1").await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Repaired { source: StoreKind::Relational, stores: vec![StoreKind::Vector] });
    let healed = vector.read("r1").await.unwrap().unwrap();
    assert_eq!(healed.fields["embedding"], tristore_sync::FieldValue::Vector(vec![0.25, 0.5, 0.75]));
}

#[tokio::test]
async fn chaos_newer_visual_copy_never_inherits_an_older_vector() {
    let vector = memory(StoreKind::Vector);
    let visual = memory(StoreKind::Visual);
    let (engine, ledger) = engine_over(memory(StoreKind::Relational), visual.clone(), vector.clone(), SyncConfig::default());
    engine.write(test_record("r1")).await.unwrap();

    // Only the visual store saw v2; its vector is gone for good
    let mut newer = visual.read("r1").await.unwrap().unwrap().with_sync_version(2);
    newer.fields.insert("title".into(), "Y".into());
    visual.insert_raw(newer);
    let writes = vector.write_calls();

    let outcome = engine.reconcile_now("r1").await.unwrap();
    assert!(matches!(outcome, ReconcileOutcome::FlaggedForReview { ref reason } if reason.contains("no v2 vector")));
    assert_eq!(vector.write_calls(), writes);
    assert_eq!(vector.read("r1").await.unwrap().unwrap().sync_version, 1);
    assert!(ledger.is_under_review("r1").await.unwrap());
}

#[tokio::test]
async fn chaos_unreachable_reads_defer_instead_of_repairing() {
    let visual = memory(StoreKind::Visual);
    let vector = memory(StoreKind::Vector);
    let (engine, _) = engine_over(memory(StoreKind::Relational), visual.clone(), vector.clone(), SyncConfig::default());
    engine.write(test_record("r1")).await.unwrap();
    visual.remove_raw("r1");
    vector.inject_failures(FaultOp::Read, vec![unavailable(); 5]);

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.deferred, 1);
    assert!(visual.is_empty());
    // Still tracked for the next pass
    assert_eq!(engine.recent_ids(), vec!["r1".to_string()]);

    let summary = engine.run_pass().await.unwrap();
    assert_eq!(summary.repaired, 1);
    assert_eq!(visual.len(), 1);
}

#[tokio::test]
async fn chaos_missing_copy_within_grace_is_pending() {
    let vector = memory(StoreKind::Vector);
    let config = SyncConfig { missing_grace_seconds: 60, ..SyncConfig::default() };
    let (engine, _) = engine_over(memory(StoreKind::Relational), memory(StoreKind::Visual), vector.clone(), config);
    engine.write(test_record("r1")).await.unwrap();
    vector.remove_raw("r1");

    let report = engine.consistency_report("r1").await;
    assert!(!report.is_consistent);
    assert!(report.has_unsettled());
    assert!(matches!(engine.reconcile_now("r1").await.unwrap(), ReconcileOutcome::Deferred { .. }));
}
