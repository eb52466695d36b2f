// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync engine coordinator.
//!
//! The [`SyncEngine`] ties the components together:
//! - Write Coordinator: parallel fan-out to the three stores
//! - Consistency Checker: parallel read-back and comparison
//! - Reconciler: bounded repair from the newest copy
//! - Read Router: intent-based store selection with fallback
//! - Scheduler: periodic passes over recent writes and the retry queue
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! Writes, reads and manual reconciliation work in every state; only the
//! scheduler loop depends on [`SyncEngine::run()`].
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tristore_sync::{
//!     EngineState, InMemoryAdapter, LogicalRecord, MemoryLedger, StoreKind, StoreSet,
//!     SyncConfig, SyncEngine,
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let stores = StoreSet::new(
//!     Arc::new(InMemoryAdapter::new(StoreKind::Relational)),
//!     Arc::new(InMemoryAdapter::new(StoreKind::Visual)),
//!     Arc::new(InMemoryAdapter::new(StoreKind::Vector)),
//! )
//! .unwrap();
//! let engine = SyncEngine::new(SyncConfig::default(), stores, Arc::new(MemoryLedger::new()));
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! let record = LogicalRecord::new("content").with_field("title", "X");
//! let result = engine.write(record).await.unwrap();
//! assert!(!result.partial);
//! assert_eq!(result.cross_refs.len(), 3);
//! # }
//! ```

mod types;
mod write;
mod consistency;
mod reconcile;
mod router;
mod lifecycle;

pub use types::{EngineState, HealthReport, PassSummary, StoreOutcome, StoreStatus, SyncError, WriteResult};
pub use consistency::{ConsistencyReport, CopySnapshot, StoreObservation};
pub use reconcile::{plan_repair, select_source, ReconcileOutcome, ReconcilePreview, RepairPlan};
pub use router::{fallback_order, route_read, QueryIntent};

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{info, warn};

use crate::config::{ConfigError, SyncConfig};
use crate::record::{now_millis, LogicalRecord, StoreKind};
use crate::resilience::ledger::{RepairLedger, ReviewEntry};
use crate::resilience::retry::{call_with_retry, RetryPolicy};
use crate::resilience::sql_ledger::SqlLedger;
use crate::storage::airtable::VisualAdapter;
use crate::storage::sql::RelationalAdapter;
use crate::storage::traits::{AdapterError, StoreAdapter};
use crate::storage::vector::VectorAdapter;

/// One adapter per store.
#[derive(Clone)]
pub struct StoreSet {
    relational: Arc<dyn StoreAdapter>,
    visual: Arc<dyn StoreAdapter>,
    vector: Arc<dyn StoreAdapter>,
}

impl StoreSet {
    /// Fails if an adapter sits in the wrong slot.
    pub fn new(
        relational: Arc<dyn StoreAdapter>,
        visual: Arc<dyn StoreAdapter>,
        vector: Arc<dyn StoreAdapter>,
    ) -> Result<Self, ConfigError> {
        for (expected, adapter) in [
            (StoreKind::Relational, &relational),
            (StoreKind::Visual, &visual),
            (StoreKind::Vector, &vector),
        ] {
            if adapter.kind() != expected {
                return Err(ConfigError::Invalid(format!(
                    "{} adapter passed where the {} adapter belongs",
                    adapter.kind(),
                    expected
                )));
            }
        }
        Ok(Self { relational, visual, vector })
    }

    /// Build the production adapters from configuration.
    pub async fn connect(config: &SyncConfig) -> Result<Self, SyncError> {
        let timeout = config.adapter_timeout();
        let visual = VisualAdapter::new(&config.visual, timeout)?;
        let vector = VectorAdapter::new(&config.vector, timeout)?;
        let relational = RelationalAdapter::connect(&config.relational)
            .await
            .map_err(|source| SyncError::Store { store: StoreKind::Relational, source })?;
        Ok(Self::new(Arc::new(relational), Arc::new(visual), Arc::new(vector))?)
    }

    #[must_use]
    pub fn get(&self, kind: StoreKind) -> &Arc<dyn StoreAdapter> {
        match kind {
            StoreKind::Relational => &self.relational,
            StoreKind::Visual => &self.visual,
            StoreKind::Vector => &self.vector,
        }
    }
}

/// Last write accepted locally for an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct LocalVersion {
    pub sync_version: u64,
    pub updated_at: i64,
    /// Wall clock of the write (millis), for the missing-grace window
    pub written_at: i64,
}

/// Per-id lock held for one write or reconciliation.
///
/// The lock-map entry is dropped with the last holder, including when the
/// owning future is cancelled mid-flight.
pub(super) struct IdLock<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.remove_if(&self.id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

/// Main sync engine coordinator.
///
/// # Thread Safety
///
/// The engine is `Send + Sync`; share it behind an `Arc`. Writes and
/// reconciliation for the same id are serialized by a per-id lock, so the
/// relational store sees versions in order and two reconcilers never race.
pub struct SyncEngine {
    pub(super) config: SyncConfig,
    pub(super) stores: StoreSet,
    pub(super) ledger: Arc<dyn RepairLedger>,
    pub(super) policy: RetryPolicy,

    /// Engine state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    /// Raised once; aborts backoff sleeps and stops scheduler passes
    pub(super) shutdown_tx: watch::Sender<bool>,
    pub(super) shutdown_rx: watch::Receiver<bool>,

    /// Locally accepted version per id
    pub(super) versions: DashMap<String, LocalVersion>,

    /// Ids written since they were last checked, with write time (millis)
    pub(super) recent: DashMap<String, i64>,

    /// Per-id serialization
    pub(super) locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SyncEngine {
    /// Create an engine over existing adapters and ledger.
    ///
    /// The engine starts in `Created` state. Call [`run()`](Self::run) to
    /// start the scheduler.
    pub fn new(config: SyncConfig, stores: StoreSet, ledger: Arc<dyn RepairLedger>) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        crate::metrics::set_engine_state("Created");

        Self {
            policy: config.retry_policy(),
            config,
            stores,
            ledger,
            state: state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            versions: DashMap::new(),
            recent: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Connect the three production stores and the durable ledger.
    pub async fn connect(config: SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let stores = StoreSet::connect(&config).await?;
        let ledger = SqlLedger::connect(&config.ledger_url).await?;
        info!(ledger = %config.ledger_url, "Sync engine connected");
        Ok(Self::new(config, stores, Arc::new(ledger)))
    }

    /// Override the backoff schedule derived from configuration.
    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Locally accepted `sync_version` for `id`, if this engine wrote it.
    #[must_use]
    pub fn local_version(&self, id: &str) -> Option<u64> {
        self.versions.get(id).map(|v| v.sync_version)
    }

    /// Ids written since they were last checked.
    #[must_use]
    pub fn recent_ids(&self) -> Vec<String> {
        let mut ids: Vec<(String, i64)> = self.recent.iter().map(|e| (e.key().clone(), *e.value())).collect();
        ids.sort_by_key(|(_, at)| *at);
        ids.into_iter().map(|(id, _)| id).collect()
    }

    pub(super) async fn lock_id(&self, id: &str) -> IdLock<'_> {
        let lock = self.locks.entry(id.to_string()).or_default().clone();
        let guard = lock.lock_owned().await;
        IdLock { locks: &self.locks, id: id.to_string(), guard: Some(guard) }
    }

    pub(super) fn within_missing_grace(&self, id: &str) -> bool {
        let grace = self.config.missing_grace().as_millis() as i64;
        grace > 0
            && self
                .versions
                .get(id)
                .is_some_and(|v| now_millis() - v.written_at < grace)
    }

    /// Read from the store the router picks for `intent`. Tombstones read as absent.
    #[tracing::instrument(skip(self))]
    pub async fn read(&self, id: &str, intent: QueryIntent) -> Result<Option<LogicalRecord>, SyncError> {
        let store = route_read(intent);
        self.read_from(store, id)
            .await
            .map(|copy| copy.filter(|r| !r.deleted))
            .map_err(|source| SyncError::Store { store, source })
    }

    /// Like [`read`](Self::read), falling back to the other stores when the
    /// routed one is unreachable or has no copy.
    ///
    /// Returns the store that answered. Fails only if no store answered at all.
    #[tracing::instrument(skip(self))]
    pub async fn read_with_fallback(
        &self,
        id: &str,
        intent: QueryIntent,
    ) -> Result<Option<(StoreKind, LogicalRecord)>, SyncError> {
        let primary = route_read(intent);
        let mut last_error = None;
        let mut answered = false;

        for store in std::iter::once(primary).chain(fallback_order(primary)) {
            match self.read_from(store, id).await {
                Ok(Some(record)) if !record.deleted => return Ok(Some((store, record))),
                Ok(Some(_)) => return Ok(None),
                Ok(None) => answered = true,
                Err(e) => {
                    warn!(%store, id, error = %e, "Read failed, trying next store");
                    last_error = Some((store, e));
                }
            }
        }

        match last_error {
            Some((store, source)) if !answered => Err(SyncError::Store { store, source }),
            _ => Ok(None),
        }
    }

    async fn read_from(&self, store: StoreKind, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        let adapter = self.stores.get(store);
        let _timer = crate::metrics::LatencyTimer::new(store.as_str(), "read");
        match call_with_retry(
            store,
            "read",
            &self.policy,
            self.config.adapter_timeout(),
            Some(&self.shutdown_rx),
            || adapter.read(id),
        )
        .await
        .into_result()
        {
            Err(AdapterError::NotFound) => Ok(None),
            other => other,
        }
    }

    /// Delete `id` everywhere by fanning out a tombstone write.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<WriteResult, SyncError> {
        let record_type = match self.read_with_fallback(id, QueryIntent::Unclassified).await? {
            Some((_, record)) => record.record_type,
            None => return Err(SyncError::NotFound(id.to_string())),
        };
        let updated_at = self
            .versions
            .get(id)
            .map_or(now_millis(), |v| v.updated_at.max(now_millis()));
        self.write(LogicalRecord::tombstone(id, record_type, updated_at)).await
    }

    /// Write many records, `sync_batch_size` at a time, each chunk in parallel.
    ///
    /// Results come back in input order.
    #[tracing::instrument(skip(self, records), fields(count = records.len()))]
    pub async fn write_batch(&self, records: Vec<LogicalRecord>) -> Vec<Result<WriteResult, SyncError>> {
        let mut results = Vec::with_capacity(records.len());
        for chunk in records.chunks(self.config.sync_batch_size.max(1)) {
            let writes = chunk.iter().cloned().map(|record| self.write(record));
            results.extend(join_all(writes).await);
        }
        results
    }

    /// Probe every store (one attempt each, bounded by the adapter timeout)
    /// and the ledger.
    pub async fn health_check(&self) -> HealthReport {
        let timeout = self.config.adapter_timeout();
        let probes = StoreKind::ALL.map(|kind| {
            let adapter = self.stores.get(kind).clone();
            async move {
                let healthy = matches!(tokio::time::timeout(timeout, adapter.ping()).await, Ok(Ok(())));
                crate::metrics::set_store_healthy(kind.as_str(), healthy);
                (kind, healthy)
            }
        });
        let stores: BTreeMap<StoreKind, bool> = join_all(probes).await.into_iter().collect();
        let ledger = self.ledger.retry_depth().await.is_ok();
        let healthy = ledger && stores.values().all(|h| *h);
        HealthReport { stores, ledger, healthy }
    }

    /// Records parked for manual review.
    pub async fn review_list(&self) -> Result<Vec<ReviewEntry>, SyncError> {
        let list = self.ledger.review_list().await?;
        crate::metrics::set_manual_review_depth(list.len());
        Ok(list)
    }

    /// Return a parked record to automatic reconciliation.
    #[tracing::instrument(skip(self))]
    pub async fn release_review(&self, id: &str) -> Result<bool, SyncError> {
        let released = self.ledger.release_review(id).await?;
        if released {
            info!(id, "Released from manual review");
            self.recent.insert(id.to_string(), now_millis());
        }
        Ok(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::ledger::MemoryLedger;
    use crate::storage::memory::{FaultOp, InMemoryAdapter};
    use std::time::Duration;

    struct Harness {
        relational: Arc<InMemoryAdapter>,
        visual: Arc<InMemoryAdapter>,
        vector: Arc<InMemoryAdapter>,
        engine: SyncEngine,
    }

    fn harness() -> Harness {
        let relational = Arc::new(InMemoryAdapter::new(StoreKind::Relational));
        let visual = Arc::new(InMemoryAdapter::new(StoreKind::Visual));
        let vector = Arc::new(InMemoryAdapter::new(StoreKind::Vector));
        let stores = StoreSet::new(relational.clone(), visual.clone(), vector.clone()).unwrap();
        let engine = SyncEngine::new(SyncConfig::default(), stores, Arc::new(MemoryLedger::new()))
            .with_retry_policy(RetryPolicy::immediate(5));
        Harness { relational, visual, vector, engine }
    }

    fn record(id: &str) -> LogicalRecord {
        LogicalRecord::with_id(id, "content")
            .with_field("title", "X")
            .with_field("embedding", vec![0.1_f32, 0.2])
    }

    #[test]
    fn test_store_set_rejects_swapped_adapters() {
        let result = StoreSet::new(
            Arc::new(InMemoryAdapter::new(StoreKind::Visual)),
            Arc::new(InMemoryAdapter::new(StoreKind::Relational)),
            Arc::new(InMemoryAdapter::new(StoreKind::Vector)),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_read_routes_by_intent() {
        let h = harness();
        h.engine.write(record("r1")).await.unwrap();

        let visual_reads = h.visual.read_calls();
        let copy = h.engine.read("r1", QueryIntent::VisualBrowse).await.unwrap().unwrap();
        assert_eq!(h.visual.read_calls(), visual_reads + 1);
        assert!(!copy.fields.contains_key("embedding"));

        let copy = h.engine.read("r1", QueryIntent::Similarity).await.unwrap().unwrap();
        assert!(copy.fields.contains_key("embedding"));
    }

    #[tokio::test]
    async fn test_read_with_fallback_skips_unavailable_primary() {
        let h = harness();
        h.engine.write(record("r1")).await.unwrap();
        h.vector
            .inject_failures(FaultOp::Read, vec![AdapterError::Unavailable("down".into()); 5]);

        let (store, copy) = h
            .engine
            .read_with_fallback("r1", QueryIntent::SemanticSearch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(store, StoreKind::Relational);
        assert_eq!(copy.id, "r1");
    }

    #[tokio::test]
    async fn test_read_with_fallback_reports_total_outage() {
        let h = harness();
        for store in [&h.relational, &h.visual, &h.vector] {
            store.inject_failures(FaultOp::Read, vec![AdapterError::Unavailable("down".into()); 5]);
        }
        let err = h.engine.read_with_fallback("r1", QueryIntent::Unclassified).await.unwrap_err();
        assert!(matches!(err, SyncError::Store { .. }));
    }

    #[tokio::test]
    async fn test_delete_fans_out_tombstone() {
        let h = harness();
        h.engine.write(record("r1")).await.unwrap();

        let result = h.engine.delete("r1").await.unwrap();
        assert!(result.is_complete());
        assert_eq!(result.sync_version, 2);
        assert!(h.visual.is_empty());
        assert!(h.vector.is_empty());
        assert!(h.engine.read("r1", QueryIntent::Unclassified).await.unwrap().is_none());
        assert!(h.engine.consistency_report("r1").await.is_consistent);

        assert!(matches!(h.engine.delete("never").await, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_write_batch_preserves_order() {
        let h = harness();
        let records: Vec<_> = (0..25).map(|n| record(&format!("r{}", n))).collect();
        let results = h.engine.write_batch(records).await;

        assert_eq!(results.len(), 25);
        for (n, result) in results.iter().enumerate() {
            assert_eq!(result.as_ref().unwrap().id, format!("r{}", n));
        }
        assert_eq!(h.relational.len(), 25);
    }

    #[tokio::test]
    async fn test_health_check_reports_each_store() {
        let h = harness();
        assert!(h.engine.health_check().await.healthy);

        h.visual.inject_failures(FaultOp::Read, [AdapterError::Unavailable("down".into())]);
        let report = h.engine.health_check().await;
        assert!(!report.healthy);
        assert!(!report.stores[&StoreKind::Visual]);
        assert!(report.stores[&StoreKind::Relational]);
    }

    #[tokio::test]
    async fn test_locks_are_dropped_after_use() {
        let h = harness();
        h.engine.write(record("r1")).await.unwrap();
        assert!(h.engine.locks.is_empty());
    }

    struct StalledStore(StoreKind);

    #[async_trait::async_trait]
    impl StoreAdapter for StalledStore {
        fn kind(&self) -> StoreKind {
            self.0
        }

        async fn write(&self, _record: &LogicalRecord) -> Result<String, AdapterError> {
            std::future::pending().await
        }

        async fn read(&self, _id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
            Ok(None)
        }

        async fn delete(&self, _id: &str) -> Result<(), AdapterError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_cancelled_write_releases_lock_entry() {
        let stores = StoreSet::new(
            Arc::new(InMemoryAdapter::new(StoreKind::Relational)),
            Arc::new(InMemoryAdapter::new(StoreKind::Visual)),
            Arc::new(StalledStore(StoreKind::Vector)),
        )
        .unwrap();
        let engine = SyncEngine::new(SyncConfig::default(), stores, Arc::new(MemoryLedger::new()));

        let write = tokio::time::timeout(Duration::from_millis(50), engine.write(record("r1"))).await;
        assert!(write.is_err());
        assert!(engine.locks.is_empty());

        let lock = tokio::time::timeout(Duration::from_millis(50), engine.lock_id("r1")).await;
        assert!(lock.is_ok());
        drop(lock);
        assert!(engine.locks.is_empty());
    }
}
