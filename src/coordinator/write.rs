//! Write Coordinator: fan one record out to the stores in parallel.
//!
//! Every targeted store is attempted, each under its own retry loop, and the
//! call only returns once all of them have settled. A partial failure is an
//! `Ok` result with `partial` set; only a write that failed everywhere is an
//! error. Every store that did not succeed is appended to the retry queue.

use std::collections::BTreeMap;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use tracing::{debug, error, info, warn};

use crate::record::{now_millis, LogicalRecord, StoreKind};
use crate::resilience::ledger::RetryEntry;
use crate::resilience::retry::{call_with_retry, RetryOutcome};
use crate::storage::traits::AdapterError;
use super::types::{StoreOutcome, StoreStatus, SyncError, WriteResult};
use super::{LocalVersion, SyncEngine};

impl SyncEngine {
    /// Write one record to all three stores.
    ///
    /// The record's `sync_version` is assigned here: one past the last
    /// accepted version for the id, or the caller's value if that is higher.
    #[tracing::instrument(skip(self, record), fields(id = %record.id, record_type = %record.record_type))]
    pub async fn write(&self, record: LogicalRecord) -> Result<WriteResult, SyncError> {
        record.validate()?;
        let id = record.id.clone();
        let _lock = self.lock_id(&id).await;
        self.write_locked(record).await
    }

    async fn write_locked(&self, mut record: LogicalRecord) -> Result<WriteResult, SyncError> {
        let id = record.id.clone();
        let seed = match self.versions.contains_key(&id) {
            true => None,
            false => self.seed_version(&id).await,
        };
        record.sync_version = self.accept_version(&record, seed)?;

        let result = self.fan_out(&record, &StoreKind::ALL).await;
        self.settle(&record, result).await
    }

    /// Stored relational version and timestamp for an id this process has
    /// not written yet, so a restart does not restart versions at 1.
    async fn seed_version(&self, id: &str) -> Option<LocalVersion> {
        let adapter = self.stores.get(StoreKind::Relational);
        let attempted = call_with_retry(
            StoreKind::Relational,
            "read",
            &self.policy,
            self.config.adapter_timeout(),
            Some(&self.shutdown_rx),
            || adapter.read(id),
        )
        .await;
        match attempted.into_result() {
            Ok(Some(stored)) => Some(LocalVersion {
                sync_version: stored.sync_version,
                updated_at: stored.updated_at,
                written_at: 0,
            }),
            Ok(None) | Err(AdapterError::NotFound) => None,
            Err(e) => {
                warn!(id, error = %e, "Could not read stored version; versioning from the record");
                None
            }
        }
    }

    fn accept_version(&self, record: &LogicalRecord, seed: Option<LocalVersion>) -> Result<u64, SyncError> {
        let now = now_millis();
        let entry = self.versions.entry(record.id.clone());
        let previous = match &entry {
            Entry::Occupied(e) => Some(*e.get()),
            Entry::Vacant(_) => seed,
        };

        let version = match previous {
            Some(prev) if record.updated_at < prev.updated_at => {
                return Err(SyncError::InvalidRecord(format!(
                    "updated_at {} is older than the accepted {} for {}",
                    record.updated_at, prev.updated_at, record.id
                )));
            }
            Some(prev) if record.sync_version <= prev.sync_version => prev.sync_version + 1,
            _ => record.sync_version.max(1),
        };

        let accepted = LocalVersion { sync_version: version, updated_at: record.updated_at, written_at: now };
        match entry {
            Entry::Occupied(mut e) => {
                e.insert(accepted);
            }
            Entry::Vacant(e) => {
                e.insert(accepted);
            }
        }
        Ok(version)
    }

    /// Write `record` to `targets` concurrently and collect every outcome.
    ///
    /// Does not touch versions, the ledger or the cross-reference index.
    pub(super) async fn fan_out(&self, record: &LogicalRecord, targets: &[StoreKind]) -> WriteResult {
        let started = Instant::now();
        let timeout = self.config.adapter_timeout();

        let calls = targets.iter().map(|&kind| {
            let adapter = self.stores.get(kind).clone();
            async move {
                let call_started = Instant::now();
                let attempted = call_with_retry(
                    kind,
                    "write",
                    &self.policy,
                    timeout,
                    Some(&self.shutdown_rx),
                    || adapter.write(record),
                )
                .await;
                crate::metrics::record_latency(kind.as_str(), "write", call_started.elapsed());
                (kind, attempted)
            }
        });

        let mut outcomes = BTreeMap::new();
        let mut cross_refs = record.cross_refs.clone();
        for (kind, attempted) in join_all(calls).await {
            let attempts = attempted.attempts;
            let outcome = match attempted.outcome {
                RetryOutcome::Succeeded(native_id) => {
                    crate::metrics::record_operation(kind.as_str(), "write", "success");
                    cross_refs.insert(kind, native_id.clone());
                    StoreOutcome { status: StoreStatus::Succeeded, native_id: Some(native_id), attempts, error: None }
                }
                RetryOutcome::Failed(err) => {
                    if matches!(err, AdapterError::Rejected(_)) {
                        crate::metrics::record_operation(kind.as_str(), "write", "rejected");
                        error!(
                            id = %record.id, store = %kind, error = %err,
                            payload = %String::from_utf8_lossy(&record.canonical_bytes()),
                            "Store rejected write"
                        );
                    } else {
                        crate::metrics::record_operation(kind.as_str(), "write", "error");
                        warn!(id = %record.id, store = %kind, attempts, error = %err, "Store write failed");
                    }
                    StoreOutcome { status: StoreStatus::FailedPermanent, native_id: None, attempts, error: Some(err) }
                }
                RetryOutcome::Aborted(err) => {
                    crate::metrics::record_operation(kind.as_str(), "write", "error");
                    StoreOutcome { status: StoreStatus::FailedRetryable, native_id: None, attempts, error: Some(err) }
                }
            };
            outcomes.insert(kind, outcome);
        }

        let failed = outcomes.values().filter(|o| !o.succeeded()).count();
        WriteResult {
            id: record.id.clone(),
            sync_version: record.sync_version,
            partial: failed > 0 && failed < outcomes.len(),
            outcomes,
            cross_refs,
            elapsed: started.elapsed(),
        }
    }

    /// Bookkeeping after a fresh write: persist side effects, remember the
    /// id for the scheduler and turn a total failure into an error.
    async fn settle(&self, record: &LogicalRecord, result: WriteResult) -> Result<WriteResult, SyncError> {
        self.persist_outcome(record, &result).await;
        self.recent.insert(record.id.clone(), now_millis());

        let label = if result.is_complete() {
            "full"
        } else if result.partial {
            "partial"
        } else {
            "failed"
        };
        crate::metrics::record_write(label, result.elapsed);

        if result.outcomes.values().any(|o| o.succeeded()) || result.outcomes.is_empty() {
            if result.partial {
                info!(id = %record.id, failed = ?result.failed_stores(), "Partial write queued for reconciliation");
            } else {
                debug!(id = %record.id, version = result.sync_version, elapsed = ?result.elapsed, "Write complete");
            }
            Ok(result)
        } else {
            error!(id = %record.id, "Write failed on every targeted store");
            Err(SyncError::AllStoresFailed(Box::new(result)))
        }
    }

    /// Side effects shared by fresh writes and repairs: extend the
    /// relational cross-reference index and queue every failed store.
    pub(super) async fn persist_outcome(&self, record: &LogicalRecord, result: &WriteResult) {
        // Relational untargeted means its copy was already good.
        let relational_ok = result
            .outcomes
            .get(&StoreKind::Relational)
            .map_or(true, |o| o.succeeded());
        let learned = result.outcomes.values().any(|o| o.succeeded());
        if relational_ok && learned && !record.deleted {
            self.persist_cross_refs(&record.id, result).await;
        }

        for (kind, outcome) in result.outcomes.iter().filter(|(_, o)| !o.succeeded()) {
            let entry = RetryEntry {
                record_id: record.id.clone(),
                sync_version: record.sync_version,
                store: *kind,
                error: outcome.error.as_ref().map(ToString::to_string).unwrap_or_default(),
                enqueued_at: now_millis(),
            };
            if let Err(e) = self.ledger.enqueue_retry(entry).await {
                crate::metrics::record_ledger_error("enqueue_retry");
                error!(id = %record.id, store = %kind, error = %e, "Failed to queue write for reconciliation");
            }
        }
    }

    /// Raise the locally accepted version after a repair wrote `record`.
    ///
    /// Keeps `written_at`, so a repair never reopens the missing-grace window.
    pub(super) fn raise_local_version(&self, record: &LogicalRecord) {
        self.versions
            .entry(record.id.clone())
            .and_modify(|v| {
                if record.sync_version > v.sync_version {
                    v.sync_version = record.sync_version;
                }
                v.updated_at = v.updated_at.max(record.updated_at);
            })
            .or_insert(LocalVersion {
                sync_version: record.sync_version,
                updated_at: record.updated_at,
                written_at: 0,
            });
    }

    async fn persist_cross_refs(&self, id: &str, result: &WriteResult) {
        let adapter = self.stores.get(StoreKind::Relational);
        let attempted = call_with_retry(
            StoreKind::Relational,
            "attach_cross_refs",
            &self.policy,
            self.config.adapter_timeout(),
            Some(&self.shutdown_rx),
            || adapter.attach_cross_refs(id, &result.cross_refs),
        )
        .await;
        if let Err(e) = attempted.into_result() {
            warn!(id, error = %e, "Cross-reference index not updated; next reconciliation rewrites it");
        }
    }
}
