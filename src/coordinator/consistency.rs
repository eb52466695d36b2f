//! Consistency Checker: read one record from every store and decide whether
//! the three copies agree.
//!
//! A record is consistent only when every store holds a copy, the canonical
//! digests and versions match, the stores that persist the vector hold the
//! same one, and the spread of `updated_at` values stays
//! within the tolerance window (inclusive). A missing copy is maximal
//! divergence, except when it is the expected state: the newest copy is a
//! tombstone, or the copy is still inside the missing-grace window after a
//! write (then it is `Pending`, neither agreeing nor divergent).

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, info};

use crate::record::{now_millis, LogicalRecord, StoreKind};
use crate::resilience::retry::call_with_retry;
use crate::storage::traits::AdapterError;
use super::SyncEngine;

/// The comparable part of one store's copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CopySnapshot {
    pub sync_version: u64,
    pub updated_at: i64,
    /// Hex SHA-256 of the canonical form
    pub digest: String,
    pub deleted: bool,
    /// Hex SHA-256 of the vector, for copies that hold one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_digest: Option<String>,
}

impl CopySnapshot {
    #[must_use]
    pub fn of(record: &LogicalRecord, vector_field: &str) -> Self {
        Self {
            sync_version: record.sync_version,
            updated_at: record.updated_at,
            digest: record.canonical_digest(),
            deleted: record.deleted,
            vector_digest: record.vector_digest(vector_field),
        }
    }
}

/// What one store said about the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StoreObservation {
    Present(CopySnapshot),
    /// No copy: data loss to repair
    Missing,
    /// No copy yet, but the last write is within the grace window
    Pending,
    /// The read itself failed; nothing is known
    Unreachable { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub id: String,
    pub stores: BTreeMap<StoreKind, StoreObservation>,
    /// max(updated_at) - min(updated_at) over the copies present
    pub max_skew_ms: i64,
    pub tolerance_ms: i64,
    pub is_consistent: bool,
    pub checked_at: i64,
}

impl ConsistencyReport {
    /// Judge a set of observations. Stores absent from `stores` count as missing.
    #[must_use]
    pub fn evaluate(
        id: impl Into<String>,
        mut stores: BTreeMap<StoreKind, StoreObservation>,
        tolerance: Duration,
    ) -> Self {
        for kind in StoreKind::ALL {
            stores.entry(kind).or_insert(StoreObservation::Missing);
        }
        let tolerance_ms = tolerance.as_millis() as i64;

        let stamps: Vec<i64> = stores
            .values()
            .filter_map(|o| match o {
                StoreObservation::Present(s) => Some(s.updated_at),
                _ => None,
            })
            .collect();
        let max_skew_ms = match (stamps.iter().max(), stamps.iter().min()) {
            (Some(max), Some(min)) => max - min,
            _ => 0,
        };

        let is_consistent = match newest_copy(&stores) {
            None => false,
            Some((_, newest)) => {
                let vector = reference_vector(&stores, newest);
                let agrees = |o: &StoreObservation| match o {
                    StoreObservation::Present(s) => {
                        s.sync_version == newest.sync_version
                            && s.digest == newest.digest
                            && vectors_agree(s, vector)
                    }
                    // Tombstoned stores that delete natively have nothing left.
                    StoreObservation::Missing | StoreObservation::Pending => newest.deleted,
                    StoreObservation::Unreachable { .. } => false,
                };
                stores.values().all(agrees) && max_skew_ms <= tolerance_ms
            }
        };

        Self {
            id: id.into(),
            stores,
            max_skew_ms,
            tolerance_ms,
            is_consistent,
            checked_at: now_millis(),
        }
    }

    #[must_use]
    pub fn snapshot(&self, store: StoreKind) -> Option<&CopySnapshot> {
        match self.stores.get(&store) {
            Some(StoreObservation::Present(s)) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_present(&self, store: StoreKind) -> bool {
        self.snapshot(store).is_some()
    }

    #[must_use]
    pub fn updated_at(&self, store: StoreKind) -> Option<i64> {
        self.snapshot(store).map(|s| s.updated_at)
    }

    /// Some store could not be read, or is still within its grace window.
    #[must_use]
    pub fn has_unsettled(&self) -> bool {
        self.stores.values().any(|o| {
            matches!(o, StoreObservation::Pending | StoreObservation::Unreachable { .. })
        })
    }

    /// Highest `sync_version`, then latest `updated_at`, then store order.
    #[must_use]
    pub fn newest(&self) -> Option<(StoreKind, &CopySnapshot)> {
        newest_copy(&self.stores)
    }

    /// Stores whose copy has to be rewritten to match `source`.
    ///
    /// A copy within tolerance of the source that matches it otherwise is
    /// left alone. When only the pairwise spread between the other copies
    /// breaks the window, every copy whose timestamp differs from the
    /// source's is returned instead.
    #[must_use]
    pub fn divergent_from(&self, source: StoreKind) -> Vec<StoreKind> {
        let Some(src) = self.snapshot(source) else {
            return Vec::new();
        };
        let others = || StoreKind::ALL.into_iter().filter(move |k| *k != source);
        let vector = reference_vector(&self.stores, src);

        let divergent: Vec<StoreKind> = others()
            .filter(|kind| match self.stores.get(kind) {
                Some(StoreObservation::Present(s)) => {
                    s.sync_version != src.sync_version
                        || s.digest != src.digest
                        || !vectors_agree(s, vector)
                        || s.deleted != src.deleted
                        || (s.updated_at - src.updated_at).abs() > self.tolerance_ms
                }
                Some(StoreObservation::Unreachable { .. }) => true,
                Some(StoreObservation::Missing | StoreObservation::Pending) | None => !src.deleted,
            })
            .collect();

        if !divergent.is_empty() || self.is_consistent {
            return divergent;
        }
        others()
            .filter(|kind| self.updated_at(*kind).is_some_and(|t| t != src.updated_at))
            .collect()
    }
}

/// The vector every copy is held to: the reference copy's own, else the
/// first copy at the same version that holds one.
fn reference_vector<'a>(
    stores: &'a BTreeMap<StoreKind, StoreObservation>,
    reference: &'a CopySnapshot,
) -> Option<&'a str> {
    if reference.deleted {
        return None;
    }
    reference
        .vector_digest
        .as_deref()
        .or_else(|| {
            stores.values().find_map(|o| match o {
                StoreObservation::Present(s) if s.sync_version == reference.sync_version && !s.deleted => {
                    s.vector_digest.as_deref()
                }
                _ => None,
            })
        })
}

/// Copies without a vector (the visual store) are not compared on it.
fn vectors_agree(copy: &CopySnapshot, reference: Option<&str>) -> bool {
    match (copy.vector_digest.as_deref(), reference) {
        (Some(held), Some(expected)) => held == expected,
        _ => true,
    }
}

fn newest_copy(stores: &BTreeMap<StoreKind, StoreObservation>) -> Option<(StoreKind, &CopySnapshot)> {
    stores
        .iter()
        .filter_map(|(kind, o)| match o {
            StoreObservation::Present(s) => Some((*kind, s)),
            _ => None,
        })
        .max_by_key(|(kind, s)| (s.sync_version, s.updated_at, Reverse(*kind)))
}

impl SyncEngine {
    /// Read-only consistency report for `id`.
    #[tracing::instrument(skip(self))]
    pub async fn consistency_report(&self, id: &str) -> ConsistencyReport {
        self.observe(id).await.0
    }

    /// Reports for several ids in input order, `sync_batch_size` at a time.
    pub async fn check_many(&self, ids: &[String]) -> Vec<ConsistencyReport> {
        stream::iter(ids)
            .map(|id| self.consistency_report(id))
            .buffered(self.config.sync_batch_size.max(1))
            .collect()
            .await
    }

    /// Read all three copies in parallel and judge them.
    ///
    /// Also returns the copies themselves so the reconciler can repair from
    /// them without a second round of reads.
    pub(super) async fn observe(&self, id: &str) -> (ConsistencyReport, BTreeMap<StoreKind, LogicalRecord>) {
        let timeout = self.config.adapter_timeout();
        let reads = StoreKind::ALL.map(|kind| {
            let adapter = self.stores.get(kind).clone();
            async move {
                let attempted = call_with_retry(
                    kind,
                    "read",
                    &self.policy,
                    timeout,
                    Some(&self.shutdown_rx),
                    || adapter.read(id),
                )
                .await;
                (kind, attempted.into_result())
            }
        });

        let in_grace = self.within_missing_grace(id);
        let mut observations = BTreeMap::new();
        let mut copies = BTreeMap::new();
        for (kind, result) in join_all(reads).await {
            let observation = match result {
                Ok(Some(record)) => {
                    let snapshot = CopySnapshot::of(&record, &self.config.vector.vector_field);
                    copies.insert(kind, record);
                    StoreObservation::Present(snapshot)
                }
                Ok(None) | Err(AdapterError::NotFound) if in_grace => StoreObservation::Pending,
                Ok(None) | Err(AdapterError::NotFound) => StoreObservation::Missing,
                Err(e) => StoreObservation::Unreachable { error: e.to_string() },
            };
            crate::metrics::record_operation(kind.as_str(), "read", observation_label(&observation));
            observations.insert(kind, observation);
        }

        let report = ConsistencyReport::evaluate(id, observations, self.config.tolerance());
        crate::metrics::record_consistency_check(report.is_consistent);
        crate::metrics::record_skew(Duration::from_millis(report.max_skew_ms.max(0) as u64));
        if report.is_consistent {
            debug!(id, skew_ms = report.max_skew_ms, "Copies consistent");
        } else {
            info!(id, skew_ms = report.max_skew_ms, stores = ?report.stores, "Copies diverge");
        }
        (report, copies)
    }
}

fn observation_label(observation: &StoreObservation) -> &'static str {
    match observation {
        StoreObservation::Present(_) => "success",
        StoreObservation::Missing => "missing",
        StoreObservation::Pending => "pending",
        StoreObservation::Unreachable { .. } => "error",
    }
}
