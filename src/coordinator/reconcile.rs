//! Reconciler: repair an inconsistent record from its newest copy.
//!
//! The source of truth is a pure function of the observed copies: highest
//! `sync_version`, then latest `updated_at`, then relational before visual
//! before vector. Only the stores that diverge from the source are
//! rewritten. Each reconciliation performs at most one repair cycle; if the
//! copies still disagree afterwards the record is parked for manual review.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::record::{LogicalRecord, StoreKind};
use super::consistency::{ConsistencyReport, CopySnapshot};
use super::SyncEngine;

/// What one reconciliation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// Nothing to repair
    AlreadyConsistent,
    /// Divergent stores were rewritten and the recheck agreed
    Repaired { source: StoreKind, stores: Vec<StoreKind> },
    /// The newest copy is older than the locally accepted version; discarded
    Stale { source_version: u64, cached_version: u64 },
    /// A store could not be read or is still in its grace window
    Deferred { reason: String },
    /// Still divergent after one repair cycle
    FlaggedForReview { reason: String },
    /// Parked for an operator; skipped by the scheduler
    UnderReview,
    /// No store holds a copy
    NoSource,
}

impl ReconcileOutcome {
    /// Metric / log label.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::AlreadyConsistent => "consistent",
            Self::Repaired { .. } => "repaired",
            Self::Stale { .. } => "stale",
            Self::Deferred { .. } => "deferred",
            Self::FlaggedForReview { .. } => "flagged",
            Self::UnderReview => "under_review",
            Self::NoSource => "no_source",
        }
    }
}

/// Pick the copy every other store is repaired from.
#[must_use]
pub fn select_source(report: &ConsistencyReport) -> Option<(StoreKind, CopySnapshot)> {
    report.newest().map(|(kind, snapshot)| (kind, snapshot.clone()))
}

/// What reconciling a record would do, decided from one observation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairPlan {
    /// Copies agree; clear the queue up to `version`
    Settle { version: u64 },
    Defer { reason: String },
    NoSource,
    /// Newest copy is below the accepted version
    Discard { source_version: u64, cached_version: u64 },
    Flag { reason: String },
    Rewrite {
        source: StoreKind,
        version: u64,
        stores: Vec<StoreKind>,
        #[serde(skip)]
        record: Box<LogicalRecord>,
    },
}

/// Dry-run answer for one record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcilePreview {
    pub id: String,
    pub under_review: bool,
    pub plan: RepairPlan,
}

/// Decide the repair for one observation without touching any store.
///
/// `cached` is the locally accepted version, if any.
#[must_use]
pub fn plan_repair(
    report: &ConsistencyReport,
    copies: &BTreeMap<StoreKind, LogicalRecord>,
    cached: Option<u64>,
    vector_field: &str,
) -> RepairPlan {
    if report.is_consistent {
        return match report.newest() {
            Some((_, newest)) => RepairPlan::Settle { version: newest.sync_version },
            None => RepairPlan::NoSource,
        };
    }
    if report.has_unsettled() {
        return RepairPlan::Defer { reason: format!("unsettled stores: {:?}", unsettled(report)) };
    }

    let Some((source, snapshot)) = select_source(report) else {
        return RepairPlan::NoSource;
    };
    if let Some(cached) = cached.filter(|c| snapshot.sync_version < *c) {
        return RepairPlan::Discard { source_version: snapshot.sync_version, cached_version: cached };
    }

    let stores = report.divergent_from(source);
    let Some(record) = reconstruct(source, copies, vector_field) else {
        return RepairPlan::NoSource;
    };
    if stores.is_empty() {
        return RepairPlan::Flag { reason: "inconsistent with nothing to rewrite".into() };
    }

    let needs_vector = stores.iter().any(|kind| *kind != StoreKind::Visual);
    let vector_known = copies.values().any(|c| c.vector_digest(vector_field).is_some());
    if !record.deleted && needs_vector && vector_known && record.vector_digest(vector_field).is_none() {
        return RepairPlan::Flag { reason: format!("no v{} vector to copy from {}", record.sync_version, source) };
    }

    RepairPlan::Rewrite { source, version: record.sync_version, stores, record: Box::new(record) }
}

/// Rebuild the canonical record from the source copy.
///
/// The visual store never holds vectors, so a visual source borrows them
/// from the relational copy, else the vector copy, but only from a copy at
/// the same version. Cross-refs are merged from every copy, the relational
/// index taking precedence.
fn reconstruct(
    source: StoreKind,
    copies: &BTreeMap<StoreKind, LogicalRecord>,
    vector_field: &str,
) -> Option<LogicalRecord> {
    let copy = copies.get(&source)?;
    let mut record = if copy.deleted {
        LogicalRecord::tombstone(copy.id.clone(), copy.record_type.clone(), copy.updated_at)
            .with_sync_version(copy.sync_version)
    } else {
        copy.clone()
    };

    if !record.deleted && record.vector_digest(vector_field).is_none() {
        let donor = [StoreKind::Relational, StoreKind::Vector]
            .into_iter()
            .filter(|kind| *kind != source)
            .filter_map(|kind| copies.get(&kind))
            .find(|c| !c.deleted && c.sync_version == record.sync_version);
        if let Some(donor) = donor {
            for (name, value) in donor.fields.iter().filter(|(_, v)| v.is_vector()) {
                record.fields.entry(name.clone()).or_insert_with(|| value.clone());
            }
        }
    }

    record.cross_refs.clear();
    for kind in [StoreKind::Vector, StoreKind::Visual, StoreKind::Relational] {
        if let Some(other) = copies.get(&kind) {
            record.cross_refs.extend(other.cross_refs.iter().map(|(k, v)| (*k, v.clone())));
        }
    }
    Some(record)
}

impl SyncEngine {
    /// Check `id` and repair it if its copies diverge.
    ///
    /// `operator` reconciliations run even for records under review and
    /// release them once the copies agree; automatic ones skip parked
    /// records and park stale ones.
    pub(super) async fn reconcile_record(&self, id: &str, operator: bool) -> ReconcileOutcome {
        if !operator {
            match self.ledger.is_under_review(id).await {
                Ok(true) => return ReconcileOutcome::UnderReview,
                Ok(false) => {}
                Err(e) => {
                    crate::metrics::record_ledger_error("is_under_review");
                    return ReconcileOutcome::Deferred { reason: format!("ledger unavailable: {}", e) };
                }
            }
        }

        let lock = self.lock_id(id).await;
        let outcome = self.reconcile_locked(id, operator).await;
        drop(lock);

        crate::metrics::record_reconcile(outcome.label());
        match &outcome {
            ReconcileOutcome::AlreadyConsistent => debug!(id, "Already consistent"),
            ReconcileOutcome::Repaired { source, stores } => {
                info!(id, %source, ?stores, "Reconciled divergent stores");
            }
            ReconcileOutcome::FlaggedForReview { reason } => {
                warn!(id, reason = %reason, "Parked for manual review");
            }
            other => debug!(id, outcome = other.label(), "Reconciliation skipped"),
        }
        outcome
    }

    /// What reconciling each id would do right now. Reads every store,
    /// writes nothing and leaves the ledger untouched.
    #[tracing::instrument(skip(self, ids), fields(count = ids.len()))]
    pub async fn reconcile_dry_run(&self, ids: &[String]) -> Vec<ReconcilePreview> {
        let mut previews = Vec::with_capacity(ids.len());
        for id in ids {
            let under_review = match self.ledger.is_under_review(id).await {
                Ok(parked) => parked,
                Err(e) => {
                    crate::metrics::record_ledger_error("is_under_review");
                    warn!(id = %id, error = %e, "Could not read review state");
                    false
                }
            };
            let (report, copies) = self.observe(id).await;
            let plan = plan_repair(&report, &copies, self.local_version(id), &self.config.vector.vector_field);
            previews.push(ReconcilePreview { id: id.clone(), under_review, plan });
        }
        previews
    }

    async fn reconcile_locked(&self, id: &str, operator: bool) -> ReconcileOutcome {
        let (report, copies) = self.observe(id).await;
        let plan = plan_repair(&report, &copies, self.local_version(id), &self.config.vector.vector_field);

        let (source, stores, record) = match plan {
            RepairPlan::Settle { version } => {
                self.settle_consistent(id, version, operator).await;
                return ReconcileOutcome::AlreadyConsistent;
            }
            RepairPlan::Defer { reason } => return ReconcileOutcome::Deferred { reason },
            RepairPlan::NoSource => {
                if !operator {
                    self.flag(id, "no store holds a copy").await;
                }
                return ReconcileOutcome::NoSource;
            }
            RepairPlan::Discard { source_version, cached_version } => {
                if !operator {
                    let reason = format!("newest copy v{} is below accepted v{}", source_version, cached_version);
                    self.flag(id, &reason).await;
                }
                return ReconcileOutcome::Stale { source_version, cached_version };
            }
            RepairPlan::Flag { reason } => {
                self.flag(id, &reason).await;
                return ReconcileOutcome::FlaggedForReview { reason };
            }
            RepairPlan::Rewrite { source, stores, record, .. } => (source, stores, *record),
        };

        info!(id, %source, version = record.sync_version, targets = ?stores, "Repairing from source of truth");
        let result = self.fan_out(&record, &stores).await;
        self.persist_outcome(&record, &result).await;
        self.raise_local_version(&record);

        let (recheck, _) = self.observe(id).await;
        if recheck.is_consistent {
            self.settle_consistent(id, record.sync_version, operator).await;
            return ReconcileOutcome::Repaired { source, stores };
        }

        let failed = result.failed_stores();
        let reason = if failed.is_empty() {
            format!("still divergent after repair from {}", source)
        } else {
            format!("repair from {} failed on {:?}", source, failed)
        };
        self.flag(id, &reason).await;
        ReconcileOutcome::FlaggedForReview { reason }
    }

    async fn settle_consistent(&self, id: &str, version: u64, operator: bool) {
        // Versions claimed by writes that reached no store have nothing left to replay
        let claimed = self.local_version(id).unwrap_or(0);
        if let Err(e) = self.ledger.resolve_retries(id, version.max(claimed)).await {
            crate::metrics::record_ledger_error("resolve_retries");
            warn!(id, error = %e, "Could not clear retry queue entries");
        }
        if operator {
            match self.ledger.release_review(id).await {
                Ok(true) => info!(id, "Released from manual review after repair"),
                Ok(false) => {}
                Err(e) => {
                    crate::metrics::record_ledger_error("release_review");
                    warn!(id, error = %e, "Could not release from manual review");
                }
            }
        }
    }

    async fn flag(&self, id: &str, reason: &str) {
        if let Err(e) = self.ledger.flag_for_review(id, reason).await {
            crate::metrics::record_ledger_error("flag_for_review");
            error!(id, error = %e, "Failed to park record for manual review");
        }
    }
}

fn unsettled(report: &ConsistencyReport) -> Vec<StoreKind> {
    use super::consistency::StoreObservation;
    report
        .stores
        .iter()
        .filter(|(_, o)| matches!(o, StoreObservation::Pending | StoreObservation::Unreachable { .. }))
        .map(|(kind, _)| *kind)
        .collect()
}
