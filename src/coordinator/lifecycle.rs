//! Scheduler: periodic consistency passes, the operator entry point, shutdown.
//!
//! A pass walks the records written since they were last checked plus every
//! record in the durable retry queue, oldest first, capped at
//! `sync_batch_size`. Each record is an independent unit of work, so a
//! shutdown between records leaves nothing half-done.

use std::collections::{BTreeSet, HashSet};
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::record::now_millis;
use super::reconcile::ReconcileOutcome;
use super::types::{EngineState, PassSummary, SyncError};
use super::SyncEngine;

impl SyncEngine {
    /// Run scheduler passes every `sync_interval_seconds` until
    /// [`shutdown()`](Self::shutdown) is called.
    ///
    /// Passes are skipped while `consistency_check_enabled` is false; the
    /// loop still runs so the engine reports `Running`.
    pub async fn run(&self) {
        if *self.shutdown_rx.borrow() {
            warn!("Shutdown already requested; scheduler not started");
            return;
        }
        let _ = self.state.send(EngineState::Running);
        crate::metrics::set_engine_state("Running");
        info!(
            interval = ?self.config.sync_interval(),
            batch = self.config.sync_batch_size,
            enabled = self.config.consistency_check_enabled,
            "Sync engine running"
        );

        let mut shutdown = self.shutdown_rx.clone();
        let mut interval = tokio::time::interval(self.config.sync_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }

                _ = interval.tick() => {
                    if !self.config.consistency_check_enabled {
                        debug!("Consistency checks disabled, skipping pass");
                        continue;
                    }
                    if let Err(e) = self.run_pass().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
            }
        }

        let _ = self.state.send(EngineState::Stopped);
        crate::metrics::set_engine_state("Stopped");
        info!("Sync engine stopped");
    }

    /// One scheduler pass.
    #[tracing::instrument(skip(self))]
    pub async fn run_pass(&self) -> Result<PassSummary, SyncError> {
        let started = Instant::now();
        let pass_start = now_millis();
        let limit = self.config.sync_batch_size.max(1);
        let mut summary = PassSummary::default();

        let candidates = self.pass_candidates(limit).await?;
        debug!(count = candidates.len(), "Scheduler pass starting");

        for id in candidates {
            if *self.shutdown_rx.borrow() {
                info!(checked = summary.checked, "Scheduler pass interrupted by shutdown");
                summary.aborted = true;
                break;
            }

            let outcome = self.reconcile_record(&id, false).await;
            summary.checked += 1;
            match &outcome {
                ReconcileOutcome::AlreadyConsistent => summary.consistent += 1,
                ReconcileOutcome::Repaired { .. } => summary.repaired += 1,
                ReconcileOutcome::Stale { .. } => summary.stale += 1,
                ReconcileOutcome::Deferred { .. } => summary.deferred += 1,
                ReconcileOutcome::FlaggedForReview { .. } | ReconcileOutcome::NoSource => summary.flagged += 1,
                ReconcileOutcome::UnderReview => {}
            }
            if !matches!(outcome, ReconcileOutcome::Deferred { .. }) {
                // A write that landed during the pass stays queued.
                self.recent.remove_if(&id, |_, written| *written <= pass_start);
            }
        }

        self.refresh_gauges(&mut summary).await;
        crate::metrics::record_pass(started.elapsed(), summary.checked, summary.repaired);
        info!(
            checked = summary.checked,
            consistent = summary.consistent,
            repaired = summary.repaired,
            deferred = summary.deferred,
            flagged = summary.flagged,
            stale = summary.stale,
            elapsed = ?started.elapsed(),
            "Scheduler pass complete"
        );
        Ok(summary)
    }

    /// Recent ids then retry-queue ids, oldest first, deduplicated, without
    /// parked records.
    async fn pass_candidates(&self, limit: usize) -> Result<Vec<String>, SyncError> {
        let queued = self.ledger.queued_records(limit).await?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::with_capacity(limit);
        for id in self.recent_ids() {
            if candidates.len() >= limit {
                break;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            if self.ledger.is_under_review(&id).await? {
                self.recent.remove(&id);
                continue;
            }
            candidates.push(id);
        }
        // The ledger already leaves parked records out of the queue.
        for id in queued {
            if candidates.len() >= limit {
                break;
            }
            if seen.insert(id.clone()) {
                candidates.push(id);
            }
        }
        Ok(candidates)
    }

    async fn refresh_gauges(&self, summary: &mut PassSummary) {
        match self.ledger.retry_depth().await {
            Ok(depth) => crate::metrics::set_retry_queue_depth(depth),
            Err(e) => {
                summary.errors += 1;
                crate::metrics::record_ledger_error("retry_depth");
                warn!(error = %e, "Could not read retry queue depth");
            }
        }
        match self.ledger.review_list().await {
            Ok(list) => crate::metrics::set_manual_review_depth(list.len()),
            Err(e) => {
                summary.errors += 1;
                crate::metrics::record_ledger_error("review_list");
                warn!(error = %e, "Could not read manual review list");
            }
        }
    }

    /// Check and, if needed, repair `id` now.
    ///
    /// Runs even for records parked for review, and releases them when the
    /// copies converge. A stale report is returned, not parked.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile_now(&self, id: &str) -> Result<ReconcileOutcome, SyncError> {
        if id.trim().is_empty() {
            return Err(SyncError::InvalidRecord("empty id".into()));
        }
        Ok(self.reconcile_record(id, true).await)
    }

    /// Every id this engine knows of: accepted versions, recent writes,
    /// the retry queue and the review list.
    pub async fn known_ids(&self) -> Result<Vec<String>, SyncError> {
        let mut ids: BTreeSet<String> = self.versions.iter().map(|v| v.key().clone()).collect();
        ids.extend(self.recent_ids());
        ids.extend(self.ledger.queued_records(usize::MAX).await?);
        ids.extend(self.ledger.review_list().await?.into_iter().map(|entry| entry.record_id));
        Ok(ids.into_iter().collect())
    }

    /// Stop the scheduler.
    ///
    /// Pending backoff sleeps are cut short and their calls reported as
    /// retryable failures; the current record of a pass finishes.
    #[tracing::instrument(skip(self))]
    pub fn shutdown(&self) {
        info!("Initiating sync engine shutdown...");
        let _ = self.shutdown_tx.send(true);
        if matches!(self.state(), EngineState::Running) {
            let _ = self.state.send(EngineState::ShuttingDown);
            crate::metrics::set_engine_state("ShuttingDown");
        } else {
            let _ = self.state.send(EngineState::Stopped);
            crate::metrics::set_engine_state("Stopped");
        }
    }
}
