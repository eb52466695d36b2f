//! Persisted repair state: the retry queue and the manual-review list.
//!
//! These are the only pieces of shared state that outlive a process. Both
//! accept concurrent appends from many coordinators and checkers; appends are
//! at-least-once and keyed so a duplicate is absorbed, never doubled.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::record::StoreKind;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger backend error: {0}")]
    Backend(String),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// A store write that did not succeed, queued for reconciliation.
///
/// Keyed by `(record_id, sync_version, store)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryEntry {
    pub record_id: String,
    pub sync_version: u64,
    pub store: StoreKind,
    pub error: String,
    /// Unix millis
    pub enqueued_at: i64,
}

/// A record parked for an operator after bounded reconciliation gave up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewEntry {
    pub record_id: String,
    pub reason: String,
    /// Unix millis
    pub flagged_at: i64,
}

#[async_trait]
pub trait RepairLedger: Send + Sync {
    /// Append to the retry queue. Re-enqueueing an existing key is a no-op.
    async fn enqueue_retry(&self, entry: RetryEntry) -> Result<(), LedgerError>;

    /// Oldest-first pending entries.
    async fn pending_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, LedgerError>;

    /// Distinct record ids with pending entries, ordered by their oldest
    /// entry. Records under review are left out, so parked records never
    /// crowd the rest of the queue out of a scheduler batch.
    async fn queued_records(&self, limit: usize) -> Result<Vec<String>, LedgerError>;

    /// Drop every entry for `record_id` at or below `up_to_version`.
    async fn resolve_retries(&self, record_id: &str, up_to_version: u64) -> Result<usize, LedgerError>;

    async fn retry_depth(&self) -> Result<usize, LedgerError>;

    /// Park a record for manual review. Flagging twice keeps the first entry.
    async fn flag_for_review(&self, record_id: &str, reason: &str) -> Result<(), LedgerError>;

    async fn is_under_review(&self, record_id: &str) -> Result<bool, LedgerError>;

    async fn review_list(&self) -> Result<Vec<ReviewEntry>, LedgerError>;

    /// Remove a record from review; `false` if it was not parked.
    async fn release_review(&self, record_id: &str) -> Result<bool, LedgerError>;
}

type RetryKey = (String, u64, StoreKind);

/// Process-local ledger for tests, demos and dry runs.
#[derive(Default)]
pub struct MemoryLedger {
    retries: Mutex<BTreeMap<RetryKey, RetryEntry>>,
    reviews: Mutex<BTreeMap<String, ReviewEntry>>,
}

impl MemoryLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RepairLedger for MemoryLedger {
    async fn enqueue_retry(&self, entry: RetryEntry) -> Result<(), LedgerError> {
        let key = (entry.record_id.clone(), entry.sync_version, entry.store);
        self.retries.lock().entry(key).or_insert(entry);
        Ok(())
    }

    async fn pending_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, LedgerError> {
        let mut entries: Vec<_> = self.retries.lock().values().cloned().collect();
        entries.sort_by_key(|e| e.enqueued_at);
        entries.truncate(limit);
        Ok(entries)
    }

    async fn queued_records(&self, limit: usize) -> Result<Vec<String>, LedgerError> {
        let reviews = self.reviews.lock();
        let retries = self.retries.lock();
        let mut oldest: BTreeMap<&str, i64> = BTreeMap::new();
        for entry in retries.values().filter(|e| !reviews.contains_key(&e.record_id)) {
            let at = oldest.entry(entry.record_id.as_str()).or_insert(entry.enqueued_at);
            *at = (*at).min(entry.enqueued_at);
        }
        let mut ids: Vec<(i64, &str)> = oldest.into_iter().map(|(id, at)| (at, id)).collect();
        ids.sort();
        Ok(ids.into_iter().take(limit).map(|(_, id)| id.to_string()).collect())
    }

    async fn resolve_retries(&self, record_id: &str, up_to_version: u64) -> Result<usize, LedgerError> {
        let mut retries = self.retries.lock();
        let before = retries.len();
        retries.retain(|(id, version, _), _| !(id == record_id && *version <= up_to_version));
        Ok(before - retries.len())
    }

    async fn retry_depth(&self) -> Result<usize, LedgerError> {
        Ok(self.retries.lock().len())
    }

    async fn flag_for_review(&self, record_id: &str, reason: &str) -> Result<(), LedgerError> {
        self.reviews
            .lock()
            .entry(record_id.to_string())
            .or_insert_with(|| ReviewEntry {
                record_id: record_id.to_string(),
                reason: reason.to_string(),
                flagged_at: crate::record::now_millis(),
            });
        Ok(())
    }

    async fn is_under_review(&self, record_id: &str) -> Result<bool, LedgerError> {
        Ok(self.reviews.lock().contains_key(record_id))
    }

    async fn review_list(&self) -> Result<Vec<ReviewEntry>, LedgerError> {
        Ok(self.reviews.lock().values().cloned().collect())
    }

    async fn release_review(&self, record_id: &str) -> Result<bool, LedgerError> {
        Ok(self.reviews.lock().remove(record_id).is_some())
    }
}
