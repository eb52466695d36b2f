//! Public types for the sync engine coordinator.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::record::{CrossRefs, RecordError, StoreKind};
use crate::resilience::ledger::LedgerError;
use crate::storage::traits::AdapterError;

/// Engine lifecycle state.
///
/// Use [`super::SyncEngine::state()`] to check current state or
/// [`super::SyncEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed; writes and manual checks work, no scheduler yet
    Created,
    /// Scheduler loop active
    Running,
    /// Shutdown requested, in-flight work finishing
    ShuttingDown,
    /// Scheduler loop exited
    Stopped,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Per-store result of one coordinator write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStatus {
    Succeeded,
    /// Interrupted by shutdown before retries ran out; queued
    FailedRetryable,
    /// Rejected, or transient failures outlasted the retry budget; queued
    FailedPermanent,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreOutcome {
    pub status: StoreStatus,
    /// Native id acknowledged by the store
    pub native_id: Option<String>,
    /// Adapter invocations, the first one included
    pub attempts: u32,
    pub error: Option<AdapterError>,
}

impl StoreOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.status == StoreStatus::Succeeded
    }
}

/// Outcome of one coordinator invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteResult {
    pub id: String,
    /// Version the write was accepted at
    pub sync_version: u64,
    /// One entry per targeted store
    pub outcomes: BTreeMap<StoreKind, StoreOutcome>,
    /// Native ids known after this write
    pub cross_refs: CrossRefs,
    /// Some targeted stores failed, at least one succeeded
    pub partial: bool,
    pub elapsed: Duration,
}

impl WriteResult {
    /// Every targeted store acknowledged the write.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.outcomes.values().all(StoreOutcome::succeeded)
    }

    #[must_use]
    pub fn failed_stores(&self) -> Vec<StoreKind> {
        self.outcomes
            .iter()
            .filter(|(_, o)| !o.succeeded())
            .map(|(kind, _)| *kind)
            .collect()
    }

    #[must_use]
    pub fn attempts(&self, store: StoreKind) -> u32 {
        self.outcomes.get(&store).map_or(0, |o| o.attempts)
    }

    #[must_use]
    pub fn status(&self, store: StoreKind) -> Option<StoreStatus> {
        self.outcomes.get(&store).map(|o| o.status)
    }
}

/// Per-store probe results from [`super::SyncEngine::health_check()`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub stores: BTreeMap<StoreKind, bool>,
    pub ledger: bool,
    pub healthy: bool,
}

/// Counters for one scheduler pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub checked: usize,
    pub consistent: usize,
    pub repaired: usize,
    pub deferred: usize,
    pub flagged: usize,
    pub stale: usize,
    pub errors: usize,
    /// Shutdown interrupted the pass between records
    pub aborted: bool,
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Every targeted store failed; the result still carries per-store detail
    #[error("write of {} failed on every store", .0.id)]
    AllStoresFailed(Box<WriteResult>),

    #[error("{store} store error: {source}")]
    Store {
        store: StoreKind,
        #[source]
        source: AdapterError,
    },

    #[error("record {0} not found in any store")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl From<RecordError> for SyncError {
    fn from(err: RecordError) -> Self {
        Self::InvalidRecord(err.to_string())
    }
}
