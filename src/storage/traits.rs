use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::record::{CrossRefs, LogicalRecord, StoreKind};

/// Failure taxonomy every adapter maps its native errors into.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdapterError {
    /// Network error or timeout (retryable)
    #[error("store unavailable: {0}")]
    Unavailable(String),
    /// Quota exceeded (retryable, with a longer backoff)
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Validation or schema error (permanent, never retried)
    #[error("rejected by store: {0}")]
    Rejected(String),
    /// No copy of the record (read/delete only)
    #[error("record not found")]
    NotFound,
}

impl AdapterError {
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::RateLimited { .. })
    }

    /// Short label for metrics and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable(_) => "unavailable",
            Self::RateLimited { .. } => "rate_limited",
            Self::Rejected(_) => "rejected",
            Self::NotFound => "not_found",
        }
    }
}

/// Uniform read/write/delete contract implemented once per backing store.
///
/// Implementations own the translation between [`LogicalRecord::fields`] and
/// their native schema, and must upsert keyed by `id`: writing the same
/// `(id, sync_version)` twice never creates a second native record. Any retry
/// logic inside a vendor SDK must be disabled or bounded, since the engine's
/// retry policy already wraps every call.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Which store this adapter talks to.
    fn kind(&self) -> StoreKind;

    /// Upsert the record and return the store's native id for it.
    ///
    /// A tombstone (`record.deleted`) is still a write: stores that cannot
    /// hold tombstones delete natively and treat "already gone" as success.
    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError>;

    /// Read the record back in canonical form, `Ok(None)` when absent.
    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError>;

    /// Remove the native copy. `NotFound` when there was nothing to remove.
    async fn delete(&self, id: &str) -> Result<(), AdapterError>;

    /// Persist the cross-reference index for a record.
    ///
    /// Only the relational store keeps `cross_refs`; other stores are
    /// leaves and ignore this call.
    async fn attach_cross_refs(&self, _id: &str, _refs: &CrossRefs) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Cheap connectivity probe.
    async fn ping(&self) -> Result<(), AdapterError> {
        match self.read("__health_check__").await {
            Ok(_) | Err(AdapterError::NotFound) => Ok(()),
            Err(e) => Err(e),
        }
    }
}
