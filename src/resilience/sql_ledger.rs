//! Durable repair ledger on sqlx `Any` (SQLite locally, Postgres shared).
//!
//! ```sql
//! CREATE TABLE retry_queue (
//!   record_id TEXT NOT NULL,
//!   sync_version BIGINT NOT NULL,
//!   store TEXT NOT NULL,
//!   error TEXT NOT NULL,
//!   enqueued_at BIGINT NOT NULL,
//!   PRIMARY KEY (record_id, sync_version, store)
//! );
//! CREATE TABLE manual_review (
//!   record_id TEXT PRIMARY KEY,
//!   reason TEXT NOT NULL,
//!   flagged_at BIGINT NOT NULL
//! );
//! ```
//!
//! Appends use `ON CONFLICT DO NOTHING`, so several engines can share one
//! database and a duplicate append is absorbed.

use async_trait::async_trait;
use sqlx::any::AnyRow;
use sqlx::{AnyPool, Row};
use tracing::info;

use crate::record::{now_millis, StoreKind};
use crate::storage::sql::connect_pool;
use super::ledger::{LedgerError, RepairLedger, RetryEntry, ReviewEntry};

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS retry_queue (\
        record_id TEXT NOT NULL, \
        sync_version BIGINT NOT NULL, \
        store TEXT NOT NULL, \
        error TEXT NOT NULL, \
        enqueued_at BIGINT NOT NULL, \
        PRIMARY KEY (record_id, sync_version, store))",
    "CREATE INDEX IF NOT EXISTS idx_retry_queue_enqueued ON retry_queue (enqueued_at)",
    "CREATE TABLE IF NOT EXISTS manual_review (\
        record_id TEXT PRIMARY KEY, \
        reason TEXT NOT NULL, \
        flagged_at BIGINT NOT NULL)",
];

fn backend(err: sqlx::Error) -> LedgerError {
    LedgerError::Backend(err.to_string())
}

pub struct SqlLedger {
    pool: AnyPool,
}

impl SqlLedger {
    /// Connect and create the ledger tables if needed.
    pub async fn connect(url: &str) -> Result<Self, LedgerError> {
        let pool = connect_pool(url, 4).await.map_err(backend)?;
        let ledger = Self { pool };
        ledger.init_schema().await?;
        info!(url, "Repair ledger ready");
        Ok(ledger)
    }

    async fn init_schema(&self) -> Result<(), LedgerError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(backend)?;
        }
        Ok(())
    }
}

fn retry_from_row(row: &AnyRow) -> Result<RetryEntry, LedgerError> {
    let store: String = row.try_get("store").map_err(backend)?;
    let sync_version: i64 = row.try_get("sync_version").map_err(backend)?;
    Ok(RetryEntry {
        record_id: row.try_get("record_id").map_err(backend)?,
        sync_version: u64::try_from(sync_version)
            .map_err(|_| LedgerError::Corrupt(format!("negative sync_version {}", sync_version)))?,
        store: store
            .parse::<StoreKind>()
            .map_err(|_| LedgerError::Corrupt(format!("unknown store {:?}", store)))?,
        error: row.try_get("error").map_err(backend)?,
        enqueued_at: row.try_get("enqueued_at").map_err(backend)?,
    })
}

#[async_trait]
impl RepairLedger for SqlLedger {
    async fn enqueue_retry(&self, entry: RetryEntry) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO retry_queue (record_id, sync_version, store, error, enqueued_at) \
             VALUES ($1, $2, $3, $4, $5) ON CONFLICT DO NOTHING",
        )
        .bind(&entry.record_id)
        .bind(entry.sync_version as i64)
        .bind(entry.store.as_str())
        .bind(&entry.error)
        .bind(entry.enqueued_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn pending_retries(&self, limit: usize) -> Result<Vec<RetryEntry>, LedgerError> {
        let rows = sqlx::query(
            "SELECT record_id, sync_version, store, error, enqueued_at FROM retry_queue \
             ORDER BY enqueued_at, record_id LIMIT $1",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(retry_from_row).collect()
    }

    async fn queued_records(&self, limit: usize) -> Result<Vec<String>, LedgerError> {
        let rows = sqlx::query(
            "SELECT record_id, MIN(enqueued_at) AS first_at FROM retry_queue \
             WHERE record_id NOT IN (SELECT record_id FROM manual_review) \
             GROUP BY record_id ORDER BY first_at, record_id LIMIT $1",
        )
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        rows.iter().map(|row| row.try_get("record_id").map_err(backend)).collect()
    }

    async fn resolve_retries(&self, record_id: &str, up_to_version: u64) -> Result<usize, LedgerError> {
        let result = sqlx::query("DELETE FROM retry_queue WHERE record_id = $1 AND sync_version <= $2")
            .bind(record_id)
            .bind(up_to_version.min(i64::MAX as u64) as i64)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() as usize)
    }

    async fn retry_depth(&self) -> Result<usize, LedgerError> {
        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM retry_queue")
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?
            .try_get("n")
            .map_err(backend)?;
        Ok(count.max(0) as usize)
    }

    async fn flag_for_review(&self, record_id: &str, reason: &str) -> Result<(), LedgerError> {
        sqlx::query(
            "INSERT INTO manual_review (record_id, reason, flagged_at) VALUES ($1, $2, $3) \
             ON CONFLICT DO NOTHING",
        )
        .bind(record_id)
        .bind(reason)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn is_under_review(&self, record_id: &str) -> Result<bool, LedgerError> {
        let row = sqlx::query("SELECT record_id FROM manual_review WHERE record_id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }

    async fn review_list(&self) -> Result<Vec<ReviewEntry>, LedgerError> {
        let rows = sqlx::query("SELECT record_id, reason, flagged_at FROM manual_review ORDER BY flagged_at, record_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend)?;
        rows.iter()
            .map(|row| {
                Ok(ReviewEntry {
                    record_id: row.try_get("record_id").map_err(backend)?,
                    reason: row.try_get("reason").map_err(backend)?,
                    flagged_at: row.try_get("flagged_at").map_err(backend)?,
                })
            })
            .collect()
    }

    async fn release_review(&self, record_id: &str) -> Result<bool, LedgerError> {
        let result = sqlx::query("DELETE FROM manual_review WHERE record_id = $1")
            .bind(record_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn ledger() -> (TempDir, SqlLedger) {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        let ledger = SqlLedger::connect(&url).await.unwrap();
        (dir, ledger)
    }

    fn entry(id: &str, version: u64, store: StoreKind, at: i64) -> RetryEntry {
        RetryEntry {
            record_id: id.into(),
            sync_version: version,
            store,
            error: "unavailable: connection reset".into(),
            enqueued_at: at,
        }
    }

    #[tokio::test]
    async fn test_duplicate_appends_are_absorbed() {
        let (_dir, ledger) = ledger().await;
        ledger.enqueue_retry(entry("r1", 1, StoreKind::Vector, 10)).await.unwrap();
        ledger.enqueue_retry(entry("r1", 1, StoreKind::Vector, 20)).await.unwrap();
        ledger.enqueue_retry(entry("r1", 1, StoreKind::Visual, 30)).await.unwrap();

        assert_eq!(ledger.retry_depth().await.unwrap(), 2);
        let pending = ledger.pending_retries(10).await.unwrap();
        assert_eq!(pending[0], entry("r1", 1, StoreKind::Vector, 10));
    }

    #[tokio::test]
    async fn test_pending_is_oldest_first_and_limited() {
        let (_dir, ledger) = ledger().await;
        ledger.enqueue_retry(entry("late", 1, StoreKind::Visual, 300)).await.unwrap();
        ledger.enqueue_retry(entry("early", 1, StoreKind::Visual, 100)).await.unwrap();
        ledger.enqueue_retry(entry("mid", 1, StoreKind::Visual, 200)).await.unwrap();

        let ids: Vec<_> = ledger
            .pending_retries(2)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.record_id)
            .collect();
        assert_eq!(ids, vec!["early", "mid"]);
    }

    #[tokio::test]
    async fn test_resolve_only_covers_older_versions() {
        let (_dir, ledger) = ledger().await;
        ledger.enqueue_retry(entry("r1", 1, StoreKind::Vector, 1)).await.unwrap();
        ledger.enqueue_retry(entry("r1", 2, StoreKind::Vector, 2)).await.unwrap();
        ledger.enqueue_retry(entry("r1", 3, StoreKind::Vector, 3)).await.unwrap();

        assert_eq!(ledger.resolve_retries("r1", 2).await.unwrap(), 2);
        assert_eq!(ledger.pending_retries(10).await.unwrap()[0].sync_version, 3);
    }

    #[tokio::test]
    async fn test_queued_records_skip_parked_ids() {
        let (_dir, ledger) = ledger().await;
        for (n, id) in ["p1", "p2", "p3"].iter().enumerate() {
            ledger.enqueue_retry(entry(id, 1, StoreKind::Visual, n as i64)).await.unwrap();
            ledger.enqueue_retry(entry(id, 1, StoreKind::Vector, n as i64)).await.unwrap();
            ledger.flag_for_review(id, "stuck").await.unwrap();
        }
        ledger.enqueue_retry(entry("r2", 1, StoreKind::Visual, 100)).await.unwrap();
        ledger.enqueue_retry(entry("r2", 2, StoreKind::Visual, 200)).await.unwrap();

        assert_eq!(ledger.queued_records(1).await.unwrap(), vec!["r2"]);
        assert_eq!(ledger.retry_depth().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_review_lifecycle() {
        let (_dir, ledger) = ledger().await;
        ledger.flag_for_review("r1", "first").await.unwrap();
        ledger.flag_for_review("r1", "second").await.unwrap();

        assert!(ledger.is_under_review("r1").await.unwrap());
        let list = ledger.review_list().await.unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].reason, "first");

        assert!(ledger.release_review("r1").await.unwrap());
        assert!(!ledger.release_review("r1").await.unwrap());
        assert!(!ledger.is_under_review("r1").await.unwrap());
    }

    #[tokio::test]
    async fn test_state_survives_reconnect() {
        let dir = TempDir::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("ledger.db").display());
        {
            let ledger = SqlLedger::connect(&url).await.unwrap();
            ledger.enqueue_retry(entry("r1", 1, StoreKind::Visual, 1)).await.unwrap();
            ledger.flag_for_review("r2", "stuck").await.unwrap();
        }
        let ledger = SqlLedger::connect(&url).await.unwrap();
        assert_eq!(ledger.retry_depth().await.unwrap(), 1);
        assert!(ledger.is_under_review("r2").await.unwrap());
    }
}
