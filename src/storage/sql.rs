// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relational store backend (Postgres in production, SQLite for local runs).
//!
//! The relational copy is the reconciliation tie-break authority and the
//! owner of the cross-reference index:
//! ```sql
//! CREATE TABLE sync_records (
//!   id TEXT PRIMARY KEY,
//!   record_type TEXT NOT NULL,
//!   fields TEXT NOT NULL,         -- canonical fields as tagged JSON
//!   created_at BIGINT NOT NULL,   -- epoch millis
//!   updated_at BIGINT NOT NULL,
//!   sync_version BIGINT NOT NULL,
//!   deleted BIGINT NOT NULL,      -- tombstones stay as rows
//!   visual_ref TEXT,              -- Airtable record id
//!   vector_ref TEXT               -- Pinecone vector id
//! )
//! ```
//!
//! ## Version guard
//!
//! The upsert only applies when the incoming `sync_version` is not older than
//! the stored one, so writes land in non-decreasing version order even when
//! a slow repair races a fresh write:
//!
//! ```sql
//! ON CONFLICT (id) DO UPDATE SET ...
//! WHERE sync_records.sync_version <= excluded.sync_version
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! Booleans and unsigned integers do not map uniformly across drivers, so
//! `deleted` and `sync_version` are stored as BIGINT. Placeholders use the
//! `$N` form, which both Postgres and SQLite accept.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tracing::{debug, info};

use crate::config::RelationalStoreConfig;
use crate::record::{CrossRefs, FieldValue, LogicalRecord, StoreKind};
use crate::resilience::retry::{retry, RetryPolicy};
use super::traits::{AdapterError, StoreAdapter};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Open an `Any` pool with startup-mode retry (fails fast if config is wrong).
///
/// In-memory SQLite gets a single, never-recycled connection, since every
/// new connection would see an empty database.
pub(crate) async fn connect_pool(url: &str, max_connections: u32) -> Result<AnyPool, sqlx::Error> {
    install_drivers();
    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    let pool = retry("sql_connect", &RetryPolicy::startup(), || async {
        let options = AnyPoolOptions::new().acquire_timeout(Duration::from_secs(10));
        let options = if in_memory {
            options.max_connections(1).min_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            options.max_connections(max_connections.max(1)).idle_timeout(Duration::from_secs(300))
        };
        options.connect(url).await
    })
    .await?;

    if url.starts_with("sqlite:") && !in_memory {
        // Concurrent readers during writes
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    }
    Ok(pool)
}

/// Map a sqlx failure into the adapter taxonomy.
///
/// Connection-level failures and the database errors that mean "try again"
/// (Postgres classes 08/40/53/57, SQLite BUSY/LOCKED) are transient;
/// everything else is a permanent rejection.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AdapterError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AdapterError::Unavailable(format!("relational: {}", err)),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.into_owned()).unwrap_or_default();
            let transient = ["08", "40", "53", "57"].iter().any(|class| code.starts_with(class))
                || code == "5"
                || code == "6";
            if transient {
                AdapterError::Unavailable(format!("relational: {}", err))
            } else {
                AdapterError::Rejected(format!("relational: {}", err))
            }
        }
        _ => AdapterError::Rejected(format!("relational: {}", err)),
    }
}

const UPSERT: &str = "INSERT INTO sync_records \
     (id, record_type, fields, created_at, updated_at, sync_version, deleted) \
     VALUES ($1, $2, $3, $4, $5, $6, $7) \
     ON CONFLICT (id) DO UPDATE SET \
        record_type = excluded.record_type, \
        fields = excluded.fields, \
        created_at = excluded.created_at, \
        updated_at = excluded.updated_at, \
        sync_version = excluded.sync_version, \
        deleted = excluded.deleted \
     WHERE sync_records.sync_version <= excluded.sync_version";

const SELECT: &str = "SELECT id, record_type, fields, created_at, updated_at, sync_version, deleted, \
     visual_ref, vector_ref FROM sync_records WHERE id = $1";

pub struct RelationalAdapter {
    pool: AnyPool,
}

impl RelationalAdapter {
    /// Connect and create the schema if needed.
    pub async fn connect(config: &RelationalStoreConfig) -> Result<Self, AdapterError> {
        let url = config
            .url
            .as_deref()
            .ok_or_else(|| AdapterError::Rejected("relational.url is not configured".into()))?;
        let pool = connect_pool(url, config.max_connections)
            .await
            .map_err(map_sqlx_error)?;
        Self::from_pool(pool).await
    }

    /// Wrap an existing pool, creating the schema if needed.
    pub async fn from_pool(pool: AnyPool) -> Result<Self, AdapterError> {
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), AdapterError> {
        retry("sql_init_schema", &RetryPolicy::startup(), || async {
            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS sync_records (
                    id TEXT PRIMARY KEY,
                    record_type TEXT NOT NULL,
                    fields TEXT NOT NULL,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    sync_version BIGINT NOT NULL,
                    deleted BIGINT NOT NULL DEFAULT 0,
                    visual_ref TEXT,
                    vector_ref TEXT
                )
                "#,
            )
            .execute(&self.pool)
            .await?;
            sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_records_updated_at ON sync_records (updated_at)")
                .execute(&self.pool)
                .await?;
            Ok::<_, sqlx::Error>(())
        })
        .await
        .map_err(map_sqlx_error)?;

        info!("Relational schema ready");
        Ok(())
    }

    async fn stored_version(&self, id: &str) -> Result<Option<i64>, AdapterError> {
        let row = sqlx::query("SELECT sync_version FROM sync_records WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|r| r.try_get::<i64, _>("sync_version"))
            .transpose()
            .map_err(map_sqlx_error)
    }
}

fn record_from_row(row: &AnyRow) -> Result<LogicalRecord, AdapterError> {
    let id: String = row.try_get("id").map_err(map_sqlx_error)?;
    let record_type: String = row.try_get("record_type").map_err(map_sqlx_error)?;
    let fields_json: String = row.try_get("fields").map_err(map_sqlx_error)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_error)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(map_sqlx_error)?;
    let sync_version: i64 = row.try_get("sync_version").map_err(map_sqlx_error)?;
    let deleted: i64 = row.try_get("deleted").map_err(map_sqlx_error)?;
    let visual_ref: Option<String> = row.try_get("visual_ref").map_err(map_sqlx_error)?;
    let vector_ref: Option<String> = row.try_get("vector_ref").map_err(map_sqlx_error)?;

    let fields = serde_json::from_str(&fields_json)
        .map_err(|e| AdapterError::Rejected(format!("relational: corrupt fields for {}: {}", id, e)))?;

    let mut cross_refs = CrossRefs::new();
    cross_refs.insert(StoreKind::Relational, id.clone());
    if let Some(visual) = visual_ref {
        cross_refs.insert(StoreKind::Visual, visual);
    }
    if let Some(vector) = vector_ref {
        cross_refs.insert(StoreKind::Vector, vector);
    }

    Ok(LogicalRecord {
        id,
        record_type,
        fields,
        created_at,
        updated_at,
        cross_refs,
        sync_version: sync_version.max(0) as u64,
        deleted: deleted != 0,
    })
}

#[async_trait]
impl StoreAdapter for RelationalAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError> {
        let fields: std::collections::BTreeMap<&String, &FieldValue> = if record.deleted {
            Default::default()
        } else {
            record.fields.iter().collect()
        };
        let fields_json = serde_json::to_string(&fields)
            .map_err(|e| AdapterError::Rejected(format!("relational: {}", e)))?;
        let version = i64::try_from(record.sync_version)
            .map_err(|_| AdapterError::Rejected(format!("sync_version {} out of range", record.sync_version)))?;

        let result = sqlx::query(UPSERT)
            .bind(&record.id)
            .bind(&record.record_type)
            .bind(&fields_json)
            .bind(record.created_at)
            .bind(record.updated_at)
            .bind(version)
            .bind(i64::from(record.deleted))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            let stored = self.stored_version(&record.id).await?.unwrap_or_default();
            return Err(AdapterError::Rejected(format!(
                "stale sync_version {} (stored {})",
                record.sync_version, stored
            )));
        }
        debug!(id = %record.id, version, "Relational upsert applied");
        Ok(record.id.clone())
    }

    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        let row = sqlx::query(SELECT)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        let result = sqlx::query("DELETE FROM sync_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(AdapterError::NotFound);
        }
        Ok(())
    }

    async fn attach_cross_refs(&self, id: &str, refs: &CrossRefs) -> Result<(), AdapterError> {
        // COALESCE: a missing entry never clears a stored one.
        let result = sqlx::query(
            "UPDATE sync_records SET visual_ref = COALESCE($2, visual_ref), \
             vector_ref = COALESCE($3, vector_ref) WHERE id = $1",
        )
        .bind(id)
        .bind(refs.get(&StoreKind::Visual).cloned())
        .bind(refs.get(&StoreKind::Vector).cloned())
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        if result.rows_affected() == 0 {
            return Err(AdapterError::NotFound);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), AdapterError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (TempDir, RelationalAdapter) {
        let dir = tempfile::tempdir().unwrap();
        let config = RelationalStoreConfig {
            url: Some(format!("sqlite://{}?mode=rwc", dir.path().join("relational.db").display())),
            max_connections: 4,
        };
        let adapter = RelationalAdapter::connect(&config).await.unwrap();
        (dir, adapter)
    }

    fn record(id: &str, version: u64) -> LogicalRecord {
        LogicalRecord::with_id(id, "content")
            .with_field("title", "Council minutes")
            .with_field("view_count", 12.0)
            .with_field("embedding", vec![0.5_f32, 0.25])
            .with_sync_version(version)
            .with_timestamps(1_000, 2_000)
    }

    #[tokio::test]
    async fn test_write_then_read_round_trips() {
        let (_dir, store) = store().await;
        let original = record("r1", 1);
        assert_eq!(store.write(&original).await.unwrap(), "r1");

        let back = store.read("r1").await.unwrap().unwrap();
        assert_eq!(back.canonical_digest(), original.canonical_digest());
        assert_eq!(back.fields["embedding"], original.fields["embedding"]);
        assert_eq!((back.created_at, back.updated_at, back.sync_version), (1_000, 2_000, 1));
        assert_eq!(back.cross_refs.get(&StoreKind::Relational).map(String::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn test_read_missing_is_none() {
        let (_dir, store) = store().await;
        assert!(store.read("nope").await.unwrap().is_none());
        assert_eq!(store.delete("nope").await, Err(AdapterError::NotFound));
    }

    #[tokio::test]
    async fn test_rewrite_same_version_is_idempotent() {
        let (_dir, store) = store().await;
        store.write(&record("r1", 2)).await.unwrap();
        store.write(&record("r1", 2)).await.unwrap();

        let count: i64 = sqlx::query("SELECT COUNT(*) AS n FROM sync_records")
            .fetch_one(&store.pool)
            .await
            .unwrap()
            .try_get("n")
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (_dir, store) = store().await;
        store.write(&record("r1", 3)).await.unwrap();

        let err = store.write(&record("r1", 2)).await.unwrap_err();
        assert!(matches!(err, AdapterError::Rejected(ref m) if m.contains("stale")));
        assert_eq!(store.read("r1").await.unwrap().unwrap().sync_version, 3);
    }

    #[tokio::test]
    async fn test_tombstone_keeps_row() {
        let (_dir, store) = store().await;
        store.write(&record("r1", 1)).await.unwrap();
        let tomb = LogicalRecord::tombstone("r1", "content", 5_000).with_sync_version(2);
        store.write(&tomb).await.unwrap();

        let back = store.read("r1").await.unwrap().unwrap();
        assert!(back.deleted);
        assert!(back.fields.is_empty());
        assert_eq!(back.sync_version, 2);
    }

    #[tokio::test]
    async fn test_cross_refs_are_never_cleared() {
        let (_dir, store) = store().await;
        store.write(&record("r1", 1)).await.unwrap();

        let mut refs = CrossRefs::new();
        refs.insert(StoreKind::Visual, "recA".into());
        refs.insert(StoreKind::Vector, "r1".into());
        store.attach_cross_refs("r1", &refs).await.unwrap();

        // Only the vector ref this time; the visual one must survive.
        let mut partial = CrossRefs::new();
        partial.insert(StoreKind::Vector, "r1".into());
        store.attach_cross_refs("r1", &partial).await.unwrap();
        store.write(&record("r1", 2)).await.unwrap();

        let back = store.read("r1").await.unwrap().unwrap();
        assert_eq!(back.cross_refs.get(&StoreKind::Visual).map(String::as_str), Some("recA"));
        assert_eq!(back.cross_refs.get(&StoreKind::Vector).map(String::as_str), Some("r1"));
    }

    #[tokio::test]
    async fn test_attach_to_missing_row_is_not_found() {
        let (_dir, store) = store().await;
        let refs = CrossRefs::new();
        assert_eq!(store.attach_cross_refs("ghost", &refs).await, Err(AdapterError::NotFound));
    }

    #[tokio::test]
    async fn test_in_memory_url_keeps_data() {
        let config = RelationalStoreConfig {
            url: Some("sqlite::memory:".into()),
            max_connections: 8,
        };
        let store = RelationalAdapter::connect(&config).await.unwrap();
        store.write(&record("r1", 1)).await.unwrap();
        assert!(store.read("r1").await.unwrap().is_some());
        assert!(store.ping().await.is_ok());
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(map_sqlx_error(sqlx::Error::PoolTimedOut).is_retryable());
        assert!(!map_sqlx_error(sqlx::Error::RowNotFound).is_retryable());
    }
}
