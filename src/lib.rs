//! # Tristore Sync
//!
//! Keeps one logical record consistent across three heterogeneous stores:
//! a visual-interface store (Airtable), a relational store (Postgres or
//! SQLite) and a vector store (Pinecone).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Write Coordinator                       │
//! │  • Assigns sync_version, fans out to all stores in parallel │
//! │  • Per-store retry/backoff, per-call timeout                │
//! │  • Partial failure → WriteResult { partial } + retry queue  │
//! └─────────────────────────────────────────────────────────────┘
//!          │                    │                     │
//!          ▼                    ▼                     ▼
//!   ┌────────────┐      ┌──────────────┐      ┌─────────────┐
//!   │   Visual   │      │  Relational  │      │   Vector    │
//!   │ (Airtable) │      │ (sqlx Any)   │      │ (Pinecone)  │
//!   │   leaf     │      │ cross-ref    │      │   leaf      │
//!   │            │      │ index +      │      │             │
//!   │            │      │ tie-breaker  │      │             │
//!   └────────────┘      └──────────────┘      └─────────────┘
//!          ▲                    ▲                     ▲
//!          └──────── Consistency Checker ─────────────┘
//!                              │ divergent?
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reconciler                           │
//! │  • Source of truth = highest sync_version, then updated_at  │
//! │  • Rewrites only the divergent stores, one cycle            │
//! │  • Still divergent → manual review                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tristore_sync::{LogicalRecord, QueryIntent, SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = SyncConfig::load("tristore.toml").expect("config");
//!     let engine = SyncEngine::connect(config).await.expect("connect");
//!
//!     let record = LogicalRecord::new("content")
//!         .with_field("title", "Hearing notes")
//!         .with_field("embedding", vec![0.0_f32; 1536]);
//!     let result = engine.write(record).await.expect("write");
//!     if result.partial {
//!         eprintln!("queued for reconciliation: {:?}", result.failed_stores());
//!     }
//!
//!     let copy = engine.read(&result.id, QueryIntent::VisualBrowse).await.expect("read");
//!     println!("{:?}", copy);
//!
//!     let report = engine.consistency_report(&result.id).await;
//!     println!("consistent: {}", report.is_consistent);
//! }
//! ```
//!
//! ## Features
//!
//! - **Parallel fan-out**: write and check latency is bounded by the slowest store
//! - **Classified retries**: `Unavailable`/`RateLimited` back off, `Rejected` fails fast
//! - **Version-guarded relational upserts**: writes land in non-decreasing `sync_version` order
//! - **Bounded reconciliation**: one repair cycle, then manual review
//! - **Durable ledger**: retry queue and review list survive restarts
//! - **Intent-based reads**: with fallback to the other stores
//!
//! ## Modules
//!
//! - [`coordinator`]: the [`SyncEngine`] (write, check, reconcile, route, schedule)
//! - [`storage`]: store adapters (Airtable, sqlx, Pinecone, in-memory)
//! - [`resilience`]: retry policy and the repair ledger
//! - [`record`]: the canonical [`LogicalRecord`]
//! - [`config`]: [`SyncConfig`]
//! - [`metrics`]: `metrics` crate instrumentation

pub mod config;
pub mod record;
pub mod storage;
pub mod resilience;
pub mod coordinator;
pub mod metrics;

pub use config::{ConfigError, SyncConfig};
pub use record::{CrossRefs, FieldValue, LogicalRecord, RecordError, StoreKind};
pub use coordinator::{
    fallback_order, plan_repair, route_read, select_source, ConsistencyReport, CopySnapshot, EngineState,
    HealthReport, PassSummary, QueryIntent, ReconcileOutcome, ReconcilePreview, RepairPlan, StoreObservation,
    StoreOutcome, StoreSet, StoreStatus, SyncEngine, SyncError, WriteResult,
};
pub use storage::traits::{AdapterError, StoreAdapter};
pub use storage::memory::{FaultOp, InMemoryAdapter};
pub use storage::sql::RelationalAdapter;
pub use storage::airtable::VisualAdapter;
pub use storage::vector::VectorAdapter;
pub use resilience::retry::{call_with_retry, RetryPolicy};
pub use resilience::ledger::{LedgerError, MemoryLedger, RepairLedger, RetryEntry, ReviewEntry};
pub use resilience::sql_ledger::SqlLedger;
pub use metrics::LatencyTimer;
