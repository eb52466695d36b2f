use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::record::{CrossRefs, FieldValue, LogicalRecord, StoreKind};
use super::traits::{AdapterError, StoreAdapter};

#[derive(Debug, Clone)]
struct StoredCopy {
    native_id: String,
    record: LogicalRecord,
}

/// Which adapter operation a scripted fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOp {
    Write,
    Read,
    Delete,
}

/// DashMap-backed adapter that behaves like one of the three stores.
///
/// It applies the same projection the real adapter would (the visual store
/// never sees vectors), and the relational flavour enforces the
/// non-decreasing `sync_version` guard and keeps tombstones as rows.
/// Faults can be scripted per operation for tests and demos.
pub struct InMemoryAdapter {
    kind: StoreKind,
    data: DashMap<String, StoredCopy>,
    next_native: AtomicU64,
    write_calls: AtomicU64,
    read_calls: AtomicU64,
    faults: Mutex<Vec<(FaultOp, VecDeque<AdapterError>)>>,
}

impl InMemoryAdapter {
    #[must_use]
    pub fn new(kind: StoreKind) -> Self {
        Self {
            kind,
            data: DashMap::new(),
            next_native: AtomicU64::new(1),
            write_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
            faults: Mutex::new(Vec::new()),
        }
    }

    /// Number of native records held
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total `write` invocations, including failed ones
    #[must_use]
    pub fn write_calls(&self) -> u64 {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Total `read` invocations, including failed ones
    #[must_use]
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::SeqCst)
    }

    /// Fail the next `errors.len()` calls of `op`, in order.
    pub fn inject_failures(&self, op: FaultOp, errors: impl IntoIterator<Item = AdapterError>) {
        let mut faults = self.faults.lock();
        match faults.iter_mut().find(|(o, _)| *o == op) {
            Some((_, queue)) => queue.extend(errors),
            None => faults.push((op, errors.into_iter().collect())),
        }
    }

    /// Store a copy directly, bypassing projection and guards.
    ///
    /// Used to seed divergent state.
    pub fn insert_raw(&self, record: LogicalRecord) {
        let native_id = self.native_id_for(&record.id);
        self.data.insert(record.id.clone(), StoredCopy { native_id, record });
    }

    /// Drop a copy directly (simulates data loss).
    pub fn remove_raw(&self, id: &str) {
        self.data.remove(id);
    }

    fn take_fault(&self, op: FaultOp) -> Option<AdapterError> {
        let mut faults = self.faults.lock();
        faults
            .iter_mut()
            .find(|(o, _)| *o == op)
            .and_then(|(_, queue)| queue.pop_front())
    }

    fn native_id_for(&self, id: &str) -> String {
        if let Some(existing) = self.data.get(id) {
            return existing.native_id.clone();
        }
        match self.kind {
            StoreKind::Relational | StoreKind::Vector => id.to_string(),
            StoreKind::Visual => {
                let n = self.next_native.fetch_add(1, Ordering::SeqCst);
                format!("rec{:014}", n)
            }
        }
    }

    fn project(&self, record: &LogicalRecord) -> LogicalRecord {
        let mut copy = record.clone();
        copy.cross_refs = CrossRefs::new();
        if self.kind == StoreKind::Visual {
            copy.fields.retain(|_, v| !matches!(v, FieldValue::Vector(_)));
        }
        copy
    }
}

#[async_trait]
impl StoreAdapter for InMemoryAdapter {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(FaultOp::Write) {
            return Err(err);
        }

        if self.kind == StoreKind::Relational {
            if let Some(existing) = self.data.get(&record.id) {
                if existing.record.sync_version > record.sync_version {
                    return Err(AdapterError::Rejected(format!(
                        "stale sync_version {} (stored {})",
                        record.sync_version, existing.record.sync_version
                    )));
                }
            }
        } else if record.deleted {
            // Leaf stores delete natively; already gone is fine.
            let native = self.data.remove(&record.id).map(|(_, c)| c.native_id);
            return Ok(native.unwrap_or_else(|| record.id.clone()));
        }

        let native_id = self.native_id_for(&record.id);
        let mut copy = self.project(record);
        if self.kind == StoreKind::Relational {
            // cross_refs live on the relational row and are only ever extended.
            if let Some(existing) = self.data.get(&record.id) {
                copy.cross_refs = existing.record.cross_refs.clone();
            }
        }
        self.data.insert(
            record.id.clone(),
            StoredCopy { native_id: native_id.clone(), record: copy },
        );
        Ok(native_id)
    }

    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.take_fault(FaultOp::Read) {
            return Err(err);
        }
        Ok(self.data.get(id).map(|c| c.record.clone()))
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        if let Some(err) = self.take_fault(FaultOp::Delete) {
            return Err(err);
        }
        match self.data.remove(id) {
            Some(_) => Ok(()),
            None => Err(AdapterError::NotFound),
        }
    }

    async fn attach_cross_refs(&self, id: &str, refs: &CrossRefs) -> Result<(), AdapterError> {
        if self.kind != StoreKind::Relational {
            return Ok(());
        }
        match self.data.get_mut(id) {
            Some(mut copy) => {
                for (store, native) in refs {
                    copy.record.cross_refs.insert(*store, native.clone());
                }
                Ok(())
            }
            None => Err(AdapterError::NotFound),
        }
    }
}
