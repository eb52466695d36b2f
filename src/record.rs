// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Logical record data structure.
//!
//! The [`LogicalRecord`] is the store-agnostic unit that flows through the
//! engine. Each record has a system-generated ID, a type discriminator, an
//! ordered map of typed fields and the sync metadata used to order writes
//! and pick a source of truth during reconciliation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// The three backing stores a record is synchronized into.
///
/// Ordering is significant: it is the tie-break preference when two copies
/// carry the same `sync_version` and `updated_at` (relational first, since it
/// is the reconciliation authority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// ACID relational store (Postgres-like), the index of `cross_refs`
    Relational,
    /// Human-curated visual interface store (Airtable-like)
    Visual,
    /// Vector similarity store (Pinecone-like)
    Vector,
}

impl StoreKind {
    /// All stores, in tie-break preference order.
    pub const ALL: [StoreKind; 3] = [StoreKind::Relational, StoreKind::Visual, StoreKind::Vector];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Relational => "relational",
            Self::Visual => "visual",
            Self::Vector => "vector",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "relational" | "supabase" | "postgres" => Ok(Self::Relational),
            "visual" | "airtable" => Ok(Self::Visual),
            "vector" | "pinecone" => Ok(Self::Vector),
            other => Err(format!("unknown store '{}'", other)),
        }
    }
}

/// Store name → that store's native identifier for the record.
///
/// An absent entry means "not yet written to that store".
pub type CrossRefs = BTreeMap<StoreKind, String>;

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    String(String),
    Number(f64),
    Boolean(bool),
    /// UTC epoch millis
    Timestamp(i64),
    /// Fixed-dimension float vector (only the vector store persists these)
    Vector(Vec<f32>),
    StringList(Vec<String>),
}

impl FieldValue {
    /// Short type tag, used by adapters that must remember field types
    /// alongside a lossy native representation.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::String(_) => "string",
            Self::Number(_) => "number",
            Self::Boolean(_) => "boolean",
            Self::Timestamp(_) => "timestamp",
            Self::Vector(_) => "vector",
            Self::StringList(_) => "string_list",
        }
    }

    #[must_use]
    pub fn is_vector(&self) -> bool {
        matches!(self, Self::Vector(_))
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        Self::Number(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        Self::Number(v as f64)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        Self::Boolean(v)
    }
}

impl From<Vec<f32>> for FieldValue {
    fn from(v: Vec<f32>) -> Self {
        Self::Vector(v)
    }
}

impl From<Vec<String>> for FieldValue {
    fn from(v: Vec<String>) -> Self {
        Self::StringList(v)
    }
}

/// Why a record was refused before reaching any store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("record id must not be empty")]
    EmptyId,
    #[error("record_type must not be empty")]
    EmptyType,
    #[error("invalid field name '{0}': expected lowercase snake_case starting with a letter")]
    InvalidFieldName(String),
    #[error("field '{0}' holds a non-finite number")]
    NonFinite(String),
    #[error("updated_at ({updated_at}) precedes created_at ({created_at})")]
    TimestampOrder { created_at: i64, updated_at: i64 },
}

/// The unit of synchronization.
///
/// # Example
///
/// ```
/// use tristore_sync::{LogicalRecord, FieldValue};
///
/// let record = LogicalRecord::new("content")
///     .with_field("title", "Hearing notes")
///     .with_field("embedding", vec![0.1_f32, 0.2, 0.3]);
///
/// assert!(!record.id.is_empty());
/// assert_eq!(record.sync_version, 0);
/// assert!(record.cross_refs.is_empty());
/// assert_eq!(record.fields["title"], FieldValue::String("Hearing notes".into()));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogicalRecord {
    /// Stable identifier, generated once by this system and never by a store
    pub id: String,
    /// Discriminator ("content", "transcript", "entity", ...)
    pub record_type: String,
    /// Canonical, store-agnostic payload
    pub fields: BTreeMap<String, FieldValue>,
    /// Creation time (epoch millis, UTC)
    pub created_at: i64,
    /// Last update time (epoch millis, UTC), non-decreasing per id
    pub updated_at: i64,
    /// Native identifiers acknowledged by each store
    #[serde(default)]
    pub cross_refs: CrossRefs,
    /// Incremented by the write coordinator on each locally accepted write
    #[serde(default)]
    pub sync_version: u64,
    /// Tombstone marker; deletion is a write fanned out like any other
    #[serde(default)]
    pub deleted: bool,
}

impl LogicalRecord {
    /// Create a record with a freshly generated id.
    pub fn new(record_type: impl Into<String>) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), record_type)
    }

    /// Create a record with a caller-provided id (e.g. when re-reading a
    /// known record or in tests).
    pub fn with_id(id: impl Into<String>, record_type: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: id.into(),
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            cross_refs: CrossRefs::new(),
            sync_version: 0,
            deleted: false,
        }
    }

    /// Build a tombstone for `id`.
    pub fn tombstone(id: impl Into<String>, record_type: impl Into<String>, updated_at: i64) -> Self {
        let mut record = Self::with_id(id, record_type);
        record.created_at = updated_at;
        record.updated_at = updated_at;
        record.deleted = true;
        record
    }

    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_sync_version(mut self, version: u64) -> Self {
        self.sync_version = version;
        self
    }

    #[must_use]
    pub fn with_timestamps(mut self, created_at: i64, updated_at: i64) -> Self {
        self.created_at = created_at;
        self.updated_at = updated_at;
        self
    }

    /// Check the data-model invariants that must hold before any store write.
    pub fn validate(&self) -> Result<(), RecordError> {
        if self.id.trim().is_empty() {
            return Err(RecordError::EmptyId);
        }
        if self.record_type.trim().is_empty() {
            return Err(RecordError::EmptyType);
        }
        if self.updated_at < self.created_at {
            return Err(RecordError::TimestampOrder {
                created_at: self.created_at,
                updated_at: self.updated_at,
            });
        }
        for (name, value) in &self.fields {
            if !is_valid_field_name(name) {
                return Err(RecordError::InvalidFieldName(name.clone()));
            }
            let finite = match value {
                FieldValue::Number(n) => n.is_finite(),
                FieldValue::Vector(v) => v.iter().all(|x| x.is_finite()),
                _ => true,
            };
            if !finite {
                return Err(RecordError::NonFinite(name.clone()));
            }
        }
        Ok(())
    }

    /// The fields every store holds: everything except vectors, which only
    /// the vector store persists.
    pub fn canonical_fields(&self) -> BTreeMap<&str, &FieldValue> {
        self.fields
            .iter()
            .filter(|(_, v)| !v.is_vector())
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }

    /// Canonical byte form compared across stores.
    ///
    /// Tombstones compare on type and deletion only, since stores that
    /// delete natively have no fields left to compare.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let empty = BTreeMap::new();
        let fields = if self.deleted { empty } else { self.canonical_fields() };
        // BTreeMap keys keep this deterministic.
        serde_json::to_vec(&(&self.record_type, self.deleted, fields)).unwrap_or_default()
    }

    /// Hex SHA-256 of [`canonical_bytes`](Self::canonical_bytes).
    pub fn canonical_digest(&self) -> String {
        hex::encode(Sha256::digest(self.canonical_bytes()))
    }

    /// Hex SHA-256 over the little-endian bytes of the vector in `field`.
    ///
    /// Kept apart from the canonical digest: the visual store never holds
    /// vectors, so only the stores that do can be compared on it.
    pub fn vector_digest(&self, field: &str) -> Option<String> {
        match self.fields.get(field) {
            Some(FieldValue::Vector(values)) if !self.deleted => {
                let mut hasher = Sha256::new();
                for value in values {
                    hasher.update(value.to_le_bytes());
                }
                Some(hex::encode(hasher.finalize()))
            }
            _ => None,
        }
    }
}

/// Canonical field names are lowercase snake_case so that adapters with
/// human-readable labels can translate them both ways.
pub fn is_valid_field_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() => {}
        _ => return false,
    }
    if name.ends_with('_') || name.contains("__") {
        return false;
    }
    name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Current UTC time in epoch millis.
pub fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
