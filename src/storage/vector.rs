//! Vector similarity store backend (Pinecone data-plane REST API).
//!
//! Each record becomes one vector keyed by the record id, so upserts are
//! naturally idempotent. The float vector comes from the configured vector
//! field; the remaining canonical fields travel in the metadata blob so the
//! index can filter on them, together with underscore-prefixed sync keys.
//! Native ids of the other stores are never written here; the relational
//! row is the only cross-reference index.
//!
//! ```json
//! {
//!   "id": "3f0c…",
//!   "values": [0.12, -0.04, …],
//!   "metadata": {
//!     "title": "Hearing notes",
//!     "_record_type": "content",
//!     "_sync_version": 3,
//!     "_updated_at": 1767084657058,
//!     "_field_types": "{\"title\":\"string\"}"
//!   }
//! }
//! ```
//!
//! Malformed vectors are rejected locally, before any network call.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::{ConfigError, VectorStoreConfig};
use crate::record::{FieldValue, LogicalRecord, StoreKind};
use super::http;
use super::traits::{AdapterError, StoreAdapter};

const STORE: &str = "pinecone";

/// Pinecone's per-vector metadata limit
pub const MAX_METADATA_BYTES: usize = 40 * 1024;

const META_RECORD_TYPE: &str = "_record_type";
const META_SYNC_VERSION: &str = "_sync_version";
const META_CREATED_AT: &str = "_created_at";
const META_UPDATED_AT: &str = "_updated_at";
const META_FIELD_TYPES: &str = "_field_types";

/// Wire form of one vector.
#[derive(Debug, Clone, PartialEq, Deserialize, serde::Serialize)]
pub struct VectorPayload {
    pub id: String,
    pub values: Vec<f32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct FetchResponse {
    #[serde(default)]
    vectors: BTreeMap<String, VectorPayload>,
}

pub struct VectorAdapter {
    client: reqwest::Client,
    index_host: String,
    api_key: String,
    namespace: String,
    dimension: usize,
    vector_field: String,
}

impl VectorAdapter {
    pub fn new(config: &VectorStoreConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let index_host = config
            .index_host
            .clone()
            .ok_or(ConfigError::Missing("vector.index_host"))?;
        let api_key = config
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("vector.api_key"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("pinecone http client: {}", e)))?;

        Ok(Self {
            client,
            index_host: index_host.trim_end_matches('/').to_string(),
            api_key,
            namespace: config.namespace.clone(),
            dimension: config.dimension,
            vector_field: config.vector_field.clone(),
        })
    }

    async fn fetch(&self, id: &str) -> Result<Option<VectorPayload>, AdapterError> {
        let response = self
            .client
            .get(format!("{}/vectors/fetch", self.index_host))
            .header("Api-Key", &self.api_key)
            .query(&[("ids", id), ("namespace", self.namespace.as_str())])
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        let mut body: FetchResponse = http::check(STORE, response)
            .await?
            .json()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        Ok(body.vectors.remove(id))
    }

    async fn delete_ids(&self, id: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .post(format!("{}/vectors/delete", self.index_host))
            .header("Api-Key", &self.api_key)
            .json(&json!({ "ids": [id], "namespace": self.namespace }))
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        http::check(STORE, response).await?;
        Ok(())
    }
}

#[async_trait]
impl StoreAdapter for VectorAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Vector
    }

    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError> {
        if record.deleted {
            // Pinecone deletes are idempotent; a missing id is not an error.
            self.delete_ids(&record.id).await?;
            return Ok(record.id.clone());
        }

        let payload = to_vector_payload(record, &self.vector_field, self.dimension)?;
        let response = self
            .client
            .post(format!("{}/vectors/upsert", self.index_host))
            .header("Api-Key", &self.api_key)
            .json(&json!({ "vectors": [payload], "namespace": self.namespace }))
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        http::check(STORE, response).await?;
        debug!(id = %record.id, "Pinecone upsert acknowledged");
        Ok(record.id.clone())
    }

    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        match self.fetch(id).await? {
            Some(payload) => from_vector_payload(&payload, &self.vector_field).map(Some),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        if self.fetch(id).await?.is_none() {
            return Err(AdapterError::NotFound);
        }
        self.delete_ids(id).await
    }
}

/// Validate the record's vector and flatten everything else into metadata.
pub fn to_vector_payload(
    record: &LogicalRecord,
    vector_field: &str,
    dimension: usize,
) -> Result<VectorPayload, AdapterError> {
    let values = match record.fields.get(vector_field) {
        Some(FieldValue::Vector(v)) => v.clone(),
        Some(other) => {
            return Err(AdapterError::Rejected(format!(
                "field '{}' is a {}, not a vector",
                vector_field,
                other.type_name()
            )))
        }
        None => {
            return Err(AdapterError::Rejected(format!("record has no '{}' vector", vector_field)))
        }
    };
    if values.len() != dimension {
        return Err(AdapterError::Rejected(format!(
            "vector dimension {} does not match index dimension {}",
            values.len(),
            dimension
        )));
    }
    if values.iter().any(|x| !x.is_finite()) {
        return Err(AdapterError::Rejected("vector contains non-finite values".into()));
    }
    if values.iter().all(|x| *x == 0.0) {
        return Err(AdapterError::Rejected("all-zero vector cannot be indexed".into()));
    }

    let mut metadata = Map::new();
    let mut types = BTreeMap::new();
    for (name, value) in &record.fields {
        let meta = match value {
            // Only the designated vector field is stored; others have no place here.
            FieldValue::Vector(_) => continue,
            FieldValue::String(s) => json!(s),
            FieldValue::Number(n) => json!(n),
            FieldValue::Boolean(b) => json!(b),
            FieldValue::Timestamp(ms) => json!(ms),
            FieldValue::StringList(items) => json!(items),
        };
        types.insert(name.clone(), value.type_name());
        metadata.insert(name.clone(), meta);
    }

    metadata.insert(META_RECORD_TYPE.into(), json!(record.record_type));
    metadata.insert(META_SYNC_VERSION.into(), json!(record.sync_version));
    metadata.insert(META_CREATED_AT.into(), json!(record.created_at));
    metadata.insert(META_UPDATED_AT.into(), json!(record.updated_at));
    metadata.insert(
        META_FIELD_TYPES.into(),
        json!(serde_json::to_string(&types).map_err(|e| AdapterError::Rejected(e.to_string()))?),
    );

    let size = serde_json::to_vec(&metadata).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_METADATA_BYTES {
        return Err(AdapterError::Rejected(format!(
            "metadata is {} bytes (limit {})",
            size, MAX_METADATA_BYTES
        )));
    }

    Ok(VectorPayload { id: record.id.clone(), values, metadata })
}

/// Rebuild the canonical record from a fetched vector.
pub fn from_vector_payload(payload: &VectorPayload, vector_field: &str) -> Result<LogicalRecord, AdapterError> {
    let meta = &payload.metadata;
    let int = |key: &str| meta.get(key).and_then(Value::as_f64).map(|v| v as i64);

    let record_type = meta
        .get(META_RECORD_TYPE)
        .and_then(Value::as_str)
        .ok_or_else(|| AdapterError::Rejected(format!("metadata '{}' missing", META_RECORD_TYPE)))?;
    let types: BTreeMap<String, String> = match meta.get(META_FIELD_TYPES).and_then(Value::as_str) {
        Some(s) => serde_json::from_str(s).map_err(|e| AdapterError::Rejected(e.to_string()))?,
        None => BTreeMap::new(),
    };

    let created_at = int(META_CREATED_AT).unwrap_or(0);
    let mut record = LogicalRecord::with_id(payload.id.clone(), record_type)
        .with_sync_version(int(META_SYNC_VERSION).unwrap_or(0).max(0) as u64)
        .with_timestamps(created_at, int(META_UPDATED_AT).unwrap_or(created_at));

    for (name, type_name) in types {
        let raw = meta.get(&name);
        let value = match (type_name.as_str(), raw) {
            ("string", Some(Value::String(s))) => FieldValue::String(s.clone()),
            ("number", Some(v)) if v.is_number() => FieldValue::Number(v.as_f64().unwrap_or_default()),
            ("boolean", Some(Value::Bool(b))) => FieldValue::Boolean(*b),
            ("timestamp", Some(v)) if v.is_number() => FieldValue::Timestamp(v.as_f64().unwrap_or_default() as i64),
            ("string_list", Some(Value::Array(items))) => FieldValue::StringList(
                items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            ),
            (other, _) => {
                return Err(AdapterError::Rejected(format!(
                    "metadata '{}' does not hold a {} value",
                    name, other
                )))
            }
        };
        record.fields.insert(name, value);
    }
    record.fields.insert(vector_field.to_string(), FieldValue::Vector(payload.values.clone()));

    record.cross_refs.insert(StoreKind::Vector, payload.id.clone());
    Ok(record)
}
