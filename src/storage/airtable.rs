//! Visual-interface store backend (Airtable REST API).
//!
//! Each record type lives in its own table (`visual.tables`, falling back
//! to `visual.table`) with human-readable column names:
//!
//! ```text
//! | Record ID | Record Type | Sync Version | Created At | Updated At | Field Types | Title | View Count | ...
//! ```
//!
//! Canonical `snake_case` field names map to Title Case labels and back
//! (`view_count` ⇄ `View Count`). Timestamps are written as RFC 3339 so
//! curators can read them. Vectors are never sent: nobody browses an
//! embedding. Because Airtable drops type information (and omits empty
//! cells entirely), the `Field Types` column remembers each field's type so
//! reads can be de-translated to the exact canonical form.
//!
//! Writes use `performUpsert` merged on `Record ID`, so a repeated write of
//! the same id updates the existing row instead of creating a duplicate.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::{ConfigError, VisualStoreConfig};
use crate::record::{FieldValue, LogicalRecord, StoreKind};
use super::http;
use super::traits::{AdapterError, StoreAdapter};

pub const LABEL_RECORD_ID: &str = "Record ID";
pub const LABEL_RECORD_TYPE: &str = "Record Type";
pub const LABEL_SYNC_VERSION: &str = "Sync Version";
pub const LABEL_CREATED_AT: &str = "Created At";
pub const LABEL_UPDATED_AT: &str = "Updated At";
pub const LABEL_FIELD_TYPES: &str = "Field Types";

const SYSTEM_LABELS: [&str; 6] = [
    LABEL_RECORD_ID,
    LABEL_RECORD_TYPE,
    LABEL_SYNC_VERSION,
    LABEL_CREATED_AT,
    LABEL_UPDATED_AT,
    LABEL_FIELD_TYPES,
];

const STORE: &str = "airtable";

#[derive(Debug, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(default)]
    fields: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct RecordList {
    #[serde(default)]
    records: Vec<AirtableRecord>,
}

pub struct VisualAdapter {
    client: reqwest::Client,
    api_url: String,
    base_id: String,
    table: String,
    tables: BTreeMap<String, String>,
    api_key: String,
}

impl VisualAdapter {
    pub fn new(config: &VisualStoreConfig, timeout: Duration) -> Result<Self, ConfigError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or(ConfigError::Missing("visual.api_key"))?;
        let base_id = config
            .base_id
            .clone()
            .ok_or(ConfigError::Missing("visual.base_id"))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("airtable http client: {}", e)))?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            base_id,
            table: config.table.clone(),
            tables: config.tables.clone(),
            api_key,
        })
    }

    fn table_for(&self, record_type: &str) -> &str {
        self.tables.get(record_type).unwrap_or(&self.table)
    }

    /// Every configured table, the default one first.
    fn searched_tables(&self) -> Vec<&str> {
        let mut tables = vec![self.table.as_str()];
        for table in self.tables.values() {
            if !tables.contains(&table.as_str()) {
                tables.push(table);
            }
        }
        tables
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/{}/{}", self.api_url, self.base_id, table)
    }

    /// Reads only know the id, so each table is searched in turn.
    async fn find(&self, id: &str) -> Result<Option<(&str, AirtableRecord)>, AdapterError> {
        for table in self.searched_tables() {
            if let Some(found) = self.find_in(table, id).await? {
                return Ok(Some((table, found)));
            }
        }
        Ok(None)
    }

    async fn find_in(&self, table: &str, id: &str) -> Result<Option<AirtableRecord>, AdapterError> {
        let formula = record_id_formula(id);
        let response = self
            .client
            .get(self.table_url(table))
            .bearer_auth(&self.api_key)
            .query(&[("filterByFormula", formula.as_str()), ("maxRecords", "1")])
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        let list: RecordList = http::check(STORE, response)
            .await?
            .json()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        Ok(list.records.into_iter().next())
    }

    async fn delete_native(&self, table: &str, native_id: &str) -> Result<(), AdapterError> {
        let response = self
            .client
            .delete(format!("{}/{}", self.table_url(table), native_id))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        http::check(STORE, response).await?;
        Ok(())
    }
}

/// `filterByFormula` matching one record id.
pub fn record_id_formula(id: &str) -> String {
    let escaped = id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("{{{}}}='{}'", LABEL_RECORD_ID, escaped)
}

#[async_trait]
impl StoreAdapter for VisualAdapter {
    fn kind(&self) -> StoreKind {
        StoreKind::Visual
    }

    async fn write(&self, record: &LogicalRecord) -> Result<String, AdapterError> {
        if record.deleted {
            return match self.find(&record.id).await? {
                Some((table, existing)) => {
                    self.delete_native(table, &existing.id).await?;
                    Ok(existing.id)
                }
                None => Ok(record.cross_refs.get(&StoreKind::Visual).cloned().unwrap_or_else(|| record.id.clone())),
            };
        }

        let fields = to_airtable_fields(record)?;
        let table = self.table_for(&record.record_type);
        // A record whose type changed moves to its new table
        let moved = if self.tables.is_empty() {
            None
        } else {
            self.find(&record.id).await?.filter(|(found, _)| *found != table)
        };
        let body = json!({
            "performUpsert": { "fieldsToMergeOn": [LABEL_RECORD_ID] },
            "records": [{ "fields": fields }],
            "typecast": true,
        });

        let response = self
            .client
            .patch(self.table_url(table))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;
        let list: RecordList = http::check(STORE, response)
            .await?
            .json()
            .await
            .map_err(|e| http::transport_error(STORE, e))?;

        let native = list
            .records
            .into_iter()
            .next()
            .map(|r| r.id)
            .ok_or_else(|| AdapterError::Unavailable("airtable upsert returned no records".into()))?;
        if let Some((old_table, stale)) = moved {
            self.delete_native(old_table, &stale.id).await?;
            debug!(id = %record.id, from = old_table, to = table, "Moved record between tables");
        }
        debug!(id = %record.id, native = %native, table, "Airtable upsert acknowledged");
        Ok(native)
    }

    async fn read(&self, id: &str) -> Result<Option<LogicalRecord>, AdapterError> {
        match self.find(id).await? {
            Some((_, found)) => {
                let mut record = from_airtable_fields(&found.fields)?;
                record.cross_refs.insert(StoreKind::Visual, found.id);
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> Result<(), AdapterError> {
        match self.find(id).await? {
            Some((table, existing)) => self.delete_native(table, &existing.id).await,
            None => Err(AdapterError::NotFound),
        }
    }
}

/// `view_count` → `View Count`
pub fn field_label(name: &str) -> String {
    name.split('_')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `View Count` → `view_count`
pub fn field_name(label: &str) -> String {
    label.to_ascii_lowercase().replace(' ', "_")
}

fn to_rfc3339(millis: i64) -> Result<String, AdapterError> {
    DateTime::<Utc>::from_timestamp_millis(millis)
        .map(|dt| dt.to_rfc3339_opts(SecondsFormat::Millis, true))
        .ok_or_else(|| AdapterError::Rejected(format!("timestamp {} out of range", millis)))
}

fn from_rfc3339(value: &Value, label: &str) -> Result<i64, AdapterError> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp_millis())
        .ok_or_else(|| AdapterError::Rejected(format!("column '{}' is not an RFC 3339 timestamp", label)))
}

/// Translate a record into Airtable cell values keyed by column label.
pub fn to_airtable_fields(record: &LogicalRecord) -> Result<Map<String, Value>, AdapterError> {
    let mut cells = Map::new();
    let mut types = BTreeMap::new();

    for (name, value) in &record.fields {
        let cell = match value {
            FieldValue::Vector(_) => continue,
            FieldValue::String(s) => json!(s),
            FieldValue::Number(n) => json!(n),
            FieldValue::Boolean(b) => json!(b),
            FieldValue::Timestamp(ms) => json!(to_rfc3339(*ms)?),
            FieldValue::StringList(items) => json!(items),
        };
        let label = field_label(name);
        if SYSTEM_LABELS.iter().any(|l| l.eq_ignore_ascii_case(&label)) {
            return Err(AdapterError::Rejected(format!(
                "field '{}' collides with system column '{}'",
                name, label
            )));
        }
        if field_name(&label) != *name {
            return Err(AdapterError::Rejected(format!("field '{}' has no reversible label", name)));
        }
        types.insert(name.clone(), value.type_name());
        cells.insert(label, cell);
    }

    let types_json = serde_json::to_string(&types)
        .map_err(|e| AdapterError::Rejected(format!("field types: {}", e)))?;
    cells.insert(LABEL_RECORD_ID.into(), json!(record.id));
    cells.insert(LABEL_RECORD_TYPE.into(), json!(record.record_type));
    cells.insert(LABEL_SYNC_VERSION.into(), json!(record.sync_version));
    cells.insert(LABEL_CREATED_AT.into(), json!(to_rfc3339(record.created_at)?));
    cells.insert(LABEL_UPDATED_AT.into(), json!(to_rfc3339(record.updated_at)?));
    cells.insert(LABEL_FIELD_TYPES.into(), json!(types_json));
    Ok(cells)
}

/// Translate Airtable cells back into canonical form.
///
/// Airtable omits empty cells, so absent booleans, strings and lists come
/// back as their empty values.
pub fn from_airtable_fields(cells: &Map<String, Value>) -> Result<LogicalRecord, AdapterError> {
    let text = |label: &str| -> Result<String, AdapterError> {
        cells
            .get(label)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| AdapterError::Rejected(format!("column '{}' missing", label)))
    };

    let id = text(LABEL_RECORD_ID)?;
    let record_type = text(LABEL_RECORD_TYPE)?;
    let sync_version = cells
        .get(LABEL_SYNC_VERSION)
        .and_then(Value::as_f64)
        .map(|v| v as u64)
        .unwrap_or(0);
    let created_at = from_rfc3339(cells.get(LABEL_CREATED_AT).unwrap_or(&Value::Null), LABEL_CREATED_AT)?;
    let updated_at = from_rfc3339(cells.get(LABEL_UPDATED_AT).unwrap_or(&Value::Null), LABEL_UPDATED_AT)?;
    let types: BTreeMap<String, String> = match cells.get(LABEL_FIELD_TYPES).and_then(Value::as_str) {
        Some(s) => serde_json::from_str(s)
            .map_err(|e| AdapterError::Rejected(format!("'{}' unreadable: {}", LABEL_FIELD_TYPES, e)))?,
        None => BTreeMap::new(),
    };

    let mut record = LogicalRecord::with_id(id, record_type)
        .with_sync_version(sync_version)
        .with_timestamps(created_at, updated_at);

    for (name, type_name) in types {
        let label = field_label(&name);
        let cell = cells.get(&label);
        let value = match (type_name.as_str(), cell) {
            ("string", Some(Value::String(s))) => FieldValue::String(s.clone()),
            ("string", None) => FieldValue::String(String::new()),
            ("number", Some(v)) if v.is_number() => FieldValue::Number(v.as_f64().unwrap_or_default()),
            ("boolean", Some(Value::Bool(b))) => FieldValue::Boolean(*b),
            ("boolean", None) => FieldValue::Boolean(false),
            ("timestamp", Some(v)) => FieldValue::Timestamp(from_rfc3339(v, &label)?),
            ("string_list", Some(Value::Array(items))) => FieldValue::StringList(
                items.iter().filter_map(Value::as_str).map(str::to_string).collect(),
            ),
            ("string_list", None) => FieldValue::StringList(Vec::new()),
            (other, _) => {
                return Err(AdapterError::Rejected(format!(
                    "column '{}' does not hold a {} value",
                    label, other
                )))
            }
        };
        record.fields.insert(name, value);
    }

    Ok(record)
}
