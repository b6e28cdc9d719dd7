//! Overflow-Aware Generic Engine
//!
//! Sits above a raw [`KvAdapter`] and adds:
//! - partition/row key derivation from model metadata
//! - transparent redirection of oversized records to an [`ObjectStore`]
//! - checksum-verified hydration of overflow stubs on every read
//! - the in-memory query pipeline over fully hydrated records

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::adapter::{KvAdapter, KvEntry, ObjectStore, Page, StoredRef};
use super::canonical::{canonical_record_bytes, sha256_hex, Record};
use super::error::{EngineError, Result};
use super::model::{format_template, ModelMeta};
use super::query::{self, QueryBuilder, QueryOutput};
use super::security::TENANT_FIELD;

/// Key prefix for overflow blobs in the object store
pub const OVERFLOW_PREFIX: &str = "overflow/";

/// Stub persisted in place of a record that exceeded the inline size limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowReference {
    #[serde(rename = "_overflow")]
    pub overflow: bool,
    #[serde(rename = "_blob_key")]
    pub blob_key: String,
    #[serde(rename = "_size")]
    pub size: u64,
    #[serde(rename = "_checksum")]
    pub checksum: String,
}

impl OverflowReference {
    pub fn new(checksum: String, size: u64) -> Self {
        Self {
            overflow: true,
            blob_key: format!("{}{}.json", OVERFLOW_PREFIX, checksum),
            size,
            checksum,
        }
    }

    /// Recognize a stored stub. Plain records never carry `_overflow: true`.
    pub fn from_record(record: &Record) -> Option<Self> {
        if record.get("_overflow") != Some(&Value::Bool(true)) {
            return None;
        }
        serde_json::from_value(Value::Object(record.clone())).ok()
    }

    pub fn to_record(&self) -> Result<Record> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(EngineError::Operation("overflow stub did not serialize to an object".into())),
        }
    }
}

pub struct GenericEngine {
    adapter: Arc<dyn KvAdapter>,
    blobs: Arc<dyn ObjectStore>,
}

impl GenericEngine {
    pub fn new(adapter: Arc<dyn KvAdapter>, blobs: Arc<dyn ObjectStore>) -> Self {
        Self { adapter, blobs }
    }

    pub fn provider(&self) -> &str {
        self.adapter.provider()
    }

    // Keys

    /// Derive (partition key, row key) for a record.
    pub fn derive_keys(&self, meta: &ModelMeta, record: &Record) -> Result<(String, String)> {
        let digest = || canonical_record_bytes(record).map(|b| sha256_hex(&b));

        let partition_key = match &meta.partition_key_template {
            Some(template) => match format_template(template, record) {
                Some(pk) => pk,
                None => match record.get(&meta.pk_field).and_then(key_text) {
                    Some(value) => format!("default_{}", value),
                    None => format!("default_{}", &digest()?[..16]),
                },
            },
            None => {
                let base = record
                    .get(&meta.pk_field)
                    .and_then(key_text)
                    .unwrap_or_else(|| "default".to_string());
                match record.get(TENANT_FIELD).and_then(key_text) {
                    Some(tenant) if meta.pk_field != TENANT_FIELD => format!("{}:{}", tenant, base),
                    _ => base,
                }
            }
        };

        let explicit_row_key = meta
            .rk_field
            .as_ref()
            .and_then(|f| record.get(f))
            .and_then(key_text);
        let row_key = match explicit_row_key {
            Some(rk) => rk,
            None => match &meta.row_key_template {
                Some(template) => match format_template(template, record) {
                    Some(rk) => rk,
                    None => digest()?,
                },
                None => match record.get(&meta.id_field).and_then(key_text) {
                    Some(id) => id,
                    None => digest()?,
                },
            },
        };

        Ok((partition_key, row_key))
    }

    // Writes

    /// Store a new record, assigning an id when it has none. Fails when a
    /// record already lives at the derived address.
    pub fn insert(&self, meta: &ModelMeta, mut record: Record) -> Result<Record> {
        if !record.contains_key(&meta.id_field) {
            record.insert(meta.id_field.clone(), Value::String(uuid::Uuid::new_v4().to_string()));
        }
        let (pk, rk) = self.derive_keys(meta, &record)?;
        if self.adapter.get_raw(meta.storage_name(), &pk, &rk)?.is_some() {
            return Err(EngineError::Validation(format!(
                "record '{}' of '{}' already exists",
                rk, meta.name
            )));
        }
        self.write_at(meta, &pk, &rk, &record)?;
        Ok(record)
    }

    /// Insert or merge into the record addressed by the derived keys.
    pub fn upsert(&self, meta: &ModelMeta, record: Record, replace: bool) -> Result<Record> {
        let (pk, rk) = self.derive_keys(meta, &record)?;
        let merged = match self.get(meta, &pk, &rk)? {
            Some(mut existing) if !replace => {
                existing.extend(record);
                existing
            }
            _ => record,
        };
        self.write_at(meta, &pk, &rk, &merged)?;
        Ok(merged)
    }

    /// Merge `patch` into every record matching `lookup`, or replace them
    /// wholesale. Records keep their original keys.
    pub fn update(&self, meta: &ModelMeta, lookup: &QueryBuilder, patch: &Record, replace: bool) -> Result<Vec<Record>> {
        let mut updated = Vec::new();
        for entry in self.find(meta, lookup)? {
            let record = if replace {
                let mut fresh = patch.clone();
                if let Some(id) = entry.data.get(&meta.id_field) {
                    fresh.entry(meta.id_field.clone()).or_insert_with(|| id.clone());
                }
                fresh
            } else {
                let mut merged = entry.data;
                merged.extend(patch.clone());
                merged
            };
            self.write_at(meta, &entry.partition_key, &entry.row_key, &record)?;
            updated.push(record);
        }
        Ok(updated)
    }

    /// Physically remove every record matching `lookup`, returning them.
    ///
    /// Overflow blobs are content-addressed and may be shared, so they are
    /// left in place.
    pub fn delete(&self, meta: &ModelMeta, lookup: &QueryBuilder) -> Result<Vec<Record>> {
        let mut removed = Vec::new();
        for entry in self.find(meta, lookup)? {
            if self
                .adapter
                .delete_raw(meta.storage_name(), &entry.partition_key, &entry.row_key, None)?
            {
                removed.push(entry.data);
            }
        }
        Ok(removed)
    }

    /// Write a record at a fixed address, redirecting it to blob storage when
    /// its canonical form exceeds the provider limit.
    pub fn write_at(&self, meta: &ModelMeta, partition_key: &str, row_key: &str, record: &Record) -> Result<StoredRef> {
        let bytes = canonical_record_bytes(record)?;
        let limit = self.adapter.max_record_bytes();

        if bytes.len() <= limit {
            return self.adapter.put_raw(meta.storage_name(), partition_key, row_key, record);
        }

        let stub = OverflowReference::new(sha256_hex(&bytes), bytes.len() as u64);
        self.blobs
            .put(&stub.blob_key, &bytes)
            .map_err(|e| EngineError::Operation(format!("overflow storage failed: {}", e)))?;
        info!(
            model = %meta.name,
            size = bytes.len(),
            limit,
            blob = %stub.blob_key,
            "record redirected to overflow storage"
        );
        self.adapter
            .put_raw(meta.storage_name(), partition_key, row_key, &stub.to_record()?)
    }

    // Reads

    /// Replace an overflow stub with its verified payload. Plain records pass
    /// through untouched.
    pub fn resolve(&self, record: Record) -> Result<Record> {
        let Some(stub) = OverflowReference::from_record(&record) else {
            return Ok(record);
        };

        let bytes = self.blobs.get(&stub.blob_key)?.ok_or_else(|| {
            EngineError::Integrity(format!("overflow blob '{}' is missing", stub.blob_key))
        })?;

        let actual = sha256_hex(&bytes);
        if actual != stub.checksum {
            error!(blob = %stub.blob_key, expected = %stub.checksum, actual = %actual, "overflow checksum mismatch");
            return Err(EngineError::Integrity(format!(
                "checksum mismatch on overflow blob '{}'",
                stub.blob_key
            )));
        }

        serde_json::from_slice(&bytes).map_err(|e| {
            EngineError::Integrity(format!("overflow blob '{}' is not a record: {}", stub.blob_key, e))
        })
    }

    pub fn get(&self, meta: &ModelMeta, partition_key: &str, row_key: &str) -> Result<Option<Record>> {
        self.adapter
            .get_raw(meta.storage_name(), partition_key, row_key)?
            .map(|r| self.resolve(r))
            .transpose()
    }

    /// Every entry of the model, hydrated.
    pub fn scan(&self, meta: &ModelMeta) -> Result<Vec<KvEntry>> {
        let raw = self.adapter.query_raw(meta.storage_name(), &Record::new(), None)?;
        debug!(model = %meta.name, entries = raw.len(), "kv scan");
        raw.into_iter()
            .map(|entry| {
                Ok(KvEntry {
                    data: self.resolve(entry.data)?,
                    ..entry
                })
            })
            .collect()
    }

    /// Hydrated entries matching the query filters, keys retained.
    pub fn find(&self, meta: &ModelMeta, lookup: &QueryBuilder) -> Result<Vec<KvEntry>> {
        Ok(self
            .scan(meta)?
            .into_iter()
            .filter(|entry| lookup.matches(&entry.data))
            .collect())
    }

    /// Run a full query through the in-memory pipeline.
    pub fn query(&self, meta: &ModelMeta, query: &QueryBuilder) -> Result<QueryOutput> {
        let records = self.scan(meta)?.into_iter().map(|e| e.data).collect();
        query::execute(records, query)
    }

    pub fn query_page(
        &self,
        meta: &ModelMeta,
        query: &QueryBuilder,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<Page> {
        let offset = Page::parse_token(continuation_token)?;
        let window = Page::window(query, page_size, offset)?;
        let rows = self.query(meta, &window)?.rows();
        Ok(Page::from_window(rows, offset, page_size))
    }
}

/// Text used when a field value becomes part of a key.
fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
