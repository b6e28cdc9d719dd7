//! Model Metadata & Registry
//!
//! Typed per-model configuration, validated when it is registered. The
//! registry is an explicit object handed to the engine, so several isolated
//! configurations can coexist in one process.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use super::canonical::{validate_identifier, validate_qualified_identifier, Record};
use super::error::{EngineError, Result};
use super::security::masking::MaskKind;

/// Where a model's records live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Relational,
    Keyvalue,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKind::Relational => write!(f, "relational"),
            StorageKind::Keyvalue => write!(f, "keyvalue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMeta {
    pub name: String,
    pub storage: StorageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    /// Column identifying an entity; also the upsert conflict key.
    #[serde(default = "default_id_field")]
    pub id_field: String,
    #[serde(default = "default_id_field")]
    pub pk_field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rk_field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_key_template: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_key_template: Option<String>,
    #[serde(default)]
    pub cache: bool,
    /// Cache TTL in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl: Option<u64>,
    #[serde(default)]
    pub encrypted_fields: Vec<String>,
    #[serde(default)]
    pub masked_fields: BTreeMap<String, MaskKind>,
    /// Overrides the engine-wide soft delete setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_delete: Option<bool>,
}

fn default_id_field() -> String {
    "id".to_string()
}

impl ModelMeta {
    pub fn relational(name: &str, table: &str) -> Self {
        Self::base(name, StorageKind::Relational, Some(table.to_string()), None)
    }

    pub fn keyvalue(name: &str, collection: &str) -> Self {
        Self::base(name, StorageKind::Keyvalue, None, Some(collection.to_string()))
    }

    fn base(name: &str, storage: StorageKind, table: Option<String>, collection: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            storage,
            table,
            collection,
            id_field: default_id_field(),
            pk_field: default_id_field(),
            rk_field: None,
            partition_key_template: None,
            row_key_template: None,
            cache: false,
            cache_ttl: None,
            encrypted_fields: Vec::new(),
            masked_fields: BTreeMap::new(),
            soft_delete: None,
        }
    }

    pub fn with_cache(mut self, ttl_secs: Option<u64>) -> Self {
        self.cache = true;
        self.cache_ttl = ttl_secs;
        self
    }

    pub fn with_encrypted_fields(mut self, fields: &[&str]) -> Self {
        self.encrypted_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_mask(mut self, field: &str, kind: MaskKind) -> Self {
        self.masked_fields.insert(field.to_string(), kind);
        self
    }

    pub fn with_partition_key(mut self, pk_field: &str, template: Option<&str>) -> Self {
        self.pk_field = pk_field.to_string();
        self.partition_key_template = template.map(str::to_string);
        self
    }

    pub fn with_row_key(mut self, rk_field: Option<&str>, template: Option<&str>) -> Self {
        self.rk_field = rk_field.map(str::to_string);
        self.row_key_template = template.map(str::to_string);
        self
    }

    pub fn with_soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = Some(enabled);
        self
    }

    /// Table (relational) or collection (key-value) the model is stored in.
    pub fn storage_name(&self) -> &str {
        match self.storage {
            StorageKind::Relational => self.table.as_deref().unwrap_or(&self.name),
            StorageKind::Keyvalue => self.collection.as_deref().unwrap_or(&self.name),
        }
    }

    /// Whether default key derivation scopes the partition key to the
    /// record's tenant, so equal ids of different tenants never collide.
    pub fn tenant_partitioned(&self) -> bool {
        matches!(self.storage, StorageKind::Keyvalue) && self.partition_key_template.is_none()
    }

    /// Reject unusable metadata before the model is ever used.
    pub fn validate(&self) -> Result<()> {
        let ctx = |e: EngineError| EngineError::Validation(format!("model '{}': {}", self.name, e));

        if self.name.trim().is_empty() {
            return Err(EngineError::Validation("model name cannot be empty".into()));
        }
        match self.storage {
            StorageKind::Relational => {
                let table = self.table.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!("model '{}': relational storage requires a table", self.name))
                })?;
                validate_qualified_identifier(table).map_err(ctx)?;
            }
            StorageKind::Keyvalue => {
                validate_identifier(self.storage_name()).map_err(ctx)?;
            }
        }

        validate_identifier(&self.id_field).map_err(ctx)?;
        validate_identifier(&self.pk_field).map_err(ctx)?;
        if let Some(rk) = &self.rk_field {
            validate_identifier(rk).map_err(ctx)?;
        }
        for field in self.encrypted_fields.iter().chain(self.masked_fields.keys()) {
            validate_identifier(field).map_err(ctx)?;
        }
        for template in [&self.partition_key_template, &self.row_key_template].into_iter().flatten() {
            template_fields(template).map_err(ctx)?;
        }
        if self.cache_ttl == Some(0) {
            return Err(EngineError::Validation(format!(
                "model '{}': cache_ttl must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// Placeholder names in a `{field}` template.
pub fn template_fields(template: &str) -> Result<Vec<String>> {
    let mut fields = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        let after = &rest[start + 1..];
        let end = after
            .find('}')
            .ok_or_else(|| EngineError::Validation(format!("unclosed placeholder in template '{}'", template)))?;
        let name = &after[..end];
        validate_identifier(name)?;
        fields.push(name.to_string());
        rest = &after[end + 1..];
    }
    if rest.contains('}') {
        return Err(EngineError::Validation(format!("unbalanced '}}' in template '{}'", template)));
    }
    Ok(fields)
}

/// Fill a `{field}` template from a record. `None` when a placeholder has no
/// value in the record.
pub fn format_template(template: &str, record: &Record) -> Option<String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}')?;
        match record.get(&after[..end]) {
            None | Some(Value::Null) => return None,
            Some(Value::String(s)) => out.push_str(s),
            Some(other) => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Some(out)
}

/// Registry of validated model metadata, keyed by model name.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<ModelMeta>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and register a model. Registering identical metadata again is
    /// a no-op; any change to an existing registration is rejected.
    pub fn register(&self, meta: ModelMeta) -> Result<Arc<ModelMeta>> {
        meta.validate()?;
        let mut models = self.models.write();

        if let Some(existing) = models.get(&meta.name) {
            if existing.storage != meta.storage {
                return Err(EngineError::Validation(format!(
                    "model '{}' is already registered with {} storage",
                    meta.name, existing.storage
                )));
            }
            if **existing != meta {
                return Err(EngineError::Validation(format!(
                    "model '{}' is already registered with different metadata",
                    meta.name
                )));
            }
            return Ok(existing.clone());
        }

        debug!(model = %meta.name, storage = %meta.storage, "registered model");
        let meta = Arc::new(meta);
        models.insert(meta.name.clone(), meta.clone());
        Ok(meta)
    }

    pub fn get(&self, name: &str) -> Result<Arc<ModelMeta>> {
        self.models
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| EngineError::ModelNotRegistered(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.read().contains_key(name)
    }

    /// All registered models, sorted by name
    pub fn list(&self) -> Vec<Arc<ModelMeta>> {
        let mut all: Vec<_> = self.models.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
