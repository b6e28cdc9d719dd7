//! Data Engine
//!
//! The single entry point for reading and writing model records. Every
//! operation runs the same pipeline:
//!
//! 1. tenancy (tenant filter on reads, tenant stamp on writes)
//! 2. row-level security (pushed-down filters, write checks, post-filter)
//! 3. field encryption before storage
//! 4. dispatch by storage kind: SQL push-down or the overflow-aware KV engine
//! 5. decryption and masking on the way out
//! 6. result caching for reads, model-wide invalidation on writes
//! 7. one audit record per operation, success or failure

mod batch;

pub use batch::{BatchFailure, BatchOptions, BatchResult};

use chrono::{SecondsFormat, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::adapter::{
    FsKvStore, FsObjectStore, KvAdapter, MemoryKvStore, ObjectStore, Page, RelationalDriver, SqliteDriver,
};
use super::audit::{changed_fields, AuditAction, AuditLedger, AuditRecord, AuditStore, SqliteAuditStore};
use super::cache::{CacheBackend, MemoryCache, ResultCache};
use super::canonical::{canonical_record_bytes, Record};
use super::config::EngineConfig;
use super::context::RequestContext;
use super::error::{EngineError, Result};
use super::metrics::{MetricsCollector, OperationTimer, DEFAULT_SLOW_QUERY_MS};
use super::model::{ModelMeta, ModelRegistry, StorageKind};
use super::overflow::GenericEngine;
use super::query::{self, Operator, QueryBuilder, QueryOutput};
use super::retry::RetryPolicy;
use super::security::{
    DataMasking, FieldEncryption, RowLevelSecurity, TenantEnforcer, TenantQuotaManager, TenantRegistry, TENANT_FIELD,
};

pub const CREATED_AT: &str = "created_at";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_AT: &str = "updated_at";
pub const UPDATED_BY: &str = "updated_by";
pub const DELETED_AT: &str = "deleted_at";
pub const DELETED_BY: &str = "deleted_by";

/// Stands in for encrypted values in audit snapshots
const ENCRYPTED_PLACEHOLDER: &str = "[ENCRYPTED]";

/// Identifies the records an update or delete applies to.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Match on the model's id field
    Id(Value),
    /// Match every listed field by equality
    Fields(Record),
}

impl Lookup {
    fn to_query(&self, meta: &ModelMeta) -> Result<QueryBuilder> {
        match self {
            Lookup::Id(Value::Null) => Err(EngineError::Validation(format!(
                "lookup on '{}' needs a non-null id",
                meta.name
            ))),
            Lookup::Id(id) => Ok(QueryBuilder::new().eq(&meta.id_field, id.clone())),
            Lookup::Fields(fields) if fields.is_empty() => Err(EngineError::Validation(format!(
                "lookup on '{}' must name at least one field",
                meta.name
            ))),
            Lookup::Fields(fields) => Ok(QueryBuilder::from_lookup(fields)),
        }
    }

    fn entity_id(&self, meta: &ModelMeta) -> Option<String> {
        match self {
            Lookup::Id(id) => key_text(id),
            Lookup::Fields(fields) => fields.get(&meta.id_field).and_then(key_text),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Lookup::Id(id) => id.clone(),
            Lookup::Fields(fields) => Value::Object(fields.clone()),
        }
    }
}

impl From<&str> for Lookup {
    fn from(id: &str) -> Self {
        Lookup::Id(Value::String(id.to_string()))
    }
}

impl From<String> for Lookup {
    fn from(id: String) -> Self {
        Lookup::Id(Value::String(id))
    }
}

impl From<i64> for Lookup {
    fn from(id: i64) -> Self {
        Lookup::Id(Value::from(id))
    }
}

impl From<Record> for Lookup {
    fn from(fields: Record) -> Self {
        Lookup::Fields(fields)
    }
}

impl From<Value> for Lookup {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(fields) => Lookup::Fields(fields),
            id => Lookup::Id(id),
        }
    }
}

/// Per-call read switches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReadOptions {
    /// Return soft-deleted rows too
    pub include_deleted: bool,
    /// Bypass the result cache for this call
    pub no_cache: bool,
    /// Overrides the model's cache TTL
    pub cache_ttl: Option<Duration>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.no_cache = true;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }
}

/// Per-call write switches for update and upsert
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Key-value models only: overwrite the stored record instead of merging.
    pub replace: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Remove physically even when soft delete is enabled
    pub hard: bool,
}

impl DeleteOptions {
    pub fn hard() -> Self {
        Self { hard: true }
    }
}

/// What a delete did. Nothing matching the lookup is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "count", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted(usize),
    SoftDeleted(usize),
    NotFound,
}

impl DeleteOutcome {
    pub fn count(&self) -> usize {
        match self {
            DeleteOutcome::Deleted(n) | DeleteOutcome::SoftDeleted(n) => *n,
            DeleteOutcome::NotFound => 0,
        }
    }
}

#[derive(Debug, Clone)]
struct EngineOptions {
    soft_delete: bool,
    audit_reads: bool,
    stamp_fields: bool,
}

pub struct DataEngineBuilder {
    registry: Option<Arc<ModelRegistry>>,
    relational: Option<Arc<dyn RelationalDriver>>,
    generic: Option<GenericEngine>,
    cache: Option<ResultCache>,
    audit: Option<Arc<AuditLedger>>,
    tenants: Option<Arc<TenantRegistry>>,
    encryption: Option<FieldEncryption>,
    retry: RetryPolicy,
    slow_query: Duration,
    options: EngineOptions,
}

impl DataEngineBuilder {
    fn new() -> Self {
        Self {
            registry: None,
            relational: None,
            generic: None,
            cache: None,
            audit: None,
            tenants: None,
            encryption: None,
            retry: RetryPolicy::default(),
            slow_query: Duration::from_millis(DEFAULT_SLOW_QUERY_MS),
            options: EngineOptions {
                soft_delete: true,
                audit_reads: false,
                stamp_fields: true,
            },
        }
    }

    pub fn registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn relational(mut self, driver: Arc<dyn RelationalDriver>) -> Self {
        self.relational = Some(driver);
        self
    }

    pub fn keyvalue(mut self, adapter: Arc<dyn KvAdapter>, blobs: Arc<dyn ObjectStore>) -> Self {
        self.generic = Some(GenericEngine::new(adapter, blobs));
        self
    }

    pub fn cache(mut self, backend: Arc<dyn CacheBackend>, prefix: &str, default_ttl: Duration) -> Self {
        self.cache = Some(ResultCache::new(backend, prefix, default_ttl));
        self
    }

    pub fn audit(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit = Some(Arc::new(AuditLedger::new(store)));
        self
    }

    pub fn tenants(mut self, tenants: Arc<TenantRegistry>) -> Self {
        self.tenants = Some(tenants);
        self
    }

    pub fn encryption(mut self, encryption: FieldEncryption) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = policy;
        self
    }

    pub fn soft_delete(mut self, enabled: bool) -> Self {
        self.options.soft_delete = enabled;
        self
    }

    pub fn audit_reads(mut self, enabled: bool) -> Self {
        self.options.audit_reads = enabled;
        self
    }

    pub fn stamp_fields(mut self, enabled: bool) -> Self {
        self.options.stamp_fields = enabled;
        self
    }

    pub fn slow_query_threshold(mut self, threshold: Duration) -> Self {
        self.slow_query = threshold;
        self
    }

    pub fn build(self) -> DataEngine {
        let tenants = self.tenants.unwrap_or_default();
        DataEngine {
            registry: self.registry.unwrap_or_default(),
            relational: self.relational,
            generic: self.generic,
            cache: self.cache,
            audit: self.audit,
            quotas: TenantQuotaManager::new(tenants.clone()),
            tenants,
            rls: RowLevelSecurity::new(),
            encryption: self.encryption,
            masking: DataMasking::new(),
            retry: self.retry,
            metrics: MetricsCollector::new(self.slow_query),
            options: self.options,
        }
    }
}

/// Orchestrates storage, security, caching and audit for registered models.
/// Safe to share between threads.
pub struct DataEngine {
    registry: Arc<ModelRegistry>,
    relational: Option<Arc<dyn RelationalDriver>>,
    generic: Option<GenericEngine>,
    cache: Option<ResultCache>,
    audit: Option<Arc<AuditLedger>>,
    tenants: Arc<TenantRegistry>,
    quotas: TenantQuotaManager,
    rls: RowLevelSecurity,
    encryption: Option<FieldEncryption>,
    masking: DataMasking,
    retry: RetryPolicy,
    metrics: MetricsCollector,
    options: EngineOptions,
}

impl DataEngine {
    pub fn builder() -> DataEngineBuilder {
        DataEngineBuilder::new()
    }

    /// Open every backend named in the project configuration and register
    /// its models. The encryption key, if any, comes from the environment.
    pub fn from_config(config: &EngineConfig, project_dir: &Path) -> Result<Self> {
        if config.engine.provider != "sqlite" {
            return Err(EngineError::Config(format!(
                "unsupported relational provider '{}'",
                config.engine.provider
            )));
        }

        let sqlite_path = EngineConfig::resolve(project_dir, &config.sqlite.path);
        let sqlite = Arc::new(SqliteDriver::new(&sqlite_path, config.sqlite.pool_size)?);

        let kv: Arc<dyn KvAdapter> = match &config.kv.root {
            Some(root) => Arc::new(
                FsKvStore::open(&EngineConfig::resolve(project_dir, root))?.with_limit(config.kv.max_record_bytes),
            ),
            None => Arc::new(MemoryKvStore::with_limit(config.kv.max_record_bytes)),
        };
        let blobs = Arc::new(FsObjectStore::open(&EngineConfig::resolve(
            project_dir,
            &config.overflow.root,
        ))?);

        let mut builder = Self::builder()
            .relational(sqlite.clone())
            .keyvalue(kv, blobs)
            .retry(config.retry.clone())
            .soft_delete(config.engine.soft_delete)
            .audit_reads(config.audit.audit_reads)
            .stamp_fields(config.engine.stamp_fields)
            .slow_query_threshold(Duration::from_millis(config.engine.slow_query_ms));

        if config.cache.enabled {
            builder = builder.cache(
                Arc::new(MemoryCache::new()),
                &config.cache.prefix,
                Duration::from_secs(config.cache.default_ttl_secs),
            );
        }

        if config.audit.enabled {
            let store = match &config.audit.path {
                Some(_) => {
                    let driver = SqliteDriver::new(&config.audit_db_path(project_dir), 2)?;
                    SqliteAuditStore::new(&driver)?
                }
                None => SqliteAuditStore::new(&sqlite)?,
            };
            builder = builder.audit(Arc::new(store));
        }

        if let Some(encryption) = FieldEncryption::from_env()? {
            builder = builder.encryption(encryption);
        }

        let engine = builder.build();
        for meta in &config.models {
            engine.register_model(meta.clone())?;
        }
        info!(
            models = config.models.len(),
            sqlite = %sqlite_path.display(),
            cache = config.cache.enabled,
            audit = config.audit.enabled,
            "data engine ready"
        );
        Ok(engine)
    }

    pub fn register_model(&self, meta: ModelMeta) -> Result<Arc<ModelMeta>> {
        self.registry.register(meta)
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    pub fn rls(&self) -> &RowLevelSecurity {
        &self.rls
    }

    pub fn masking(&self) -> &DataMasking {
        &self.masking
    }

    pub fn tenants(&self) -> &Arc<TenantRegistry> {
        &self.tenants
    }

    pub fn quotas(&self) -> &TenantQuotaManager {
        &self.quotas
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn audit(&self) -> Option<&AuditLedger> {
        self.audit.as_deref()
    }

    // Reads

    /// Rows matching `query`, decrypted and masked for the caller. Count-only
    /// queries belong to [`DataEngine::linq_query`].
    pub fn read(&self, model: &str, query: QueryBuilder, opts: &ReadOptions, ctx: &RequestContext) -> Result<Vec<Record>> {
        let meta = self.meta(model)?;
        let mut scope = self.scope(&meta, AuditAction::Read, ctx);

        let mut query = self.scope_query(&meta, query, opts.include_deleted, ctx);
        query.count_only = false;
        let descriptor = json!({ "op": "read", "query": &query });
        let result = self.cached(&meta, descriptor, opts, ctx, || Ok(self.fetch(&meta, &query, ctx)?.rows()));

        if let Ok((rows, hit)) = &result {
            scope.observe_read(rows.len(), *hit);
        }
        scope.close(result.map(|(rows, _)| rows))
    }

    /// First row matching `query`, if any.
    pub fn read_one(
        &self,
        model: &str,
        query: QueryBuilder,
        opts: &ReadOptions,
        ctx: &RequestContext,
    ) -> Result<Option<Record>> {
        Ok(self.read(model, query.take(1), opts, ctx)?.into_iter().next())
    }

    /// One page of rows. Pass the returned continuation token back to resume.
    pub fn read_page(
        &self,
        model: &str,
        query: QueryBuilder,
        page_size: usize,
        continuation_token: Option<&str>,
        opts: &ReadOptions,
        ctx: &RequestContext,
    ) -> Result<Page> {
        let meta = self.meta(model)?;
        let mut scope = self.scope(&meta, AuditAction::ReadPage, ctx);
        let result = self.read_page_inner(&meta, query, page_size, continuation_token, opts, ctx);
        if let Ok((page, hit)) = &result {
            scope.observe_read(page.rows.len(), *hit);
        }
        scope.close(result.map(|(page, _)| page))
    }

    fn read_page_inner(
        &self,
        meta: &ModelMeta,
        query: QueryBuilder,
        page_size: usize,
        continuation_token: Option<&str>,
        opts: &ReadOptions,
        ctx: &RequestContext,
    ) -> Result<(Page, bool)> {
        if page_size == 0 {
            return Err(EngineError::Validation("page size must be positive".into()));
        }
        let mut query = self.scope_query(meta, query, opts.include_deleted, ctx);
        query.count_only = false;
        let descriptor = json!({
            "op": "read_page",
            "query": &query,
            "page_size": page_size,
            "token": continuation_token,
        });

        self.cached(meta, descriptor, opts, ctx, || {
            if self.rls.has_read_post_filter(&meta.name) {
                let offset = Page::parse_token(continuation_token)?;
                let window = Page::window(&query, page_size, offset)?;
                let rows = self.fetch(meta, &window, ctx)?.rows();
                return Ok(Page::from_window(rows, offset, page_size));
            }

            let page = self.retry.run("read_page", || match meta.storage {
                StorageKind::Relational => {
                    self.driver(meta)?
                        .select_page(&self.table(meta, ctx), &query, page_size, continuation_token)
                }
                StorageKind::Keyvalue => self.kv(meta)?.query_page(meta, &query, page_size, continuation_token),
            })?;
            Ok(Page {
                rows: self.present(meta, page.rows, ctx),
                ..page
            })
        })
    }

    /// Full query: filters, ordering, paging, projection, distinct, grouping
    /// and counts.
    pub fn linq_query(
        &self,
        model: &str,
        query: QueryBuilder,
        opts: &ReadOptions,
        ctx: &RequestContext,
    ) -> Result<QueryOutput> {
        let meta = self.meta(model)?;
        let mut scope = self.scope(&meta, AuditAction::LinqQuery, ctx);

        let query = self.scope_query(&meta, query, opts.include_deleted, ctx);
        let descriptor = json!({ "op": "linq_query", "query": &query });
        let result = self.cached(&meta, descriptor, opts, ctx, || self.fetch(&meta, &query, ctx));

        if let Ok((output, hit)) = &result {
            scope.observe_read(output.len(), *hit);
        }
        scope.close(result.map(|(output, _)| output))
    }

    // Writes

    pub fn create(&self, model: &str, data: Record, ctx: &RequestContext) -> Result<Record> {
        let meta = self.meta(model)?;
        let mut scope = self.scope(&meta, AuditAction::Create, ctx);
        let result = self.create_inner(&meta, data, ctx);
        if let Ok(created) = &result {
            scope.observe_write(&[], std::slice::from_ref(created));
        }
        scope.close(result)
    }

    fn create_inner(&self, meta: &ModelMeta, mut record: Record, ctx: &RequestContext) -> Result<Record> {
        let tenant = TenantEnforcer::new(&self.tenants).enforce_write(&mut record, ctx, "create")?;
        self.stamp(&mut record, ctx, true);
        self.rls.enforce_write(&meta.name, &mut record, ctx)?;

        let size = canonical_record_bytes(&record)?.len() as u64;
        self.quotas.reserve(&tenant, size)?;

        let stored = self.encrypt(meta, &mut record).and_then(|_| {
            self.retry.run("create", || match meta.storage {
                StorageKind::Relational => self.driver(meta)?.insert(&self.table(meta, ctx), &record),
                StorageKind::Keyvalue => self.kv(meta)?.insert(meta, record.clone()),
            })
        });
        // A failed write may still have reached storage.
        self.invalidate(meta);
        let stored = match stored {
            Ok(stored) => stored,
            Err(e) => {
                self.quotas.release(&tenant, size);
                return Err(e);
            }
        };
        Ok(self.decrypt_row(meta, stored))
    }

    /// Apply `patch` to every live record matching `lookup`. Returns the
    /// records as written; empty when nothing matched.
    pub fn update(
        &self,
        model: &str,
        lookup: impl Into<Lookup>,
        patch: Record,
        opts: &UpdateOptions,
        ctx: &RequestContext,
    ) -> Result<Vec<Record>> {
        let meta = self.meta(model)?;
        self.update_as(&meta, AuditAction::Update, &lookup.into(), patch, opts.replace, ctx)
    }

    fn update_as(
        &self,
        meta: &Arc<ModelMeta>,
        action: AuditAction,
        lookup: &Lookup,
        patch: Record,
        replace: bool,
        ctx: &RequestContext,
    ) -> Result<Vec<Record>> {
        let mut scope = self.scope(meta, action, ctx);
        scope.entity_id = lookup.entity_id(meta);
        let result = self.update_inner(meta, lookup, patch, replace, ctx);
        if let Ok((before, after)) = &result {
            scope.observe_write(before, after);
        }
        scope.close(result.map(|(_, after)| after))
    }

    fn update_inner(
        &self,
        meta: &ModelMeta,
        lookup: &Lookup,
        mut patch: Record,
        replace: bool,
        ctx: &RequestContext,
    ) -> Result<(Vec<Record>, Vec<Record>)> {
        TenantEnforcer::new(&self.tenants).enforce_write(&mut patch, ctx, "update")?;
        self.stamp(&mut patch, ctx, false);

        let target = self.scope_query(meta, lookup.to_query(meta)?, false, ctx);
        let before = self.snapshot(meta, &target, ctx)?;
        if before.is_empty() {
            debug!(model = %meta.name, "update matched no rows");
            return Ok((before, Vec::new()));
        }

        // Check each row as it would look after the write.
        for row in &before {
            let mut candidate = if replace {
                patch.clone()
            } else {
                let mut merged = row.clone();
                merged.extend(patch.clone());
                merged
            };
            self.rls.enforce_write(&meta.name, &mut candidate, ctx)?;
        }

        self.encrypt(meta, &mut patch)?;
        let target = self.restrict_to_rows(meta, target, &before);
        let written = self.retry.run("update", || match meta.storage {
            StorageKind::Relational => self.driver(meta)?.update(&self.table(meta, ctx), &target.filters, &patch),
            StorageKind::Keyvalue => self.kv(meta)?.update(meta, &target, &patch, replace),
        });
        // Key-value updates write row by row, so a failure can leave some rows changed.
        self.invalidate(meta);
        let written = written?;
        Ok((before, self.decrypt_rows(meta, written)))
    }

    /// Insert the record, or update the one with the same id.
    pub fn upsert(&self, model: &str, data: Record, opts: &UpdateOptions, ctx: &RequestContext) -> Result<Record> {
        let meta = self.meta(model)?;
        let mut scope = self.scope(&meta, AuditAction::Upsert, ctx);
        scope.entity_id = data.get(&meta.id_field).and_then(key_text);
        let result = self.upsert_inner(&meta, data, opts.replace, ctx);
        if let Ok((before, after)) = &result {
            scope.observe_write(before, std::slice::from_ref(after));
        }
        scope.close(result.map(|(_, after)| after))
    }

    fn upsert_inner(
        &self,
        meta: &ModelMeta,
        mut record: Record,
        replace: bool,
        ctx: &RequestContext,
    ) -> Result<(Vec<Record>, Record)> {
        let tenant = TenantEnforcer::new(&self.tenants).enforce_write(&mut record, ctx, "upsert")?;
        let before = self.existing(meta, &record, ctx)?;
        let creating = before.is_empty();
        self.stamp(&mut record, ctx, creating);
        if self.soft_delete_enabled(meta) && before.iter().any(is_soft_deleted) {
            // Writing over a soft-deleted row restores it.
            record.insert(DELETED_AT.to_string(), Value::Null);
            record.insert(DELETED_BY.to_string(), Value::Null);
        }

        let reserved = if creating {
            self.rls.enforce_write(&meta.name, &mut record, ctx)?;
            let size = canonical_record_bytes(&record)?.len() as u64;
            self.quotas.reserve(&tenant, size)?;
            size
        } else {
            for row in &before {
                let mut candidate = if replace {
                    record.clone()
                } else {
                    let mut merged = row.clone();
                    merged.extend(record.clone());
                    merged
                };
                self.rls.enforce_write(&meta.name, &mut candidate, ctx)?;
            }
            0
        };

        let written = self.encrypt(meta, &mut record).and_then(|_| {
            self.retry.run("upsert", || match meta.storage {
                StorageKind::Relational => {
                    self.driver(meta)?
                        .upsert(&self.table(meta, ctx), &record, &meta.id_field)
                }
                StorageKind::Keyvalue => self.kv(meta)?.upsert(meta, record.clone(), replace),
            })
        });
        self.invalidate(meta);
        let written = match written {
            Ok(written) => written,
            Err(e) => {
                self.quotas.release(&tenant, reserved);
                return Err(e);
            }
        };
        Ok((before, self.decrypt_row(meta, written)))
    }

    /// Delete matching records. With soft delete enabled (and `hard` unset)
    /// the records are stamped with `deleted_at`/`deleted_by` instead.
    pub fn delete(
        &self,
        model: &str,
        lookup: impl Into<Lookup>,
        opts: &DeleteOptions,
        ctx: &RequestContext,
    ) -> Result<DeleteOutcome> {
        let meta = self.meta(model)?;
        let lookup = lookup.into();

        if self.soft_delete_enabled(&meta) && !opts.hard {
            let mut patch = Record::new();
            patch.insert(DELETED_AT.to_string(), Value::String(now_text()));
            patch.insert(
                DELETED_BY.to_string(),
                ctx.actor_id.clone().map(Value::String).unwrap_or(Value::Null),
            );
            let rows = self.update_as(&meta, AuditAction::SoftDelete, &lookup, patch, false, ctx)?;
            return Ok(match rows.len() {
                0 => DeleteOutcome::NotFound,
                n => DeleteOutcome::SoftDeleted(n),
            });
        }

        let mut scope = self.scope(&meta, AuditAction::Delete, ctx);
        scope.entity_id = lookup.entity_id(&meta);
        let result = self.delete_inner(&meta, &lookup, ctx);
        if let Ok((before, _)) = &result {
            scope.observe_write(before, &[]);
        }
        scope.close(result.map(|(_, removed)| match removed {
            0 => DeleteOutcome::NotFound,
            n => DeleteOutcome::Deleted(n),
        }))
    }

    fn delete_inner(&self, meta: &ModelMeta, lookup: &Lookup, ctx: &RequestContext) -> Result<(Vec<Record>, usize)> {
        if ctx.tenant_id.is_none() {
            return Err(EngineError::TenantRequired("delete".into()));
        }

        let target = self.scope_query(meta, lookup.to_query(meta)?, true, ctx);
        let before = self.snapshot(meta, &target, ctx)?;
        if before.is_empty() {
            debug!(model = %meta.name, "delete matched no rows");
            return Ok((before, 0));
        }
        for row in &before {
            self.rls.enforce_write(&meta.name, &mut row.clone(), ctx)?;
        }

        let target = self.restrict_to_rows(meta, target, &before);
        let removed = self.retry.run("delete", || match meta.storage {
            StorageKind::Relational => self.driver(meta)?.delete(&self.table(meta, ctx), &target.filters),
            StorageKind::Keyvalue => self.kv(meta)?.delete(meta, &target),
        });
        self.invalidate(meta);
        Ok((before, removed?.len()))
    }

    // Pipeline stages

    fn meta(&self, model: &str) -> Result<Arc<ModelMeta>> {
        self.registry.get(model)
    }

    fn driver(&self, meta: &ModelMeta) -> Result<&dyn RelationalDriver> {
        self.relational.as_deref().ok_or_else(|| {
            EngineError::Config(format!(
                "model '{}' is relational but no relational driver is configured",
                meta.name
            ))
        })
    }

    fn kv(&self, meta: &ModelMeta) -> Result<&GenericEngine> {
        self.generic.as_ref().ok_or_else(|| {
            EngineError::Config(format!(
                "model '{}' is key-value but no key-value store is configured",
                meta.name
            ))
        })
    }

    fn provider(&self, meta: &ModelMeta) -> String {
        let name = match meta.storage {
            StorageKind::Relational => self.relational.as_ref().map(|d| d.provider()),
            StorageKind::Keyvalue => self.generic.as_ref().map(|g| g.provider()),
        };
        name.unwrap_or("unconfigured").to_string()
    }

    fn table(&self, meta: &ModelMeta, ctx: &RequestContext) -> String {
        TenantEnforcer::new(&self.tenants).table_name(meta.storage_name(), ctx)
    }

    fn soft_delete_enabled(&self, meta: &ModelMeta) -> bool {
        meta.soft_delete.unwrap_or(self.options.soft_delete)
    }

    /// Soft-delete exclusion, tenant filter and pushed-down RLS filters.
    fn scope_query(&self, meta: &ModelMeta, mut query: QueryBuilder, include_deleted: bool, ctx: &RequestContext) -> QueryBuilder {
        if self.soft_delete_enabled(meta) && !include_deleted && !query.filters.iter().any(|f| f.field == DELETED_AT) {
            query = query.eq(DELETED_AT, Value::Null);
        }
        let query = TenantEnforcer::new(&self.tenants).enforce_read(query, ctx);
        self.rls.enforce_read(&meta.name, query, ctx)
    }

    fn select(&self, meta: &ModelMeta, query: &QueryBuilder, ctx: &RequestContext) -> Result<QueryOutput> {
        self.retry.run("select", || match meta.storage {
            StorageKind::Relational => self.driver(meta)?.select(&self.table(meta, ctx), query),
            StorageKind::Keyvalue => self.kv(meta)?.query(meta, query),
        })
    }

    /// Run a scoped query and present the rows. Custom read policies can only
    /// be checked on materialized rows, so for those models storage only
    /// applies the filters and shaping happens in memory after the check.
    fn fetch(&self, meta: &ModelMeta, query: &QueryBuilder, ctx: &RequestContext) -> Result<QueryOutput> {
        if !self.rls.has_read_post_filter(&meta.name) {
            return Ok(match self.select(meta, query, ctx)? {
                QueryOutput::Rows(rows) => QueryOutput::Rows(self.present(meta, rows, ctx)),
                count => count,
            });
        }

        let scan = QueryBuilder {
            filters: query.filters.clone(),
            ..QueryBuilder::default()
        };
        let rows = self.select(meta, &scan, ctx)?.rows();
        let visible = self.rls.filter_rows(&meta.name, self.decrypt_rows(meta, rows), ctx);
        let shape = QueryBuilder {
            filters: Vec::new(),
            ..query.clone()
        };
        Ok(match query::execute(visible, &shape)? {
            QueryOutput::Rows(rows) => QueryOutput::Rows(self.mask_rows(meta, rows, ctx)),
            count => count,
        })
    }

    /// Plaintext rows the caller may see, for before-images of writes.
    fn snapshot(&self, meta: &ModelMeta, target: &QueryBuilder, ctx: &RequestContext) -> Result<Vec<Record>> {
        let scan = QueryBuilder {
            filters: target.filters.clone(),
            ..QueryBuilder::default()
        };
        let rows = self.select(meta, &scan, ctx)?.rows();
        Ok(self.rls.filter_rows(&meta.name, self.decrypt_rows(meta, rows), ctx))
    }

    /// Stored rows sharing the record's id. A row owned by another tenant is
    /// never overwritten.
    fn existing(&self, meta: &ModelMeta, record: &Record, ctx: &RequestContext) -> Result<Vec<Record>> {
        let Some(id) = record.get(&meta.id_field).filter(|v| !v.is_null()) else {
            return Ok(Vec::new());
        };
        let mut rows = self
            .select(meta, &QueryBuilder::new().eq(&meta.id_field, id.clone()), ctx)?
            .rows();
        let tenant = ctx.tenant_id.as_deref();
        if meta.tenant_partitioned() {
            // Other tenants' rows live under their own partition keys.
            rows.retain(|row| row.get(TENANT_FIELD).and_then(Value::as_str) == tenant);
        }
        if rows
            .iter()
            .any(|row| row.get(TENANT_FIELD).and_then(Value::as_str) != tenant)
        {
            warn!(model = %meta.name, tenant = ?tenant, "upsert targets a record of another tenant");
            return Err(EngineError::PermissionDenied(format!(
                "record {} of '{}' belongs to another tenant",
                id, meta.name
            )));
        }
        Ok(self.decrypt_rows(meta, rows))
    }

    /// Narrow a write target to the rows that passed the read post-filter.
    fn restrict_to_rows(&self, meta: &ModelMeta, target: QueryBuilder, rows: &[Record]) -> QueryBuilder {
        if !self.rls.has_read_post_filter(&meta.name) {
            return target;
        }
        let ids: Vec<Value> = rows.iter().filter_map(|r| r.get(&meta.id_field).cloned()).collect();
        target.filter(&meta.id_field, Operator::In, Value::Array(ids))
    }

    fn stamp(&self, record: &mut Record, ctx: &RequestContext, creating: bool) {
        if !self.options.stamp_fields {
            return;
        }
        let now = Value::String(now_text());
        let actor = ctx.actor_id.clone().map(Value::String);
        if creating {
            record.entry(CREATED_AT).or_insert_with(|| now.clone());
            if let Some(actor) = &actor {
                record.entry(CREATED_BY).or_insert_with(|| actor.clone());
            }
        }
        record.entry(UPDATED_AT).or_insert(now);
        if let Some(actor) = actor {
            record.entry(UPDATED_BY).or_insert(actor);
        }
    }

    fn encrypt(&self, meta: &ModelMeta, record: &mut Record) -> Result<()> {
        if meta.encrypted_fields.is_empty() {
            return Ok(());
        }
        let encryption = self.encryption.as_ref().ok_or_else(|| {
            EngineError::Encryption(format!(
                "model '{}' declares encrypted fields but no key is configured",
                meta.name
            ))
        })?;
        encryption.encrypt_fields(record, &meta.encrypted_fields)
    }

    fn decrypt_row(&self, meta: &ModelMeta, mut record: Record) -> Record {
        if let Some(encryption) = &self.encryption {
            encryption.decrypt_fields(&mut record, &meta.encrypted_fields);
        }
        record
    }

    fn decrypt_rows(&self, meta: &ModelMeta, rows: Vec<Record>) -> Vec<Record> {
        if meta.encrypted_fields.is_empty() {
            return rows;
        }
        rows.into_iter().map(|r| self.decrypt_row(meta, r)).collect()
    }

    fn mask_rows(&self, meta: &ModelMeta, rows: Vec<Record>, ctx: &RequestContext) -> Vec<Record> {
        rows.into_iter()
            .map(|r| self.masking.mask(&meta.name, r, &meta.masked_fields, ctx))
            .collect()
    }

    /// Decrypt then mask, the order every read leaves the engine in.
    fn present(&self, meta: &ModelMeta, rows: Vec<Record>, ctx: &RequestContext) -> Vec<Record> {
        let rows = self.decrypt_rows(meta, rows);
        self.mask_rows(meta, rows, ctx)
    }

    /// Serve from the cache when the model opts in, else load and populate.
    /// The key covers everything that changes what the caller may see.
    fn cached<T, F>(
        &self,
        meta: &ModelMeta,
        descriptor: Value,
        opts: &ReadOptions,
        ctx: &RequestContext,
        load: F,
    ) -> Result<(T, bool)>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        let cache = match &self.cache {
            Some(cache) if meta.cache && !opts.no_cache => cache,
            _ => return Ok((load()?, false)),
        };

        let key = cache.key(
            &meta.name,
            &json!({
                "request": descriptor,
                "tenant": ctx.tenant_id,
                "actor": ctx.actor_id,
                "roles": ctx.roles,
                "include_deleted": opts.include_deleted,
            }),
        )?;
        if let Some(hit) = cache.get(&key) {
            match serde_json::from_value(hit) {
                Ok(value) => return Ok((value, true)),
                Err(e) => warn!(model = %meta.name, error = %e, "discarding unreadable cache entry"),
            }
        }

        let value = load()?;
        let ttl = opts.cache_ttl.or(meta.cache_ttl.map(Duration::from_secs));
        cache.put(&key, serde_json::to_value(&value)?, ttl);
        Ok((value, false))
    }

    fn invalidate(&self, meta: &ModelMeta) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&meta.name);
        }
    }

    fn scope<'a>(&'a self, meta: &Arc<ModelMeta>, action: AuditAction, ctx: &'a RequestContext) -> OperationScope<'a> {
        let audited = match action {
            AuditAction::Read | AuditAction::ReadPage | AuditAction::LinqQuery => self.options.audit_reads,
            _ => true,
        };
        OperationScope {
            engine: self,
            meta: meta.clone(),
            action,
            ctx,
            audited,
            timer: Some(self.metrics.start(action.as_str(), &meta.name, ctx.tenant_id.as_deref())),
            entity_id: None,
            before: None,
            after: None,
            changed: None,
            rows: 0,
            cache_hit: false,
            error: None,
            done: false,
        }
    }
}

/// Bookkeeping for one operation. Dropping it records the metric sample and
/// appends the audit record, so both happen exactly once on every exit path.
struct OperationScope<'a> {
    engine: &'a DataEngine,
    meta: Arc<ModelMeta>,
    action: AuditAction,
    ctx: &'a RequestContext,
    audited: bool,
    timer: Option<OperationTimer<'a>>,
    entity_id: Option<String>,
    before: Option<Value>,
    after: Option<Value>,
    changed: Option<Vec<String>>,
    rows: usize,
    cache_hit: bool,
    error: Option<String>,
    done: bool,
}

impl OperationScope<'_> {
    fn observe_read(&mut self, rows: usize, cache_hit: bool) {
        self.rows = rows;
        self.cache_hit = cache_hit;
        self.after = Some(json!({ "count": rows }));
    }

    fn observe_write(&mut self, before: &[Record], after: &[Record]) {
        if self.entity_id.is_none() {
            let only = match (before, after) {
                (_, [row]) | ([row], []) => Some(row),
                _ => None,
            };
            self.entity_id = only.and_then(|r| r.get(&self.meta.id_field)).and_then(key_text);
        }
        // Diff the plaintext; the stored snapshots hide encrypted values.
        if let ([b], [a]) = (before, after) {
            self.changed = Some(changed_fields(b, a));
        }
        self.before = audit_snapshot(&self.meta, before);
        self.after = audit_snapshot(&self.meta, after);
        self.rows = before.len().max(after.len());
    }

    fn close<T>(mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            warn!(
                model = %self.meta.name,
                op = %self.action,
                kind = e.kind(),
                error = %e,
                "operation failed"
            );
            self.error = Some(e.to_string());
        }
        self.done = true;
        result
    }
}

impl Drop for OperationScope<'_> {
    fn drop(&mut self) {
        if !self.done && self.error.is_none() {
            self.error = Some("operation aborted before completion".to_string());
        }
        if let Some(timer) = self.timer.take() {
            timer.finish(self.error.is_none(), self.rows, self.cache_hit, self.error.clone());
        }
        if !self.audited {
            return;
        }
        let Some(ledger) = &self.engine.audit else {
            return;
        };

        let mut record = AuditRecord::new(
            self.action,
            &self.meta.name,
            self.meta.storage,
            &self.engine.provider(&self.meta),
            self.ctx,
        )
        .with_entity(self.entity_id.take())
        .with_snapshots(self.before.take(), self.after.take());
        if let Some(changed) = self.changed.take() {
            record.changed_fields = changed;
        }
        if let Some(error) = self.error.take() {
            record.success = false;
            record.error = Some(error);
        }
        ledger.record(record);
    }
}

/// Audit form of a set of rows: one object, an array, or nothing.
fn audit_snapshot(meta: &ModelMeta, rows: &[Record]) -> Option<Value> {
    let redact = |row: &Record| {
        let mut row = row.clone();
        for field in &meta.encrypted_fields {
            if let Some(value) = row.get_mut(field) {
                if !value.is_null() {
                    *value = Value::String(ENCRYPTED_PLACEHOLDER.to_string());
                }
            }
        }
        Value::Object(row)
    };
    match rows {
        [] => None,
        [row] => Some(redact(row)),
        rows => Some(Value::Array(rows.iter().map(redact).collect())),
    }
}

fn key_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn is_soft_deleted(row: &Record) -> bool {
    row.get(DELETED_AT).is_some_and(|v| !v.is_null())
}

fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
