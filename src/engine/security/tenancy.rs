//! Multi-Tenancy
//!
//! Tenant registry, isolation enforcement, and storage quotas.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::engine::canonical::{validate_identifier, Record};
use crate::engine::context::RequestContext;
use crate::engine::error::{EngineError, Result};
use crate::engine::query::QueryBuilder;

/// Field carrying the owning tenant on every record
pub const TENANT_FIELD: &str = "tenant_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    /// Shared tables, rows tagged with `tenant_id`
    #[default]
    Shared,
    /// One schema per tenant
    Schema,
    /// One database per tenant
    Database,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::Shared => write!(f, "shared"),
            IsolationLevel::Schema => write!(f, "schema"),
            IsolationLevel::Database => write!(f, "database"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    pub tenant_id: String,
    #[serde(default)]
    pub isolation: IsolationLevel,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_name: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_quota_bytes: Option<u64>,
    #[serde(default)]
    pub features: Vec<String>,
}

fn default_max_connections() -> u32 {
    10
}

impl TenantConfig {
    pub fn shared(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            isolation: IsolationLevel::Shared,
            schema_name: None,
            database_name: None,
            max_connections: default_max_connections(),
            storage_quota_bytes: None,
            features: Vec::new(),
        }
    }

    pub fn with_schema(mut self, schema: &str) -> Self {
        self.isolation = IsolationLevel::Schema;
        self.schema_name = Some(schema.to_string());
        self
    }

    pub fn with_database(mut self, database: &str) -> Self {
        self.isolation = IsolationLevel::Database;
        self.database_name = Some(database.to_string());
        self
    }

    pub fn with_quota(mut self, bytes: u64) -> Self {
        self.storage_quota_bytes = Some(bytes);
        self
    }

    pub fn has_feature(&self, feature: &str) -> bool {
        self.features.iter().any(|f| f == feature)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tenant_id.trim().is_empty() {
            return Err(EngineError::Validation("tenant id cannot be empty".into()));
        }
        match self.isolation {
            IsolationLevel::Shared => {}
            IsolationLevel::Schema => {
                let schema = self.schema_name.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!("tenant '{}' needs a schema name", self.tenant_id))
                })?;
                validate_identifier(schema)?;
            }
            IsolationLevel::Database => {
                let db = self.database_name.as_deref().ok_or_else(|| {
                    EngineError::Validation(format!("tenant '{}' needs a database name", self.tenant_id))
                })?;
                validate_identifier(db)?;
            }
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct TenantRegistry {
    tenants: RwLock<HashMap<String, TenantConfig>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, config: TenantConfig) -> Result<()> {
        config.validate()?;
        self.tenants.write().insert(config.tenant_id.clone(), config);
        Ok(())
    }

    pub fn get(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.tenants.read().get(tenant_id).cloned()
    }

    pub fn list(&self) -> Vec<TenantConfig> {
        let mut all: Vec<_> = self.tenants.read().values().cloned().collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}

/// Applies tenant isolation to queries, writes, and table names.
pub struct TenantEnforcer<'a> {
    registry: &'a TenantRegistry,
}

impl<'a> TenantEnforcer<'a> {
    pub fn new(registry: &'a TenantRegistry) -> Self {
        Self { registry }
    }

    /// Add a tenant equality filter when the caller has a tenant.
    pub fn enforce_read(&self, query: QueryBuilder, ctx: &RequestContext) -> QueryBuilder {
        match &ctx.tenant_id {
            Some(tenant) => scope_query(query, tenant),
            None => query,
        }
    }

    /// Writes need a tenant; the record is stamped with it.
    pub fn enforce_write(&self, record: &mut Record, ctx: &RequestContext, op: &str) -> Result<String> {
        let tenant = ctx
            .tenant_id
            .clone()
            .ok_or_else(|| EngineError::TenantRequired(op.to_string()))?;
        record.insert(TENANT_FIELD.to_string(), Value::String(tenant.clone()));
        Ok(tenant)
    }

    /// Physical table for the caller's tenant. Unknown tenants share tables.
    pub fn table_name(&self, base_table: &str, ctx: &RequestContext) -> String {
        let config = ctx.tenant_id.as_deref().and_then(|t| self.registry.get(t));
        match config {
            Some(TenantConfig {
                isolation: IsolationLevel::Schema,
                schema_name: Some(schema),
                ..
            }) => format!("{}.{}", schema, base_table),
            Some(TenantConfig {
                isolation: IsolationLevel::Database,
                database_name: Some(db),
                ..
            }) => format!("{}.public.{}", db, base_table),
            _ => base_table.to_string(),
        }
    }
}

/// Replace any caller-supplied tenant equality with the enforced one.
fn scope_query(mut query: QueryBuilder, tenant: &str) -> QueryBuilder {
    query.filters.retain(|f| f.field != TENANT_FIELD);
    query.eq(TENANT_FIELD, tenant)
}

/// Tracks bytes written per tenant against configured quotas.
pub struct TenantQuotaManager {
    registry: Arc<TenantRegistry>,
    usage: RwLock<HashMap<String, u64>>,
}

impl TenantQuotaManager {
    pub fn new(registry: Arc<TenantRegistry>) -> Self {
        Self {
            registry,
            usage: RwLock::new(HashMap::new()),
        }
    }

    fn quota(&self, tenant_id: &str) -> Option<u64> {
        self.registry.get(tenant_id).and_then(|c| c.storage_quota_bytes)
    }

    pub fn check(&self, tenant_id: &str, bytes: u64) -> bool {
        match self.quota(tenant_id) {
            Some(quota) => self.usage(tenant_id) + bytes <= quota,
            None => true,
        }
    }

    /// Record `bytes` against the tenant, failing with a validation error if
    /// that would exceed its quota.
    pub fn reserve(&self, tenant_id: &str, bytes: u64) -> Result<()> {
        let quota = self.quota(tenant_id);
        let mut usage = self.usage.write();
        let used = usage.entry(tenant_id.to_string()).or_insert(0);
        if let Some(quota) = quota {
            if *used + bytes > quota {
                return Err(EngineError::Validation(format!(
                    "storage quota exceeded for tenant '{}': {} of {} bytes used",
                    tenant_id, used, quota
                )));
            }
        }
        *used += bytes;
        Ok(())
    }

    /// Give back bytes reserved for a write that did not happen.
    pub fn release(&self, tenant_id: &str, bytes: u64) {
        if let Some(used) = self.usage.write().get_mut(tenant_id) {
            *used = used.saturating_sub(bytes);
        }
    }

    pub fn usage(&self, tenant_id: &str) -> u64 {
        self.usage.read().get(tenant_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query::Operator;
    use serde_json::json;

    #[test]
    fn test_registry_validation() {
        let registry = TenantRegistry::new();
        assert!(registry.register(TenantConfig::shared("t1")).is_ok());
        let mut bad = TenantConfig::shared("t2");
        bad.isolation = IsolationLevel::Schema;
        assert!(registry.register(bad).is_err());
        assert!(registry.register(TenantConfig::shared("t3").with_schema("tenant_t3")).is_ok());
        assert_eq!(registry.list().len(), 2);
        assert_eq!(registry.get("t1").unwrap().max_connections, 10);
    }

    #[test]
    fn test_table_names() {
        let registry = TenantRegistry::new();
        registry.register(TenantConfig::shared("a")).unwrap();
        registry.register(TenantConfig::shared("b").with_schema("tenant_b")).unwrap();
        registry.register(TenantConfig::shared("c").with_database("db_c")).unwrap();
        let enforcer = TenantEnforcer::new(&registry);

        let ctx = |t: &str| RequestContext::new().with_tenant(t);
        assert_eq!(enforcer.table_name("users", &ctx("a")), "users");
        assert_eq!(enforcer.table_name("users", &ctx("b")), "tenant_b.users");
        assert_eq!(enforcer.table_name("users", &ctx("c")), "db_c.public.users");
        assert_eq!(enforcer.table_name("users", &RequestContext::new()), "users");
    }

    #[test]
    fn test_read_scoping_overrides_caller_filter() {
        let registry = TenantRegistry::new();
        let enforcer = TenantEnforcer::new(&registry);
        let q = QueryBuilder::new().eq("tenant_id", "other").filter("age", Operator::Gt, 3);

        let scoped = enforcer.enforce_read(q.clone(), &RequestContext::new().with_tenant("t1"));
        assert_eq!(scoped.filters.len(), 2);
        assert!(scoped.filters.iter().any(|f| f.field == "tenant_id" && f.value == json!("t1")));

        assert_eq!(enforcer.enforce_read(q.clone(), &RequestContext::new()), q);
    }

    #[test]
    fn test_write_requires_tenant() {
        let registry = TenantRegistry::new();
        let enforcer = TenantEnforcer::new(&registry);
        let mut record = Record::new();
        assert!(matches!(
            enforcer.enforce_write(&mut record, &RequestContext::new(), "create"),
            Err(EngineError::TenantRequired(_))
        ));
        enforcer
            .enforce_write(&mut record, &RequestContext::new().with_tenant("t1"), "create")
            .unwrap();
        assert_eq!(record["tenant_id"], "t1");
    }

    #[test]
    fn test_quota() {
        let registry = Arc::new(TenantRegistry::new());
        registry.register(TenantConfig::shared("t1").with_quota(100)).unwrap();
        let quotas = TenantQuotaManager::new(registry);

        quotas.reserve("t1", 60).unwrap();
        assert!(quotas.reserve("t1", 50).is_err());
        quotas.reserve("t1", 40).unwrap();
        assert_eq!(quotas.usage("t1"), 100);
        quotas.release("t1", 30);
        assert_eq!(quotas.usage("t1"), 70);
        assert!(quotas.reserve("unlimited", 1_000_000).is_ok());
    }
}
