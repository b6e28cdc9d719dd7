//! Row-Level Security
//!
//! Ordered, named policies per model. Field-equality policies are pushed into
//! the read query; arbitrary predicates run over materialized rows. Write
//! policies are checked before the mutation and deny it outright.

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

use crate::engine::canonical::Record;
use crate::engine::context::RequestContext;
use crate::engine::error::{EngineError, Result};
use crate::engine::query::{values_equal, Operator, QueryBuilder};

/// Operations a policy applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyScope {
    Read,
    Write,
    Both,
}

impl PolicyScope {
    fn covers(self, access: Access) -> bool {
        matches!(
            (self, access),
            (PolicyScope::Both, _) | (PolicyScope::Read, Access::Read) | (PolicyScope::Write, Access::Write)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

/// Right-hand side of a field-equality policy
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    TenantId,
    ActorId,
    Literal(Value),
}

impl ContextValue {
    fn resolve(&self, ctx: &RequestContext) -> Option<Value> {
        match self {
            ContextValue::TenantId => ctx.tenant_id.clone().map(Value::String),
            ContextValue::ActorId => ctx.actor_id.clone().map(Value::String),
            ContextValue::Literal(v) => Some(v.clone()),
        }
    }
}

pub type PolicyFn = Arc<dyn Fn(&Record, &RequestContext) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum Predicate {
    /// `record[field] == value`; pushed down into read queries
    FieldEquals { field: String, value: ContextValue },
    /// Arbitrary check over a materialized row
    Custom(PolicyFn),
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::FieldEquals { field, value } => {
                f.debug_struct("FieldEquals").field("field", field).field("value", value).finish()
            }
            Predicate::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Policy {
    pub name: String,
    pub scope: PolicyScope,
    pub predicate: Predicate,
}

impl Policy {
    pub fn new<F>(name: &str, scope: PolicyScope, check: F) -> Self
    where
        F: Fn(&Record, &RequestContext) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.to_string(),
            scope,
            predicate: Predicate::Custom(Arc::new(check)),
        }
    }

    pub fn field_equals(name: &str, scope: PolicyScope, field: &str, value: ContextValue) -> Self {
        Self {
            name: name.to_string(),
            scope,
            predicate: Predicate::FieldEquals {
                field: field.to_string(),
                value,
            },
        }
    }

    /// Rows must belong to the caller's tenant
    pub fn tenant_isolation(scope: PolicyScope) -> Self {
        Self::field_equals("tenant_isolation", scope, "tenant_id", ContextValue::TenantId)
    }

    /// Rows must be owned or created by the caller
    pub fn ownership(scope: PolicyScope) -> Self {
        Self::new("ownership", scope, |row, ctx| {
            let Some(actor) = ctx.actor_id.as_deref() else {
                return false;
            };
            ["owner_id", "created_by"]
                .iter()
                .any(|f| row.get(*f).and_then(Value::as_str) == Some(actor))
        })
    }

    /// A row's `required_role`, when set, must be one of the caller's roles
    pub fn role_based(scope: PolicyScope) -> Self {
        Self::new("role_based", scope, |row, ctx| {
            match row.get("required_role").and_then(Value::as_str) {
                Some(role) if !role.is_empty() => ctx.has_role(role),
                _ => true,
            }
        })
    }

    /// High sensitivity needs admin; medium needs admin or editor
    pub fn sensitivity(scope: PolicyScope) -> Self {
        Self::new("sensitivity", scope, |row, ctx| {
            match row.get("sensitivity_level").and_then(Value::as_str).unwrap_or("low") {
                "high" => ctx.has_role("admin"),
                "medium" => ctx.has_role("admin") || ctx.has_role("editor"),
                _ => true,
            }
        })
    }

    /// Rows created over a year ago are visible only to the archivist role
    pub fn time_based(scope: PolicyScope) -> Self {
        Self::archived_after(scope, Duration::days(ARCHIVE_AGE_DAYS))
    }

    /// Rows older than `max_age` by `created_at` need the archivist role.
    /// Rows without a readable `created_at` pass.
    pub fn archived_after(scope: PolicyScope, max_age: Duration) -> Self {
        Self::new("time_based", scope, move |row, ctx| {
            !is_archived(row, max_age, Utc::now()) || ctx.has_role(ARCHIVIST_ROLE)
        })
    }

    pub fn check(&self, row: &Record, ctx: &RequestContext) -> bool {
        match &self.predicate {
            Predicate::FieldEquals { field, value } => match (value.resolve(ctx), row.get(field)) {
                (Some(expected), Some(actual)) => values_equal(actual, &expected),
                _ => false,
            },
            Predicate::Custom(check) => check(row, ctx),
        }
    }

    fn is_custom(&self) -> bool {
        matches!(self.predicate, Predicate::Custom(_))
    }
}

/// Age past which [`Policy::time_based`] hides rows
pub const ARCHIVE_AGE_DAYS: i64 = 365;

/// Role allowed to read archived rows
pub const ARCHIVIST_ROLE: &str = "archivist";

fn is_archived(row: &Record, max_age: Duration, now: DateTime<Utc>) -> bool {
    row.get("created_at")
        .and_then(Value::as_str)
        .and_then(|text| DateTime::parse_from_rfc3339(text).ok())
        .is_some_and(|created| now.signed_duration_since(created) > max_age)
}

#[derive(Default)]
struct ModelPolicies {
    policies: Vec<Policy>,
    read_defaults: Record,
    write_defaults: Record,
}

#[derive(Default)]
pub struct RowLevelSecurity {
    models: RwLock<HashMap<String, ModelPolicies>>,
}

impl RowLevelSecurity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a policy. Names are unique per model.
    pub fn add_policy(&self, model: &str, policy: Policy) -> Result<()> {
        let mut models = self.models.write();
        let entry = models.entry(model.to_string()).or_default();
        if entry.policies.iter().any(|p| p.name == policy.name) {
            return Err(EngineError::Validation(format!(
                "policy '{}' already exists for model '{}'",
                policy.name, model
            )));
        }
        entry.policies.push(policy);
        Ok(())
    }

    /// Equality constraints added to reads, and values filled into writes,
    /// when the caller has not supplied them.
    pub fn set_default_filters(&self, model: &str, read: Record, write: Record) {
        let mut models = self.models.write();
        let entry = models.entry(model.to_string()).or_default();
        entry.read_defaults = read;
        entry.write_defaults = write;
    }

    pub fn policy_names(&self, model: &str) -> Vec<String> {
        self.models
            .read()
            .get(model)
            .map(|m| m.policies.iter().map(|p| p.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Whether reads need a post-filter pass over materialized rows.
    pub fn has_read_post_filter(&self, model: &str) -> bool {
        self.models
            .read()
            .get(model)
            .map(|m| m.policies.iter().any(|p| p.is_custom() && p.scope.covers(Access::Read)))
            .unwrap_or(false)
    }

    pub fn check_access(&self, model: &str, row: &Record, ctx: &RequestContext, access: Access) -> bool {
        let models = self.models.read();
        let Some(entry) = models.get(model) else {
            return true;
        };
        for policy in entry.policies.iter().filter(|p| p.scope.covers(access)) {
            if !policy.check(row, ctx) {
                info!(model, policy = %policy.name, op = %access, "rls denied");
                return false;
            }
        }
        true
    }

    /// Push equality policies and default read filters into the query.
    ///
    /// A field-equality policy whose context value is absent matches nothing,
    /// expressed as an empty `IN` list.
    pub fn enforce_read(&self, model: &str, mut query: QueryBuilder, ctx: &RequestContext) -> QueryBuilder {
        let models = self.models.read();
        let Some(entry) = models.get(model) else {
            return query;
        };

        for (field, value) in &entry.read_defaults {
            if !query.has_equality_on(field) {
                query = query.eq(field, value.clone());
            }
        }

        for policy in entry.policies.iter().filter(|p| p.scope.covers(Access::Read)) {
            if let Predicate::FieldEquals { field, value } = &policy.predicate {
                query = match value.resolve(ctx) {
                    Some(v) => query.eq(field, v),
                    None => query.filter(field, Operator::In, Value::Array(Vec::new())),
                };
            }
        }
        query
    }

    /// Drop rows failing any custom read policy.
    pub fn filter_rows(&self, model: &str, rows: Vec<Record>, ctx: &RequestContext) -> Vec<Record> {
        let models = self.models.read();
        let Some(entry) = models.get(model) else {
            return rows;
        };
        let custom: Vec<&Policy> = entry
            .policies
            .iter()
            .filter(|p| p.is_custom() && p.scope.covers(Access::Read))
            .collect();
        if custom.is_empty() {
            return rows;
        }
        rows.into_iter()
            .filter(|row| custom.iter().all(|p| p.check(row, ctx)))
            .collect()
    }

    /// Check write policies against the record as it would be written, then
    /// fill in default write values.
    pub fn enforce_write(&self, model: &str, record: &mut Record, ctx: &RequestContext) -> Result<()> {
        if !self.check_access(model, record, ctx, Access::Write) {
            return Err(EngineError::PermissionDenied(format!(
                "row-level security denied write on '{}'",
                model
            )));
        }
        if let Some(entry) = self.models.read().get(model) {
            for (field, value) in &entry.write_defaults {
                record.entry(field.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(())
    }
}
