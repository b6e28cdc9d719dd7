//! Audit Records
//!
//! One immutable entry per engine operation. Each record commits to its
//! predecessor's hash within the same tenant chain.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::engine::canonical::{canonical_bytes, sha256_hex, Record};
use crate::engine::context::RequestContext;
use crate::engine::error::{EngineError, Result};
use crate::engine::model::StorageKind;
use crate::engine::query::values_equal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Create,
    Read,
    ReadPage,
    Update,
    Upsert,
    Delete,
    SoftDelete,
    LinqQuery,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Read => "read",
            AuditAction::ReadPage => "read_page",
            AuditAction::Update => "update",
            AuditAction::Upsert => "upsert",
            AuditAction::Delete => "delete",
            AuditAction::SoftDelete => "soft_delete",
            AuditAction::LinqQuery => "linq_query",
        }
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        serde_json::from_value(Value::String(s.to_string()))
            .map_err(|_| EngineError::Validation(format!("unknown audit action '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id: String,
    pub timestamp: DateTime<Utc>,
    pub tenant_id: Option<String>,
    pub actor_id: Option<String>,
    pub roles: Vec<String>,
    pub action: AuditAction,
    pub model: String,
    pub entity_id: Option<String>,
    pub storage_type: StorageKind,
    pub provider: String,
    pub success: bool,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub changed_fields: Vec<String>,
    pub trace_id: Option<String>,
    pub request_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub error: Option<String>,
    pub hash: String,
    pub previous_hash: Option<String>,
}

impl AuditRecord {
    /// Unsealed record for an operation by the caller in `ctx`.
    pub fn new(action: AuditAction, model: &str, storage_type: StorageKind, provider: &str, ctx: &RequestContext) -> Self {
        Self {
            audit_id: uuid::Uuid::new_v4().to_string(),
            // Storage keeps microseconds; truncate so reloaded records hash the same.
            timestamp: Utc::now().trunc_subsecs(6),
            tenant_id: ctx.tenant_id.clone(),
            actor_id: ctx.actor_id.clone(),
            roles: ctx.roles.clone(),
            action,
            model: model.to_string(),
            entity_id: None,
            storage_type,
            provider: provider.to_string(),
            success: true,
            before: None,
            after: None,
            changed_fields: Vec::new(),
            trace_id: ctx.trace_id.clone(),
            request_id: ctx.request_id.clone(),
            ip_address: ctx.ip_address.clone(),
            user_agent: ctx.user_agent.clone(),
            error: None,
            hash: String::new(),
            previous_hash: None,
        }
    }

    pub fn with_entity(mut self, entity_id: Option<String>) -> Self {
        self.entity_id = entity_id;
        self
    }

    /// Attach snapshots and derive the changed field list from them.
    pub fn with_snapshots(mut self, before: Option<Value>, after: Option<Value>) -> Self {
        self.changed_fields = match (before.as_ref().and_then(Value::as_object), after.as_ref().and_then(Value::as_object)) {
            (Some(b), Some(a)) => changed_fields(b, a),
            _ => Vec::new(),
        };
        self.before = before;
        self.after = after;
        self
    }

    pub fn with_error(mut self, error: &EngineError) -> Self {
        self.success = false;
        self.error = Some(error.to_string());
        self
    }

    /// Digest of the canonical record without its own `hash` field.
    pub fn compute_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Value::Object(map) = &mut value {
            map.remove("hash");
        }
        Ok(sha256_hex(&canonical_bytes(&value)?))
    }

    /// Link to the chain tail and compute the record hash.
    pub fn seal(&mut self, previous_hash: Option<String>) -> Result<()> {
        self.previous_hash = previous_hash;
        self.hash = self.compute_hash()?;
        Ok(())
    }
}

/// Sorted keys whose values differ between two snapshots.
pub fn changed_fields(before: &Record, after: &Record) -> Vec<String> {
    let mut fields: Vec<String> = before
        .keys()
        .chain(after.keys())
        .filter(|k| match (before.get(*k), after.get(*k)) {
            (Some(b), Some(a)) => !values_equal(b, a),
            _ => true,
        })
        .cloned()
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> AuditRecord {
        let ctx = RequestContext::for_tenant("t1", "u1").with_roles(&["admin"]);
        AuditRecord::new(AuditAction::Update, "User", StorageKind::Relational, "sqlite", &ctx)
    }

    #[test]
    fn test_hash_excludes_itself() {
        let mut r = record();
        r.seal(None).unwrap();
        assert_eq!(r.hash.len(), 64);
        assert_eq!(r.compute_hash().unwrap(), r.hash);

        let mut linked = r.clone();
        linked.seal(Some(r.hash.clone())).unwrap();
        assert_ne!(linked.hash, r.hash);
    }

    #[test]
    fn test_hash_survives_serde_roundtrip() {
        let mut r = record().with_snapshots(Some(json!({"a": 1})), Some(json!({"a": 2, "b": true})));
        r.seal(None).unwrap();
        let back: AuditRecord = serde_json::from_str(&serde_json::to_string(&r).unwrap()).unwrap();
        assert_eq!(back.compute_hash().unwrap(), r.hash);
    }

    #[test]
    fn test_changed_fields() {
        let before = json!({"a": 1, "b": 2, "c": 3}).as_object().cloned().unwrap();
        let after = json!({"a": 1.0, "b": 5, "d": 0}).as_object().cloned().unwrap();
        assert_eq!(changed_fields(&before, &after), vec!["b", "c", "d"]);

        let r = record().with_snapshots(None, Some(json!({"a": 1})));
        assert!(r.changed_fields.is_empty());
    }

    #[test]
    fn test_action_names() {
        assert_eq!(AuditAction::ReadPage.to_string(), "read_page");
        assert_eq!("soft_delete".parse::<AuditAction>().unwrap(), AuditAction::SoftDelete);
        assert!("drop".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_failure_marks_record() {
        let r = record().with_error(&EngineError::PermissionDenied("nope".into()));
        assert!(!r.success);
        assert!(r.error.unwrap().contains("nope"));
    }
}
