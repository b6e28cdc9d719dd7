//! Audit Storage
//!
//! Persistence for the audit chain. Appends are compare-and-append: a record
//! is only written if its `previous_hash` still matches the tenant's tail,
//! which keeps the chain linear across processes sharing one database.

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

use super::record::AuditRecord;
use crate::engine::adapter::sqlite::DbPool;
use crate::engine::adapter::SqliteDriver;
use crate::engine::error::{EngineError, Result};

pub const AUDIT_TABLE: &str = "polydb_audit_log";

pub trait AuditStore: Send + Sync {
    /// Hash of the newest record in the tenant's chain
    fn last_hash(&self, tenant_id: Option<&str>) -> Result<Option<String>>;

    /// Persist `record` if the tenant tail still equals its `previous_hash`.
    /// Returns false when another writer got there first.
    fn compare_and_append(&self, record: &AuditRecord) -> Result<bool>;

    /// Every record for a tenant, oldest first
    fn records_for_tenant(&self, tenant_id: Option<&str>) -> Result<Vec<AuditRecord>>;

    /// Records for one entity, oldest first
    fn history(&self, tenant_id: Option<&str>, model: &str, entity_id: &str) -> Result<Vec<AuditRecord>>;
}

/// Ledger table in a SQLite database
pub struct SqliteAuditStore {
    pool: DbPool,
}

impl SqliteAuditStore {
    /// Use the driver's database, creating the ledger table if needed.
    pub fn new(driver: &SqliteDriver) -> Result<Self> {
        let store = Self { pool: driver.pool() };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.pool.get()?;
        conn.execute_batch(&format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                audit_id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                tenant_id TEXT,
                actor_id TEXT,
                roles TEXT NOT NULL,
                action TEXT NOT NULL,
                model TEXT NOT NULL,
                entity_id TEXT,
                storage_type TEXT NOT NULL,
                provider TEXT NOT NULL,
                success INTEGER NOT NULL,
                before TEXT,
                after TEXT,
                changed_fields TEXT NOT NULL,
                trace_id TEXT,
                request_id TEXT,
                ip_address TEXT,
                user_agent TEXT,
                error TEXT,
                hash TEXT NOT NULL,
                previous_hash TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_tenant_seq ON {table}(tenant_id, seq DESC);
            CREATE INDEX IF NOT EXISTS idx_audit_tenant_timestamp ON {table}(tenant_id, timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_model_entity ON {table}(model, entity_id);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON {table}(actor_id, timestamp);
            "#,
            table = AUDIT_TABLE
        ))?;
        Ok(())
    }

    fn select(&self, clause: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<AuditRecord>> {
        let conn = self.pool.get()?;
        let sql = format!("SELECT * FROM {} WHERE {} ORDER BY seq ASC", AUDIT_TABLE, clause);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, |row| Ok(read_row(row)))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row??);
        }
        Ok(out)
    }
}

fn json_text<T: serde::Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?)
}

fn parse_json<T: serde::de::DeserializeOwned>(text: &str) -> Result<T> {
    Ok(serde_json::from_str(text)?)
}

fn read_row(row: &Row<'_>) -> Result<AuditRecord> {
    let timestamp: String = row.get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|e| EngineError::Integrity(format!("bad audit timestamp '{}': {}", timestamp, e)))?
        .with_timezone(&Utc);
    let action: String = row.get("action")?;
    let storage_type: String = row.get("storage_type")?;
    let before: Option<String> = row.get("before")?;
    let after: Option<String> = row.get("after")?;

    Ok(AuditRecord {
        audit_id: row.get("audit_id")?,
        timestamp,
        tenant_id: row.get("tenant_id")?,
        actor_id: row.get("actor_id")?,
        roles: parse_json(&row.get::<_, String>("roles")?)?,
        action: action.parse()?,
        model: row.get("model")?,
        entity_id: row.get("entity_id")?,
        storage_type: serde_json::from_value(Value::String(storage_type))?,
        provider: row.get("provider")?,
        success: row.get("success")?,
        before: before.as_deref().map(parse_json).transpose()?,
        after: after.as_deref().map(parse_json).transpose()?,
        changed_fields: parse_json(&row.get::<_, String>("changed_fields")?)?,
        trace_id: row.get("trace_id")?,
        request_id: row.get("request_id")?,
        ip_address: row.get("ip_address")?,
        user_agent: row.get("user_agent")?,
        error: row.get("error")?,
        hash: row.get("hash")?,
        previous_hash: row.get("previous_hash")?,
    })
}

impl AuditStore for SqliteAuditStore {
    fn last_hash(&self, tenant_id: Option<&str>) -> Result<Option<String>> {
        let conn = self.pool.get()?;
        let hash = conn
            .query_row(
                &format!(
                    "SELECT hash FROM {} WHERE tenant_id IS ?1 ORDER BY seq DESC LIMIT 1",
                    AUDIT_TABLE
                ),
                params![tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    fn compare_and_append(&self, record: &AuditRecord) -> Result<bool> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let tail: Option<String> = tx
            .query_row(
                &format!(
                    "SELECT hash FROM {} WHERE tenant_id IS ?1 ORDER BY seq DESC LIMIT 1",
                    AUDIT_TABLE
                ),
                params![record.tenant_id],
                |row| row.get(0),
            )
            .optional()?;
        if tail != record.previous_hash {
            return Ok(false);
        }

        tx.execute(
            &format!(
                "INSERT INTO {} (audit_id, timestamp, tenant_id, actor_id, roles, action, model, entity_id, \
                 storage_type, provider, success, before, after, changed_fields, trace_id, request_id, \
                 ip_address, user_agent, error, hash, previous_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)",
                AUDIT_TABLE
            ),
            params![
                record.audit_id,
                record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
                record.tenant_id,
                record.actor_id,
                json_text(&record.roles)?,
                record.action.as_str(),
                record.model,
                record.entity_id,
                record.storage_type.to_string(),
                record.provider,
                record.success,
                record.before.as_ref().map(json_text).transpose()?,
                record.after.as_ref().map(json_text).transpose()?,
                json_text(&record.changed_fields)?,
                record.trace_id,
                record.request_id,
                record.ip_address,
                record.user_agent,
                record.error,
                record.hash,
                record.previous_hash,
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn records_for_tenant(&self, tenant_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        self.select("tenant_id IS ?1", &[&tenant_id as &dyn rusqlite::ToSql])
    }

    fn history(&self, tenant_id: Option<&str>, model: &str, entity_id: &str) -> Result<Vec<AuditRecord>> {
        self.select(
            "tenant_id IS ?1 AND model = ?2 AND entity_id = ?3",
            &[&tenant_id as &dyn rusqlite::ToSql, &model, &entity_id],
        )
    }
}

/// Process-local ledger, for tests and embedded use
#[derive(Default)]
pub struct MemoryAuditStore {
    records: Mutex<Vec<AuditRecord>>,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write a record without any chain check.
    pub fn push_unchecked(&self, record: AuditRecord) {
        self.records.lock().push(record);
    }
}

impl AuditStore for MemoryAuditStore {
    fn last_hash(&self, tenant_id: Option<&str>) -> Result<Option<String>> {
        Ok(self
            .records
            .lock()
            .iter()
            .rev()
            .find(|r| r.tenant_id.as_deref() == tenant_id)
            .map(|r| r.hash.clone()))
    }

    fn compare_and_append(&self, record: &AuditRecord) -> Result<bool> {
        let mut records = self.records.lock();
        let tail = records
            .iter()
            .rev()
            .find(|r| r.tenant_id == record.tenant_id)
            .map(|r| r.hash.as_str());
        if tail != record.previous_hash.as_deref() {
            return Ok(false);
        }
        records.push(record.clone());
        Ok(true)
    }

    fn records_for_tenant(&self, tenant_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|r| r.tenant_id.as_deref() == tenant_id)
            .cloned()
            .collect())
    }

    fn history(&self, tenant_id: Option<&str>, model: &str, entity_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records_for_tenant(tenant_id)?
            .into_iter()
            .filter(|r| r.model == model && r.entity_id.as_deref() == Some(entity_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::audit::record::AuditAction;
    use crate::engine::context::RequestContext;
    use crate::engine::model::StorageKind;
    use serde_json::json;

    fn sealed(tenant: &str, prev: Option<String>) -> AuditRecord {
        let ctx = RequestContext::for_tenant(tenant, "u1");
        let mut r = AuditRecord::new(AuditAction::Create, "User", StorageKind::Relational, "sqlite", &ctx)
            .with_entity(Some("e1".into()))
            .with_snapshots(None, Some(json!({"id": "e1"})));
        r.seal(prev).unwrap();
        r
    }

    #[test]
    fn test_sqlite_roundtrip_and_cas() {
        let driver = SqliteDriver::in_memory().unwrap();
        let store = SqliteAuditStore::new(&driver).unwrap();
        assert!(store.last_hash(Some("t1")).unwrap().is_none());

        let first = sealed("t1", None);
        assert!(store.compare_and_append(&first).unwrap());
        assert!(!store.compare_and_append(&sealed("t1", None)).unwrap());

        let second = sealed("t1", Some(first.hash.clone()));
        assert!(store.compare_and_append(&second).unwrap());
        assert_eq!(store.last_hash(Some("t1")).unwrap(), Some(second.hash.clone()));

        let loaded = store.records_for_tenant(Some("t1")).unwrap();
        assert_eq!(loaded, vec![first.clone(), second]);
        assert_eq!(loaded[0].compute_hash().unwrap(), first.hash);
        assert_eq!(store.history(Some("t1"), "User", "e1").unwrap().len(), 2);
        assert!(store.records_for_tenant(Some("t2")).unwrap().is_empty());
    }

    #[test]
    fn test_sqlite_null_tenant_chain() {
        let driver = SqliteDriver::in_memory().unwrap();
        let store = SqliteAuditStore::new(&driver).unwrap();
        let mut r = AuditRecord::new(AuditAction::Read, "User", StorageKind::Keyvalue, "memory", &RequestContext::new());
        r.seal(None).unwrap();
        assert!(store.compare_and_append(&r).unwrap());
        assert_eq!(store.last_hash(None).unwrap(), Some(r.hash.clone()));
        assert_eq!(store.records_for_tenant(None).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_store_cas() {
        let store = MemoryAuditStore::new();
        let first = sealed("t1", None);
        assert!(store.compare_and_append(&first).unwrap());
        assert!(!store.compare_and_append(&sealed("t1", None)).unwrap());
        assert!(store.compare_and_append(&sealed("t2", None)).unwrap());
        assert_eq!(store.len(), 2);
    }
}
