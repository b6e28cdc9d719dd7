//! Audit Ledger
//!
//! Serialized append path and integrity proof for the per-tenant hash chain.

use chrono::{DateTime, SubsecRound, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::record::AuditRecord;
use super::store::AuditStore;
use crate::engine::error::{EngineError, Result};

/// Attempts before an append gives up on a tail that keeps moving
const MAX_APPEND_ATTEMPTS: usize = 5;

pub struct AuditLedger {
    store: Arc<dyn AuditStore>,
    // Serializes read-tail/hash/append within this process; the store's
    // compare-and-append covers other processes. Holds the last timestamp
    // handed out.
    append_lock: Mutex<Option<DateTime<Utc>>>,
}

impl AuditLedger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self {
            store,
            append_lock: Mutex::new(None),
        }
    }

    /// Link the record to its tenant's tail and persist it. The timestamp is
    /// taken here so it never runs backwards along the chain.
    pub fn append(&self, mut record: AuditRecord) -> Result<AuditRecord> {
        let mut last_stamp = self.append_lock.lock();
        let now = Utc::now().trunc_subsecs(6);
        record.timestamp = match *last_stamp {
            Some(last) if last > now => last,
            _ => now,
        };
        *last_stamp = Some(record.timestamp);

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let tail = self.store.last_hash(record.tenant_id.as_deref())?;
            record.seal(tail)?;
            if self.store.compare_and_append(&record)? {
                debug!(
                    tenant = ?record.tenant_id,
                    model = %record.model,
                    action = %record.action,
                    hash = %record.hash,
                    "audit record appended"
                );
                return Ok(record);
            }
            warn!(attempt, tenant = ?record.tenant_id, "audit chain tail moved, retrying append");
        }

        Err(EngineError::Operation(format!(
            "audit chain for tenant {:?} kept changing during append",
            record.tenant_id
        )))
    }

    /// Best-effort append. Failures are logged and never reach the caller.
    pub fn record(&self, record: AuditRecord) {
        let (model, action) = (record.model.clone(), record.action);
        if let Err(e) = self.append(record) {
            error!(model = %model, action = %action, error = %e, "failed to persist audit record");
        }
    }

    /// Walk the tenant chain oldest first. Valid when every record links to
    /// its predecessor's hash and its own hash matches its content. An empty
    /// chain is valid.
    pub fn verify_chain(&self, tenant_id: Option<&str>) -> Result<bool> {
        let mut previous: Option<String> = None;
        for record in self.store.records_for_tenant(tenant_id)? {
            if record.previous_hash != previous {
                warn!(tenant = ?tenant_id, audit_id = %record.audit_id, "audit chain link broken");
                return Ok(false);
            }
            if record.compute_hash()? != record.hash {
                warn!(tenant = ?tenant_id, audit_id = %record.audit_id, "audit record hash mismatch");
                return Ok(false);
            }
            previous = Some(record.hash);
        }
        Ok(true)
    }

    pub fn records(&self, tenant_id: Option<&str>) -> Result<Vec<AuditRecord>> {
        self.store.records_for_tenant(tenant_id)
    }

    /// Audit trail of one entity, oldest first
    pub fn history(&self, tenant_id: Option<&str>, model: &str, entity_id: &str) -> Result<Vec<AuditRecord>> {
        self.store.history(tenant_id, model, entity_id)
    }
}
