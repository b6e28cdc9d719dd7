//! Audit Module
//!
//! Tamper-evident, hash-chained audit trail of engine operations.

pub mod ledger;
pub mod record;
pub mod store;

pub use ledger::AuditLedger;
pub use record::{changed_fields, AuditAction, AuditRecord};
pub use store::{AuditStore, MemoryAuditStore, SqliteAuditStore, AUDIT_TABLE};
