// Polystore Engine - Core module structure
pub mod adapter;
pub mod audit;
pub mod cache;
pub mod canonical;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod overflow;
pub mod query;
pub mod retry;
pub mod security;

pub use audit::{AuditAction, AuditLedger, AuditRecord};
pub use canonical::Record;
pub use config::EngineConfig;
pub use context::RequestContext;
pub use error::{EngineError, Result};
pub use model::{ModelMeta, ModelRegistry, StorageKind};
pub use orchestrator::{
    BatchFailure, BatchOptions, BatchResult, DataEngine, DataEngineBuilder, DeleteOptions, DeleteOutcome, Lookup,
    ReadOptions, UpdateOptions,
};
pub use query::{Operator, QueryBuilder, QueryOutput};
