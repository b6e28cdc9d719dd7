//! Polystore - unified data access over relational and key-value storage
//! with tenancy, row-level security, field encryption and a hash-chained audit trail

pub mod engine;

pub use engine::{
    DataEngine, DeleteOptions, DeleteOutcome, EngineConfig, EngineError, Lookup, ModelMeta, Operator, QueryBuilder,
    ReadOptions, Record, RequestContext, Result, UpdateOptions,
};
