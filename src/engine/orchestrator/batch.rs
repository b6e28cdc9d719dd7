//! Batch Operations
//!
//! Bulk writes built on the single-record operations, so every record still
//! goes through the full pipeline and gets its own audit entry. Failures are
//! collected per record; `fail_fast` stops at the first one.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{DataEngine, DeleteOptions, DeleteOutcome, Lookup, UpdateOptions};
use crate::engine::canonical::Record;
use crate::engine::context::RequestContext;
use crate::engine::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchOptions {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default)]
    pub fail_fast: bool,
}

fn default_chunk_size() -> usize {
    100
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            fail_fast: false,
        }
    }
}

/// One input that could not be processed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchFailure {
    pub data: Value,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchResult<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BatchFailure>,
    pub total: usize,
    pub success_count: usize,
    pub error_count: usize,
}

impl<T> BatchResult<T> {
    pub fn is_complete(&self) -> bool {
        self.error_count == 0 && self.success_count == self.total
    }
}

impl DataEngine {
    pub fn bulk_insert(
        &self,
        model: &str,
        records: Vec<Record>,
        opts: &BatchOptions,
        ctx: &RequestContext,
    ) -> BatchResult<Record> {
        run_batch(
            "bulk_insert",
            records,
            opts,
            |record| Value::Object(record.clone()),
            |record| self.create(model, record, ctx),
        )
    }

    /// Apply each `(lookup, patch)` pair as its own update.
    pub fn bulk_update(
        &self,
        model: &str,
        updates: Vec<(Lookup, Record)>,
        opts: &BatchOptions,
        ctx: &RequestContext,
    ) -> BatchResult<Vec<Record>> {
        run_batch(
            "bulk_update",
            updates,
            opts,
            |(lookup, patch)| json!({ "lookup": lookup.to_value(), "data": patch }),
            |(lookup, patch)| self.update(model, lookup, patch, &UpdateOptions::default(), ctx),
        )
    }

    pub fn bulk_delete(
        &self,
        model: &str,
        lookups: Vec<Lookup>,
        delete: &DeleteOptions,
        opts: &BatchOptions,
        ctx: &RequestContext,
    ) -> BatchResult<DeleteOutcome> {
        run_batch(
            "bulk_delete",
            lookups,
            opts,
            |lookup| json!({ "lookup": lookup.to_value() }),
            |lookup| self.delete(model, lookup, delete, ctx),
        )
    }
}

fn run_batch<I, T>(
    op: &str,
    items: Vec<I>,
    opts: &BatchOptions,
    describe: impl Fn(&I) -> Value,
    mut apply: impl FnMut(I) -> Result<T>,
) -> BatchResult<T> {
    let total = items.len();
    let chunk_size = opts.chunk_size.max(1);
    let mut succeeded = Vec::with_capacity(total);
    let mut failed = Vec::new();

    let mut items = items.into_iter().peekable();
    let mut chunk_index = 0;
    'chunks: while items.peek().is_some() {
        let chunk: Vec<I> = items.by_ref().take(chunk_size).collect();
        debug!(op, chunk = chunk_index, size = chunk.len(), "processing batch chunk");
        for item in chunk {
            let data = describe(&item);
            match apply(item) {
                Ok(value) => succeeded.push(value),
                Err(e) => {
                    failed.push(BatchFailure {
                        data,
                        error: e.to_string(),
                    });
                    if opts.fail_fast {
                        break 'chunks;
                    }
                }
            }
        }
        chunk_index += 1;
    }

    info!(op, total, succeeded = succeeded.len(), failed = failed.len(), "batch finished");
    BatchResult {
        success_count: succeeded.len(),
        error_count: failed.len(),
        succeeded,
        failed,
        total,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::adapter::{MemoryKvStore, MemoryObjectStore};
    use crate::engine::model::ModelMeta;
    use crate::engine::query::QueryBuilder;
    use crate::engine::ReadOptions;
    use std::sync::Arc;

    fn engine() -> DataEngine {
        let engine = DataEngine::builder()
            .keyvalue(Arc::new(MemoryKvStore::new()), Arc::new(MemoryObjectStore::new()))
            .build();
        engine.register_model(ModelMeta::keyvalue("Item", "items")).unwrap();
        engine
    }

    fn items(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| json!({ "id": format!("i{}", i), "n": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_bulk_insert_in_chunks() {
        let engine = engine();
        let ctx = RequestContext::for_tenant("t1", "alice");
        let opts = BatchOptions {
            chunk_size: 2,
            fail_fast: false,
        };
        let result = engine.bulk_insert("Item", items(5), &opts, &ctx);
        assert!(result.is_complete());
        assert_eq!(result.success_count, 5);

        let rows = engine.read("Item", QueryBuilder::new(), &ReadOptions::new(), &ctx).unwrap();
        assert_eq!(rows.len(), 5);
    }

    #[test]
    fn test_failures_collected_or_fail_fast() {
        let engine = engine();
        let no_tenant = RequestContext::new();

        let result = engine.bulk_insert("Item", items(3), &BatchOptions::default(), &no_tenant);
        assert_eq!((result.success_count, result.error_count, result.total), (0, 3, 3));
        assert_eq!(result.failed[0].data["id"], "i0");

        let opts = BatchOptions {
            chunk_size: 1,
            fail_fast: true,
        };
        let result = engine.bulk_insert("Item", items(3), &opts, &no_tenant);
        assert_eq!(result.error_count, 1);
        assert!(!result.is_complete());
    }

    #[test]
    fn test_bulk_update_and_delete() {
        let engine = engine();
        let ctx = RequestContext::for_tenant("t1", "alice");
        engine.bulk_insert("Item", items(3), &BatchOptions::default(), &ctx);

        let patch = json!({ "done": true }).as_object().cloned().unwrap();
        let updates = vec![
            (Lookup::from("i0"), patch.clone()),
            (Lookup::from("missing"), patch),
        ];
        let result = engine.bulk_update("Item", updates, &BatchOptions::default(), &ctx);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.succeeded[0].len(), 1);
        assert!(result.succeeded[1].is_empty());

        let lookups = vec![Lookup::from("i1"), Lookup::from("i2")];
        let result = engine.bulk_delete("Item", lookups, &DeleteOptions::hard(), &BatchOptions::default(), &ctx);
        assert_eq!(result.succeeded, vec![DeleteOutcome::Deleted(1), DeleteOutcome::Deleted(1)]);

        let rows = engine.read("Item", QueryBuilder::new(), &ReadOptions::new(), &ctx).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["done"], true);
    }
}
