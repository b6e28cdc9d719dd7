//! End-to-end behaviour of the data engine over real storage: soft delete,
//! paging and result caching.

use polystore::engine::adapter::{KvAdapter, KvEntry, MemoryKvStore, MemoryObjectStore, SqliteDriver, StoredRef};
use polystore::engine::cache::MemoryCache;
use polystore::{
    DataEngine, DeleteOptions, DeleteOutcome, EngineError, Lookup, ModelMeta, QueryBuilder, ReadOptions, Record,
    RequestContext, Result,
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TASKS_DDL: &str = "CREATE TABLE tasks (
    id TEXT PRIMARY KEY, tenant_id TEXT, title TEXT, rank INTEGER,
    created_at TEXT, created_by TEXT, updated_at TEXT, updated_by TEXT,
    deleted_at TEXT, deleted_by TEXT
);";

fn record(v: serde_json::Value) -> Record {
    v.as_object().cloned().unwrap_or_default()
}

fn relational_engine(dir: &std::path::Path) -> std::result::Result<DataEngine, Box<dyn std::error::Error>> {
    let driver = SqliteDriver::new(&dir.join("data.db"), 2)?;
    driver.execute_batch(TASKS_DDL)?;
    let engine = DataEngine::builder().relational(Arc::new(driver)).build();
    engine.register_model(ModelMeta::relational("Task", "tasks"))?;
    Ok(engine)
}

#[test]
fn test_soft_delete_hides_rows() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let engine = relational_engine(dir.path())?;
    let ctx = RequestContext::for_tenant("t1", "alice");

    engine.create("Task", record(json!({ "id": "k1", "title": "write", "rank": 1 })), &ctx)?;
    engine.create("Task", record(json!({ "id": "k2", "title": "test", "rank": 2 })), &ctx)?;

    let outcome = engine.delete("Task", "k1", &DeleteOptions::default(), &ctx)?;
    assert_eq!(outcome, DeleteOutcome::SoftDeleted(1));

    let visible = engine.read("Task", QueryBuilder::new(), &ReadOptions::new(), &ctx)?;
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0]["id"], "k2");

    let all = engine.read("Task", QueryBuilder::new(), &ReadOptions::new().include_deleted(), &ctx)?;
    assert_eq!(all.len(), 2);
    let deleted = all.iter().find(|r| r["id"] == "k1").ok_or("k1 missing")?;
    assert_eq!(deleted["deleted_by"], "alice");
    assert!(deleted["deleted_at"].is_string());

    // A soft-deleted row is no longer a target for a second soft delete.
    assert_eq!(engine.delete("Task", "k1", &DeleteOptions::default(), &ctx)?, DeleteOutcome::NotFound);
    assert_eq!(engine.delete("Task", "k1", &DeleteOptions::hard(), &ctx)?, DeleteOutcome::Deleted(1));
    Ok(())
}

#[test]
fn test_paging_visits_every_row_once() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let engine = relational_engine(dir.path())?;
    let ctx = RequestContext::for_tenant("t1", "alice");
    for i in 0..7 {
        engine.create("Task", record(json!({ "id": format!("k{}", i), "title": "t", "rank": i })), &ctx)?;
    }
    // Another tenant's rows must not leak into the pages.
    let other = RequestContext::for_tenant("t2", "bob");
    engine.create("Task", record(json!({ "id": "x1", "title": "t", "rank": 100 })), &other)?;

    let query = QueryBuilder::new().order_by("rank", false);
    let mut seen = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0;
    loop {
        let page = engine.read_page("Task", query.clone(), 3, token.as_deref(), &ReadOptions::new(), &ctx)?;
        pages += 1;
        seen.extend(page.rows.iter().map(|r| r["rank"].as_i64().unwrap_or(-1)));
        match page.continuation_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    assert_eq!(pages, 3);
    assert_eq!(seen, (0..7).collect::<Vec<i64>>());
    Ok(())
}

#[test]
fn test_out_of_range_page_token_is_rejected() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let driver = SqliteDriver::new(&dir.path().join("data.db"), 2)?;
    driver.execute_batch(TASKS_DDL)?;
    let engine = DataEngine::builder()
        .relational(Arc::new(driver))
        .keyvalue(Arc::new(MemoryKvStore::new()), Arc::new(MemoryObjectStore::new()))
        .build();
    engine.register_model(ModelMeta::relational("Task", "tasks"))?;
    engine.register_model(ModelMeta::keyvalue("Item", "items"))?;
    let ctx = RequestContext::for_tenant("t1", "alice");
    engine.create("Task", record(json!({ "id": "k1", "title": "t", "rank": 1 })), &ctx)?;
    engine.create("Item", record(json!({ "id": "i1" })), &ctx)?;

    for model in ["Task", "Item"] {
        for token in ["18446744073709551615", "9223372036854775807", "-1"] {
            let err = engine
                .read_page(model, QueryBuilder::new().skip(5), 2, Some(token), &ReadOptions::new(), &ctx)
                .err()
                .ok_or("out of range token accepted")?;
            assert!(matches!(err, EngineError::Validation(_)), "{} {}: {:?}", model, token, err);
        }
    }
    Ok(())
}

/// Counts scans that reach the underlying store.
struct CountingKv {
    inner: MemoryKvStore,
    scans: AtomicUsize,
}

impl KvAdapter for CountingKv {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn put_raw(&self, model: &str, partition_key: &str, row_key: &str, data: &Record) -> Result<StoredRef> {
        self.inner.put_raw(model, partition_key, row_key, data)
    }

    fn get_raw(&self, model: &str, partition_key: &str, row_key: &str) -> Result<Option<Record>> {
        self.inner.get_raw(model, partition_key, row_key)
    }

    fn query_raw(&self, model: &str, filters: &Record, limit: Option<usize>) -> Result<Vec<KvEntry>> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        self.inner.query_raw(model, filters, limit)
    }

    fn delete_raw(&self, model: &str, partition_key: &str, row_key: &str, etag: Option<&str>) -> Result<bool> {
        self.inner.delete_raw(model, partition_key, row_key, etag)
    }
}

#[test]
fn test_cached_read_skips_storage() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let kv = Arc::new(CountingKv {
        inner: MemoryKvStore::new(),
        scans: AtomicUsize::new(0),
    });
    let engine = DataEngine::builder()
        .keyvalue(kv.clone(), Arc::new(MemoryObjectStore::new()))
        .cache(Arc::new(MemoryCache::new()), "polydb:", Duration::from_secs(60))
        .build();
    engine.register_model(ModelMeta::keyvalue("Setting", "settings").with_cache(Some(60)))?;
    let ctx = RequestContext::for_tenant("t1", "alice");
    engine.create("Setting", record(json!({ "id": "theme", "value": "dark" })), &ctx)?;

    let query = QueryBuilder::new().eq("id", "theme");
    let first = engine.read("Setting", query.clone(), &ReadOptions::new(), &ctx)?;
    let after_first = kv.scans.load(Ordering::SeqCst);
    let second = engine.read("Setting", query.clone(), &ReadOptions::new(), &ctx)?;
    assert_eq!(first, second);
    assert_eq!(kv.scans.load(Ordering::SeqCst), after_first);

    // Bypassing the cache reaches storage again.
    engine.read("Setting", query.clone(), &ReadOptions::new().no_cache(), &ctx)?;
    assert_eq!(kv.scans.load(Ordering::SeqCst), after_first + 1);

    // A write invalidates the model, so the next read sees the new value.
    engine.update("Setting", "theme", record(json!({ "value": "light" })), &Default::default(), &ctx)?;
    let third = engine.read("Setting", query, &ReadOptions::new(), &ctx)?;
    assert_eq!(third[0]["value"], "light");

    // Other tenants never share a cache entry.
    let other = RequestContext::for_tenant("t2", "bob");
    assert!(engine.read("Setting", QueryBuilder::new().eq("id", "theme"), &ReadOptions::new(), &other)?.is_empty());
    Ok(())
}

/// Accepts a fixed number of writes, then fails every later one.
struct FailingKv {
    inner: MemoryKvStore,
    writes_left: AtomicUsize,
}

impl KvAdapter for FailingKv {
    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn put_raw(&self, model: &str, partition_key: &str, row_key: &str, data: &Record) -> Result<StoredRef> {
        let allowed = self
            .writes_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !allowed {
            return Err(EngineError::Connection("store went away".into()));
        }
        self.inner.put_raw(model, partition_key, row_key, data)
    }

    fn get_raw(&self, model: &str, partition_key: &str, row_key: &str) -> Result<Option<Record>> {
        self.inner.get_raw(model, partition_key, row_key)
    }

    fn query_raw(&self, model: &str, filters: &Record, limit: Option<usize>) -> Result<Vec<KvEntry>> {
        self.inner.query_raw(model, filters, limit)
    }

    fn delete_raw(&self, model: &str, partition_key: &str, row_key: &str, etag: Option<&str>) -> Result<bool> {
        self.inner.delete_raw(model, partition_key, row_key, etag)
    }
}

#[test]
fn test_partial_write_failure_drops_cached_reads() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let kv = Arc::new(FailingKv {
        inner: MemoryKvStore::new(),
        writes_left: AtomicUsize::new(3),
    });
    let engine = DataEngine::builder()
        .keyvalue(kv.clone(), Arc::new(MemoryObjectStore::new()))
        .cache(Arc::new(MemoryCache::new()), "polydb:", Duration::from_secs(60))
        .build();
    engine.register_model(ModelMeta::keyvalue("Setting", "settings").with_cache(Some(60)))?;
    let ctx = RequestContext::for_tenant("t1", "alice");
    engine.create("Setting", record(json!({ "id": "a", "group": "ui", "value": "old" })), &ctx)?;
    engine.create("Setting", record(json!({ "id": "b", "group": "ui", "value": "old" })), &ctx)?;

    let cached = engine.read("Setting", QueryBuilder::new(), &ReadOptions::new(), &ctx)?;
    assert!(cached.iter().all(|r| r["value"] == "old"));

    // The first row is rewritten, the second write fails.
    let lookup = Lookup::from(record(json!({ "group": "ui" })));
    let err = engine
        .update("Setting", lookup, record(json!({ "value": "new" })), &Default::default(), &ctx)
        .err()
        .ok_or("update should fail on its second write")?;
    assert!(matches!(err, EngineError::Connection(_)));

    let rows = engine.read("Setting", QueryBuilder::new(), &ReadOptions::new(), &ctx)?;
    assert_eq!(rows.iter().filter(|r| r["value"] == "new").count(), 1);
    Ok(())
}
