//! In-memory key-value and object stores
//!
//! Process-local backends for tests and embedded use. Entries are kept in
//! ordered maps so scans come back in (partition, row) key order.

use parking_lot::RwLock;
use std::collections::BTreeMap;

use super::{KvAdapter, KvEntry, ObjectStore, StoredRef, DEFAULT_MAX_RECORD_BYTES};
use crate::engine::canonical::Record;
use crate::engine::error::{EngineError, Result};

type Partition = BTreeMap<(String, String), (Record, u64)>;

pub struct MemoryKvStore {
    name: String,
    max_record_bytes: usize,
    models: RwLock<BTreeMap<String, Partition>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_MAX_RECORD_BYTES)
    }

    /// Store with a custom inline size limit
    pub fn with_limit(max_record_bytes: usize) -> Self {
        Self {
            name: "memory".to_string(),
            max_record_bytes,
            models: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of entries stored for a model
    pub fn len(&self, model: &str) -> usize {
        self.models.read().get(model).map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self, model: &str) -> bool {
        self.len(model) == 0
    }
}

impl Default for MemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvAdapter for MemoryKvStore {
    fn provider(&self) -> &str {
        &self.name
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    fn put_raw(&self, model: &str, partition_key: &str, row_key: &str, data: &Record) -> Result<StoredRef> {
        let mut models = self.models.write();
        let partition = models.entry(model.to_string()).or_default();
        let key = (partition_key.to_string(), row_key.to_string());
        let version = partition.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
        partition.insert(key, (data.clone(), version));

        Ok(StoredRef {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            etag: Some(version.to_string()),
        })
    }

    fn get_raw(&self, model: &str, partition_key: &str, row_key: &str) -> Result<Option<Record>> {
        let models = self.models.read();
        Ok(models
            .get(model)
            .and_then(|p| p.get(&(partition_key.to_string(), row_key.to_string())))
            .map(|(data, _)| data.clone()))
    }

    fn query_raw(&self, model: &str, filters: &Record, limit: Option<usize>) -> Result<Vec<KvEntry>> {
        let models = self.models.read();
        let Some(partition) = models.get(model) else {
            return Ok(Vec::new());
        };

        let matching = partition
            .iter()
            .filter(|(_, (data, _))| filters.iter().all(|(k, v)| data.get(k) == Some(v)))
            .map(|((pk, rk), (data, _))| KvEntry {
                partition_key: pk.clone(),
                row_key: rk.clone(),
                data: data.clone(),
            });

        Ok(match limit {
            Some(n) => matching.take(n).collect(),
            None => matching.collect(),
        })
    }

    fn delete_raw(&self, model: &str, partition_key: &str, row_key: &str, etag: Option<&str>) -> Result<bool> {
        let mut models = self.models.write();
        let Some(partition) = models.get_mut(model) else {
            return Ok(false);
        };
        let key = (partition_key.to_string(), row_key.to_string());

        if let (Some(expected), Some((_, version))) = (etag, partition.get(&key)) {
            if expected != version.to_string() {
                return Err(EngineError::Validation(format!(
                    "etag mismatch for {}/{}/{}",
                    model, partition_key, row_key
                )));
            }
        }
        Ok(partition.remove(&key).is_some())
    }
}

#[derive(Default)]
pub struct MemoryObjectStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        self.blobs.write().insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.blobs.write().remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rec(v: serde_json::Value) -> Record {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_kv_roundtrip() {
        let store = MemoryKvStore::new();
        let r = store.put_raw("users", "p1", "r1", &rec(json!({"name": "Ann"}))).unwrap();
        assert_eq!(r.etag.as_deref(), Some("1"));
        let r = store.put_raw("users", "p1", "r1", &rec(json!({"name": "Anne"}))).unwrap();
        assert_eq!(r.etag.as_deref(), Some("2"));

        let got = store.get_raw("users", "p1", "r1").unwrap().unwrap();
        assert_eq!(got["name"], "Anne");
        assert!(store.get_raw("users", "p1", "missing").unwrap().is_none());
        assert!(store.get_raw("other", "p1", "r1").unwrap().is_none());
    }

    #[test]
    fn test_kv_query_and_delete() {
        let store = MemoryKvStore::new();
        store.put_raw("m", "a", "1", &rec(json!({"k": 1}))).unwrap();
        store.put_raw("m", "a", "2", &rec(json!({"k": 2}))).unwrap();
        store.put_raw("m", "b", "1", &rec(json!({"k": 1}))).unwrap();

        assert_eq!(store.query_raw("m", &Record::new(), None).unwrap().len(), 3);
        assert_eq!(store.query_raw("m", &rec(json!({"k": 1})), None).unwrap().len(), 2);
        assert_eq!(store.query_raw("m", &Record::new(), Some(1)).unwrap().len(), 1);

        assert!(store.delete_raw("m", "a", "2", Some("9")).is_err());
        assert!(store.delete_raw("m", "a", "2", Some("1")).unwrap());
        assert!(!store.delete_raw("m", "a", "2", None).unwrap());
        assert_eq!(store.len("m"), 2);
    }

    #[test]
    fn test_object_store() {
        let store = MemoryObjectStore::new();
        store.put("overflow/a.json", b"{}").unwrap();
        store.put("other/b.json", b"[]").unwrap();
        assert_eq!(store.get("overflow/a.json").unwrap().unwrap(), b"{}".to_vec());
        assert_eq!(store.list("overflow/").unwrap(), vec!["overflow/a.json".to_string()]);
        assert!(store.delete("overflow/a.json").unwrap());
        assert!(store.get("overflow/a.json").unwrap().is_none());
    }
}
