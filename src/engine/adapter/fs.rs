//! Filesystem key-value and object stores
//!
//! One JSON file per record under `<root>/<model>/<partition>/<row>.json`, and
//! one file per blob under `<root>/<key>`. Partition and row keys are
//! hex-encoded on disk so any key text maps to a safe file name.

use std::fs;
use std::path::{Path, PathBuf};

use super::{KvAdapter, KvEntry, ObjectStore, StoredRef, DEFAULT_MAX_RECORD_BYTES};
use crate::engine::canonical::{sha256_hex, validate_identifier, Record};
use crate::engine::error::{EngineError, Result};

pub struct FsKvStore {
    root: PathBuf,
    max_record_bytes: usize,
}

impl FsKvStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
        })
    }

    pub fn with_limit(mut self, max_record_bytes: usize) -> Self {
        self.max_record_bytes = max_record_bytes;
        self
    }

    fn model_dir(&self, model: &str) -> Result<PathBuf> {
        validate_identifier(model)?;
        Ok(self.root.join(model))
    }

    fn record_path(&self, model: &str, partition_key: &str, row_key: &str) -> Result<PathBuf> {
        Ok(self
            .model_dir(model)?
            .join(hex::encode(partition_key))
            .join(format!("{}.json", hex::encode(row_key))))
    }
}

fn decode_segment(name: &str) -> Option<String> {
    hex::decode(name).ok().and_then(|b| String::from_utf8(b).ok())
}

fn read_record(path: &Path) -> Result<Record> {
    let content = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

impl KvAdapter for FsKvStore {
    fn provider(&self) -> &str {
        "filesystem"
    }

    fn max_record_bytes(&self) -> usize {
        self.max_record_bytes
    }

    fn put_raw(&self, model: &str, partition_key: &str, row_key: &str, data: &Record) -> Result<StoredRef> {
        let path = self.record_path(model, partition_key, row_key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_vec_pretty(data)?;
        fs::write(&path, &content)?;

        Ok(StoredRef {
            partition_key: partition_key.to_string(),
            row_key: row_key.to_string(),
            etag: Some(sha256_hex(&content)),
        })
    }

    fn get_raw(&self, model: &str, partition_key: &str, row_key: &str) -> Result<Option<Record>> {
        let path = self.record_path(model, partition_key, row_key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(read_record(&path)?))
    }

    fn query_raw(&self, model: &str, filters: &Record, limit: Option<usize>) -> Result<Vec<KvEntry>> {
        let dir = self.model_dir(model)?;
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut partitions: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        partitions.sort();

        let mut out = Vec::new();
        for partition_dir in partitions {
            let Some(partition_key) = partition_dir
                .file_name()
                .and_then(|n| decode_segment(&n.to_string_lossy()))
            else {
                continue;
            };

            let mut files: Vec<PathBuf> = fs::read_dir(&partition_dir)?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().map(|e| e == "json").unwrap_or(false))
                .collect();
            files.sort();

            for file in files {
                let Some(row_key) = file
                    .file_stem()
                    .and_then(|n| decode_segment(&n.to_string_lossy()))
                else {
                    continue;
                };
                let data = read_record(&file)?;
                if !filters.iter().all(|(k, v)| data.get(k) == Some(v)) {
                    continue;
                }
                out.push(KvEntry {
                    partition_key: partition_key.clone(),
                    row_key,
                    data,
                });
                if limit.map(|n| out.len() >= n).unwrap_or(false) {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }

    fn delete_raw(&self, model: &str, partition_key: &str, row_key: &str, etag: Option<&str>) -> Result<bool> {
        let path = self.record_path(model, partition_key, row_key)?;
        if !path.exists() {
            return Ok(false);
        }
        if let Some(expected) = etag {
            let current = sha256_hex(&fs::read(&path)?);
            if current != expected {
                return Err(EngineError::Validation(format!(
                    "etag mismatch for {}/{}/{}",
                    model, partition_key, row_key
                )));
            }
        }
        fs::remove_file(&path)?;
        Ok(true)
    }
}

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn open(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Map a slash-separated key onto a path below the root.
    fn blob_path(&self, key: &str) -> Result<PathBuf> {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." || segment.contains('\\') {
                return Err(EngineError::Validation(format!("invalid object key '{}'", key)));
            }
            path.push(segment);
        }
        Ok(path)
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, out: &mut Vec<String>) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_dir() {
                self.collect_keys(&path, prefix, out)?;
            } else if let Ok(rel) = path.strip_prefix(&self.root) {
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    out.push(key);
                }
            }
        }
        Ok(())
    }
}

impl ObjectStore for FsObjectStore {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.blob_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.blob_path(key)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let path = self.blob_path(key)?;
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        Ok(true)
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}
