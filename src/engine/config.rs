//! Polystore Configuration Module
//! Handles loading and validating polystore.config.json

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::adapter::DEFAULT_MAX_RECORD_BYTES;
use super::error::EngineError;
use super::model::ModelMeta;
use super::retry::RetryPolicy;

pub const CONFIG_FILE: &str = "polystore.config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

impl From<ConfigError> for EngineError {
    fn from(e: ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub sqlite: SqliteConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub overflow: OverflowConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default)]
    pub models: Vec<ModelMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvConfig {
    /// Directory for the filesystem store; in-memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_max_record_bytes")]
    pub max_record_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverflowConfig {
    #[serde(default = "default_overflow_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cache_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub audit_reads: bool,
    /// Ledger database; the main SQLite database when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_true")]
    pub soft_delete: bool,
    /// Stamp created_at/created_by/updated_at/updated_by on writes
    #[serde(default = "default_true")]
    pub stamp_fields: bool,
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_slow_query_ms")]
    pub slow_query_ms: u64,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./data/polystore.db")
}

fn default_pool_size() -> u32 {
    8
}

fn default_max_record_bytes() -> usize {
    DEFAULT_MAX_RECORD_BYTES
}

fn default_overflow_root() -> PathBuf {
    PathBuf::from("./data/blobs")
}

fn default_true() -> bool {
    true
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_cache_prefix() -> String {
    "polydb:".to_string()
}

fn default_provider() -> String {
    "sqlite".to_string()
}

fn default_slow_query_ms() -> u64 {
    super::metrics::DEFAULT_SLOW_QUERY_MS
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            pool_size: default_pool_size(),
        }
    }
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_record_bytes: default_max_record_bytes(),
        }
    }
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            root: default_overflow_root(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_secs: default_cache_ttl(),
            prefix: default_cache_prefix(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audit_reads: false,
            path: None,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            soft_delete: true,
            stamp_fields: true,
            provider: default_provider(),
            slow_query_ms: default_slow_query_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            sqlite: SqliteConfig::default(),
            kv: KvConfig::default(),
            overflow: OverflowConfig::default(),
            cache: CacheConfig::default(),
            retry: RetryPolicy::default(),
            audit: AuditConfig::default(),
            engine: EngineSettings::default(),
            models: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = project_dir.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(ConfigError::NotFound(config_path));
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: EngineConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(project_dir)?;
        let config_path = project_dir.join(CONFIG_FILE);
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(project_dir: &Path, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            project_dir.join(path)
        }
    }

    /// Where the audit ledger lives
    pub fn audit_db_path(&self, project_dir: &Path) -> PathBuf {
        Self::resolve(project_dir, self.audit.path.as_deref().unwrap_or(&self.sqlite.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        assert!(matches!(EngineConfig::load(dir.path()), Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::default();
        config.models.push(ModelMeta::relational("User", "users").with_cache(Some(60)));
        config.save(dir.path()).unwrap();

        let loaded = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.models.len(), 1);
        assert_eq!(loaded.cache.prefix, "polydb:");
        assert_eq!(loaded.retry, RetryPolicy::default());
    }

    #[test]
    fn test_sparse_file_gets_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), r#"{"cache": {"enabled": false}}"#).unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.default_ttl_secs, 300);
        assert_eq!(config.kv.max_record_bytes, DEFAULT_MAX_RECORD_BYTES);
        assert!(config.engine.soft_delete);
        assert_eq!(config.audit_db_path(dir.path()), dir.path().join("./data/polystore.db"));
    }
}
