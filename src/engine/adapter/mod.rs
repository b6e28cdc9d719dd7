//! Storage Adapter Layer
//!
//! The narrow contracts concrete backends implement:
//! - [`KvAdapter`]: raw put/get/query/delete for schemaless partition/row stores
//! - [`ObjectStore`]: byte blobs by key, used for overflow records
//! - [`RelationalDriver`]: parameterized CRUD plus offset paging
//!
//! SQLite, in-memory and filesystem implementations ship with the crate.

pub mod dialect;
pub mod fs;
pub mod memory;
pub mod sqlite;

pub use dialect::SqlDialect;
pub use fs::{FsKvStore, FsObjectStore};
pub use memory::{MemoryKvStore, MemoryObjectStore};
pub use sqlite::SqliteDriver;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::canonical::Record;
use super::error::{EngineError, Result};
use super::query::{QueryBuilder, QueryFilter, QueryOutput};

/// Default record size limit for key-value providers (1 MiB).
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Where a key-value write landed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRef {
    pub partition_key: String,
    pub row_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

/// A raw key-value entry together with its address
#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub partition_key: String,
    pub row_key: String,
    pub data: Record,
}

/// Raw contract for schemaless partition/row stores.
///
/// Adapters see records exactly as the engine stores them, including
/// overflow stubs; they never interpret record contents.
pub trait KvAdapter: Send + Sync {
    /// Provider name recorded in audit entries
    fn provider(&self) -> &str;

    /// Largest serialized record the provider accepts inline
    fn max_record_bytes(&self) -> usize {
        DEFAULT_MAX_RECORD_BYTES
    }

    fn put_raw(&self, model: &str, partition_key: &str, row_key: &str, data: &Record) -> Result<StoredRef>;

    fn get_raw(&self, model: &str, partition_key: &str, row_key: &str) -> Result<Option<Record>>;

    /// Entries whose stored form equals every `(field, value)` in `filters`.
    /// The engine passes an empty filter set and filters hydrated records itself.
    fn query_raw(&self, model: &str, filters: &Record, limit: Option<usize>) -> Result<Vec<KvEntry>>;

    /// Remove an entry. Returns whether anything was deleted.
    fn delete_raw(&self, model: &str, partition_key: &str, row_key: &str, etag: Option<&str>) -> Result<bool>;
}

/// Blob storage contract used for overflow payloads
pub trait ObjectStore: Send + Sync {
    fn put(&self, key: &str, bytes: &[u8]) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn delete(&self, key: &str) -> Result<bool>;

    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Parameterized relational driver contract
pub trait RelationalDriver: Send + Sync {
    fn provider(&self) -> &str;

    fn insert(&self, table: &str, record: &Record) -> Result<Record>;

    fn select(&self, table: &str, query: &QueryBuilder) -> Result<QueryOutput>;

    fn select_page(
        &self,
        table: &str,
        query: &QueryBuilder,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<Page>;

    /// Update matching rows, returning them as written. Empty when nothing matched.
    fn update(&self, table: &str, filters: &[QueryFilter], patch: &Record) -> Result<Vec<Record>>;

    fn upsert(&self, table: &str, record: &Record, conflict_key: &str) -> Result<Record>;

    /// Delete matching rows, returning what was removed.
    fn delete(&self, table: &str, filters: &[QueryFilter]) -> Result<Vec<Record>>;

    /// Run a statement, returning affected rows.
    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize>;

    /// Run a row-returning statement.
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>>;
}

/// One page of a paged read
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub rows: Vec<Record>,
    pub continuation_token: Option<String>,
}

/// Largest row offset a page may start at. Relational drivers bind offsets
/// as signed 64-bit integers.
const MAX_PAGE_OFFSET: usize = i64::MAX as usize;

impl Page {
    /// Parse an offset continuation token. Absent means start at zero.
    pub fn parse_token(token: Option<&str>) -> Result<usize> {
        match token {
            None => Ok(0),
            Some(t) => t
                .parse::<usize>()
                .ok()
                .filter(|offset| *offset <= MAX_PAGE_OFFSET)
                .ok_or_else(|| EngineError::Validation(format!("invalid continuation token '{}'", t))),
        }
    }

    /// The query fetching one page window: `page_size + 1` rows starting
    /// `offset` rows past the query's own skip.
    pub fn window(query: &QueryBuilder, page_size: usize, offset: usize) -> Result<QueryBuilder> {
        let start = query.skip.checked_add(offset).filter(|s| *s <= MAX_PAGE_OFFSET);
        let end = start
            .and_then(|s| s.checked_add(page_size))
            .filter(|e| *e <= MAX_PAGE_OFFSET);
        match (start, end) {
            (Some(start), Some(_)) => {
                let mut window = query.clone().skip(start).take(page_size + 1);
                window.count_only = false;
                Ok(window)
            }
            _ => Err(EngineError::Validation(format!(
                "continuation token {} is out of range",
                offset
            ))),
        }
    }

    /// Build a page from a window fetched with `page_size + 1` rows starting at
    /// `offset`. The extra row only signals that more data exists.
    pub fn from_window(mut rows: Vec<Record>, offset: usize, page_size: usize) -> Self {
        let has_more = rows.len() > page_size;
        rows.truncate(page_size);
        Self {
            rows,
            continuation_token: has_more.then(|| offset.saturating_add(page_size).to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| json!({ "i": i }).as_object().cloned().unwrap())
            .collect()
    }

    #[test]
    fn test_page_window() {
        let page = Page::from_window(rows(4), 0, 3);
        assert_eq!(page.rows.len(), 3);
        assert_eq!(page.continuation_token.as_deref(), Some("3"));

        let last = Page::from_window(rows(2), 3, 3);
        assert_eq!(last.rows.len(), 2);
        assert!(last.continuation_token.is_none());
    }

    #[test]
    fn test_parse_token() {
        assert_eq!(Page::parse_token(None).unwrap(), 0);
        assert_eq!(Page::parse_token(Some("40")).unwrap(), 40);
        assert!(Page::parse_token(Some("abc")).is_err());
        assert!(Page::parse_token(Some("18446744073709551615")).is_err());
    }

    #[test]
    fn test_window_rejects_offsets_past_the_end() {
        let q = QueryBuilder::new().skip(5);
        let window = Page::window(&q, 2, 4).unwrap();
        assert_eq!((window.skip, window.take), (9, Some(3)));

        let near_max = MAX_PAGE_OFFSET - 1;
        let err = Page::window(&q, 2, near_max).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(Page::window(&QueryBuilder::new(), usize::MAX, 0).is_err());
    }
}
