//! SQLite Driver
//!
//! Implements [`RelationalDriver`] for SQLite using rusqlite + r2d2 connection
//! pooling. Connections are returned to the pool at the end of each call.

use base64::Engine as _;
use parking_lot::RwLock;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::{json, Value};
use std::borrow::Cow;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::dialect::SqlDialect;
use super::{Page, RelationalDriver};
use crate::engine::canonical::Record;
use crate::engine::error::{EngineError, Result};
use crate::engine::query::{QueryBuilder, QueryFilter, QueryOutput, SqlStatement, SqlTranslator};

pub(crate) type DbPool = Pool<SqliteConnectionManager>;
pub(crate) type DbConn = PooledConnection<SqliteConnectionManager>;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Declared column kinds of one table, by column name
type ColumnKinds = HashMap<String, ColumnKind>;

pub struct SqliteDriver {
    pool: DbPool,
    db_path: PathBuf,
    sql: SqlTranslator,
    // Dropped whenever DDL may have run through this driver.
    column_kinds: RwLock<HashMap<String, Arc<ColumnKinds>>>,
}

impl SqliteDriver {
    pub fn new(db_path: &Path, pool_size: u32) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path).with_init(init_connection);
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            sql: SqlTranslator::new(SqlDialect::Sqlite),
            column_kinds: RwLock::new(HashMap::new()),
        })
    }

    /// Private in-memory database. Limited to one pooled connection, since
    /// each SQLite memory connection is its own database.
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(init_connection);
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            db_path: PathBuf::from(":memory:"),
            sql: SqlTranslator::new(SqlDialect::Sqlite),
            column_kinds: RwLock::new(HashMap::new()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Shared handle to the pool, for components that keep their own tables
    /// in the same database.
    pub(crate) fn pool(&self) -> DbPool {
        self.pool.clone()
    }

    pub(crate) fn get_conn(&self) -> Result<DbConn> {
        Ok(self.pool.get()?)
    }

    /// Run several statements at once (DDL, fixtures).
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        self.get_conn()?.execute_batch(sql)?;
        self.column_kinds.write().clear();
        Ok(())
    }

    /// Run a statement against `table`, decoding its BOOLEAN and JSON columns.
    fn run_query(&self, table: &str, stmt: &SqlStatement) -> Result<Vec<Record>> {
        debug!(sql = %stmt.sql, params = stmt.params.len(), "sqlite query");
        let conn = self.get_conn()?;
        let kinds = self.table_kinds(&conn, table)?;
        query_records(&conn, &stmt.sql, &stmt.params, Some(&*kinds))
    }

    /// Column kinds from the table's declared types. RETURNING rows carry no
    /// declared types, so writes need the table schema.
    fn table_kinds(&self, conn: &rusqlite::Connection, table: &str) -> Result<Arc<ColumnKinds>> {
        if let Some(kinds) = self.column_kinds.read().get(table) {
            return Ok(kinds.clone());
        }

        let quote = |ident: &str| format!("\"{}\"", ident.replace('"', "\"\""));
        let pragma = match table.split_once('.') {
            Some((schema, name)) => format!("PRAGMA {}.table_info({})", quote(schema), quote(name)),
            None => format!("PRAGMA table_info({})", quote(table)),
        };
        let mut stmt = conn.prepare(&pragma)?;
        let kinds: ColumnKinds = stmt
            .query_map([], |row| {
                let name: String = row.get(1)?;
                let decl: Option<String> = row.get(2)?;
                Ok((name, ColumnKind::from_decl(decl.as_deref())))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let kinds = Arc::new(kinds);
        self.column_kinds.write().insert(table.to_string(), kinds.clone());
        Ok(kinds)
    }

    /// Serialize values bound for JSON columns as JSON text, so strings come
    /// back as strings.
    fn encode_json_columns<'r>(&self, table: &str, record: &'r Record) -> Result<Cow<'r, Record>> {
        let kinds = self.table_kinds(&*self.get_conn()?, table)?;
        let needs_encoding = record
            .iter()
            .any(|(k, v)| kinds.get(k) == Some(&ColumnKind::Json) && !v.is_null());
        if !needs_encoding {
            return Ok(Cow::Borrowed(record));
        }

        let mut encoded = record.clone();
        for (field, value) in encoded.iter_mut() {
            if kinds.get(field) == Some(&ColumnKind::Json) && !value.is_null() {
                *value = Value::String(value.to_string());
            }
        }
        Ok(Cow::Owned(encoded))
    }
}

/// How a stored column maps back to JSON
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ColumnKind {
    Plain,
    Bool,
    Json,
}

impl ColumnKind {
    fn from_decl(decl: Option<&str>) -> Self {
        match decl.map(|d| d.trim().to_ascii_uppercase()).as_deref() {
            Some("BOOLEAN") | Some("BOOL") => ColumnKind::Bool,
            Some("JSON") | Some("JSONB") => ColumnKind::Json,
            _ => ColumnKind::Plain,
        }
    }

    fn decode(self, value: Value) -> Value {
        match self {
            ColumnKind::Bool => match value.as_i64() {
                Some(0) => Value::Bool(false),
                Some(1) => Value::Bool(true),
                _ => value,
            },
            ColumnKind::Json => match value {
                Value::String(text) => match serde_json::from_str(&text) {
                    Ok(parsed) => parsed,
                    Err(_) => Value::String(text),
                },
                other => other,
            },
            ColumnKind::Plain => value,
        }
    }
}

fn init_connection(conn: &mut rusqlite::Connection) -> rusqlite::Result<()> {
    conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    // LIKE must match the case-sensitive in-memory pattern operators.
    conn.execute_batch("PRAGMA case_sensitive_like = ON; PRAGMA foreign_keys = ON;")
}

/// Convert a JSON value into an owned SQLite value
pub(crate) fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Convert a rusqlite ValueRef to serde_json Value
pub(crate) fn value_ref_to_json(val: ValueRef<'_>) -> Value {
    match val {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => json!(i),
        ValueRef::Real(f) => json!(f),
        ValueRef::Text(t) => json!(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => json!(base64::engine::general_purpose::STANDARD.encode(b)),
    }
}

/// Run a query and collect rows as records. Column kinds come from `known`
/// when it names the column, else from the column's declared type.
pub(crate) fn query_records(
    conn: &rusqlite::Connection,
    sql: &str,
    params: &[Value],
    known: Option<&ColumnKinds>,
) -> Result<Vec<Record>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<(String, ColumnKind)> = stmt
        .columns()
        .iter()
        .map(|c| {
            let name = c.name().to_string();
            let kind = known
                .and_then(|k| k.get(&name).copied())
                .unwrap_or_else(|| ColumnKind::from_decl(c.decl_type()));
            (name, kind)
        })
        .collect();
    let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();

    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Record::new();
        for (i, (name, kind)) in columns.iter().enumerate() {
            record.insert(name.clone(), kind.decode(value_ref_to_json(row.get_ref(i)?)));
        }
        out.push(record);
    }
    Ok(out)
}

impl RelationalDriver for SqliteDriver {
    fn provider(&self) -> &str {
        "sqlite"
    }

    fn insert(&self, table: &str, record: &Record) -> Result<Record> {
        let record = self.encode_json_columns(table, record)?;
        let stmt = self.sql.insert(table, &record)?;
        self.run_query(table, &stmt)?
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::Operation(format!("insert into '{}' returned no row", table)))
    }

    fn select(&self, table: &str, query: &QueryBuilder) -> Result<QueryOutput> {
        let stmt = self.sql.select(table, query)?;
        let rows = self.run_query(table, &stmt)?;

        let ungrouped_count = query.count_only
            && query.group_by.as_ref().map(|g| g.is_empty()).unwrap_or(true);
        if ungrouped_count {
            let count = rows
                .first()
                .and_then(|r| r.get("count"))
                .and_then(Value::as_u64)
                .unwrap_or(0);
            return Ok(QueryOutput::Count(count));
        }
        Ok(QueryOutput::Rows(rows))
    }

    fn select_page(
        &self,
        table: &str,
        query: &QueryBuilder,
        page_size: usize,
        continuation_token: Option<&str>,
    ) -> Result<Page> {
        let offset = Page::parse_token(continuation_token)?;
        let window = Page::window(query, page_size, offset)?;
        let rows = self.select(table, &window)?.rows();
        Ok(Page::from_window(rows, offset, page_size))
    }

    fn update(&self, table: &str, filters: &[QueryFilter], patch: &Record) -> Result<Vec<Record>> {
        let patch = self.encode_json_columns(table, patch)?;
        let stmt = self.sql.update(table, filters, &patch)?;
        self.run_query(table, &stmt)
    }

    fn upsert(&self, table: &str, record: &Record, conflict_key: &str) -> Result<Record> {
        let record = self.encode_json_columns(table, record)?;
        let stmt = self.sql.upsert(table, &record, conflict_key)?;
        let written = self.run_query(table, &stmt)?.into_iter().next();
        match written {
            Some(row) => Ok(row),
            // DO NOTHING on a key-only record returns no row; read it back.
            None => {
                let lookup = QueryBuilder::new()
                    .eq(conflict_key, record.get(conflict_key).cloned().unwrap_or(Value::Null))
                    .take(1);
                self.select(table, &lookup)?
                    .rows()
                    .into_iter()
                    .next()
                    .ok_or_else(|| EngineError::Operation(format!("upsert into '{}' returned no row", table)))
            }
        }
    }

    fn delete(&self, table: &str, filters: &[QueryFilter]) -> Result<Vec<Record>> {
        let stmt = self.sql.delete(table, filters)?;
        self.run_query(table, &stmt)
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        let conn = self.get_conn()?;
        let bound: Vec<SqlValue> = params.iter().map(json_to_sql).collect();
        let affected = conn.execute(sql, rusqlite::params_from_iter(bound.iter()))?;
        self.column_kinds.write().clear();
        Ok(affected)
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Record>> {
        let conn = self.get_conn()?;
        query_records(&conn, sql, params, None)
    }
}
