//! Canonical serialization and identifier checks
//!
//! Every digest in the engine (overflow checksums, audit hashes, cache keys,
//! content-hash keys) is computed over the same canonical form: JSON with
//! object keys sorted at every depth and no insignificant whitespace.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use super::error::{EngineError, Result};

/// A schemaless record as it flows through the engine.
pub type Record = Map<String, Value>;

/// Longest identifier accepted for tables, collections and columns.
pub const MAX_IDENTIFIER_LEN: usize = 128;

/// Rebuild a value so that every object has its keys in sorted order.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical byte serialization of a value.
pub fn canonical_bytes(value: &Value) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&canonicalize(value))?)
}

/// Canonical byte serialization of a record.
pub fn canonical_record_bytes(record: &Record) -> Result<Vec<u8>> {
    canonical_bytes(&Value::Object(record.clone()))
}

/// Lowercase hex SHA-256 of raw bytes.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content digest of a value's canonical form.
pub fn content_digest(value: &Value) -> Result<String> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Validate a table, collection or column name before it is interpolated
/// into SQL text. Only ASCII letters, digits and underscore are accepted.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(EngineError::Validation("identifier cannot be empty".into()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(EngineError::Validation(format!(
            "identifier '{}' exceeds {} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::Validation(format!(
            "identifier '{}' may only contain letters, digits and underscores",
            name
        )));
    }
    Ok(())
}

/// Validate a dotted name such as `schema.table`, checking each segment.
pub fn validate_qualified_identifier(name: &str) -> Result<()> {
    for segment in name.split('.') {
        validate_identifier(segment)?;
    }
    Ok(())
}
