//! SQL Dialects
//!
//! Placeholder style and identifier quoting for the relational backends the
//! SQL translation targets.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    Sqlite,
    Postgres,
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Sqlite => write!(f, "sqlite"),
            SqlDialect::Postgres => write!(f, "postgres"),
        }
    }
}

impl SqlDialect {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "sqlite" | "sqlite3" => Some(SqlDialect::Sqlite),
            "postgres" | "postgresql" | "pg" => Some(SqlDialect::Postgres),
            _ => None,
        }
    }

    /// Positional placeholder for the 1-based parameter `index`.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            SqlDialect::Sqlite => format!("?{}", index),
            SqlDialect::Postgres => format!("${}", index),
        }
    }

    /// Quote an identifier that already passed validation. Dotted names are
    /// quoted per segment.
    pub fn quote_ident(&self, name: &str) -> String {
        name.split('.')
            .map(|segment| format!("\"{}\"", segment.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(".")
    }
}
