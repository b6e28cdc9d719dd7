//! Query Representation
//!
//! A declarative filter/order/paginate/project query with two translations:
//! parameterized SQL text ([`sql`]) and an in-memory pipeline for schemaless
//! stores ([`pipeline`]). Both must agree on the rows a query selects.

pub mod pipeline;
pub mod sql;

pub use pipeline::{execute, QueryOutput};
pub use sql::{SqlStatement, SqlTranslator};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

use super::canonical::Record;
use super::error::{EngineError, Result};

/// Filter operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "EQ",
            Operator::Ne => "NE",
            Operator::Gt => "GT",
            Operator::Gte => "GTE",
            Operator::Lt => "LT",
            Operator::Lte => "LTE",
            Operator::In => "IN",
            Operator::NotIn => "NOT_IN",
            Operator::Contains => "CONTAINS",
            Operator::StartsWith => "STARTS_WITH",
            Operator::EndsWith => "ENDS_WITH",
        };
        write!(f, "{}", s)
    }
}

/// A single filter condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFilter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl QueryFilter {
    pub fn new(field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }

    /// Check if a record matches this filter.
    ///
    /// A missing field behaves like SQL NULL: it equals only a null filter
    /// value and fails every ordering, membership and pattern test.
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(&self.field).unwrap_or(&Value::Null);

        match self.operator {
            Operator::Eq => {
                if self.value.is_null() {
                    actual.is_null()
                } else {
                    !actual.is_null() && values_equal(actual, &self.value)
                }
            }
            Operator::Ne => {
                if self.value.is_null() {
                    !actual.is_null()
                } else {
                    !actual.is_null() && !values_equal(actual, &self.value)
                }
            }
            Operator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Operator::In => {
                !actual.is_null() && value_list(&self.value).iter().any(|v| values_equal(actual, v))
            }
            Operator::NotIn => {
                !actual.is_null() && !value_list(&self.value).iter().any(|v| values_equal(actual, v))
            }
            Operator::Contains => match (text_of(actual), text_of(&self.value)) {
                (Some(s), Some(p)) => s.contains(p.as_str()),
                _ => false,
            },
            Operator::StartsWith => match (text_of(actual), text_of(&self.value)) {
                (Some(s), Some(p)) => s.starts_with(p.as_str()),
                _ => false,
            },
            Operator::EndsWith => match (text_of(actual), text_of(&self.value)) {
                (Some(s), Some(p)) => s.ends_with(p.as_str()),
                _ => false,
            },
        }
    }
}

/// One ORDER BY key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub descending: bool,
}

/// Declarative query: AND-only filters, ordering, pagination, projection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryBuilder {
    #[serde(default)]
    pub filters: Vec<QueryFilter>,
    #[serde(default)]
    pub order_by: Vec<SortKey>,
    #[serde(default)]
    pub skip: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub select: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    #[serde(default)]
    pub distinct: bool,
    #[serde(default)]
    pub count_only: bool,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a filter condition
    pub fn filter(mut self, field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        self.filters.push(QueryFilter::new(field, operator, value));
        self
    }

    /// Shorthand for an equality filter
    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(field, Operator::Eq, value)
    }

    pub fn order_by(mut self, field: &str, descending: bool) -> Self {
        self.order_by.push(SortKey {
            field: field.to_string(),
            descending,
        });
        self
    }

    pub fn skip(mut self, count: usize) -> Self {
        self.skip = count;
        self
    }

    pub fn take(mut self, count: usize) -> Self {
        self.take = Some(count);
        self
    }

    pub fn select(mut self, fields: &[&str]) -> Self {
        self.select = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn group_by(mut self, fields: &[&str]) -> Self {
        self.group_by = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    pub fn count(mut self) -> Self {
        self.count_only = true;
        self
    }

    /// Build an equality query from a lookup record (`{field: value, ...}`).
    pub fn from_lookup(lookup: &Record) -> Self {
        lookup
            .iter()
            .fold(Self::new(), |q, (field, value)| q.eq(field, value.clone()))
    }

    /// Whether any filter already constrains `field` with an equality test.
    pub fn has_equality_on(&self, field: &str) -> bool {
        self.filters
            .iter()
            .any(|f| f.field == field && f.operator == Operator::Eq)
    }

    /// Check a record against every filter (AND).
    pub fn matches(&self, record: &Record) -> bool {
        self.filters.iter().all(|f| f.matches(record))
    }

    /// Group columns of a grouped query that returns one row per group
    /// rather than counts. Such rows hold only the group columns, so
    /// selected and ordered fields must be among them.
    pub fn row_groups(&self) -> Result<Option<&[String]>> {
        let Some(groups) = self.group_by.as_deref().filter(|g| !g.is_empty()) else {
            return Ok(None);
        };
        if self.count_only {
            return Ok(None);
        }
        let outside = self
            .select
            .iter()
            .flatten()
            .map(String::as_str)
            .chain(self.order_by.iter().map(|k| k.field.as_str()))
            .find(|field| !groups.iter().any(|g| g == field));
        match outside {
            Some(field) => Err(EngineError::Validation(format!(
                "'{}' is not a group_by field",
                field
            ))),
            None => Ok(Some(groups)),
        }
    }

    /// Every identifier the query would interpolate into SQL text.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.filters
            .iter()
            .map(|f| f.field.as_str())
            .chain(self.order_by.iter().map(|k| k.field.as_str()))
            .chain(self.select.iter().flatten().map(String::as_str))
            .chain(self.group_by.iter().flatten().map(String::as_str))
    }
}

/// Equality with numeric normalization, so `1` and `1.0` compare equal
/// the way they do in SQL.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

/// Compare two JSON values of the same kind. Mixed kinds and nulls are
/// incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64()?;
            let b = b.as_f64()?;
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Total order used by sorting: null < bool < number < string < array < object.
pub fn sort_order(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match rank(a).cmp(&rank(b)) {
        Ordering::Equal => compare_values(a, b).unwrap_or_else(|| a.to_string().cmp(&b.to_string())),
        other => other,
    }
}

fn value_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        other => vec![other.clone()],
    }
}

/// Text form used by pattern operators; null has none.
fn text_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
