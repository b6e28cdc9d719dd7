//! In-memory query pipeline for schemaless stores
//!
//! Runs over a fully materialized collection in a fixed order:
//! filter, count short-circuit, group, order, paginate, project, distinct.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use super::{sort_order, QueryBuilder};
use crate::engine::canonical::{canonical_record_bytes, Record};
use crate::engine::error::Result;

/// Result of a query: rows, or a bare count for ungrouped count queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueryOutput {
    Rows(Vec<Record>),
    Count(u64),
}

impl QueryOutput {
    pub fn rows(self) -> Vec<Record> {
        match self {
            QueryOutput::Rows(rows) => rows,
            QueryOutput::Count(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            QueryOutput::Rows(rows) => rows.len(),
            QueryOutput::Count(n) => *n as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Execute a query against materialized records.
pub fn execute(records: Vec<Record>, query: &QueryBuilder) -> Result<QueryOutput> {
    let filtered = apply_filters(records, query);

    if query.count_only {
        return Ok(match &query.group_by {
            Some(fields) if !fields.is_empty() => QueryOutput::Rows(count_groups(&filtered, fields)),
            _ => QueryOutput::Count(filtered.len() as u64),
        });
    }

    let grouped = match query.row_groups()? {
        Some(fields) => group_heads(filtered, fields),
        None => filtered,
    };

    let ordered = apply_ordering(grouped, query);
    let page = apply_pagination(ordered, query);
    let projected = apply_projection(page, query);
    let rows = if query.distinct {
        apply_distinct(projected)?
    } else {
        projected
    };

    Ok(QueryOutput::Rows(rows))
}

pub fn apply_filters(records: Vec<Record>, query: &QueryBuilder) -> Vec<Record> {
    if query.filters.is_empty() {
        return records;
    }
    records.into_iter().filter(|r| query.matches(r)).collect()
}

/// Stable multi-key sort. Keys are applied from last to first, so the first
/// `order_by` call ends up as the most significant key.
pub fn apply_ordering(mut records: Vec<Record>, query: &QueryBuilder) -> Vec<Record> {
    for key in query.order_by.iter().rev() {
        records.sort_by(|a, b| {
            let a_val = a.get(&key.field).unwrap_or(&Value::Null);
            let b_val = b.get(&key.field).unwrap_or(&Value::Null);
            let ordering = sort_order(a_val, b_val);
            if key.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }
    records
}

pub fn apply_pagination(records: Vec<Record>, query: &QueryBuilder) -> Vec<Record> {
    let iter = records.into_iter().skip(query.skip);
    match query.take {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

pub fn apply_projection(records: Vec<Record>, query: &QueryBuilder) -> Vec<Record> {
    let Some(fields) = &query.select else {
        return records;
    };
    records
        .into_iter()
        .map(|r| {
            r.into_iter()
                .filter(|(k, _)| fields.iter().any(|f| f == k))
                .collect()
        })
        .collect()
}

/// Drop records whose canonical serialization was already seen.
pub fn apply_distinct(records: Vec<Record>) -> Result<Vec<Record>> {
    let mut seen = HashSet::new();
    let mut unique = Vec::with_capacity(records.len());
    for record in records {
        if seen.insert(canonical_record_bytes(&record)?) {
            unique.push(record);
        }
    }
    Ok(unique)
}

fn group_key(record: &Record, fields: &[String]) -> String {
    let key: Vec<&Value> = fields
        .iter()
        .map(|f| record.get(f).unwrap_or(&Value::Null))
        .collect();
    serde_json::to_string(&key).unwrap_or_default()
}

/// One row per distinct group, holding only the group columns.
fn group_heads(records: Vec<Record>, fields: &[String]) -> Vec<Record> {
    let mut seen = HashSet::new();
    records
        .iter()
        .filter(|r| seen.insert(group_key(r, fields)))
        .map(|r| group_head(r, fields))
        .collect()
}

fn group_head(record: &Record, fields: &[String]) -> Record {
    fields
        .iter()
        .map(|f| (f.clone(), record.get(f).cloned().unwrap_or(Value::Null)))
        .collect()
}

fn count_groups(records: &[Record], fields: &[String]) -> Vec<Record> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, (Record, u64)> = std::collections::HashMap::new();

    for record in records {
        let key = group_key(record, fields);
        let entry = groups.entry(key.clone()).or_insert_with(|| {
            order.push(key);
            (group_head(record, fields), 0)
        });
        entry.1 += 1;
    }

    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .map(|(mut head, count)| {
            head.insert("count".to_string(), Value::from(count));
            head
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::query::Operator;
    use serde_json::json;

    fn records(v: Value) -> Vec<Record> {
        v.as_array()
            .unwrap()
            .iter()
            .map(|r| r.as_object().cloned().unwrap())
            .collect()
    }

    fn people() -> Vec<Record> {
        records(json!([
            {"id": 1, "name": "Alice", "dept": "eng", "age": 30},
            {"id": 2, "name": "Bob", "dept": "ops", "age": 25},
            {"id": 3, "name": "Carol", "dept": "eng", "age": 35},
            {"id": 4, "name": "Dave", "dept": "ops", "age": 30},
        ]))
    }

    #[test]
    fn test_filter_then_count() {
        let q = QueryBuilder::new().eq("dept", "eng").count();
        assert_eq!(execute(people(), &q).unwrap(), QueryOutput::Count(2));
    }

    #[test]
    fn test_first_order_key_is_primary() {
        let q = QueryBuilder::new().order_by("age", true).order_by("name", false);
        let rows = execute(people(), &q).unwrap().rows();
        let names: Vec<&str> = rows.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Carol", "Alice", "Dave", "Bob"]);
    }

    #[test]
    fn test_sort_is_stable() {
        let q = QueryBuilder::new().order_by("dept", false);
        let rows = execute(people(), &q).unwrap().rows();
        let ids: Vec<i64> = rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 3, 2, 4]);
    }

    #[test]
    fn test_paginate_project_distinct() {
        let q = QueryBuilder::new()
            .order_by("id", false)
            .skip(1)
            .take(3)
            .select(&["dept"])
            .distinct();
        let rows = execute(people(), &q).unwrap().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["dept"], "ops");
        assert_eq!(rows[1]["dept"], "eng");
        assert!(rows[0].get("name").is_none());
    }

    #[test]
    fn test_grouped_count() {
        let q = QueryBuilder::new().group_by(&["dept"]).count();
        let rows = execute(people(), &q).unwrap().rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["dept"], "eng");
        assert_eq!(rows[0]["count"], 2);
        assert_eq!(rows[1]["count"], 2);
    }

    #[test]
    fn test_group_by_yields_group_columns_only() {
        let q = QueryBuilder::new().group_by(&["dept"]).order_by("dept", true);
        let rows = execute(people(), &q).unwrap().rows();
        assert_eq!(rows, records(json!([{"dept": "ops"}, {"dept": "eng"}])));

        let stray = QueryBuilder::new().group_by(&["dept"]).select(&["name"]);
        assert!(execute(people(), &stray).is_err());
        let stray_order = QueryBuilder::new().group_by(&["dept"]).order_by("age", false);
        assert!(execute(people(), &stray_order).is_err());
    }

    #[test]
    fn test_missing_values_sort_first() {
        let mut data = people();
        data[1].remove("age");
        let q = QueryBuilder::new().order_by("age", false);
        let rows = execute(data, &q).unwrap().rows();
        assert_eq!(rows[0]["name"], "Bob");
    }

    #[test]
    fn test_range_filter() {
        let q = QueryBuilder::new()
            .filter("age", Operator::Gte, 30)
            .filter("name", Operator::NotIn, json!(["Dave"]));
        let rows = execute(people(), &q).unwrap().rows();
        assert_eq!(rows.len(), 2);
    }
}
