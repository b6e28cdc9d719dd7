//! Relational translation
//!
//! Turns a [`QueryBuilder`] (and plain record mutations) into parameterized
//! SQL. Values are always bound as parameters; identifiers are validated
//! against the allow-list and quoted before they touch the SQL text.

use serde_json::Value;

use super::{Operator, QueryBuilder, QueryFilter};
use crate::engine::adapter::SqlDialect;
use crate::engine::canonical::{validate_identifier, validate_qualified_identifier, Record};
use crate::engine::error::{EngineError, Result};

/// SQL text plus its bound parameters, in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlStatement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Dialect-aware SQL generator
#[derive(Debug, Clone, Copy)]
pub struct SqlTranslator {
    dialect: SqlDialect,
}

impl SqlTranslator {
    pub fn new(dialect: SqlDialect) -> Self {
        Self { dialect }
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    fn table(&self, table: &str) -> Result<String> {
        validate_qualified_identifier(table)?;
        Ok(self.dialect.quote_ident(table))
    }

    fn column(&self, name: &str) -> Result<String> {
        validate_identifier(name)?;
        Ok(self.dialect.quote_ident(name))
    }

    fn bind(&self, params: &mut Vec<Value>, value: Value) -> String {
        params.push(value);
        self.dialect.placeholder(params.len())
    }

    fn column_list(&self, fields: &[String]) -> Result<String> {
        Ok(fields
            .iter()
            .map(|f| self.column(f))
            .collect::<Result<Vec<_>>>()?
            .join(", "))
    }

    /// Render one filter as a predicate, binding its values.
    fn predicate(&self, filter: &QueryFilter, params: &mut Vec<Value>) -> Result<String> {
        let col = self.column(&filter.field)?;
        let value = filter.value.clone();

        let sql = match filter.operator {
            Operator::Eq if value.is_null() => format!("{} IS NULL", col),
            Operator::Ne if value.is_null() => format!("{} IS NOT NULL", col),
            Operator::Eq => format!("{} = {}", col, self.bind(params, value)),
            Operator::Ne => format!("{} != {}", col, self.bind(params, value)),
            Operator::Gt => format!("{} > {}", col, self.bind(params, value)),
            Operator::Gte => format!("{} >= {}", col, self.bind(params, value)),
            Operator::Lt => format!("{} < {}", col, self.bind(params, value)),
            Operator::Lte => format!("{} <= {}", col, self.bind(params, value)),
            Operator::In | Operator::NotIn => {
                let items = match value {
                    Value::Array(items) => items,
                    other => vec![other],
                };
                let negate = filter.operator == Operator::NotIn;
                if items.is_empty() {
                    // Nothing can be IN an empty set; NOT IN one still excludes nulls.
                    if negate {
                        format!("{} IS NOT NULL", col)
                    } else {
                        "1 = 0".to_string()
                    }
                } else {
                    let placeholders: Vec<String> =
                        items.into_iter().map(|v| self.bind(params, v)).collect();
                    format!(
                        "{} {} ({})",
                        col,
                        if negate { "NOT IN" } else { "IN" },
                        placeholders.join(", ")
                    )
                }
            }
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                let text = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let escaped = escape_like(&text);
                let pattern = match filter.operator {
                    Operator::Contains => format!("%{}%", escaped),
                    Operator::StartsWith => format!("{}%", escaped),
                    _ => format!("%{}", escaped),
                };
                format!(
                    "{} LIKE {} ESCAPE '\\'",
                    col,
                    self.bind(params, Value::String(pattern))
                )
            }
        };
        Ok(sql)
    }

    /// AND-conjunction of filters in insertion order, with leading ` WHERE `.
    /// Empty when there are no filters.
    pub fn where_clause(&self, filters: &[QueryFilter], params: &mut Vec<Value>) -> Result<String> {
        if filters.is_empty() {
            return Ok(String::new());
        }
        let clauses = filters
            .iter()
            .map(|f| self.predicate(f, params))
            .collect::<Result<Vec<_>>>()?;
        Ok(format!(" WHERE {}", clauses.join(" AND ")))
    }

    /// SELECT for a full query. Count mode keeps only WHERE and GROUP BY.
    pub fn select(&self, table: &str, query: &QueryBuilder) -> Result<SqlStatement> {
        let table = self.table(table)?;
        let mut params = Vec::new();
        let group_by = query.group_by.as_deref().filter(|g| !g.is_empty());

        if query.count_only {
            let where_sql = self.where_clause(&query.filters, &mut params)?;
            let sql = match group_by {
                Some(fields) => {
                    let cols = self.column_list(fields)?;
                    format!(
                        "SELECT {}, COUNT(*) AS \"count\" FROM {}{} GROUP BY {}",
                        cols, table, where_sql, cols
                    )
                }
                None => format!("SELECT COUNT(*) AS \"count\" FROM {}{}", table, where_sql),
            };
            return Ok(SqlStatement { sql, params });
        }

        let columns = match (&query.select, query.row_groups()?) {
            (Some(fields), _) if !fields.is_empty() => self.column_list(fields)?,
            (_, Some(groups)) => self.column_list(groups)?,
            _ => "*".to_string(),
        };
        let mut sql = format!(
            "SELECT {}{} FROM {}",
            if query.distinct { "DISTINCT " } else { "" },
            columns,
            table
        );
        sql.push_str(&self.where_clause(&query.filters, &mut params)?);

        if let Some(fields) = group_by {
            sql.push_str(&format!(" GROUP BY {}", self.column_list(fields)?));
        }

        if !query.order_by.is_empty() {
            let parts = query
                .order_by
                .iter()
                .map(|k| {
                    Ok(format!(
                        "{} {}",
                        self.column(&k.field)?,
                        if k.descending { "DESC" } else { "ASC" }
                    ))
                })
                .collect::<Result<Vec<_>>>()?;
            sql.push_str(&format!(" ORDER BY {}", parts.join(", ")));
        }

        match (query.take, query.skip) {
            (Some(take), skip) => {
                let limit = self.bind(&mut params, Value::from(take as u64));
                sql.push_str(&format!(" LIMIT {}", limit));
                if skip > 0 {
                    let offset = self.bind(&mut params, Value::from(skip as u64));
                    sql.push_str(&format!(" OFFSET {}", offset));
                }
            }
            (None, skip) if skip > 0 => {
                let offset = self.bind(&mut params, Value::from(skip as u64));
                match self.dialect {
                    SqlDialect::Sqlite => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
                    SqlDialect::Postgres => sql.push_str(&format!(" OFFSET {}", offset)),
                }
            }
            _ => {}
        }

        Ok(SqlStatement { sql, params })
    }

    pub fn insert(&self, table: &str, record: &Record) -> Result<SqlStatement> {
        let table = self.table(table)?;
        if record.is_empty() {
            return Ok(SqlStatement {
                sql: format!("INSERT INTO {} DEFAULT VALUES RETURNING *", table),
                params: Vec::new(),
            });
        }
        let mut params = Vec::new();
        let mut cols = Vec::with_capacity(record.len());
        let mut placeholders = Vec::with_capacity(record.len());
        for (key, value) in record {
            cols.push(self.column(key)?);
            placeholders.push(self.bind(&mut params, value.clone()));
        }
        Ok(SqlStatement {
            sql: format!(
                "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                table,
                cols.join(", "),
                placeholders.join(", ")
            ),
            params,
        })
    }

    pub fn update(&self, table: &str, filters: &[QueryFilter], patch: &Record) -> Result<SqlStatement> {
        let table = self.table(table)?;
        if patch.is_empty() {
            return Err(EngineError::Validation("update requires at least one field".into()));
        }
        if filters.is_empty() {
            return Err(EngineError::Validation("update requires a lookup filter".into()));
        }
        let mut params = Vec::new();
        let sets = patch
            .iter()
            .map(|(k, v)| Ok(format!("{} = {}", self.column(k)?, self.bind(&mut params, v.clone()))))
            .collect::<Result<Vec<_>>>()?;
        let where_sql = self.where_clause(filters, &mut params)?;
        Ok(SqlStatement {
            sql: format!("UPDATE {} SET {}{} RETURNING *", table, sets.join(", "), where_sql),
            params,
        })
    }

    /// INSERT ... ON CONFLICT(key) DO UPDATE for every non-key column.
    pub fn upsert(&self, table: &str, record: &Record, conflict_key: &str) -> Result<SqlStatement> {
        if !record.contains_key(conflict_key) {
            return Err(EngineError::Validation(format!(
                "upsert requires the conflict key '{}'",
                conflict_key
            )));
        }
        let insert = self.insert(table, record)?;
        let key_col = self.column(conflict_key)?;
        let updates = record
            .keys()
            .filter(|k| k.as_str() != conflict_key)
            .map(|k| {
                let col = self.column(k)?;
                Ok(format!("{} = excluded.{}", col, col))
            })
            .collect::<Result<Vec<_>>>()?;

        let action = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = insert.sql.replacen(
            " RETURNING *",
            &format!(" ON CONFLICT ({}) {} RETURNING *", key_col, action),
            1,
        );
        Ok(SqlStatement {
            sql,
            params: insert.params,
        })
    }

    pub fn delete(&self, table: &str, filters: &[QueryFilter]) -> Result<SqlStatement> {
        let table = self.table(table)?;
        if filters.is_empty() {
            return Err(EngineError::Validation("delete requires a lookup filter".into()));
        }
        let mut params = Vec::new();
        let where_sql = self.where_clause(filters, &mut params)?;
        Ok(SqlStatement {
            sql: format!("DELETE FROM {}{} RETURNING *", table, where_sql),
            params,
        })
    }
}

/// Escape LIKE wildcards so user text only matches literally.
fn escape_like(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sqlite() -> SqlTranslator {
        SqlTranslator::new(SqlDialect::Sqlite)
    }

    #[test]
    fn test_select_full_query() {
        let q = QueryBuilder::new()
            .eq("status", "active")
            .filter("age", Operator::Gte, 18)
            .filter("role", Operator::In, json!(["admin", "editor"]))
            .order_by("age", true)
            .order_by("name", false)
            .skip(20)
            .take(10);
        let stmt = sqlite().select("users", &q).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT * FROM \"users\" WHERE \"status\" = ?1 AND \"age\" >= ?2 AND \"role\" IN (?3, ?4) \
             ORDER BY \"age\" DESC, \"name\" ASC LIMIT ?5 OFFSET ?6"
        );
        assert_eq!(stmt.params, vec![json!("active"), json!(18), json!("admin"), json!("editor"), json!(10), json!(20)]);
    }

    #[test]
    fn test_pattern_predicates() {
        let q = QueryBuilder::new()
            .filter("name", Operator::Contains, "50%")
            .filter("code", Operator::StartsWith, "AB")
            .filter("mail", Operator::EndsWith, ".org");
        let stmt = SqlTranslator::new(SqlDialect::Postgres).select("t", &q).unwrap();
        assert!(stmt.sql.contains("\"name\" LIKE $1 ESCAPE '\\'"));
        assert_eq!(stmt.params, vec![json!("%50\\%%"), json!("AB%"), json!("%.org")]);
    }

    #[test]
    fn test_count_ignores_order_and_select() {
        let q = QueryBuilder::new()
            .eq("dept", "eng")
            .order_by("name", false)
            .select(&["name"])
            .count();
        let stmt = sqlite().select("people", &q).unwrap();
        assert_eq!(stmt.sql, "SELECT COUNT(*) AS \"count\" FROM \"people\" WHERE \"dept\" = ?1");
    }

    #[test]
    fn test_grouped_count() {
        let q = QueryBuilder::new().group_by(&["dept"]).count();
        let stmt = sqlite().select("people", &q).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"dept\", COUNT(*) AS \"count\" FROM \"people\" GROUP BY \"dept\""
        );
    }

    #[test]
    fn test_group_by_projects_group_columns() {
        let q = QueryBuilder::new().group_by(&["dept"]).order_by("dept", false);
        let stmt = sqlite().select("people", &q).unwrap();
        assert_eq!(
            stmt.sql,
            "SELECT \"dept\" FROM \"people\" GROUP BY \"dept\" ORDER BY \"dept\" ASC"
        );
        let stray = QueryBuilder::new().group_by(&["dept"]).select(&["name"]);
        assert!(matches!(sqlite().select("people", &stray), Err(EngineError::Validation(_))));
    }

    #[test]
    fn test_distinct_projection() {
        let q = QueryBuilder::new().select(&["dept"]).distinct();
        let stmt = sqlite().select("people", &q).unwrap();
        assert_eq!(stmt.sql, "SELECT DISTINCT \"dept\" FROM \"people\"");
    }

    #[test]
    fn test_null_equality_and_empty_in() {
        let q = QueryBuilder::new()
            .eq("deleted_at", Value::Null)
            .filter("id", Operator::In, json!([]));
        let stmt = sqlite().select("t", &q).unwrap();
        assert_eq!(stmt.sql, "SELECT * FROM \"t\" WHERE \"deleted_at\" IS NULL AND 1 = 0");
        assert!(stmt.params.is_empty());
    }

    #[test]
    fn test_skip_without_take() {
        let q = QueryBuilder::new().skip(5);
        assert_eq!(
            sqlite().select("t", &q).unwrap().sql,
            "SELECT * FROM \"t\" LIMIT -1 OFFSET ?1"
        );
    }

    #[test]
    fn test_rejects_bad_identifiers() {
        let q = QueryBuilder::new().eq("name; DROP TABLE users", 1);
        assert!(sqlite().select("users", &q).is_err());
        assert!(sqlite().select("users--", &QueryBuilder::new()).is_err());
        let q = QueryBuilder::new().order_by("a b", false);
        assert!(sqlite().select("users", &q).is_err());
    }

    #[test]
    fn test_mutations() {
        let record = json!({"id": "u1", "name": "Ann"}).as_object().cloned().unwrap();
        let insert = sqlite().insert("users", &record).unwrap();
        assert_eq!(
            insert.sql,
            "INSERT INTO \"users\" (\"id\", \"name\") VALUES (?1, ?2) RETURNING *"
        );

        let upsert = sqlite().upsert("users", &record, "id").unwrap();
        assert!(upsert
            .sql
            .contains("ON CONFLICT (\"id\") DO UPDATE SET \"name\" = excluded.\"name\" RETURNING *"));

        let patch = json!({"name": "Bea"}).as_object().cloned().unwrap();
        let filters = QueryBuilder::new().eq("id", "u1").filters;
        let update = sqlite().update("users", &filters, &patch).unwrap();
        assert_eq!(
            update.sql,
            "UPDATE \"users\" SET \"name\" = ?1 WHERE \"id\" = ?2 RETURNING *"
        );
        assert!(sqlite().update("users", &[], &patch).is_err());
        assert!(sqlite().delete("users", &[]).is_err());
    }
}
