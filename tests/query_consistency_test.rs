//! The SQL translation and the in-memory pipeline must select the same rows
//! for the same query.

use polystore::engine::adapter::{RelationalDriver, SqliteDriver};
use polystore::engine::query::{self, Operator, QueryBuilder};
use polystore::Record;
use serde_json::{json, Value};

fn record(v: Value) -> Record {
    v.as_object().cloned().unwrap_or_default()
}

fn fixture() -> Result<(SqliteDriver, Vec<Record>), Box<dyn std::error::Error>> {
    let driver = SqliteDriver::in_memory()?;
    driver.execute_batch("CREATE TABLE items (id TEXT PRIMARY KEY, name TEXT, qty INTEGER, tag TEXT);")?;

    let rows = vec![
        record(json!({ "id": "a", "name": "Apple", "qty": 5, "tag": "fruit" })),
        record(json!({ "id": "b", "name": "apricot", "qty": 12, "tag": "fruit" })),
        record(json!({ "id": "c", "name": "Banana", "qty": null, "tag": "fruit" })),
        record(json!({ "id": "d", "name": "carrot", "qty": 0, "tag": null })),
        record(json!({ "id": "e", "name": "50%_off", "qty": 7, "tag": "promo" })),
        record(json!({ "id": "f", "name": null, "qty": 12, "tag": "veg" })),
    ];
    for row in &rows {
        driver.insert("items", row)?;
    }
    Ok((driver, rows))
}

fn ids(rows: Vec<Record>) -> Vec<String> {
    rows.into_iter()
        .filter_map(|r| r.get("id").and_then(Value::as_str).map(str::to_string))
        .collect()
}

fn assert_agree(driver: &SqliteDriver, rows: &[Record], query: QueryBuilder) -> Result<(), Box<dyn std::error::Error>> {
    let query = query.order_by("id", false);
    let from_sql = ids(driver.select("items", &query)?.rows());
    let in_memory = ids(query::execute(rows.to_vec(), &query)?.rows());
    assert_eq!(from_sql, in_memory, "disagreement for {:?}", query.filters);
    Ok(())
}

#[test]
fn test_filters_agree() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, rows) = fixture()?;

    let queries = vec![
        QueryBuilder::new().eq("tag", "fruit"),
        QueryBuilder::new().eq("tag", Value::Null),
        QueryBuilder::new().filter("tag", Operator::Ne, "fruit"),
        QueryBuilder::new().filter("qty", Operator::Gt, 5),
        QueryBuilder::new().filter("qty", Operator::Gte, 5),
        QueryBuilder::new().filter("qty", Operator::Lt, 7),
        QueryBuilder::new().filter("qty", Operator::Lte, 0),
        QueryBuilder::new().filter("qty", Operator::In, json!([0, 12])),
        QueryBuilder::new().filter("qty", Operator::In, json!([])),
        QueryBuilder::new().filter("tag", Operator::NotIn, json!(["fruit"])),
        QueryBuilder::new().filter("name", Operator::Contains, "an"),
        QueryBuilder::new().filter("name", Operator::StartsWith, "ap"),
        QueryBuilder::new().filter("name", Operator::EndsWith, "ot"),
        QueryBuilder::new().filter("name", Operator::Contains, "%_"),
        QueryBuilder::new().eq("tag", "fruit").filter("qty", Operator::Gt, 1),
    ];
    for query in queries {
        assert_agree(&driver, &rows, query)?;
    }
    Ok(())
}

#[test]
fn test_ordering_and_paging_agree() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, rows) = fixture()?;

    let query = QueryBuilder::new().order_by("qty", true).order_by("id", false).skip(1).take(3);
    let from_sql = ids(driver.select("items", &query)?.rows());
    let in_memory = ids(query::execute(rows.clone(), &query)?.rows());
    assert_eq!(from_sql, in_memory);
    assert_eq!(in_memory, vec!["f", "e", "a"]);

    let count = QueryBuilder::new().eq("tag", "fruit").count();
    assert_eq!(driver.select("items", &count)?, query::execute(rows, &count)?);
    Ok(())
}

#[test]
fn test_bool_and_json_columns_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let driver = SqliteDriver::in_memory()?;
    driver.execute_batch(
        "CREATE TABLE flags (id TEXT PRIMARY KEY, on_ BOOLEAN, tags JSON, meta JSON, label JSON, note TEXT);",
    )?;

    let rows = vec![
        record(json!({ "id": "x", "on_": true, "tags": ["a"], "meta": { "k": 1 }, "label": "123", "note": "[1]" })),
        record(json!({ "id": "y", "on_": false, "tags": [], "meta": null, "label": "plain", "note": null })),
    ];
    for row in &rows {
        assert_eq!(&driver.insert("flags", row)?, row);
    }

    let stored = driver.select("flags", &QueryBuilder::new().order_by("id", false))?.rows();
    assert_eq!(stored, rows);

    // Plain text columns are never parsed.
    let raw = driver.query("SELECT on_, tags, note FROM flags WHERE id = 'x'", &[])?;
    assert_eq!(raw[0]["on_"], json!(true));
    assert_eq!(raw[0]["tags"], json!(["a"]));
    assert_eq!(raw[0]["note"], json!("[1]"));

    for flag in [true, false] {
        let query = QueryBuilder::new().eq("on_", flag).order_by("id", false);
        let from_sql = ids(driver.select("flags", &query)?.rows());
        let in_memory = ids(query::execute(rows.clone(), &query)?.rows());
        assert_eq!(from_sql, in_memory);
        assert_eq!(from_sql.len(), 1);
    }

    let patched = driver.update("flags", &QueryBuilder::new().eq("id", "y").filters, &record(json!({ "tags": ["b", "c"] })))?;
    assert_eq!(patched[0]["tags"], json!(["b", "c"]));
    assert_eq!(patched[0]["on_"], json!(false));
    Ok(())
}

#[test]
fn test_group_rows_agree() -> Result<(), Box<dyn std::error::Error>> {
    let (driver, rows) = fixture()?;

    let query = QueryBuilder::new().filter("qty", Operator::Gte, 0).group_by(&["tag"]).order_by("tag", false);
    let from_sql = driver.select("items", &query)?.rows();
    let in_memory = query::execute(rows.clone(), &query)?.rows();
    assert_eq!(from_sql, in_memory);
    let tags: Vec<Value> = in_memory.iter().map(|r| r["tag"].clone()).collect();
    assert_eq!(tags, vec![Value::Null, json!("fruit"), json!("promo"), json!("veg")]);

    // A column outside the grouping has no single value per group.
    let stray = QueryBuilder::new().group_by(&["tag"]).select(&["name"]);
    assert!(driver.select("items", &stray).is_err());
    assert!(query::execute(rows, &stray).is_err());
    Ok(())
}
