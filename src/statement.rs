//! Statement helpers - normalization, hashing, parameter binding and
//! row-to-JSON mapping
//!
//! Query results are JSON objects (column name to value) so cached results
//! compare byte-for-byte and responses can be returned to external callers
//! without another mapping layer.

use rusqlite::Connection;
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde_json::Value;

/// One result row: column name -> JSON value
pub type Row = serde_json::Map<String, Value>;

/// Outcome of a write statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct RunResult {
    pub changes: usize,
    pub last_insert_rowid: i64,
}

/// Collapse whitespace and lowercase so logically-identical statements
/// share cache keys and metric buckets
pub fn normalize(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable short fingerprint of a normalized statement
pub fn statement_hash(sql: &str) -> String {
    blake3::hash(normalize(sql).as_bytes()).to_hex()[..16].to_string()
}

/// Whether a statement is a cacheable read
pub fn is_read_statement(sql: &str) -> bool {
    let head = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_lowercase();
    matches!(head.as_str(), "select" | "with" | "values")
}

/// Convert JSON parameters into engine values
pub fn bind_params(params: &[Value]) -> Vec<SqlValue> {
    params
        .iter()
        .map(|value| match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    SqlValue::Integer(i)
                } else {
                    SqlValue::Real(n.as_f64().unwrap_or(0.0))
                }
            }
            Value::String(s) => SqlValue::Text(s.clone()),
            // Arrays and objects are stored as their JSON text
            other => SqlValue::Text(other.to_string()),
        })
        .collect()
}

fn column_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Array(b.iter().map(|byte| Value::from(*byte)).collect()),
    }
}

/// Helper to convert a result row to a JSON object
fn row_to_json(row: &rusqlite::Row<'_>, columns: &[String]) -> rusqlite::Result<Row> {
    let mut object = Row::new();
    for (idx, name) in columns.iter().enumerate() {
        object.insert(name.clone(), column_to_json(row.get_ref(idx)?));
    }
    Ok(object)
}

/// Execute a read statement, returning all rows as JSON objects
pub fn query_rows(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<Vec<Row>> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let bound = bind_params(params);
    let rows = stmt
        .query_map(rusqlite::params_from_iter(bound), |row| {
            row_to_json(row, &columns)
        })?
        .collect::<rusqlite::Result<Vec<Row>>>()?;
    Ok(rows)
}

/// Execute a write statement, returning affected-row accounting
pub fn run(conn: &Connection, sql: &str, params: &[Value]) -> rusqlite::Result<RunResult> {
    let bound = bind_params(params);
    let changes = conn.execute(sql, rusqlite::params_from_iter(bound))?;
    Ok(RunResult {
        changes,
        last_insert_rowid: conn.last_insert_rowid(),
    })
}
