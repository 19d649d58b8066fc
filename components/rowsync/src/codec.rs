/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Schema-aware conversion between [`Value`]s and the store's SQL types.
//!
//! The store's declared column types are the source of truth for coercion:
//! date-like columns accept legacy day-offset numbers and wall-clock
//! strings, numeric columns accept instants (bound as day offsets), textual
//! columns stringify whatever they're given. Values that can't be coerced
//! are passed through unchanged and the store's own error surfaces.
//!
//! Schemas are introspected once per (store, table) and cached for the
//! process; an unreadable or missing table yields an empty schema and every
//! later operation degrades to inferred typing.

use crate::row::{ColumnSchema, LogicalType, Value};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::Arc;
use types::{oadate_to_timestamp, parse_anchor, timestamp_to_oadate, Timestamp};

/// The introspected schema of one table. Keys are lower-cased column names.
#[derive(Debug, Default)]
pub struct TableSchema {
    columns: HashMap<String, ColumnSchema>,
}

impl TableSchema {
    pub fn get(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.get(&name.to_ascii_lowercase())
    }

    pub fn logical_type(&self, name: &str) -> Option<LogicalType> {
        self.get(name).map(|c| c.logical_type)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(&name.to_ascii_lowercase())
    }

    /// True when introspection failed or found nothing; all coercion then
    /// falls back to runtime inference.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Original-case column names, sorted, for diagnostics.
    pub fn known_columns(&self) -> Vec<String> {
        let mut names: Vec<_> = self.columns.values().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }
}

lazy_static! {
    static ref SCHEMA_CACHE: Mutex<HashMap<(String, String), Arc<TableSchema>>> =
        Mutex::new(HashMap::new());
}

/// Read (or recall) the schema of `table` in the store identified by
/// `store_tag`. Never errors: an unreadable table produces an empty schema.
pub fn introspect_schema(conn: &Connection, store_tag: &str, table: &str) -> Arc<TableSchema> {
    let key = (store_tag.to_string(), table.to_ascii_lowercase());
    if let Some(schema) = SCHEMA_CACHE.lock().get(&key) {
        return Arc::clone(schema);
    }
    let schema = Arc::new(read_table_info(conn, table).unwrap_or_else(|e| {
        log::warn!("Schema introspection failed for {:?}: {}", table, e);
        TableSchema::default()
    }));
    SCHEMA_CACHE
        .lock()
        .insert(key, Arc::clone(&schema));
    schema
}

/// Drop cached schemas: all entries for a store, or just one table's.
pub fn invalidate_schema_cache(store_tag: &str, table: Option<&str>) {
    let mut cache = SCHEMA_CACHE.lock();
    match table {
        Some(t) => {
            cache.remove(&(store_tag.to_string(), t.to_ascii_lowercase()));
        }
        None => cache.retain(|(tag, _), _| tag != store_tag),
    }
}

fn read_table_info(conn: &Connection, table: &str) -> rusqlite::Result<TableSchema> {
    let mut stmt = conn.prepare(&format!(
        "PRAGMA table_info({})",
        sql_support::quote_identifier(table)
    ))?;
    let mut columns = HashMap::new();
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get("name")?;
        let decl: Option<String> = row.get("type")?;
        let notnull: bool = row.get("notnull")?;
        let pk: i64 = row.get("pk")?;
        columns.insert(
            name.to_ascii_lowercase(),
            ColumnSchema {
                logical_type: logical_type_from_decl(decl.as_deref().unwrap_or("")),
                nullable: !notnull,
                is_primary_key: pk > 0,
                name,
            },
        );
    }
    Ok(TableSchema { columns })
}

/// Map a declared SQL type to a logical type. Matching is substring-based,
/// the same way SQLite's own affinity rules work; unrecognized declarations
/// degrade to Binary (identity binding).
fn logical_type_from_decl(decl: &str) -> LogicalType {
    let d = decl.to_ascii_uppercase();
    if d.contains("BOOL") {
        LogicalType::Bool
    } else if d.contains("SMALLINT") {
        LogicalType::I16
    } else if d.contains("BIGINT") {
        LogicalType::I64
    } else if d.contains("INT") {
        // INTEGER, INT, MEDIUMINT, AUTOINCREMENT decls...
        LogicalType::I64
    } else if d.contains("CURRENCY") || d.contains("MONEY") {
        LogicalType::Currency
    } else if d.contains("DECIMAL") || d.contains("NUMERIC") {
        LogicalType::Decimal
    } else if d.contains("DATETIME") || d.contains("TIMESTAMP") {
        LogicalType::Timestamp
    } else if d.contains("DATE") {
        LogicalType::Date
    } else if d.contains("GUID") || d.contains("UUID") {
        LogicalType::Guid
    } else if d.contains("LONGTEXT") || d.contains("MEMO") || d.contains("CLOB") {
        LogicalType::LongText
    } else if d.contains("CHAR") || d.contains("TEXT") {
        LogicalType::Text
    } else if d.contains("REAL") || d.contains("FLOA") || d.contains("DOUB") {
        LogicalType::F64
    } else if d.contains("BLOB") || d.is_empty() {
        LogicalType::Binary
    } else {
        LogicalType::Binary
    }
}

/// Encode a value for binding, honoring the expected column type when known.
pub fn encode_value(value: &Value, expected: Option<LogicalType>) -> SqlValue {
    let expected = match expected {
        Some(t) => t,
        None => return encode_inferred(value),
    };
    if value.is_null() {
        return SqlValue::Null;
    }
    if expected.is_date_like() {
        return encode_date_like(value, expected);
    }
    if expected.is_numeric() {
        // An instant bound into a numeric column becomes a legacy day
        // offset; the target switches to REAL for this one binding.
        if let Value::Timestamp(ts) = value {
            return SqlValue::Real(timestamp_to_oadate(*ts));
        }
        return encode_inferred(value);
    }
    if expected.is_textual() {
        return match value {
            Value::Text(s) | Value::Guid(s) => SqlValue::Text(s.clone()),
            Value::Bool(b) => SqlValue::Text(b.to_string()),
            Value::Integer(i) => SqlValue::Text(i.to_string()),
            Value::Float(f) | Value::Decimal(f) => SqlValue::Text(f.to_string()),
            Value::Timestamp(ts) => SqlValue::Text(types::format_anchor(*ts)),
            // No sensible text form; pass through and let the store decide.
            other => encode_inferred(other),
        };
    }
    match expected {
        LogicalType::Bool => match value {
            Value::Bool(b) => SqlValue::Integer(*b as i64),
            other => encode_inferred(other),
        },
        LogicalType::Guid => match value {
            Value::Guid(s) | Value::Text(s) => SqlValue::Text(s.clone()),
            other => encode_inferred(other),
        },
        _ => encode_inferred(value),
    }
}

/// Binding with no schema information: each variant maps to its natural SQL
/// type.
fn encode_inferred(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(*b as i64),
        Value::Integer(i) => SqlValue::Integer(*i),
        Value::Float(f) | Value::Decimal(f) => SqlValue::Real(*f),
        Value::Text(s) | Value::Guid(s) => SqlValue::Text(s.clone()),
        Value::Timestamp(ts) => SqlValue::Integer(ts.as_millis_i64()),
        Value::Bytes(b) => SqlValue::Blob(b.clone()),
    }
}

fn encode_date_like(value: &Value, expected: LogicalType) -> SqlValue {
    let instant = match value {
        Value::Timestamp(ts) => Some(*ts),
        // Numbers in a date column are legacy day offsets.
        Value::Float(days) | Value::Decimal(days) => oadate_to_timestamp(*days),
        Value::Integer(n) => oadate_to_timestamp(*n as f64),
        Value::Text(s) => parse_anchor(s),
        _ => None,
    };
    match instant {
        Some(ts) => store_instant(ts, expected),
        // Not coercible; pass through unchanged.
        None => encode_inferred(value),
    }
}

/// Storage representation of an instant: Timestamp columns hold epoch
/// milliseconds, Date columns hold day offsets. Both decode back through
/// `decode_value`, so the round trip is idempotent.
fn store_instant(ts: Timestamp, expected: LogicalType) -> SqlValue {
    match expected {
        LogicalType::Date => SqlValue::Real(timestamp_to_oadate(ts)),
        _ => SqlValue::Integer(ts.as_millis_i64()),
    }
}

/// Decode a raw column value into the variant the schema says it is.
pub fn decode_value(raw: ValueRef<'_>, expected: Option<LogicalType>) -> Value {
    match expected {
        Some(LogicalType::Bool) => match raw {
            ValueRef::Integer(i) => Value::Bool(i != 0),
            other => decode_inferred(other),
        },
        Some(t) if t.is_date_like() => match raw {
            ValueRef::Integer(ms) => Value::Timestamp(Timestamp::from(ms)),
            ValueRef::Real(days) => oadate_to_timestamp(days)
                .map(Value::Timestamp)
                .unwrap_or(Value::Float(days)),
            ValueRef::Text(s) => {
                let s = String::from_utf8_lossy(s);
                parse_anchor(&s)
                    .map(Value::Timestamp)
                    .unwrap_or_else(|| Value::Text(s.into_owned()))
            }
            other => decode_inferred(other),
        },
        Some(LogicalType::Decimal) | Some(LogicalType::Currency) => match raw {
            ValueRef::Real(f) => Value::Decimal(f),
            ValueRef::Integer(i) => Value::Decimal(i as f64),
            other => decode_inferred(other),
        },
        Some(LogicalType::Guid) => match raw {
            ValueRef::Text(s) => Value::Guid(String::from_utf8_lossy(s).into_owned()),
            other => decode_inferred(other),
        },
        _ => decode_inferred(raw),
    }
}

fn decode_inferred(raw: ValueRef<'_>) -> Value {
    match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn conn_with_items() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE Items (
                ID           TEXT PRIMARY KEY,
                Name         TEXT NOT NULL,
                Qty          INTEGER,
                Price        DECIMAL,
                Delivered    DATE,
                LastModified DATETIME,
                IsDeleted    BOOLEAN,
                Photo        BLOB
            )",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_introspection() {
        let conn = conn_with_items();
        let schema = read_table_info(&conn, "Items").unwrap();
        assert_eq!(schema.logical_type("id"), Some(LogicalType::Text));
        assert_eq!(schema.logical_type("QTY"), Some(LogicalType::I64));
        assert_eq!(schema.logical_type("Price"), Some(LogicalType::Decimal));
        assert_eq!(schema.logical_type("Delivered"), Some(LogicalType::Date));
        assert_eq!(
            schema.logical_type("lastmodified"),
            Some(LogicalType::Timestamp)
        );
        assert_eq!(schema.logical_type("IsDeleted"), Some(LogicalType::Bool));
        assert_eq!(schema.logical_type("Photo"), Some(LogicalType::Binary));
        assert!(schema.get("id").unwrap().is_primary_key);
        assert!(!schema.get("id").unwrap().nullable);
        assert!(schema.get("qty").unwrap().nullable);
    }

    #[test]
    fn test_missing_table_degrades() {
        let conn = Connection::open_in_memory().unwrap();
        let schema = introspect_schema(&conn, "test-missing", "NoSuchTable");
        assert!(schema.is_empty());
    }

    #[test]
    fn test_cache_and_invalidate() {
        let conn = conn_with_items();
        let first = introspect_schema(&conn, "test-cache", "Items");
        assert!(!first.is_empty());
        // Dropping the table doesn't change the cached answer...
        conn.execute_batch("DROP TABLE Items").unwrap();
        let cached = introspect_schema(&conn, "test-cache", "items");
        assert!(!cached.is_empty());
        // ...until the entry is invalidated.
        invalidate_schema_cache("test-cache", Some("Items"));
        let fresh = introspect_schema(&conn, "test-cache", "Items");
        assert!(fresh.is_empty());
        invalidate_schema_cache("test-cache", None);
    }

    #[test]
    fn test_inferred_binding() {
        assert_eq!(encode_value(&Value::Null, None), SqlValue::Null);
        assert_eq!(encode_value(&Value::Bool(true), None), SqlValue::Integer(1));
        assert_eq!(
            encode_value(&Value::Text("x".into()), None),
            SqlValue::Text("x".into())
        );
        assert_eq!(
            encode_value(&Value::Timestamp(Timestamp(12)), None),
            SqlValue::Integer(12)
        );
        assert_eq!(
            encode_value(&Value::Bytes(vec![1, 2]), None),
            SqlValue::Blob(vec![1, 2])
        );
    }

    #[test]
    fn test_day_offset_to_wall_clock() {
        // 44562.0 = 2022-01-01T00:00:00Z; a DATETIME column stores millis.
        let got = encode_value(&Value::Float(44562.0), Some(LogicalType::Timestamp));
        assert_eq!(got, SqlValue::Integer(1_640_995_200_000));
        // A DATE column keeps the day-offset representation.
        let got = encode_value(&Value::Float(44562.0), Some(LogicalType::Date));
        assert_eq!(got, SqlValue::Real(44562.0));
    }

    #[test]
    fn test_string_dates() {
        let got = encode_value(
            &Value::Text("2022-01-01T00:00:00.000Z".into()),
            Some(LogicalType::Timestamp),
        );
        assert_eq!(got, SqlValue::Integer(1_640_995_200_000));
        // Unparsable strings pass through; the store raises if it cares.
        let got = encode_value(&Value::Text("soon".into()), Some(LogicalType::Timestamp));
        assert_eq!(got, SqlValue::Text("soon".into()));
    }

    #[test]
    fn test_timestamp_into_numeric_column() {
        let ts = Timestamp(1_640_995_200_000);
        let got = encode_value(&Value::Timestamp(ts), Some(LogicalType::F64));
        assert_eq!(got, SqlValue::Real(44562.0));
        let got = encode_value(&Value::Timestamp(ts), Some(LogicalType::I32));
        assert_eq!(got, SqlValue::Real(44562.0));
    }

    #[test]
    fn test_stringify_into_text_column() {
        assert_eq!(
            encode_value(&Value::Integer(42), Some(LogicalType::Text)),
            SqlValue::Text("42".into())
        );
        assert_eq!(
            encode_value(&Value::Bool(false), Some(LogicalType::LongText)),
            SqlValue::Text("false".into())
        );
        assert_eq!(
            encode_value(&Value::Timestamp(Timestamp(1_640_995_200_000)), Some(LogicalType::Text)),
            SqlValue::Text("2022-01-01T00:00:00.000Z".into())
        );
    }

    #[test]
    fn test_null_binds_null_regardless_of_type() {
        for t in [
            LogicalType::Bool,
            LogicalType::Date,
            LogicalType::Text,
            LogicalType::Binary,
        ] {
            assert_eq!(encode_value(&Value::Null, Some(t)), SqlValue::Null);
        }
    }

    fn round_trip(value: Value, t: LogicalType) -> Value {
        let encoded = encode_value(&value, Some(t));
        decode_value(ValueRef::from(&encoded), Some(t))
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let ts = Timestamp(1_640_995_200_123);
        assert_eq!(
            round_trip(Value::Timestamp(ts), LogicalType::Timestamp),
            Value::Timestamp(ts)
        );
        // Date columns round at day-offset resolution, which is lossless at
        // millisecond granularity for the window we accept.
        assert_eq!(
            round_trip(Value::Timestamp(ts), LogicalType::Date),
            Value::Timestamp(ts)
        );
        assert_eq!(
            round_trip(Value::Bool(true), LogicalType::Bool),
            Value::Bool(true)
        );
        assert_eq!(
            round_trip(Value::Decimal(1.5), LogicalType::Decimal),
            Value::Decimal(1.5)
        );
        assert_eq!(
            round_trip(Value::Guid("c56a4180-65aa-42ec-a945-5fd21dec0538".into()), LogicalType::Guid),
            Value::Guid("c56a4180-65aa-42ec-a945-5fd21dec0538".into())
        );
        assert_eq!(
            round_trip(Value::Text("hello".into()), LogicalType::Text),
            Value::Text("hello".into())
        );
        assert_eq!(
            round_trip(Value::Bytes(vec![7, 8]), LogicalType::Binary),
            Value::Bytes(vec![7, 8])
        );
    }
}
