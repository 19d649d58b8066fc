/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The generic row model.
//!
//! A [`Row`] is an ordered mapping from column name to [`Value`]. Column
//! names are case-insensitive and unique within a row; the first spelling
//! seen is the one kept. Callers never branch on runtime value types
//! directly - the codec drives coercion from column schema.

use serde::ser::{Serialize, SerializeMap, Serializer};
use types::{format_anchor, Timestamp};

/// The closed set of cell values a row can carry.
///
/// `Decimal` is carried as f64: SQLite has no decimal affinity and the
/// stores this engine targets never exceed double precision.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    Decimal(f64),
    Text(String),
    Timestamp(Timestamp),
    Bytes(Vec<u8>),
    Guid(String),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Timestamp(_) => "timestamp",
            Value::Bytes(_) => "bytes",
            Value::Guid(_) => "guid",
        }
    }

    /// Loose truthiness, used for tombstone flags. Stores disagree on how a
    /// boolean comes back (integer, real, or text), so all the common
    /// spellings of "true" count.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Integer(i) => *i != 0,
            Value::Float(f) | Value::Decimal(f) => *f != 0.0,
            Value::Text(s) => {
                s.eq_ignore_ascii_case("true") || s == "1" || s.eq_ignore_ascii_case("yes")
            }
            _ => false,
        }
    }

    /// The canonical string form of a record id, or None when the value
    /// can't identify a record (null, bytes, ...).
    pub fn as_id_string(&self) -> Option<String> {
        match self {
            Value::Text(s) | Value::Guid(s) => {
                let t = s.trim();
                if t.is_empty() {
                    None
                } else {
                    Some(t.to_string())
                }
            }
            Value::Integer(i) => Some(i.to_string()),
            _ => None,
        }
    }

    /// Best-effort read of a last-modified cell as an instant. Integers are
    /// epoch milliseconds, floats are legacy day offsets, strings parse
    /// through the anchor formats.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            Value::Integer(ms) => Some(Timestamp::from(*ms)),
            Value::Float(days) | Value::Decimal(days) => types::oadate_to_timestamp(*days),
            Value::Text(s) => types::parse_anchor(s),
            _ => None,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Integer(i) => serializer.serialize_i64(*i),
            Value::Float(f) | Value::Decimal(f) => serializer.serialize_f64(*f),
            Value::Text(s) | Value::Guid(s) => serializer.serialize_str(s),
            Value::Timestamp(ts) => serializer.serialize_str(&format_anchor(*ts)),
            Value::Bytes(b) => serializer.serialize_bytes(b),
        }
    }
}

/// The logical type of a column, discovered from the store's schema. This is
/// what drives parameter coercion; unknown declared types degrade to
/// identity binding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalType {
    Bool,
    I16,
    I32,
    I64,
    F32,
    F64,
    Decimal,
    Currency,
    Text,
    LongText,
    Date,
    Timestamp,
    Binary,
    Guid,
}

impl LogicalType {
    #[inline]
    pub fn is_date_like(self) -> bool {
        matches!(self, LogicalType::Date | LogicalType::Timestamp)
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            LogicalType::I16
                | LogicalType::I32
                | LogicalType::I64
                | LogicalType::F32
                | LogicalType::F64
                | LogicalType::Decimal
                | LogicalType::Currency
        )
    }

    #[inline]
    pub fn is_textual(self) -> bool {
        matches!(self, LogicalType::Text | LogicalType::LongText)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ColumnSchema {
    pub name: String,
    pub logical_type: LogicalType,
    pub nullable: bool,
    pub is_primary_key: bool,
}

/// An ordered name -> value map with case-insensitive, unique column names.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Row {
    cols: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Row {
            cols: Vec::with_capacity(n),
        }
    }

    /// Set a column. If a column with the same name (ignoring case) exists,
    /// its value is replaced in place; the original spelling and position
    /// are kept.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        let name = name.into();
        match self.position(&name) {
            Some(idx) => self.cols[idx].1 = value,
            None => self.cols.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.position(name).map(|idx| &self.cols[idx].1)
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.position(name).map(|idx| self.cols.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.cols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cols.is_empty()
    }

    /// Columns in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.cols.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Columns ordered by case-insensitive name. Parameter binding is
    /// positional on some backends, so every statement the engine builds
    /// from a row uses this ordering.
    pub fn sorted_columns(&self) -> Vec<(&str, &Value)> {
        let mut cols: Vec<_> = self.iter().collect();
        cols.sort_by(|(a, _), (b, _)| {
            a.to_ascii_lowercase().cmp(&b.to_ascii_lowercase())
        });
        cols
    }

    /// Compact JSON used in diagnostics (ApplyFailure, sync-log details).
    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "<unserializable row>".to_string())
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.cols
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

impl Serialize for Row {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.cols.len()))?;
        for (name, value) in &self.cols {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (name, value) in iter {
            row.insert(name, value);
        }
        row
    }
}
