/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Reading and writing row sets against one store.
//!
//! The same provider type serves the local replica and the shared canonical
//! copy; the orchestrator owns one of each. A provider is not thread-safe
//! for a single connection - the orchestrator serializes its use - but
//! separate providers may run concurrently against different stores.

use crate::codec::{self, TableSchema};
use crate::config::SyncConfig;
use crate::db::StoreDb;
use crate::error::{Error, Result, SchemaError};
use crate::row::{LogicalType, Row, Value};
use rusqlite::types::{ToSql, Value as SqlValue};
use rusqlite::{params_from_iter, Params, Statement};
use sql_support::{quote_identifier, ConnExt};
use std::collections::HashSet;
use std::sync::Arc;
use types::Timestamp;

pub struct DataProvider {
    db: StoreDb,
    primary_key_column: String,
    last_modified_column: String,
    is_deleted_column: String,
}

impl DataProvider {
    pub fn new(db: StoreDb, config: &SyncConfig) -> Self {
        DataProvider {
            db,
            primary_key_column: config.primary_key_column.clone(),
            last_modified_column: config.last_modified_column.clone(),
            is_deleted_column: config.is_deleted_column.clone(),
        }
    }

    pub fn db(&self) -> &StoreDb {
        &self.db
    }

    fn schema(&self, table: &str) -> Arc<TableSchema> {
        codec::introspect_schema(&self.db, self.db.tag(), table)
    }

    fn known_tables(&self) -> Result<Vec<String>> {
        self.db.query_rows_and_then(
            "SELECT name FROM sqlite_master
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
             ORDER BY name",
            [],
            |row| row.get(0).map_err(Error::from),
        )
    }

    fn require_table(&self, table: &str) -> Result<Arc<TableSchema>> {
        let schema = self.schema(table);
        if schema.is_empty() {
            return Err(SchemaError::UnknownTable {
                table: table.to_string(),
                known: self.known_tables()?,
            }
            .into());
        }
        Ok(schema)
    }

    /// Every row whose last-modified cell is strictly greater than `anchor`.
    /// A None anchor reads the whole table.
    pub fn get_changes_since(&self, table: &str, anchor: Option<Timestamp>) -> Result<Vec<Row>> {
        self.db.with_timeout(|db| {
            let schema = self.schema(table);
            match anchor {
                Some(ts) => {
                    // Bind the anchor in whatever representation the column
                    // actually stores (millis, day offsets, text...).
                    let lm_type = schema
                        .logical_type(&self.last_modified_column)
                        .unwrap_or(LogicalType::Timestamp);
                    let sql = format!(
                        "SELECT * FROM {} WHERE {} > ?",
                        quote_identifier(table),
                        quote_identifier(&self.last_modified_column)
                    );
                    let mut stmt = db.prepare(&sql)?;
                    let bound = codec::encode_value(&Value::Timestamp(ts), Some(lm_type));
                    collect_rows(&mut stmt, params_from_iter([bound]), &schema)
                }
                None => {
                    let sql = format!("SELECT * FROM {}", quote_identifier(table));
                    let mut stmt = db.prepare(&sql)?;
                    collect_rows(&mut stmt, [], &schema)
                }
            }
        })
    }

    /// Fetch rows by primary key. Ids are deduplicated case-insensitively
    /// and blank ids discarded; the query runs in bounded chunks.
    pub fn get_records_by_ids(&self, table: &str, ids: &[String]) -> Result<Vec<Row>> {
        let mut seen = HashSet::new();
        let ids: Vec<&String> = ids
            .iter()
            .filter(|id| !id.trim().is_empty())
            .filter(|id| seen.insert(id.trim().to_ascii_lowercase()))
            .collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let schema = self.require_table(table)?;
        if !schema.contains(&self.primary_key_column) {
            return Err(SchemaError::UnknownColumn {
                table: table.to_string(),
                column: self.primary_key_column.clone(),
                known: schema.known_columns(),
            }
            .into());
        }
        self.db.with_timeout(|db| {
            let mut out = Vec::new();
            sql_support::each_chunk_mapped(
                &ids,
                |id| *id as &dyn ToSql,
                |chunk, _| -> Result<()> {
                    let sql = format!(
                        "SELECT * FROM {} WHERE {} IN ({})",
                        quote_identifier(table),
                        quote_identifier(&self.primary_key_column),
                        sql_support::repeat_sql_vars(chunk.len())
                    );
                    let mut stmt = db.prepare(&sql)?;
                    out.extend(collect_rows(&mut stmt, chunk, &schema)?);
                    Ok(())
                },
            )?;
            Ok(out)
        })
    }

    /// Apply an ordered set of upserts and deletes in one transaction.
    ///
    /// A row whose tombstone flag is truthy becomes a physical DELETE by
    /// primary key. Everything else is an upsert: UPDATE the present
    /// columns, and when no row matched, INSERT. Columns the table doesn't
    /// have are silently dropped when the schema is known. The first store
    /// error rolls the whole batch back and surfaces as `ApplyFailure`.
    pub fn apply_rows(&self, table: &str, rows: &[Row]) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let schema = self.schema(table);
        self.db.with_timeout(|db| {
            let tx = db.unchecked_transaction_imm()?;
            for row in rows {
                if let Err(e) = self.apply_one(&tx, table, &schema, row) {
                    // Interrupts belong to the timeout machinery, not to the
                    // row that happened to be in flight.
                    return Err(match e {
                        Error::Sql(ref cause) if sql_support::is_interrupt_error(cause) => e,
                        other => Error::apply_failure(table, row.to_json_string(), other),
                    });
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    fn apply_one(
        &self,
        tx: &sql_support::UncheckedTransaction<'_>,
        table: &str,
        schema: &TableSchema,
        row: &Row,
    ) -> Result<()> {
        let pk = &self.primary_key_column;
        let id_value = row
            .get(pk)
            .filter(|v| !v.is_null())
            .ok_or_else(|| Error::InvariantViolation(format!("row carries no {:?} value", pk)))?;
        let id_param = codec::encode_value(id_value, schema.logical_type(pk));

        if row
            .get(&self.is_deleted_column)
            .map_or(false, |v| v.is_truthy())
        {
            tx.execute_cached(
                &format!(
                    "DELETE FROM {} WHERE {} = ?",
                    quote_identifier(table),
                    quote_identifier(pk)
                ),
                [&id_param],
            )?;
            return Ok(());
        }

        // Bindable columns, sorted case-insensitively for deterministic
        // parameter order.
        let bound: Vec<(&str, SqlValue)> = row
            .sorted_columns()
            .into_iter()
            .filter(|(name, _)| {
                name.eq_ignore_ascii_case(pk) || schema.is_empty() || schema.contains(name)
            })
            .map(|(name, value)| (name, codec::encode_value(value, schema.logical_type(name))))
            .collect();
        let update_set: Vec<&(&str, SqlValue)> = bound
            .iter()
            .filter(|(name, _)| !name.eq_ignore_ascii_case(pk))
            .collect();

        if !update_set.is_empty() {
            let assignments = update_set
                .iter()
                .map(|(name, _)| format!("{} = ?", quote_identifier(name)))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "UPDATE {} SET {} WHERE {} = ?",
                quote_identifier(table),
                assignments,
                quote_identifier(pk)
            );
            let mut params: Vec<&dyn ToSql> =
                update_set.iter().map(|(_, v)| v as &dyn ToSql).collect();
            params.push(&id_param);
            let affected = tx.execute_cached(&sql, &params[..])?;
            if affected > 0 {
                return Ok(());
            }
        }

        let column_list = bound
            .iter()
            .map(|(name, _)| quote_identifier(name))
            .collect::<Vec<_>>()
            .join(", ");
        // A row carrying only its primary key still has to exist afterward,
        // but mustn't clobber anything already there.
        let verb = if update_set.is_empty() {
            "INSERT OR IGNORE"
        } else {
            "INSERT"
        };
        let sql = format!(
            "{} INTO {} ({}) VALUES ({})",
            verb,
            quote_identifier(table),
            column_list,
            sql_support::repeat_sql_vars(bound.len())
        );
        let params: Vec<&dyn ToSql> = bound.iter().map(|(_, v)| v as &dyn ToSql).collect();
        tx.execute_cached(&sql, &params[..])?;
        Ok(())
    }

    pub fn get_parameter(&self, key: &str) -> Result<Option<String>> {
        self.db.get_parameter(key)
    }

    pub fn set_parameter(&self, key: &str, value: &str) -> Result<()> {
        self.db.set_parameter(key, value)
    }
}

fn collect_rows<P: Params>(
    stmt: &mut Statement<'_>,
    params: P,
    schema: &TableSchema,
) -> Result<Vec<Row>> {
    let names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();
    let mut rows = stmt.query(params)?;
    let mut out = Vec::new();
    while let Some(r) = rows.next()? {
        let mut row = Row::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            let value = codec::decode_value(r.get_ref(i)?, schema.logical_type(name));
            row.insert(name.clone(), value);
        }
        out.push(row);
    }
    Ok(out)
}
