/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Error executing SQL: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("{0}")]
    Schema(#[from] SchemaError),

    /// The store rejected an upsert or delete. Carries the offending row
    /// (as JSON) for diagnostics.
    #[error("The store rejected a row in {table:?}: {cause}")]
    ApplyFailure {
        table: String,
        row: String,
        #[source]
        cause: Box<Error>,
    },

    #[error("{0}")]
    Interrupted(#[from] interrupt_support::Interrupted),

    #[error("Sync invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Error serializing JSON data: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown table {table:?} (known tables: {known:?})")]
    UnknownTable { table: String, known: Vec<String> },

    #[error("Table {table:?} has no column {column:?} (known columns: {known:?})")]
    UnknownColumn {
        table: String,
        column: String,
        known: Vec<String>,
    },
}

impl Error {
    pub(crate) fn apply_failure(table: &str, row_json: String, cause: Error) -> Error {
        Error::ApplyFailure {
            table: table.to_string(),
            row: row_json,
            cause: Box::new(cause),
        }
    }

    /// Whether the retry helper may re-attempt the failed operation. Only
    /// wall-clock timeouts and the SQLite analogues of "connection trouble"
    /// (busy/locked contention, I/O failure, a share that briefly can't be
    /// opened) qualify; everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout(_) => true,
            Error::Sql(e) => matches!(
                e.sqlite_error_code(),
                Some(
                    rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                        | rusqlite::ErrorCode::SystemIoFailure
                        | rusqlite::ErrorCode::CannotOpen
                )
            ),
            _ => false,
        }
    }

    // Get a short textual label identifying the type of error that occurred,
    // without any row data.
    pub fn label(&self) -> &'static str {
        match self {
            Error::Timeout(_) => "Timeout",
            Error::Sql(_) => "Sql",
            Error::Schema(SchemaError::UnknownTable { .. }) => "Schema::UnknownTable",
            Error::Schema(SchemaError::UnknownColumn { .. }) => "Schema::UnknownColumn",
            Error::ApplyFailure { .. } => "ApplyFailure",
            Error::Interrupted(_) => "Interrupted",
            Error::InvariantViolation(_) => "InvariantViolation",
            Error::Json(_) => "Json",
        }
    }
}
