/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

mod conn_ext;
mod each_chunk;
mod maybe_cached;
mod repeat;
mod timeout;

pub use conn_ext::*;
pub use each_chunk::*;
pub use maybe_cached::*;
pub use repeat::*;
pub use timeout::*;

/// In PRAGMA foo='bar', `'bar'` must be a constant string (it cannot be a
/// bound parameter), so we need to escape manually. According to
/// https://www.sqlite.org/faq.html, the only character that must be escaped is
/// the single quote, which is escaped by placing two single quotes in a row.
pub fn escape_string_for_pragma(s: &str) -> String {
    s.replace('\'', "''")
}

/// Quote an identifier (table or column name) for interpolation into SQL
/// text. Identifiers come from configuration and schema introspection, never
/// from row data, but they still can't be bound as parameters.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
