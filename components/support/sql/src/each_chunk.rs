/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use lazy_static::lazy_static;
use rusqlite::{self, limits::Limit, types::ToSql};

/// The engine never binds more than this many parameters in one statement,
/// even when SQLite would allow more. Shared stores may sit on slow network
/// filesystems, and a bounded statement size keeps individual round-trips
/// (and lock hold times) predictable.
pub const SAFE_VARIABLE_NUMBER: usize = 200;

/// Returns the chunk size to use when binding a variable-length list:
/// `SAFE_VARIABLE_NUMBER`, clamped by SQLITE_LIMIT_VARIABLE_NUMBER as read
/// from an in-memory connection and cached. If the compiled-in limit was set
/// to a nonsensical value (<= 0) we panic, but it's unlikely any query works
/// in that case anyway.
pub fn max_variable_number() -> usize {
    lazy_static! {
        static ref MAX_VARIABLE_NUMBER: usize = {
            let conn = rusqlite::Connection::open_in_memory()
                .expect("Failed to initialize in-memory connection (out of memory?)");

            let limit = conn.limit(Limit::SQLITE_LIMIT_VARIABLE_NUMBER);
            assert!(
                limit > 0,
                "Illegal value for SQLITE_LIMIT_VARIABLE_NUMBER (must be > 0) {}",
                limit
            );
            limit as usize
        };
    }
    (*MAX_VARIABLE_NUMBER).min(SAFE_VARIABLE_NUMBER)
}

/// Helper for the case where you have a `&[impl ToSql]` of arbitrary length,
/// but need a `&[&dyn ToSql]` of no more than `max_variable_number()` items.
/// This is useful when performing batched updates.
///
/// The `do_chunk` callback is called with a slice of no more than
/// `max_variable_number()` items as its first argument, and the offset from
/// the start as its second.
///
/// See `each_chunk_mapped` for the case where `T` doesn't implement `ToSql`,
/// but converting to `&dyn ToSql` is nonetheless possible.
pub fn each_chunk<'a, T, E, F>(items: &'a [T], do_chunk: F) -> Result<(), E>
where
    T: ToSql + 'a,
    F: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    each_sized_chunk_mapped(items, max_variable_number(), |t| t as &dyn ToSql, do_chunk)
}

/// A version of `each_chunk` for the case when the conversion to `&dyn ToSql`
/// requires a custom intermediate step, e.g. grabbing a property off an array
/// of records.
pub fn each_chunk_mapped<'a, T, E, Mapper, DoChunk>(
    items: &'a [T],
    to_sql: Mapper,
    do_chunk: DoChunk,
) -> Result<(), E>
where
    T: 'a,
    Mapper: Fn(&'a T) -> &'a dyn ToSql,
    DoChunk: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    each_sized_chunk_mapped(items, max_variable_number(), to_sql, do_chunk)
}

/// The low-level version of the utility wrapped by `each_chunk` and
/// `each_chunk_mapped`; lets you provide both the mapping function and the
/// chunk size.
pub fn each_sized_chunk_mapped<'a, T, E, Mapper, DoChunk>(
    items: &'a [T],
    chunk_size: usize,
    to_sql: Mapper,
    mut do_chunk: DoChunk,
) -> Result<(), E>
where
    T: 'a,
    Mapper: Fn(&'a T) -> &'a dyn ToSql,
    DoChunk: FnMut(&[&dyn ToSql], usize) -> Result<(), E>,
{
    if items.is_empty() {
        return Ok(());
    }
    let mut vec = Vec::with_capacity(chunk_size.min(items.len()));
    let mut offset = 0;
    for chunk in items.chunks(chunk_size) {
        vec.clear();
        vec.extend(chunk.iter().map(|v| to_sql(v)));
        do_chunk(&vec, offset)?;
        offset += chunk.len();
    }
    Ok(())
}
