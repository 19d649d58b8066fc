/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! Partitioning pulled rows against pending local changes.
//!
//! A remote row conflicts when its primary key has an unsynced local
//! mutation. The default policy resolves by last writer wins on the
//! last-modified column; `SurfaceAll` hands every conflict back to the
//! caller instead. A remote row with a missing or null primary key is
//! classified clean on purpose - dropping it would lose data.

use crate::changelog::Operation;
use crate::row::Row;
use serde_derive::Serialize;
use std::collections::HashMap;
use types::Timestamp;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ConflictType {
    /// Both sides changed the row since the anchor.
    UpdateUpdate,
    /// Local changed the row, the remote feed carries a tombstone.
    UpdateDelete,
    /// Local deleted the row, the remote side changed it.
    DeleteUpdate,
}

#[derive(Clone, Debug, Serialize)]
pub struct Conflict {
    pub table_name: String,
    pub record_id: String,
    pub local_version: Row,
    pub remote_version: Row,
    pub conflict_type: ConflictType,
}

/// How detected conflicts are settled.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResolutionPolicy {
    /// Compare last-modified instants; the newer version wins. Exact ties
    /// go to the remote version so every replica converges on the
    /// canonical copy.
    #[default]
    LastWriterWins,
    /// Resolve nothing; surface every conflict to the caller.
    SurfaceAll,
}

/// A pending local mutation for one record, assembled from the change log.
#[derive(Clone, Debug)]
pub struct LocalChange {
    pub operation: Operation,
    /// The current local row, when one still exists (deletes have none).
    pub row: Option<Row>,
    /// When the change was logged; the fallback ordering key when the local
    /// row carries no usable last-modified value.
    pub timestamp: Timestamp,
}

/// The outcome of partitioning one table's remote feed.
#[derive(Debug, Default)]
pub struct Partitioned {
    /// Unresolved conflicts, for the caller/UI. Sorted by record id.
    pub conflicts: Vec<Conflict>,
    /// Remote rows with no pending local change; apply them.
    pub non_conflicts: Vec<Row>,
    /// Remote rows that won resolution; apply them too.
    pub resolved: Vec<Row>,
    /// Conflicts where the local version won; nothing to apply, the local
    /// change is already (or will be) pushed.
    pub resolved_locally: usize,
}

impl Partitioned {
    pub fn resolved_count(&self) -> usize {
        self.resolved.len() + self.resolved_locally
    }
}

pub struct ConflictResolver {
    policy: ResolutionPolicy,
}

impl ConflictResolver {
    pub fn new(policy: ResolutionPolicy) -> Self {
        ConflictResolver { policy }
    }

    /// Partition `remote_rows` against the pending local changes for the
    /// same table (keyed by lower-cased record id), resolving what the
    /// policy allows. Total: every remote row lands in exactly one of
    /// `non_conflicts`, `conflicts`, `resolved`, or `resolved_locally`.
    pub fn partition_and_resolve(
        &self,
        table: &str,
        remote_rows: Vec<Row>,
        local: &HashMap<String, LocalChange>,
        primary_key_column: &str,
        last_modified_column: &str,
        is_deleted_column: &str,
    ) -> Partitioned {
        let mut out = Partitioned::default();
        for remote in remote_rows {
            let record_id = remote
                .get(primary_key_column)
                .and_then(|v| v.as_id_string());
            let change = record_id
                .as_ref()
                .and_then(|id| local.get(&id.to_ascii_lowercase()));
            let (record_id, change) = match (record_id, change) {
                (Some(id), Some(change)) => (id, change),
                // No key, or no pending local edit: clean.
                _ => {
                    out.non_conflicts.push(remote);
                    continue;
                }
            };

            let remote_deleted = remote
                .get(is_deleted_column)
                .map_or(false, |v| v.is_truthy());
            let conflict_type = if change.operation.is_delete() {
                ConflictType::DeleteUpdate
            } else if remote_deleted {
                ConflictType::UpdateDelete
            } else {
                ConflictType::UpdateUpdate
            };

            match self.policy {
                ResolutionPolicy::SurfaceAll => {
                    out.conflicts
                        .push(self.make_conflict(table, record_id, change, remote, conflict_type));
                }
                ResolutionPolicy::LastWriterWins => {
                    let local_modified = change
                        .row
                        .as_ref()
                        .and_then(|row| row.get(last_modified_column))
                        .and_then(|v| v.as_timestamp())
                        .unwrap_or(change.timestamp);
                    match remote.get(last_modified_column).and_then(|v| v.as_timestamp()) {
                        Some(remote_modified) if remote_modified >= local_modified => {
                            out.resolved.push(remote);
                        }
                        Some(_) => {
                            out.resolved_locally += 1;
                        }
                        // The remote row carries no usable last-modified
                        // value; nothing to compare, so surface it.
                        None => {
                            out.conflicts.push(self.make_conflict(
                                table,
                                record_id,
                                change,
                                remote,
                                conflict_type,
                            ));
                        }
                    }
                }
            }
        }
        out.conflicts
            .sort_by(|a, b| a.record_id.cmp(&b.record_id));
        out
    }

    fn make_conflict(
        &self,
        table: &str,
        record_id: String,
        change: &LocalChange,
        remote: Row,
        conflict_type: ConflictType,
    ) -> Conflict {
        Conflict {
            table_name: table.to_string(),
            record_id,
            local_version: change.row.clone().unwrap_or_default(),
            remote_version: remote,
            conflict_type,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::row::Value;

    const PK: &str = "ID";
    const LM: &str = "LastModified";
    const DEL: &str = "IsDeleted";

    fn row(id: &str, name: &str, lm: u64) -> Row {
        let mut row = Row::new();
        row.insert(PK, Value::Text(id.into()));
        row.insert("Name", Value::Text(name.into()));
        row.insert(LM, Value::Timestamp(Timestamp(lm)));
        row
    }

    fn pending_update(id: &str, name: &str, lm: u64) -> (String, LocalChange) {
        (
            id.to_ascii_lowercase(),
            LocalChange {
                operation: Operation::Update(vec!["Name".into()]),
                row: Some(row(id, name, lm)),
                timestamp: Timestamp(lm),
            },
        )
    }

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(ResolutionPolicy::LastWriterWins)
    }

    fn partition(
        r: &ConflictResolver,
        remote: Vec<Row>,
        local: &HashMap<String, LocalChange>,
    ) -> Partitioned {
        r.partition_and_resolve("Items", remote, local, PK, LM, DEL)
    }

    #[test]
    fn test_clean_rows_pass_through() {
        let local = HashMap::from([pending_update("r1", "local", 100)]);
        let out = partition(&resolver(), vec![row("r2", "other", 200)], &local);
        assert_eq!(out.non_conflicts.len(), 1);
        assert!(out.conflicts.is_empty());
        assert!(out.resolved.is_empty());
    }

    #[test]
    fn test_null_pk_is_clean() {
        let local = HashMap::from([pending_update("r1", "local", 100)]);
        let mut keyless = Row::new();
        keyless.insert("Name", Value::Text("stray".into()));
        keyless.insert(LM, Value::Timestamp(Timestamp(500)));
        let mut null_key = row("x", "y", 500);
        null_key.insert(PK, Value::Null);
        let out = partition(&resolver(), vec![keyless, null_key], &local);
        assert_eq!(out.non_conflicts.len(), 2);
        assert!(out.conflicts.is_empty());
    }

    #[test]
    fn test_last_writer_wins_remote_newer() {
        let local = HashMap::from([pending_update("r7", "L", 1000)]);
        let out = partition(&resolver(), vec![row("R7", "R", 2000)], &local);
        assert_eq!(out.resolved.len(), 1);
        assert_eq!(
            out.resolved[0].get("Name"),
            Some(&Value::Text("R".into()))
        );
        assert!(out.conflicts.is_empty());
        assert_eq!(out.resolved_count(), 1);
    }

    #[test]
    fn test_last_writer_wins_local_newer() {
        let local = HashMap::from([pending_update("r7", "L", 3000)]);
        let out = partition(&resolver(), vec![row("r7", "R", 2000)], &local);
        assert!(out.resolved.is_empty());
        assert_eq!(out.resolved_locally, 1);
        assert_eq!(out.resolved_count(), 1);
    }

    #[test]
    fn test_tie_goes_remote() {
        let local = HashMap::from([pending_update("r7", "L", 2000)]);
        let out = partition(&resolver(), vec![row("r7", "R", 2000)], &local);
        assert_eq!(out.resolved.len(), 1);
        assert_eq!(out.resolved_locally, 0);
    }

    #[test]
    fn test_delete_update_classification() {
        let local = HashMap::from([(
            "r9".to_string(),
            LocalChange {
                operation: Operation::Delete,
                row: None,
                timestamp: Timestamp(1000),
            },
        )]);
        let surface = ConflictResolver::new(ResolutionPolicy::SurfaceAll);
        let out = partition(&surface, vec![row("r9", "remote-edit", 2000)], &local);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].conflict_type, ConflictType::DeleteUpdate);
        assert!(out.conflicts[0].local_version.is_empty());
    }

    #[test]
    fn test_update_delete_classification() {
        let local = HashMap::from([pending_update("r9", "local-edit", 1000)]);
        let mut tombstone = row("r9", "x", 2000);
        tombstone.insert(DEL, Value::Bool(true));
        let surface = ConflictResolver::new(ResolutionPolicy::SurfaceAll);
        let out = partition(&surface, vec![tombstone], &local);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].conflict_type, ConflictType::UpdateDelete);
    }

    #[test]
    fn test_surface_all_resolves_nothing() {
        let local = HashMap::from([pending_update("r1", "L", 1000)]);
        let surface = ConflictResolver::new(ResolutionPolicy::SurfaceAll);
        let out = partition(&surface, vec![row("r1", "R", 2000)], &local);
        assert_eq!(out.conflicts.len(), 1);
        assert!(out.resolved.is_empty());
        assert_eq!(out.resolved_locally, 0);
    }

    #[test]
    fn test_partition_is_total() {
        let local = HashMap::from([
            pending_update("a", "L", 1000),
            pending_update("b", "L", 9000),
        ]);
        let remote = vec![
            row("a", "R", 2000), // resolved (remote newer)
            row("b", "R", 2000), // resolved locally (local newer)
            row("c", "R", 2000), // clean
        ];
        let total = remote.len();
        let out = partition(&resolver(), remote, &local);
        assert_eq!(
            total,
            out.non_conflicts.len() + out.conflicts.len() + out.resolved.len() + out.resolved_locally
        );
    }

    #[test]
    fn test_missing_remote_lm_surfaces() {
        let local = HashMap::from([pending_update("r1", "L", 1000)]);
        let mut no_lm = Row::new();
        no_lm.insert(PK, Value::Text("r1".into()));
        no_lm.insert("Name", Value::Text("R".into()));
        let out = partition(&resolver(), vec![no_lm], &local);
        assert_eq!(out.conflicts.len(), 1);
        assert_eq!(out.conflicts[0].conflict_type, ConflictType::UpdateUpdate);
    }
}
