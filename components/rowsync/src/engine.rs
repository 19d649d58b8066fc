/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The two-phase sync pipeline.
//!
//! Push first: unsynced change-log entries are folded per record, turned
//! into upsert/tombstone payloads, applied to the canonical copy, and
//! marked synced. Pull second: every configured table is read from the
//! canonical copy since the anchor, partitioned against whatever local
//! changes are still pending, and applied locally. The anchor advances
//! once, at the very end, and only when everything succeeded.
//!
//! `synchronize` is the single error boundary: whatever goes wrong inside
//! becomes a failed [`SyncResult`], never a panic and never a raw error.

use crate::changelog::{ChangeLogEntry, ChangeTracker, Operation};
use crate::config::SyncConfig;
use crate::conflict::{Conflict, ConflictResolver, LocalChange, ResolutionPolicy};
use crate::error::{Error, Result};
use crate::provider::DataProvider;
use crate::retry::with_retry;
use crate::row::{Row, Value};
use crate::synclog::{LogStatus, SyncLog};
use interrupt_support::Interruptee;
use std::collections::HashMap;
use types::{format_anchor, parse_anchor, Timestamp};

/// Config-table key holding the anchor.
pub const LAST_SYNC_PARAMETER: &str = "LastSyncTimestamp";

/// Attribution column propagated on partial updates when the row carries it.
const MODIFIED_BY_COLUMN: &str = "ModifiedBy";

const SYNC_OPERATION: &str = "Sync";

/// The structured outcome of one run. Sufficient for UI display; unresolved
/// conflicts carry both row versions for a manual merge.
#[derive(Debug, serde_derive::Serialize)]
pub struct SyncResult {
    pub success: bool,
    pub pushed_changes: usize,
    pub pulled_changes: usize,
    pub conflicts_resolved: usize,
    pub unresolved_conflicts: Vec<Conflict>,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub message: String,
    pub error_details: Option<String>,
}

#[derive(Debug, Default)]
struct SyncStats {
    pushed: usize,
    pulled: usize,
    resolved: usize,
    unresolved: Vec<Conflict>,
}

/// `(table, record id)` (lower-cased) -> the last-modified value the push
/// phase wrote. Pull uses this to ignore the exact rows this run pushed;
/// anything further modified by another client in between carries a
/// different last-modified and still comes through.
type PushedIds = HashMap<(String, String), Timestamp>;

pub struct SyncOrchestrator {
    config: SyncConfig,
    local: DataProvider,
    remote: DataProvider,
    tracker: ChangeTracker,
    sync_log: SyncLog,
    resolver: ConflictResolver,
}

impl SyncOrchestrator {
    pub fn new(
        config: SyncConfig,
        local: DataProvider,
        remote: DataProvider,
        tracker: ChangeTracker,
        sync_log: SyncLog,
    ) -> Self {
        SyncOrchestrator {
            config,
            local,
            remote,
            tracker,
            sync_log,
            resolver: ConflictResolver::new(ResolutionPolicy::default()),
        }
    }

    pub fn with_policy(mut self, policy: ResolutionPolicy) -> Self {
        self.resolver = ConflictResolver::new(policy);
        self
    }

    pub(crate) fn tracker(&self) -> &ChangeTracker {
        &self.tracker
    }

    /// Run one end-to-end sync. Progress is monotonically non-decreasing in
    /// 0..=100; 100 is reported exactly once, on success.
    pub fn synchronize(
        &self,
        progress: &mut dyn FnMut(u8, &str),
        interruptee: &dyn Interruptee,
    ) -> SyncResult {
        let start_time = Timestamp::now();
        match self.sync_log.note_resumed_if_dangling(SYNC_OPERATION) {
            Ok(true) => log::info!("Previous sync did not finish; resuming from its state"),
            Ok(false) => {}
            Err(e) => log::warn!("Couldn't check sync log for a dangling run: {}", e),
        }
        self.sync_log.append_best_effort(
            SYNC_OPERATION,
            LogStatus::Started,
            &format!(r#"{{"tables":{}}}"#, self.config.tables_to_sync.len()),
        );

        let mut reporter = ProgressReporter {
            callback: progress,
            sync_log: &self.sync_log,
            last: 0,
        };
        let mut stats = SyncStats::default();
        let outcome = self.sync_inner(&mut reporter, interruptee, start_time, &mut stats);
        let end_time = Timestamp::now();

        match outcome {
            Ok(()) => {
                (reporter.callback)(100, "Sync completed");
                self.sync_log.append_best_effort(
                    SYNC_OPERATION,
                    LogStatus::Completed,
                    &format!(
                        r#"{{"pushed":{},"pulled":{},"resolved":{},"unresolved":{}}}"#,
                        stats.pushed,
                        stats.pulled,
                        stats.resolved,
                        stats.unresolved.len()
                    ),
                );
                SyncResult {
                    success: true,
                    pushed_changes: stats.pushed,
                    pulled_changes: stats.pulled,
                    conflicts_resolved: stats.resolved,
                    unresolved_conflicts: stats.unresolved,
                    start_time,
                    end_time,
                    message: "Sync completed".to_string(),
                    error_details: None,
                }
            }
            Err(e) => {
                log::warn!("Sync failed: {}", e);
                self.sync_log.append_best_effort(
                    SYNC_OPERATION,
                    LogStatus::Failed,
                    &format!(r#"{{"error":"{}"}}"#, e.label()),
                );
                SyncResult {
                    success: false,
                    pushed_changes: stats.pushed,
                    pulled_changes: stats.pulled,
                    conflicts_resolved: stats.resolved,
                    unresolved_conflicts: stats.unresolved,
                    start_time,
                    end_time,
                    message: format!("Sync failed: {}", e.label()),
                    error_details: Some(e.to_string()),
                }
            }
        }
    }

    fn sync_inner(
        &self,
        reporter: &mut ProgressReporter<'_, '_>,
        interruptee: &dyn Interruptee,
        start_time: Timestamp,
        stats: &mut SyncStats,
    ) -> Result<()> {
        interruptee.err_if_interrupted()?;
        reporter.update(2, "Collecting local changes");
        let pushed_ids = self.push_phase(reporter, interruptee, stats)?;

        interruptee.err_if_interrupted()?;
        self.pull_phase(reporter, interruptee, start_time, &pushed_ids, stats)?;

        interruptee.err_if_interrupted()?;
        reporter.update(98, "Advancing sync anchor");
        self.advance_anchor()?;
        Ok(())
    }

    // ---- Phase 1: push ----

    fn push_phase(
        &self,
        reporter: &mut ProgressReporter<'_, '_>,
        interruptee: &dyn Interruptee,
        stats: &mut SyncStats,
    ) -> Result<PushedIds> {
        let mut pushed_ids = PushedIds::new();
        let unsynced = with_retry(&self.config.retry, "read change log", || {
            self.tracker.get_unsynced()
        })?;
        if unsynced.is_empty() {
            reporter.update(45, "No local changes to push");
            return Ok(pushed_ids);
        }

        let groups = group_by_table(&unsynced);
        let total = groups.len().max(1);
        for (i, (table, entries)) in groups.iter().enumerate() {
            interruptee.err_if_interrupted()?;
            if !self.config.syncs_table(table) {
                log::warn!(
                    "Change log carries entries for unconfigured table {:?}; leaving them pending",
                    table
                );
                continue;
            }
            reporter.update(
                (5 + 40 * i / total) as u8,
                &format!("Pushing changes for {}", table),
            );
            stats.pushed += self.push_table(table, entries, &mut pushed_ids)?;
        }
        Ok(pushed_ids)
    }

    fn push_table(
        &self,
        table: &str,
        entries: &[&ChangeLogEntry],
        pushed_ids: &mut PushedIds,
    ) -> Result<usize> {
        let folded = fold_entries(entries);

        // Fetch current bodies for everything that isn't a pure delete.
        let body_ids: Vec<String> = folded
            .iter()
            .filter(|f| !f.operation.is_delete())
            .map(|f| f.record_id.clone())
            .collect();
        let bodies = with_retry(&self.config.retry, "read push bodies", || {
            self.local.get_records_by_ids(table, &body_ids)
        })?;
        let bodies: HashMap<String, Row> = bodies
            .into_iter()
            .filter_map(|row| {
                row.get(&self.config.primary_key_column)
                    .and_then(|v| v.as_id_string())
                    .map(|id| (id.to_ascii_lowercase(), row))
            })
            .collect();

        let push_time = Timestamp::now();
        let mut payloads = Vec::with_capacity(folded.len());
        let mut entry_ids = Vec::new();
        for f in folded {
            entry_ids.extend(f.entry_ids.iter().copied());
            let payload = match &f.operation {
                Operation::Delete => Some(self.tombstone(&f.record_id)),
                Operation::Insert => self.full_row_payload(table, &f, &bodies, push_time),
                Operation::Update(cols) if cols.is_empty() => {
                    // Legacy entries with no column info push the whole row.
                    self.full_row_payload(table, &f, &bodies, push_time)
                }
                Operation::Update(cols) => self.partial_payload(table, &f, cols, &bodies, push_time),
            };
            if let Some(payload) = payload {
                if !f.operation.is_delete() {
                    pushed_ids.insert(
                        (table.to_ascii_lowercase(), f.record_id.to_ascii_lowercase()),
                        push_time,
                    );
                }
                payloads.push(payload);
            }
        }

        if !payloads.is_empty() {
            with_retry(&self.config.retry, "push rows", || {
                self.remote.apply_rows(table, &payloads)
            })?;
        }
        // Everything folded into this batch is now represented remotely
        // (or was unpushable and logged); flip the flags.
        with_retry(&self.config.retry, "mark synced", || {
            self.tracker.mark_synced(&entry_ids)
        })?;
        Ok(payloads.len())
    }

    fn tombstone(&self, record_id: &str) -> Row {
        let mut row = Row::new();
        row.insert(
            self.config.primary_key_column.clone(),
            Value::Text(record_id.to_string()),
        );
        row.insert(self.config.is_deleted_column.clone(), Value::Bool(true));
        row
    }

    fn full_row_payload(
        &self,
        table: &str,
        folded: &FoldedChange,
        bodies: &HashMap<String, Row>,
        push_time: Timestamp,
    ) -> Option<Row> {
        match bodies.get(&folded.record_id.to_ascii_lowercase()) {
            Some(body) => {
                let mut row = body.clone();
                row.insert(
                    self.config.last_modified_column.clone(),
                    Value::Timestamp(push_time),
                );
                Some(row)
            }
            None => {
                // The row vanished locally without a tombstone; there is
                // nothing to push, now or ever.
                log::warn!(
                    "Skipping change for {}/{:?}: no local row",
                    table,
                    folded.record_id
                );
                None
            }
        }
    }

    fn partial_payload(
        &self,
        table: &str,
        folded: &FoldedChange,
        cols: &[String],
        bodies: &HashMap<String, Row>,
        push_time: Timestamp,
    ) -> Option<Row> {
        let body = match bodies.get(&folded.record_id.to_ascii_lowercase()) {
            Some(body) => body,
            None => {
                log::warn!(
                    "Skipping change for {}/{:?}: no local row",
                    table,
                    folded.record_id
                );
                return None;
            }
        };
        let mut row = Row::new();
        row.insert(
            self.config.primary_key_column.clone(),
            body.get(&self.config.primary_key_column)
                .cloned()
                .unwrap_or_else(|| Value::Text(folded.record_id.clone())),
        );
        for col in cols {
            if let Some(value) = body.get(col) {
                row.insert(col.clone(), value.clone());
            }
        }
        row.insert(
            self.config.last_modified_column.clone(),
            Value::Timestamp(push_time),
        );
        if let Some(modified_by) = body.get(MODIFIED_BY_COLUMN) {
            row.insert(MODIFIED_BY_COLUMN, modified_by.clone());
        }
        Some(row)
    }

    // ---- Phase 2: pull ----

    fn pull_phase(
        &self,
        reporter: &mut ProgressReporter<'_, '_>,
        interruptee: &dyn Interruptee,
        start_time: Timestamp,
        pushed_ids: &PushedIds,
        stats: &mut SyncStats,
    ) -> Result<()> {
        let anchor = self.load_or_seed_anchor(start_time)?;
        // Re-read so conflict detection only considers changes that
        // survived (or arrived after) the push.
        let pending = with_retry(&self.config.retry, "re-read change log", || {
            self.tracker.get_unsynced()
        })?;

        let total = self.config.tables_to_sync.len().max(1);
        for (i, table) in self.config.tables_to_sync.iter().enumerate() {
            interruptee.err_if_interrupted()?;
            reporter.update(
                (50 + 45 * i / total) as u8,
                &format!("Pulling changes for {}", table),
            );
            let mut remote_rows = with_retry(&self.config.retry, "pull rows", || {
                self.remote.get_changes_since(table, Some(anchor))
            })?;
            self.discard_own_echoes(table, &mut remote_rows, pushed_ids);
            if remote_rows.is_empty() {
                continue;
            }

            let local_changes = self.local_changes_for_table(table, &pending)?;
            let partitioned = self.resolver.partition_and_resolve(
                table,
                remote_rows,
                &local_changes,
                &self.config.primary_key_column,
                &self.config.last_modified_column,
                &self.config.is_deleted_column,
            );
            let resolved_count = partitioned.resolved_count();
            let mut to_apply = partitioned.non_conflicts;
            to_apply.extend(partitioned.resolved);
            if !to_apply.is_empty() {
                with_retry(&self.config.retry, "apply pulled rows", || {
                    self.local.apply_rows(table, &to_apply)
                })?;
            }
            stats.pulled += to_apply.len();
            stats.resolved += resolved_count;
            stats.unresolved.extend(partitioned.conflicts);
        }
        Ok(())
    }

    /// Drop rows that are exactly what this run's push wrote. A row another
    /// client touched after our push carries a different last-modified
    /// value and stays in the feed.
    fn discard_own_echoes(&self, table: &str, remote_rows: &mut Vec<Row>, pushed_ids: &PushedIds) {
        if pushed_ids.is_empty() {
            return;
        }
        let table_key = table.to_ascii_lowercase();
        remote_rows.retain(|row| {
            let id = row
                .get(&self.config.primary_key_column)
                .and_then(|v| v.as_id_string());
            let lm = row
                .get(&self.config.last_modified_column)
                .and_then(|v| v.as_timestamp());
            match (id, lm) {
                (Some(id), Some(lm)) => {
                    pushed_ids.get(&(table_key.clone(), id.to_ascii_lowercase())) != Some(&lm)
                }
                _ => true,
            }
        });
    }

    fn local_changes_for_table(
        &self,
        table: &str,
        pending: &[ChangeLogEntry],
    ) -> Result<HashMap<String, LocalChange>> {
        let entries: Vec<&ChangeLogEntry> = pending
            .iter()
            .filter(|e| e.table_name.eq_ignore_ascii_case(table))
            .collect();
        if entries.is_empty() {
            return Ok(HashMap::new());
        }
        let folded = fold_entries(&entries);
        let body_ids: Vec<String> = folded
            .iter()
            .filter(|f| !f.operation.is_delete())
            .map(|f| f.record_id.clone())
            .collect();
        let bodies = with_retry(&self.config.retry, "read conflict bodies", || {
            self.local.get_records_by_ids(table, &body_ids)
        })?;
        let mut bodies: HashMap<String, Row> = bodies
            .into_iter()
            .filter_map(|row| {
                row.get(&self.config.primary_key_column)
                    .and_then(|v| v.as_id_string())
                    .map(|id| (id.to_ascii_lowercase(), row))
            })
            .collect();
        Ok(folded
            .into_iter()
            .map(|f| {
                let key = f.record_id.to_ascii_lowercase();
                let row = bodies.remove(&key);
                (
                    key,
                    LocalChange {
                        operation: f.operation,
                        row,
                        timestamp: f.timestamp,
                    },
                )
            })
            .collect())
    }

    // ---- Phase 3: anchor ----

    fn load_or_seed_anchor(&self, start_time: Timestamp) -> Result<Timestamp> {
        let raw = with_retry(&self.config.retry, "read anchor", || {
            self.local.get_parameter(LAST_SYNC_PARAMETER)
        })?;
        if let Some(anchor) = raw.as_deref().and_then(parse_anchor) {
            return Ok(anchor);
        }
        if let Some(raw) = raw {
            log::warn!("Unreadable anchor {:?}; reseeding", raw);
        }
        // First run: seed to the start of this run so we don't pull the
        // entire historical table.
        let seeded = format_anchor(start_time);
        with_retry(&self.config.retry, "seed anchor", || {
            self.local.set_parameter(LAST_SYNC_PARAMETER, &seeded)
        })?;
        Ok(start_time)
    }

    fn advance_anchor(&self) -> Result<()> {
        // End of run, not start: our own push bumped last-modified on the
        // remote side, and the next pull must not re-fetch those rows.
        let now = Timestamp::now();
        if let Some(previous) = self
            .local
            .get_parameter(LAST_SYNC_PARAMETER)?
            .as_deref()
            .and_then(parse_anchor)
        {
            if now < previous {
                return Err(Error::InvariantViolation(format!(
                    "anchor would move backwards ({} -> {})",
                    format_anchor(previous),
                    format_anchor(now)
                )));
            }
        }
        with_retry(&self.config.retry, "advance anchor", || {
            self.local
                .set_parameter(LAST_SYNC_PARAMETER, &format_anchor(now))
        })
    }
}

/// Progress with the monotonic clamp applied; also mirrors updates into the
/// shared sync log (best effort).
struct ProgressReporter<'a, 'b> {
    callback: &'a mut (dyn FnMut(u8, &str) + 'b),
    sync_log: &'a SyncLog,
    last: u8,
}

impl ProgressReporter<'_, '_> {
    fn update(&mut self, pct: u8, message: &str) {
        // 100 is reserved for the single completion report.
        let pct = pct.min(99).max(self.last);
        self.last = pct;
        (self.callback)(pct, message);
        self.sync_log.append_best_effort(
            SYNC_OPERATION,
            LogStatus::Progress,
            &format!(r#"{{"pct":{},"msg":{:?}}}"#, pct, message),
        );
    }
}

struct FoldedChange {
    record_id: String,
    operation: Operation,
    entry_ids: Vec<i64>,
    timestamp: Timestamp,
}

/// Collapse a record's entries (already in timestamp order) into one
/// effective operation per record, preserving first-seen record order.
fn fold_entries(entries: &[&ChangeLogEntry]) -> Vec<FoldedChange> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, FoldedChange> = HashMap::new();
    for entry in entries {
        let key = entry.record_id.to_ascii_lowercase();
        match by_id.get_mut(&key) {
            Some(folded) => {
                folded.operation = folded.operation.clone().merge(entry.operation.clone());
                folded.entry_ids.push(entry.id);
                folded.timestamp = entry.timestamp.max(folded.timestamp);
            }
            None => {
                order.push(key.clone());
                by_id.insert(
                    key,
                    FoldedChange {
                        record_id: entry.record_id.clone(),
                        operation: entry.operation.clone(),
                        entry_ids: vec![entry.id],
                        timestamp: entry.timestamp,
                    },
                );
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| by_id.remove(&key))
        .collect()
}

/// Group entries by table (case-insensitively), preserving first-seen table
/// order and per-table entry order.
fn group_by_table<'e>(entries: &'e [ChangeLogEntry]) -> Vec<(String, Vec<&'e ChangeLogEntry>)> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, (String, Vec<&ChangeLogEntry>)> = HashMap::new();
    for entry in entries {
        let key = entry.table_name.to_ascii_lowercase();
        match groups.get_mut(&key) {
            Some((_, list)) => list.push(entry),
            None => {
                order.push(key.clone());
                groups.insert(key, (entry.table_name.clone(), vec![entry]));
            }
        }
    }
    order
        .into_iter()
        .filter_map(|key| groups.remove(&key))
        .collect()
}
