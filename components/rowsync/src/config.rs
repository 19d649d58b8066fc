/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

use crate::retry::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_PRIMARY_KEY_COLUMN: &str = "ID";
pub const DEFAULT_LAST_MODIFIED_COLUMN: &str = "LastModified";
pub const DEFAULT_IS_DELETED_COLUMN: &str = "IsDeleted";

pub const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(120);
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(300);

/// Everything one sync client needs to know: the tables it reconciles, the
/// well-known column names, where the four stores live, and the retry/lock
/// knobs. No other option names are recognized.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Ordered list of tables pulled from the canonical copy.
    pub tables_to_sync: Vec<String>,
    pub primary_key_column: String,
    pub last_modified_column: String,
    pub is_deleted_column: String,

    pub local_store: PathBuf,
    pub remote_store: PathBuf,
    pub lock_store: PathBuf,
    pub change_log_store: PathBuf,

    pub retry: RetryPolicy,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
}

impl SyncConfig {
    pub fn new<I, S>(tables_to_sync: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        SyncConfig {
            tables_to_sync: tables_to_sync.into_iter().map(Into::into).collect(),
            primary_key_column: DEFAULT_PRIMARY_KEY_COLUMN.to_string(),
            last_modified_column: DEFAULT_LAST_MODIFIED_COLUMN.to_string(),
            is_deleted_column: DEFAULT_IS_DELETED_COLUMN.to_string(),
            local_store: PathBuf::new(),
            remote_store: PathBuf::new(),
            lock_store: PathBuf::new(),
            change_log_store: PathBuf::new(),
            retry: RetryPolicy::default(),
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_lease: DEFAULT_LOCK_LEASE,
        }
    }

    pub fn with_stores(
        mut self,
        local: impl Into<PathBuf>,
        remote: impl Into<PathBuf>,
        lock: impl Into<PathBuf>,
        change_log: impl Into<PathBuf>,
    ) -> Self {
        self.local_store = local.into();
        self.remote_store = remote.into();
        self.lock_store = lock.into();
        self.change_log_store = change_log.into();
        self
    }

    /// Is `table` one of the configured tables (ignoring case)?
    pub fn syncs_table(&self, table: &str) -> bool {
        self.tables_to_sync
            .iter()
            .any(|t| t.eq_ignore_ascii_case(table))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::new(["Items", "Orders"]);
        assert_eq!(config.primary_key_column, "ID");
        assert_eq!(config.last_modified_column, "LastModified");
        assert_eq!(config.is_deleted_column, "IsDeleted");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay, Duration::from_secs(1));
        assert_eq!(config.lock_wait, Duration::from_secs(120));
        assert_eq!(config.lock_lease, Duration::from_secs(300));
    }

    #[test]
    fn test_syncs_table_case_insensitive() {
        let config = SyncConfig::new(["Items"]);
        assert!(config.syncs_table("ITEMS"));
        assert!(!config.syncs_table("Orders"));
    }
}
