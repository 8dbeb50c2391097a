//! Per-group accounting and narrative logging.
//!
//! The accounting document maps file names to context counts (or an
//! explicit error marker) and must be well-formed JSON at every instant,
//! including after an abrupt interruption. Every update rewrites the
//! document atomically, and a `Drop` guard finalizes any pending state on
//! all exit paths — success, error, and cancellation alike.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use codevec_shared::{
    ACCOUNTING_FILE_NAME, CodevecError, ContextCount, GROUP_LOG_FILE_NAME, Result,
};

// ---------------------------------------------------------------------------
// GroupAccounting
// ---------------------------------------------------------------------------

/// Crash-safe accounting for one group.
pub struct GroupAccounting {
    path: PathBuf,
    entries: BTreeMap<String, ContextCount>,
    dirty: bool,
}

impl GroupAccounting {
    /// Open the group's accounting document, merging entries from a
    /// previous run so resumed groups keep their recorded counts.
    pub fn open(output_root: &Path, group: &str) -> Result<Self> {
        let dir = output_root.join(group).join("c2v");
        std::fs::create_dir_all(&dir).map_err(|e| CodevecError::io(&dir, e))?;
        let path = dir.join(ACCOUNTING_FILE_NAME);

        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "unreadable accounting, starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };

        Ok(Self {
            path,
            entries,
            dirty: false,
        })
    }

    /// Record one file's outcome and persist the document atomically.
    pub fn record(&mut self, name: &str, value: ContextCount) -> Result<()> {
        self.entries.insert(name.to_string(), value);
        self.dirty = true;
        self.write()
    }

    pub fn entries(&self) -> &BTreeMap<String, ContextCount> {
        &self.entries
    }

    /// Guarded completion step: persist any pending state.
    pub fn finalize(&mut self) -> Result<()> {
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }

    fn write(&mut self) -> Result<()> {
        let json = serde_json::to_vec_pretty(&self.entries)
            .map_err(|e| CodevecError::Failure(format!("accounting serialization: {e}")))?;
        atomic_write(&self.path, &json)?;
        self.dirty = false;
        debug!(path = %self.path.display(), entries = self.entries.len(), "accounting written");
        Ok(())
    }
}

impl Drop for GroupAccounting {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!(path = %self.path.display(), error = %e, "accounting finalization failed");
        }
    }
}

/// Write via temp file + rename so the document is complete at every
/// instant.
fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| CodevecError::Failure(format!("no parent for {}", path.display())))?;
    let tmp = parent.join(format!(".tmp-{}", uuid::Uuid::now_v7()));
    std::fs::write(&tmp, content).map_err(|e| CodevecError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| CodevecError::io(path, e))
}

// ---------------------------------------------------------------------------
// GroupLog
// ---------------------------------------------------------------------------

/// Append-only narrative log for one group (`<group>/process.log`).
pub struct GroupLog {
    path: PathBuf,
}

impl GroupLog {
    pub fn open(output_root: &Path, group: &str) -> Result<Self> {
        let dir = output_root.join(group);
        std::fs::create_dir_all(&dir).map_err(|e| CodevecError::io(&dir, e))?;
        Ok(Self {
            path: dir.join(GROUP_LOG_FILE_NAME),
        })
    }

    /// Append one timestamped line; failures are logged, never propagated —
    /// the narrative log must not fail a unit.
    pub fn line(&self, message: &str) {
        let stamped = format!("[{}] {message}\n", chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S"));
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| f.write_all(stamped.as_bytes()));
        if let Err(e) = result {
            warn!(path = %self.path.display(), error = %e, "failed to append narrative log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn temp_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("codevec-acct-{}", uuid::Uuid::now_v7()));
        fs::create_dir_all(&root).unwrap();
        root
    }

    #[test]
    fn every_update_leaves_wellformed_json() {
        let root = temp_root();
        let mut acct = GroupAccounting::open(&root, "grp").unwrap();

        acct.record("unit_a", ContextCount::Count(12)).unwrap();
        let path = root.join("grp/c2v").join(ACCOUNTING_FILE_NAME);
        let parsed: BTreeMap<String, ContextCount> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.get("unit_a"), Some(&ContextCount::Count(12)));

        acct.record("unit_b", ContextCount::Error).unwrap();
        let parsed: BTreeMap<String, ContextCount> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("unit_b"), Some(&ContextCount::Error));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn reopen_merges_previous_entries() {
        let root = temp_root();
        {
            let mut acct = GroupAccounting::open(&root, "grp").unwrap();
            acct.record("unit_a", ContextCount::Count(7)).unwrap();
        }
        {
            let mut acct = GroupAccounting::open(&root, "grp").unwrap();
            assert_eq!(acct.entries().len(), 1);
            acct.record("unit_b", ContextCount::Count(3)).unwrap();
            assert_eq!(acct.entries().len(), 2);
        }

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn drop_guard_tolerates_abrupt_exit() {
        let root = temp_root();
        {
            let mut acct = GroupAccounting::open(&root, "grp").unwrap();
            acct.record("unit_a", ContextCount::Count(1)).unwrap();
            // Simulate an interruption: the guard finalizes on drop.
        }
        let path = root.join("grp/c2v").join(ACCOUNTING_FILE_NAME);
        let content = fs::read_to_string(&path).unwrap();
        assert!(serde_json::from_str::<serde_json::Value>(&content).is_ok());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn corrupt_accounting_starts_fresh() {
        let root = temp_root();
        let dir = root.join("grp/c2v");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(ACCOUNTING_FILE_NAME), "{ not json").unwrap();

        let acct = GroupAccounting::open(&root, "grp").unwrap();
        assert!(acct.entries().is_empty());

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn group_log_appends_lines() {
        let root = temp_root();
        let log = GroupLog::open(&root, "grp").unwrap();
        log.line("[ok] unit_a: 12 contexts");
        log.line("[fail] unit_b: extract_failed");

        let content = fs::read_to_string(root.join("grp").join(GROUP_LOG_FILE_NAME)).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("unit_b: extract_failed"));

        let _ = fs::remove_dir_all(&root);
    }
}
