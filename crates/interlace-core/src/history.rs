//! Active-test history.
//!
//! Persists run counts and outcomes per target iRoot across process
//! invocations. Separate from the memoization database because explicit
//! `target_iroot` runs bypass memo bookkeeping but still need run parity
//! for the priority-pool direction.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::iroot::IRootId;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestRecord {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HistoryTables {
    records: BTreeMap<IRootId, TestRecord>,
}

/// Per-iroot test history, persisted to `test.histo`.
#[derive(Debug, Default)]
pub struct TestHistory {
    tables: Mutex<HistoryTables>,
}

impl TestHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, iroot: IRootId) {
        let mut t = self.tables.lock().unwrap();
        let r = t.records.entry(iroot).or_default();
        r.runs += 1;
        r.successes += 1;
    }

    pub fn record_failure(&self, iroot: IRootId) {
        let mut t = self.tables.lock().unwrap();
        let r = t.records.entry(iroot).or_default();
        r.runs += 1;
        r.failures += 1;
    }

    pub fn total_test_runs(&self, iroot: IRootId) -> u64 {
        self.tables
            .lock()
            .unwrap()
            .records
            .get(&iroot)
            .map(|r| r.runs)
            .unwrap_or(0)
    }

    pub fn record(&self, iroot: IRootId) -> Option<TestRecord> {
        self.tables.lock().unwrap().records.get(&iroot).cloned()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let loaded: HistoryTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_accumulate() {
        let h = TestHistory::new();
        h.record_failure(1);
        h.record_failure(1);
        h.record_success(1);
        let r = h.record(1).unwrap();
        assert_eq!(r.runs, 3);
        assert_eq!(r.successes, 1);
        assert_eq!(r.failures, 2);
        assert_eq!(h.total_test_runs(2), 0);
    }

    #[test]
    fn persistence_round_trip() {
        let h = TestHistory::new();
        h.record_success(7);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.histo");
        h.save(&path).unwrap();

        let h2 = TestHistory::new();
        h2.load(&path).unwrap();
        assert_eq!(h2.total_test_runs(7), 1);
    }
}
