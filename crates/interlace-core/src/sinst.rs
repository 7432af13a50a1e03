//! Shared-instruction tracking.
//!
//! An instruction is *shared* once it has been observed touching the same
//! unit-aligned address from more than one thread. The active scheduler
//! and the observer use the shared set to cheaply reject program points
//! that can never participate in a cross-thread interleaving.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::static_info::InstId;
use crate::types::{Address, ThreadId, unit_addrs};

#[derive(Debug, Default, Serialize, Deserialize)]
struct SharedInstTables {
    shared: HashSet<InstId>,
}

/// Persistent set of shared instructions.
#[derive(Debug, Default)]
pub struct SharedInstDB {
    tables: Mutex<SharedInstTables>,
}

impl SharedInstDB {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(&self, inst: InstId) -> bool {
        self.tables.lock().unwrap().shared.contains(&inst)
    }

    pub fn set_shared(&self, inst: InstId) {
        self.tables.lock().unwrap().shared.insert(inst);
    }

    pub fn len(&self) -> usize {
        self.tables.lock().unwrap().shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let loaded: SharedInstTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}

/// Last access seen at a unit address, kept until a second thread shows up.
#[derive(Debug, Clone, Copy)]
struct LastTouch {
    thd_id: ThreadId,
    inst: InstId,
}

/// Online analyzer that feeds the shared-inst database.
pub struct SharedInstAnalyzer {
    db: Arc<SharedInstDB>,
    unit_size: u64,
    state: Mutex<HashMap<Address, LastTouch>>,
    regions: Mutex<HashMap<Address, u64>>,
}

impl SharedInstAnalyzer {
    pub fn new(db: Arc<SharedInstDB>, unit_size: u64) -> Self {
        Self {
            db,
            unit_size,
            state: Mutex::new(HashMap::new()),
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// Process one memory access; marks both the current and the previous
    /// instruction shared when the address crosses threads.
    pub fn access(&self, thd_id: ThreadId, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock().unwrap();
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            match state.get_mut(&iaddr) {
                Some(last) if last.thd_id != thd_id => {
                    self.db.set_shared(last.inst);
                    self.db.set_shared(inst);
                    *last = LastTouch { thd_id, inst };
                }
                Some(last) => {
                    last.inst = inst;
                }
                None => {
                    state.insert(iaddr, LastTouch { thd_id, inst });
                }
            }
        }
    }

    /// Forget state inside a freed region.
    pub fn free_region(&self, addr: Address, size: u64) {
        if size == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            state.remove(&iaddr);
        }
    }
}

impl crate::event::Analyzer for SharedInstAnalyzer {
    fn before_mem_read(
        &self,
        thd_id: ThreadId,
        _thd_clk: u64,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
        self.access(thd_id, inst, addr, size);
    }

    fn before_mem_write(
        &self,
        thd_id: ThreadId,
        _thd_clk: u64,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
        self.access(thd_id, inst, addr, size);
    }

    fn after_malloc(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, size: u64, addr: Address) {
        self.regions.lock().unwrap().insert(addr, size);
    }

    fn after_calloc(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, nmemb: u64, size: u64, addr: Address) {
        self.regions.lock().unwrap().insert(addr, nmemb * size);
    }

    fn after_realloc(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, _ori_addr: Address, size: u64, new_addr: Address) {
        self.regions.lock().unwrap().insert(new_addr, size);
    }

    fn after_valloc(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, size: u64, addr: Address) {
        self.regions.lock().unwrap().insert(addr, size);
    }

    fn before_realloc(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, ori_addr: Address, _size: u64) {
        let size = self.regions.lock().unwrap().remove(&ori_addr).unwrap_or(0);
        self.free_region(ori_addr, size);
    }

    fn before_free(&self, _thd_id: ThreadId, _thd_clk: u64, _inst: InstId, addr: Address) {
        let size = self.regions.lock().unwrap().remove(&addr).unwrap_or(0);
        self.free_region(addr, size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_thread_never_shared() {
        let db = Arc::new(SharedInstDB::new());
        let an = SharedInstAnalyzer::new(Arc::clone(&db), 4);
        an.access(0, 10, 0x100, 4);
        an.access(0, 11, 0x100, 4);
        assert!(db.is_empty());
    }

    #[test]
    fn cross_thread_marks_both_insts() {
        let db = Arc::new(SharedInstDB::new());
        let an = SharedInstAnalyzer::new(Arc::clone(&db), 4);
        an.access(0, 10, 0x100, 4);
        an.access(1, 20, 0x100, 4);
        assert!(db.shared(10));
        assert!(db.shared(20));
        assert_eq!(db.len(), 2);
    }

    #[test]
    fn distinct_addresses_do_not_mix() {
        let db = Arc::new(SharedInstDB::new());
        let an = SharedInstAnalyzer::new(Arc::clone(&db), 4);
        an.access(0, 10, 0x100, 4);
        an.access(1, 20, 0x200, 4);
        assert!(db.is_empty());
    }

    #[test]
    fn freed_region_forgets() {
        let db = Arc::new(SharedInstDB::new());
        let an = SharedInstAnalyzer::new(Arc::clone(&db), 4);
        an.access(0, 10, 0x100, 4);
        an.free_region(0x100, 4);
        an.access(1, 20, 0x100, 4);
        assert!(db.is_empty());
    }

    #[test]
    fn persistence_round_trip() {
        let db = SharedInstDB::new();
        db.set_shared(42);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sinst.db");
        db.save(&path).unwrap();

        let db2 = SharedInstDB::new();
        db2.load(&path).unwrap();
        assert!(db2.shared(42));
        assert_eq!(db2.len(), 1);
    }
}
