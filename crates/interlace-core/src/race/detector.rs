//! Happens-before data race detection.
//!
//! Per-thread vector clocks advance on synchronization; per-address meta
//! keeps the clocks and instructions of the latest writers and readers.
//! A read or write that is not ordered after every recorded conflicting
//! access reports one race per offending thread.
//!
//! Synchronization objects are discriminated by which table their address
//! lives in: mutexes carry one release clock, condition variables a
//! wait/signal table pair, barriers two alternating flagged tables so
//! consecutive barrier rounds stay isolated.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::config::RuntimeContext;
use crate::event::Analyzer;
use crate::filter::RegionFilter;
use crate::race::db::{RaceDB, RaceEventType};
use crate::static_info::InstId;
use crate::types::{Address, ThreadId, Timestamp, INVALID_THREAD_ID, unit_addrs, unit_down_align};
use crate::vector_clock::VectorClock;

/// Memory-location meta: latest writer/reader clocks and instructions.
#[derive(Debug, Default)]
struct MemMeta {
    racy: bool,
    writer_vc: VectorClock,
    writer_inst: HashMap<ThreadId, InstId>,
    reader_vc: VectorClock,
    reader_inst: HashMap<ThreadId, InstId>,
    inst_set: HashSet<InstId>,
}

/// Mutex meta: the clock released at the last unlock.
#[derive(Debug, Default)]
struct MutexMeta {
    vc: VectorClock,
}

/// Condition-variable meta.
#[derive(Debug, Default)]
struct CondMeta {
    wait_table: HashMap<ThreadId, VectorClock>,
    signal_table: HashMap<ThreadId, VectorClock>,
}

/// Barrier meta: two wait tables alternate between rounds.
#[derive(Debug)]
struct BarrierMeta {
    wait_table1: HashMap<ThreadId, (VectorClock, bool)>,
    wait_table2: HashMap<ThreadId, (VectorClock, bool)>,
    pre_using_table1: bool,
    post_using_table1: bool,
}

impl Default for BarrierMeta {
    fn default() -> Self {
        Self {
            wait_table1: HashMap::new(),
            wait_table2: HashMap::new(),
            pre_using_table1: true,
            post_using_table1: true,
        }
    }
}

#[derive(Debug, Default)]
struct DetectorState {
    filter: RegionFilter,
    curr_vc: HashMap<ThreadId, VectorClock>,
    atomic: HashMap<ThreadId, bool>,
    mem_meta: HashMap<Address, MemMeta>,
    mutex_meta: HashMap<Address, MutexMeta>,
    cond_meta: HashMap<Address, CondMeta>,
    barrier_meta: HashMap<Address, BarrierMeta>,
}

/// Happens-before race detector over the instrumented event stream.
pub struct RaceDetector {
    race_db: Arc<RaceDB>,
    unit_size: u64,
    track_racy_inst: bool,
    state: Mutex<DetectorState>,
    ctx: RuntimeContext,
}

impl RaceDetector {
    pub fn new(ctx: RuntimeContext, race_db: Arc<RaceDB>) -> Self {
        Self {
            race_db,
            unit_size: ctx.config.unit_size,
            track_racy_inst: ctx.config.track_racy_inst,
            state: Mutex::new(DetectorState::default()),
            ctx,
        }
    }

    fn alloc_region(&self, addr: Address, size: u64) {
        if addr == 0 || size == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        state.filter.add_region(addr, size);
    }

    fn free_region(&self, addr: Address) {
        if addr == 0 {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let size = state.filter.remove_region(addr);
        if size == 0 {
            return;
        }
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            if let Some(meta) = state.mem_meta.remove(&iaddr) {
                self.flush_racy_insts(&meta);
            }
            state.mutex_meta.remove(&iaddr);
            state.cond_meta.remove(&iaddr);
            state.barrier_meta.remove(&iaddr);
        }
    }

    fn flush_racy_insts(&self, meta: &MemMeta) {
        if self.track_racy_inst && meta.racy {
            for &inst in &meta.inst_set {
                self.race_db.set_racy_inst(inst);
            }
        }
    }

    fn process_read(&self, state: &mut DetectorState, thd_id: ThreadId, iaddr: Address, inst: InstId) {
        let curr_vc = state.curr_vc.get(&thd_id).cloned().unwrap_or_default();
        let meta = state.mem_meta.entry(iaddr).or_default();
        if !meta.writer_vc.happens_before(&curr_vc) {
            debug!("RAW race detected at 0x{iaddr:x} [T{thd_id:x}]");
            meta.racy = true;
            for (w, clk) in meta.writer_vc.iter() {
                if w != thd_id && clk > curr_vc.get(w) {
                    let writer_inst = meta.writer_inst[&w];
                    self.race_db.create_race(
                        iaddr,
                        w,
                        writer_inst,
                        RaceEventType::Write,
                        thd_id,
                        inst,
                        RaceEventType::Read,
                    );
                    self.ctx.stat.inc("race_raw", 1);
                }
            }
        }
        meta.reader_vc.set(thd_id, curr_vc.get(thd_id));
        meta.reader_inst.insert(thd_id, inst);
        if self.track_racy_inst {
            meta.inst_set.insert(inst);
        }
    }

    fn process_write(&self, state: &mut DetectorState, thd_id: ThreadId, iaddr: Address, inst: InstId) {
        let curr_vc = state.curr_vc.get(&thd_id).cloned().unwrap_or_default();
        let meta = state.mem_meta.entry(iaddr).or_default();
        if !meta.writer_vc.happens_before(&curr_vc) {
            debug!("WAW race detected at 0x{iaddr:x} [T{thd_id:x}]");
            meta.racy = true;
            for (w, clk) in meta.writer_vc.iter() {
                if w != thd_id && clk > curr_vc.get(w) {
                    let writer_inst = meta.writer_inst[&w];
                    self.race_db.create_race(
                        iaddr,
                        w,
                        writer_inst,
                        RaceEventType::Write,
                        thd_id,
                        inst,
                        RaceEventType::Write,
                    );
                    self.ctx.stat.inc("race_waw", 1);
                }
            }
        }
        if !meta.reader_vc.happens_before(&curr_vc) {
            debug!("WAR race detected at 0x{iaddr:x} [T{thd_id:x}]");
            meta.racy = true;
            for (r, clk) in meta.reader_vc.iter() {
                if r != thd_id && clk > curr_vc.get(r) {
                    let reader_inst = meta.reader_inst[&r];
                    self.race_db.create_race(
                        iaddr,
                        r,
                        reader_inst,
                        RaceEventType::Read,
                        thd_id,
                        inst,
                        RaceEventType::Write,
                    );
                    self.ctx.stat.inc("race_war", 1);
                }
            }
        }
        meta.writer_vc.set(thd_id, curr_vc.get(thd_id));
        meta.writer_inst.insert(thd_id, inst);
        if self.track_racy_inst {
            meta.inst_set.insert(inst);
        }
    }

    fn process_lock(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let mutex_vc = state.mutex_meta.entry(addr).or_default().vc.clone();
        let curr_vc = state.curr_vc.entry(thd_id).or_default();
        curr_vc.join(&mutex_vc);
    }

    fn process_unlock(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let curr_vc = state.curr_vc.entry(thd_id).or_default();
        let released = curr_vc.clone();
        curr_vc.increment(thd_id);
        state.mutex_meta.entry(addr).or_default().vc = released;
    }

    fn process_notify(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let meta = state.cond_meta.entry(addr).or_default();
        let curr_vc = state.curr_vc.entry(thd_id).or_default();
        for vc in meta.wait_table.values() {
            curr_vc.join(vc);
        }
        let waiters: Vec<ThreadId> = meta.wait_table.keys().copied().collect();
        for waiter in waiters {
            meta.signal_table.insert(waiter, curr_vc.clone());
        }
        curr_vc.increment(thd_id);
    }

    fn process_pre_wait(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let curr_vc = state.curr_vc.entry(thd_id).or_default();
        let snapshot = curr_vc.clone();
        curr_vc.increment(thd_id);
        state.cond_meta.entry(addr).or_default().wait_table.insert(thd_id, snapshot);
    }

    fn process_post_wait(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let meta = state.cond_meta.entry(addr).or_default();
        meta.wait_table.remove(&thd_id);
        // a timed wait can return without any signal having happened
        if let Some(signal_vc) = meta.signal_table.remove(&thd_id) {
            state.curr_vc.entry(thd_id).or_default().join(&signal_vc);
        }
    }

    fn process_pre_barrier(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let curr_vc = state.curr_vc.entry(thd_id).or_default().clone();
        let meta = state.barrier_meta.entry(addr).or_default();
        let table = if meta.pre_using_table1 {
            &mut meta.wait_table1
        } else {
            &mut meta.wait_table2
        };
        table.insert(thd_id, (curr_vc, false));
    }

    fn process_post_barrier(&self, state: &mut DetectorState, thd_id: ThreadId, addr: Address) {
        let DetectorState {
            curr_vc, barrier_meta, ..
        } = &mut *state;
        let curr_vc = curr_vc.entry(thd_id).or_default();
        let meta = barrier_meta.entry(addr).or_default();
        let table = if meta.post_using_table1 {
            &mut meta.wait_table1
        } else {
            &mut meta.wait_table2
        };
        let mut all_flagged = true;
        let mut all_not_flagged = true;
        for (&entry_thd, entry) in table.iter_mut() {
            if entry_thd == thd_id {
                debug_assert!(!entry.1);
                entry.1 = true;
            } else if entry.1 {
                all_not_flagged = false;
            } else {
                all_flagged = false;
            }
            curr_vc.join(&entry.0);
        }
        curr_vc.increment(thd_id);
        if all_not_flagged {
            meta.pre_using_table1 = !meta.pre_using_table1;
        }
        if all_flagged {
            table.clear();
            meta.post_using_table1 = !meta.post_using_table1;
        }
    }

    fn in_atomic(&self, state: &DetectorState, thd_id: ThreadId) -> bool {
        state.atomic.get(&thd_id).copied().unwrap_or(false)
    }

    /// Current clock of a thread, for tests and diagnostics.
    pub fn thread_clock(&self, thd_id: ThreadId) -> VectorClock {
        self.state
            .lock()
            .unwrap()
            .curr_vc
            .get(&thd_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl Analyzer for RaceDetector {
    fn thread_start(&self, thd_id: ThreadId, parent_thd_id: ThreadId) {
        let mut state = self.state.lock().unwrap();
        let mut vc = VectorClock::new();
        vc.increment(thd_id);
        if parent_thd_id != INVALID_THREAD_ID {
            if let Some(parent_vc) = state.curr_vc.get_mut(&parent_thd_id) {
                vc.join(parent_vc);
                parent_vc.increment(parent_thd_id);
            }
        }
        state.curr_vc.insert(thd_id, vc);
        state.atomic.insert(thd_id, false);
    }

    fn before_mem_read(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock().unwrap();
        if state.filter.filter(addr) || self.in_atomic(&state, thd_id) {
            return;
        }
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            self.process_read(&mut state, thd_id, iaddr, inst);
        }
    }

    fn before_mem_write(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        let mut state = self.state.lock().unwrap();
        if state.filter.filter(addr) || self.in_atomic(&state, thd_id) {
            return;
        }
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            self.process_write(&mut state, thd_id, iaddr, inst);
        }
    }

    fn after_mutex_lock(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        let addr = unit_down_align(addr, self.unit_size);
        self.process_lock(&mut state, thd_id, addr);
    }

    fn before_mutex_unlock(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        let addr = unit_down_align(addr, self.unit_size);
        self.process_unlock(&mut state, thd_id, addr);
    }

    fn before_cond_signal(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        self.process_notify(&mut state, thd_id, unit_down_align(addr, self.unit_size));
    }

    fn before_cond_broadcast(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        self.process_notify(&mut state, thd_id, unit_down_align(addr, self.unit_size));
    }

    fn before_cond_wait(
        &self,
        thd_id: ThreadId,
        _thd_clk: Timestamp,
        _inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock().unwrap();
        self.process_unlock(&mut state, thd_id, unit_down_align(mutex_addr, self.unit_size));
        self.process_pre_wait(&mut state, thd_id, unit_down_align(cond_addr, self.unit_size));
    }

    fn after_cond_wait(
        &self,
        thd_id: ThreadId,
        _thd_clk: Timestamp,
        _inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        let mut state = self.state.lock().unwrap();
        self.process_post_wait(&mut state, thd_id, unit_down_align(cond_addr, self.unit_size));
        self.process_lock(&mut state, thd_id, unit_down_align(mutex_addr, self.unit_size));
    }

    fn before_cond_timedwait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.before_cond_wait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
    }

    fn after_cond_timedwait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
        self.after_cond_wait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
    }

    fn before_barrier_wait(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        self.process_pre_barrier(&mut state, thd_id, unit_down_align(addr, self.unit_size));
    }

    fn after_barrier_wait(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        self.process_post_barrier(&mut state, thd_id, unit_down_align(addr, self.unit_size));
    }

    fn after_join(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, child: ThreadId) {
        let mut state = self.state.lock().unwrap();
        let child_vc = state.curr_vc.get(&child).cloned().unwrap_or_default();
        state.curr_vc.entry(thd_id).or_default().join(&child_vc);
    }

    fn before_atomic_inst(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, _addr: Address) {
        self.state.lock().unwrap().atomic.insert(thd_id, true);
    }

    fn after_atomic_inst(&self, thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, _addr: Address) {
        self.state.lock().unwrap().atomic.insert(thd_id, false);
    }

    fn image_load(&self, _image_id: u32, data_start: Address, data_size: u64, bss_start: Address, bss_size: u64) {
        if data_start != 0 {
            self.alloc_region(data_start, data_size);
        }
        if bss_start != 0 {
            self.alloc_region(bss_start, bss_size);
        }
    }

    fn image_unload(&self, _image_id: u32, data_start: Address, bss_start: Address) {
        if data_start != 0 {
            self.free_region(data_start);
        }
        if bss_start != 0 {
            self.free_region(bss_start);
        }
    }

    fn after_malloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, size: u64, addr: Address) {
        self.alloc_region(addr, size);
    }

    fn after_calloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, nmemb: u64, size: u64, addr: Address) {
        self.alloc_region(addr, nmemb * size);
    }

    fn before_realloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, ori_addr: Address, _size: u64) {
        self.free_region(ori_addr);
    }

    fn after_realloc(
        &self,
        _thd_id: ThreadId,
        _thd_clk: Timestamp,
        _inst: InstId,
        _ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
        self.alloc_region(new_addr, size);
    }

    fn after_valloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, size: u64, addr: Address) {
        self.alloc_region(addr, size);
    }

    fn before_free(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        self.free_region(addr);
    }

    fn program_exit(&self) {
        // flush racy-inst sets for still-live regions
        if self.track_racy_inst {
            let state = self.state.lock().unwrap();
            for meta in state.mem_meta.values() {
                self.flush_racy_insts(meta);
            }
        }
    }
}
