//! iRoot observation.
//!
//! Consumes the event stream and derives candidate iRoots of all five
//! idiom shapes. Per-address meta remembers the last writer and the last
//! valid access per thread; per-thread recent-info windows remember the
//! accesses of the last *VW* instructions together with their observed
//! cross-thread successors, which is what the complex-idiom search walks.
//!
//! Condition-wait events count as an unlock of the associated mutex on
//! entry and a lock on exit, so lock-protected regions stay paired.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use log::warn;

use crate::config::RuntimeContext;
use crate::event::Analyzer;
use crate::filter::RegionFilter;
use crate::iroot::{IRootDB, IRootEventType, IdiomType};
use crate::memo::Memo;
use crate::static_info::InstId;
use crate::types::{Address, ThreadId, Timestamp, time_distance, unit_addrs, unit_down_align};

/// One dynamic access. `uid` is process-unique and monotonic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acc {
    pub uid: u64,
    pub thd_id: ThreadId,
    pub thd_clk: Timestamp,
    pub event_type: IRootEventType,
    pub inst: InstId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MetaKind {
    Mem,
    Mutex,
}

#[derive(Debug, Clone, Copy)]
struct LastAcc {
    valid: bool,
    acc: Acc,
}

/// Per-address meta. Identity is the unit-aligned address itself.
#[derive(Debug)]
struct Meta {
    kind: MetaKind,
    last_writer: Option<Acc>,
    last_acc_table: HashMap<ThreadId, LastAcc>,
}

impl Meta {
    fn new(kind: MetaKind) -> Self {
        Self {
            kind,
            last_writer: None,
            last_acc_table: HashMap::new(),
        }
    }
}

/// Recent-info entry: an access, the meta it touched, and the remote
/// successors observed to depend on it (with the local predecessors each
/// successor had at that time).
#[derive(Debug)]
struct RiEntry {
    acc: Acc,
    meta_addr: Address,
    succs: Vec<Acc>,
    succ_prevs: Vec<Vec<Acc>>,
}

#[derive(Debug, Default)]
struct RecentInfo {
    entries: VecDeque<RiEntry>,
    curr_thd_clk: Timestamp,
}

#[derive(Debug, Default)]
struct ObserverState {
    filter: RegionFilter,
    meta_table: HashMap<Address, Meta>,
    ri_table: HashMap<ThreadId, RecentInfo>,
    next_uid: u64,
}

/// The iRoot observer. Never fatal: impossible states are logged and
/// skipped.
pub struct Observer {
    iroot_db: Arc<IRootDB>,
    memo: Arc<Memo>,
    shadow: bool,
    sync_only: bool,
    complex_idioms: bool,
    single_var_idioms: bool,
    unit_size: u64,
    vw: u64,
    queue_limit: usize,
    state: Mutex<ObserverState>,
    ctx: RuntimeContext,
}

/// Event-type pairs allowed to be consecutive within one thread.
fn local_pair_valid(prev: IRootEventType, curr: IRootEventType) -> bool {
    use IRootEventType::*;
    matches!(
        (prev, curr),
        (MemRead, MemRead)
            | (MemRead, MemWrite)
            | (MemWrite, MemRead)
            | (MemWrite, MemWrite)
            | (MutexUnlock, MutexLock)
    )
}

impl Observer {
    pub fn new(ctx: RuntimeContext, iroot_db: Arc<IRootDB>, memo: Arc<Memo>) -> Self {
        let cfg = &ctx.config;
        Self {
            iroot_db,
            memo,
            shadow: cfg.shadow_observer,
            sync_only: cfg.sync_only,
            complex_idioms: cfg.complex_idioms,
            single_var_idioms: cfg.single_var_idioms,
            unit_size: cfg.unit_size,
            vw: cfg.vw,
            queue_limit: cfg.queue_limit,
            state: Mutex::new(ObserverState::default()),
            ctx: ctx.clone(),
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
            // per-unit meta inside the region is dropped with its access
            // history; recent-info keeps only the stable address identity
            state.meta_table.remove(&iaddr);
        }
    }

    fn handle_mem(&self, thd_id: ThreadId, thd_clk: Timestamp, event_type: IRootEventType, inst: InstId, addr: Address, size: u64) {
        if self.sync_only {
            return;
        }
        let mut state = self.state.lock().unwrap();
        if state.filter.filter(addr) {
            return;
        }
        for iaddr in unit_addrs(addr, size, self.unit_size) {
            // an address already known as a sync variable is ignored
            match state.meta_table.get(&iaddr).map(|m| m.kind) {
                Some(MetaKind::Mutex) => continue,
                Some(MetaKind::Mem) => {}
                None => {
                    state.meta_table.insert(iaddr, Meta::new(MetaKind::Mem));
                }
            }
            self.process_iroot_event(&mut state, thd_id, thd_clk, event_type, inst, iaddr);
        }
    }

    fn handle_sync(&self, thd_id: ThreadId, thd_clk: Timestamp, event_type: IRootEventType, inst: InstId, addr: Address) {
        let mut state = self.state.lock().unwrap();
        let iaddr = unit_down_align(addr, self.unit_size);
        match state.meta_table.get(&iaddr).map(|m| m.kind) {
            Some(MetaKind::Mutex) => {}
            Some(MetaKind::Mem) => {
                // a location first seen as plain memory turned out to be a
                // mutex; restart its history under the new kind
                warn!("meta at 0x{iaddr:x} changed from mem to mutex");
                state.meta_table.insert(iaddr, Meta::new(MetaKind::Mutex));
            }
            None => {
                state.meta_table.insert(iaddr, Meta::new(MetaKind::Mutex));
            }
        }
        self.process_iroot_event(&mut state, thd_id, thd_clk, event_type, inst, iaddr);
    }

    fn process_iroot_event(
        &self,
        state: &mut ObserverState,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        event_type: IRootEventType,
        inst: InstId,
        meta_addr: Address,
    ) {
        let curr_acc = Acc {
            uid: {
                state.next_uid += 1;
                state.next_uid
            },
            thd_id,
            thd_clk,
            event_type,
            inst,
        };

        // discover the cross-thread predecessors of this access
        let mut preds: Vec<Acc> = Vec::new();
        let meta = state
            .meta_table
            .get(&meta_addr)
            .expect("meta created by caller");
        if event_type.is_read() {
            // read-after-write, unless a valid local read already covers it
            if let Some(last_writer) = meta.last_writer {
                if last_writer.thd_id != thd_id {
                    let local_read_exists = meta
                        .last_acc_table
                        .get(&thd_id)
                        .map(|l| l.valid)
                        .unwrap_or(false);
                    if !local_read_exists {
                        preds.push(last_writer);
                    }
                }
            }
        } else {
            // write-after-read against every valid reader; fall back to
            // write-after-write when no reader exists at all
            let mut war_exist = false;
            for (&t, last) in &meta.last_acc_table {
                if last.valid {
                    if t != thd_id {
                        preds.push(last.acc);
                    }
                    war_exist = true;
                }
            }
            if !war_exist {
                if let Some(last_writer) = meta.last_writer {
                    if last_writer.thd_id != thd_id {
                        preds.push(last_writer);
                    }
                }
            }
        }

        self.update_iroot(&curr_acc, &preds);

        if self.complex_idioms {
            self.process_recent_info(state, &curr_acc, meta_addr, &preds);
        }

        // update meta
        let meta = state
            .meta_table
            .get_mut(&meta_addr)
            .expect("meta created by caller");
        if event_type.is_read() {
            meta.last_acc_table
                .insert(thd_id, LastAcc { valid: true, acc: curr_acc });
        } else {
            for last in meta.last_acc_table.values_mut() {
                last.valid = false;
            }
            meta.last_acc_table
                .insert(thd_id, LastAcc { valid: false, acc: curr_acc });
            meta.last_writer = Some(curr_acc);
        }
    }

    /// Record one idiom-1 iRoot per discovered predecessor.
    fn update_iroot(&self, curr_acc: &Acc, preds: &[Acc]) {
        for pred in preds {
            let pred_event = self.iroot_db.get_iroot_event(pred.inst, pred.event_type);
            let curr_event = self.iroot_db.get_iroot_event(curr_acc.inst, curr_acc.event_type);
            let iroot = self.iroot_db.get_iroot(IdiomType::Idiom1, &[pred_event, curr_event]);
            self.memo.observed(iroot, self.shadow);
            self.ctx.stat.inc("ob_dynamic_deps", 1);
        }
    }

    fn process_recent_info(
        &self,
        state: &mut ObserverState,
        curr_acc: &Acc,
        curr_meta_addr: Address,
        preds: &[Acc],
    ) {
        if !preds.is_empty() {
            // local predecessors selected by the backward scan
            let mut prevs: Vec<Acc> = Vec::new();

            if let Some(curr_ri) = state.ri_table.get(&curr_acc.thd_id) {
                if self.single_var_idioms {
                    // only the newest entry on the current location counts
                    for entry in curr_ri.entries.iter().rev() {
                        if time_distance(entry.acc.thd_clk, curr_acc.thd_clk) >= self.vw {
                            break;
                        }
                        if entry.meta_addr == curr_meta_addr {
                            if local_pair_valid(entry.acc.event_type, curr_acc.event_type) {
                                self.update_complex_iroot(curr_acc, curr_meta_addr, preds, entry);
                            }
                            prevs.push(entry.acc);
                            break;
                        }
                    }
                } else {
                    // each distinct location at most once, newest first,
                    // stopping at the first occurrence of the current one
                    let mut visited_meta: HashSet<Address> = HashSet::new();
                    for entry in curr_ri.entries.iter().rev() {
                        if time_distance(entry.acc.thd_clk, curr_acc.thd_clk) >= self.vw {
                            break;
                        }
                        if !visited_meta.insert(entry.meta_addr) {
                            continue;
                        }
                        if local_pair_valid(entry.acc.event_type, curr_acc.event_type) {
                            self.update_complex_iroot(curr_acc, curr_meta_addr, preds, entry);
                        }
                        prevs.push(entry.acc);
                        if entry.meta_addr == curr_meta_addr {
                            break;
                        }
                    }
                }
            }

            // register this access as a successor of each predecessor, in
            // the predecessor thread's recent info
            for pred in preds {
                if let Some(rmt_ri) = state.ri_table.get_mut(&pred.thd_id) {
                    let rmt_clk = rmt_ri.curr_thd_clk;
                    for entry in rmt_ri.entries.iter_mut().rev() {
                        if time_distance(entry.acc.thd_clk, rmt_clk) >= self.vw {
                            break;
                        }
                        if entry.acc.uid == pred.uid {
                            entry.succs.push(*curr_acc);
                            entry.succ_prevs.push(prevs.clone());
                            break;
                        }
                    }
                }
            }
        }

        // append the current access to this thread's recent info
        let curr_ri = state.ri_table.entry(curr_acc.thd_id).or_default();
        curr_ri.entries.push_back(RiEntry {
            acc: *curr_acc,
            meta_addr: curr_meta_addr,
            succs: Vec::new(),
            succ_prevs: Vec::new(),
        });
        curr_ri.curr_thd_clk = curr_acc.thd_clk;
        self.recent_info_gc(curr_ri, curr_acc.thd_clk);
    }

    fn recent_info_gc(&self, ri: &mut RecentInfo, curr_thd_clk: Timestamp) {
        if ri.entries.len() < self.queue_limit {
            return;
        }
        let mut kept: Vec<RiEntry> = Vec::new();
        while let Some(entry) = ri.entries.pop_back() {
            if time_distance(entry.acc.thd_clk, curr_thd_clk) >= self.vw {
                break;
            }
            kept.push(entry);
        }
        ri.entries.clear();
        while let Some(entry) = kept.pop() {
            ri.entries.push_back(entry);
        }
        self.ctx.stat.inc("ob_recent_info_gc", 1);
    }

    /// Match the successors of a previous local access against the
    /// predecessors of the current one, emitting idiom 2/3/4/5 candidates.
    fn update_complex_iroot(
        &self,
        curr_acc: &Acc,
        curr_meta_addr: Address,
        preds: &[Acc],
        prev_entry: &RiEntry,
    ) {
        if preds.is_empty() || prev_entry.succs.is_empty() {
            return;
        }
        let prev_acc = &prev_entry.acc;
        let prev_meta_addr = prev_entry.meta_addr;

        let ev = |acc: &Acc| self.iroot_db.get_iroot_event(acc.inst, acc.event_type);

        for (succ_idx, succ) in prev_entry.succs.iter().enumerate() {
            let succ_prevs = &prev_entry.succ_prevs[succ_idx];
            let mut same_acc_exist = false;
            for pred in preds {
                if succ.thd_id != pred.thd_id {
                    continue;
                }
                debug_assert_ne!(succ.thd_id, curr_acc.thd_id);
                if succ.thd_clk < pred.thd_clk {
                    // the remote thread saw prev first: two nested
                    // dependencies (same location -> idiom 3, else 4)
                    let idiom = if prev_meta_addr == curr_meta_addr {
                        IdiomType::Idiom3
                    } else {
                        IdiomType::Idiom4
                    };
                    let iroot = self.iroot_db.get_iroot(
                        idiom,
                        &[ev(prev_acc), ev(succ), ev(pred), ev(curr_acc)],
                    );
                    self.memo.observed(iroot, self.shadow);
                } else if succ.thd_clk > pred.thd_clk
                    && time_distance(pred.thd_clk, succ.thd_clk) < self.vw
                    && prev_meta_addr != curr_meta_addr
                {
                    // two independent conflicts interleaved: only valid if
                    // nothing touched either location between the remote
                    // pair, i.e. pred was a live local prev of succ
                    if succ_prevs.iter().any(|p| p.uid == pred.uid) {
                        let iroot = self.iroot_db.get_iroot(
                            IdiomType::Idiom5,
                            &[ev(prev_acc), ev(succ), ev(pred), ev(curr_acc)],
                        );
                        let mirror = self.iroot_db.get_iroot(
                            IdiomType::Idiom5,
                            &[ev(pred), ev(curr_acc), ev(prev_acc), ev(succ)],
                        );
                        self.memo.observed(iroot, self.shadow);
                        self.memo.observed(mirror, self.shadow);
                    }
                }
                if succ.uid == pred.uid {
                    same_acc_exist = true;
                }
            }
            // the same remote access is both successor and predecessor:
            // a round trip through the other thread
            if same_acc_exist {
                let iroot = self.iroot_db.get_iroot(
                    IdiomType::Idiom2,
                    &[ev(prev_acc), ev(succ), ev(curr_acc)],
                );
                self.memo.observed(iroot, self.shadow);
            }
        }
        self.ctx.stat.inc("ob_upd_comp_iroot", 1);
    }

    #[cfg(test)]
    fn recent_info_snapshot(&self, thd_id: ThreadId) -> Vec<Timestamp> {
        let state = self.state.lock().unwrap();
        state
            .ri_table
            .get(&thd_id)
            .map(|ri| ri.entries.iter().map(|e| e.acc.thd_clk).collect())
            .unwrap_or_default()
    }
}

impl Analyzer for Observer {
    fn before_mem_read(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_mem(thd_id, thd_clk, IRootEventType::MemRead, inst, addr, size);
    }

    fn before_mem_write(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_mem(thd_id, thd_clk, IRootEventType::MemWrite, inst, addr, size);
    }

    fn after_mutex_lock(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexLock, inst, addr);
    }

    fn before_mutex_unlock(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexUnlock, inst, addr);
    }

    fn before_cond_wait(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, _cond_addr: Address, mutex_addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexUnlock, inst, mutex_addr);
    }

    fn after_cond_wait(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, _cond_addr: Address, mutex_addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexLock, inst, mutex_addr);
    }

    fn before_cond_timedwait(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, _cond_addr: Address, mutex_addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexUnlock, inst, mutex_addr);
    }

    fn after_cond_timedwait(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, _cond_addr: Address, mutex_addr: Address) {
        self.handle_sync(thd_id, thd_clk, IRootEventType::MutexLock, inst, mutex_addr);
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

    fn after_realloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, _ori_addr: Address, size: u64, new_addr: Address) {
        self.alloc_region(new_addr, size);
    }

    fn after_valloc(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, size: u64, addr: Address) {
        self.alloc_region(addr, size);
    }

    fn before_free(&self, _thd_id: ThreadId, _thd_clk: Timestamp, _inst: InstId, addr: Address) {
        self.free_region(addr);
    }
}
