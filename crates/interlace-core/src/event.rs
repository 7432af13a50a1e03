//! Event model.
//!
//! The instrumentation substrate delivers one `Event` per instrumented
//! program action. Analyzers implement the [`Analyzer`] trait with default
//! no-op handlers and receive events through [`dispatch`]. Events are
//! serde types so recorded traces round-trip as JSON lines.

use serde::{Deserialize, Serialize};

use crate::static_info::InstId;
use crate::types::{Address, ThreadId, Timestamp};

/// One instrumented program action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ThreadStart {
        thd_id: ThreadId,
        parent_thd_id: ThreadId,
    },
    ThreadExit {
        thd_id: ThreadId,
        thd_clk: Timestamp,
    },
    ImageLoad {
        image_id: u32,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    },
    ImageUnload {
        image_id: u32,
        data_start: Address,
        bss_start: Address,
    },
    BeforeMemRead {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    },
    AfterMemRead {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    },
    BeforeMemWrite {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    },
    AfterMemWrite {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    },
    BeforeMutexLock {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterMutexLock {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    BeforeMutexUnlock {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterMutexUnlock {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    BeforeCondSignal {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    BeforeCondBroadcast {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    BeforeCondWait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    },
    AfterCondWait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    },
    BeforeCondTimedwait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    },
    AfterCondTimedwait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    },
    BeforeBarrierWait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterBarrierWait {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterJoin {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        child_thd_id: ThreadId,
    },
    BeforeAtomicInst {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterAtomicInst {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    AfterMalloc {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        size: u64,
        addr: Address,
    },
    AfterCalloc {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        nmemb: u64,
        size: u64,
        addr: Address,
    },
    BeforeRealloc {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        ori_addr: Address,
        size: u64,
    },
    AfterRealloc {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    },
    AfterValloc {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        size: u64,
        addr: Address,
    },
    BeforeFree {
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    },
    /// Instructions executed by `thd_id` since its last count tick.
    WatchInstCount { thd_id: ThreadId, count: u64 },
    /// The program called `sched_yield`.
    SchedYield { thd_id: ThreadId },
}

impl Event {
    /// The thread the event happened on, when one applies.
    pub fn thread(&self) -> Option<ThreadId> {
        use Event::*;
        match self {
            ThreadStart { thd_id, .. }
            | ThreadExit { thd_id, .. }
            | BeforeMemRead { thd_id, .. }
            | AfterMemRead { thd_id, .. }
            | BeforeMemWrite { thd_id, .. }
            | AfterMemWrite { thd_id, .. }
            | BeforeMutexLock { thd_id, .. }
            | AfterMutexLock { thd_id, .. }
            | BeforeMutexUnlock { thd_id, .. }
            | AfterMutexUnlock { thd_id, .. }
            | BeforeCondSignal { thd_id, .. }
            | BeforeCondBroadcast { thd_id, .. }
            | BeforeCondWait { thd_id, .. }
            | AfterCondWait { thd_id, .. }
            | BeforeCondTimedwait { thd_id, .. }
            | AfterCondTimedwait { thd_id, .. }
            | BeforeBarrierWait { thd_id, .. }
            | AfterBarrierWait { thd_id, .. }
            | AfterJoin { thd_id, .. }
            | BeforeAtomicInst { thd_id, .. }
            | AfterAtomicInst { thd_id, .. }
            | AfterMalloc { thd_id, .. }
            | AfterCalloc { thd_id, .. }
            | BeforeRealloc { thd_id, .. }
            | AfterRealloc { thd_id, .. }
            | AfterValloc { thd_id, .. }
            | BeforeFree { thd_id, .. }
            | WatchInstCount { thd_id, .. }
            | SchedYield { thd_id } => Some(*thd_id),
            ImageLoad { .. } | ImageUnload { .. } => None,
        }
    }
}

/// Receiver for the event stream. Every handler defaults to a no-op so an
/// analyzer only implements the hooks it cares about.
#[allow(unused_variables)]
pub trait Analyzer: Send + Sync {
    fn thread_start(&self, thd_id: ThreadId, parent_thd_id: ThreadId) {}
    fn thread_exit(&self, thd_id: ThreadId, thd_clk: Timestamp) {}
    fn image_load(
        &self,
        image_id: u32,
        data_start: Address,
        data_size: u64,
        bss_start: Address,
        bss_size: u64,
    ) {
    }
    fn image_unload(&self, image_id: u32, data_start: Address, bss_start: Address) {}
    fn before_mem_read(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
    }
    fn after_mem_read(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
    }
    fn before_mem_write(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
    }
    fn after_mem_write(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
        size: u64,
    ) {
    }
    fn before_mutex_lock(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_mutex_lock(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {}
    fn before_mutex_unlock(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    ) {
    }
    fn after_mutex_unlock(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn before_cond_signal(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn before_cond_broadcast(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    ) {
    }
    fn before_cond_wait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn after_cond_wait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn before_cond_timedwait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn after_cond_timedwait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        cond_addr: Address,
        mutex_addr: Address,
    ) {
    }
    fn before_barrier_wait(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        addr: Address,
    ) {
    }
    fn after_barrier_wait(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_join(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, child: ThreadId) {}
    fn before_atomic_inst(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {
    }
    fn after_atomic_inst(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {}
    fn after_malloc(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, size: u64, addr: Address) {
    }
    fn after_calloc(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        nmemb: u64,
        size: u64,
        addr: Address,
    ) {
    }
    fn before_realloc(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        ori_addr: Address,
        size: u64,
    ) {
    }
    fn after_realloc(
        &self,
        thd_id: ThreadId,
        thd_clk: Timestamp,
        inst: InstId,
        ori_addr: Address,
        size: u64,
        new_addr: Address,
    ) {
    }
    fn after_valloc(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, size: u64, addr: Address) {
    }
    fn before_free(&self, thd_id: ThreadId, thd_clk: Timestamp, inst: InstId, addr: Address) {}
    fn watch_inst_count(&self, thd_id: ThreadId, count: u64) {}
    fn sched_yield(&self, thd_id: ThreadId) {}
    /// Called once after the last event.
    fn program_exit(&self) {}
}

/// Route one event to the matching `Analyzer` handler.
pub fn dispatch(analyzer: &dyn Analyzer, event: &Event) {
    use Event::*;
    match *event {
        ThreadStart { thd_id, parent_thd_id } => analyzer.thread_start(thd_id, parent_thd_id),
        ThreadExit { thd_id, thd_clk } => analyzer.thread_exit(thd_id, thd_clk),
        ImageLoad {
            image_id,
            data_start,
            data_size,
            bss_start,
            bss_size,
        } => analyzer.image_load(image_id, data_start, data_size, bss_start, bss_size),
        ImageUnload {
            image_id,
            data_start,
            bss_start,
        } => analyzer.image_unload(image_id, data_start, bss_start),
        BeforeMemRead { thd_id, thd_clk, inst, addr, size } => {
            analyzer.before_mem_read(thd_id, thd_clk, inst, addr, size);
        }
        AfterMemRead { thd_id, thd_clk, inst, addr, size } => {
            analyzer.after_mem_read(thd_id, thd_clk, inst, addr, size);
        }
        BeforeMemWrite { thd_id, thd_clk, inst, addr, size } => {
            analyzer.before_mem_write(thd_id, thd_clk, inst, addr, size);
        }
        AfterMemWrite { thd_id, thd_clk, inst, addr, size } => {
            analyzer.after_mem_write(thd_id, thd_clk, inst, addr, size);
        }
        BeforeMutexLock { thd_id, thd_clk, inst, addr } => {
            analyzer.before_mutex_lock(thd_id, thd_clk, inst, addr);
        }
        AfterMutexLock { thd_id, thd_clk, inst, addr } => {
            analyzer.after_mutex_lock(thd_id, thd_clk, inst, addr);
        }
        BeforeMutexUnlock { thd_id, thd_clk, inst, addr } => {
            analyzer.before_mutex_unlock(thd_id, thd_clk, inst, addr);
        }
        AfterMutexUnlock { thd_id, thd_clk, inst, addr } => {
            analyzer.after_mutex_unlock(thd_id, thd_clk, inst, addr);
        }
        BeforeCondSignal { thd_id, thd_clk, inst, addr } => {
            analyzer.before_cond_signal(thd_id, thd_clk, inst, addr);
        }
        BeforeCondBroadcast { thd_id, thd_clk, inst, addr } => {
            analyzer.before_cond_broadcast(thd_id, thd_clk, inst, addr);
        }
        BeforeCondWait { thd_id, thd_clk, inst, cond_addr, mutex_addr } => {
            analyzer.before_cond_wait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
        }
        AfterCondWait { thd_id, thd_clk, inst, cond_addr, mutex_addr } => {
            analyzer.after_cond_wait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
        }
        BeforeCondTimedwait { thd_id, thd_clk, inst, cond_addr, mutex_addr } => {
            analyzer.before_cond_timedwait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
        }
        AfterCondTimedwait { thd_id, thd_clk, inst, cond_addr, mutex_addr } => {
            analyzer.after_cond_timedwait(thd_id, thd_clk, inst, cond_addr, mutex_addr);
        }
        BeforeBarrierWait { thd_id, thd_clk, inst, addr } => {
            analyzer.before_barrier_wait(thd_id, thd_clk, inst, addr);
        }
        AfterBarrierWait { thd_id, thd_clk, inst, addr } => {
            analyzer.after_barrier_wait(thd_id, thd_clk, inst, addr);
        }
        AfterJoin { thd_id, thd_clk, inst, child_thd_id } => {
            analyzer.after_join(thd_id, thd_clk, inst, child_thd_id);
        }
        BeforeAtomicInst { thd_id, thd_clk, inst, addr } => {
            analyzer.before_atomic_inst(thd_id, thd_clk, inst, addr);
        }
        AfterAtomicInst { thd_id, thd_clk, inst, addr } => {
            analyzer.after_atomic_inst(thd_id, thd_clk, inst, addr);
        }
        AfterMalloc { thd_id, thd_clk, inst, size, addr } => {
            analyzer.after_malloc(thd_id, thd_clk, inst, size, addr);
        }
        AfterCalloc { thd_id, thd_clk, inst, nmemb, size, addr } => {
            analyzer.after_calloc(thd_id, thd_clk, inst, nmemb, size, addr);
        }
        BeforeRealloc { thd_id, thd_clk, inst, ori_addr, size } => {
            analyzer.before_realloc(thd_id, thd_clk, inst, ori_addr, size);
        }
        AfterRealloc { thd_id, thd_clk, inst, ori_addr, size, new_addr } => {
            analyzer.after_realloc(thd_id, thd_clk, inst, ori_addr, size, new_addr);
        }
        AfterValloc { thd_id, thd_clk, inst, size, addr } => {
            analyzer.after_valloc(thd_id, thd_clk, inst, size, addr);
        }
        BeforeFree { thd_id, thd_clk, inst, addr } => {
            analyzer.before_free(thd_id, thd_clk, inst, addr);
        }
        WatchInstCount { thd_id, count } => analyzer.watch_inst_count(thd_id, count),
        SchedYield { thd_id } => analyzer.sched_yield(thd_id),
    }
}
