//! Deterministic scenario harness.
//!
//! Builds literal event traces (`w(t, addr)`, `r(t, addr)`, lock/unlock,
//! thread starts) and replays them through the core controllers under the
//! substrate's single-threaded delivery mode, so every scenario in the
//! test suite is reproducible.

use std::sync::{Arc, Mutex};

use interlace_core::config::{Config, RuntimeContext};
use interlace_core::controller::{ActiveTester, Profiler, RaceProfiler};
use interlace_core::event::Event;
use interlace_core::sched::priority::PriorityOps;
use interlace_core::sched::{InstrumentationOps, NullInstrumentation};
use interlace_core::types::{Address, INVALID_THREAD_ID, ThreadId, Timestamp};

/// Default heap region used by scenario traces.
pub const HEAP_BASE: Address = 0x1000;
pub const HEAP_SIZE: u64 = 0x10000;

/// Builder for literal event traces. Thread clocks advance by one per
/// recorded access unless set explicitly.
#[derive(Default)]
pub struct TraceBuilder {
    events: Vec<Event>,
    clocks: std::collections::HashMap<ThreadId, Timestamp>,
}

impl TraceBuilder {
    /// Start with the main thread, a spawned sibling set, and one heap
    /// region covering [`HEAP_BASE`].
    pub fn with_threads(n: u32) -> Self {
        let mut b = Self::default();
        b.events.push(Event::ThreadStart {
            thd_id: 0,
            parent_thd_id: INVALID_THREAD_ID,
        });
        for thd_id in 1..n {
            b.events.push(Event::ThreadStart {
                thd_id,
                parent_thd_id: 0,
            });
        }
        b.events.push(Event::AfterMalloc {
            thd_id: 0,
            thd_clk: 0,
            inst: 0,
            size: HEAP_SIZE,
            addr: HEAP_BASE,
        });
        b
    }

    fn tick(&mut self, thd_id: ThreadId) -> Timestamp {
        let clk = self.clocks.entry(thd_id).or_insert(0);
        *clk += 1;
        *clk
    }

    /// Force a thread's clock, e.g. to push an access out of the window.
    pub fn set_clock(&mut self, thd_id: ThreadId, clk: Timestamp) -> &mut Self {
        self.clocks.insert(thd_id, clk);
        self
    }

    /// Append a write access (before and after hooks).
    pub fn w(&mut self, thd_id: ThreadId, inst: u32, addr: Address) -> &mut Self {
        let thd_clk = self.tick(thd_id);
        self.events.push(Event::BeforeMemWrite {
            thd_id,
            thd_clk,
            inst,
            addr,
            size: 4,
        });
        self.events.push(Event::AfterMemWrite {
            thd_id,
            thd_clk,
            inst,
            addr,
            size: 4,
        });
        self
    }

    /// Append a read access (before and after hooks).
    pub fn r(&mut self, thd_id: ThreadId, inst: u32, addr: Address) -> &mut Self {
        let thd_clk = self.tick(thd_id);
        self.events.push(Event::BeforeMemRead {
            thd_id,
            thd_clk,
            inst,
            addr,
            size: 4,
        });
        self.events.push(Event::AfterMemRead {
            thd_id,
            thd_clk,
            inst,
            addr,
            size: 4,
        });
        self
    }

    pub fn lock(&mut self, thd_id: ThreadId, inst: u32, addr: Address) -> &mut Self {
        let thd_clk = self.tick(thd_id);
        self.events.push(Event::BeforeMutexLock {
            thd_id,
            thd_clk,
            inst,
            addr,
        });
        self.events.push(Event::AfterMutexLock {
            thd_id,
            thd_clk,
            inst,
            addr,
        });
        self
    }

    pub fn unlock(&mut self, thd_id: ThreadId, inst: u32, addr: Address) -> &mut Self {
        let thd_clk = self.tick(thd_id);
        self.events.push(Event::BeforeMutexUnlock {
            thd_id,
            thd_clk,
            inst,
            addr,
        });
        self.events.push(Event::AfterMutexUnlock {
            thd_id,
            thd_clk,
            inst,
            addr,
        });
        self
    }

    pub fn inst_count(&mut self, thd_id: ThreadId, count: u64) -> &mut Self {
        self.events.push(Event::WatchInstCount { thd_id, count });
        self
    }

    pub fn push(&mut self, event: Event) -> &mut Self {
        self.events.push(event);
        self
    }

    pub fn build(&self) -> Vec<Event> {
        self.events.clone()
    }
}

/// Config pointing every database into a temp dir, complex idioms on.
pub fn scenario_config(dir: &std::path::Path) -> Config {
    Config {
        complex_idioms: true,
        random_seed: Some(7),
        yield_delay_unit: 1,
        yield_delay_min_each: 5,
        yield_delay_max_total: 20,
        iroot_db: dir.join("iroot.db"),
        memo_db: dir.join("memo.db"),
        sinst_db: dir.join("sinst.db"),
        race_db: dir.join("race.db"),
        test_history: dir.join("test.histo"),
        static_info_db: dir.join("sinfo.db"),
        ..Config::default()
    }
}

/// Run a trace through the observer; returns the profiler for db access.
pub fn profile_trace(cfg: Config, events: Vec<Event>) -> Profiler {
    let profiler = Profiler::new(RuntimeContext::new(cfg)).expect("profiler setup");
    profiler.run(events).expect("profile run");
    profiler
}

/// Run a trace through the race detector.
pub fn race_trace(cfg: Config, events: Vec<Event>) -> RaceProfiler {
    let profiler = RaceProfiler::new(RuntimeContext::new(cfg)).expect("race setup");
    profiler.run(events).expect("race run");
    profiler
}

/// Priority backend that records every command for assertions.
#[derive(Default)]
pub struct RecordingPriorityOps {
    pub calls: Mutex<Vec<(i32, i32)>>,
}

impl PriorityOps for RecordingPriorityOps {
    fn set_priority(&self, os_tid: i32, raw: i32) -> std::io::Result<()> {
        self.calls.lock().unwrap().push((os_tid, raw));
        Ok(())
    }
    fn set_affinity(&self, _cpu: usize) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run a trace through the active tester; returns the tester plus the
/// recorded priority commands.
pub fn test_trace(cfg: Config, events: Vec<Event>) -> (ActiveTester, Arc<RecordingPriorityOps>) {
    let prio = Arc::new(RecordingPriorityOps::default());
    let tester = ActiveTester::new(
        RuntimeContext::new(cfg),
        Arc::clone(&prio) as Arc<dyn PriorityOps>,
        Arc::new(NullInstrumentation) as Arc<dyn InstrumentationOps>,
    )
    .expect("tester setup");
    tester.run(events).expect("test run");
    (tester, prio)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_advances_clocks_per_thread() {
        let mut b = TraceBuilder::with_threads(2);
        b.w(0, 10, HEAP_BASE).r(1, 11, HEAP_BASE).w(0, 12, HEAP_BASE);
        let events = b.build();
        // 2 thread starts + malloc + 3 accesses with before/after pairs
        assert_eq!(events.len(), 9);
        match &events[3] {
            Event::BeforeMemWrite { thd_clk, .. } => assert_eq!(*thd_clk, 1),
            other => panic!("unexpected event {other:?}"),
        }
        match &events[7] {
            Event::BeforeMemWrite { thd_id, thd_clk, .. } => {
                assert_eq!(*thd_id, 0);
                assert_eq!(*thd_clk, 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn traces_serialize_as_json_lines() {
        let mut b = TraceBuilder::with_threads(1);
        b.w(0, 1, HEAP_BASE);
        let lines: Vec<String> = b
            .build()
            .iter()
            .map(|e| serde_json::to_string(e).unwrap())
            .collect();
        for line in &lines {
            let _: Event = serde_json::from_str(line).unwrap();
        }
    }
}
