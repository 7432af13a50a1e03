//! Active scheduling.
//!
//! Given one target iRoot, the scheduler drives the program toward the
//! interleaving that exposes it: it pins every thread to one CPU so
//! priority alone decides execution order, parks and raises threads as
//! the target's events come in, delays conflicting bystanders, and gives
//! the scenario up once the delay budget is spent. Exposure is recorded
//! exactly once per run.

pub mod chain;
pub mod idiom1;
pub mod idiom2;
pub mod machine;
pub mod priority;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::RuntimeContext;
use crate::event::Analyzer;
use crate::history::TestHistory;
use crate::iroot::{IRoot, IRootDB, IRootEventType, IdiomType};
use crate::memo::Memo;
use crate::static_info::InstId;
use crate::types::{Address, ThreadId, Timestamp};

use chain::{ChainMachine, ChainVariant};
use idiom1::Idiom1Machine;
use idiom2::Idiom2Machine;
use machine::{Cmd, GiveupBudget, IdiomMachine, MachineCtx, Step, TargetEvent};
use priority::{OsThreadMap, PriorityBand, PriorityLevel, PriorityOps};

/// Seam to the instrumentation substrate: ask it to re-instrument the
/// program with the current watch callbacks.
pub trait InstrumentationOps: Send + Sync {
    fn flush_code_cache(&self);
}

/// No-op flush for event sources that are not instrumentation-backed.
pub struct NullInstrumentation;

impl InstrumentationOps for NullInstrumentation {
    fn flush_code_cache(&self) {
        debug!("code cache flush requested");
    }
}

/// Pick the target iRoot per configuration: explicit id, then idiom,
/// then any unexposed candidate. `Ok(None)` means there is nothing to
/// test and the process should exit cleanly.
pub fn choose_target(
    ctx: &RuntimeContext,
    memo: &Memo,
    iroot_db: &IRootDB,
) -> Result<Option<IRoot>, String> {
    let cfg = &ctx.config;
    if cfg.target_iroot != 0 {
        let id = memo
            .choose_for_test_id(cfg.target_iroot)
            .ok_or_else(|| format!("target iroot {} does not exist", cfg.target_iroot))?;
        return Ok(iroot_db.find_iroot(id));
    }
    let chosen = if cfg.target_idiom != 0 {
        let idiom = IdiomType::from_index(cfg.target_idiom)
            .ok_or_else(|| format!("invalid target idiom {}", cfg.target_idiom))?;
        memo.choose_for_test_idiom(idiom)
    } else {
        memo.choose_for_test()
    };
    Ok(chosen.and_then(|id| iroot_db.find_iroot(id)))
}

const FLUSH_TOKEN_RESET: u32 = 10;

struct SchedInner {
    machine: Box<dyn IdiomMachine>,
    mctx: MachineCtx,
    exposed: bool,
    finalized: bool,
    pool: Vec<i32>,
    pool_cursor: usize,
    flush_token: u32,
    main_started: bool,
}

/// The per-run active scheduler. One target iRoot, one state machine.
pub struct ActiveScheduler {
    ctx: RuntimeContext,
    memo: Arc<Memo>,
    history: Arc<TestHistory>,
    priority_ops: Arc<dyn PriorityOps>,
    instr: Arc<dyn InstrumentationOps>,
    thread_map: Arc<OsThreadMap>,
    band: PriorityBand,
    target: IRoot,
    explicit_target: bool,
    inner: Mutex<SchedInner>,
}

impl ActiveScheduler {
    pub fn new(
        ctx: RuntimeContext,
        iroot_db: &IRootDB,
        memo: Arc<Memo>,
        history: Arc<TestHistory>,
        priority_ops: Arc<dyn PriorityOps>,
        instr: Arc<dyn InstrumentationOps>,
        target: IRoot,
    ) -> Self {
        let cfg = &ctx.config;
        let explicit_target = cfg.target_iroot != 0;
        let band = PriorityBand::from_config(cfg);

        let mut rng = match cfg.random_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        // alternate the pool traversal direction between test runs
        let total_runs = if explicit_target {
            history.total_test_runs(target.id)
        } else {
            memo.total_test_runs(target.id)
        };
        let use_decreasing = total_runs % 2 == 0;
        let mut pool = band.new_thread_pool();
        if cfg.ordered_new_thread_prio {
            if use_decreasing {
                pool.reverse();
            }
        } else {
            pool.shuffle(&mut rng);
        }

        let target_events: Vec<TargetEvent> = target
            .events
            .iter()
            .map(|&e| {
                let ev = iroot_db.find_event(e).expect("target event interned");
                TargetEvent {
                    inst: ev.inst,
                    event_type: ev.event_type,
                }
            })
            .collect();

        let machine: Box<dyn IdiomMachine> = match target.idiom {
            IdiomType::Idiom1 => Box::new(Idiom1Machine::new()),
            IdiomType::Idiom2 => Box::new(Idiom2Machine::new()),
            IdiomType::Idiom3 => Box::new(ChainMachine::new(ChainVariant::Idiom3)),
            IdiomType::Idiom4 => Box::new(ChainMachine::new(ChainVariant::Idiom4)),
            IdiomType::Idiom5 => Box::new(ChainMachine::new(ChainVariant::Idiom5)),
        };

        let budget = GiveupBudget::new(
            cfg.yield_delay_unit,
            cfg.yield_delay_min_each,
            cfg.yield_delay_max_total,
        );
        let mctx = MachineCtx::new(
            target_events,
            cfg.vw,
            budget,
            cfg.idiom4_watch_fallthrough,
            rng,
        );

        info!(
            "testing iroot {} (idiom {}), {} prior runs",
            target.id,
            target.idiom.index(),
            total_runs
        );

        Self {
            ctx,
            memo,
            history,
            priority_ops,
            instr,
            thread_map: Arc::new(OsThreadMap::new()),
            band,
            target,
            explicit_target,
            inner: Mutex::new(SchedInner {
                machine,
                mctx,
                exposed: false,
                finalized: false,
                pool,
                pool_cursor: 0,
                flush_token: FLUSH_TOKEN_RESET,
                main_started: false,
            }),
        }
    }

    pub fn thread_map(&self) -> Arc<OsThreadMap> {
        Arc::clone(&self.thread_map)
    }

    pub fn target_id(&self) -> u32 {
        self.target.id
    }

    pub fn exposed(&self) -> bool {
        self.inner.lock().unwrap().exposed
    }

    /// A failed priority or affinity write leaves the program in an
    /// unknown scheduling state; abort with the errno.
    fn fatal_os(&self, what: &str, err: std::io::Error) -> ! {
        error!("{what} failed: {err}");
        std::process::exit(err.raw_os_error().unwrap_or(1));
    }

    fn set_priority_raw(&self, thd_id: ThreadId, raw: i32) {
        let os_tid = self.thread_map.os_tid(thd_id);
        if let Err(err) = self.priority_ops.set_priority(os_tid, raw) {
            self.fatal_os("set_priority", err);
        }
    }

    fn set_priority(&self, thd_id: ThreadId, level: PriorityLevel) {
        self.set_priority_raw(thd_id, self.band.raw(level));
    }

    fn apply(&self, inner: &mut SchedInner, step: &Step) {
        for cmd in &step.cmds {
            match *cmd {
                Cmd::SetPriority(thd_id, level) => self.set_priority(thd_id, level),
                Cmd::WakeDelaySet => {
                    let woken: Vec<ThreadId> = inner.mctx.delay_set.drain().collect();
                    for thd_id in woken {
                        self.set_priority(thd_id, PriorityLevel::Normal);
                    }
                }
                Cmd::FlushCache => self.instr.flush_code_cache(),
                Cmd::Exposed => self.actively_exposed(inner),
            }
        }
    }

    /// Record a successful exposure. Runs at most once per test.
    fn actively_exposed(&self, inner: &mut SchedInner) {
        if inner.exposed {
            return;
        }
        inner.exposed = true;
        info!("target iroot {} actively exposed", self.target.id);
        self.ctx.stat.inc("sched_exposed", 1);
        if !self.explicit_target {
            self.memo.test_success(self.target.id);
        }
        self.history.record_success(self.target.id);
    }

    fn handle_before(&self, thd_id: ThreadId, inst: InstId, event_type: IRootEventType, addr: Address, size: u64) {
        loop {
            let retry = {
                let mut guard = self.inner.lock().unwrap();
                let inner = &mut *guard;
                if inner.finalized || inner.machine.done() {
                    return;
                }
                let matches = inner.mctx.matches(inst, event_type);
                let step = inner
                    .machine
                    .on_before_access(&mut inner.mctx, thd_id, addr, size, &matches);
                self.apply(inner, &step);
                step.retry
            };
            if !retry {
                return;
            }
            // give-up backpressure: sleep one delay unit with the state
            // lock released, then redeliver
            std::thread::sleep(Duration::from_millis(self.ctx.config.yield_delay_unit));
        }
    }

    fn handle_after(&self, thd_id: ThreadId, inst: InstId, event_type: IRootEventType, addr: Address, size: u64) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.finalized || inner.machine.done() {
            return;
        }
        let matches = inner.mctx.matches(inst, event_type);
        let step = inner
            .machine
            .on_after_access(&mut inner.mctx, thd_id, addr, size, &matches);
        self.apply(inner, &step);
    }
}

impl Analyzer for ActiveScheduler {
    fn thread_start(&self, thd_id: ThreadId, _parent_thd_id: ThreadId) {
        let raw = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.main_started {
                inner.main_started = true;
                // pin to one CPU so priority alone orders execution
                if let Err(err) = self.priority_ops.set_affinity(self.ctx.config.cpu) {
                    self.fatal_os("set_affinity", err);
                }
            }
            let raw = inner.pool[inner.pool_cursor % inner.pool.len()];
            inner.pool_cursor += 1;
            raw
        };
        self.set_priority_raw(thd_id, raw);
    }

    fn thread_exit(&self, thd_id: ThreadId, _thd_clk: Timestamp) {
        self.thread_map.unregister(thd_id);
    }

    fn before_mem_read(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_before(thd_id, inst, IRootEventType::MemRead, addr, size);
    }

    fn after_mem_read(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_after(thd_id, inst, IRootEventType::MemRead, addr, size);
    }

    fn before_mem_write(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_before(thd_id, inst, IRootEventType::MemWrite, addr, size);
    }

    fn after_mem_write(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address, size: u64) {
        self.handle_after(thd_id, inst, IRootEventType::MemWrite, addr, size);
    }

    fn before_mutex_lock(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_before(thd_id, inst, IRootEventType::MutexLock, addr, self.ctx.config.unit_size);
    }

    fn after_mutex_lock(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_after(thd_id, inst, IRootEventType::MutexLock, addr, self.ctx.config.unit_size);
    }

    fn before_mutex_unlock(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_before(thd_id, inst, IRootEventType::MutexUnlock, addr, self.ctx.config.unit_size);
    }

    fn after_mutex_unlock(&self, thd_id: ThreadId, _thd_clk: Timestamp, inst: InstId, addr: Address) {
        self.handle_after(thd_id, inst, IRootEventType::MutexUnlock, addr, self.ctx.config.unit_size);
    }

    fn watch_inst_count(&self, thd_id: ThreadId, count: u64) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        if inner.finalized || inner.machine.done() {
            return;
        }
        if inner.machine.idle() {
            // throttle idle-state flushes with a decrementing token
            if inner.flush_token == 0 {
                inner.flush_token = FLUSH_TOKEN_RESET;
                self.instr.flush_code_cache();
            } else {
                inner.flush_token -= 1;
            }
            return;
        }
        let step = inner.machine.on_inst_count(&mut inner.mctx, thd_id, count);
        self.apply(inner, &step);
    }

    fn sched_yield(&self, thd_id: ThreadId) {
        // candidates flagged asynchronous are tested with delay-based
        // yields; everything else steps aside via the band minimum
        if self.memo.async_hint(self.target.id) {
            std::thread::sleep(Duration::from_millis(self.ctx.config.yield_delay_unit));
            return;
        }
        self.set_priority(thd_id, PriorityLevel::Min);
    }

    fn program_exit(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.finalized {
            return;
        }
        inner.finalized = true;
        if !inner.exposed {
            debug!("target iroot {} not exposed this run", self.target.id);
            if !self.explicit_target {
                self.memo.test_fail(self.target.id);
            }
            self.history.record_failure(self.target.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::INVALID_THREAD_ID;
    use std::sync::Mutex as StdMutex;

    struct MockPriorityOps {
        calls: StdMutex<Vec<(i32, i32)>>,
        affinity: StdMutex<Vec<usize>>,
    }

    impl MockPriorityOps {
        fn new() -> Self {
            Self {
                calls: StdMutex::new(Vec::new()),
                affinity: StdMutex::new(Vec::new()),
            }
        }
    }

    impl PriorityOps for MockPriorityOps {
        fn set_priority(&self, os_tid: i32, raw: i32) -> std::io::Result<()> {
            self.calls.lock().unwrap().push((os_tid, raw));
            Ok(())
        }
        fn set_affinity(&self, cpu: usize) -> std::io::Result<()> {
            self.affinity.lock().unwrap().push(cpu);
            Ok(())
        }
    }

    struct MockInstr {
        flushes: StdMutex<u32>,
    }

    impl InstrumentationOps for MockInstr {
        fn flush_code_cache(&self) {
            *self.flushes.lock().unwrap() += 1;
        }
    }

    struct Fixture {
        sched: ActiveScheduler,
        memo: Arc<Memo>,
        history: Arc<TestHistory>,
        prio: Arc<MockPriorityOps>,
        instr: Arc<MockInstr>,
        iroot_id: u32,
    }

    /// Build a scheduler targeting an idiom-1 iroot `(W@inst10, R@inst11)`.
    fn fixture(tune: impl FnOnce(&mut Config)) -> Fixture {
        let mut cfg = Config {
            yield_delay_unit: 1,
            yield_delay_min_each: 3,
            yield_delay_max_total: 10,
            random_seed: Some(42),
            ..Config::default()
        };
        tune(&mut cfg);
        let ctx = RuntimeContext::new(cfg);
        let iroot_db = Arc::new(IRootDB::new());
        let e0 = iroot_db.get_iroot_event(10, IRootEventType::MemWrite);
        let e1 = iroot_db.get_iroot_event(11, IRootEventType::MemRead);
        let iroot_id = iroot_db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
        let memo = Arc::new(Memo::new(Arc::clone(&iroot_db)));
        memo.observed(iroot_id, false);
        let history = Arc::new(TestHistory::new());
        let prio = Arc::new(MockPriorityOps::new());
        let instr = Arc::new(MockInstr {
            flushes: StdMutex::new(0),
        });
        let target = choose_target(&ctx, &memo, &iroot_db).unwrap().unwrap();
        let sched = ActiveScheduler::new(
            ctx,
            &iroot_db,
            Arc::clone(&memo),
            Arc::clone(&history),
            prio.clone() as Arc<dyn PriorityOps>,
            instr.clone() as Arc<dyn InstrumentationOps>,
            target,
        );
        Fixture {
            sched,
            memo,
            history,
            prio,
            instr,
            iroot_id,
        }
    }

    #[test]
    fn choose_target_precedence() {
        let ctx = RuntimeContext::new(Config::default());
        let iroot_db = Arc::new(IRootDB::new());
        let memo = Memo::new(Arc::clone(&iroot_db));
        // nothing to test
        assert!(choose_target(&ctx, &memo, &iroot_db).unwrap().is_none());
        // invalid explicit target is a configuration error
        let ctx = RuntimeContext::new(Config {
            target_iroot: 99,
            ..Config::default()
        });
        assert!(choose_target(&ctx, &memo, &iroot_db).is_err());
    }

    #[test]
    fn exposes_idiom1_target() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.thread_start(1, 0);
        // T0 executes e0
        f.sched.before_mem_write(0, 1, 10, 0x300, 4);
        f.sched.after_mem_write(0, 1, 10, 0x300, 4);
        // T1 executes e1 on the same location
        f.sched.before_mem_read(1, 1, 11, 0x300, 4);
        f.sched.after_mem_read(1, 1, 11, 0x300, 4);
        assert!(f.sched.exposed());
        let c = f.memo.candidate(f.iroot_id).unwrap();
        assert!(c.exposed);
        assert_eq!(c.total_test_runs, 1);
        assert_eq!(f.history.record(f.iroot_id).unwrap().successes, 1);
        // exit after exposure does not double-record
        f.sched.program_exit();
        assert_eq!(f.memo.candidate(f.iroot_id).unwrap().total_test_runs, 1);
    }

    #[test]
    fn affinity_pinned_once_and_pool_assigned() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.thread_start(1, 0);
        f.sched.thread_start(2, 0);
        assert_eq!(f.prio.affinity.lock().unwrap().len(), 1);
        // three pool assignments, all interior values
        let calls = f.prio.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|&(_, raw)| raw > 2 && raw < 98));
    }

    #[test]
    fn parked_holder_gets_low_priority_and_flush() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.before_mem_write(0, 1, 10, 0x300, 4);
        f.sched.after_mem_write(0, 1, 10, 0x300, 4);
        // low = lowest_rt + 1 = 2
        assert!(f.prio.calls.lock().unwrap().contains(&(0, 2)));
        assert_eq!(*f.instr.flushes.lock().unwrap(), 1);
    }

    #[test]
    fn ruining_access_gives_up_within_budget() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.thread_start(1, 0);
        f.sched.thread_start(2, 0);
        f.sched.before_mem_write(0, 1, 10, 0x300, 4);
        f.sched.after_mem_write(0, 1, 10, 0x300, 4);
        // a conflicting write from a bystander instruction: delayed, then
        // the scenario is abandoned when the budget runs out
        f.sched.before_mem_write(2, 1, 99, 0x300, 4);
        // the machine reset back to idle
        {
            let inner = f.sched.inner.lock().unwrap();
            assert!(inner.machine.idle());
            assert!(inner.mctx.delay_set.is_empty());
        }
        // a fresh attempt can still succeed
        f.sched.before_mem_write(0, 2, 10, 0x300, 4);
        f.sched.after_mem_write(0, 2, 10, 0x300, 4);
        f.sched.before_mem_read(1, 1, 11, 0x300, 4);
        f.sched.after_mem_read(1, 1, 11, 0x300, 4);
        assert!(f.sched.exposed());
    }

    #[test]
    fn failed_run_records_test_fail() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.before_mem_write(0, 1, 10, 0x300, 4);
        f.sched.after_mem_write(0, 1, 10, 0x300, 4);
        f.sched.program_exit();
        assert!(!f.sched.exposed());
        let c = f.memo.candidate(f.iroot_id).unwrap();
        assert_eq!(c.failed, 1);
        assert_eq!(f.history.record(f.iroot_id).unwrap().failures, 1);
    }

    #[test]
    fn sched_yield_drops_to_min() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.sched_yield(0);
        // min = lowest_rt = 1
        assert!(f.prio.calls.lock().unwrap().contains(&(0, 1)));
    }

    #[test]
    fn async_candidates_yield_with_delay() {
        let f = fixture(|_| {});
        f.memo.set_async_hint(f.iroot_id);
        f.sched.thread_start(0, INVALID_THREAD_ID);
        let before = f.prio.calls.lock().unwrap().len();
        f.sched.sched_yield(0);
        // no priority write: the yield became a sleep
        assert_eq!(f.prio.calls.lock().unwrap().len(), before);
    }

    #[test]
    fn idle_flushes_are_throttled() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        for _ in 0..25 {
            f.sched.watch_inst_count(0, 5);
        }
        // one flush per 11 idle ticks (token counts down from 10)
        assert_eq!(*f.instr.flushes.lock().unwrap(), 2);
    }

    #[test]
    fn non_overlapping_access_accepted_in_watch() {
        let f = fixture(|_| {});
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.thread_start(1, 0);
        f.sched.before_mem_write(0, 1, 10, 0x300, 4);
        f.sched.after_mem_write(0, 1, 10, 0x300, 4);
        // unrelated location: accepted without delay
        f.sched.before_mem_write(1, 1, 99, 0x800, 4);
        f.sched.after_mem_write(1, 1, 99, 0x800, 4);
        // the watch is still armed
        f.sched.before_mem_read(1, 2, 11, 0x300, 4);
        f.sched.after_mem_read(1, 2, 11, 0x300, 4);
        assert!(f.sched.exposed());
    }

    #[test]
    fn explicit_target_skips_memo_bookkeeping() {
        let f = fixture(|cfg| cfg.target_iroot = 1);
        f.sched.thread_start(0, INVALID_THREAD_ID);
        f.sched.program_exit();
        // history records the failure, memo does not
        assert_eq!(f.history.record(f.iroot_id).unwrap().failures, 1);
        assert_eq!(f.memo.candidate(f.iroot_id).unwrap().total_test_runs, 0);
    }

    #[test]
    fn ordered_pool_alternates_direction_with_run_parity() {
        let build = |prior_fails: u64| {
            let cfg = Config {
                ordered_new_thread_prio: true,
                random_seed: Some(1),
                ..Config::default()
            };
            let ctx = RuntimeContext::new(cfg);
            let iroot_db = Arc::new(IRootDB::new());
            let e0 = iroot_db.get_iroot_event(10, IRootEventType::MemWrite);
            let e1 = iroot_db.get_iroot_event(11, IRootEventType::MemRead);
            let iroot_id = iroot_db.get_iroot(IdiomType::Idiom1, &[e0, e1]);
            let memo = Arc::new(Memo::new(Arc::clone(&iroot_db)));
            memo.observed(iroot_id, false);
            for _ in 0..prior_fails {
                memo.test_fail(iroot_id);
            }
            let prio = Arc::new(MockPriorityOps::new());
            let target = choose_target(&ctx, &memo, &iroot_db).unwrap().unwrap();
            let sched = ActiveScheduler::new(
                ctx,
                &iroot_db,
                memo,
                Arc::new(TestHistory::new()),
                prio.clone() as Arc<dyn PriorityOps>,
                Arc::new(NullInstrumentation) as Arc<dyn InstrumentationOps>,
                target,
            );
            sched.thread_start(0, INVALID_THREAD_ID);
            sched.thread_start(1, 0);
            let calls = prio.calls.lock().unwrap();
            (calls[0].1, calls[1].1)
        };

        // even run count: the pool is traversed strongest-first
        let (first, second) = build(0);
        assert!(first > second);
        // odd run count: weakest-first
        let (first, second) = build(1);
        assert!(first < second);
    }
}
