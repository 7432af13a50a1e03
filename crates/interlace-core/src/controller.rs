//! Controllers: bind an event source to a component set and persist the
//! databases at exit.
//!
//! Three controllers mirror the three ways the engine runs:
//! [`Profiler`] observes and records candidate iRoots, [`ActiveTester`]
//! drives one candidate with the active scheduler, [`RaceProfiler`] runs
//! the happens-before detector. Each loads its databases at setup and
//! saves them in `finish`.

use std::io;
use std::sync::Arc;

use log::info;

use crate::config::RuntimeContext;
use crate::event::{Analyzer, Event, dispatch};
use crate::history::TestHistory;
use crate::iroot::IRootDB;
use crate::memo::Memo;
use crate::observer::Observer;
use crate::race::{RaceDB, RaceDetector};
use crate::sched::{ActiveScheduler, InstrumentationOps, choose_target};
use crate::sched::priority::PriorityOps;
use crate::sinst::{SharedInstAnalyzer, SharedInstDB};
use crate::static_info::{ImageKind, InstId, StaticInfo};

/// Feed every event to every analyzer, then signal program exit.
pub fn run_events<I>(analyzers: &[Arc<dyn Analyzer>], events: I)
where
    I: IntoIterator<Item = Event>,
{
    for event in events {
        for analyzer in analyzers {
            dispatch(analyzer.as_ref(), &event);
        }
    }
    for analyzer in analyzers {
        analyzer.program_exit();
    }
}

fn load_if_exists(path: &std::path::Path, load: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
    if path.exists() { load() } else { Ok(()) }
}

fn mem_access_inst(event: &Event) -> Option<InstId> {
    match *event {
        Event::BeforeMemRead { inst, .. }
        | Event::AfterMemRead { inst, .. }
        | Event::BeforeMemWrite { inst, .. }
        | Event::AfterMemWrite { inst, .. } => Some(inst),
        _ => None,
    }
}

/// Memory accesses from the pthread implementation are never analyzed;
/// accesses from other common libraries only when `ignore_lib` is off.
fn skip_mem_access(static_info: &StaticInfo, ignore_lib: bool, event: &Event) -> bool {
    let Some(inst) = mem_access_inst(event) else {
        return false;
    };
    match static_info.inst_image_kind(inst) {
        Some(ImageKind::Pthread) => true,
        Some(ImageKind::CommonLib) => ignore_lib,
        _ => false,
    }
}

/// Observation run: the iRoot observer plus the shared-inst analyzer.
pub struct Profiler {
    ctx: RuntimeContext,
    pub iroot_db: Arc<IRootDB>,
    pub memo: Arc<Memo>,
    pub sinst_db: Arc<SharedInstDB>,
    pub static_info: Arc<StaticInfo>,
    observer: Arc<Observer>,
    sinst_analyzer: Arc<SharedInstAnalyzer>,
}

impl Profiler {
    pub fn new(ctx: RuntimeContext) -> io::Result<Self> {
        let cfg = Arc::clone(&ctx.config);
        let iroot_db = Arc::new(IRootDB::new());
        load_if_exists(&cfg.iroot_db, || iroot_db.load(&cfg.iroot_db))?;
        let memo = Arc::new(Memo::new(Arc::clone(&iroot_db)));
        load_if_exists(&cfg.memo_db, || memo.load(&cfg.memo_db))?;
        let sinst_db = Arc::new(SharedInstDB::new());
        load_if_exists(&cfg.sinst_db, || sinst_db.load(&cfg.sinst_db))?;
        let static_info = Arc::new(StaticInfo::new());
        load_if_exists(&cfg.static_info_db, || static_info.load(&cfg.static_info_db))?;

        let observer = Arc::new(Observer::new(
            ctx.clone(),
            Arc::clone(&iroot_db),
            Arc::clone(&memo),
        ));
        let sinst_analyzer = Arc::new(SharedInstAnalyzer::new(
            Arc::clone(&sinst_db),
            cfg.unit_size,
        ));

        Ok(Self {
            ctx,
            iroot_db,
            memo,
            sinst_db,
            static_info,
            observer,
            sinst_analyzer,
        })
    }

    pub fn analyzers(&self) -> Vec<Arc<dyn Analyzer>> {
        vec![
            Arc::clone(&self.observer) as Arc<dyn Analyzer>,
            Arc::clone(&self.sinst_analyzer) as Arc<dyn Analyzer>,
        ]
    }

    /// Drive a whole event stream and persist.
    pub fn run<I>(&self, events: I) -> io::Result<()>
    where
        I: IntoIterator<Item = Event>,
    {
        let ignore_lib = self.ctx.config.ignore_lib;
        let events = events
            .into_iter()
            .filter(|e| !skip_mem_access(&self.static_info, ignore_lib, e));
        run_events(&self.analyzers(), events);
        self.finish()
    }

    pub fn finish(&self) -> io::Result<()> {
        let cfg = &self.ctx.config;
        self.memo.refine_candidate(cfg.memo_failed);
        self.iroot_db.save(&cfg.iroot_db)?;
        self.memo.save(&cfg.memo_db)?;
        self.sinst_db.save(&cfg.sinst_db)?;
        self.static_info.save(&cfg.static_info_db)?;
        if let Some(stat_file) = &cfg.stat_file {
            self.ctx.stat.display(stat_file)?;
        }
        info!(
            "profile finished: {} iroots, {} candidates",
            self.iroot_db.iroot_count(),
            self.memo.candidate_count()
        );
        Ok(())
    }
}

/// Active test run: one target iRoot driven by the scheduler.
pub struct ActiveTester {
    ctx: RuntimeContext,
    pub iroot_db: Arc<IRootDB>,
    pub memo: Arc<Memo>,
    pub history: Arc<TestHistory>,
    scheduler: Option<Arc<ActiveScheduler>>,
}

impl ActiveTester {
    /// Returns `Err` for an invalid explicit target (a configuration
    /// error); a scheduler-less tester when there is nothing to test.
    pub fn new(
        ctx: RuntimeContext,
        priority_ops: Arc<dyn PriorityOps>,
        instr: Arc<dyn InstrumentationOps>,
    ) -> io::Result<Self> {
        let cfg = Arc::clone(&ctx.config);
        let iroot_db = Arc::new(IRootDB::new());
        load_if_exists(&cfg.iroot_db, || iroot_db.load(&cfg.iroot_db))?;
        let memo = Arc::new(Memo::new(Arc::clone(&iroot_db)));
        load_if_exists(&cfg.memo_db, || memo.load(&cfg.memo_db))?;
        let history = Arc::new(TestHistory::new());
        load_if_exists(&cfg.test_history, || history.load(&cfg.test_history))?;

        let target = choose_target(&ctx, &memo, &iroot_db).map_err(io::Error::other)?;
        let scheduler = target.map(|target| {
            Arc::new(ActiveScheduler::new(
                ctx.clone(),
                &iroot_db,
                Arc::clone(&memo),
                Arc::clone(&history),
                priority_ops,
                instr,
                target,
            ))
        });
        if scheduler.is_none() {
            info!("no iRoot to test");
        }

        Ok(Self {
            ctx,
            iroot_db,
            memo,
            history,
            scheduler,
        })
    }

    pub fn scheduler(&self) -> Option<Arc<ActiveScheduler>> {
        self.scheduler.clone()
    }

    pub fn has_target(&self) -> bool {
        self.scheduler.is_some()
    }

    pub fn analyzers(&self) -> Vec<Arc<dyn Analyzer>> {
        self.scheduler
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn Analyzer>)
            .collect()
    }

    pub fn run<I>(&self, events: I) -> io::Result<()>
    where
        I: IntoIterator<Item = Event>,
    {
        run_events(&self.analyzers(), events);
        self.finish()
    }

    pub fn finish(&self) -> io::Result<()> {
        let cfg = &self.ctx.config;
        // a run aborted before the stream ended still records its outcome
        if let Some(scheduler) = &self.scheduler {
            scheduler.program_exit();
        }
        self.memo.save(&cfg.memo_db)?;
        self.history.save(&cfg.test_history)?;
        if let Some(stat_file) = &cfg.stat_file {
            self.ctx.stat.display(stat_file)?;
        }
        Ok(())
    }
}

/// Race detection run.
pub struct RaceProfiler {
    ctx: RuntimeContext,
    pub race_db: Arc<RaceDB>,
    pub static_info: Arc<StaticInfo>,
    detector: Arc<RaceDetector>,
}

impl RaceProfiler {
    pub fn new(ctx: RuntimeContext) -> io::Result<Self> {
        let cfg = Arc::clone(&ctx.config);
        let race_db = Arc::new(RaceDB::new());
        load_if_exists(&cfg.race_db, || race_db.load(&cfg.race_db))?;
        let static_info = Arc::new(StaticInfo::new());
        load_if_exists(&cfg.static_info_db, || static_info.load(&cfg.static_info_db))?;
        let detector = Arc::new(RaceDetector::new(ctx.clone(), Arc::clone(&race_db)));
        Ok(Self {
            ctx,
            race_db,
            static_info,
            detector,
        })
    }

    pub fn analyzers(&self) -> Vec<Arc<dyn Analyzer>> {
        vec![Arc::clone(&self.detector) as Arc<dyn Analyzer>]
    }

    pub fn run<I>(&self, events: I) -> io::Result<()>
    where
        I: IntoIterator<Item = Event>,
    {
        let ignore_lib = self.ctx.config.ignore_lib;
        let events = events
            .into_iter()
            .filter(|e| !skip_mem_access(&self.static_info, ignore_lib, e));
        run_events(&self.analyzers(), events);
        self.finish()
    }

    pub fn finish(&self) -> io::Result<()> {
        let cfg = &self.ctx.config;
        self.race_db.save(&cfg.race_db)?;
        self.static_info.save(&cfg.static_info_db)?;
        if let Some(stat_file) = &cfg.stat_file {
            self.ctx.stat.display(stat_file)?;
        }
        info!("race run finished: {} races", self.race_db.race_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::types::INVALID_THREAD_ID;

    fn events_idiom1() -> Vec<Event> {
        vec![
            Event::ThreadStart {
                thd_id: 0,
                parent_thd_id: INVALID_THREAD_ID,
            },
            Event::ThreadStart {
                thd_id: 1,
                parent_thd_id: 0,
            },
            Event::AfterMalloc {
                thd_id: 0,
                thd_clk: 0,
                inst: 0,
                size: 0x100,
                addr: 0x1000,
            },
            Event::BeforeMemWrite {
                thd_id: 0,
                thd_clk: 1,
                inst: 10,
                addr: 0x1000,
                size: 4,
            },
            Event::BeforeMemRead {
                thd_id: 1,
                thd_clk: 1,
                inst: 11,
                addr: 0x1000,
                size: 4,
            },
        ]
    }

    fn ctx_in(dir: &std::path::Path) -> RuntimeContext {
        let cfg = Config {
            iroot_db: dir.join("iroot.db"),
            memo_db: dir.join("memo.db"),
            sinst_db: dir.join("sinst.db"),
            race_db: dir.join("race.db"),
            test_history: dir.join("test.histo"),
            static_info_db: dir.join("sinfo.db"),
            ..Config::default()
        };
        RuntimeContext::new(cfg)
    }

    #[test]
    fn profile_then_reload() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Profiler::new(ctx_in(dir.path())).unwrap();
        profiler.run(events_idiom1()).unwrap();
        assert_eq!(profiler.iroot_db.iroot_count(), 1);
        assert!(profiler.sinst_db.shared(10));
        assert!(profiler.sinst_db.shared(11));

        // a second profiler sees the persisted state
        let profiler2 = Profiler::new(ctx_in(dir.path())).unwrap();
        assert_eq!(profiler2.iroot_db.iroot_count(), 1);
        assert_eq!(profiler2.memo.candidate_count(), 1);
    }

    #[test]
    fn tester_without_candidates_has_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let tester = ActiveTester::new(
            ctx_in(dir.path()),
            Arc::new(NoopPrio),
            Arc::new(crate::sched::NullInstrumentation),
        )
        .unwrap();
        assert!(!tester.has_target());
        tester.finish().unwrap();
    }

    #[test]
    fn profile_then_test_exposes() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Profiler::new(ctx_in(dir.path())).unwrap();
        profiler.run(events_idiom1()).unwrap();

        let tester = ActiveTester::new(
            ctx_in(dir.path()),
            Arc::new(NoopPrio),
            Arc::new(crate::sched::NullInstrumentation),
        )
        .unwrap();
        assert!(tester.has_target());
        let events = vec![
            Event::ThreadStart {
                thd_id: 0,
                parent_thd_id: INVALID_THREAD_ID,
            },
            Event::ThreadStart {
                thd_id: 1,
                parent_thd_id: 0,
            },
            Event::BeforeMemWrite {
                thd_id: 0,
                thd_clk: 1,
                inst: 10,
                addr: 0x1000,
                size: 4,
            },
            Event::AfterMemWrite {
                thd_id: 0,
                thd_clk: 1,
                inst: 10,
                addr: 0x1000,
                size: 4,
            },
            Event::BeforeMemRead {
                thd_id: 1,
                thd_clk: 1,
                inst: 11,
                addr: 0x1000,
                size: 4,
            },
            Event::AfterMemRead {
                thd_id: 1,
                thd_clk: 1,
                inst: 11,
                addr: 0x1000,
                size: 4,
            },
        ];
        tester.run(events).unwrap();
        let scheduler = tester.scheduler().unwrap();
        assert!(scheduler.exposed());

        // the exposure was persisted
        let memo_check = ActiveTester::new(
            ctx_in(dir.path()),
            Arc::new(NoopPrio),
            Arc::new(crate::sched::NullInstrumentation),
        )
        .unwrap();
        // the only candidate is exposed now, nothing left to test
        assert!(!memo_check.has_target());
    }

    #[test]
    fn pthread_image_accesses_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let profiler = Profiler::new(ctx_in(dir.path())).unwrap();
        // register inst 10 as coming from the pthread library
        let libpthread = profiler
            .static_info
            .get_image("libpthread.so.0", crate::static_info::ImageKind::Pthread);
        let pthread_inst = profiler.static_info.get_inst(libpthread, 0x40);
        assert_eq!(pthread_inst, 0);

        let mut events = events_idiom1();
        // rewrite the writer's instruction to the pthread one
        for e in &mut events {
            if let Event::BeforeMemWrite { inst, .. } = e {
                *inst = pthread_inst;
            }
        }
        profiler.run(events).unwrap();
        assert_eq!(profiler.iroot_db.iroot_count(), 0);
    }

    #[test]
    fn race_profiler_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let rp = RaceProfiler::new(ctx_in(dir.path())).unwrap();
        let events = vec![
            Event::ThreadStart {
                thd_id: 0,
                parent_thd_id: INVALID_THREAD_ID,
            },
            Event::ThreadStart {
                thd_id: 1,
                parent_thd_id: 0,
            },
            Event::AfterMalloc {
                thd_id: 0,
                thd_clk: 0,
                inst: 0,
                size: 0x100,
                addr: 0x2000,
            },
            Event::BeforeMemWrite {
                thd_id: 0,
                thd_clk: 1,
                inst: 10,
                addr: 0x2000,
                size: 4,
            },
            Event::BeforeMemWrite {
                thd_id: 1,
                thd_clk: 1,
                inst: 11,
                addr: 0x2000,
                size: 4,
            },
        ];
        rp.run(events).unwrap();
        assert_eq!(rp.race_db.race_count(), 1);

        let rp2 = RaceProfiler::new(ctx_in(dir.path())).unwrap();
        assert_eq!(rp2.race_db.race_count(), 1);
    }

    struct NoopPrio;

    impl PriorityOps for NoopPrio {
        fn set_priority(&self, _os_tid: i32, _raw: i32) -> std::io::Result<()> {
            Ok(())
        }
        fn set_affinity(&self, _cpu: usize) -> std::io::Result<()> {
            Ok(())
        }
    }
}
