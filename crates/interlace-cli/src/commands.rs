//! Subcommand implementations.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};

use interlace_core::config::{Config, RuntimeContext};
use interlace_core::controller::{ActiveTester, Profiler, RaceProfiler};
use interlace_core::event::Event;
use interlace_core::iroot::IRootDB;
use interlace_core::memo::Memo;
use interlace_core::race::RaceDB;
use interlace_core::sched::priority::{OsPriorityOps, PriorityOps};
use interlace_core::sched::{InstrumentationOps, NullInstrumentation};
use interlace_core::static_info::StaticInfo;

use crate::CommonOpts;

/// Priority backend that only logs the commands; used without
/// `--apply-priorities` so traces can be replayed unprivileged.
struct LoggedPriorityOps;

impl PriorityOps for LoggedPriorityOps {
    fn set_priority(&self, os_tid: i32, raw: i32) -> io::Result<()> {
        debug!("set_priority tid={os_tid} -> {raw}");
        Ok(())
    }
    fn set_affinity(&self, cpu: usize) -> io::Result<()> {
        debug!("set_affinity cpu={cpu}");
        Ok(())
    }
}

fn build_config(common: &CommonOpts) -> io::Result<Config> {
    let mut cfg = match &common.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(v) = common.unit_size {
        cfg.unit_size = v;
    }
    if let Some(v) = common.vw {
        cfg.vw = v;
    }
    if let Some(v) = common.seed {
        cfg.random_seed = Some(v);
    }
    if let Some(p) = &common.iroot_db {
        cfg.iroot_db = p.clone();
    }
    if let Some(p) = &common.memo_db {
        cfg.memo_db = p.clone();
    }
    if let Some(p) = &common.sinst_db {
        cfg.sinst_db = p.clone();
    }
    if let Some(p) = &common.race_db {
        cfg.race_db = p.clone();
    }
    if let Some(p) = &common.test_history {
        cfg.test_history = p.clone();
    }
    if let Some(p) = &common.static_info_db {
        cfg.static_info_db = p.clone();
    }
    if let Some(p) = &common.stat_file {
        cfg.stat_file = Some(p.clone());
    }
    Ok(cfg)
}

fn finalize_config(cfg: Config) -> io::Result<RuntimeContext> {
    cfg.validate().map_err(io::Error::other)?;
    Ok(RuntimeContext::new(cfg))
}

/// Read a JSON-lines event trace.
fn read_trace(path: &Path) -> io::Result<Vec<Event>> {
    let text = fs::read_to_string(path)?;
    let mut events = Vec::new();
    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .map_err(|e| io::Error::other(format!("{}:{}: {e}", path.display(), lineno + 1)))?;
        events.push(event);
    }
    Ok(events)
}

pub fn profile(
    trace: &Path,
    complex_idioms: bool,
    single_var_idioms: bool,
    sync_only: bool,
    shadow: bool,
    common: &CommonOpts,
) -> io::Result<()> {
    let mut cfg = build_config(common)?;
    cfg.complex_idioms |= complex_idioms;
    cfg.single_var_idioms |= single_var_idioms;
    cfg.sync_only |= sync_only;
    cfg.shadow_observer |= shadow;
    let ctx = finalize_config(cfg)?;

    let events = read_trace(trace)?;
    info!("profiling {} events", events.len());
    let profiler = Profiler::new(ctx)?;
    profiler.run(events)?;
    println!(
        "{} iroots known, {} candidates memoized",
        profiler.iroot_db.iroot_count(),
        profiler.memo.candidate_count()
    );
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub fn test(
    trace: &Path,
    target_iroot: u32,
    target_idiom: u32,
    relaxed: bool,
    cpu: Option<usize>,
    no_memo_failed: bool,
    apply_priorities: bool,
    common: &CommonOpts,
) -> io::Result<()> {
    let mut cfg = build_config(common)?;
    cfg.target_iroot = target_iroot;
    cfg.target_idiom = target_idiom;
    if relaxed {
        cfg.strict = false;
    }
    if let Some(cpu) = cpu {
        cfg.cpu = cpu;
    }
    if no_memo_failed {
        cfg.memo_failed = false;
    }
    let strict = cfg.strict;
    let ctx = finalize_config(cfg)?;

    let priority_ops: Arc<dyn PriorityOps> = if apply_priorities {
        Arc::new(OsPriorityOps::new(strict))
    } else {
        Arc::new(LoggedPriorityOps)
    };
    let instr: Arc<dyn InstrumentationOps> = Arc::new(NullInstrumentation);

    let events = read_trace(trace)?;
    let tester = Arc::new(ActiveTester::new(ctx, priority_ops, instr)?);
    if !tester.has_target() {
        println!("no iRoot to test");
        return Ok(());
    }

    // an interrupted test still persists a failed outcome
    {
        let tester = Arc::clone(&tester);
        let _ = ctrlc::set_handler(move || {
            let _ = tester.finish();
            std::process::exit(0);
        });
    }

    tester.run(events)?;
    let scheduler = tester.scheduler().expect("target chosen");
    if scheduler.exposed() {
        println!("iroot {} exposed", scheduler.target_id());
    } else {
        println!("iroot {} not exposed", scheduler.target_id());
    }
    Ok(())
}

pub fn race(trace: &Path, track_racy_inst: bool, common: &CommonOpts) -> io::Result<()> {
    let mut cfg = build_config(common)?;
    cfg.track_racy_inst |= track_racy_inst;
    let ctx = finalize_config(cfg)?;

    let events = read_trace(trace)?;
    let profiler = RaceProfiler::new(ctx)?;
    profiler.run(events)?;
    println!(
        "{} dynamic races, {} static races",
        profiler.race_db.race_count(),
        profiler.race_db.static_race_count()
    );
    Ok(())
}

pub fn report(common: &CommonOpts) -> io::Result<()> {
    let cfg = build_config(common)?;

    if cfg.iroot_db.exists() {
        let iroot_db = IRootDB::new();
        iroot_db.load(&cfg.iroot_db)?;
        println!("iroot db: {} iroots", iroot_db.iroot_count());

        if cfg.memo_db.exists() {
            let iroot_db = Arc::new(iroot_db);
            let memo = Memo::new(Arc::clone(&iroot_db));
            memo.load(&cfg.memo_db)?;
            println!("memo db:  {} candidates", memo.candidate_count());
        }
    } else {
        println!("iroot db: not found at {}", cfg.iroot_db.display());
    }

    if cfg.race_db.exists() {
        let race_db = RaceDB::new();
        race_db.load(&cfg.race_db)?;
        println!(
            "race db:  {} dynamic races, {} static races",
            race_db.race_count(),
            race_db.static_race_count()
        );

        // resolve race instructions to image+offset when possible
        let static_info = StaticInfo::new();
        let resolved = cfg.static_info_db.exists();
        if resolved {
            static_info.load(&cfg.static_info_db)?;
        }
        for race in race_db.races() {
            let describe = |event_id| {
                let ev = race_db.find_static_event(event_id).unwrap();
                let loc = static_info
                    .find_inst(ev.inst)
                    .and_then(|inst| {
                        static_info
                            .find_image(inst.image_id)
                            .map(|img| format!("{}+0x{:x}", img.name, inst.offset))
                    })
                    .unwrap_or_else(|| format!("inst {}", ev.inst));
                format!("{loc} ({:?})", ev.event_type)
            };
            println!(
                "  race at 0x{:x}: T{} {} x T{} {}",
                race.addr,
                race.threads[0],
                describe(race.events[0]),
                race.threads[1],
                describe(race.events[1]),
            );
        }
    } else {
        println!("race db:  not found at {}", cfg.race_db.display());
    }

    Ok(())
}
