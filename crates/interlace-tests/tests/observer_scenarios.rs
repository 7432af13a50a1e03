//! End-to-end observation scenarios: literal event streams in, recorded
//! iRoots out.

use interlace_core::iroot::{IRootDB, IRootEventType, IdiomType};
use interlace_tests::{HEAP_BASE, TraceBuilder, profile_trace, scenario_config};

const A: u64 = HEAP_BASE;
const B: u64 = HEAP_BASE + 0x100;

fn shapes(db: &IRootDB, idiom: IdiomType) -> Vec<Vec<(u32, IRootEventType)>> {
    db.iroots_of_idiom(idiom)
        .into_iter()
        .map(|r| {
            r.events
                .iter()
                .map(|&e| {
                    let ev = db.find_event(e).unwrap();
                    (ev.inst, ev.event_type)
                })
                .collect()
        })
        .collect()
}

#[test]
fn idiom1_discovery() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, A).r(1, 11, A);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());

    let found = shapes(&profiler.iroot_db, IdiomType::Idiom1);
    assert_eq!(
        found,
        vec![vec![
            (10, IRootEventType::MemWrite),
            (11, IRootEventType::MemRead),
        ]]
    );
    // recorded through the memoization database
    let iroot = profiler.iroot_db.iroots_of_idiom(IdiomType::Idiom1)[0].id;
    assert_eq!(profiler.memo.observed_count(iroot), 1);
}

#[test]
fn idiom2_discovery_within_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, A).r(1, 11, A).w(0, 12, A);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());

    let found = shapes(&profiler.iroot_db, IdiomType::Idiom2);
    assert_eq!(
        found,
        vec![vec![
            (10, IRootEventType::MemWrite),
            (11, IRootEventType::MemRead),
            (12, IRootEventType::MemWrite),
        ]]
    );
}

#[test]
fn idiom2_not_discovered_outside_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = scenario_config(dir.path());
    cfg.vw = 10;
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, A).r(1, 11, A);
    // the round trip closes far outside the window
    b.set_clock(0, 500).w(0, 12, A);
    let profiler = profile_trace(cfg, b.build());
    assert!(shapes(&profiler.iroot_db, IdiomType::Idiom2).is_empty());
}

#[test]
fn idiom5_discovery_with_mirror() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    // two independent conflicts interleaved: T0 touches A then B, the
    // remote thread touches B then A in between
    b.w(0, 10, A).w(1, 12, B).r(1, 11, A).r(0, 13, B);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());

    let found = shapes(&profiler.iroot_db, IdiomType::Idiom5);
    assert!(found.contains(&vec![
        (10, IRootEventType::MemWrite),
        (11, IRootEventType::MemRead),
        (12, IRootEventType::MemWrite),
        (13, IRootEventType::MemRead),
    ]));
    assert!(found.contains(&vec![
        (12, IRootEventType::MemWrite),
        (13, IRootEventType::MemRead),
        (10, IRootEventType::MemWrite),
        (11, IRootEventType::MemRead),
    ]));
    assert_eq!(found.len(), 2);
}

#[test]
fn idiom3_and_idiom4_split_on_location() {
    let dir = tempfile::tempdir().unwrap();
    // same four-event pattern; once on one location, once across two
    let mut same_loc = TraceBuilder::with_threads(2);
    same_loc.w(0, 10, A).r(1, 11, A).w(1, 12, A).r(0, 13, A);
    let profiler = profile_trace(scenario_config(dir.path()), same_loc.build());
    assert_eq!(shapes(&profiler.iroot_db, IdiomType::Idiom3).len(), 1);
    assert!(shapes(&profiler.iroot_db, IdiomType::Idiom4).is_empty());

    let dir2 = tempfile::tempdir().unwrap();
    let mut cross_loc = TraceBuilder::with_threads(2);
    cross_loc.w(0, 10, A).r(1, 11, A).w(1, 12, B).r(0, 13, B);
    let profiler2 = profile_trace(scenario_config(dir2.path()), cross_loc.build());
    assert!(shapes(&profiler2.iroot_db, IdiomType::Idiom3).is_empty());
    assert_eq!(shapes(&profiler2.iroot_db, IdiomType::Idiom4).len(), 1);
}

#[test]
fn mutex_unlock_lock_pairs_feed_idiom1() {
    let dir = tempfile::tempdir().unwrap();
    let mutex = 0x500;
    let mut b = TraceBuilder::with_threads(2);
    b.lock(0, 20, mutex)
        .unlock(0, 21, mutex)
        .lock(1, 22, mutex)
        .unlock(1, 23, mutex);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());

    let found = shapes(&profiler.iroot_db, IdiomType::Idiom1);
    assert!(found.contains(&vec![
        (21, IRootEventType::MutexUnlock),
        (22, IRootEventType::MutexLock),
    ]));
}

#[test]
fn shared_inst_database_marks_cross_thread_instructions() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, A).r(1, 11, A).w(0, 30, B);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());
    assert!(profiler.sinst_db.shared(10));
    assert!(profiler.sinst_db.shared(11));
    // inst 30 never observed from a second thread
    assert!(!profiler.sinst_db.shared(30));
}

#[test]
fn databases_round_trip_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, A).r(1, 11, A);
    let profiler = profile_trace(scenario_config(dir.path()), b.build());
    let count = profiler.iroot_db.iroot_count();
    assert!(count >= 1);

    // a second run over the same trace re-observes the same identities
    let mut b2 = TraceBuilder::with_threads(2);
    b2.w(0, 10, A).r(1, 11, A);
    let profiler2 = profile_trace(scenario_config(dir.path()), b2.build());
    assert_eq!(profiler2.iroot_db.iroot_count(), count);
    let iroot = profiler2.iroot_db.iroots_of_idiom(IdiomType::Idiom1)[0].id;
    assert_eq!(profiler2.memo.observed_count(iroot), 2);
}
