//! End-to-end race detection scenarios.

use interlace_core::race::RaceEventType;
use interlace_tests::{HEAP_BASE, TraceBuilder, race_trace, scenario_config};

const X: u64 = HEAP_BASE + 0x200;

#[test]
fn lock_protected_writes_do_not_race() {
    let dir = tempfile::tempdir().unwrap();
    let mutex = 0x500;
    let mut b = TraceBuilder::with_threads(2);
    b.lock(0, 1, mutex)
        .w(0, 10, X)
        .unlock(0, 2, mutex)
        .lock(1, 1, mutex)
        .w(1, 11, X)
        .unlock(1, 2, mutex);
    let profiler = race_trace(scenario_config(dir.path()), b.build());
    assert_eq!(profiler.race_db.race_count(), 0);
}

#[test]
fn unsynchronized_writes_race() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, X).w(1, 11, X);
    let profiler = race_trace(scenario_config(dir.path()), b.build());

    assert_eq!(profiler.race_db.race_count(), 1);
    let race = &profiler.race_db.races()[0];
    let e0 = profiler.race_db.find_static_event(race.events[0]).unwrap();
    let e1 = profiler.race_db.find_static_event(race.events[1]).unwrap();
    assert_eq!((e0.inst, e0.event_type), (10, RaceEventType::Write));
    assert_eq!((e1.inst, e1.event_type), (11, RaceEventType::Write));
}

#[test]
fn parent_child_creation_orders_accesses() {
    // the child thread starts after the parent's write: the clocks are
    // ordered by the fork join and no race is reported
    use interlace_core::event::Event;
    use interlace_core::types::INVALID_THREAD_ID;

    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::default();
    b.push(Event::ThreadStart {
        thd_id: 0,
        parent_thd_id: INVALID_THREAD_ID,
    })
    .push(Event::AfterMalloc {
        thd_id: 0,
        thd_clk: 0,
        inst: 0,
        size: 0x1000,
        addr: X,
    })
    .w(0, 10, X)
    .push(Event::ThreadStart {
        thd_id: 1,
        parent_thd_id: 0,
    })
    .r(1, 11, X);
    let profiler = race_trace(scenario_config(dir.path()), b.build());
    assert_eq!(profiler.race_db.race_count(), 0);
}

#[test]
fn sibling_threads_race_without_synchronization() {
    // both threads started before either access: nothing orders them
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, X).r(1, 11, X);
    let profiler = race_trace(scenario_config(dir.path()), b.build());
    assert_eq!(profiler.race_db.race_count(), 1);
}

#[test]
fn static_races_deduplicate_dynamic_reports() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    // the same instruction pair races twice at two addresses
    b.w(0, 10, X).w(1, 11, X).w(0, 10, X + 0x40).w(1, 11, X + 0x40);
    let profiler = race_trace(scenario_config(dir.path()), b.build());
    assert!(profiler.race_db.race_count() >= 2);
    assert_eq!(profiler.race_db.static_race_count(), 1);
}

#[test]
fn race_db_round_trips_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let mut b = TraceBuilder::with_threads(2);
    b.w(0, 10, X).w(1, 11, X);
    let profiler = race_trace(scenario_config(dir.path()), b.build());
    assert_eq!(profiler.race_db.race_count(), 1);

    let mut b2 = TraceBuilder::with_threads(2);
    b2.w(0, 10, X).w(1, 11, X);
    let profiler2 = race_trace(scenario_config(dir.path()), b2.build());
    // prior run's races loaded, new one appended under a new exec id
    let races = profiler2.race_db.races();
    assert_eq!(races.len(), 2);
    assert_ne!(races[0].exec_id, races[1].exec_id);
}
