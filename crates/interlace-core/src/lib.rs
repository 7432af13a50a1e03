//! # interlace-core
//!
//! **Expose concurrency bugs by forcing the interleavings that trigger
//! them.**
//!
//! `interlace-core` consumes a multi-threaded program's instrumented
//! event stream (memory accesses, lock operations, condition waits,
//! barriers, allocations) and does three things with it:
//!
//! - the [`observer::Observer`] discovers *iRoots* — small ordered
//!   combinations of conflicting events across threads, in five idiom
//!   shapes — and memoizes them as candidate bug scenarios;
//! - the [`sched::ActiveScheduler`] takes one candidate and steers the
//!   OS scheduler (CPU pinning plus priority manipulation) to force that
//!   interleaving to actually occur, confirming its reachability;
//! - the [`race::RaceDetector`] reports happens-before data races over
//!   the same stream.
//!
//! ## Quick start
//!
//! ```no_run
//! use interlace_core::config::{Config, RuntimeContext};
//! use interlace_core::controller::Profiler;
//!
//! let ctx = RuntimeContext::new(Config::default());
//! let profiler = Profiler::new(ctx).unwrap();
//! let events: Vec<interlace_core::Event> = Vec::new();
//! profiler.run(events).unwrap();
//! println!("{} candidate iroots", profiler.memo.candidate_count());
//! ```
//!
//! ## Architecture
//!
//! Events → Analyzer trait → {Observer | ActiveScheduler | RaceDetector}
//!
//! Every component serializes its own work behind one internal mutex and
//! treats the interning databases ([`iroot::IRootDB`], [`memo::Memo`],
//! [`sinst::SharedInstDB`], [`race::RaceDB`]) as serializable lookups
//! with locks of their own. Controllers in [`controller`] bind an event
//! source to a component set and persist the databases at exit.

pub mod config;
pub mod controller;
pub mod event;
pub mod filter;
pub mod history;
pub mod iroot;
pub mod memo;
pub mod observer;
pub mod race;
pub mod sched;
pub mod sinst;
pub mod stat;
pub mod static_info;
pub mod types;
pub mod vector_clock;

pub use config::{Config, RuntimeContext};
pub use controller::{ActiveTester, Profiler, RaceProfiler, run_events};
pub use event::{Analyzer, Event, dispatch};
pub use iroot::{IRootDB, IRootEventType, IdiomType};
pub use memo::Memo;
pub use observer::Observer;
pub use race::{RaceDB, RaceDetector};
pub use sched::{ActiveScheduler, InstrumentationOps, NullInstrumentation, choose_target};
pub use sched::priority::{OsPriorityOps, PriorityOps};
pub use vector_clock::VectorClock;

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
