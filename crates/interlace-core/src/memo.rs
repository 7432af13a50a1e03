//! Memoization database.
//!
//! Remembers which iRoots have been observed and how active tests of them
//! went, so successive runs spend their time on candidates that are still
//! unconfirmed.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::iroot::{IRootDB, IRootId, IdiomType};

/// Test bookkeeping for one candidate iRoot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Candidate {
    /// Times observed by a primary observer.
    pub observed: u64,
    /// Times observed by a shadow observer (auxiliary, does not count
    /// toward first-observation accounting).
    pub shadow_observed: u64,
    /// Active test runs consumed by this candidate.
    pub total_test_runs: u64,
    /// Whether an active test ever exposed it.
    pub exposed: bool,
    /// Failed active test runs.
    pub failed: u64,
    /// Whether the candidate involves an asynchronous pattern; such
    /// candidates are tested with delay-based yields.
    pub async_hint: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MemoTables {
    candidates: BTreeMap<IRootId, Candidate>,
}

/// Memoization over candidate iRoots.
pub struct Memo {
    iroot_db: Arc<IRootDB>,
    tables: Mutex<MemoTables>,
}

impl Memo {
    pub fn new(iroot_db: Arc<IRootDB>) -> Self {
        Self {
            iroot_db,
            tables: Mutex::new(MemoTables::default()),
        }
    }

    /// Record an observation of `iroot`.
    pub fn observed(&self, iroot: IRootId, shadow: bool) {
        let mut t = self.tables.lock().unwrap();
        let c = t.candidates.entry(iroot).or_default();
        if shadow {
            c.shadow_observed += 1;
        } else {
            c.observed += 1;
        }
    }

    /// Times `iroot` has been observed (primary observers only).
    pub fn observed_count(&self, iroot: IRootId) -> u64 {
        self.tables
            .lock()
            .unwrap()
            .candidates
            .get(&iroot)
            .map(|c| c.observed)
            .unwrap_or(0)
    }

    /// Choose the next candidate to test: the unexposed candidate with the
    /// fewest test runs, lowest id on ties. Returns `None` when every
    /// candidate is exposed or the table is empty.
    pub fn choose_for_test(&self) -> Option<IRootId> {
        self.choose_filtered(|_| true)
    }

    /// Like [`choose_for_test`](Self::choose_for_test) restricted to one
    /// idiom.
    pub fn choose_for_test_idiom(&self, idiom: IdiomType) -> Option<IRootId> {
        self.choose_filtered(|id| {
            self.iroot_db
                .find_iroot(id)
                .map(|r| r.idiom == idiom)
                .unwrap_or(false)
        })
    }

    /// Select an explicit candidate id. Returns `None` when the id is not
    /// interned — an invalid target is a configuration error.
    pub fn choose_for_test_id(&self, id: IRootId) -> Option<IRootId> {
        self.iroot_db.find_iroot(id).map(|r| r.id)
    }

    fn choose_filtered(&self, pred: impl Fn(IRootId) -> bool) -> Option<IRootId> {
        let t = self.tables.lock().unwrap();
        t.candidates
            .iter()
            .filter(|&(&id, ref c)| !c.exposed && pred(id))
            .min_by_key(|&(&id, ref c)| (c.total_test_runs, id))
            .map(|(&id, _)| id)
    }

    /// Record a successful exposure of `iroot`.
    pub fn test_success(&self, iroot: IRootId) {
        let mut t = self.tables.lock().unwrap();
        let c = t.candidates.entry(iroot).or_default();
        c.total_test_runs += 1;
        c.exposed = true;
        debug!("iroot {iroot} exposed after {} runs", c.total_test_runs);
    }

    /// Record a failed exposure attempt of `iroot`.
    pub fn test_fail(&self, iroot: IRootId) {
        let mut t = self.tables.lock().unwrap();
        let c = t.candidates.entry(iroot).or_default();
        c.total_test_runs += 1;
        c.failed += 1;
    }

    pub fn total_test_runs(&self, iroot: IRootId) -> u64 {
        self.tables
            .lock()
            .unwrap()
            .candidates
            .get(&iroot)
            .map(|c| c.total_test_runs)
            .unwrap_or(0)
    }

    pub fn async_hint(&self, iroot: IRootId) -> bool {
        self.tables
            .lock()
            .unwrap()
            .candidates
            .get(&iroot)
            .map(|c| c.async_hint)
            .unwrap_or(false)
    }

    pub fn set_async_hint(&self, iroot: IRootId) {
        let mut t = self.tables.lock().unwrap();
        t.candidates.entry(iroot).or_default().async_hint = true;
    }

    /// Drop candidates that no longer need testing: exposed ones, and —
    /// when `memo_failed` is on — ones whose failures exhausted their
    /// usefulness without a single plain observation.
    pub fn refine_candidate(&self, memo_failed: bool) {
        let mut t = self.tables.lock().unwrap();
        let before = t.candidates.len();
        t.candidates.retain(|_, c| {
            if c.exposed {
                return false;
            }
            if memo_failed && c.failed > 0 && c.observed == 0 {
                return false;
            }
            true
        });
        debug!("refine_candidate: {} -> {}", before, t.candidates.len());
    }

    pub fn candidate(&self, iroot: IRootId) -> Option<Candidate> {
        self.tables.lock().unwrap().candidates.get(&iroot).cloned()
    }

    pub fn candidate_count(&self) -> usize {
        self.tables.lock().unwrap().candidates.len()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let loaded: MemoTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}
