//! Vector clocks for happens-before reasoning.
//!
//! A vector clock maps thread ids to logical timestamps. Comparison walks
//! both clocks in key-sorted order in lock-step, so `happens_before` is
//! linear in the number of threads present.

use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ThreadId, Timestamp};

/// Ordered thread-id → timestamp mapping. Absent threads read as 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    map: BTreeMap<ThreadId, Timestamp>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance this thread's component by one. Absent starts from 0.
    pub fn increment(&mut self, thd_id: ThreadId) {
        *self.map.entry(thd_id).or_insert(0) += 1;
    }

    pub fn get(&self, thd_id: ThreadId) -> Timestamp {
        self.map.get(&thd_id).copied().unwrap_or(0)
    }

    pub fn set(&mut self, thd_id: ThreadId, clk: Timestamp) {
        self.map.insert(thd_id, clk);
    }

    /// Pointwise maximum with `other`.
    pub fn join(&mut self, other: &VectorClock) {
        for (&thd_id, &clk) in &other.map {
            let entry = self.map.entry(thd_id).or_insert(0);
            if *entry < clk {
                *entry = clk;
            }
        }
    }

    /// Every component of `self` is ≤ the corresponding component of
    /// `other`. A component absent from `other` counts as 0, so any
    /// positive component of `self` without a partner breaks the relation.
    pub fn happens_before(&self, other: &VectorClock) -> bool {
        let mut other_it = other.map.iter().peekable();
        for (&thd_id, &clk) in &self.map {
            let mut valid = false;
            while let Some(&(&o_thd, &o_clk)) = other_it.peek() {
                if o_thd == thd_id {
                    if o_clk >= clk {
                        valid = true;
                        other_it.next();
                    }
                    break;
                } else if o_thd > thd_id {
                    break;
                }
                other_it.next();
            }
            if !valid {
                return false;
            }
        }
        true
    }

    /// Mirror of [`happens_before`](Self::happens_before).
    pub fn happens_after(&self, other: &VectorClock) -> bool {
        other.happens_before(self)
    }

    /// Iterate components in thread-id order.
    pub fn iter(&self) -> impl Iterator<Item = (ThreadId, Timestamp)> + '_ {
        self.map.iter().map(|(&t, &c)| (t, c))
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl fmt::Display for VectorClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (thd_id, clk) in &self.map {
            write!(f, "T{thd_id:x}:{clk} ")?;
        }
        write!(f, "]")
    }
}
