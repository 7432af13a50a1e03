//! Shared state-machine machinery.
//!
//! Every idiom machine works over the same vocabulary: event slots pinned
//! to `(thread, addr, size)`, a delay set of demoted threads, a give-up
//! budget implementing backpressure, per-dependency window counters, and
//! a command list the driver applies after each step (priority writes,
//! code-cache flushes, exposure).

use std::collections::HashSet;

use rand::Rng;
use rand::rngs::StdRng;

use crate::iroot::IRootEventType;
use crate::sched::priority::PriorityLevel;
use crate::static_info::InstId;
use crate::types::{Address, ThreadId, ranges_overlap};

/// One target event of the current iRoot: what to match at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetEvent {
    pub inst: InstId,
    pub event_type: IRootEventType,
}

/// A claimed event slot.
#[derive(Debug, Clone, Copy)]
pub struct Slot {
    pub thd_id: ThreadId,
    pub addr: Address,
    pub size: u64,
}

impl Slot {
    pub fn overlaps(&self, addr: Address, size: u64) -> bool {
        ranges_overlap(self.addr, self.size, addr, size)
    }
}

/// Side effects a machine step asks the driver to perform, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cmd {
    SetPriority(ThreadId, PriorityLevel),
    /// Restore every delayed thread to `Normal` and clear the delay set.
    WakeDelaySet,
    /// Re-instrument the program with the current watch callbacks.
    FlushCache,
    /// The target interleaving completed.
    Exposed,
}

/// Outcome of one machine step.
#[derive(Debug, Default)]
pub struct Step {
    pub cmds: Vec<Cmd>,
    /// The calling thread must sleep one delay unit and re-deliver the
    /// event (give-up backpressure).
    pub retry: bool,
}

impl Step {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn cmds(cmds: Vec<Cmd>) -> Self {
        Self { cmds, retry: false }
    }

    pub fn retry(cmds: Vec<Cmd>) -> Self {
        Self { cmds, retry: true }
    }
}

/// Accumulated give-up delay, bounded per slot and in total.
#[derive(Debug)]
pub struct GiveupBudget {
    unit: u64,
    min_each: u64,
    max_total: u64,
    per_slot: [u64; 4],
    total: u64,
}

impl GiveupBudget {
    pub fn new(unit: u64, min_each: u64, max_total: u64) -> Self {
        Self {
            unit,
            min_each,
            max_total,
            per_slot: [0; 4],
            total: 0,
        }
    }

    /// Whether the scenario around slot `idx` must be abandoned. While
    /// budget remains this charges one delay unit and returns `false`
    /// (sleep and retry); once a bound is hit it returns `true` without
    /// charging.
    pub fn check_giveup(&mut self, idx: usize) -> bool {
        if self.per_slot[idx] >= self.min_each || self.total >= self.max_total {
            return true;
        }
        self.per_slot[idx] += self.unit;
        self.total += self.unit;
        false
    }

    pub fn reset_slot(&mut self, idx: usize) {
        self.per_slot[idx] = 0;
    }

    pub fn slot_delay(&self, idx: usize) -> u64 {
        self.per_slot[idx]
    }

    pub fn total_delay(&self) -> u64 {
        self.total
    }
}

/// State shared by all idiom machines.
#[derive(Debug)]
pub struct MachineCtx {
    pub target: Vec<TargetEvent>,
    pub slots: [Option<Slot>; 4],
    pub delay_set: HashSet<ThreadId>,
    pub budget: GiveupBudget,
    /// Window counters for the two dependency halves.
    pub windows: [u64; 2],
    /// Addresses touched during watch phases, for the first event of each
    /// dependency half.
    pub access_sets: [Vec<(Address, u64)>; 2],
    pub vw: u64,
    pub idiom4_watch_fallthrough: bool,
    rng: StdRng,
}

impl MachineCtx {
    pub fn new(
        target: Vec<TargetEvent>,
        vw: u64,
        budget: GiveupBudget,
        idiom4_watch_fallthrough: bool,
        rng: StdRng,
    ) -> Self {
        Self {
            target,
            slots: [None; 4],
            delay_set: HashSet::new(),
            budget,
            windows: [0; 2],
            access_sets: [Vec::new(), Vec::new()],
            vw,
            idiom4_watch_fallthrough,
            rng,
        }
    }

    /// Indices of target events matching `(inst, event_type)`.
    pub fn matches(&self, inst: InstId, event_type: IRootEventType) -> Vec<usize> {
        self.target
            .iter()
            .enumerate()
            .filter(|(_, t)| t.inst == inst && t.event_type == event_type)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn slot(&self, idx: usize) -> Option<Slot> {
        self.slots[idx]
    }

    pub fn fill_slot(&mut self, idx: usize, thd_id: ThreadId, addr: Address, size: u64) {
        self.slots[idx] = Some(Slot { thd_id, addr, size });
    }

    pub fn clear_slots_from(&mut self, idx: usize) {
        for slot in self.slots.iter_mut().skip(idx) {
            *slot = None;
        }
    }

    /// Biased coin for slot reclaiming: 50% in early states, 20% once a
    /// longer chain is open.
    pub fn reclaim_roll(&mut self, deep: bool) -> bool {
        let p = if deep { 0.2 } else { 0.5 };
        self.rng.random_bool(p)
    }

    pub fn record_access(&mut self, set_idx: usize, addr: Address, size: u64) {
        self.access_sets[set_idx].push((addr, size));
    }

    pub fn access_set_overlaps(&self, set_idx: usize, addr: Address, size: u64) -> bool {
        self.access_sets[set_idx]
            .iter()
            .any(|&(a, s)| ranges_overlap(a, s, addr, size))
    }

    pub fn clear_access_set(&mut self, set_idx: usize) {
        self.access_sets[set_idx].clear();
    }

    /// Commands that wake the delay set and return the named threads to
    /// `Normal`; used by every reset path.
    pub fn reset_cmds(&mut self, threads: &[ThreadId]) -> Vec<Cmd> {
        let mut cmds = vec![Cmd::WakeDelaySet];
        for &t in threads {
            cmds.push(Cmd::SetPriority(t, PriorityLevel::Normal));
        }
        cmds
    }

    /// Threads currently pinned in slots.
    pub fn slot_threads(&self) -> Vec<ThreadId> {
        let mut out = Vec::new();
        for slot in self.slots.iter().flatten() {
            if !out.contains(&slot.thd_id) {
                out.push(slot.thd_id);
            }
        }
        out
    }
}

/// One per-idiom state machine, stepped by the driver.
pub trait IdiomMachine: Send {
    /// A thread is about to perform an access; `matches` holds the target
    /// event indices whose (inst, type) equal the access.
    fn on_before_access(
        &mut self,
        ctx: &mut MachineCtx,
        thd_id: ThreadId,
        addr: Address,
        size: u64,
        matches: &[usize],
    ) -> Step;

    /// A thread completed an access that matched target index `idx` in
    /// `on_before_access`.
    fn on_after_access(
        &mut self,
        ctx: &mut MachineCtx,
        thd_id: ThreadId,
        addr: Address,
        size: u64,
        matches: &[usize],
    ) -> Step;

    /// Periodic per-thread instruction count.
    fn on_inst_count(&mut self, ctx: &mut MachineCtx, thd_id: ThreadId, count: u64) -> Step;

    /// The machine reached its terminal state.
    fn done(&self) -> bool;

    /// Whether the machine is in its initial state with nothing claimed.
    fn idle(&self) -> bool;

    fn state_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn giveup_budget_respects_bounds() {
        let mut b = GiveupBudget::new(10, 30, 100);
        assert!(!b.check_giveup(0));
        assert!(!b.check_giveup(0));
        assert!(!b.check_giveup(0));
        // per-slot bound reached
        assert!(b.check_giveup(0));
        assert_eq!(b.slot_delay(0), 30);
        // other slots still have budget until the total runs out
        assert!(!b.check_giveup(1));
        assert_eq!(b.total_delay(), 40);
    }

    #[test]
    fn giveup_budget_total_bound() {
        let mut b = GiveupBudget::new(50, 1000, 100);
        assert!(!b.check_giveup(0));
        assert!(!b.check_giveup(1));
        // total bound reached regardless of slot
        assert!(b.check_giveup(2));
        assert_eq!(b.total_delay(), 100);
    }

    #[test]
    fn giveup_overshoot_is_at_most_one_unit() {
        let mut b = GiveupBudget::new(7, 20, 1000);
        while !b.check_giveup(0) {}
        assert!(b.slot_delay(0) <= 20 + 7);
    }

    fn ctx() -> MachineCtx {
        MachineCtx::new(
            vec![
                TargetEvent {
                    inst: 1,
                    event_type: IRootEventType::MemWrite,
                },
                TargetEvent {
                    inst: 2,
                    event_type: IRootEventType::MemRead,
                },
            ],
            1000,
            GiveupBudget::new(1, 10, 100),
            false,
            StdRng::seed_from_u64(0),
        )
    }

    #[test]
    fn matching_finds_indices() {
        let ctx = ctx();
        assert_eq!(ctx.matches(1, IRootEventType::MemWrite), vec![0]);
        assert_eq!(ctx.matches(2, IRootEventType::MemRead), vec![1]);
        assert!(ctx.matches(1, IRootEventType::MemRead).is_empty());
    }

    #[test]
    fn slot_overlap() {
        let mut ctx = ctx();
        ctx.fill_slot(0, 0, 0x100, 4);
        let s = ctx.slot(0).unwrap();
        assert!(s.overlaps(0x102, 4));
        assert!(!s.overlaps(0x104, 4));
    }

    #[test]
    fn clear_slots_from_keeps_prefix() {
        let mut ctx = ctx();
        ctx.fill_slot(0, 0, 0x100, 4);
        ctx.fill_slot(1, 1, 0x200, 4);
        ctx.clear_slots_from(1);
        assert!(ctx.slot(0).is_some());
        assert!(ctx.slot(1).is_none());
    }

    #[test]
    fn access_sets_track_ranges() {
        let mut ctx = ctx();
        ctx.record_access(0, 0x100, 4);
        assert!(ctx.access_set_overlaps(0, 0x102, 2));
        assert!(!ctx.access_set_overlaps(0, 0x104, 4));
        assert!(!ctx.access_set_overlaps(1, 0x100, 4));
        ctx.clear_access_set(0);
        assert!(!ctx.access_set_overlaps(0, 0x100, 4));
    }
}
