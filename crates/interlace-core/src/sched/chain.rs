//! Two-dependency chain machines: idioms 3, 4 and 5.
//!
//! All three share one skeleton: `T0.e0 -> T1.e1`, then `T1.e2 -> T0.e3`,
//! with the holder and the delayed side exchanging roles exactly once
//! between the halves, and one window counter per half. They differ in
//! their location discipline:
//!
//! - idiom 3: all four events conflict on one location;
//! - idiom 4: the halves conflict on two different locations;
//! - idiom 5: two independent conflicts on non-overlapping locations,
//!   with the inner pair's location untouched while it is pending.
//!
//! Two oddities are modeled deliberately. The idiom-3 alphabet keeps an
//! `E0E1Watch` state that no transition enters; it absorbs and logs.
//! The idiom-4 wait-for-e3 watch is split into `E0WatchE3` and
//! `E1WatchE3`; the `idiom4_watch_fallthrough` flag makes the first also
//! apply the second's window handling on the same tick.

use log::debug;

use crate::sched::machine::{Cmd, IdiomMachine, MachineCtx, Step};
use crate::sched::priority::PriorityLevel;
use crate::types::{Address, ThreadId};

/// Which chain idiom this machine drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainVariant {
    Idiom3,
    Idiom4,
    Idiom5,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    E0,
    E0Watch,
    E0E1,
    E1Watch,
    /// Vestigial idiom-3 state: absorbing, logs and does nothing.
    E0E1Watch,
    E2,
    E0WatchE3,
    E1WatchE3,
    E3,
    Done,
}

pub struct ChainMachine {
    variant: ChainVariant,
    state: State,
}

impl ChainMachine {
    pub fn new(variant: ChainVariant) -> Self {
        Self {
            variant,
            state: State::Init,
        }
    }

    /// Only used by tests exercising the absorbing idiom-3 state.
    #[cfg(test)]
    pub(crate) fn force_absorbing(&mut self) {
        self.state = State::E0E1Watch;
    }

    fn reset(&mut self, ctx: &mut MachineCtx) -> Vec<Cmd> {
        let threads = ctx.slot_threads();
        ctx.clear_slots_from(0);
        ctx.windows = [0; 2];
        ctx.clear_access_set(0);
        ctx.clear_access_set(1);
        self.state = State::Init;
        ctx.reset_cmds(&threads)
    }

    fn restart_with(&mut self, ctx: &mut MachineCtx, thd_id: ThreadId, addr: Address, size: u64) -> Vec<Cmd> {
        let mut cmds = self.reset(ctx);
        ctx.fill_slot(0, thd_id, addr, size);
        self.state = State::E0;
        cmds.push(Cmd::SetPriority(thd_id, PriorityLevel::High));
        cmds
    }

    /// Abandon the first half: e1/e2 never completed in the window. The
    /// holder stays parked after e0 so another remote attempt can start.
    fn abandon_first_half(&mut self, ctx: &mut MachineCtx) -> Vec<Cmd> {
        let remote = ctx.slot(1).map(|s| s.thd_id);
        ctx.clear_slots_from(1);
        ctx.windows[0] = 0;
        self.state = State::E0Watch;
        let mut cmds = vec![Cmd::WakeDelaySet];
        if let Some(remote) = remote {
            cmds.push(Cmd::SetPriority(remote, PriorityLevel::Normal));
        }
        cmds
    }

    fn release_if_delayed(ctx: &mut MachineCtx, thd_id: ThreadId, cmds: &mut Vec<Cmd>) {
        if ctx.delay_set.remove(&thd_id) {
            cmds.push(Cmd::SetPriority(thd_id, PriorityLevel::Normal));
        }
    }

    /// Whether `addr/size` is a valid location for e2 given this variant.
    fn e2_location_ok(&self, ctx: &MachineCtx, addr: Address, size: u64) -> bool {
        let slot0 = ctx.slot(0).unwrap();
        match self.variant {
            ChainVariant::Idiom3 => slot0.overlaps(addr, size),
            ChainVariant::Idiom4 | ChainVariant::Idiom5 => {
                // distinct location, untouched since e0
                !slot0.overlaps(addr, size) && !ctx.access_set_overlaps(0, addr, size)
            }
        }
    }

    /// Whether `addr/size` is a valid location for e3.
    fn e3_location_ok(&self, ctx: &MachineCtx, addr: Address, size: u64) -> bool {
        let slot0 = ctx.slot(0).unwrap();
        let slot2 = ctx.slot(2).unwrap();
        match self.variant {
            ChainVariant::Idiom3 => slot0.overlaps(addr, size),
            ChainVariant::Idiom4 => slot2.overlaps(addr, size),
            ChainVariant::Idiom5 => slot2.overlaps(addr, size) && !slot0.overlaps(addr, size),
        }
    }

    /// Conflict location guarded during the e3 watch.
    fn e3_guard_slot(&self, ctx: &MachineCtx) -> Option<crate::sched::machine::Slot> {
        match self.variant {
            ChainVariant::Idiom3 => ctx.slot(0),
            ChainVariant::Idiom4 | ChainVariant::Idiom5 => ctx.slot(2),
        }
    }

    fn uses_access_sets(&self) -> bool {
        matches!(self.variant, ChainVariant::Idiom4 | ChainVariant::Idiom5)
    }

    fn e3_wait_state(&self) -> State {
        if self.variant == ChainVariant::Idiom4 {
            State::E0WatchE3
        } else {
            State::E1WatchE3
        }
    }

    fn count_e3_window(&mut self, ctx: &mut MachineCtx, count: u64) -> Step {
        ctx.windows[1] += count;
        if ctx.windows[1] > ctx.vw {
            // e3 did not arrive inside the window: the whole scenario is
            // spent, e0 cannot be replayed
            return Step::cmds(self.reset(ctx));
        }
        Step::none()
    }
}

impl IdiomMachine for ChainMachine {
    fn on_before_access(
        &mut self,
        ctx: &mut MachineCtx,
        thd_id: ThreadId,
        addr: Address,
        size: u64,
        matches: &[usize],
    ) -> Step {
        match self.state {
            State::Init => {
                if matches.contains(&0) {
                    ctx.fill_slot(0, thd_id, addr, size);
                    self.state = State::E0;
                    return Step::cmds(vec![Cmd::SetPriority(thd_id, PriorityLevel::High)]);
                }
                Step::none()
            }
            State::E0 => {
                let holder = ctx.slot(0).unwrap();
                if matches.contains(&0) && thd_id != holder.thd_id && ctx.reclaim_roll(false) {
                    ctx.fill_slot(0, thd_id, addr, size);
                    return Step::cmds(vec![
                        Cmd::SetPriority(holder.thd_id, PriorityLevel::Normal),
                        Cmd::SetPriority(thd_id, PriorityLevel::High),
                    ]);
                }
                Step::none()
            }
            State::E0Watch => {
                let holder = ctx.slot(0).unwrap();
                if thd_id != holder.thd_id
                    && matches.contains(&1)
                    && holder.overlaps(addr, size)
                {
                    ctx.fill_slot(1, thd_id, addr, size);
                    self.state = State::E0E1;
                    let mut cmds = Vec::new();
                    Self::release_if_delayed(ctx, thd_id, &mut cmds);
                    return Step::cmds(cmds);
                }
                if thd_id != holder.thd_id && matches.contains(&0) && ctx.reclaim_roll(true) {
                    return Step::cmds(self.restart_with(ctx, thd_id, addr, size));
                }
                if holder.overlaps(addr, size) {
                    if thd_id == holder.thd_id {
                        return Step::cmds(self.reset(ctx));
                    }
                    if ctx.budget.check_giveup(1) {
                        return Step::cmds(self.reset(ctx));
                    }
                    ctx.delay_set.insert(thd_id);
                    return Step::retry(vec![Cmd::SetPriority(thd_id, PriorityLevel::Min)]);
                }
                if self.uses_access_sets() {
                    ctx.record_access(0, addr, size);
                }
                let mut cmds = Vec::new();
                Self::release_if_delayed(ctx, thd_id, &mut cmds);
                Step::cmds(cmds)
            }
            State::E1Watch => {
                let holder = ctx.slot(0).unwrap();
                let remote = ctx.slot(1).unwrap();
                if thd_id == remote.thd_id
                    && matches.contains(&2)
                    && self.e2_location_ok(ctx, addr, size)
                {
                    ctx.fill_slot(2, thd_id, addr, size);
                    self.state = State::E2;
                    return Step::none();
                }
                if thd_id == holder.thd_id && holder.overlaps(addr, size) {
                    // the parked holder got scheduled onto the first
                    // conflict location: candidate gone
                    return Step::cmds(self.reset(ctx));
                }
                if thd_id == remote.thd_id && holder.overlaps(addr, size) {
                    // the remote thread broke its own local pair
                    return Step::cmds(self.abandon_first_half(ctx));
                }
                if thd_id != holder.thd_id && thd_id != remote.thd_id && holder.overlaps(addr, size) {
                    if ctx.budget.check_giveup(2) {
                        return Step::cmds(self.reset(ctx));
                    }
                    ctx.delay_set.insert(thd_id);
                    return Step::retry(vec![Cmd::SetPriority(thd_id, PriorityLevel::Min)]);
                }
                if self.uses_access_sets() && !(thd_id == remote.thd_id && matches.contains(&2)) {
                    ctx.record_access(0, addr, size);
                }
                let mut cmds = Vec::new();
                Self::release_if_delayed(ctx, thd_id, &mut cmds);
                Step::cmds(cmds)
            }
            State::E0WatchE3 | State::E1WatchE3 => {
                let holder = ctx.slot(0).unwrap();
                let guard = self.e3_guard_slot(ctx).unwrap();
                if thd_id == holder.thd_id
                    && matches.contains(&3)
                    && self.e3_location_ok(ctx, addr, size)
                {
                    ctx.fill_slot(3, thd_id, addr, size);
                    self.state = State::E3;
                    return Step::none();
                }
                if thd_id == holder.thd_id && guard.overlaps(addr, size) {
                    // holder touched the guarded location with something
                    // other than e3
                    return Step::cmds(self.reset(ctx));
                }
                if thd_id != holder.thd_id && guard.overlaps(addr, size) {
                    if ctx.budget.check_giveup(3) {
                        return Step::cmds(self.reset(ctx));
                    }
                    ctx.delay_set.insert(thd_id);
                    return Step::retry(vec![Cmd::SetPriority(thd_id, PriorityLevel::Min)]);
                }
                if self.uses_access_sets() {
                    ctx.record_access(1, addr, size);
                }
                let mut cmds = Vec::new();
                Self::release_if_delayed(ctx, thd_id, &mut cmds);
                Step::cmds(cmds)
            }
            State::E0E1Watch => {
                debug!("idiom3 absorbing state reached, ignoring event");
                Step::none()
            }
            State::E0E1 | State::E2 | State::E3 | State::Done => Step::none(),
        }
    }

    fn on_after_access(
        &mut self,
        ctx: &mut MachineCtx,
        thd_id: ThreadId,
        _addr: Address,
        _size: u64,
        matches: &[usize],
    ) -> Step {
        match self.state {
            State::E0 => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id && matches.contains(&0) {
                    self.state = State::E0Watch;
                    ctx.clear_access_set(0);
                    return Step::cmds(vec![
                        Cmd::SetPriority(thd_id, PriorityLevel::Low),
                        Cmd::FlushCache,
                    ]);
                }
                Step::none()
            }
            State::E0E1 => {
                let remote = ctx.slot(1).unwrap();
                if thd_id == remote.thd_id && matches.contains(&1) {
                    // first half exposed; the remote thread races toward
                    // e2 inside its own window
                    self.state = State::E1Watch;
                    ctx.windows[0] = 0;
                    return Step::cmds(vec![
                        Cmd::SetPriority(remote.thd_id, PriorityLevel::High),
                        Cmd::FlushCache,
                    ]);
                }
                Step::none()
            }
            State::E2 => {
                let remote = ctx.slot(1).unwrap();
                if thd_id == remote.thd_id && matches.contains(&2) {
                    // exchange the roles exactly once: park the remote,
                    // raise the holder toward e3
                    let holder = ctx.slot(0).unwrap();
                    self.state = self.e3_wait_state();
                    ctx.windows[1] = 0;
                    ctx.clear_access_set(1);
                    return Step::cmds(vec![
                        Cmd::SetPriority(remote.thd_id, PriorityLevel::Low),
                        Cmd::SetPriority(holder.thd_id, PriorityLevel::High),
                        Cmd::FlushCache,
                    ]);
                }
                Step::none()
            }
            State::E3 => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id && matches.contains(&3) {
                    self.state = State::Done;
                    let remote = ctx.slot(1).unwrap();
                    return Step::cmds(vec![
                        Cmd::WakeDelaySet,
                        Cmd::SetPriority(holder.thd_id, PriorityLevel::Normal),
                        Cmd::SetPriority(remote.thd_id, PriorityLevel::Normal),
                        Cmd::Exposed,
                    ]);
                }
                Step::none()
            }
            State::E0E1Watch => {
                debug!("idiom3 absorbing state reached, ignoring event");
                Step::none()
            }
            _ => Step::none(),
        }
    }

    fn on_inst_count(&mut self, ctx: &mut MachineCtx, thd_id: ThreadId, count: u64) -> Step {
        match self.state {
            State::E1Watch => {
                let remote = ctx.slot(1).unwrap();
                if thd_id == remote.thd_id {
                    ctx.windows[0] += count;
                    if ctx.windows[0] > ctx.vw {
                        // e2 did not arrive inside the remote window
                        return Step::cmds(self.abandon_first_half(ctx));
                    }
                }
                Step::none()
            }
            State::E0WatchE3 => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id {
                    if ctx.idiom4_watch_fallthrough {
                        // apply the E1WatchE3 window handling on the same
                        // tick, then land in that state
                        let step = self.count_e3_window(ctx, count);
                        if self.state == State::E0WatchE3 {
                            self.state = State::E1WatchE3;
                        }
                        return step;
                    }
                    self.state = State::E1WatchE3;
                }
                Step::none()
            }
            State::E1WatchE3 => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id {
                    return self.count_e3_window(ctx, count);
                }
                Step::none()
            }
            State::E0E1Watch => {
                debug!("idiom3 absorbing state reached, ignoring event");
                Step::none()
            }
            _ => Step::none(),
        }
    }

    fn done(&self) -> bool {
        self.state == State::Done
    }

    fn idle(&self) -> bool {
        self.state == State::Init
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::Init => "init",
            State::E0 => "e0",
            State::E0Watch => "e0_watch",
            State::E0E1 => "e0_e1",
            State::E1Watch => "e1_watch",
            State::E0E1Watch => "e0_e1_watch",
            State::E2 => "e2",
            State::E0WatchE3 => "e0_watch_e3",
            State::E1WatchE3 => "e1_watch_e3",
            State::E3 => "e3",
            State::Done => "done",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::iroot::IRootEventType;
    use crate::sched::machine::{GiveupBudget, TargetEvent};
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const A: Address = 0x100;
    const B: Address = 0x200;

    fn chain_ctx() -> MachineCtx {
        let target = vec![
            TargetEvent { inst: 10, event_type: IRootEventType::MemWrite },
            TargetEvent { inst: 11, event_type: IRootEventType::MemRead },
            TargetEvent { inst: 12, event_type: IRootEventType::MemWrite },
            TargetEvent { inst: 13, event_type: IRootEventType::MemRead },
        ];
        MachineCtx::new(
            target,
            1000,
            GiveupBudget::new(1, 10, 100),
            false,
            StdRng::seed_from_u64(3),
        )
    }

    /// Drive e0 by T0 and e1 by T1, landing in the e1 watch.
    fn advance_to_e1_watch(m: &mut ChainMachine, ctx: &mut MachineCtx) {
        m.on_before_access(ctx, 0, A, 4, &[0]);
        m.on_after_access(ctx, 0, A, 4, &[0]);
        m.on_before_access(ctx, 1, A, 4, &[1]);
        m.on_after_access(ctx, 1, A, 4, &[1]);
        assert_eq!(m.state_name(), "e1_watch");
    }

    #[test]
    fn absorbing_state_ignores_everything() {
        let mut m = ChainMachine::new(ChainVariant::Idiom3);
        let mut ctx = chain_ctx();
        m.force_absorbing();
        let step = m.on_before_access(&mut ctx, 0, A, 4, &[0]);
        assert!(step.cmds.is_empty() && !step.retry);
        m.on_after_access(&mut ctx, 0, A, 4, &[0]);
        m.on_inst_count(&mut ctx, 0, 10_000);
        assert_eq!(m.state_name(), "e0_e1_watch");
        assert!(!m.done());
    }

    #[test]
    fn idiom5_rejects_e2_on_first_location() {
        let mut m = ChainMachine::new(ChainVariant::Idiom5);
        let mut ctx = chain_ctx();
        advance_to_e1_watch(&mut m, &mut ctx);
        // e2 must be on a different location than the first conflict
        m.on_before_access(&mut ctx, 1, A, 4, &[2]);
        assert_eq!(m.state_name(), "e1_watch");
        m.on_before_access(&mut ctx, 1, B, 4, &[2]);
        assert_eq!(m.state_name(), "e2");
    }

    #[test]
    fn idiom3_requires_e2_on_same_location() {
        let mut m = ChainMachine::new(ChainVariant::Idiom3);
        let mut ctx = chain_ctx();
        advance_to_e1_watch(&mut m, &mut ctx);
        // a different location does not advance the same-location chain
        m.on_before_access(&mut ctx, 1, B, 4, &[2]);
        assert_eq!(m.state_name(), "e1_watch");
        m.on_before_access(&mut ctx, 1, A, 4, &[2]);
        assert_eq!(m.state_name(), "e2");
    }

    #[test]
    fn idiom5_rejects_e2_on_dirtied_location() {
        let mut m = ChainMachine::new(ChainVariant::Idiom5);
        let mut ctx = chain_ctx();
        advance_to_e1_watch(&mut m, &mut ctx);
        // a bystander touches B between e1 and e2
        m.on_before_access(&mut ctx, 2, B, 4, &[]);
        m.on_before_access(&mut ctx, 1, B, 4, &[2]);
        assert_eq!(m.state_name(), "e1_watch");
    }

    #[test]
    fn remote_window_expiry_abandons_first_half_only() {
        let mut m = ChainMachine::new(ChainVariant::Idiom4);
        let mut ctx = chain_ctx();
        advance_to_e1_watch(&mut m, &mut ctx);
        m.on_inst_count(&mut ctx, 1, 5000);
        // back to watching for another e1; e0 is still pinned
        assert_eq!(m.state_name(), "e0_watch");
        assert!(ctx.slot(0).is_some());
        assert!(ctx.slot(1).is_none());
    }

    #[test]
    fn role_exchange_happens_once_at_e2() {
        let mut m = ChainMachine::new(ChainVariant::Idiom4);
        let mut ctx = chain_ctx();
        advance_to_e1_watch(&mut m, &mut ctx);
        m.on_before_access(&mut ctx, 1, B, 4, &[2]);
        let step = m.on_after_access(&mut ctx, 1, B, 4, &[2]);
        // the remote parks, the holder rises
        assert!(step.cmds.contains(&Cmd::SetPriority(1, PriorityLevel::Low)));
        assert!(step.cmds.contains(&Cmd::SetPriority(0, PriorityLevel::High)));
        assert_eq!(m.state_name(), "e0_watch_e3");
    }
}
