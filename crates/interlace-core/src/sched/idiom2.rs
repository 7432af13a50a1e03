//! Idiom-2 state machine: force `T0.e0 -> T1.e1 -> T0.e2`, a round trip
//! through the other thread on one location.
//!
//! Entering the second watch starts a window counter over the holder's
//! instructions; reaching the vulnerability window without e2 resets the
//! scenario. e2 must be executed by the holder of e0.

use crate::sched::machine::{Cmd, IdiomMachine, MachineCtx, Step};
use crate::sched::priority::PriorityLevel;
use crate::types::{Address, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    E0,
    E0Watch,
    E0E1,
    E0E1Watch,
    E2,
    Done,
}

pub struct Idiom2Machine {
    state: State,
}

impl Idiom2Machine {
    pub fn new() -> Self {
        Self { state: State::Init }
    }

    fn reset(&mut self, ctx: &mut MachineCtx) -> Vec<Cmd> {
        let threads = ctx.slot_threads();
        ctx.clear_slots_from(0);
        ctx.windows[0] = 0;
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

    fn release_if_delayed(ctx: &mut MachineCtx, thd_id: ThreadId, cmds: &mut Vec<Cmd>) {
        if ctx.delay_set.remove(&thd_id) {
            cmds.push(Cmd::SetPriority(thd_id, PriorityLevel::Normal));
        }
    }
}

impl Default for Idiom2Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl IdiomMachine for Idiom2Machine {
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
                let mut cmds = Vec::new();
                Self::release_if_delayed(ctx, thd_id, &mut cmds);
                Step::cmds(cmds)
            }
            State::E0E1Watch => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id && matches.contains(&2) && holder.overlaps(addr, size) {
                    // the round trip is about to close
                    ctx.fill_slot(2, thd_id, addr, size);
                    self.state = State::E2;
                    return Step::none();
                }
                if thd_id != holder.thd_id && matches.contains(&0) && ctx.reclaim_roll(true) {
                    return Step::cmds(self.restart_with(ctx, thd_id, addr, size));
                }
                if holder.overlaps(addr, size) {
                    if thd_id == holder.thd_id {
                        // the holder touched the location with something
                        // other than e2: value gone
                        return Step::cmds(self.reset(ctx));
                    }
                    if ctx.budget.check_giveup(2) {
                        return Step::cmds(self.reset(ctx));
                    }
                    ctx.delay_set.insert(thd_id);
                    return Step::retry(vec![Cmd::SetPriority(thd_id, PriorityLevel::Min)]);
                }
                let mut cmds = Vec::new();
                Self::release_if_delayed(ctx, thd_id, &mut cmds);
                Step::cmds(cmds)
            }
            State::E0E1 | State::E2 | State::Done => Step::none(),
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
                    return Step::cmds(vec![
                        Cmd::SetPriority(thd_id, PriorityLevel::Low),
                        Cmd::FlushCache,
                    ]);
                }
                Step::none()
            }
            State::E0E1 => {
                let follower = ctx.slot(1).unwrap();
                if thd_id == follower.thd_id && matches.contains(&1) {
                    // e1 done: hand the CPU back to the holder for e2,
                    // bounded by the vulnerability window
                    let holder = ctx.slot(0).unwrap();
                    self.state = State::E0E1Watch;
                    ctx.windows[0] = 0;
                    return Step::cmds(vec![
                        Cmd::SetPriority(follower.thd_id, PriorityLevel::Normal),
                        Cmd::SetPriority(holder.thd_id, PriorityLevel::High),
                        Cmd::FlushCache,
                    ]);
                }
                Step::none()
            }
            State::E2 => {
                let holder = ctx.slot(0).unwrap();
                if thd_id == holder.thd_id && matches.contains(&2) {
                    self.state = State::Done;
                    let follower = ctx.slot(1).unwrap();
                    return Step::cmds(vec![
                        Cmd::WakeDelaySet,
                        Cmd::SetPriority(holder.thd_id, PriorityLevel::Normal),
                        Cmd::SetPriority(follower.thd_id, PriorityLevel::Normal),
                        Cmd::Exposed,
                    ]);
                }
                Step::none()
            }
            _ => Step::none(),
        }
    }

    fn on_inst_count(&mut self, ctx: &mut MachineCtx, thd_id: ThreadId, count: u64) -> Step {
        if self.state == State::E0E1Watch {
            let holder = ctx.slot(0).unwrap();
            if thd_id == holder.thd_id {
                ctx.windows[0] += count;
                if ctx.windows[0] > ctx.vw {
                    // e2 did not arrive inside the window
                    return Step::cmds(self.reset(ctx));
                }
            }
        }
        Step::none()
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
            State::E0E1Watch => "e0_e1_watch",
            State::E2 => "e2",
            State::Done => "done",
        }
    }
}
