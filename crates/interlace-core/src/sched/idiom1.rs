//! Idiom-1 state machine: force `T0.e0 -> T1.e1` on one location.
//!
//! After the holder completes e0 it is parked at `Low` so exactly one
//! thread holds the low priority; every later access overlapping the
//! pinned location either completes the interleaving (a remote thread
//! executing e1) or is delayed until the give-up budget runs out. There
//! is no idiom-wide window; only the give-up budget bounds the wait.

use crate::sched::machine::{Cmd, IdiomMachine, MachineCtx, Step};
use crate::sched::priority::PriorityLevel;
use crate::types::{Address, ThreadId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    E0,
    E0Watch,
    E0E1,
    Done,
}

pub struct Idiom1Machine {
    state: State,
}

impl Idiom1Machine {
    pub fn new() -> Self {
        Self { state: State::Init }
    }

    fn reset(&mut self, ctx: &mut MachineCtx) -> Vec<Cmd> {
        let threads = ctx.slot_threads();
        ctx.clear_slots_from(0);
        self.state = State::Init;
        ctx.reset_cmds(&threads)
    }

    /// Remove a thread from the delay set once the situation that parked
    /// it is gone.
    fn release_if_delayed(ctx: &mut MachineCtx, thd_id: ThreadId, cmds: &mut Vec<Cmd>) {
        if ctx.delay_set.remove(&thd_id) {
            cmds.push(Cmd::SetPriority(thd_id, PriorityLevel::Normal));
        }
    }
}

impl Default for Idiom1Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl IdiomMachine for Idiom1Machine {
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
                    // reclaim the slot for the newcomer
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
                    // the interleaving is about to complete
                    ctx.fill_slot(1, thd_id, addr, size);
                    self.state = State::E0E1;
                    let mut cmds = Vec::new();
                    Self::release_if_delayed(ctx, thd_id, &mut cmds);
                    return Step::cmds(cmds);
                }
                if thd_id != holder.thd_id && matches.contains(&0) && ctx.reclaim_roll(true) {
                    // restart with the newcomer holding e0
                    let mut cmds = self.reset(ctx);
                    ctx.fill_slot(0, thd_id, addr, size);
                    self.state = State::E0;
                    cmds.push(Cmd::SetPriority(thd_id, PriorityLevel::High));
                    return Step::cmds(cmds);
                }
                if holder.overlaps(addr, size) {
                    if thd_id == holder.thd_id {
                        // the holder ran past e0 and touched the location
                        // again: the candidate value is gone
                        return Step::cmds(self.reset(ctx));
                    }
                    // conflicting remote access that is not e1: delay it
                    // while the budget lasts, then give the scenario up
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
            State::E0E1 | State::Done => Step::none(),
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
                    // e0 executed: park the holder and re-instrument
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
                    self.state = State::Done;
                    let holder = ctx.slot(0).unwrap();
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

    fn on_inst_count(&mut self, _ctx: &mut MachineCtx, _thd_id: ThreadId, _count: u64) -> Step {
        // idiom 1 has no vulnerability window
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
            State::Done => "done",
        }
    }
}
