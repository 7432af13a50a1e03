//! Race database.
//!
//! Dynamic race reports are deduplicated through interned static races:
//! a static race event is an (instruction, access type) pair, a static
//! race is an ordered pair of those. Dynamic rows keep the execution id,
//! the address, and the two thread-tagged events.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::static_info::InstId;
use crate::types::{Address, ThreadId};

pub type StaticRaceEventId = u32;
pub type StaticRaceId = u32;

/// Access role of one side of a race.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaceEventType {
    Read,
    Write,
}

/// An interned (instruction, access type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRaceEvent {
    pub id: StaticRaceEventId,
    pub inst: InstId,
    pub event_type: RaceEventType,
}

/// An interned ordered pair of static race events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticRace {
    pub id: StaticRaceId,
    pub events: [StaticRaceEventId; 2],
}

/// One dynamic race occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Race {
    pub exec_id: u32,
    pub addr: Address,
    pub threads: [ThreadId; 2],
    pub events: [StaticRaceEventId; 2],
    pub static_race: StaticRaceId,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RaceTables {
    static_events: Vec<StaticRaceEvent>,
    static_races: Vec<StaticRace>,
    races: Vec<Race>,
    racy_insts: HashSet<InstId>,
    exec_id: u32,
    #[serde(skip)]
    static_event_index: HashMap<(InstId, RaceEventType), StaticRaceEventId>,
    #[serde(skip)]
    static_race_index: HashMap<[StaticRaceEventId; 2], StaticRaceId>,
}

impl RaceTables {
    fn rebuild_indexes(&mut self) {
        self.static_event_index = self
            .static_events
            .iter()
            .map(|e| ((e.inst, e.event_type), e.id))
            .collect();
        self.static_race_index = self
            .static_races
            .iter()
            .map(|r| (r.events, r.id))
            .collect();
    }

    fn get_static_event(&mut self, inst: InstId, event_type: RaceEventType) -> StaticRaceEventId {
        if let Some(&id) = self.static_event_index.get(&(inst, event_type)) {
            return id;
        }
        let id = (self.static_events.len() + 1) as StaticRaceEventId;
        self.static_events.push(StaticRaceEvent {
            id,
            inst,
            event_type,
        });
        self.static_event_index.insert((inst, event_type), id);
        id
    }

    fn get_static_race(&mut self, events: [StaticRaceEventId; 2]) -> StaticRaceId {
        if let Some(&id) = self.static_race_index.get(&events) {
            return id;
        }
        let id = (self.static_races.len() + 1) as StaticRaceId;
        self.static_races.push(StaticRace { id, events });
        self.static_race_index.insert(events, id);
        id
    }
}

/// Interning race store with its own lock.
#[derive(Debug, Default)]
pub struct RaceDB {
    tables: Mutex<RaceTables>,
}

impl RaceDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a dynamic race between `(t0, i0, p0)` and `(t1, i1, p1)` at
    /// `addr`. Returns the static race id the report was deduplicated to.
    #[allow(clippy::too_many_arguments)]
    pub fn create_race(
        &self,
        addr: Address,
        t0: ThreadId,
        i0: InstId,
        p0: RaceEventType,
        t1: ThreadId,
        i1: InstId,
        p1: RaceEventType,
    ) -> StaticRaceId {
        let mut t = self.tables.lock().unwrap();
        let e0 = t.get_static_event(i0, p0);
        let e1 = t.get_static_event(i1, p1);
        let static_race = t.get_static_race([e0, e1]);
        let exec_id = t.exec_id;
        t.races.push(Race {
            exec_id,
            addr,
            threads: [t0, t1],
            events: [e0, e1],
            static_race,
        });
        static_race
    }

    pub fn set_racy_inst(&self, inst: InstId) {
        self.tables.lock().unwrap().racy_insts.insert(inst);
    }

    pub fn racy_inst(&self, inst: InstId) -> bool {
        self.tables.lock().unwrap().racy_insts.contains(&inst)
    }

    pub fn race_count(&self) -> usize {
        self.tables.lock().unwrap().races.len()
    }

    pub fn static_race_count(&self) -> usize {
        self.tables.lock().unwrap().static_races.len()
    }

    pub fn races(&self) -> Vec<Race> {
        self.tables.lock().unwrap().races.clone()
    }

    pub fn find_static_race(&self, id: StaticRaceId) -> Option<StaticRace> {
        let t = self.tables.lock().unwrap();
        t.static_races.get((id as usize).checked_sub(1)?).cloned()
    }

    pub fn find_static_event(&self, id: StaticRaceEventId) -> Option<StaticRaceEvent> {
        let t = self.tables.lock().unwrap();
        t.static_events.get((id as usize).checked_sub(1)?).cloned()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    /// Load a previous database; the execution id advances so new reports
    /// are attributed to this run.
    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let mut loaded: RaceTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        loaded.rebuild_indexes();
        loaded.exec_id += 1;
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}
