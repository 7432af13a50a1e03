//! iRoots: interned interleaving idioms.
//!
//! An iRoot event is an (instruction, event type) pair; an iRoot is an
//! idiom tag plus an ordered tuple of events. Both are interned in the
//! `IRootDB` so identical candidates share one integer id, and ids are
//! what every other database stores.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::static_info::InstId;

pub type IRootEventId = u32;
pub type IRootId = u32;

/// The four event kinds an iRoot can be built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IRootEventType {
    MemRead,
    MemWrite,
    MutexLock,
    MutexUnlock,
}

impl IRootEventType {
    pub fn is_mem(self) -> bool {
        matches!(self, Self::MemRead | Self::MemWrite)
    }

    pub fn is_read(self) -> bool {
        self == Self::MemRead
    }

    pub fn is_write(self) -> bool {
        self == Self::MemWrite
    }
}

/// The five canonical idiom shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum IdiomType {
    Idiom1,
    Idiom2,
    Idiom3,
    Idiom4,
    Idiom5,
}

impl IdiomType {
    /// Number of events in this idiom's shape.
    pub fn event_count(self) -> usize {
        match self {
            Self::Idiom1 => 2,
            Self::Idiom2 => 3,
            Self::Idiom3 | Self::Idiom4 | Self::Idiom5 => 4,
        }
    }

    pub fn from_index(i: u32) -> Option<Self> {
        match i {
            1 => Some(Self::Idiom1),
            2 => Some(Self::Idiom2),
            3 => Some(Self::Idiom3),
            4 => Some(Self::Idiom4),
            5 => Some(Self::Idiom5),
            _ => None,
        }
    }

    pub fn index(self) -> u32 {
        match self {
            Self::Idiom1 => 1,
            Self::Idiom2 => 2,
            Self::Idiom3 => 3,
            Self::Idiom4 => 4,
            Self::Idiom5 => 5,
        }
    }
}

/// An interned (instruction, type) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRootEvent {
    pub id: IRootEventId,
    pub inst: InstId,
    pub event_type: IRootEventType,
}

/// An interned idiom instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IRoot {
    pub id: IRootId,
    pub idiom: IdiomType,
    pub events: Vec<IRootEventId>,
}

impl IRoot {
    pub fn event(&self, idx: usize) -> IRootEventId {
        self.events[idx]
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IRootTables {
    events: Vec<IRootEvent>,
    iroots: Vec<IRoot>,
    #[serde(skip)]
    event_index: HashMap<(InstId, IRootEventType), IRootEventId>,
    #[serde(skip)]
    iroot_index: HashMap<(IdiomType, Vec<IRootEventId>), IRootId>,
}

impl IRootTables {
    fn rebuild_indexes(&mut self) {
        self.event_index = self
            .events
            .iter()
            .map(|e| ((e.inst, e.event_type), e.id))
            .collect();
        self.iroot_index = self
            .iroots
            .iter()
            .map(|r| ((r.idiom, r.events.clone()), r.id))
            .collect();
    }
}

/// Interning database for iRoot events and iRoots.
///
/// Ids start at 1; 0 is reserved so configuration can use it for "none".
#[derive(Debug, Default)]
pub struct IRootDB {
    tables: Mutex<IRootTables>,
}

impl IRootDB {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern an event, returning its stable id.
    pub fn get_iroot_event(&self, inst: InstId, event_type: IRootEventType) -> IRootEventId {
        let mut t = self.tables.lock().unwrap();
        if let Some(&id) = t.event_index.get(&(inst, event_type)) {
            return id;
        }
        let id = (t.events.len() + 1) as IRootEventId;
        t.events.push(IRootEvent {
            id,
            inst,
            event_type,
        });
        t.event_index.insert((inst, event_type), id);
        id
    }

    /// Intern an iRoot. `events.len()` must match the idiom's shape.
    pub fn get_iroot(&self, idiom: IdiomType, events: &[IRootEventId]) -> IRootId {
        debug_assert_eq!(events.len(), idiom.event_count());
        let mut t = self.tables.lock().unwrap();
        if let Some(&id) = t.iroot_index.get(&(idiom, events.to_vec())) {
            return id;
        }
        let id = (t.iroots.len() + 1) as IRootId;
        t.iroots.push(IRoot {
            id,
            idiom,
            events: events.to_vec(),
        });
        t.iroot_index.insert((idiom, events.to_vec()), id);
        id
    }

    pub fn find_iroot(&self, id: IRootId) -> Option<IRoot> {
        let t = self.tables.lock().unwrap();
        t.iroots.get((id as usize).checked_sub(1)?).cloned()
    }

    pub fn find_event(&self, id: IRootEventId) -> Option<IRootEvent> {
        let t = self.tables.lock().unwrap();
        t.events.get((id as usize).checked_sub(1)?).cloned()
    }

    pub fn iroot_count(&self) -> usize {
        self.tables.lock().unwrap().iroots.len()
    }

    /// All interned iRoots of the given idiom.
    pub fn iroots_of_idiom(&self, idiom: IdiomType) -> Vec<IRoot> {
        let t = self.tables.lock().unwrap();
        t.iroots.iter().filter(|r| r.idiom == idiom).cloned().collect()
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let t = self.tables.lock().unwrap();
        let text = serde_json::to_string_pretty(&*t).map_err(io::Error::other)?;
        fs::write(path, text)
    }

    pub fn load(&self, path: &Path) -> io::Result<()> {
        let text = fs::read_to_string(path)?;
        let mut loaded: IRootTables = serde_json::from_str(&text).map_err(io::Error::other)?;
        loaded.rebuild_indexes();
        *self.tables.lock().unwrap() = loaded;
        Ok(())
    }
}
