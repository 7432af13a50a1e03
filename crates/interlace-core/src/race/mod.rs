//! Happens-before race detection: the detector and the race database.

pub mod db;
pub mod detector;

pub use db::{Race, RaceDB, RaceEventType, StaticRace, StaticRaceEvent};
pub use detector::RaceDetector;
