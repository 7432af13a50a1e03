//! Engine configuration and runtime context.
//!
//! All tunables live in one `Config` value loaded from JSON and/or CLI
//! overrides. A `RuntimeContext` bundles the configuration snapshot with
//! the shared statistics collector and is handed to every component at
//! setup; nothing reads global state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::stat::Stat;

fn default_unit_size() -> u64 {
    4
}
fn default_vw() -> u64 {
    1000
}
fn default_queue_limit() -> usize {
    1024 * 10
}
fn default_true() -> bool {
    true
}
fn default_lowest_rt() -> i32 {
    1
}
fn default_highest_rt() -> i32 {
    99
}
fn default_lowest_nice() -> i32 {
    -20
}
fn default_highest_nice() -> i32 {
    19
}
fn default_yield_delay_unit() -> u64 {
    1
}
fn default_yield_delay_min_each() -> u64 {
    1000
}
fn default_yield_delay_max_total() -> u64 {
    5000
}
fn default_iroot_db() -> PathBuf {
    PathBuf::from("iroot.db")
}
fn default_memo_db() -> PathBuf {
    PathBuf::from("memo.db")
}
fn default_sinst_db() -> PathBuf {
    PathBuf::from("sinst.db")
}
fn default_race_db() -> PathBuf {
    PathBuf::from("race.db")
}
fn default_test_history() -> PathBuf {
    PathBuf::from("test.histo")
}
fn default_static_info_db() -> PathBuf {
    PathBuf::from("sinfo.db")
}

/// Engine configuration. Field names match the knob names accepted by the
/// CLI and the JSON config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Monitoring granularity in bytes.
    pub unit_size: u64,
    /// Vulnerability window in dynamic instruction counts.
    pub vw: u64,
    /// Observe complex idioms (2..5), not just idiom 1.
    pub complex_idioms: bool,
    /// Restrict the complex-idiom search to a single variable.
    pub single_var_idioms: bool,
    /// Observer ignores memory events, monitoring synchronization only.
    pub sync_only: bool,
    /// Observations are auxiliary and do not count toward
    /// first-observation accounting.
    pub shadow_observer: bool,
    /// Per-thread recent-info queue limit before garbage collection.
    pub queue_limit: usize,

    /// Scheduler uses real-time FIFO priorities; otherwise nice values.
    pub strict: bool,
    pub lowest_realtime_priority: i32,
    pub highest_realtime_priority: i32,
    pub lowest_nice_value: i32,
    pub highest_nice_value: i32,
    /// CPU every thread is pinned to.
    pub cpu: usize,
    /// Milliseconds slept per give-up retry.
    pub yield_delay_unit: u64,
    /// Per-slot accumulated delay bound in milliseconds.
    pub yield_delay_min_each: u64,
    /// Total accumulated delay bound in milliseconds.
    pub yield_delay_max_total: u64,
    /// Hand out new-thread priorities in pool order instead of shuffled.
    pub ordered_new_thread_prio: bool,
    /// Target iRoot id to test; 0 selects via the memoization database.
    pub target_iroot: u32,
    /// Target idiom (1..5) when no explicit iRoot id is given; 0 = any.
    pub target_idiom: u32,
    /// Memoize fail-to-expose outcomes.
    pub memo_failed: bool,
    /// Idiom-4 instruction-count watch: the E0/E3 state also applies the
    /// E1/E3 state's window handling.
    pub idiom4_watch_fallthrough: bool,

    /// Race detector: track potentially racy instructions.
    pub track_racy_inst: bool,
    /// Ignore accesses from common libraries.
    pub ignore_lib: bool,

    /// Seed for the scheduler's random choices; absent means OS entropy.
    pub random_seed: Option<u64>,

    pub iroot_db: PathBuf,
    pub memo_db: PathBuf,
    pub sinst_db: PathBuf,
    pub race_db: PathBuf,
    pub test_history: PathBuf,
    pub static_info_db: PathBuf,
    /// Statistics dump path; absent disables the dump.
    pub stat_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            unit_size: default_unit_size(),
            vw: default_vw(),
            complex_idioms: false,
            single_var_idioms: false,
            sync_only: false,
            shadow_observer: false,
            queue_limit: default_queue_limit(),
            strict: default_true(),
            lowest_realtime_priority: default_lowest_rt(),
            highest_realtime_priority: default_highest_rt(),
            lowest_nice_value: default_lowest_nice(),
            highest_nice_value: default_highest_nice(),
            cpu: 0,
            yield_delay_unit: default_yield_delay_unit(),
            yield_delay_min_each: default_yield_delay_min_each(),
            yield_delay_max_total: default_yield_delay_max_total(),
            ordered_new_thread_prio: false,
            target_iroot: 0,
            target_idiom: 0,
            memo_failed: default_true(),
            idiom4_watch_fallthrough: false,
            track_racy_inst: false,
            ignore_lib: false,
            random_seed: None,
            iroot_db: default_iroot_db(),
            memo_db: default_memo_db(),
            sinst_db: default_sinst_db(),
            race_db: default_race_db(),
            test_history: default_test_history(),
            static_info_db: default_static_info_db(),
            stat_file: None,
        }
    }
}

impl Config {
    /// Load a configuration from a JSON file.
    pub fn load(path: &Path) -> io::Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(io::Error::other)
    }

    /// Validate cross-field constraints. Called once at startup; a failed
    /// check is a configuration error and fails fast.
    pub fn validate(&self) -> Result<(), String> {
        if self.unit_size == 0 || !self.unit_size.is_power_of_two() {
            return Err(format!("unit_size must be a power of two, got {}", self.unit_size));
        }
        if self.vw == 0 {
            return Err("vw must be positive".to_string());
        }
        if self.strict && self.lowest_realtime_priority >= self.highest_realtime_priority {
            return Err("realtime priority band is empty".to_string());
        }
        if !self.strict && self.lowest_nice_value >= self.highest_nice_value {
            return Err("nice value band is empty".to_string());
        }
        if self.target_idiom > 5 {
            return Err(format!("target_idiom must be 0..=5, got {}", self.target_idiom));
        }
        Ok(())
    }
}

/// Configuration snapshot plus shared mutable statistics, created once at
/// process start and handed to every component.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub config: Arc<Config>,
    pub stat: Arc<Stat>,
}

impl RuntimeContext {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            stat: Arc::new(Stat::new()),
        }
    }
}

impl Default for RuntimeContext {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn bad_unit_size_rejected() {
        let cfg = Config {
            unit_size: 3,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn bad_idiom_rejected() {
        let cfg = Config {
            target_idiom: 6,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_band_rejected() {
        let cfg = Config {
            lowest_realtime_priority: 50,
            highest_realtime_priority: 50,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn json_round_trip() {
        let cfg = Config {
            vw: 250,
            complex_idioms: true,
            ..Config::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&text).unwrap();
        assert_eq!(back.vw, 250);
        assert!(back.complex_idioms);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let back: Config = serde_json::from_str(r#"{"vw": 42}"#).unwrap();
        assert_eq!(back.vw, 42);
        assert_eq!(back.unit_size, 4);
    }
}
