//! Priority control.
//!
//! Two disciplines: *strict* uses POSIX real-time FIFO priorities (higher
//! number runs first and fully preempts), *relaxed* uses nice values
//! (lower number runs first). `PriorityBand` derives the named levels and
//! the interior pool handed to newly spawned threads; `PriorityOps` is the
//! seam to the OS so state machines are testable without RT privileges.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use crate::config::Config;
use crate::types::ThreadId;

/// Named priority levels used by the state machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityLevel {
    Min,
    Low,
    Normal,
    High,
    Max,
}

/// A concrete priority band under one discipline.
#[derive(Debug, Clone)]
pub struct PriorityBand {
    strict: bool,
    lowest: i32,
    highest: i32,
}

impl PriorityBand {
    pub fn from_config(cfg: &Config) -> Self {
        if cfg.strict {
            Self {
                strict: true,
                lowest: cfg.lowest_realtime_priority,
                highest: cfg.highest_realtime_priority,
            }
        } else {
            Self {
                strict: false,
                lowest: cfg.lowest_nice_value,
                highest: cfg.highest_nice_value,
            }
        }
    }

    /// Raw OS value for a named level.
    pub fn raw(&self, level: PriorityLevel) -> i32 {
        if self.strict {
            match level {
                PriorityLevel::Min => self.lowest,
                PriorityLevel::Low => self.lowest + 1,
                PriorityLevel::Normal => (self.lowest + self.highest) / 2,
                PriorityLevel::High => self.highest - 1,
                PriorityLevel::Max => self.highest,
            }
        } else {
            // nice values: lower number = higher priority
            match level {
                PriorityLevel::Min => self.highest,
                PriorityLevel::Low => self.highest - 1,
                PriorityLevel::Normal => (self.lowest + self.highest) / 2,
                PriorityLevel::High => self.lowest + 1,
                PriorityLevel::Max => self.lowest,
            }
        }
    }

    /// Interior values handed to spawned threads, ordered from the level
    /// just above `Low` toward the one just below `High`.
    pub fn new_thread_pool(&self) -> Vec<i32> {
        if self.strict {
            (self.lowest + 2..self.highest - 1).collect()
        } else {
            (self.lowest + 2..self.highest - 1).rev().collect()
        }
    }
}

/// OS seam for priority and affinity writes.
pub trait PriorityOps: Send + Sync {
    /// Set the scheduling priority of the OS thread `os_tid`.
    fn set_priority(&self, os_tid: i32, raw: i32) -> io::Result<()>;
    /// Pin the calling thread to `cpu`.
    fn set_affinity(&self, cpu: usize) -> io::Result<()>;
}

/// Real OS implementation: `sched_setscheduler(SCHED_FIFO)` under the
/// strict discipline, `setpriority(PRIO_PROCESS)` otherwise.
pub struct OsPriorityOps {
    strict: bool,
}

impl OsPriorityOps {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }
}

impl PriorityOps for OsPriorityOps {
    #[cfg(target_os = "linux")]
    fn set_priority(&self, os_tid: i32, raw: i32) -> io::Result<()> {
        if self.strict {
            let param = libc::sched_param {
                sched_priority: raw,
            };
            let rc = unsafe { libc::sched_setscheduler(os_tid, libc::SCHED_FIFO, &param) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        } else {
            let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, os_tid as libc::id_t, raw) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_priority(&self, _os_tid: i32, _raw: i32) -> io::Result<()> {
        Err(io::Error::other("priority control requires linux"))
    }

    #[cfg(target_os = "linux")]
    fn set_affinity(&self, cpu: usize) -> io::Result<()> {
        let ncpu = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let cpu = if ncpu > 0 && (cpu as i64) < ncpu { cpu } else { 0 };
        unsafe {
            let mut set: libc::cpu_set_t = std::mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(cpu, &mut set);
            if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn set_affinity(&self, _cpu: usize) -> io::Result<()> {
        Err(io::Error::other("affinity control requires linux"))
    }
}

/// Logical thread id → OS thread id, under its own lock so priority
/// writes never contend with state-machine progress.
#[derive(Debug, Default)]
pub struct OsThreadMap {
    map: Mutex<HashMap<ThreadId, i32>>,
}

impl OsThreadMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, thd_id: ThreadId, os_tid: i32) {
        self.map.lock().unwrap().insert(thd_id, os_tid);
    }

    pub fn unregister(&self, thd_id: ThreadId) {
        self.map.lock().unwrap().remove(&thd_id);
    }

    /// OS thread id for a logical thread. Falls back to the logical id,
    /// which is what the deterministic replay source uses.
    pub fn os_tid(&self, thd_id: ThreadId) -> i32 {
        self.map
            .lock()
            .unwrap()
            .get(&thd_id)
            .copied()
            .unwrap_or(thd_id as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_band_levels() {
        let cfg = Config::default(); // strict, 1..99
        let band = PriorityBand::from_config(&cfg);
        assert_eq!(band.raw(PriorityLevel::Min), 1);
        assert_eq!(band.raw(PriorityLevel::Low), 2);
        assert_eq!(band.raw(PriorityLevel::Normal), 50);
        assert_eq!(band.raw(PriorityLevel::High), 98);
        assert_eq!(band.raw(PriorityLevel::Max), 99);
    }

    #[test]
    fn relaxed_band_levels_invert() {
        let cfg = Config {
            strict: false,
            ..Config::default()
        }; // nice -20..19
        let band = PriorityBand::from_config(&cfg);
        assert_eq!(band.raw(PriorityLevel::Min), 19);
        assert_eq!(band.raw(PriorityLevel::Low), 18);
        assert_eq!(band.raw(PriorityLevel::High), -19);
        assert_eq!(band.raw(PriorityLevel::Max), -20);
    }

    #[test]
    fn pool_stays_inside_band() {
        let cfg = Config::default();
        let band = PriorityBand::from_config(&cfg);
        let pool = band.new_thread_pool();
        assert!(!pool.is_empty());
        let low = band.raw(PriorityLevel::Low);
        let high = band.raw(PriorityLevel::High);
        assert!(pool.iter().all(|&p| p > low && p < high));
    }

    #[test]
    fn relaxed_pool_orders_high_to_low_priority() {
        let cfg = Config {
            strict: false,
            ..Config::default()
        };
        let band = PriorityBand::from_config(&cfg);
        let pool = band.new_thread_pool();
        // the pool advances weakest to strongest; for nice values that is
        // numerically descending
        assert!(pool.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn thread_map_fallback_is_identity() {
        let map = OsThreadMap::new();
        assert_eq!(map.os_tid(7), 7);
        map.register(7, 4242);
        assert_eq!(map.os_tid(7), 4242);
        map.unregister(7);
        assert_eq!(map.os_tid(7), 7);
    }
}
