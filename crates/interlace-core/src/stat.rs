//! Runtime statistics.
//!
//! Named counters plus recorded series, dumped to a text file at exit.
//! Components share one `Stat` through the runtime context.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Default)]
struct StatTables {
    ints: HashMap<String, u64>,
    series: HashMap<String, Vec<u64>>,
}

/// Thread-safe statistics collector.
#[derive(Debug, Default)]
pub struct Stat {
    tables: Mutex<StatTables>,
}

impl Stat {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `i` to counter `var`.
    pub fn inc(&self, var: &str, i: u64) {
        let mut t = self.tables.lock().unwrap();
        *t.ints.entry(var.to_string()).or_insert(0) += i;
    }

    /// Track the maximum value seen for `var`.
    pub fn max(&self, var: &str, i: u64) {
        let mut t = self.tables.lock().unwrap();
        let entry = t.ints.entry(var.to_string()).or_insert(i);
        if *entry < i {
            *entry = i;
        }
    }

    /// Track the minimum value seen for `var`.
    pub fn min(&self, var: &str, i: u64) {
        let mut t = self.tables.lock().unwrap();
        let entry = t.ints.entry(var.to_string()).or_insert(i);
        if *entry > i {
            *entry = i;
        }
    }

    /// Record `i` into the series for `var`.
    pub fn rec(&self, var: &str, i: u64) {
        let mut t = self.tables.lock().unwrap();
        t.series.entry(var.to_string()).or_default().push(i);
    }

    pub fn get(&self, var: &str) -> u64 {
        self.tables.lock().unwrap().ints.get(var).copied().unwrap_or(0)
    }

    /// Render counters and series deciles as text.
    pub fn render(&self) -> String {
        let mut t = self.tables.lock().unwrap();
        let mut out = String::new();
        out.push_str("Statistics\n");
        out.push_str("---------------------------\n");

        let mut names: Vec<&String> = t.ints.keys().collect();
        names.sort();
        for name in names {
            let _ = writeln!(out, "{:<20}{}", name, t.ints[name.as_str()]);
        }

        let mut series_names: Vec<String> = t.series.keys().cloned().collect();
        series_names.sort();
        for name in series_names {
            let vec = t.series.get_mut(&name).unwrap();
            vec.sort_unstable();
            let _ = writeln!(out, "{:<20}{}", name, vec.len());
            if vec.is_empty() {
                continue;
            }
            let detail_level = 10usize;
            for i in 0..detail_level {
                let ratio = (i + 1) as f64 / detail_level as f64;
                let idx = ((vec.len() - 1) as f64 * ratio) as usize;
                let _ = writeln!(out, "  {:<18}{}", idx, vec[idx]);
            }
        }
        out
    }

    /// Write the rendered statistics to `path`.
    pub fn display(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.render())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inc_accumulates() {
        let s = Stat::new();
        s.inc("events", 1);
        s.inc("events", 2);
        assert_eq!(s.get("events"), 3);
    }

    #[test]
    fn max_keeps_largest() {
        let s = Stat::new();
        s.max("peak", 5);
        s.max("peak", 3);
        s.max("peak", 9);
        assert_eq!(s.get("peak"), 9);
    }

    #[test]
    fn min_keeps_smallest() {
        let s = Stat::new();
        s.min("floor", 5);
        s.min("floor", 8);
        s.min("floor", 2);
        assert_eq!(s.get("floor"), 2);
    }

    #[test]
    fn render_contains_series_deciles() {
        let s = Stat::new();
        for i in 0..100 {
            s.rec("delay", i);
        }
        let text = s.render();
        assert!(text.contains("delay"));
        assert!(text.contains("99"));
    }
}
