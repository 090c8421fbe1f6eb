//! Per-PID heat function (spec.md §4.5): a piecewise-constant, time-decayed
//! integration of `TrackerCounter` samples over each process's virtual
//! address space.
use std::collections::HashMap;

use crate::{addr::range::AddrRange, tracker::TrackerCounter};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct HeatRange {
    pub addr:       u64,
    pub length:     u64,
    pub heat:       f64,
    pub created_ns: u64,
    pub updated_ns: u64,
}

impl HeatRange {
    pub fn end(&self) -> u64 {
        self.addr + self.length * crate::addr::range::PAGE_SIZE as u64
    }

    pub fn age_ns(&self, now_ns: u64) -> u64 {
        now_ns.saturating_sub(self.created_ns)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct HeatmapConfig {
    pub heat_max:      f64,
    pub heat_retention: f64,
    pub heat_classes:  u32,
}

impl Default for HeatmapConfig {
    fn default() -> Self {
        HeatmapConfig { heat_max: 1.0, heat_retention: 0.9513, heat_classes: 10 }
    }
}

/// `HeatClass(hr) = min(HeatClasses - 1, floor(HeatClasses * hr.heat / HeatMax))`
pub fn heat_class(config: &HeatmapConfig, hr: &HeatRange) -> u32 {
    let raw = (config.heat_classes as f64 * hr.heat / config.heat_max).floor();
    (raw as u32).min(config.heat_classes - 1)
}

#[derive(Default)]
pub struct Heatmap {
    config: HeatmapConfig,
    pid_hrs: HashMap<usize, Vec<HeatRange>>,
}

impl Heatmap {
    pub fn new(config: HeatmapConfig) -> Self {
        Heatmap { config, pid_hrs: HashMap::new() }
    }

    pub fn config(&self) -> &HeatmapConfig {
        &self.config
    }

    pub fn ranges(&self, pid: usize) -> &[HeatRange] {
        self.pid_hrs.get(&pid).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn pids(&self) -> impl Iterator<Item = &usize> {
        self.pid_hrs.keys()
    }

    /// Replaces a pid's heat list wholesale; used to install/restore a
    /// forecaster's predicted heats (spec.md §4.6.2 step 3).
    pub fn set_ranges(&mut self, pid: usize, ranges: Vec<HeatRange>) {
        self.pid_hrs.insert(pid, ranges);
    }

    /// The update algorithm in spec.md §4.5. Drops any pid absent from
    /// `counters` (no live counters => drop state).
    pub fn update_from_counters(&mut self, counters: &[TrackerCounter], now_ns: u64) {
        let mut touched = std::collections::HashSet::new();

        for tc in counters {
            let pid = tc.pid();
            touched.insert(pid);

            for r in tc.ranges.iter() {
                let h_new = (tc.accesses as f64 / r.length() as f64).min(self.config.heat_max);
                self.apply_range(pid, *r, h_new, now_ns);
            }
        }

        self.pid_hrs.retain(|pid, _| touched.contains(pid));
    }

    fn apply_range(&mut self, pid: usize, r: AddrRange, h_new: f64, now_ns: u64) {
        let list = self.pid_hrs.entry(pid).or_default();

        let mut cursor = r.addr();
        let r_end = r.end();
        let mut out = Vec::with_capacity(list.len() + 2);
        let mut inserted_new_tail = false;

        for hr in list.drain(..) {
            if hr.end() <= cursor || hr.addr >= r_end {
                out.push(hr);
                continue;
            }

            if hr.addr < cursor {
                out.push(HeatRange {
                    addr: hr.addr,
                    length: (cursor - hr.addr) / crate::addr::range::PAGE_SIZE as u64,
                    ..hr
                });
            }

            if cursor < hr.addr {
                out.push(HeatRange { addr: cursor, length: (hr.addr - cursor) / crate::addr::range::PAGE_SIZE as u64, heat: h_new, created_ns: now_ns, updated_ns: now_ns });
                cursor = hr.addr;
            }

            let overlap_start = cursor.max(hr.addr);
            let overlap_end = r_end.min(hr.end());

            let dt_seconds = (now_ns.saturating_sub(hr.updated_ns)) as f64 / 1e9;
            let h_old = hr.heat * self.config.heat_retention.powf(dt_seconds);

            out.push(HeatRange {
                addr:       overlap_start,
                length:     (overlap_end - overlap_start) / crate::addr::range::PAGE_SIZE as u64,
                heat:       (h_new + h_old).min(self.config.heat_max),
                created_ns: hr.created_ns,
                updated_ns: now_ns,
            });

            if hr.end() > overlap_end {
                out.push(HeatRange {
                    addr: overlap_end,
                    length: (hr.end() - overlap_end) / crate::addr::range::PAGE_SIZE as u64,
                    ..hr
                });
            }

            cursor = overlap_end;
            if cursor >= r_end {
                inserted_new_tail = true;
            }
        }

        if !inserted_new_tail && cursor < r_end {
            out.push(HeatRange {
                addr:       cursor,
                length:     (r_end - cursor) / crate::addr::range::PAGE_SIZE as u64,
                heat:       h_new,
                created_ns: now_ns,
                updated_ns: now_ns,
            });
        }

        out.retain(|hr| hr.length > 0);
        out.sort_by_key(|hr| hr.addr);
        *list = out;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TrackerCounter;

    #[test]
    fn first_observation_creates_one_range() {
        let mut hm = Heatmap::new(HeatmapConfig::default());
        let tc = TrackerCounter::new(1, 0x1000, 4, 4, 0, 4);
        hm.update_from_counters(&[tc], 1_000_000_000);

        let ranges = hm.ranges(1);
        assert_eq!(ranges.len(), 1);
        assert_eq!(ranges[0].addr, 0x1000);
        assert!((ranges[0].heat - 1.0).abs() < 1e-9);
    }

    #[test]
    fn absent_pid_is_dropped() {
        let mut hm = Heatmap::new(HeatmapConfig::default());
        let tc = TrackerCounter::new(1, 0x1000, 4, 4, 0, 4);
        hm.update_from_counters(&[tc], 0);
        assert_eq!(hm.ranges(1).len(), 1);

        hm.update_from_counters(&[], 1);
        assert_eq!(hm.ranges(1).len(), 0);
    }

    #[test]
    fn overlap_splits_existing_range() {
        let mut hm = Heatmap::new(HeatmapConfig::default());
        let first = TrackerCounter::new(1, 0x1000, 10, 10, 0, 10);
        hm.update_from_counters(&[first], 0);

        let second = TrackerCounter::new(1, 0x1000 + 3 * 4096, 2, 2, 0, 2);
        hm.update_from_counters(&[second], 1_000_000_000);

        let ranges = hm.ranges(1);
        assert!(ranges.len() >= 2);
        let sum: u64 = ranges.iter().map(|r| r.length).sum();
        assert_eq!(sum, 10);
    }

    #[test]
    fn heat_class_is_capped() {
        let config = HeatmapConfig::default();
        let hr = HeatRange { addr: 0, length: 1, heat: 1.0, created_ns: 0, updated_ns: 0 };
        assert_eq!(heat_class(&config, &hr), config.heat_classes - 1);
    }
}
