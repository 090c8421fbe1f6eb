//! Idle-page tracker (spec.md §4.4.2): drives `/sys/kernel/mm/page_idle/bitmap`
//! over `/proc/PID/pagemap`-resolved PFNs. Each period runs a count pass
//! (who got un-idled since the last arm) followed by an arm pass (re-mark
//! everything idle).
use std::collections::HashMap;

use crate::{
    addr::range::{AddrRange, AddrRanges},
    deps::log::debug,
    error::Error,
    osaccess::{
        self,
        idlebitmap::ProcPageIdleBitmap,
        kpageflags::ProcKpageflags,
        pagemap::{ProcPagemap, Readahead},
    },
    tracker::{RemovePids, Tracker, TrackerCounter},
};

const DEFAULT_REGION_PAGES: u64 = 512;
const ARM_CHUNK_PAGES: usize = 64;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct IdlepageConfig {
    #[serde(default = "default_region_pages")]
    pub region_pages: u64,
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    #[serde(default)]
    pub region_refresh_interval_ms: Option<u64>,
    #[serde(default = "default_max_count_per_region")]
    pub max_count_per_region: u64,
}

fn default_region_pages() -> u64 {
    DEFAULT_REGION_PAGES
}
fn default_scan_interval_ms() -> u64 {
    5_000
}
fn default_max_count_per_region() -> u64 {
    1
}

impl Default for IdlepageConfig {
    fn default() -> Self {
        IdlepageConfig {
            region_pages:               DEFAULT_REGION_PAGES,
            scan_interval_ms:           5_000,
            region_refresh_interval_ms: None,
            max_count_per_region:       1,
        }
    }
}

struct PidState {
    regions: Vec<AddrRange>,
    tallies: HashMap<u64, u64>,
}

pub struct IdlepageTracker {
    config:  IdlepageConfig,
    pids:    HashMap<usize, PidState>,
    running: bool,
}

impl IdlepageTracker {
    pub fn new(config: IdlepageConfig) -> Self {
        IdlepageTracker { config, pids: HashMap::new(), running: false }
    }

    fn rebuild_regions(&self, pid: usize) -> Result<Vec<AddrRange>, Error> {
        let eligible = osaccess::proc_maps_eligible(pid)?;
        Ok(eligible.split_length(self.config.region_pages).as_slice().to_vec())
    }

    /// Count pass: for each present-exclusive page that is not idle and is
    /// not a compound tail, bump that region's count (capped at
    /// `max_count_per_region`).
    fn count_pass(&mut self) -> Vec<usize> {
        let mut gone = Vec::new();

        let mut idlebitmap = match ProcPageIdleBitmap::open() {
            Ok(b) => b,
            Err(err) => {
                debug!("idlepage: could not open page_idle bitmap: {}", err);
                return self.pids.keys().copied().collect();
            }
        };
        let mut kpageflags = match ProcKpageflags::open() {
            Ok(k) => k,
            Err(err) => {
                debug!("idlepage: could not open kpageflags: {}", err);
                return self.pids.keys().copied().collect();
            }
        };

        let cap = self.config.max_count_per_region;

        for (&pid, state) in self.pids.iter_mut() {
            let reader = ProcPagemap::open(pid, Readahead::default());
            for region in &state.regions {
                let ranges = AddrRanges::new(pid, vec![*region]);
                let entry = state.tallies.entry(region.addr()).or_insert(0);

                let result = reader.for_each_page(&ranges, |_addr, pte| {
                    if *entry >= cap {
                        return 0;
                    }
                    if !pte.is_present() || !pte.is_exclusive() {
                        return 0;
                    }
                    let Some(pfn) = pte.page_frame_number() else { return 0 };
                    let pfn = pfn.get();

                    if let Ok(flags) = kpageflags.read_flags(pfn) {
                        if flags.compound_tail() {
                            return 0;
                        }
                    }
                    if idlebitmap.get_idle(pfn).unwrap_or(true) {
                        return 0;
                    }

                    *entry += 1;
                    0
                });

                if let Err(err) = result {
                    debug!("idlepage: pagemap scan failed for pid {}: {}", pid, err);
                    gone.push(pid);
                    break;
                }
            }
        }

        gone
    }

    /// Arm pass: re-mark every tracked PFN idle, batched 64 pages per
    /// write.
    fn arm_pass(&mut self) {
        let mut idlebitmap = match ProcPageIdleBitmap::open() {
            Ok(b) => b,
            Err(err) => {
                debug!("idlepage: could not open page_idle bitmap for arming: {}", err);
                return;
            }
        };

        for (&pid, state) in &self.pids {
            let reader = ProcPagemap::open(pid, Readahead::default());
            for region in &state.regions {
                let ranges = AddrRanges::new(pid, vec![*region]);
                let mut pfns = Vec::new();

                let _ = reader.for_each_page(&ranges, |_addr, pte| {
                    if pte.is_present() {
                        if let Some(pfn) = pte.page_frame_number() {
                            pfns.push(pfn.get());
                        }
                    }
                    0
                });

                for chunk in pfns.chunks(ARM_CHUNK_PAGES) {
                    for &pfn in chunk {
                        let _ = idlebitmap.set_idle_all(pfn);
                    }
                }
            }
        }
    }
}

impl Tracker for IdlepageTracker {
    fn set_config(&mut self, json: serde_json::Value) -> Result<(), Error> {
        self.config = serde_json::from_value(json).map_err(|e| Error::config(format!("idlepage config: {}", e)))?;
        Ok(())
    }

    fn get_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }

    fn add_pids(&mut self, pids: &[usize]) -> Result<(), Error> {
        for &pid in pids {
            match self.rebuild_regions(pid) {
                Ok(regions) => {
                    self.pids.insert(pid, PidState { regions, tallies: HashMap::new() });
                }
                Err(err) => debug!("idlepage: dropping pid {}: {}", pid, err),
            }
        }
        Ok(())
    }

    fn remove_pids(&mut self, pids: RemovePids) -> Result<(), Error> {
        match pids {
            RemovePids::All => self.pids.clear(),
            RemovePids::Some(pids) => {
                for pid in pids {
                    self.pids.remove(&pid);
                }
            }
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), Error> {
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.running = false;
        Ok(())
    }

    fn reset_counters(&mut self) {
        for state in self.pids.values_mut() {
            state.tallies.clear();
        }
    }

    fn get_counters(&self) -> Vec<TrackerCounter> {
        let mut out = Vec::new();
        for (&pid, state) in &self.pids {
            for region in &state.regions {
                let accesses = state.tallies.get(&region.addr()).copied().unwrap_or(0);
                out.push(TrackerCounter::new(pid, region.addr(), region.length(), accesses, accesses, 0));
            }
        }
        out
    }

    fn dump(&self, _args: &str) -> Result<String, Error> {
        Ok(format!("idlepage: tracking {} pids", self.pids.len()))
    }
}

impl IdlepageTracker {
    /// Runs one full period: count pass then arm pass (spec.md §4.4.2).
    pub fn sample(&mut self) {
        let gone = self.count_pass();
        self.arm_pass();
        for pid in gone {
            self.pids.remove(&pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = IdlepageConfig::default();
        assert_eq!(cfg.region_pages, 512);
        assert_eq!(cfg.max_count_per_region, 1);
    }

    #[test]
    fn counters_report_accesses_only() {
        let mut tracker = IdlepageTracker::new(IdlepageConfig::default());
        tracker.pids.insert(
            3,
            PidState {
                regions: vec![AddrRange::new(0x1000, 4)],
                tallies: [(0x1000u64, 1u64)].into_iter().collect(),
            },
        );
        let counters = tracker.get_counters();
        assert_eq!(counters[0].accesses, 1);
        assert_eq!(counters[0].reads, 1);
        assert_eq!(counters[0].writes, 0);
    }
}
