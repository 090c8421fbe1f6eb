//! Soft-dirty tracker (spec.md §4.4.1): splits each tracked PID's
//! anonymous/heap regions into fixed-size sub-ranges and counts
//! present-exclusive-dirty pages each sampling period, then clears the
//! dirty bits process-wide.
use std::{
    collections::HashMap,
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{
    addr::range::{AddrRange, AddrRanges, PageAttrs},
    deps::log::debug,
    error::Error,
    osaccess,
    tracker::{RemovePids, Tracker, TrackerCounter},
};

const DEFAULT_REGION_PAGES: u64 = 256;

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct SoftdirtyConfig {
    #[serde(default = "default_region_pages")]
    pub region_pages: u64,
    #[serde(default)]
    pub aggregation_us: u64,
    /// Bernoulli probability in `[0, 1]` of sampling a given region this
    /// period, for cost control.
    #[serde(default = "default_sample_probability")]
    pub sample_probability: f64,
}

fn default_region_pages() -> u64 {
    DEFAULT_REGION_PAGES
}
fn default_sample_probability() -> f64 {
    1.0
}

impl Default for SoftdirtyConfig {
    fn default() -> Self {
        SoftdirtyConfig {
            region_pages:       DEFAULT_REGION_PAGES,
            aggregation_us:     1_000_000,
            sample_probability: 1.0,
        }
    }
}

struct PidState {
    regions: Vec<AddrRange>,
    tallies: HashMap<u64, u64>,
}

pub struct SoftdirtyTracker {
    config:  SoftdirtyConfig,
    pids:    HashMap<usize, PidState>,
    running: bool,
}

impl SoftdirtyTracker {
    pub fn new(config: SoftdirtyConfig) -> Self {
        SoftdirtyTracker { config, pids: HashMap::new(), running: false }
    }

    fn rebuild_regions(&self, pid: usize) -> Result<Vec<AddrRange>, Error> {
        let eligible = osaccess::proc_maps_eligible(pid)?;
        let split = eligible.split_length(self.config.region_pages);
        Ok(split.as_slice().to_vec())
    }
}

impl Tracker for SoftdirtyTracker {
    fn set_config(&mut self, json: serde_json::Value) -> Result<(), Error> {
        self.config = serde_json::from_value(json)
            .map_err(|e| Error::config(format!("softdirty config: {}", e)))?;
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
                Err(err) => debug!("softdirty: dropping pid {}: {}", pid, err),
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
                let writes = state.tallies.get(&region.addr()).copied().unwrap_or(0);
                out.push(TrackerCounter::new(pid, region.addr(), region.length(), writes, 0, writes));
            }
        }
        out
    }

    fn dump(&self, _args: &str) -> Result<String, Error> {
        Ok(format!("softdirty: tracking {} pids", self.pids.len()))
    }
}

impl SoftdirtyTracker {
    /// One sampling period (spec.md §4.4.1): count present-exclusive-dirty
    /// pages per region, then clear soft-dirty bits for the pid.
    pub fn sample(&mut self) {
        let attrs = PageAttrs { present: Some(true), exclusive: Some(true), dirty: Some(true), ..Default::default() };
        let mut gone = Vec::new();

        for (&pid, state) in self.pids.iter_mut() {
            for region in &state.regions {
                if self.config.sample_probability < 1.0 && !bernoulli_hit(self.config.sample_probability) {
                    continue;
                }

                let ranges = AddrRanges::new(pid, vec![*region]);
                match ranges.pages_matching(attrs) {
                    Ok(matches) => {
                        *state.tallies.entry(region.addr()).or_insert(0) += matches.len() as u64;
                    }
                    Err(err) => {
                        debug!("softdirty: pagemap scan failed for pid {}: {}", pid, err);
                        gone.push(pid);
                        break;
                    }
                }
            }

            if let Err(err) = osaccess::clearrefs::clear_soft_dirty(pid) {
                debug!("softdirty: clear_refs failed for pid {}: {}", pid, err);
                gone.push(pid);
            }
        }

        for pid in gone {
            self.pids.remove(&pid);
        }
    }
}

/// A coin flip with bias `probability`, seeded from the system clock's
/// low bits. Good enough for a sampling skip; not suitable for anything
/// security-sensitive.
fn bernoulli_hit(probability: f64) -> bool {
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.subsec_nanos()).unwrap_or(0);
    (nanos as f64 / u32::MAX as f64) < probability
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = SoftdirtyConfig::default();
        assert_eq!(cfg.region_pages, 256);
    }

    #[test]
    fn counters_report_writes_only() {
        let mut tracker = SoftdirtyTracker::new(SoftdirtyConfig::default());
        tracker.pids.insert(
            7,
            PidState {
                regions: vec![AddrRange::new(0x1000, 4)],
                tallies: [(0x1000u64, 3u64)].into_iter().collect(),
            },
        );
        let counters = tracker.get_counters();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].writes, 3);
        assert_eq!(counters[0].accesses, 3);
        assert_eq!(counters[0].reads, 0);
    }
}
