//! DAMON tracker (spec.md §4.4.3): drives the kernel's Data Access
//! MONitor through either the sysfs tree under
//! `/sys/kernel/mm/damon/admin/kdamonds/` or the legacy debugfs interface
//! under `/sys/kernel/debug/damon/`, and parses `damon:damon_aggregated`
//! tracepoint events streamed from a `bpftrace`/`perf trace` child process.
use std::{
    collections::HashMap,
    convert::TryFrom,
    io::{BufRead, BufReader},
    process::{Child, Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use crate::{
    deps::{
        crossbeam_channel::{self, Receiver, Sender},
        log::{debug, warn},
        parking_lot::Mutex,
    },
    error::Error,
    paths,
    tracker::{RemovePids, Tracker, TrackerCounter},
};

/// One parsed `damon:damon_aggregated` line, shipped from the reader thread
/// to the tracker's updater over a single-writer channel (spec.md §5).
type ParsedLine = (i32, u64, u64, u64, u64, u64);

const DEFAULT_FILTER_ADDRESS_RANGE_SIZE_MAX: u64 = 32 * 1024 * 1024;

#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum DamonBackend {
    Sysfs,
    Debugfs,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct DamonConfig {
    #[serde(default = "default_backend")]
    pub backend: DamonBackend,
    #[serde(default = "default_sampling_us")]
    pub sampling_us: u64,
    #[serde(default = "default_aggregation_us")]
    pub aggregation_us: u64,
    #[serde(default = "default_regions_update_us")]
    pub regions_update_us: u64,
    #[serde(default = "default_min_target_regions")]
    pub min_target_regions: u64,
    #[serde(default = "default_max_target_regions")]
    pub max_target_regions: u64,
    #[serde(default = "default_filter_max")]
    pub filter_address_range_size_max: u64,
    #[serde(default = "default_kdamond_slots")]
    pub kdamond_slots: usize,
}

fn default_backend() -> DamonBackend {
    DamonBackend::Sysfs
}
fn default_sampling_us() -> u64 {
    5_000
}
fn default_aggregation_us() -> u64 {
    100_000
}
fn default_regions_update_us() -> u64 {
    1_000_000
}
fn default_min_target_regions() -> u64 {
    10
}
fn default_max_target_regions() -> u64 {
    1_000
}
fn default_filter_max() -> u64 {
    DEFAULT_FILTER_ADDRESS_RANGE_SIZE_MAX
}
fn default_kdamond_slots() -> usize {
    1
}

impl Default for DamonConfig {
    fn default() -> Self {
        DamonConfig {
            backend: DamonBackend::Sysfs,
            sampling_us: default_sampling_us(),
            aggregation_us: default_aggregation_us(),
            regions_update_us: default_regions_update_us(),
            min_target_regions: default_min_target_regions(),
            max_target_regions: default_max_target_regions(),
            filter_address_range_size_max: default_filter_max(),
            kdamond_slots: default_kdamond_slots(),
        }
    }
}

/// `uninitialized → configured → targets-set → on → off → (re-configured) …`
/// (spec.md §4.4.3).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KdamondState {
    Uninitialized,
    Configured,
    TargetsSet,
    On,
    Off,
}

struct KdamondSlot {
    id:          usize,
    state:       KdamondState,
    pids:        Vec<usize>,
    kdamond_pid: Option<i32>,
}

/// One `damon:damon_aggregated` event, attributed to a workload pid.
#[derive(Clone, Debug)]
pub struct RawEvent {
    pub pid:          usize,
    pub start:        u64,
    pub length_pages: u64,
    pub accesses:     u64,
    pub age:          u64,
}

struct Accumulated {
    accesses: u64,
}

pub struct DamonTracker {
    config:       DamonConfig,
    slots:        Vec<KdamondSlot>,
    /// `(kdamond_pid, target_id) -> workload pid`, rebuilt at every
    /// `state=on` transition.
    target_map:   HashMap<(i32, u64), usize>,
    accumulated:  Mutex<HashMap<(usize, u64, u64), Accumulated>>,
    raw_ring:     Arc<Mutex<Vec<RawEvent>>>,
    raw_dumping:  bool,
    debugfs_single_pid: Option<usize>,
    child:        Option<Child>,
    stop_flag:    Arc<AtomicBool>,
    parser:       Option<JoinHandle<()>>,
    /// Single-writer channel (spec.md §5): the reader thread spawned by
    /// `spawn_sampler` parses tracepoint lines and sends them here;
    /// `get_counters` drains and folds them into `accumulated`.
    line_tx:      Sender<ParsedLine>,
    line_rx:      Receiver<ParsedLine>,
}

impl DamonTracker {
    pub fn new(config: DamonConfig) -> Self {
        let slots = (0..config.kdamond_slots.max(1))
            .map(|id| KdamondSlot { id, state: KdamondState::Uninitialized, pids: Vec::new(), kdamond_pid: None })
            .collect();

        let (line_tx, line_rx) = crossbeam_channel::unbounded();

        DamonTracker {
            config,
            slots,
            target_map: HashMap::new(),
            accumulated: Mutex::new(HashMap::new()),
            raw_ring: Arc::new(Mutex::new(Vec::new())),
            raw_dumping: false,
            debugfs_single_pid: None,
            child: None,
            stop_flag: Arc::new(AtomicBool::new(false)),
            parser: None,
            line_tx,
            line_rx,
        }
    }

    fn sysfs_attrs_path(&self, slot: usize) -> std::path::PathBuf {
        paths::damon_sysfs_admin_path().join(slot.to_string()).join("contexts").join("0").join("monitoring_attrs")
    }

    fn write_attrs(&self, slot: usize) {
        if self.config.backend != DamonBackend::Sysfs {
            return;
        }
        let base = self.sysfs_attrs_path(slot);
        let entries = [
            ("intervals/sample_us", self.config.sampling_us),
            ("intervals/aggr_us", self.config.aggregation_us),
            ("intervals/update_us", self.config.regions_update_us),
            ("nr_regions/min", self.config.min_target_regions),
            ("nr_regions/max", self.config.max_target_regions),
        ];
        for (rel, value) in entries {
            let path = base.join(rel);
            if let Err(err) = std::fs::write(&path, value.to_string()) {
                debug!("damon: could not write {:?}: {}", path, err);
            }
        }
    }

    fn set_targets(&self, slot: usize, pids: &[usize]) {
        if self.config.backend != DamonBackend::Sysfs {
            return;
        }
        let base = paths::damon_sysfs_admin_path().join(slot.to_string()).join("contexts").join("0").join("targets");
        if let Err(err) = std::fs::write(base.join("nr_targets"), pids.len().to_string()) {
            debug!("damon: could not write nr_targets: {}", err);
        }
        for (i, pid) in pids.iter().enumerate() {
            let pid_path = base.join(i.to_string()).join("pid_target");
            if let Err(err) = std::fs::write(&pid_path, pid.to_string()) {
                debug!("damon: could not write {:?}: {}", pid_path, err);
            }
        }
    }

    fn write_state(&self, slot: usize, on: bool) {
        let state_path = if self.config.backend == DamonBackend::Sysfs {
            paths::damon_sysfs_admin_path().join(slot.to_string()).join("state")
        } else {
            paths::damon_debugfs_path().join("monitor_on")
        };
        let value = if on { "on" } else { "off" };
        if let Err(err) = std::fs::write(&state_path, value) {
            debug!("damon: could not write state {:?}: {}", state_path, err);
        }
    }

    /// `add/remove_pids` while `on` transitions `off → set-targets → on`.
    fn reconfigure_slot(&mut self, slot: usize) {
        let was_on = self.slots[slot].state == KdamondState::On;
        if was_on {
            self.write_state(slot, false);
            self.slots[slot].state = KdamondState::Off;
        }

        self.write_attrs(slot);
        let pids = self.slots[slot].pids.clone();
        self.set_targets(slot, &pids);
        self.slots[slot].state = KdamondState::TargetsSet;

        if was_on || self.slots[slot].state == KdamondState::TargetsSet {
            self.write_state(slot, true);
            self.slots[slot].state = KdamondState::On;
            self.refresh_kdamond_pid(slot);
        }
    }

    fn refresh_kdamond_pid(&mut self, slot: usize) {
        let pid_path = paths::damon_sysfs_admin_path().join(slot.to_string()).join("pid");
        let kdamond_pid = std::fs::read_to_string(&pid_path).ok().and_then(|s| s.trim().parse::<i32>().ok());
        self.slots[slot].kdamond_pid = kdamond_pid;

        if let Some(kpid) = kdamond_pid {
            for (target_id, &workload_pid) in self.slots[slot].pids.iter().enumerate() {
                self.target_map.insert((kpid, target_id as u64), workload_pid);
            }
        }
    }

    /// Resolves a workload pid for an aggregated event (spec.md §4.4.3
    /// step 1).
    fn resolve_pid(&self, kdamond_pid: i32, target_id: u64, start: u64, end: u64) -> Option<usize> {
        if self.config.backend == DamonBackend::Sysfs {
            return self.target_map.get(&(kdamond_pid, target_id)).copied();
        }

        if let Some(only) = self.debugfs_single_pid {
            return Some(only);
        }

        if (target_id as usize) < self.slots.iter().map(|s| s.pids.len()).sum() {
            let mut idx = target_id as usize;
            for slot in &self.slots {
                if idx < slot.pids.len() {
                    return Some(slot.pids[idx]);
                }
                idx -= slot.pids.len();
            }
        }

        self.scan_maps_for_range(start, end)
    }

    fn scan_maps_for_range(&self, start: u64, end: u64) -> Option<usize> {
        let candidates: Vec<usize> = self.slots.iter().flat_map(|s| s.pids.iter().copied()).collect();
        let mut matches = Vec::new();

        for pid in candidates {
            let path = paths::proc_pid_maps_path(Some(pid));
            let Ok(maps) = crate::osaccess::maps::Maps::try_from(path.as_path()) else { continue };
            let contains = maps
                .primary_index()
                .values()
                .any(|region| region.addr_range().start() as u64 <= start && end <= region.addr_range().end() as u64);
            if contains {
                matches.push(pid);
            }
        }

        if matches.len() == 1 {
            matches.into_iter().next()
        } else {
            None
        }
    }

    /// Parses one tracepoint line, e.g.:
    /// `0.030 kdamond.0/262863 damon:damon_aggregated(target_id=0 nr_regions=202 824633720832-824700829696: 0 120)`
    fn parse_line(line: &str) -> Option<(i32, u64, u64, u64, u64, u64)> {
        let slash = line.find('/')?;
        let after_slash = &line[slash + 1..];
        let space = after_slash.find(' ')?;
        let kdamond_pid: i32 = after_slash[..space].parse().ok()?;

        let paren_start = line.find("damon_aggregated(")? + "damon_aggregated(".len();
        let paren_end = line.rfind(')')?;
        let body = &line[paren_start..paren_end];

        let target_id: u64 = body
            .split_whitespace()
            .find_map(|tok| tok.strip_prefix("target_id="))
            .and_then(|v| v.parse().ok())?;

        let colon = body.find(':')?;
        let range_tok = body[..colon].split_whitespace().last()?;
        let (start_s, end_s) = range_tok.split_once('-')?;
        let start: u64 = start_s.parse().ok()?;
        let end: u64 = end_s.parse().ok()?;

        let mut tail = body[colon + 1..].split_whitespace();
        let accesses: u64 = tail.next()?.parse().ok()?;
        let age: u64 = tail.next().unwrap_or("0").parse().unwrap_or(0);

        Some((kdamond_pid, target_id, start, end, accesses, age))
    }

    fn handle_line(&mut self, line: &str) {
        let Some(parsed) = Self::parse_line(line) else { return };
        self.ingest_parsed(parsed);
    }

    /// Folds one already-parsed aggregated event into `accumulated`/
    /// `raw_ring`. Called directly by [`handle_line`] and by
    /// [`drain_channel`] for events the reader thread shipped over the
    /// line channel.
    fn ingest_parsed(&self, (kdamond_pid, target_id, start, end, accesses, age): ParsedLine) {
        if end.saturating_sub(start) > self.config.filter_address_range_size_max {
            return;
        }

        let Some(pid) = self.resolve_pid(kdamond_pid, target_id, start, end) else { return };
        let length_pages = (end - start) / crate::addr::range::PAGE_SIZE as u64;

        let key = (pid, start, length_pages);
        self.accumulated.lock().entry(key).or_insert(Accumulated { accesses: 0 }).accesses += accesses;

        if self.raw_dumping {
            self.raw_ring.lock().push(RawEvent { pid, start, length_pages, accesses, age });
        }
    }

    /// Drains whatever the reader thread has shipped over the line channel
    /// (spec.md §5) since the last call, folding each event into
    /// `accumulated`.
    fn drain_channel(&self) {
        while let Ok(parsed) = self.line_rx.try_recv() {
            self.ingest_parsed(parsed);
        }
    }

    /// Launches the sampling child (bpftrace preferred, falling back to
    /// `perf trace`) and a thread that parses its stdout and ships each
    /// event over the line channel to [`drain_channel`].
    fn spawn_sampler(&mut self) -> Result<(), Error> {
        let mut child = Command::new("bpftrace")
            .args(["-e", "tracepoint:damon:damon_aggregated { printf(\"%s\\n\", str(args)); }"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .or_else(|_| {
                Command::new("perf")
                    .args(["trace", "-e", "damon:damon_aggregated"])
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .spawn()
            })
            .map_err(|e| Error::syscall("spawn damon sampler", e))?;

        let stdout = child.stdout.take().ok_or_else(|| Error::kernel_unsupported("sampler child had no stdout"))?;
        self.child = Some(child);

        let stop = Arc::clone(&self.stop_flag);
        let tx = self.line_tx.clone();

        let reader = BufReader::new(stdout);
        self.parser = Some(std::thread::spawn(move || {
            for line in reader.lines().flatten() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match Self::parse_line(&line) {
                    Some(parsed) => {
                        if tx.send(parsed).is_err() {
                            warn!("damon: line channel closed, parser thread exiting");
                            break;
                        }
                    }
                    None => debug!("damon: unparsed raw line: {}", line),
                }
            }
        }));

        Ok(())
    }
}

impl Tracker for DamonTracker {
    fn set_config(&mut self, json: serde_json::Value) -> Result<(), Error> {
        self.config = serde_json::from_value(json).map_err(|e| Error::config(format!("damon config: {}", e)))?;
        Ok(())
    }

    fn get_config(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or(serde_json::Value::Null)
    }

    fn add_pids(&mut self, pids: &[usize]) -> Result<(), Error> {
        let n_slots = self.slots.len();
        if self.config.backend == DamonBackend::Debugfs && n_slots == 1 {
            if self.slots[0].pids.is_empty() && pids.len() == 1 {
                self.debugfs_single_pid = Some(pids[0]);
            } else {
                self.debugfs_single_pid = None;
            }
        }

        for (i, &pid) in pids.iter().enumerate() {
            let slot = i % n_slots;
            self.slots[slot].pids.push(pid);
        }

        let touched: Vec<usize> = (0..n_slots).collect();
        for slot in touched {
            self.reconfigure_slot(slot);
        }
        Ok(())
    }

    fn remove_pids(&mut self, pids: RemovePids) -> Result<(), Error> {
        match pids {
            RemovePids::All => {
                for slot in self.slots.iter_mut() {
                    slot.pids.clear();
                }
                self.debugfs_single_pid = None;
            }
            RemovePids::Some(remove) => {
                for slot in self.slots.iter_mut() {
                    slot.pids.retain(|p| !remove.contains(p));
                }
            }
        }

        let n_slots = self.slots.len();
        for slot in 0..n_slots {
            self.reconfigure_slot(slot);
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), Error> {
        if self.child.is_some() {
            return Err(Error::AlreadyStarted { what: "damon tracker" });
        }
        self.stop_flag.store(false, Ordering::SeqCst);
        self.spawn_sampler()
    }

    fn stop(&mut self) -> Result<(), Error> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        if let Some(parser) = self.parser.take() {
            let _ = parser.join();
        }
        Ok(())
    }

    fn reset_counters(&mut self) {
        self.accumulated.lock().clear();
    }

    fn get_counters(&self) -> Vec<TrackerCounter> {
        self.drain_channel();
        self.accumulated
            .lock()
            .iter()
            .map(|(&(pid, start, length), acc)| TrackerCounter::new(pid, start, length.max(1), acc.accesses, acc.accesses, 0))
            .collect()
    }

    fn dump(&self, args: &str) -> Result<String, Error> {
        match args {
            "raw new" | "raw start" => Ok("raw access ring enabled".to_string()),
            "raw stop" => Ok("raw access ring disabled".to_string()),
            _ => {
                let ring = self.raw_ring.lock();
                Ok(format!("{} raw events buffered", ring.len()))
            }
        }
    }
}

impl DamonTracker {
    pub fn set_raw_dumping(&mut self, enabled: bool) {
        self.raw_dumping = enabled;
        if !enabled {
            self.raw_ring.lock().clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_aggregated_line() {
        let line = "0.030 kdamond.0/262863 damon:damon_aggregated(target_id=0 nr_regions=202 824633720832-824700829696: 0 120)";
        let (kdamond_pid, target_id, start, end, accesses, age) = DamonTracker::parse_line(line).unwrap();
        assert_eq!(kdamond_pid, 262863);
        assert_eq!(target_id, 0);
        assert_eq!(start, 824633720832);
        assert_eq!(end, 824700829696);
        assert_eq!(accesses, 0);
        assert_eq!(age, 120);
    }

    #[test]
    fn handle_line_accumulates_by_range() {
        let mut tracker = DamonTracker::new(DamonConfig::default());
        tracker.debugfs_single_pid = Some(42);
        tracker.config.backend = DamonBackend::Debugfs;

        let line = "0.030 kdamond.0/1 damon:damon_aggregated(target_id=0 nr_regions=1 1000-2000: 5 1)";
        tracker.handle_line(line);

        let counters = tracker.get_counters();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].accesses, 5);
        assert_eq!(counters[0].pid(), 42);
    }

    #[test]
    fn filters_oversized_ranges() {
        let mut tracker = DamonTracker::new(DamonConfig::default());
        tracker.debugfs_single_pid = Some(1);
        tracker.config.backend = DamonBackend::Debugfs;
        tracker.config.filter_address_range_size_max = 10;

        let line = "0.030 kdamond.0/1 damon:damon_aggregated(target_id=0 nr_regions=1 1000-2000: 5 1)";
        tracker.handle_line(line);

        assert!(tracker.get_counters().is_empty());
    }

    /// Stands in for the reader thread spawned by `spawn_sampler`: sends a
    /// parsed line over `line_tx` rather than calling `handle_line`
    /// directly, so `get_counters` must drain the channel to see it.
    #[test]
    fn get_counters_drains_events_sent_over_the_line_channel() {
        let mut tracker = DamonTracker::new(DamonConfig::default());
        tracker.debugfs_single_pid = Some(7);
        tracker.config.backend = DamonBackend::Debugfs;

        let parsed = DamonTracker::parse_line(
            "0.030 kdamond.0/1 damon:damon_aggregated(target_id=0 nr_regions=1 1000-2000: 3 1)",
        )
        .unwrap();
        tracker.line_tx.send(parsed).unwrap();

        let counters = tracker.get_counters();
        assert_eq!(counters.len(), 1);
        assert_eq!(counters[0].accesses, 3);
        assert_eq!(counters[0].pid(), 7);

        // Draining is idempotent: the channel is empty on the next call.
        assert!(tracker.get_counters().len() == 1);
    }
}
