//! Age policy (spec.md §4.6.3): tracks how many recent rounds each range
//! changed, and swaps out/idles/re-activates ranges by how stale or hot
//! their change history is.
use std::collections::HashMap;

use crate::{
    mover::{MoverHandle, MoverTask},
    node::Node,
    tracker::{Tracker, TrackerCounter},
};

#[derive(Clone, Debug, Default)]
pub struct AgePolicyConfig {
    pub interval_ms:   u64,
    pub idle_ms:       u64,
    pub idle_numas:    Vec<Node>,
    pub active_ms:     u64,
    pub active_numas:  Vec<Node>,
    pub swap_out_ms:   u64,
}

#[derive(Clone, Debug)]
struct Entry {
    length:       u64,
    last_seen_ms: u64,
    last_changed_ms: u64,
    last_rounds:  u64,
    accesses:     u64,
    reads:        u64,
    writes:       u64,
    last_numa:    Node,
}

pub struct AgePolicy {
    tracker: Box<dyn Tracker>,
    mover:   MoverHandle,
    config:  AgePolicyConfig,
    /// `palt[pid][addr][length]`
    palt:    HashMap<usize, HashMap<(u64, u64), Entry>>,
}

impl AgePolicy {
    pub fn new(tracker: Box<dyn Tracker>, mover: MoverHandle, config: AgePolicyConfig) -> Self {
        AgePolicy { tracker, mover, config, palt: HashMap::new() }
    }

    /// Forwards to the owned tracker so a run loop's pid-watcher diff can
    /// drive it without reaching into the policy's internals.
    pub fn add_pids(&mut self, pids: &[usize]) -> Result<(), crate::error::Error> {
        self.tracker.add_pids(pids)
    }

    pub fn remove_pids(&mut self, pids: crate::tracker::RemovePids) -> Result<(), crate::error::Error> {
        self.tracker.remove_pids(pids)
    }

    fn active_mask(&self) -> u64 {
        if self.config.active_ms == 0 || self.config.interval_ms == 0 {
            return 0;
        }
        let shift = (self.config.active_ms / self.config.interval_ms) as u32;
        (1u64 << shift.min(63)) - 1
    }

    /// One policy tick (spec.md §4.6.3 steps 1-5). `now_ms` is the tick's
    /// wall-clock timestamp in milliseconds.
    pub fn tick(&mut self, now_ms: u64) {
        let counters = self.tracker.get_counters();
        self.tracker.reset_counters();

        self.upsert(&counters, now_ms);
        self.expire_dead(now_ms);

        if self.config.swap_out_ms > 0 {
            self.sweep(now_ms, self.config.swap_out_ms, Node::SWAP, false);
        }

        if self.config.idle_ms > 0 && !self.config.idle_numas.is_empty() {
            let dest = self.config.idle_numas[0];
            self.sweep(now_ms, self.config.idle_ms, dest, true);
        }

        let mask = self.active_mask();
        if mask != 0 && !self.config.active_numas.is_empty() {
            let dest = self.config.active_numas[0];
            let active_pids: Vec<(usize, u64, u64)> = self
                .palt
                .iter()
                .flat_map(|(&pid, ranges)| {
                    ranges
                        .iter()
                        .filter(move |(_, e)| e.last_rounds & mask == mask)
                        .map(move |(&(addr, length), _)| (pid, addr, length))
                })
                .collect();

            for (pid, addr, length) in active_pids {
                self.enqueue(pid, addr, length, dest);
            }
        }
    }

    fn upsert(&mut self, counters: &[TrackerCounter], now_ms: u64) {
        for tc in counters {
            let pid = tc.pid();
            let ranges = self.palt.entry(pid).or_default();

            for r in tc.ranges.iter() {
                let key = (r.addr(), r.length());
                let entry = ranges.entry(key).or_insert_with(|| Entry {
                    length: r.length(),
                    last_seen_ms: now_ms,
                    last_changed_ms: now_ms,
                    last_rounds: 0,
                    accesses: 0,
                    reads: 0,
                    writes: 0,
                    last_numa: Node::UNDEFINED,
                });

                let changed = entry.accesses != tc.accesses || entry.reads != tc.reads || entry.writes != tc.writes;
                entry.last_rounds <<= 1;
                if changed {
                    entry.last_rounds |= 1;
                    entry.last_changed_ms = now_ms;
                }
                entry.last_seen_ms = now_ms;
                entry.accesses = tc.accesses;
                entry.reads = tc.reads;
                entry.writes = tc.writes;
            }
        }
    }

    fn expire_dead(&mut self, now_ms: u64) {
        let dead_after = 2 * self.config.interval_ms;
        for ranges in self.palt.values_mut() {
            ranges.retain(|_, entry| now_ms.saturating_sub(entry.last_seen_ms) <= dead_after);
        }
        self.palt.retain(|_, ranges| !ranges.is_empty());
    }

    /// Shared swap-out/idle sweep: collects entries whose `LastChanged` is
    /// older than `threshold_ms`, merges contiguous regions, and enqueues a
    /// mover task to `dest`. When `skip_if_on_dest` is set (the idle case),
    /// pages already believed to be on `dest` are left alone.
    fn sweep(&mut self, now_ms: u64, threshold_ms: u64, dest: Node, skip_if_on_dest: bool) {
        let pids: Vec<usize> = self.palt.keys().copied().collect();

        for pid in pids {
            let mut matches: Vec<(u64, u64)> = {
                let ranges = &self.palt[&pid];
                ranges
                    .iter()
                    .filter(|(_, e)| {
                        now_ms.saturating_sub(e.last_changed_ms) > threshold_ms
                            && (!skip_if_on_dest || e.last_numa != dest)
                    })
                    .map(|(&key, _)| key)
                    .collect()
            };
            matches.sort();

            if matches.is_empty() {
                continue;
            }

            // Record the belief against each original per-counter key
            // before merging -- `merge_contiguous` folds several `palt`
            // keys into one wider `(addr, length)` pair that isn't itself
            // a key in the map, so updating post-merge would silently
            // drop the write.
            if let Some(ranges) = self.palt.get_mut(&pid) {
                for &key in &matches {
                    if let Some(entry) = ranges.get_mut(&key) {
                        entry.last_numa = dest;
                    }
                }
            }

            for (addr, length) in merge_contiguous(matches) {
                self.enqueue(pid, addr, length, dest);
            }
        }
    }

    fn enqueue(&mut self, pid: usize, addr: u64, length: u64, dest: Node) {
        let range = crate::addr::range::AddrRange::new(addr, length);
        let ranges = crate::addr::range::AddrRanges::new(pid, vec![range]);
        let attrs = crate::addr::range::PageAttrs { present: Some(true), ..Default::default() };

        let pages = ranges.pages_matching(attrs).unwrap_or_default();
        if pages.is_empty() {
            return;
        }

        self.mover.add_task(MoverTask::new(pid, pages, dest));
    }
}

/// Merges a sorted list of `(addr, length)` page-region keys into maximal
/// contiguous runs.
fn merge_contiguous(mut keys: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    keys.sort();
    let mut out: Vec<(u64, u64)> = Vec::new();

    for (addr, length) in keys {
        if let Some(last) = out.last_mut() {
            let last_end = last.0 + last.1 * crate::addr::range::PAGE_SIZE as u64;
            if last_end == addr {
                last.1 += length;
                continue;
            }
        }
        out.push((addr, length));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_mask_matches_formula() {
        let policy_config = AgePolicyConfig { interval_ms: 100, active_ms: 400, ..Default::default() };
        let policy = AgePolicy::new(
            Box::new(crate::tracker::softdirty::SoftdirtyTracker::new(Default::default())),
            MoverHandle::spawn(Default::default()),
            policy_config,
        );
        assert_eq!(policy.active_mask(), 0b1111);
    }

    #[test]
    fn merge_contiguous_joins_adjacent_regions() {
        let merged = merge_contiguous(vec![(0x1000, 2), (0x1000 + 2 * 4096, 3)]);
        assert_eq!(merged, vec![(0x1000, 5)]);
    }

    #[test]
    fn merge_contiguous_keeps_gaps_separate() {
        let merged = merge_contiguous(vec![(0x1000, 1), (0x5000, 1)]);
        assert_eq!(merged.len(), 2);
    }

    fn idle_entry() -> Entry {
        Entry {
            length: 0,
            last_seen_ms: 0,
            last_changed_ms: 0,
            last_rounds: 0,
            accesses: 0,
            reads: 0,
            writes: 0,
            last_numa: Node::UNDEFINED,
        }
    }

    /// `sweep` merges contiguous `palt` keys into one wider range before
    /// enqueuing, but the belief write must land on each original key --
    /// the merged `(addr, length)` pair is never itself a `palt` entry.
    #[test]
    fn sweep_records_last_numa_on_every_merged_key() {
        let mut policy = AgePolicy::new(
            Box::new(crate::tracker::softdirty::SoftdirtyTracker::new(Default::default())),
            MoverHandle::spawn(Default::default()),
            AgePolicyConfig::default(),
        );

        let pid = 4242usize;
        let page = crate::addr::range::PAGE_SIZE as u64;
        let first = (0x1000u64, 2u64);
        let second = (0x1000 + 2 * page, 3u64);

        let mut ranges = HashMap::new();
        ranges.insert(first, idle_entry());
        ranges.insert(second, idle_entry());
        policy.palt.insert(pid, ranges);

        let dest = Node::new(1);
        policy.sweep(10_000, 0, dest, true);

        let ranges = &policy.palt[&pid];
        assert_eq!(ranges[&first].last_numa, dest);
        assert_eq!(ranges[&second].last_numa, dest);
    }
}
