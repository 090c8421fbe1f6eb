//! Heat policy (spec.md §4.6.2): places `HeatRange`s onto NUMA nodes
//! according to `heat_numas[class]`, either unconstrained (no-limits mode)
//! or capacity-aware (fill-fast-free mode) when `numa_size` is configured.
use std::collections::HashMap;

use crate::{
    addr::{datas::AddrDatas, range::{AddrRange, PageAttrs}},
    deps::log::debug,
    heatmap::{heat_class, Heatmap, HeatmapConfig, HeatRange},
    mover::{MoverHandle, MoverTask},
    node::Node,
    policy::{forecast::ForecasterChain, PageInfo},
    tracker::Tracker,
};

const NO_LIMITS_UPDATED_WINDOW_NS: u64 = 10_000_000_000;
const NO_LIMITS_MIN_AGE_NS: u64 = 20_000_000_000;
const SWAP_CHECK_BUDGET_PER_TICK: usize = 64;

#[derive(Clone, Debug, Default)]
pub struct HeatPolicyConfig {
    pub heat_numas: HashMap<u32, Vec<Node>>,
    pub numa_size:  HashMap<Node, u64>,
    /// Enables the optional `HeatForecaster` chain (spec.md §4.6.2 step 3).
    pub forecast:   bool,
}

pub struct HeatPolicy {
    tracker:    Box<dyn Tracker>,
    heatmap:    Heatmap,
    mover:      MoverHandle,
    forecaster: Option<ForecasterChain>,
    config:     HeatPolicyConfig,
    believed:   HashMap<usize, AddrDatas<PageInfo>>,
    numa_used:  HashMap<Node, u64>,
}

impl HeatPolicy {
    pub fn new(tracker: Box<dyn Tracker>, mover: MoverHandle, heatmap_config: HeatmapConfig, config: HeatPolicyConfig) -> Self {
        HeatPolicy {
            tracker,
            heatmap: Heatmap::new(heatmap_config),
            mover,
            forecaster: None,
            config,
            believed: HashMap::new(),
            numa_used: HashMap::new(),
        }
    }

    pub fn set_forecaster(&mut self, forecaster: ForecasterChain) {
        self.forecaster = Some(forecaster);
    }

    /// Forwards to the owned tracker so a run loop's pid-watcher diff can
    /// drive it without reaching into the policy's internals.
    pub fn add_pids(&mut self, pids: &[usize]) -> Result<(), crate::error::Error> {
        self.tracker.add_pids(pids)
    }

    pub fn remove_pids(&mut self, pids: crate::tracker::RemovePids) -> Result<(), crate::error::Error> {
        self.tracker.remove_pids(pids)
    }

    fn is_limited_mode(&self) -> bool {
        !self.config.numa_size.is_empty()
    }

    /// One policy tick (spec.md §4.6.2 steps 1-5).
    pub fn tick(&mut self, now_ns: u64) {
        let counters = self.tracker.get_counters();
        self.tracker.reset_counters();

        self.heatmap.update_from_counters(&counters, now_ns);

        let real_snapshot: Option<HashMap<usize, Vec<HeatRange>>> = self.forecaster.as_mut().map(|chain| {
            let pids: Vec<usize> = self.heatmap.pids().copied().collect();
            let snapshot: HashMap<usize, Vec<HeatRange>> =
                pids.iter().map(|&pid| (pid, self.heatmap.ranges(pid).to_vec())).collect();

            for &pid in &pids {
                let forecast = chain.forecast(self.heatmap.ranges(pid), now_ns);
                self.heatmap.set_ranges(pid, forecast);
            }
            snapshot
        });

        self.update_paged_out_locations();

        if self.mover.pending() == 0 {
            if self.is_limited_mode() {
                self.place_fill_fast_free(now_ns);
            } else {
                self.place_no_limits(now_ns);
            }
        }

        if let Some(snapshot) = real_snapshot {
            for (pid, ranges) in snapshot {
                self.heatmap.set_ranges(pid, ranges);
            }
        }
    }

    /// Step 4: for ranges believed to be on `SWAP`, check whether they are
    /// still swapped out and reset belief to `UNDEFINED` if not (capped per
    /// tick).
    fn update_paged_out_locations(&mut self) {
        let mut checked = 0usize;

        for (&pid, datas) in self.believed.iter_mut() {
            if checked >= SWAP_CHECK_BUDGET_PER_TICK {
                break;
            }

            let swapped_entries: Vec<AddrRange> = datas
                .iter()
                .filter(|(_, info)| info.node.is_swap())
                .map(|(r, _)| *r)
                .collect();

            for range in swapped_entries {
                if checked >= SWAP_CHECK_BUDGET_PER_TICK {
                    break;
                }
                checked += 1;

                let ranges = crate::addr::range::AddrRanges::new(pid, vec![range]);
                let attrs = PageAttrs { present: Some(true), ..Default::default() };
                if let Ok(present) = ranges.pages_matching(attrs) {
                    let still_swapped = present.is_empty();
                    if !still_swapped {
                        datas.set(range, PageInfo { node: Node::UNDEFINED });
                    }
                }
            }
        }
    }

    fn place_no_limits(&mut self, now_ns: u64) {
        let pids: Vec<usize> = self.heatmap.pids().copied().collect();

        for pid in pids {
            let ranges: Vec<HeatRange> = self.heatmap.ranges(pid).to_vec();

            for hr in ranges {
                let updated_recently = now_ns.saturating_sub(hr.updated_ns) <= NO_LIMITS_UPDATED_WINDOW_NS;
                let old_enough = hr.age_ns(now_ns) >= NO_LIMITS_MIN_AGE_NS;
                if !updated_recently || !old_enough {
                    continue;
                }

                let class = heat_class(self.heatmap.config(), &hr);
                let Some(targets) = self.config.heat_numas.get(&class) else { continue };
                let Some(&dest) = targets.first() else { continue };

                self.enqueue_materialized(pid, hr, dest);
            }
        }
    }

    fn place_fill_fast_free(&mut self, _now_ns: u64) {
        let pids: Vec<usize> = self.heatmap.pids().copied().collect();

        for pid in pids {
            let mut ranges: Vec<HeatRange> = self.heatmap.ranges(pid).to_vec();
            ranges.sort_by(|a, b| b.heat.partial_cmp(&a.heat).unwrap_or(std::cmp::Ordering::Equal).then(a.addr.cmp(&b.addr)));

            for hr in ranges {
                let class = heat_class(self.heatmap.config(), &hr);
                let Some(targets) = self.config.heat_numas.get(&class) else { continue };
                if targets.is_empty() {
                    continue;
                }

                let datas = self.believed.entry(pid).or_default();
                let believed = datas.get(hr.addr).copied().unwrap_or_default();

                if targets.contains(&believed.node) {
                    continue;
                }

                let current = if believed.node.is_undefined() {
                    self.query_location(pid, &hr).unwrap_or(Node::UNDEFINED)
                } else {
                    believed.node
                };

                let dest = targets
                    .iter()
                    .copied()
                    .filter(|&node| self.slack(node) >= hr.length as i64)
                    .max_by_key(|&node| self.slack(node));

                let Some(dest) = dest else { continue };

                self.enqueue_materialized(pid, hr, dest);

                *self.numa_used.entry(dest).or_insert(0) += hr.length;
                if current.is_real() {
                    let used = self.numa_used.entry(current).or_insert(0);
                    *used = used.saturating_sub(hr.length);
                }
            }
        }
    }

    fn slack(&self, node: Node) -> i64 {
        match self.config.numa_size.get(&node) {
            Some(&cap) => cap as i64 - *self.numa_used.get(&node).unwrap_or(&0) as i64,
            None => i64::MAX,
        }
    }

    fn query_location(&self, pid: usize, hr: &HeatRange) -> Option<Node> {
        let range = AddrRange::new(hr.addr, hr.length);
        let ranges = crate::addr::range::AddrRanges::new(pid, vec![range]);
        let attrs = PageAttrs { present: Some(true), ..Default::default() };
        let addrs = ranges.pages_matching(attrs).ok()?;
        if addrs.is_empty() {
            return None;
        }
        let result = crate::osaccess::movepages::move_pages(pid as i32, &addrs, None, 0).ok()?;
        result.status.first().map(|&raw| Node::from_raw(raw))
    }

    fn enqueue_materialized(&mut self, pid: usize, hr: HeatRange, dest: Node) {
        let range = AddrRange::new(hr.addr, hr.length);
        let ranges = crate::addr::range::AddrRanges::new(pid, vec![range]);
        let attrs = PageAttrs { present: Some(true), exclusive: Some(true), ..Default::default() };

        let pages = match ranges.pages_matching(attrs) {
            Ok(p) => p,
            Err(err) => {
                debug!("heat policy: pagemap scan failed for pid {}: {}", pid, err);
                return;
            }
        };

        if pages.is_empty() {
            return;
        }

        self.mover.add_task(MoverTask::new(pid, pages, dest));

        let datas = self.believed.entry(pid).or_default();
        datas.set(range, PageInfo { node: dest });
    }
}
