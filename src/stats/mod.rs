//! Lock-free-append stats ring and the `StatActions` routine (spec.md
//! §4.7). Every subsystem (mover, trackers, policies) calls
//! [`StatsStore::store`]; `StatActions` ticks on its own thread and fires
//! shell commands off stat growth.
pub mod runner;

use std::collections::VecDeque;

use crate::{
    deps::{log::debug, parking_lot::Mutex},
    metrics,
    node::Node,
};

/// One tagged record appended to the ring (spec.md §4.7).
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Heartbeat,
    Moved { pid: usize, pages: usize, to: Node, error: Option<String> },
    Madvised { pid: usize, pages: usize, advice: Advice, error: Option<String> },
    Scanned { pid: usize, ranges: usize },
    Pulse { label: String },
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Advice {
    Pageout,
    Cold,
}

impl Advice {
    fn as_str(self) -> &'static str {
        match self {
            Advice::Pageout => "pageout",
            Advice::Cold => "cold",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Summary {
    pub heartbeats: u64,
    pub moved_pages: u64,
    pub move_errors: u64,
    pub madvised_pages: u64,
    pub scanned_ranges: u64,
}

/// Append-only ring of the last `capacity` events, one mutex held only for
/// the duration of a push/read (spec.md §5's "one mutex per subsystem, held
/// briefly" discipline).
pub struct StatsStore {
    capacity: usize,
    ring:     Mutex<VecDeque<Event>>,
}

impl StatsStore {
    pub fn new(capacity: usize) -> Self {
        StatsStore { capacity: capacity.max(1), ring: Mutex::new(VecDeque::new()) }
    }

    /// Appends `event`, dropping the oldest record past `capacity`, and
    /// increments the matching metrics counter (spec.md §4.7 **[AMBIENT]**).
    pub fn store(&self, event: Event) {
        self.bump_metrics(&event);

        let mut ring = self.ring.lock();
        if ring.len() >= self.capacity {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    fn bump_metrics(&self, event: &Event) {
        match event {
            Event::Heartbeat => metrics::global().inc_counter("tierd_heartbeats_total", &[]),
            Event::Moved { to, error, .. } => {
                let label = to.to_string();
                metrics::global().inc_counter("tierd_moved_total", &[("to", &label)]);
                if error.is_some() {
                    metrics::global().inc_counter("tierd_move_errors_total", &[]);
                }
            }
            Event::Madvised { advice, error, .. } => {
                metrics::global().inc_counter("tierd_madvised_total", &[("advice", advice.as_str())]);
                if error.is_some() {
                    metrics::global().inc_counter("tierd_madvise_errors_total", &[]);
                }
            }
            Event::Scanned { .. } => metrics::global().inc_counter("tierd_scans_total", &[]),
            Event::Pulse { label } => metrics::global().inc_counter("tierd_pulses_total", &[("label", label)]),
        }
    }

    /// Rolls up the whole ring into running totals.
    pub fn summarize(&self) -> Summary {
        let ring = self.ring.lock();
        let mut summary = Summary::default();

        for event in ring.iter() {
            match event {
                Event::Heartbeat => summary.heartbeats += 1,
                Event::Moved { pages, error, .. } => {
                    summary.moved_pages += *pages as u64;
                    if error.is_some() {
                        summary.move_errors += 1;
                    }
                }
                Event::Madvised { pages, .. } => summary.madvised_pages += *pages as u64,
                Event::Scanned { ranges, .. } => summary.scanned_ranges += *ranges as u64,
                Event::Pulse { .. } => {}
            }
        }

        summary
    }

    /// Copies out every event matching `filter`, oldest first.
    pub fn dump<F>(&self, mut filter: F) -> Vec<Event>
    where
        F: FnMut(&Event) -> bool,
    {
        self.ring.lock().iter().filter(|e| filter(e)).cloned().collect()
    }

    /// The most recent `Moved` event for `pid`, if any.
    pub fn last_move(&self, pid: usize) -> Option<Event> {
        self.ring
            .lock()
            .iter()
            .rev()
            .find(|e| matches!(e, Event::Moved { pid: p, .. } if *p == pid))
            .cloned()
    }

    /// The most recent `Moved` event for `pid` that recorded an error.
    pub fn last_move_with_error(&self, pid: usize) -> Option<Event> {
        self.ring
            .lock()
            .iter()
            .rev()
            .find(|e| matches!(e, Event::Moved { pid: p, error: Some(_), .. } if *p == pid))
            .cloned()
    }

    /// Total pages madvised for `pid` with `advice`, across the whole ring.
    pub fn madvised_page_count(&self, pid: usize, advice: Advice) -> u64 {
        self.ring
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Madvised { pid: p, pages, advice: a, .. } if *p == pid && *a == advice => Some(*pages as u64),
                _ => None,
            })
            .sum()
    }
}

/// Config for the `StatActions` routine (spec.md §4.7).
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StatActionsConfig {
    pub interval_ms:       u64,
    pub interval_command:  Option<runner::CommandSpec>,
    pub page_out_command:  Option<runner::CommandSpec>,
    pub page_out_mb:       u64,
    /// Pid whose `madvised_page_count(_, Pageout)` growth triggers `page_out_command`.
    pub watch_pid:         usize,
}

/// Ticks `interval_ms`, running `interval_command` every tick and
/// `page_out_command` whenever `madvised_page_count` grows by `page_out_mb`
/// since the last firing (spec.md §4.7).
pub struct StatActions<'a> {
    stats:            &'a StatsStore,
    config:           StatActionsConfig,
    last_fired_pages: u64,
}

impl<'a> StatActions<'a> {
    pub fn new(stats: &'a StatsStore, config: StatActionsConfig) -> Self {
        StatActions { stats, config, last_fired_pages: 0 }
    }

    /// One tick of the routine. Returns without error even when a command
    /// fails to spawn -- command failures are logged, not propagated, so a
    /// broken hook never stops the daemon (spec.md §7's non-fatal framing).
    pub fn tick(&mut self) {
        self.stats.store(Event::Heartbeat);

        if let Some(spec) = &self.config.interval_command {
            if let Err(err) = spec.run() {
                debug!("statactions: interval_command failed: {}", err);
            }
        }

        let pages = self.stats.madvised_page_count(self.config.watch_pid, Advice::Pageout);
        let grown_mb = pages.saturating_sub(self.last_fired_pages) * crate::addr::range::PAGE_SIZE as u64 / (1024 * 1024);

        if self.config.page_out_mb > 0 && grown_mb >= self.config.page_out_mb {
            self.last_fired_pages = pages;
            if let Some(spec) = &self.config.page_out_command {
                if let Err(err) = spec.run() {
                    debug!("statactions: page_out_command failed: {}", err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest_past_capacity() {
        let store = StatsStore::new(2);
        store.store(Event::Heartbeat);
        store.store(Event::Pulse { label: "a".into() });
        store.store(Event::Pulse { label: "b".into() });

        let dumped = store.dump(|_| true);
        assert_eq!(dumped.len(), 2);
        assert_eq!(dumped[0], Event::Pulse { label: "a".into() });
    }

    #[test]
    fn summarize_aggregates_moved_pages() {
        let store = StatsStore::new(16);
        store.store(Event::Moved { pid: 1, pages: 3, to: Node::new(0), error: None });
        store.store(Event::Moved { pid: 1, pages: 2, to: Node::new(0), error: Some("eio".into()) });

        let summary = store.summarize();
        assert_eq!(summary.moved_pages, 5);
        assert_eq!(summary.move_errors, 1);
    }

    #[test]
    fn last_move_with_error_finds_most_recent() {
        let store = StatsStore::new(16);
        store.store(Event::Moved { pid: 7, pages: 1, to: Node::new(0), error: None });
        store.store(Event::Moved { pid: 7, pages: 1, to: Node::new(0), error: Some("eio".into()) });

        let found = store.last_move_with_error(7);
        assert!(matches!(found, Some(Event::Moved { error: Some(_), .. })));
    }

    #[test]
    fn madvised_page_count_sums_matching_advice() {
        let store = StatsStore::new(16);
        store.store(Event::Madvised { pid: 1, pages: 4, advice: Advice::Pageout, error: None });
        store.store(Event::Madvised { pid: 1, pages: 2, advice: Advice::Cold, error: None });

        assert_eq!(store.madvised_page_count(1, Advice::Pageout), 4);
        assert_eq!(store.madvised_page_count(1, Advice::Cold), 2);
    }
}
