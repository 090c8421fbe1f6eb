//! Narrow Prometheus-style counter/gauge façade (SPEC_FULL.md §4.11). The
//! HTTP scrape endpoint is out of scope (spec.md §1); this is just the
//! in-process registry the stats store and mover report into so an external
//! exporter has something real to scrape later.
use std::collections::HashMap;

use crate::deps::{lazy_static::lazy_static, parking_lot::Mutex};

/// Write side of the metrics façade. `Registry` is the only implementation
/// shipped; the trait exists so tests and the prompt's `stats` command can
/// swap in a no-op or recording sink.
pub trait Sink: Send + Sync {
    fn inc_counter(&self, name: &'static str, labels: &[(&str, &str)]);
    fn set_gauge(&self, name: &'static str, labels: &[(&str, &str)], value: f64);
}

fn label_key(name: &str, labels: &[(&str, &str)]) -> String {
    if labels.is_empty() {
        return name.to_string();
    }
    let mut key = String::from(name);
    for (k, v) in labels {
        key.push('{');
        key.push_str(k);
        key.push('=');
        key.push_str(v);
        key.push('}');
    }
    key
}

/// In-process registry, atomics for counters, a mutex-guarded map for
/// gauges (spec.md §5's "one mutex per subsystem, held briefly").
#[derive(Default)]
pub struct Registry {
    counters: Mutex<HashMap<String, u64>>,
    gauges:   Mutex<HashMap<String, f64>>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    /// Snapshot of every counter/gauge currently registered, for
    /// `-config-dump-json`-style introspection and tests.
    pub fn snapshot(&self) -> (HashMap<String, u64>, HashMap<String, f64>) {
        (self.counters.lock().clone(), self.gauges.lock().clone())
    }
}

impl Sink for Registry {
    fn inc_counter(&self, name: &'static str, labels: &[(&str, &str)]) {
        let key = label_key(name, labels);
        *self.counters.lock().entry(key).or_insert(0) += 1;
    }

    fn set_gauge(&self, name: &'static str, labels: &[(&str, &str)], value: f64) {
        let key = label_key(name, labels);
        self.gauges.lock().insert(key, value);
    }
}

lazy_static! {
    static ref GLOBAL: Registry = Registry::new();
}

/// The process-wide registry every subsystem reports into.
pub fn global() -> &'static Registry {
    &GLOBAL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_increments() {
        let reg = Registry::new();
        reg.inc_counter("a", &[]);
        reg.inc_counter("a", &[]);
        let (counters, _) = reg.snapshot();
        assert_eq!(counters["a"], 2);
    }

    #[test]
    fn labels_distinguish_series() {
        let reg = Registry::new();
        reg.inc_counter("moves", &[("to", "0")]);
        reg.inc_counter("moves", &[("to", "1")]);
        let (counters, _) = reg.snapshot();
        assert_eq!(counters.len(), 2);
    }

    #[test]
    fn gauge_overwrites() {
        let reg = Registry::new();
        reg.set_gauge("g", &[], 1.0);
        reg.set_gauge("g", &[], 2.0);
        let (_, gauges) = reg.snapshot();
        assert_eq!(gauges["g"], 2.0);
    }
}
