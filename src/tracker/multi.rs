//! Composite tracker (spec.md §4.4.4): fans `add_pids`/`remove_pids`/
//! `start`/`stop`/`reset_counters` out to N inner trackers and flattens
//! their combined `get_counters()` output.
use crate::{
    error::Error,
    tracker::{default_cut, default_union, flatten, RemovePids, Tracker, TrackerCounter},
};

pub struct MultiTracker {
    inner: Vec<Box<dyn Tracker>>,
}

impl MultiTracker {
    pub fn new(inner: Vec<Box<dyn Tracker>>) -> Self {
        MultiTracker { inner }
    }
}

impl Tracker for MultiTracker {
    fn set_config(&mut self, json: serde_json::Value) -> Result<(), Error> {
        let per_tracker: Vec<serde_json::Value> =
            serde_json::from_value(json).map_err(|e| Error::config(format!("multi tracker config: {}", e)))?;

        if per_tracker.len() != self.inner.len() {
            return Err(Error::config("multi tracker config length did not match inner tracker count"));
        }

        for (tracker, config) in self.inner.iter_mut().zip(per_tracker) {
            tracker.set_config(config)?;
        }
        Ok(())
    }

    fn get_config(&self) -> serde_json::Value {
        serde_json::Value::Array(self.inner.iter().map(|t| t.get_config()).collect())
    }

    fn add_pids(&mut self, pids: &[usize]) -> Result<(), Error> {
        for tracker in self.inner.iter_mut() {
            tracker.add_pids(pids)?;
        }
        Ok(())
    }

    fn remove_pids(&mut self, pids: RemovePids) -> Result<(), Error> {
        for tracker in self.inner.iter_mut() {
            tracker.remove_pids(pids.clone())?;
        }
        Ok(())
    }

    fn start(&mut self) -> Result<(), Error> {
        for tracker in self.inner.iter_mut() {
            tracker.start()?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), Error> {
        for tracker in self.inner.iter_mut() {
            tracker.stop()?;
        }
        Ok(())
    }

    fn reset_counters(&mut self) {
        for tracker in self.inner.iter_mut() {
            tracker.reset_counters();
        }
    }

    fn get_counters(&self) -> Vec<TrackerCounter> {
        let combined: Vec<TrackerCounter> = self.inner.iter().flat_map(|t| t.get_counters()).collect();
        flatten(combined, default_cut, default_union)
    }

    fn dump(&self, args: &str) -> Result<String, Error> {
        let mut out = String::new();
        for (i, tracker) in self.inner.iter().enumerate() {
            out.push_str(&format!("[{}] {}\n", i, tracker.dump(args)?));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::softdirty::{SoftdirtyConfig, SoftdirtyTracker};

    #[test]
    fn fans_out_start_to_all_inner_trackers() {
        let mut multi = MultiTracker::new(vec![
            Box::new(SoftdirtyTracker::new(SoftdirtyConfig::default())),
            Box::new(SoftdirtyTracker::new(SoftdirtyConfig::default())),
        ]);
        assert!(multi.start().is_ok());
        assert!(multi.stop().is_ok());
    }
}
