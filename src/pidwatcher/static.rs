//! Static list of pids, configured once at startup and never re-polled.
use crate::{error::Error, pidwatcher::PidWatcher};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct StaticConfig {
    pub pids: Vec<usize>,
}

pub struct StaticWatcher {
    pids: Vec<usize>,
}

impl StaticWatcher {
    pub fn new(config: StaticConfig) -> Self {
        StaticWatcher { pids: config.pids }
    }
}

impl PidWatcher for StaticWatcher {
    fn poll(&mut self) -> Result<Vec<usize>, Error> {
        Ok(self.pids.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_the_configured_list_every_poll() {
        let mut watcher = StaticWatcher::new(StaticConfig { pids: vec![1, 2, 3] });
        assert_eq!(watcher.poll().unwrap(), vec![1, 2, 3]);
        assert_eq!(watcher.poll().unwrap(), vec![1, 2, 3]);
    }
}
