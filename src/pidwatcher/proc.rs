//! Scans `/proc/[0-9]+` for every running pid, optionally restricted to
//! processes whose `/proc/PID/comm` matches a configured name.
use std::{fs, path::Path};

use crate::{error::Error, pidwatcher::PidWatcher};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct ProcConfig {
    /// When set, only pids whose `comm` equals this name are returned.
    pub comm: Option<String>,
}

pub struct ProcWatcher {
    config: ProcConfig,
}

impl ProcWatcher {
    pub fn new(config: ProcConfig) -> Self {
        ProcWatcher { config }
    }

    fn matches(&self, pid: usize) -> bool {
        let Some(wanted) = &self.config.comm else { return true };
        let path = Path::new("/proc").join(pid.to_string()).join("comm");
        fs::read_to_string(path).map(|s| s.trim() == wanted).unwrap_or(false)
    }
}

impl PidWatcher for ProcWatcher {
    fn poll(&mut self) -> Result<Vec<usize>, Error> {
        let entries = fs::read_dir("/proc")?;
        let mut pids = Vec::new();

        for entry in entries {
            let Ok(entry) = entry else { continue };
            let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<usize>().ok()) else { continue };
            if self.matches(pid) {
                pids.push(pid);
            }
        }

        pids.sort_unstable();
        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_this_process() {
        let mut watcher = ProcWatcher::new(ProcConfig::default());
        let pids = watcher.poll().unwrap();
        assert!(pids.contains(&(std::process::id() as usize)));
    }
}
