//! Reads the pid list from a cgroup's `cgroup.procs` file.
use std::{fs, path::PathBuf};

use crate::{error::Error, pidwatcher::PidWatcher};

#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct CgroupConfig {
    /// Path to the cgroup directory, e.g. `/sys/fs/cgroup/mytier`.
    pub path: PathBuf,
}

pub struct CgroupWatcher {
    config: CgroupConfig,
}

impl CgroupWatcher {
    pub fn new(config: CgroupConfig) -> Self {
        CgroupWatcher { config }
    }
}

impl PidWatcher for CgroupWatcher {
    fn poll(&mut self) -> Result<Vec<usize>, Error> {
        let path = self.config.path.join("cgroup.procs");
        let contents = fs::read_to_string(&path)?;

        let pids = contents
            .lines()
            .filter_map(|line| line.trim().parse::<usize>().ok())
            .collect();

        Ok(pids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parses_one_pid_per_line() {
        let dir = std::env::temp_dir().join(format!("tierd-cgroup-test-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let mut file = fs::File::create(dir.join("cgroup.procs")).unwrap();
        writeln!(file, "10\n20\n30").unwrap();

        let mut watcher = CgroupWatcher::new(CgroupConfig { path: dir.clone() });
        assert_eq!(watcher.poll().unwrap(), vec![10, 20, 30]);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_cgroup_is_an_error() {
        let mut watcher = CgroupWatcher::new(CgroupConfig { path: PathBuf::from("/nonexistent-cgroup-path") });
        assert!(watcher.poll().is_err());
    }
}
