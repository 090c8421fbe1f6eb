//! PID-watcher variants (spec.md §1: "simply enumerate PIDs from cgroups,
//! /proc, or a static list"). Thin by design: a watcher's only job is to
//! poll for the current target set so a policy's `tracker.add_pids`/
//! `remove_pids` stays in sync with it.
pub mod cgroup;
pub mod proc;
pub mod r#static;

use crate::error::Error;

/// Minimal capability every watcher implements: produce the current set of
/// target pids. Policies diff this against what they last saw and call
/// `add_pids`/`remove_pids` on their tracker accordingly.
pub trait PidWatcher: Send {
    fn poll(&mut self) -> Result<Vec<usize>, Error>;
}

/// `{name, config}` dispatch (spec.md §9's name→constructor registry).
pub fn new(name: &str, config: serde_json::Value) -> Result<Box<dyn PidWatcher>, Error> {
    match name {
        "static" => {
            let cfg: r#static::StaticConfig =
                serde_json::from_value(config).map_err(|e| Error::config(format!("static pidwatcher config: {}", e)))?;
            Ok(Box::new(r#static::StaticWatcher::new(cfg)))
        }
        "proc" => {
            let cfg: proc::ProcConfig =
                serde_json::from_value(config).map_err(|e| Error::config(format!("proc pidwatcher config: {}", e)))?;
            Ok(Box::new(proc::ProcWatcher::new(cfg)))
        }
        "cgroup" => {
            let cfg: cgroup::CgroupConfig =
                serde_json::from_value(config).map_err(|e| Error::config(format!("cgroup pidwatcher config: {}", e)))?;
            Ok(Box::new(cgroup::CgroupWatcher::new(cfg)))
        }
        other => Err(Error::config(format!("unknown pidwatcher {:?}", other))),
    }
}

/// Computes which pids joined and which left between two polls, in the
/// order a policy wants to call `add_pids`/`remove_pids`: newly seen first.
pub fn diff(previous: &[usize], current: &[usize]) -> (Vec<usize>, Vec<usize>) {
    let added = current.iter().copied().filter(|p| !previous.contains(p)).collect();
    let removed = previous.iter().copied().filter(|p| !current.contains(p)).collect();
    (added, removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_finds_added_and_removed() {
        let (added, removed) = diff(&[1, 2, 3], &[2, 3, 4]);
        assert_eq!(added, vec![4]);
        assert_eq!(removed, vec![1]);
    }

    #[test]
    fn diff_empty_when_unchanged() {
        let (added, removed) = diff(&[1, 2], &[2, 1]);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }
}
