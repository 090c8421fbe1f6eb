//! Writing to `/proc/PID/clear_refs`.
use std::io::Write;

use crate::{deps::log::debug, error::Error, paths};

/// Resets the soft-dirty PTE bit for every page of `pid`. Idempotent;
/// per spec.md §4.4.1 a failure here is non-fatal and the caller drops the
/// pid rather than treating it as fatal.
pub fn clear_soft_dirty(pid: usize) -> Result<(), Error> {
    const CLEAR_SOFT_DIRTY_CMD: &str = "4\n";

    let path = paths::proc_pid_clear_refs(Some(pid));
    debug!("clearing soft-dirty bits for pid={} via {:?}", pid, path);

    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(CLEAR_SOFT_DIRTY_CMD.as_bytes())?;
    Ok(())
}
