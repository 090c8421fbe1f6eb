//! Typed wrappers over `/proc/PID/{maps,numa_maps,pagemap,clear_refs}`,
//! `/proc/kpageflags`, `/sys/kernel/mm/page_idle/bitmap`, and the
//! `move_pages`/`pidfd_open`/`process_madvise` syscalls.
//!
//! Every operation here is non-fatal per-pid: a vanished `/proc` entry or a
//! permission error drops that pid from the caller's batch rather than
//! aborting the whole sampling pass (spec.md §1, §7).
pub mod clearrefs;
pub mod idlebitmap;
pub mod kpageflags;
pub mod madvise;
pub mod maps;
pub mod mmapfile;
pub mod movepages;
pub mod numamaps;
pub mod pagemap;

use crate::{
    addr::range::{AddrRange, AddrRanges},
    error::Error,
};

/// `ProcMaps(pid)`: the anonymous/heap ranges of a process eligible for
/// migration, per spec.md §4.1. Joins `/proc/PID/maps` (for the address
/// ranges themselves) against `/proc/PID/numa_maps` (for the anon/heap
/// classification) and keeps only ranges that are eligible in both.
pub fn proc_maps_eligible(pid: usize) -> Result<AddrRanges, Error> {
    let maps_path = crate::paths::proc_pid_maps_path(Some(pid));
    let maps = maps::Maps::try_from(maps_path.as_path())?;
    let numa = numamaps::NumaMaps::load(pid).unwrap_or_default();

    let mut ranges = Vec::new();
    for (&addr, region) in maps.primary_index() {
        let eligible = numa.get(addr).map(|e| e.eligible()).unwrap_or(false);
        if !eligible {
            continue;
        }

        let len_bytes = region.addr_range().len() as u64;
        let len_pages = (len_bytes / (crate::addr::range::PAGE_SIZE as u64)).max(1);
        ranges.push(AddrRange::new(addr as u64, len_pages));
    }

    Ok(AddrRanges::new(pid, ranges))
}

use std::convert::TryFrom;
