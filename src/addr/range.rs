//! `AddrRange`/`AddrRanges`: the virtual-range value types and the
//! operations spec.md §4.2 defines over them (`split_length`, `filter`,
//! `intersection`, `pages_matching`, `swap_out`, `flatten`, `page_count`),
//! plus the `S` / `S-E` / `S+SIZE[kMGTi][B]` range-syntax parser.
use std::{convert::TryFrom, fmt, str::FromStr};

use crate::{deps::serde, error::Error, osaccess};

pub const PAGE_SIZE: usize = 4096;

/// A contiguous virtual range `[addr, addr + length*PAGE)`.
///
/// Invariants (spec.md §3): `length >= 1`; `addr + length*PAGE` does not
/// overflow `u64`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct AddrRange {
    addr:   u64,
    length: u64,
}

impl AddrRange {
    pub fn new(addr: u64, length: u64) -> Self {
        Self::try_new(addr, length).unwrap_or_else(|err| panic!("invalid AddrRange: {}", err))
    }

    pub fn try_new(addr: u64, length: u64) -> Result<Self, Error> {
        if length == 0 {
            return Err(Error::Parse {
                value:    format!("addr={:#x} length={}", addr, length),
                typename: std::any::type_name::<AddrRange>(),
                reason:   "length must be at least 1 page".to_string(),
            });
        }

        let bytes = length.checked_mul(PAGE_SIZE as u64).ok_or_else(|| Error::Parse {
            value:    format!("addr={:#x} length={}", addr, length),
            typename: std::any::type_name::<AddrRange>(),
            reason:   "length*PAGE overflowed".to_string(),
        })?;

        addr.checked_add(bytes).ok_or_else(|| Error::Parse {
            value:    format!("addr={:#x} length={}", addr, length),
            typename: std::any::type_name::<AddrRange>(),
            reason:   "addr+length*PAGE overflowed".to_string(),
        })?;

        Ok(Self { addr, length })
    }

    /// A single-page range starting at `addr`.
    pub fn one_page(addr: u64) -> Self {
        Self { addr, length: 1 }
    }

    pub const fn addr(&self) -> u64 {
        self.addr
    }

    /// Length in pages.
    pub const fn length(&self) -> u64 {
        self.length
    }

    pub fn end(&self) -> u64 {
        self.addr + self.length * PAGE_SIZE as u64
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.end()
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        self.addr < other.end() && other.addr < self.end()
    }

    /// Element-wise intersection of two ranges, or `None` if disjoint.
    /// Commutative and idempotent (spec.md §8).
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.addr.max(other.addr);
        let end = self.end().min(other.end());
        if start >= end {
            return None;
        }
        let length = (end - start) / PAGE_SIZE as u64;
        if length == 0 {
            None
        } else {
            Some(Self { addr: start, length })
        }
    }

    /// Cuts this range into pieces of at most `max_pages` pages each, in
    /// address order.
    pub fn split_length(&self, max_pages: u64) -> Vec<Self> {
        if max_pages == 0 {
            return vec![*self];
        }

        let mut out = Vec::with_capacity(((self.length + max_pages - 1) / max_pages) as usize);
        let mut remaining = self.length;
        let mut cursor = self.addr;

        while remaining > 0 {
            let take = remaining.min(max_pages);
            out.push(AddrRange { addr: cursor, length: take });
            cursor += take * PAGE_SIZE as u64;
            remaining -= take;
        }

        out
    }
}

impl fmt::Debug for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AddrRange")
            .field("addr", &crate::fmt::Hex(&self.addr))
            .field("end", &crate::fmt::Hex(&self.end()))
            .field("length", &self.length)
            .finish()
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}-{:x}", self.addr, self.end())
    }
}

fn parse_size_suffix(value: &str) -> Result<u64, Error> {
    let trimmed = value.trim();
    let mut end = trimmed.len();
    let bytes = trimmed.as_bytes();

    // Strip an optional trailing 'B'
    if end > 0 && (bytes[end - 1] == b'B') {
        end -= 1;
    }
    // Strip an optional trailing 'i' (binary marker, no semantic change: units are already base-1024)
    if end > 0 && (bytes[end - 1] == b'i') {
        end -= 1;
    }

    let (digits, multiplier) = if end > 0 && bytes[end - 1].is_ascii_alphabetic() {
        let unit = bytes[end - 1].to_ascii_lowercase();
        let mult = match unit {
            b'k' => 1024u64,
            b'm' => 1024 * 1024,
            b'g' => 1024 * 1024 * 1024,
            b't' => 1024 * 1024 * 1024 * 1024,
            _ => {
                return Err(Error::Parse {
                    value:    value.to_string(),
                    typename: std::any::type_name::<AddrRange>(),
                    reason:   format!("unknown size suffix {:?}", unit as char),
                });
            }
        };
        (&trimmed[..end - 1], mult)
    } else {
        (&trimmed[..end], 1u64)
    };

    let n: u64 = digits.parse().map_err(|_| Error::Parse {
        value:    value.to_string(),
        typename: std::any::type_name::<AddrRange>(),
        reason:   "size was not a decimal number".to_string(),
    })?;

    n.checked_mul(multiplier).ok_or_else(|| Error::Parse {
        value:    value.to_string(),
        typename: std::any::type_name::<AddrRange>(),
        reason:   "size overflowed".to_string(),
    })
}

impl FromStr for AddrRange {
    type Err = Error;

    /// Parses `S`, `S-E` (hex addresses), or `S+SIZE[kMGTi][B]` (hex `S`,
    /// decimal `SIZE`). A bare `S` is a one-page range at `S`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();

        if let Some((s, size)) = trimmed.split_once('+') {
            let addr = u64::from_str_radix(s.trim(), 16).map_err(|_| Error::Parse {
                value:    value.to_string(),
                typename: std::any::type_name::<AddrRange>(),
                reason:   "start address was not valid hex".to_string(),
            })?;
            let bytes = parse_size_suffix(size)?;
            let length = (bytes + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
            return AddrRange::try_new(addr, length.max(1));
        }

        if let Some((s, e)) = trimmed.split_once('-') {
            let start = u64::from_str_radix(s.trim(), 16).map_err(|_| Error::Parse {
                value:    value.to_string(),
                typename: std::any::type_name::<AddrRange>(),
                reason:   "start address was not valid hex".to_string(),
            })?;
            let end = u64::from_str_radix(e.trim(), 16).map_err(|_| Error::Parse {
                value:    value.to_string(),
                typename: std::any::type_name::<AddrRange>(),
                reason:   "end address was not valid hex".to_string(),
            })?;

            if end <= start {
                return Err(Error::Parse {
                    value:    value.to_string(),
                    typename: std::any::type_name::<AddrRange>(),
                    reason:   "end address must be greater than start address".to_string(),
                });
            }

            let length = (end - start + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
            return AddrRange::try_new(start, length);
        }

        let addr = u64::from_str_radix(trimmed, 16).map_err(|_| Error::Parse {
            value:    value.to_string(),
            typename: std::any::type_name::<AddrRange>(),
            reason:   "address was not valid hex".to_string(),
        })?;

        Ok(AddrRange::one_page(addr))
    }
}

/// Ordered, possibly-overlapping ranges for one pid. Entries preserve
/// insertion order (spec.md §3) -- this is *not* the non-overlapping
/// `AddrDatas` interval map.
#[derive(Clone, Debug, Default)]
pub struct AddrRanges {
    pid:    usize,
    ranges: Vec<AddrRange>,
}

impl AddrRanges {
    pub fn new(pid: usize, ranges: Vec<AddrRange>) -> Self {
        Self { pid, ranges }
    }

    pub fn empty(pid: usize) -> Self {
        Self { pid, ranges: Vec::new() }
    }

    pub fn pid(&self) -> usize {
        self.pid
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AddrRange> {
        self.ranges.iter()
    }

    pub fn push(&mut self, range: AddrRange) {
        self.ranges.push(range);
    }

    pub fn as_slice(&self) -> &[AddrRange] {
        &self.ranges
    }

    pub fn split_length(&self, max_pages: u64) -> Self {
        let ranges = self.ranges.iter().flat_map(|r| r.split_length(max_pages)).collect();
        Self { pid: self.pid, ranges }
    }

    pub fn filter<P>(&self, mut predicate: P) -> Self
    where
        P: FnMut(&AddrRange) -> bool,
    {
        let ranges = self.ranges.iter().copied().filter(|r| predicate(r)).collect();
        Self { pid: self.pid, ranges }
    }

    /// Element-wise intersection against another (possibly differently
    /// ordered) set of ranges, preserving `self`'s order. Commutative up to
    /// ordering and idempotent on its algebra of ranges (spec.md §8).
    pub fn intersection(&self, others: &Self) -> Self {
        let mut out = Vec::new();
        for mine in &self.ranges {
            for theirs in &others.ranges {
                if let Some(overlap) = mine.intersect(theirs) {
                    out.push(overlap);
                }
            }
        }
        Self { pid: self.pid, ranges: out }
    }

    /// One single-range view per entry.
    pub fn flatten(&self) -> impl Iterator<Item = AddrRanges> + '_ {
        self.ranges.iter().map(move |r| AddrRanges { pid: self.pid, ranges: vec![*r] })
    }

    pub fn page_count(&self) -> u64 {
        self.ranges.iter().map(AddrRange::length).sum()
    }

    /// Scans `/proc/PID/pagemap` over these ranges, returning the
    /// addresses of pages whose bits satisfy `attrs`. `InHeap`/`InAnonymous`
    /// aren't per-page PTE bits, so they're resolved once against the
    /// region each page falls in (`/proc/PID/maps` joined with
    /// `/proc/PID/numa_maps`) rather than on every page.
    pub fn pages_matching(&self, attrs: PageAttrs) -> Result<Vec<u64>, Error> {
        let reader = osaccess::pagemap::ProcPagemap::open(self.pid, osaccess::pagemap::Readahead::default());
        let mut matches = Vec::new();

        let needs_region_kind = attrs.in_heap.is_some() || attrs.in_anonymous.is_some();
        let maps = if needs_region_kind {
            let path = crate::paths::proc_pid_maps_path(Some(self.pid));
            osaccess::maps::Maps::try_from(path.as_path()).ok()
        } else {
            None
        };
        let numa = if needs_region_kind {
            osaccess::numamaps::NumaMaps::load(self.pid).unwrap_or_default()
        } else {
            osaccess::numamaps::NumaMaps::default()
        };

        reader.for_each_page(self, |addr, pte| {
            if !attrs.matches(&pte) {
                return 0;
            }

            if needs_region_kind {
                let region_start = maps
                    .as_ref()
                    .and_then(|m| m.primary_index().range(..=(addr as usize)).next_back())
                    .map(|(&start, _)| start);
                let entry = region_start.and_then(|start| numa.get(start)).unwrap_or(osaccess::numamaps::NumaMapsEntry {
                    is_anon: false,
                    is_heap: false,
                });

                if let Some(want) = attrs.in_heap {
                    if entry.is_heap != want {
                        return 0;
                    }
                }
                if let Some(want) = attrs.in_anonymous {
                    if entry.is_anon != want {
                        return 0;
                    }
                }
            }

            matches.push(addr);
            0
        })?;

        Ok(matches)
    }

    /// `process_madvise(MADV_PAGEOUT)` over every range.
    pub fn swap_out(&self) -> Result<usize, Error> {
        let pidfd = osaccess::madvise::Pidfd::open(self.pid as i32)?;
        osaccess::madvise::process_madvise(&pidfd, self, osaccess::madvise::MADV_PAGEOUT)
    }
}

/// Composite page-attribute predicate, from the comma-list grammar in
/// spec.md §6: `{Present, Exclusive, Dirty, NotDirty, InHeap, InAnonymous}`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PageAttrs {
    pub present:      Option<bool>,
    pub exclusive:    Option<bool>,
    pub dirty:        Option<bool>,
    pub in_heap:      Option<bool>,
    pub in_anonymous: Option<bool>,
}

impl PageAttrs {
    pub fn matches(&self, pte: &osaccess::pagemap::PageTableEntry) -> bool {
        if let Some(want) = self.present {
            if pte.is_present() != want {
                return false;
            }
        }
        if let Some(want) = self.exclusive {
            if pte.is_exclusive() != want {
                return false;
            }
        }
        if let Some(want) = self.dirty {
            if pte.is_soft_dirty() != want {
                return false;
            }
        }
        true
    }
}

impl FromStr for PageAttrs {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut attrs = PageAttrs::default();

        for token in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match token {
                "Present" => attrs.present = Some(true),
                "Exclusive" => attrs.exclusive = Some(true),
                "Dirty" => attrs.dirty = Some(true),
                "NotDirty" => attrs.dirty = Some(false),
                "InHeap" => attrs.in_heap = Some(true),
                "InAnonymous" => attrs.in_anonymous = Some(true),
                other => {
                    return Err(Error::Parse {
                        value:    value.to_string(),
                        typename: std::any::type_name::<PageAttrs>(),
                        reason:   format!("unknown page attribute {:?}", other),
                    });
                }
            }
        }

        if value.contains("Dirty") && value.contains("NotDirty") {
            return Err(Error::Parse {
                value:    value.to_string(),
                typename: std::any::type_name::<PageAttrs>(),
                reason:   "Dirty and NotDirty are contradictory".to_string(),
            });
        }

        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_address() {
        let r = AddrRange::from_str("1000").unwrap();
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(r.length(), 1);
    }

    #[test]
    fn parses_start_end() {
        let r = AddrRange::from_str("1000-3000").unwrap();
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(r.length(), 2);
    }

    #[test]
    fn parses_start_plus_size() {
        let r = AddrRange::from_str("1000+8k").unwrap();
        assert_eq!(r.addr(), 0x1000);
        assert_eq!(r.length(), 2);
    }

    #[test]
    fn round_trip_display_parse() {
        let r = AddrRange::new(0x2000, 3);
        let s = r.to_string();
        let r2 = AddrRange::from_str(&s).unwrap();
        assert_eq!(r, r2);
    }

    #[test]
    fn intersection_is_commutative_and_idempotent() {
        let a = AddrRange::new(0x1000, 4);
        let b = AddrRange::new(0x2000, 4);
        let ab = a.intersect(&b);
        let ba = b.intersect(&a);
        assert_eq!(ab, ba);
        let ab2 = ab.unwrap().intersect(&ab.unwrap());
        assert_eq!(ab2, ab);
    }

    #[test]
    fn split_length_covers_whole_range() {
        let r = AddrRange::new(0x1000, 10);
        let pieces = r.split_length(3);
        assert_eq!(pieces.len(), 4);
        assert_eq!(pieces.iter().map(AddrRange::length).sum::<u64>(), 10);
    }

    #[test]
    fn contradictory_attrs_reject() {
        assert!(PageAttrs::from_str("Dirty,NotDirty").is_err());
    }

    #[test]
    fn page_attrs_parse() {
        let attrs = PageAttrs::from_str("Present,Exclusive").unwrap();
        assert_eq!(attrs.present, Some(true));
        assert_eq!(attrs.exclusive, Some(true));
        assert_eq!(attrs.dirty, None);
    }
}
