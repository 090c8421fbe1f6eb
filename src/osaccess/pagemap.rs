//! ```text
//! pagemap, from the userspace perspective
//! ---------------------------------------
//!
//! pagemap is a new (as of 2.6.25) set of interfaces in the kernel that allow
//! userspace programs to examine the page tables and related information by
//! reading files in /proc.
//!
//! There are four components to pagemap:
//!
//!  * /proc/pid/pagemap.  This file lets a userspace process find out which
//!    physical frame each virtual page is mapped to.  It contains one 64-bit
//!    value for each virtual page, containing the following data (from
//!    fs/proc/task_mmu.c, above pagemap_read):
//!
//!     * Bits 0-54  page frame number (PFN) if present
//!     * Bits 0-4   swap type if swapped
//!     * Bits 5-54  swap offset if swapped
//!     * Bit  55    pte is soft-dirty (see Documentation/vm/soft-dirty.txt)
//!     * Bit  56    page exclusively mapped (since 4.2)
//!     * Bits 57-60 zero
//!     * Bit  61    page is file-page or shared-anon (since 3.5)
//!     * Bit  62    page swapped
//!     * Bit  63    page present
//!
//!    Since Linux 4.0 only users with the CAP_SYS_ADMIN capability can get PFNs.
//!    In 4.0 and 4.1 opens by unprivileged fail with -EPERM.  Starting from
//!    4.2 the PFN field is zeroed if the user does not have CAP_SYS_ADMIN.
//!    Reason: information about PFNs helps in exploiting Rowhammer vulnerability.
//!
//!    If the page is not present but in swap, then the PFN contains an
//!    encoding of the swap file number and the page's offset into the
//!    swap. Unmapped pages return a null PFN. This allows determining
//!    precisely which pages are mapped (or in swap) and comparing mapped
//!    pages between processes.
//!
//!    Efficient users of this interface will use /proc/pid/maps to
//!    determine which areas of memory are actually mapped and llseek to
//!    skip over unmapped regions.
//!
//! Using pagemap to do something useful:
//!
//! The general procedure for using pagemap to find out about a process' memory
//! usage goes like this:
//!
//!  1. Read /proc/pid/maps to determine which parts of the memory space are
//!     mapped to what.
//!  2. Select the maps you are interested in -- all of them, or a particular
//!     library, or the stack or the heap, etc.
//!  3. Open /proc/pid/pagemap and seek to the pages you would like to examine.
//!  4. Read a u64 for each page from pagemap.
//!  5. Open /proc/kpagecount and/or /proc/kpageflags.  For each PFN you just
//!     read, seek to that entry in the file, and read the data you want.
//!
//! For example, to find the "unique set size" (USS), which is the amount of
//! memory that a process is using that is not shared with any other process,
//! you can go through every map in the process, find the PFNs, look those up
//! in kpagecount, and tally up the number of pages that are only referenced
//! once.
//!
//! Other notes:
//!
//! Reading from any of the files will return -EINVAL if you are not starting
//! the read on an 8-byte boundary (e.g., if you sought an odd number of bytes
//! into the file), or if the size of the read is not a multiple of 8 bytes.
//!
//! Before Linux 3.11 pagemap bits 55-60 were used for "page-shift" (which is
//! always 12 at most architectures). Since Linux 3.11 their meaning changes
//! after first clear of soft-dirty bits. Since Linux 4.2 they are used for
//! flags unconditionally.
//! ```

use std::{
    convert::TryFrom,
    fmt,
    fs::File,
    io::{
        BufRead,
        BufReader,
        Read,
        Seek,
        SeekFrom,
        Write,
    },
    mem,
    num::NonZeroU64,
    path::PathBuf,
};

use crate::{
    deps::log::{
        debug,
        info,
        warn,
    },
    error::Error,
    osaccess::kpageflags::KPageFlags,
    osaccess::maps::{
        column::{
            AddressRange,
            PathName,
            PermSet,
        },
        MappedRegion,
        Maps,
    },
};
use std::str::FromStr;


#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(usize)]
pub enum PageSize {
    Normal = 4 << 10,
    Huge = 2 << 20,
    Giga = 1 << 30,
}


impl FromStr for PageSize {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "normal" => Ok(PageSize::Normal),
            "huge" => Ok(PageSize::Huge),
            "giga" => Ok(PageSize::Giga),
            bad_value => {
                Err(Error::Parse {
                    value:    value.to_string(),
                    typename: std::any::type_name::<PageSize>(),
                    reason:   "value was not one of: normal, huge, giga".to_string(),
                })
            }
        }
    }
}


impl std::default::Default for PageSize {
    fn default() -> Self {
        Self::Normal
    }
}


#[derive(
    Copy,
    Clone,
    PartialOrd,
    PartialEq,
    Eq,
    Ord,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
    derive_more::Binary,
    derive_more::LowerHex,
    derive_more::UpperHex,
    serde::Serialize,
    serde::Deserialize,
)]
#[repr(transparent)]
pub struct PageTableEntry(u64);


impl PageTableEntry {
    const PFN_BITS: u32 = 55;
    const PRESENT_BIT: u32 = 63;
    const SWAP_BIT: u32 = 62;
    const FILE_BIT: u32 = 61;
    const UFFD_WP_BIT: u32 = 57;
    const EXCLUSIVE_BIT: u32 = 56;
    const SOFT_DIRTY_BIT: u32 = 55;

    pub const fn new(n: u64) -> Self {
        Self(n)
    }

    /// Note:
    /// ```text
    ///    Since Linux 4.0 only users with the CAP_SYS_ADMIN capability can get PFNs.
    ///    In 4.0 and 4.1 opens by unprivileged fail with -EPERM.  Starting from
    ///    4.2 the PFN field is zeroed if the user does not have CAP_SYS_ADMIN.
    ///    Reason: information about PFNs helps in exploiting Rowhammer vulnerability.
    /// ```
    pub fn page_frame_number(&self) -> Option<std::num::NonZeroU64> {
        const MASK: u64 = u64::max_value().wrapping_shr(u64::max_value().count_ones() - PageTableEntry::PFN_BITS);
        std::num::NonZeroU64::new(self.0 & MASK)
    }

    pub const fn is_soft_dirty(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::SOFT_DIRTY_BIT;
        self.0 & MASK != 0
    }

    pub const fn is_present(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::PRESENT_BIT;
        self.0 & MASK != 0
    }

    pub const fn is_swapped(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::SWAP_BIT;
        self.0 & MASK != 0
    }

    pub const fn is_file(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::FILE_BIT;
        self.0 & MASK != 0
    }

    pub const fn is_uffd_wp(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::UFFD_WP_BIT;
        self.0 & MASK != 0
    }

    pub const fn is_exclusive(&self) -> bool {
        const MASK: u64 = 1 << PageTableEntry::EXCLUSIVE_BIT;
        self.0 & MASK != 0
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl<'a> TryFrom<&'a mut dyn Read> for PageTableEntry {
    type Error = Error;

    fn try_from(rdr: &'a mut dyn Read) -> Result<Self, Self::Error> {
        crate::io::read_u64(rdr).map(PageTableEntry::new)
    }
}

impl fmt::Debug for PageTableEntry {
    fn fmt(
        &self,
        f: &mut fmt::Formatter,
    ) -> fmt::Result {
        f.debug_struct("PageTableEntry")
            .field("value", &crate::fmt::Binary(&self.0))
            .field("page_frame_number", &self.page_frame_number())
            .field("soft_dirty", &self.is_soft_dirty())
            .field("present", &self.is_present())
            .finish()
    }
}

/// Batch size, in pages, for [`ProcPagemap::for_each_page`]'s buffered
/// reads. Larger batches cut syscall count at the cost of over-reading
/// past sparse/unmapped stretches.
#[derive(Copy, Clone, Debug)]
pub struct Readahead {
    pub pages: usize,
}

impl Default for Readahead {
    fn default() -> Self {
        Readahead { pages: 512 }
    }
}

const PAGEMAP_ENTRY_SIZE: u64 = mem::size_of::<u64>() as u64;

/// Streaming reader over `/proc/PID/pagemap`, built for the daemon's
/// tracker sampling loops rather than the CLI's one-shot `VMARegion::try_iter`.
pub struct ProcPagemap {
    pid:       usize,
    readahead: Readahead,
}

impl ProcPagemap {
    pub fn open(pid: usize, readahead: Readahead) -> Self {
        Self { pid, readahead }
    }

    /// Streams every page table entry covering `ranges`, in range order,
    /// invoking `handler(addr, pte)` for each. `handler` returning `-1`
    /// aborts the scan early; any other value continues.
    ///
    /// Falls back to unbuffered per-page reads if the batched readahead
    /// read itself errors (e.g. short read crossing an unmapped hole),
    /// per spec.md §4.1 ("Readahead errors fall back to unbuffered reads").
    pub fn for_each_page<F>(
        &self,
        ranges: &crate::addr::range::AddrRanges,
        mut handler: F,
    ) -> Result<(), Error>
    where
        F: FnMut(u64, PageTableEntry) -> i32,
    {
        let path = crate::paths::proc_pid_pagemaps_path(Some(self.pid));

        for range in ranges.iter() {
            let start_page = range.addr() / (crate::addr::range::PAGE_SIZE as u64);
            let start_offset = start_page * PAGEMAP_ENTRY_SIZE;
            let byte_len = (range.length() as u64) * PAGEMAP_ENTRY_SIZE;

            let batch_result = self.read_batched(&path, start_offset, byte_len, &mut handler);
            let aborted = match batch_result {
                Ok(aborted) => aborted,
                Err(_) => self.read_unbuffered(&path, start_page as usize, range.length() as usize, &mut handler)?,
            };

            if aborted {
                return Ok(());
            }
        }

        Ok(())
    }

    fn read_batched<F>(
        &self,
        path: &std::path::Path,
        start_offset: u64,
        byte_len: u64,
        handler: &mut F,
    ) -> Result<bool, Error>
    where
        F: FnMut(u64, PageTableEntry) -> i32,
    {
        let mut reader = crate::io::new_buffered_file_reader(
            path,
            std::num::NonZeroU64::new(start_offset),
        )?;
        let capacity = self.readahead.pages.max(1) * PAGEMAP_ENTRY_SIZE as usize;
        let mut buf = vec![0u8; capacity.min(byte_len as usize).max(PAGEMAP_ENTRY_SIZE as usize)];

        let mut remaining = byte_len;
        let mut page_index = start_offset / PAGEMAP_ENTRY_SIZE;

        while remaining > 0 {
            let this_read = (buf.len() as u64).min(remaining) as usize;
            reader.read_exact(&mut buf[..this_read])?;

            for chunk in buf[..this_read].chunks_exact(PAGEMAP_ENTRY_SIZE as usize) {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(chunk);
                let pte = PageTableEntry::new(u64::from_ne_bytes(arr));
                let addr = page_index * (crate::addr::range::PAGE_SIZE as u64);

                if handler(addr, pte) == -1 {
                    return Ok(true);
                }
                page_index += 1;
            }

            remaining -= this_read as u64;
        }

        Ok(false)
    }

    fn read_unbuffered<F>(
        &self,
        path: &std::path::Path,
        start_page: usize,
        length_pages: usize,
        handler: &mut F,
    ) -> Result<bool, Error>
    where
        F: FnMut(u64, PageTableEntry) -> i32,
    {
        warn!("falling back to unbuffered pagemap reads for pid={}", self.pid);
        let mut file = crate::io::open_raw_file(path, None)?;

        for i in 0..length_pages {
            let page_index = start_page as u64 + i as u64;
            file.seek(SeekFrom::Start(page_index * PAGEMAP_ENTRY_SIZE))?;
            let rdr: &mut dyn Read = &mut file;
            let pte = PageTableEntry::try_from(rdr)?;
            let addr = page_index * (crate::addr::range::PAGE_SIZE as u64);

            if handler(addr, pte) == -1 {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

