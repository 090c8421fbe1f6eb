//! Typed wrapper over `/sys/kernel/mm/page_idle/bitmap`.
//!
//! ```text
//! One bit per page, indexed by PFN. Writing 1 to a bit marks the
//! corresponding page idle; the kernel clears the bit on the next access.
//! Reading a chunk returns the 64 consecutive bits (pages) starting at
//! pfn - (pfn % 64).
//! ```
use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
};

use crate::{deps::log::debug, error::Error, paths};

const CHUNK_BITS: u64 = 64;

fn chunk_index(pfn: u64) -> u64 {
    pfn / CHUNK_BITS
}

fn bit_in_chunk(pfn: u64) -> u32 {
    (pfn % CHUNK_BITS) as u32
}

/// Readahead cache over recently read 64-bit chunks, keyed by chunk index.
/// The idlepage tracker rescans the same handful of chunks every region
/// refresh, so a small cache avoids repeated seeks for hot chunks.
pub struct ProcPageIdleBitmap {
    file:  File,
    cache: HashMap<u64, u64>,
}

impl ProcPageIdleBitmap {
    pub fn open() -> Result<Self, Error> {
        let path = paths::page_idle_bitmap_path();
        debug!("opening {:?}", path);
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, cache: HashMap::new() })
    }

    fn read_chunk(&mut self, chunk: u64) -> Result<u64, Error> {
        if let Some(bits) = self.cache.get(&chunk) {
            return Ok(*bits);
        }

        self.file.seek(SeekFrom::Start(chunk * 8))?;
        let mut buf = [0u8; 8];
        self.file.read_exact(&mut buf)?;
        let bits = u64::from_ne_bytes(buf);
        self.cache.insert(chunk, bits);
        Ok(bits)
    }

    fn write_chunk(&mut self, chunk: u64, bits: u64) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(chunk * 8))?;
        self.file.write_all(&bits.to_ne_bytes())?;
        self.cache.insert(chunk, bits);
        Ok(())
    }

    /// Returns whether the page at `pfn` is currently marked idle (bit is
    /// still set, meaning no access was observed since it was armed).
    pub fn get_idle(&mut self, pfn: u64) -> Result<bool, Error> {
        let bits = self.read_chunk(chunk_index(pfn))?;
        Ok(bits & (1u64 << bit_in_chunk(pfn)) != 0)
    }

    /// Marks a single page idle, read-modify-write on its chunk.
    pub fn set_idle(&mut self, pfn: u64) -> Result<(), Error> {
        let chunk = chunk_index(pfn);
        let bits = self.read_chunk(chunk)? | (1u64 << bit_in_chunk(pfn));
        self.write_chunk(chunk, bits)
    }

    /// Sets all 64 pages sharing `pfn`'s chunk idle in one write, per
    /// spec.md §4.1 ("batching 64-page chunks via one write per chunk").
    pub fn set_idle_all(&mut self, pfn: u64) -> Result<(), Error> {
        self.write_chunk(chunk_index(pfn), u64::MAX)
    }

    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_math() {
        assert_eq!(chunk_index(0), 0);
        assert_eq!(chunk_index(63), 0);
        assert_eq!(chunk_index(64), 1);
        assert_eq!(bit_in_chunk(64), 0);
        assert_eq!(bit_in_chunk(65), 1);
    }
}
