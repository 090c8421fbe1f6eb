//! Typed wrapper over `/proc/PID/numa_maps`, used only to classify a mapped
//! region as anonymous/heap (the only kind of region eligible for
//! migration, per spec.md §4.1).
//!
//! ```text
//! address           policy        mapping details
//! 00400000          default file=/lib/libc.so mapped=5 N0=5
//! 00e03000          default heap anon=3 dirty=3 N0=3
//! 7f2c74000000      default anon=4 dirty=4 N0=4
//! ```
use std::{collections::HashMap, convert::TryFrom};

use crate::{error::Error, paths};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaMapsEntry {
    pub is_anon: bool,
    pub is_heap: bool,
}

impl NumaMapsEntry {
    pub fn eligible(&self) -> bool {
        self.is_anon || self.is_heap
    }
}

/// Maps each region's starting address to its classification.
#[derive(Debug, Clone, Default)]
pub struct NumaMaps(HashMap<usize, NumaMapsEntry>);

impl NumaMaps {
    pub fn load(pid: usize) -> Result<Self, Error> {
        let path = paths::proc_pid_numa_maps_path(Some(pid));
        let text = std::fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    fn parse(text: &str) -> Self {
        let mut map = HashMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let addr_str = match fields.next() {
                Some(s) => s,
                None => continue,
            };
            let addr = match usize::from_str_radix(addr_str, 16) {
                Ok(a) => a,
                Err(_) => continue,
            };

            let mut is_anon = false;
            let mut is_heap = false;
            for tok in fields {
                if tok == "heap" {
                    is_heap = true;
                } else if tok.starts_with("anon=") || tok == "anon" {
                    is_anon = true;
                } else if tok.starts_with("stack") {
                    is_anon = true;
                }
            }

            map.insert(addr, NumaMapsEntry { is_anon, is_heap });
        }

        NumaMaps(map)
    }

    pub fn get(&self, addr: usize) -> Option<NumaMapsEntry> {
        self.0.get(&addr).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = "00400000 default file=/lib/libc.so mapped=5 N0=5\n\
                            00e03000 default heap anon=3 dirty=3 N0=3\n\
                            7f2c74000000 default anon=4 dirty=4 N0=4\n";

    #[test]
    fn classifies_anon_and_heap() {
        let maps = NumaMaps::parse(EXAMPLE);
        assert!(!maps.get(0x00400000).unwrap().eligible());
        assert!(maps.get(0x00e03000).unwrap().eligible());
        assert!(maps.get(0x7f2c74000000).unwrap().eligible());
    }
}
