//! Heat-based and age-based placement policies (spec.md §4.6): each owns
//! its tracker, heatmap (heat policy only), mover, and pid-watcher, and
//! turns observations into [`crate::mover::MoverTask`]s.
pub mod age;
pub mod forecast;
pub mod heat;

use crate::{addr::range::AddrRange, node::Node};

/// Policy-believed location of one range (spec.md §3: `pageInfo`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PageInfo {
    pub node: Node,
}

impl Default for PageInfo {
    fn default() -> Self {
        PageInfo { node: Node::UNDEFINED }
    }
}

/// Shared config every policy parses (spec.md §4.6.1).
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct PolicyConfig {
    pub pidwatcher:  NamedConfig,
    pub tracker:     NamedConfig,
    pub mover:       crate::mover::MoverConfig,
    pub interval_ms: u64,
}

#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct NamedConfig {
    pub name:   String,
    pub config: serde_json::Value,
}

/// A contiguous, present-exclusive sub-range of `hr` actually resident in
/// memory right now, used when materializing pages to migrate.
pub fn materialize_range(hr_addr: u64, hr_length: u64) -> AddrRange {
    AddrRange::new(hr_addr, hr_length)
}
