//! NUMA node identifiers, including the sentinel values used by the mover
//! and policies to mean "swap it out" or "location not yet known".
use std::fmt;

use crate::deps::serde;

/// A NUMA node id, or one of two sentinels.
///
/// `Node::SWAP` is a destination meaning "page out via `process_madvise`"
/// rather than "migrate via `move_pages`"; `Node::UNDEFINED` means a
/// policy has not yet queried where a range currently lives.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[repr(transparent)]
pub struct Node(i32);

impl Node {
    pub const SWAP: Node = Node(-1);
    pub const UNDEFINED: Node = Node(-2);

    pub const fn new(id: u32) -> Self {
        Node(id as i32)
    }

    /// Constructs from a raw `move_pages` status value, which may itself be
    /// a negative errno for a failed page.
    pub const fn from_raw(raw: i32) -> Self {
        Node(raw)
    }

    pub const fn raw(&self) -> i32 {
        self.0
    }

    pub const fn is_real(&self) -> bool {
        self.0 >= 0
    }

    pub const fn is_swap(&self) -> bool {
        self.0 == Self::SWAP.0
    }

    pub const fn is_undefined(&self) -> bool {
        self.0 == Self::UNDEFINED.0
    }

    /// The real NUMA node id, if this is not a sentinel.
    pub const fn as_numa_id(&self) -> Option<u32> {
        if self.is_real() {
            Some(self.0 as u32)
        } else {
            None
        }
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_swap() {
            write!(f, "Node::SWAP")
        } else if self.is_undefined() {
            write!(f, "Node::UNDEFINED")
        } else {
            write!(f, "Node({})", self.0)
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_swap() {
            write!(f, "swap")
        } else if self.is_undefined() {
            write!(f, "undefined")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u32> for Node {
    fn from(id: u32) -> Self {
        Node::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentinels_are_negative() {
        assert!(Node::SWAP.raw() < 0);
        assert!(Node::UNDEFINED.raw() < 0);
        assert_ne!(Node::SWAP, Node::UNDEFINED);
    }

    #[test]
    fn real_node_roundtrip() {
        let n = Node::new(3);
        assert!(n.is_real());
        assert_eq!(n.as_numa_id(), Some(3));
    }
}
