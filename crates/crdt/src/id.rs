//! CRDT identifiers

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a replica (client).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(u64);

impl ReplicaId {
    /// Generate a fresh random replica id.
    pub fn new() -> Self {
        let uuid = Uuid::new_v4();
        let bytes = uuid.as_bytes();
        let id = u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);
        // Zero is reserved for the root sentinel.
        Self(id.max(1))
    }

    pub fn from_u64(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl Default for ReplicaId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Unique identifier for an item in the CRDT.
///
/// Ordered by `(lamport, replica)`. The lamport component is a Lamport
/// timestamp, so the order is total and consistent with causality:
/// an item always compares greater than every item its author had seen
/// when creating it. Concurrent items tie-break on the replica id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    /// Lamport timestamp at creation.
    pub lamport: u64,
    /// Replica that created this item.
    pub replica: ReplicaId,
}

impl ItemId {
    pub fn new(lamport: u64, replica: ReplicaId) -> Self {
        Self { lamport, replica }
    }

    /// Sentinel id for "before the first character".
    pub fn root() -> Self {
        Self {
            lamport: 0,
            replica: ReplicaId(0),
        }
    }

    pub fn is_root(&self) -> bool {
        self.lamport == 0 && self.replica.0 == 0
    }
}

impl Ord for ItemId {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.lamport.cmp(&other.lamport) {
            Ordering::Equal => self.replica.cmp(&other.replica),
            ord => ord,
        }
    }
}

impl PartialOrd for ItemId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_lamport_then_replica() {
        let a = ItemId::new(3, ReplicaId::from_u64(9));
        let b = ItemId::new(4, ReplicaId::from_u64(1));
        assert!(a < b);

        let c = ItemId::new(4, ReplicaId::from_u64(2));
        assert!(b < c);
    }

    #[test]
    fn test_root_sorts_first() {
        let root = ItemId::root();
        let first = ItemId::new(1, ReplicaId::from_u64(1));
        assert!(root < first);
        assert!(root.is_root());
        assert!(!first.is_root());
    }
}
