//! Replica state vectors

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{ItemId, ReplicaId};

/// Delivery watermark per replica: the highest lamport value delivered
/// from each. Valid because every sender ships its operations in
/// generation order, so a replica's lamport values arrive increasing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateVector {
    clocks: HashMap<ReplicaId, u64>,
}

impl StateVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest lamport delivered from `replica` (0 if none).
    pub fn get(&self, replica: ReplicaId) -> u64 {
        self.clocks.get(&replica).copied().unwrap_or(0)
    }

    /// Record delivery of the operation with this id.
    pub fn observe(&mut self, id: ItemId) {
        let clock = self.clocks.entry(id.replica).or_insert(0);
        *clock = (*clock).max(id.lamport);
    }

    /// Whether the operation with this id has already been delivered.
    pub fn has_seen(&self, id: &ItemId) -> bool {
        self.get(id.replica) >= id.lamport
    }

    /// Merge another state vector into this one.
    pub fn merge(&mut self, other: &StateVector) {
        for (&replica, &clock) in &other.clocks {
            let current = self.clocks.entry(replica).or_insert(0);
            *current = (*current).max(clock);
        }
    }

    /// Replicas this vector has seen operations from.
    pub fn replicas(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.clocks.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observe_and_has_seen() {
        let replica = ReplicaId::from_u64(7);
        let mut sv = StateVector::new();

        assert!(!sv.has_seen(&ItemId::new(1, replica)));
        sv.observe(ItemId::new(3, replica));
        assert!(sv.has_seen(&ItemId::new(1, replica)));
        assert!(sv.has_seen(&ItemId::new(3, replica)));
        assert!(!sv.has_seen(&ItemId::new(4, replica)));
    }

    #[test]
    fn test_merge_takes_maximum() {
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let mut left = StateVector::new();
        left.observe(ItemId::new(5, a));

        let mut right = StateVector::new();
        right.observe(ItemId::new(2, a));
        right.observe(ItemId::new(9, b));

        left.merge(&right);
        assert_eq!(left.get(a), 5);
        assert_eq!(left.get(b), 9);
    }
}
