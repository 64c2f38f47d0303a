//! Document metadata flags
//!
//! A small map of boolean registers merged last-write-wins by
//! operation id, so every replica converges on the same value for
//! each key regardless of delivery order.

use std::collections::HashMap;

use crate::ItemId;

/// Key of the flag marking a document as seeded with initial content.
pub const INITIALIZED: &str = "initialized";

struct Register {
    value: bool,
    written_by: ItemId,
}

/// Last-write-wins boolean registers keyed by name.
#[derive(Default)]
pub struct MetaMap {
    registers: HashMap<String, Register>,
}

impl MetaMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a flag write. Returns true if the register changed.
    pub fn apply(&mut self, key: &str, value: bool, written_by: ItemId) -> bool {
        match self.registers.get_mut(key) {
            Some(register) if register.written_by >= written_by => false,
            Some(register) => {
                let changed = register.value != value;
                register.value = value;
                register.written_by = written_by;
                changed
            }
            None => {
                self.registers
                    .insert(key.to_string(), Register { value, written_by });
                true
            }
        }
    }

    /// Current value of a flag, if any write has been applied.
    pub fn get(&self, key: &str) -> Option<bool> {
        self.registers.get(key).map(|register| register.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReplicaId;

    #[test]
    fn test_last_write_wins_by_id() {
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);
        let mut meta = MetaMap::new();

        assert!(meta.apply(INITIALIZED, true, ItemId::new(2, a)));
        assert_eq!(meta.get(INITIALIZED), Some(true));

        // An earlier write loses, regardless of arrival order.
        assert!(!meta.apply(INITIALIZED, false, ItemId::new(1, b)));
        assert_eq!(meta.get(INITIALIZED), Some(true));

        // A later write wins.
        assert!(meta.apply(INITIALIZED, false, ItemId::new(3, b)));
        assert_eq!(meta.get(INITIALIZED), Some(false));
    }

    #[test]
    fn test_concurrent_writes_tie_break_on_replica() {
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let mut left = MetaMap::new();
        left.apply(INITIALIZED, true, ItemId::new(1, a));
        left.apply(INITIALIZED, false, ItemId::new(1, b));

        let mut right = MetaMap::new();
        right.apply(INITIALIZED, false, ItemId::new(1, b));
        right.apply(INITIALIZED, true, ItemId::new(1, a));

        assert_eq!(left.get(INITIALIZED), right.get(INITIALIZED));
        assert_eq!(left.get(INITIALIZED), Some(false));
    }
}
