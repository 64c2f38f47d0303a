//! Replicated text sequence
//!
//! An RGA (replicated growable array) over per-character items with
//! tombstones. Every item carries the id of the item it was inserted
//! after; integration places a remote item after its origin, skipping
//! any existing successors with a greater id. Ids are Lamport-ordered,
//! so every replica resolves concurrent same-position inserts to the
//! same final order.

use std::collections::HashMap;

use crate::{ItemId, Operation, OperationKind, ReplicaId};

/// Outcome of integrating one remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrated {
    /// The operation mutated the sequence.
    Applied,
    /// The operation had already been applied; no effect.
    AlreadyApplied,
    /// The operation references an item not yet present and must be
    /// retried after more operations arrive.
    MissingDependency,
}

struct Item {
    id: ItemId,
    ch: char,
    origin: ItemId,
    deleted: bool,
}

/// The text register of a replicated document.
pub struct TextCrdt {
    replica: ReplicaId,
    /// Lamport clock; advanced past every observed id.
    clock: u64,
    /// All items in document order, tombstones included.
    items: Vec<Item>,
    /// Item id to position in `items`.
    index: HashMap<ItemId, usize>,
}

impl TextCrdt {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            clock: 0,
            items: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Mint the next operation id.
    pub fn tick(&mut self) -> ItemId {
        self.clock += 1;
        ItemId::new(self.clock, self.replica)
    }

    /// Advance the Lamport clock past an observed remote id.
    pub fn observe_clock(&mut self, id: ItemId) {
        self.clock = self.clock.max(id.lamport);
    }

    /// Insert `text` at the visible character `position` (clamped to
    /// the end). Returns the generated operations in order.
    pub fn insert(&mut self, position: usize, text: &str) -> Vec<Operation> {
        let position = position.min(self.visible_len());
        let mut origin = self.id_before(position);
        let mut ops = Vec::with_capacity(text.chars().count());

        for ch in text.chars() {
            let id = self.tick();
            let op = Operation::insert(id, ch, origin);
            let outcome = self.integrate_insert(id, ch, origin);
            debug_assert_eq!(outcome, Integrated::Applied);
            ops.push(op);
            origin = id;
        }

        ops
    }

    /// Tombstone `len` visible characters starting at `position`.
    /// Returns the generated operations in order.
    pub fn delete(&mut self, position: usize, len: usize) -> Vec<Operation> {
        let targets: Vec<ItemId> = self
            .items
            .iter()
            .filter(|item| !item.deleted)
            .skip(position)
            .take(len)
            .map(|item| item.id)
            .collect();

        let mut ops = Vec::with_capacity(targets.len());
        for target in targets {
            let id = self.tick();
            if let Some(&at) = self.index.get(&target) {
                self.items[at].deleted = true;
            }
            ops.push(Operation::delete(id, target));
        }

        ops
    }

    /// Integrate one remote operation.
    pub fn integrate(&mut self, op: &Operation) -> Integrated {
        let outcome = match op.kind {
            OperationKind::Insert { ch, origin } => self.integrate_insert(op.id, ch, origin),
            OperationKind::Delete { target } => self.integrate_delete(target),
            // Metadata is not part of the text register.
            OperationKind::SetFlag { .. } => Integrated::Applied,
        };

        if outcome != Integrated::MissingDependency {
            self.observe_clock(op.id);
        }
        outcome
    }

    fn integrate_insert(&mut self, id: ItemId, ch: char, origin: ItemId) -> Integrated {
        if self.index.contains_key(&id) {
            return Integrated::AlreadyApplied;
        }

        let start = if origin.is_root() {
            0
        } else {
            match self.index.get(&origin) {
                Some(&at) => at + 1,
                None => return Integrated::MissingDependency,
            }
        };

        // RGA rule: concurrent successors with a greater id keep their
        // place closer to the origin; stop at the first smaller id.
        let mut position = start;
        while position < self.items.len() && self.items[position].id > id {
            position += 1;
        }

        self.items.insert(
            position,
            Item {
                id,
                ch,
                origin,
                deleted: false,
            },
        );
        for at in position..self.items.len() {
            self.index.insert(self.items[at].id, at);
        }

        Integrated::Applied
    }

    fn integrate_delete(&mut self, target: ItemId) -> Integrated {
        match self.index.get(&target) {
            None => Integrated::MissingDependency,
            Some(&at) if self.items[at].deleted => Integrated::AlreadyApplied,
            Some(&at) => {
                self.items[at].deleted = true;
                Integrated::Applied
            }
        }
    }

    /// The id of the visible item just before `position` (root at 0).
    fn id_before(&self, position: usize) -> ItemId {
        if position == 0 {
            return ItemId::root();
        }
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .nth(position - 1)
            .map(|item| item.id)
            .unwrap_or_else(ItemId::root)
    }

    /// Current visible text.
    pub fn to_text(&self) -> String {
        self.items
            .iter()
            .filter(|item| !item.deleted)
            .map(|item| item.ch)
            .collect()
    }

    /// Number of visible characters.
    pub fn visible_len(&self) -> usize {
        self.items.iter().filter(|item| !item.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.visible_len() == 0
    }
}
