//! CRDT operations

use serde::{Deserialize, Serialize};

use crate::{ItemId, ReplicaId};

/// A single replicated operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id; also the item id for inserts.
    pub id: ItemId,
    /// What the operation does.
    pub kind: OperationKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OperationKind {
    /// Insert one character after `origin` (root = document start).
    Insert { ch: char, origin: ItemId },
    /// Tombstone the item `target`.
    Delete { target: ItemId },
    /// Last-write-wins metadata flag.
    SetFlag { key: String, value: bool },
}

impl Operation {
    pub fn insert(id: ItemId, ch: char, origin: ItemId) -> Self {
        Self {
            id,
            kind: OperationKind::Insert { ch, origin },
        }
    }

    pub fn delete(id: ItemId, target: ItemId) -> Self {
        Self {
            id,
            kind: OperationKind::Delete { target },
        }
    }

    pub fn set_flag(id: ItemId, key: impl Into<String>, value: bool) -> Self {
        Self {
            id,
            kind: OperationKind::SetFlag {
                key: key.into(),
                value,
            },
        }
    }
}

/// Operations shipped together over the wire, in generation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationBatch {
    /// Replica that sent these operations.
    pub replica: ReplicaId,
    pub operations: Vec<Operation>,
}

impl OperationBatch {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            operations: Vec::new(),
        }
    }

    pub fn with_operations(replica: ReplicaId, operations: Vec<Operation>) -> Self {
        Self {
            replica,
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }
}
