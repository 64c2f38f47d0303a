//! # Coscribe CRDT
//!
//! Conflict-free replicated text documents. One `Document` is the unit
//! of convergence for a single (project, branch, file) tuple: replicas
//! that receive the same set of operations converge to byte-identical
//! text and metadata, regardless of delivery order across senders.

pub mod id;
pub mod meta;
pub mod operation;
pub mod state;
pub mod text;

pub use id::{ItemId, ReplicaId};
pub use meta::{INITIALIZED, MetaMap};
pub use operation::{Operation, OperationBatch, OperationKind};
pub use state::StateVector;
pub use text::{Integrated, TextCrdt};

use parking_lot::Mutex;

use coscribe_core::{Observers, Subscription};

/// Where a document change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Remote,
}

/// Payload delivered to `Document::observe` callbacks. Carries the
/// full resulting text so callbacks are idempotent-safe: re-reading
/// the text is always correct.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document has been destroyed")]
    Destroyed,
}

struct DocumentInner {
    text: TextCrdt,
    meta: MetaMap,
    /// Delivery watermark, local operations included.
    seen: StateVector,
    /// Every delivered operation, in arrival order (per-sender order
    /// preserved); served to peers via `operations_since`.
    log: Vec<Operation>,
    /// Locally generated operations not yet shipped.
    pending: Vec<Operation>,
    /// Remote operations waiting for a missing dependency.
    deferred: Vec<Operation>,
    destroyed: bool,
}

/// A replicated document: text register plus metadata flags.
pub struct Document {
    replica: ReplicaId,
    inner: Mutex<DocumentInner>,
    changes: Observers<DocumentChange>,
}

impl Document {
    pub fn new(replica: ReplicaId) -> Self {
        Self {
            replica,
            inner: Mutex::new(DocumentInner {
                text: TextCrdt::new(replica),
                meta: MetaMap::new(),
                seen: StateVector::new(),
                log: Vec::new(),
                pending: Vec::new(),
                deferred: Vec::new(),
                destroyed: false,
            }),
            changes: Observers::new(),
        }
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    /// Insert `text` at the visible character `position`.
    pub fn insert(&self, position: usize, text: &str) -> Result<(), DocumentError> {
        if text.is_empty() {
            return Ok(());
        }
        let current = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(DocumentError::Destroyed);
            }
            let ops = inner.text.insert(position, text);
            for op in &ops {
                inner.seen.observe(op.id);
            }
            inner.log.extend(ops.iter().cloned());
            inner.pending.extend(ops);
            inner.text.to_text()
        };
        self.changes.emit(&DocumentChange {
            origin: ChangeOrigin::Local,
            text: current,
        });
        Ok(())
    }

    /// Delete `len` visible characters starting at `position`.
    pub fn delete(&self, position: usize, len: usize) -> Result<(), DocumentError> {
        if len == 0 {
            return Ok(());
        }
        let current = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(DocumentError::Destroyed);
            }
            let ops = inner.text.delete(position, len);
            for op in &ops {
                inner.seen.observe(op.id);
            }
            inner.log.extend(ops.iter().cloned());
            inner.pending.extend(ops);
            inner.text.to_text()
        };
        self.changes.emit(&DocumentChange {
            origin: ChangeOrigin::Local,
            text: current,
        });
        Ok(())
    }

    /// Write a metadata flag (last-write-wins across replicas).
    pub fn set_flag(&self, key: &str, value: bool) -> Result<(), DocumentError> {
        let current = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(DocumentError::Destroyed);
            }
            let id = inner.text.tick();
            inner.meta.apply(key, value, id);
            inner.seen.observe(id);
            let op = Operation::set_flag(id, key, value);
            inner.log.push(op.clone());
            inner.pending.push(op);
            inner.text.to_text()
        };
        self.changes.emit(&DocumentChange {
            origin: ChangeOrigin::Local,
            text: current,
        });
        Ok(())
    }

    /// Current value of a metadata flag.
    pub fn flag(&self, key: &str) -> Result<Option<bool>, DocumentError> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(DocumentError::Destroyed);
        }
        Ok(inner.meta.get(key))
    }

    /// Current converged text.
    pub fn to_text(&self) -> Result<String, DocumentError> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(DocumentError::Destroyed);
        }
        Ok(inner.text.to_text())
    }

    pub fn is_empty(&self) -> Result<bool, DocumentError> {
        let inner = self.inner.lock();
        if inner.destroyed {
            return Err(DocumentError::Destroyed);
        }
        Ok(inner.text.is_empty())
    }

    /// Apply a batch of remote operations. Returns how many operations
    /// mutated this replica (already-seen and still-deferred ops do
    /// not count).
    pub fn apply_remote(&self, batch: &OperationBatch) -> Result<usize, DocumentError> {
        let (applied, current) = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(DocumentError::Destroyed);
            }

            let mut applied = 0;
            for op in &batch.operations {
                if inner.seen.has_seen(&op.id) {
                    continue;
                }
                inner.seen.observe(op.id);
                inner.log.push(op.clone());
                if Self::route(&mut inner, op) {
                    applied += 1;
                    applied += Self::drain_deferred(&mut inner);
                }
            }

            (applied, inner.text.to_text())
        };

        if applied > 0 {
            self.changes.emit(&DocumentChange {
                origin: ChangeOrigin::Remote,
                text: current,
            });
        }
        Ok(applied)
    }

    /// Apply one operation; true if it mutated state, false if it was
    /// parked in the deferred queue or was a duplicate.
    fn route(inner: &mut DocumentInner, op: &Operation) -> bool {
        match &op.kind {
            OperationKind::SetFlag { key, value } => {
                inner.text.observe_clock(op.id);
                inner.meta.apply(key, *value, op.id)
            }
            _ => match inner.text.integrate(op) {
                Integrated::Applied => true,
                Integrated::AlreadyApplied => false,
                Integrated::MissingDependency => {
                    tracing::debug!(id = ?op.id, "deferring operation with missing dependency");
                    inner.deferred.push(op.clone());
                    false
                }
            },
        }
    }

    /// Retry deferred operations until a full pass makes no progress.
    fn drain_deferred(inner: &mut DocumentInner) -> usize {
        let mut applied = 0;
        loop {
            if inner.deferred.is_empty() {
                return applied;
            }
            let parked = std::mem::take(&mut inner.deferred);
            let before = parked.len();
            for op in parked {
                match inner.text.integrate(&op) {
                    Integrated::Applied => applied += 1,
                    Integrated::AlreadyApplied => {}
                    Integrated::MissingDependency => inner.deferred.push(op),
                }
            }
            if inner.deferred.len() == before {
                return applied;
            }
        }
    }

    /// Seed the document with initial content if, and only if, no
    /// replica has initialized it yet and its text is still empty.
    /// The check and the seed happen under one lock, so a remote
    /// batch applied concurrently cannot slip between them. Returns
    /// true if this replica became the seeding authority.
    pub fn seed_if_uninitialized(&self, text: &str) -> Result<bool, DocumentError> {
        let current = {
            let mut inner = self.inner.lock();
            if inner.destroyed {
                return Err(DocumentError::Destroyed);
            }
            if inner.meta.get(meta::INITIALIZED) == Some(true) || !inner.text.is_empty() {
                return Ok(false);
            }

            let mut ops = inner.text.insert(0, text);
            let flag_id = inner.text.tick();
            inner.meta.apply(meta::INITIALIZED, true, flag_id);
            ops.push(Operation::set_flag(flag_id, meta::INITIALIZED, true));

            for op in &ops {
                inner.seen.observe(op.id);
            }
            inner.log.extend(ops.iter().cloned());
            inner.pending.extend(ops);
            inner.text.to_text()
        };
        self.changes.emit(&DocumentChange {
            origin: ChangeOrigin::Local,
            text: current,
        });
        Ok(true)
    }

    /// Drain locally generated operations for shipment.
    pub fn take_pending(&self) -> Option<OperationBatch> {
        let mut inner = self.inner.lock();
        if inner.destroyed || inner.pending.is_empty() {
            return None;
        }
        let operations = std::mem::take(&mut inner.pending);
        Some(OperationBatch::with_operations(self.replica, operations))
    }

    /// Snapshot of the delivery watermark.
    pub fn state_vector(&self) -> StateVector {
        self.inner.lock().seen.clone()
    }

    /// Every delivered operation the given peer has not seen.
    pub fn operations_since(&self, since: &StateVector) -> Vec<Operation> {
        self.inner
            .lock()
            .log
            .iter()
            .filter(|op| !since.has_seen(&op.id))
            .cloned()
            .collect()
    }

    /// Observe local and remote mutations.
    pub fn observe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        self.changes.subscribe(callback)
    }

    /// Release all internal state. Idempotent; every operation after
    /// the first `destroy` fails with `DocumentError::Destroyed`.
    pub fn destroy(&self) {
        let mut inner = self.inner.lock();
        if inner.destroyed {
            return;
        }
        inner.destroyed = true;
        inner.log.clear();
        inner.pending.clear();
        inner.deferred.clear();
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }
}
