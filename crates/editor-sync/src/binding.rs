//! Document binding
//!
//! Bridges one replicated document to one widget model. User edits
//! become CRDT operations; remote CRDT changes become widget content;
//! awareness records become remote cursor decorations. The binding
//! never lets a remote application loop back into the document.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use collab::{AwarenessChannel, AwarenessMap};
use coscribe_core::Subscription;
use crdt::{ChangeOrigin, Document, ReplicaId};

use crate::widget::{RemoteCursor, SurfaceWidget};

/// A live bridge between a document, a widget model, and awareness.
pub struct DocumentBinding {
    widget: Arc<dyn SurfaceWidget>,
    subscriptions: Mutex<Vec<Subscription>>,
    destroyed: AtomicBool,
}

impl DocumentBinding {
    pub fn new(
        document: Arc<Document>,
        widget: Arc<dyn SurfaceWidget>,
        awareness: Arc<AwarenessChannel>,
    ) -> Arc<Self> {
        let applying_remote = Arc::new(AtomicBool::new(false));

        // The document is authoritative at binding time; align the
        // widget if the two drifted between model attach and now.
        if let Ok(text) = document.to_text() {
            if widget.text() != text {
                applying_remote.store(true, Ordering::SeqCst);
                widget.apply_remote_text(&text);
                applying_remote.store(false, Ordering::SeqCst);
            }
        }

        // User edits -> document operations.
        let doc = Arc::clone(&document);
        let guard = Arc::clone(&applying_remote);
        let edit_sub = widget.on_edit(Box::new(move |edit| {
            if guard.load(Ordering::SeqCst) {
                return;
            }
            if edit.deleted > 0 {
                if let Err(err) = doc.delete(edit.offset, edit.deleted) {
                    tracing::warn!(%err, "dropping widget delete");
                    return;
                }
            }
            if !edit.inserted.is_empty() {
                if let Err(err) = doc.insert(edit.offset, &edit.inserted) {
                    tracing::warn!(%err, "dropping widget insert");
                }
            }
        }));

        // Remote document changes -> widget content. Local changes
        // are already in the widget; replaying them would fight the
        // user's cursor.
        let target = Arc::clone(&widget);
        let guard = Arc::clone(&applying_remote);
        let doc_sub = document.observe(move |change| {
            if change.origin != ChangeOrigin::Remote {
                return;
            }
            guard.store(true, Ordering::SeqCst);
            target.apply_remote_text(&change.text);
            guard.store(false, Ordering::SeqCst);
        });

        // Local cursor movement -> awareness record.
        let presence = Arc::clone(&awareness);
        let cursor_sub = widget.on_cursor(Box::new(move |position| {
            presence.set_cursor(Some(*position), None);
        }));

        // Awareness changes -> full decoration replacement.
        let target = Arc::clone(&widget);
        let local = awareness.local_replica();
        let awareness_sub = awareness.on_change(move |map| {
            target.set_remote_cursors(remote_cursors(map, local));
        });

        // Render whoever is already in the room.
        widget.set_remote_cursors(remote_cursors(&awareness.snapshot(), local));

        Arc::new(Self {
            widget,
            subscriptions: Mutex::new(vec![edit_sub, doc_sub, cursor_sub, awareness_sub]),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Detach from the widget and drop every listener. Idempotent and
    /// safe to call after the widget's owner has disposed it.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.subscriptions.lock().clear();
        self.widget.set_remote_cursors(Vec::new());
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

/// Everyone else's cursor, in a stable order.
fn remote_cursors(map: &AwarenessMap, local: ReplicaId) -> Vec<RemoteCursor> {
    let mut cursors: Vec<RemoteCursor> = map
        .iter()
        .filter(|(replica, _)| **replica != local)
        .filter_map(|(replica, state)| {
            state.cursor.map(|position| RemoteCursor {
                replica: *replica,
                name: state.name.clone(),
                color: state.color.clone(),
                position,
            })
        })
        .collect();
    cursors.sort_by_key(|cursor| cursor.replica);
    cursors
}
