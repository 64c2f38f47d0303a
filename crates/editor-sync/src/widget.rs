//! Surface widget contracts
//!
//! The interactive text surface (the editor widget) lives outside
//! this engine. These traits are what the binding and the lifecycle
//! manager need from it: model lookup by identity, splice and
//! decoration application, and edit/cursor notification.

use std::sync::Arc;

use collab::CursorPosition;
use coscribe_core::Subscription;
use crdt::ReplicaId;

/// Stable identity of a widget text model.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelIdentity {
    pub project: String,
    pub branch: String,
    pub file: String,
}

impl ModelIdentity {
    pub fn new(project: &str, branch: &str, file: &str) -> Self {
        Self {
            project: project.to_string(),
            branch: branch.to_string(),
            file: file.to_string(),
        }
    }
}

/// A user edit reported by the widget, linearized to character
/// offsets: `deleted` characters removed at `offset`, then `inserted`
/// text added there.
#[derive(Debug, Clone)]
pub struct WidgetEdit {
    pub offset: usize,
    pub deleted: usize,
    pub inserted: String,
}

/// A rendered remote participant cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteCursor {
    pub replica: ReplicaId,
    pub name: String,
    /// Hex color for the cursor marker and label.
    pub color: String,
    pub position: CursorPosition,
}

/// One text model of the surface widget.
pub trait SurfaceWidget: Send + Sync {
    /// Current widget text.
    fn text(&self) -> String;

    /// Replace the widget content with remotely converged text. The
    /// widget must not report this as a user edit and must keep the
    /// local cursor and scroll position where they are.
    fn apply_remote_text(&self, text: &str);

    /// Observe user edits.
    fn on_edit(&self, callback: Box<dyn Fn(&WidgetEdit) + Send + Sync>) -> Subscription;

    /// Observe local cursor movement.
    fn on_cursor(&self, callback: Box<dyn Fn(&CursorPosition) + Send + Sync>) -> Subscription;

    /// Replace the full set of remote cursor decorations. Passing an
    /// empty set clears them.
    fn set_remote_cursors(&self, cursors: Vec<RemoteCursor>);

    /// Convert a linear character offset to (line, column).
    fn offset_to_position(&self, offset: usize) -> CursorPosition;

    /// Convert (line, column) to a linear character offset.
    fn position_to_offset(&self, position: CursorPosition) -> usize;
}

/// Source of widget models, injected by the host once the surface is
/// mounted. Activation is deferred until a provider exists.
pub trait WidgetProvider: Send + Sync {
    /// An existing in-memory model for this identity, if alive.
    fn model(&self, identity: &ModelIdentity) -> Option<Arc<dyn SurfaceWidget>>;

    /// Create a model seeded with `text`.
    fn create_model(&self, identity: &ModelIdentity, text: &str) -> Arc<dyn SurfaceWidget>;
}
