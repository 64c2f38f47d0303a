//! # Coscribe Editor Sync
//!
//! The editor-facing half of the collaboration engine: the binding
//! between replicated documents and surface widget models, and the
//! lifecycle manager that creates and tears down the whole
//! document/session/awareness/binding stack as the user moves between
//! files and branches.

pub mod binding;
pub mod lifecycle;
pub mod model;
pub mod snapshot;
pub mod widget;

pub use binding::DocumentBinding;
pub use lifecycle::{FileTree, LifecycleEvent, LifecycleManager, SyncError};
pub use model::{ScratchModel, ScratchProvider};
pub use snapshot::{MemorySnapshots, SnapshotStore};
pub use widget::{ModelIdentity, RemoteCursor, SurfaceWidget, WidgetEdit, WidgetProvider};
