//! Document lifecycle
//!
//! One manager per client orchestrates the (document, session,
//! awareness, binding) stack as the active file and branch change. At
//! most one stack is live at a time; every switch tears the previous
//! one down completely before the next comes up, and every async step
//! is guarded by a generation token so a superseded activation cannot
//! touch anything after a newer one has started.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;

use collab::{
    AwarenessChannel, AwarenessMap, RoomId, RoomTransport, SessionChannel, SessionError,
    SessionEvent, User,
};
use coscribe_core::{Observers, Subscription, SyncSettings};
use crdt::{Document, DocumentError, ReplicaId};

use crate::binding::DocumentBinding;
use crate::snapshot::SnapshotStore;
use crate::widget::{ModelIdentity, SurfaceWidget, WidgetProvider};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// File tree supplied by the version-control collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct FileTree {
    pub files: Vec<String>,
}

/// Notices for the host UI. None of these are fatal; the worst case
/// is "live collaboration for this file is temporarily unavailable".
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Activated { file: String, room: RoomId },
    ActivationFailed { file: String, reason: String },
    SyncUnavailable { file: String },
    Deactivated { file: String },
}

struct ActiveDocument {
    file: String,
    document: Arc<Document>,
    session: Arc<SessionChannel>,
    awareness: Arc<AwarenessChannel>,
    binding: Arc<DocumentBinding>,
    /// Snapshot mirror and notice forwarding; dropped first.
    subscriptions: Vec<Subscription>,
}

/// Orchestrates document/session/binding stacks per active file.
pub struct LifecycleManager {
    project: String,
    user: User,
    settings: SyncSettings,
    transport: Arc<dyn RoomTransport>,
    snapshots: Arc<dyn SnapshotStore>,

    widgets: RwLock<Option<Arc<dyn WidgetProvider>>>,
    branch: RwLock<String>,
    structure: RwLock<Option<FileTree>>,

    /// Monotonic token; any async step that observes a newer value
    /// than its own must release its resources and stop.
    generation: AtomicU64,
    active: AsyncMutex<Option<ActiveDocument>>,
    /// Activation requested before the widget surface was ready.
    pending_file: Mutex<Option<String>>,

    events: Observers<LifecycleEvent>,
}

impl LifecycleManager {
    pub fn new(
        project: &str,
        branch: &str,
        user: User,
        transport: Arc<dyn RoomTransport>,
        snapshots: Arc<dyn SnapshotStore>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            project: project.to_string(),
            user,
            settings,
            transport,
            snapshots,
            widgets: RwLock::new(None),
            branch: RwLock::new(branch.to_string()),
            structure: RwLock::new(None),
            generation: AtomicU64::new(0),
            active: AsyncMutex::new(None),
            pending_file: Mutex::new(None),
            events: Observers::new(),
        })
    }

    /// Inject the widget surface. Runs any activation that was
    /// deferred while no surface was mounted.
    pub async fn set_widget_provider(
        &self,
        provider: Arc<dyn WidgetProvider>,
    ) -> Result<(), SyncError> {
        *self.widgets.write() = Some(provider);
        let pending = self.pending_file.lock().take();
        match pending {
            Some(file) => self.activate(Some(&file)).await,
            None => Ok(()),
        }
    }

    /// Make `file` the active document. `None` deactivates and stays
    /// idle. The previous stack is always torn down completely before
    /// anything new is constructed.
    pub async fn activate(&self, file: Option<&str>) -> Result<(), SyncError> {
        let generation = self.next_generation();
        self.teardown_current().await;

        let Some(file) = file else {
            return Ok(());
        };

        let provider = match self.widgets.read().clone() {
            Some(provider) => provider,
            None => {
                tracing::debug!(file, "widget surface not mounted; deferring activation");
                *self.pending_file.lock() = Some(file.to_string());
                return Ok(());
            }
        };

        let branch = self.branch.read().clone();
        let room = RoomId::derive(&self.project, &branch, file);
        tracing::info!(file, room = %room, "activating document");

        let document = Arc::new(Document::new(ReplicaId::new()));
        let session = SessionChannel::connect(
            Arc::clone(&self.transport),
            room.clone(),
            Arc::clone(&document),
            self.settings.clone(),
        );

        // Attach the widget model now (reused by identity, else
        // seeded from the snapshot); no binding exists yet.
        let identity = ModelIdentity::new(&self.project, &branch, file);
        let widget: Arc<dyn SurfaceWidget> = match provider.model(&identity) {
            Some(existing) => existing,
            None => {
                let seed = self.snapshots.get(file).unwrap_or_default();
                provider.create_model(&identity, &seed)
            }
        };

        // Reconciliation must happen-after the first full sync.
        if let Err(err) = session.wait_synced().await {
            session.disconnect();
            document.destroy();
            self.events.emit(&LifecycleEvent::ActivationFailed {
                file: file.to_string(),
                reason: err.to_string(),
            });
            return Err(err.into());
        }
        if self.is_stale(generation) {
            session.disconnect();
            document.destroy();
            return Ok(());
        }

        // First participant in a never-synchronized room seeds from
        // the snapshot; everyone else defers to converged content and
        // mirrors it back out. A cross-replica seeding race remains
        // possible when two first participants sync simultaneously;
        // both insertions converge, so it self-heals as a visibly
        // doubled seed rather than corruption.
        let seed = self.snapshots.get(file).unwrap_or_default();
        if document.seed_if_uninitialized(&seed)? {
            tracing::debug!(file, "seeded document from snapshot");
        } else {
            self.snapshots.set(file, &document.to_text()?);
        }

        let awareness = AwarenessChannel::new(Arc::clone(&session), &self.user, &self.settings);
        let binding = DocumentBinding::new(
            Arc::clone(&document),
            Arc::clone(&widget),
            Arc::clone(&awareness),
        );

        // Keep the snapshot mirroring the converged text for
        // downstream consumers (save, file tree).
        let snapshots = Arc::clone(&self.snapshots);
        let mirror_file = file.to_string();
        let mirror_sub = document.observe(move |change| {
            snapshots.set(&mirror_file, &change.text);
        });

        let events = self.events.clone();
        let notice_file = file.to_string();
        let notice_sub = session.on_event(move |event| {
            if matches!(event, SessionEvent::SyncUnavailable { .. }) {
                events.emit(&LifecycleEvent::SyncUnavailable {
                    file: notice_file.clone(),
                });
            }
        });

        let active = ActiveDocument {
            file: file.to_string(),
            document,
            session,
            awareness,
            binding,
            subscriptions: vec![mirror_sub, notice_sub],
        };

        let mut slot = self.active.lock().await;
        if self.is_stale(generation) {
            drop(slot);
            Self::teardown(active, &self.events);
            return Ok(());
        }
        *slot = Some(active);
        drop(slot);

        self.events.emit(&LifecycleEvent::Activated {
            file: file.to_string(),
            room,
        });
        Ok(())
    }

    /// Deactivate whatever is active and stay idle.
    pub async fn close(&self) {
        self.next_generation();
        self.pending_file.lock().take();
        self.teardown_current().await;
    }

    /// Apply a new file tree from the version-control collaborator.
    /// `None` means "tear down current document bindings before a new
    /// structure lands" and is used during branch switches.
    pub async fn apply_structure(&self, structure: Option<FileTree>) {
        match structure {
            None => {
                self.next_generation();
                self.teardown_current().await;
                *self.structure.write() = None;
            }
            Some(tree) => {
                *self.structure.write() = Some(tree);
            }
        }
    }

    /// Switch branches: tear down, let in-flight teardown settle,
    /// swap the branch and structure, then optionally reopen a file
    /// on the new branch.
    pub async fn switch_branch(
        &self,
        branch: &str,
        structure: FileTree,
        reopen: Option<&str>,
    ) -> Result<(), SyncError> {
        tracing::info!(branch, "switching branch");
        self.apply_structure(None).await;
        tokio::time::sleep(self.settings.settle_delay()).await;

        *self.branch.write() = branch.to_string();
        self.apply_structure(Some(structure)).await;

        match reopen {
            Some(file) => self.activate(Some(file)).await,
            None => Ok(()),
        }
    }

    /// Current awareness mapping, for an online-users list.
    pub async fn presence(&self) -> AwarenessMap {
        match &*self.active.lock().await {
            Some(active) => active.awareness.snapshot(),
            None => AwarenessMap::new(),
        }
    }

    /// The currently active file, if any.
    pub async fn active_file(&self) -> Option<String> {
        self.active.lock().await.as_ref().map(|active| active.file.clone())
    }

    /// Converged text of the active document, if one is active.
    pub async fn active_text(&self) -> Option<String> {
        match &*self.active.lock().await {
            Some(active) => active.document.to_text().ok(),
            None => None,
        }
    }

    pub fn branch(&self) -> String {
        self.branch.read().clone()
    }

    pub fn structure(&self) -> Option<FileTree> {
        self.structure.read().clone()
    }

    /// Observe lifecycle notices.
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    async fn teardown_current(&self) {
        let taken = self.active.lock().await.take();
        if let Some(active) = taken {
            Self::teardown(active, &self.events);
        }
    }

    /// Reverse construction order. A failure in one step must never
    /// keep the remaining resources alive, so each is contained.
    fn teardown(active: ActiveDocument, events: &Observers<LifecycleEvent>) {
        let ActiveDocument {
            file,
            document,
            session,
            awareness,
            binding,
            subscriptions,
        } = active;
        drop(subscriptions);

        if catch_unwind(AssertUnwindSafe(|| binding.destroy())).is_err() {
            tracing::warn!(file, "binding teardown panicked");
        }
        if catch_unwind(AssertUnwindSafe(|| awareness.disconnect())).is_err() {
            tracing::warn!(file, "awareness teardown panicked");
        }
        if catch_unwind(AssertUnwindSafe(|| session.disconnect())).is_err() {
            tracing::warn!(file, "session teardown panicked");
        }
        if catch_unwind(AssertUnwindSafe(|| document.destroy())).is_err() {
            tracing::warn!(file, "document teardown panicked");
        }

        tracing::debug!(file, "document deactivated");
        events.emit(&LifecycleEvent::Deactivated { file });
    }
}
