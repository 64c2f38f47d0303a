//! Awareness channel
//!
//! Ephemeral per-participant state (identity, color, cursor) layered
//! over a session's room. Lossy and last-write-wins: records are
//! re-broadcast as keep-alives, refreshed on receipt, and swept once
//! their owner goes quiet past the grace period. Nothing here is
//! persisted and nothing here may block editing.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use coscribe_core::{Observers, Subscription, SyncSettings};
use crdt::ReplicaId;

use crate::User;
use crate::protocol::WireMessage;
use crate::session::{SessionChannel, SessionEvent};

/// Cursor position in a file (0-indexed).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub line: u32,
    pub column: u32,
}

/// A selection; `head` is where the cursor is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub anchor: CursorPosition,
    pub head: CursorPosition,
}

/// One participant's advertised record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub name: String,
    /// Hex color for cursor and selection highlights.
    pub color: String,
    pub cursor: Option<CursorPosition>,
    pub selection: Option<Selection>,
}

/// Full mapping delivered to `on_change` observers.
pub type AwarenessMap = HashMap<ReplicaId, AwarenessState>;

struct RemoteEntry {
    state: AwarenessState,
    last_seen: Instant,
}

/// Presence layered on a session channel.
pub struct AwarenessChannel {
    session: Arc<SessionChannel>,
    local: Mutex<AwarenessState>,
    remote: Mutex<HashMap<ReplicaId, RemoteEntry>>,
    changes: Observers<AwarenessMap>,
    subscriptions: Mutex<Vec<Subscription>>,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl AwarenessChannel {
    /// Create the channel and advertise `user` to the room.
    pub fn new(session: Arc<SessionChannel>, user: &User, settings: &SyncSettings) -> Arc<Self> {
        let color = user.color_for(session.replica()).to_hex();
        let channel = Arc::new(Self {
            session: Arc::clone(&session),
            local: Mutex::new(AwarenessState {
                name: user.name.clone(),
                color,
                cursor: None,
                selection: None,
            }),
            remote: Mutex::new(HashMap::new()),
            changes: Observers::new(),
            subscriptions: Mutex::new(Vec::new()),
            sweep_task: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&channel);
        let frame_sub = session.on_frame(move |frame| {
            if let Some(channel) = weak.upgrade() {
                channel.handle_frame(frame);
            }
        });

        let weak = Arc::downgrade(&channel);
        let event_sub = session.on_event(move |event| {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            match event {
                // Leaving peers lose their record immediately.
                SessionEvent::PeerLeft(replica) => channel.remove_record(*replica),
                // Newcomers and fresh links need to learn about us.
                SessionEvent::PeerJoined(_) | SessionEvent::Synced => channel.broadcast_local(),
                SessionEvent::SyncUnavailable { .. } => {}
            }
        });
        *channel.subscriptions.lock() = vec![frame_sub, event_sub];

        let sweeper = Arc::downgrade(&channel);
        let grace = settings.awareness_grace();
        let sweep_every = settings.awareness_sweep();
        *channel.sweep_task.lock() = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(channel) = sweeper.upgrade() else {
                    return;
                };
                if channel.closed.load(Ordering::SeqCst) {
                    return;
                }
                channel.broadcast_local();
                channel.sweep_stale(grace);
            }
        }));

        channel.broadcast_local();
        channel
    }

    /// Merge fields into the local record and broadcast it.
    pub fn update_local<F>(&self, update: F)
    where
        F: FnOnce(&mut AwarenessState),
    {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        update(&mut self.local.lock());
        self.broadcast_local();
        self.emit_change();
    }

    /// Advertise a new cursor position (and optional selection).
    pub fn set_cursor(&self, cursor: Option<CursorPosition>, selection: Option<Selection>) {
        self.update_local(|state| {
            state.cursor = cursor;
            state.selection = selection;
        });
    }

    /// The full current mapping, local record included.
    pub fn snapshot(&self) -> AwarenessMap {
        let mut map: AwarenessMap = self
            .remote
            .lock()
            .iter()
            .map(|(replica, entry)| (*replica, entry.state.clone()))
            .collect();
        if !self.closed.load(Ordering::SeqCst) {
            map.insert(self.session.replica(), self.local.lock().clone());
        }
        map
    }

    /// The local replica id (its key in the mapping).
    pub fn local_replica(&self) -> ReplicaId {
        self.session.replica()
    }

    /// Observe any change to the mapping: add, update, or removal.
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&AwarenessMap) + Send + Sync + 'static,
    {
        self.changes.subscribe(callback)
    }

    /// Withdraw the local record and stop tracking peers. Idempotent.
    /// The leave frame is best-effort: the link may already be gone.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.session.send_frame(WireMessage::AwarenessLeave {
            from: self.session.replica(),
        });
        if let Some(task) = self.sweep_task.lock().take() {
            task.abort();
        }
        self.subscriptions.lock().clear();
        self.remote.lock().clear();
        self.emit_change();
        tracing::debug!(room = %self.session.room(), "awareness disconnected");
    }

    fn handle_frame(&self, frame: &WireMessage) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match frame {
            WireMessage::Awareness { from, state } => {
                if *from == self.session.replica() {
                    return;
                }
                let changed = {
                    let mut remote = self.remote.lock();
                    let entry = remote.entry(*from);
                    match entry {
                        std::collections::hash_map::Entry::Occupied(mut slot) => {
                            let slot = slot.get_mut();
                            let changed = slot.state != *state;
                            slot.state = state.clone();
                            slot.last_seen = Instant::now();
                            changed
                        }
                        std::collections::hash_map::Entry::Vacant(slot) => {
                            slot.insert(RemoteEntry {
                                state: state.clone(),
                                last_seen: Instant::now(),
                            });
                            true
                        }
                    }
                };
                if changed {
                    self.emit_change();
                }
            }
            WireMessage::AwarenessLeave { from } => self.remove_record(*from),
            _ => {}
        }
    }

    fn remove_record(&self, replica: ReplicaId) {
        if self.remote.lock().remove(&replica).is_some() {
            self.emit_change();
        }
    }

    fn sweep_stale(&self, grace: std::time::Duration) {
        let removed = {
            let mut remote = self.remote.lock();
            let before = remote.len();
            remote.retain(|_, entry| entry.last_seen.elapsed() < grace);
            before - remote.len()
        };
        if removed > 0 {
            tracing::debug!(removed, "swept stale awareness records");
            self.emit_change();
        }
    }

    fn broadcast_local(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let state = self.local.lock().clone();
        self.session.send_frame(WireMessage::Awareness {
            from: self.session.replica(),
            state,
        });
    }

    fn emit_change(&self) {
        let map = self.snapshot();
        self.changes.emit(&map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::RoomId;
    use crate::transport::{LocalHub, RoomTransport};
    use crdt::Document;
    use std::time::Duration;

    fn fast_settings() -> SyncSettings {
        let mut settings = SyncSettings::default();
        settings.reconnect.base_ms = 10;
        settings.sync_timeout_ms = 200;
        settings.awareness_grace_ms = 300;
        settings.awareness_sweep_ms = 50;
        settings
    }

    async fn connected_pair(
        hub: &Arc<LocalHub>,
        room: &RoomId,
    ) -> (Arc<SessionChannel>, Arc<SessionChannel>) {
        let settings = fast_settings();
        let a = SessionChannel::connect(
            Arc::clone(hub) as Arc<dyn RoomTransport>,
            room.clone(),
            Arc::new(Document::new(ReplicaId::from_u64(1))),
            settings.clone(),
        );
        a.wait_synced().await.unwrap();
        let b = SessionChannel::connect(
            Arc::clone(hub) as Arc<dyn RoomTransport>,
            room.clone(),
            Arc::new(Document::new(ReplicaId::from_u64(2))),
            settings,
        );
        b.wait_synced().await.unwrap();
        (a, b)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_records_propagate_and_update() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let (session_a, session_b) = connected_pair(&hub, &room).await;

        let settings = fast_settings();
        let a = AwarenessChannel::new(Arc::clone(&session_a), &User::new("alice"), &settings);
        let b = AwarenessChannel::new(Arc::clone(&session_b), &User::new("bob"), &settings);
        settle().await;

        let seen_by_b = b.snapshot();
        assert_eq!(seen_by_b.len(), 2);
        assert_eq!(seen_by_b[&session_a.replica()].name, "alice");

        a.set_cursor(Some(CursorPosition { line: 3, column: 7 }), None);
        settle().await;
        let seen_by_b = b.snapshot();
        assert_eq!(
            seen_by_b[&session_a.replica()].cursor,
            Some(CursorPosition { line: 3, column: 7 })
        );

        a.disconnect();
        b.disconnect();
        session_a.disconnect();
        session_b.disconnect();
    }

    #[tokio::test]
    async fn test_explicit_leave_removes_record() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let (session_a, session_b) = connected_pair(&hub, &room).await;

        let settings = fast_settings();
        let a = AwarenessChannel::new(Arc::clone(&session_a), &User::new("alice"), &settings);
        let b = AwarenessChannel::new(Arc::clone(&session_b), &User::new("bob"), &settings);
        settle().await;
        assert_eq!(b.snapshot().len(), 2);

        a.disconnect();
        settle().await;
        let seen_by_b = b.snapshot();
        assert!(!seen_by_b.contains_key(&session_a.replica()));

        b.disconnect();
        session_a.disconnect();
        session_b.disconnect();
    }

    #[tokio::test]
    async fn test_silent_peers_are_swept() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let (session_a, session_b) = connected_pair(&hub, &room).await;

        let settings = fast_settings();
        let b = AwarenessChannel::new(Arc::clone(&session_b), &User::new("bob"), &settings);

        // a broadcasts once and then never again (no sweep keep-alive).
        let mut quiet = fast_settings();
        quiet.awareness_sweep_ms = 60_000;
        let a = AwarenessChannel::new(Arc::clone(&session_a), &User::new("alice"), &quiet);
        settle().await;
        assert!(b.snapshot().contains_key(&session_a.replica()));

        // Past the grace period the record must be gone even though
        // nothing ever announced a departure.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!b.snapshot().contains_key(&session_a.replica()));

        a.disconnect();
        b.disconnect();
        session_a.disconnect();
        session_b.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let (session_a, _session_b) = connected_pair(&hub, &room).await;

        let settings = fast_settings();
        let a = AwarenessChannel::new(Arc::clone(&session_a), &User::new("alice"), &settings);
        a.disconnect();
        a.disconnect();
        assert!(a.snapshot().is_empty());
    }
}
