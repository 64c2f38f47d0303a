//! Session channel
//!
//! Binds one replicated document to one room. The channel keeps the
//! document converged with every other session in the room: full-state
//! sync on join, incremental operation exchange afterwards, automatic
//! reconnect with backoff, and local-edit buffering while offline.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

use coscribe_core::{Observers, Subscription, SyncSettings};
use crdt::{ChangeOrigin, Document, OperationBatch, ReplicaId};

use crate::protocol::WireMessage;
use crate::room::RoomId;
use crate::transport::{Joined, RoomTransport, TransportEvent};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session channel is disconnected")]
    Disconnected,
}

/// Connection state of a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not connected; either retrying or terminally closed.
    Disconnected,
    /// Joining the room or waiting for the first sync.
    Connecting,
    /// Full state received (or fresh room); exchanging operations.
    Synced,
}

/// Events observable on a session channel.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Fired once per connection attempt, after full state has been
    /// received and applied (or the room was determined to be fresh).
    Synced,
    PeerJoined(ReplicaId),
    PeerLeft(ReplicaId),
    /// Reconnects have failed this many consecutive times; worth a
    /// non-fatal notice to the user. Editing continues locally.
    SyncUnavailable { consecutive_failures: u32 },
}

/// A live network session scoped to one room.
pub struct SessionChannel {
    room: RoomId,
    replica: ReplicaId,
    document: Arc<Document>,
    transport: Arc<dyn RoomTransport>,
    settings: SyncSettings,

    state: RwLock<SessionState>,
    peers: RwLock<HashSet<ReplicaId>>,
    outgoing: RwLock<Option<UnboundedSender<WireMessage>>>,
    /// Local batches generated while no link was up.
    buffered: Mutex<Vec<OperationBatch>>,
    connected_at: RwLock<Option<DateTime<Utc>>>,

    events: Observers<SessionEvent>,
    /// Raw awareness frames, consumed by the awareness channel.
    frames: Observers<WireMessage>,

    closed: AtomicBool,
    closed_notify: Notify,
    synced_notify: Notify,
    run_task: Mutex<Option<JoinHandle<()>>>,
    doc_subscription: Mutex<Option<Subscription>>,
}

impl SessionChannel {
    /// Open a session for `document` in `room`. The returned channel
    /// connects in the background; use `wait_synced` or `on_event` to
    /// observe progress.
    pub fn connect(
        transport: Arc<dyn RoomTransport>,
        room: RoomId,
        document: Arc<Document>,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let channel = Arc::new(Self {
            room,
            replica: document.replica(),
            document,
            transport,
            settings,
            state: RwLock::new(SessionState::Connecting),
            peers: RwLock::new(HashSet::new()),
            outgoing: RwLock::new(None),
            buffered: Mutex::new(Vec::new()),
            connected_at: RwLock::new(None),
            events: Observers::new(),
            frames: Observers::new(),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            synced_notify: Notify::new(),
            run_task: Mutex::new(None),
            doc_subscription: Mutex::new(None),
        });

        // Ship local document edits as they happen; buffer when the
        // link is down.
        let weak = Arc::downgrade(&channel);
        let subscription = channel.document.observe(move |change| {
            if change.origin == ChangeOrigin::Local {
                if let Some(channel) = weak.upgrade() {
                    channel.ship_pending();
                }
            }
        });
        *channel.doc_subscription.lock() = Some(subscription);

        let runner = Arc::clone(&channel);
        *channel.run_task.lock() = Some(tokio::spawn(runner.run()));

        channel
    }

    pub fn room(&self) -> &RoomId {
        &self.room
    }

    pub fn replica(&self) -> ReplicaId {
        self.replica
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Currently connected remote participants.
    pub fn peers(&self) -> Vec<ReplicaId> {
        self.peers.read().iter().copied().collect()
    }

    /// When the current link came up, if one is up.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        *self.connected_at.read()
    }

    /// Observe session events.
    pub fn on_event<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(callback)
    }

    /// Observe the sync point of a connection attempt. Fires once per
    /// attempt, when full peer state has been received and applied.
    pub fn on_synced<F>(&self, callback: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.events.subscribe(move |event| {
            if matches!(event, SessionEvent::Synced) {
                callback();
            }
        })
    }

    /// Wait until the channel has synced, or return an error if it is
    /// terminally disconnected first.
    pub async fn wait_synced(&self) -> Result<(), SessionError> {
        loop {
            let notified = self.synced_notify.notified();
            if self.state() == SessionState::Synced {
                return Ok(());
            }
            if self.is_closed() {
                return Err(SessionError::Disconnected);
            }
            notified.await;
        }
    }

    /// Send a raw frame into the room, if a link is up. Used by the
    /// awareness layer; document operations take the pending path.
    pub fn send_frame(&self, msg: WireMessage) -> bool {
        match &*self.outgoing.read() {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Observe raw awareness frames arriving from the room.
    pub fn on_frame<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&WireMessage) + Send + Sync + 'static,
    {
        self.frames.subscribe(callback)
    }

    /// Tear the channel down. Idempotent: calling this on an already
    /// disconnected channel has no effect. This instance never
    /// reconnects afterwards.
    pub fn disconnect(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.state.write() = SessionState::Disconnected;
        *self.outgoing.write() = None;
        *self.connected_at.write() = None;
        self.doc_subscription.lock().take();
        self.peers.write().clear();
        self.closed_notify.notify_waiters();
        self.synced_notify.notify_waiters();
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
        tracing::debug!(room = %self.room, "session disconnected");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drain the document's pending operations onto the wire, or into
    /// the offline buffer.
    fn ship_pending(&self) {
        if self.is_closed() {
            return;
        }
        let Some(batch) = self.document.take_pending() else {
            return;
        };
        let sent = {
            let outgoing = self.outgoing.read();
            match &*outgoing {
                Some(tx) => tx
                    .send(WireMessage::Operations {
                        batch: batch.clone(),
                    })
                    .is_ok(),
                None => false,
            }
        };
        if !sent {
            self.buffered.lock().push(batch);
        }
    }

    async fn run(self: Arc<Self>) {
        let mut consecutive_failures: u32 = 0;
        while !self.is_closed() {
            *self.state.write() = SessionState::Connecting;
            match self.transport.join(&self.room, self.replica).await {
                Ok(joined) => {
                    consecutive_failures = 0;
                    self.handle_link(joined).await;
                    if self.is_closed() {
                        break;
                    }
                    tracing::debug!(room = %self.room, "link lost, scheduling reconnect");
                }
                Err(err) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    tracing::warn!(
                        room = %self.room,
                        failures = consecutive_failures,
                        %err,
                        "failed to join room"
                    );
                    if consecutive_failures == self.settings.reconnect.notice_threshold {
                        self.events.emit(&SessionEvent::SyncUnavailable {
                            consecutive_failures,
                        });
                    }
                }
            }

            let delay = self.settings.reconnect.delay_for(consecutive_failures);
            tokio::select! {
                _ = self.closed_notify.notified() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        *self.state.write() = SessionState::Disconnected;
    }

    async fn handle_link(&self, joined: Joined) {
        let Joined {
            peers,
            outgoing,
            mut incoming,
        } = joined;

        {
            let mut known = self.peers.write();
            known.clear();
            known.extend(peers.iter().copied());
        }
        *self.outgoing.write() = Some(outgoing.clone());
        *self.connected_at.write() = Some(Utc::now());

        // Ask the room for everything we are missing, then flush what
        // we produced while offline. Receivers dedup by watermark, so
        // at-least-once delivery here is safe.
        let _ = outgoing.send(WireMessage::SyncRequest {
            from: self.replica,
            state_vector: self.document.state_vector(),
        });
        self.flush_buffered(&outgoing);

        let mut synced = false;
        if self.peers.read().is_empty() {
            // Fresh room: there is no peer state to wait for.
            self.mark_synced(&mut synced);
        }

        let sync_deadline = tokio::time::sleep(self.settings.sync_timeout());
        tokio::pin!(sync_deadline);

        loop {
            tokio::select! {
                _ = self.closed_notify.notified() => break,
                _ = &mut sync_deadline, if !synced => {
                    tracing::debug!(room = %self.room, "no sync response in time, assuming no peer state");
                    self.mark_synced(&mut synced);
                }
                event = incoming.recv() => match event {
                    None | Some(TransportEvent::ConnectionLost) => break,
                    Some(TransportEvent::PeerJoined(replica)) => {
                        self.peers.write().insert(replica);
                        // Counter-sync: the newcomer may hold operations
                        // we never saw (edits shipped into a dying link).
                        let _ = outgoing.send(WireMessage::SyncRequest {
                            from: self.replica,
                            state_vector: self.document.state_vector(),
                        });
                        self.events.emit(&SessionEvent::PeerJoined(replica));
                    }
                    Some(TransportEvent::PeerLeft(replica)) => {
                        self.peers.write().remove(&replica);
                        self.events.emit(&SessionEvent::PeerLeft(replica));
                    }
                    Some(TransportEvent::Message(msg)) => {
                        self.handle_message(msg, &outgoing, &mut synced);
                    }
                }
            }
        }

        *self.outgoing.write() = None;
        *self.connected_at.write() = None;
    }

    fn handle_message(
        &self,
        msg: WireMessage,
        outgoing: &UnboundedSender<WireMessage>,
        synced: &mut bool,
    ) {
        match msg {
            WireMessage::SyncRequest { from, state_vector } => {
                let operations = self.document.operations_since(&state_vector);
                // Reply even when empty: the requester uses the
                // response to conclude its initial sync.
                let _ = outgoing.send(WireMessage::SyncResponse {
                    from: self.replica,
                    to: from,
                    operations,
                });
            }
            WireMessage::SyncResponse { to, from, operations } => {
                if to != self.replica {
                    return;
                }
                let batch = OperationBatch::with_operations(from, operations);
                if let Err(err) = self.document.apply_remote(&batch) {
                    tracing::warn!(room = %self.room, %err, "dropping sync response");
                    return;
                }
                self.mark_synced(synced);
            }
            WireMessage::Operations { batch } => {
                if batch.replica == self.replica {
                    return;
                }
                if let Err(err) = self.document.apply_remote(&batch) {
                    tracing::warn!(room = %self.room, %err, "dropping operations");
                }
            }
            msg @ (WireMessage::Awareness { .. } | WireMessage::AwarenessLeave { .. }) => {
                self.frames.emit(&msg);
            }
            // Membership frames are the transport's concern.
            WireMessage::Join { .. }
            | WireMessage::Hello { .. }
            | WireMessage::PeerJoined { .. }
            | WireMessage::PeerLeft { .. } => {}
        }
    }

    fn mark_synced(&self, synced: &mut bool) {
        if *synced {
            return;
        }
        *synced = true;
        *self.state.write() = SessionState::Synced;
        self.events.emit(&SessionEvent::Synced);
        self.synced_notify.notify_waiters();
        tracing::debug!(room = %self.room, "session synced");
    }

    fn flush_buffered(&self, outgoing: &UnboundedSender<WireMessage>) {
        let batches: Vec<OperationBatch> = self.buffered.lock().drain(..).collect();
        for batch in batches {
            let _ = outgoing.send(WireMessage::Operations { batch });
        }
        // Anything generated since the last observer tick.
        if let Some(batch) = self.document.take_pending() {
            let _ = outgoing.send(WireMessage::Operations { batch });
        }
    }
}

impl Drop for SessionChannel {
    fn drop(&mut self) {
        if let Some(task) = self.run_task.lock().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalHub;
    use std::time::Duration;

    fn fast_settings() -> SyncSettings {
        let mut settings = SyncSettings::default();
        settings.reconnect.base_ms = 10;
        settings.reconnect.cap_ms = 50;
        settings.sync_timeout_ms = 200;
        settings
    }

    fn new_doc(id: u64) -> Arc<Document> {
        Arc::new(Document::new(ReplicaId::from_u64(id)))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn test_fresh_room_syncs_immediately() {
        let hub: Arc<dyn RoomTransport> = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let doc = new_doc(1);

        let session = SessionChannel::connect(hub, room, doc, fast_settings());
        session.wait_synced().await.unwrap();
        assert_eq!(session.state(), SessionState::Synced);
        assert!(session.peers().is_empty());

        session.disconnect();
    }

    #[tokio::test]
    async fn test_two_sessions_exchange_edits() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let doc_a = new_doc(1);
        let doc_b = new_doc(2);

        let a = SessionChannel::connect(
            hub.clone() as Arc<dyn RoomTransport>,
            room.clone(),
            doc_a.clone(),
            fast_settings(),
        );
        a.wait_synced().await.unwrap();
        doc_a.insert(0, "hello").unwrap();

        let b = SessionChannel::connect(
            hub as Arc<dyn RoomTransport>,
            room,
            doc_b.clone(),
            fast_settings(),
        );
        b.wait_synced().await.unwrap();
        assert_eq!(doc_b.to_text().unwrap(), "hello");

        doc_b.insert(5, " world").unwrap();
        settle().await;
        assert_eq!(doc_a.to_text().unwrap(), "hello world");

        assert_eq!(a.peers(), vec![doc_b.replica()]);
        a.disconnect();
        b.disconnect();
    }

    #[tokio::test]
    async fn test_synced_fires_once_per_attempt() {
        let hub: Arc<dyn RoomTransport> = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let doc = new_doc(1);

        let session = SessionChannel::connect(hub, room, doc, fast_settings());
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        let _sub = session.on_synced(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        session.wait_synced().await.unwrap();
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        session.disconnect();
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let hub: Arc<dyn RoomTransport> = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let session = SessionChannel::connect(hub, room, new_doc(1), fast_settings());
        session.wait_synced().await.unwrap();

        session.disconnect();
        session.disconnect();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(session.wait_synced().await.is_err());
    }

    #[tokio::test]
    async fn test_edits_before_connect_are_delivered() {
        let hub = Arc::new(LocalHub::new());
        let room = RoomId::derive("p", "main", "a.ts");
        let doc_a = new_doc(1);
        let doc_b = new_doc(2);

        // Edits happen before any session exists; they sit in the
        // document's pending set.
        doc_a.insert(0, "offline").unwrap();

        let a = SessionChannel::connect(
            hub.clone() as Arc<dyn RoomTransport>,
            room.clone(),
            doc_a.clone(),
            fast_settings(),
        );
        a.wait_synced().await.unwrap();

        let b = SessionChannel::connect(
            hub as Arc<dyn RoomTransport>,
            room,
            doc_b.clone(),
            fast_settings(),
        );
        b.wait_synced().await.unwrap();
        assert_eq!(doc_b.to_text().unwrap(), "offline");

        a.disconnect();
        b.disconnect();
    }
}
