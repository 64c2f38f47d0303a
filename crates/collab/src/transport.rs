//! Room transports
//!
//! A transport hands a joined member two endpoints: a sender for
//! outgoing frames and a receiver of room events. Dropping the sender
//! leaves the room.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::protocol::WireMessage;
use crate::room::RoomId;
use crdt::ReplicaId;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to connect: {0}")]
    Connect(String),
    #[error("connection closed during handshake")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Events delivered to a room member.
#[derive(Debug)]
pub enum TransportEvent {
    Message(WireMessage),
    PeerJoined(ReplicaId),
    PeerLeft(ReplicaId),
    /// The underlying connection died; the member must rejoin.
    ConnectionLost,
}

/// A live membership in a room.
pub struct Joined {
    /// Replicas already present at the moment of joining.
    pub peers: Vec<ReplicaId>,
    /// Outgoing frames. Dropping this sender leaves the room.
    pub outgoing: mpsc::UnboundedSender<WireMessage>,
    /// Incoming room events.
    pub incoming: mpsc::UnboundedReceiver<TransportEvent>,
}

/// A way of reaching the other replicas in a room.
#[async_trait]
pub trait RoomTransport: Send + Sync {
    async fn join(&self, room: &RoomId, replica: ReplicaId) -> Result<Joined, TransportError>;
}

struct Member {
    /// Distinguishes this membership from a later rejoin of the same
    /// replica, so a stale router cannot evict the new link.
    token: u64,
    tx: mpsc::UnboundedSender<TransportEvent>,
}

type Members = HashMap<ReplicaId, Member>;

/// In-process transport: every member of a room within this process
/// exchanges frames directly. Serves tests and multi-pane single
/// process setups; the routing rules match the WebSocket server's.
#[derive(Clone, Default)]
pub struct LocalHub {
    rooms: Arc<Mutex<HashMap<String, Members>>>,
    next_token: Arc<AtomicU64>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sever one member's link, as a dropped connection would. The
    /// member sees `ConnectionLost`; the rest of the room sees it
    /// leave. The member may rejoin.
    pub fn sever(&self, room: &RoomId, replica: ReplicaId) {
        let mut rooms = self.rooms.lock();
        let Some(members) = rooms.get_mut(room.as_str()) else {
            return;
        };
        if let Some(member) = members.remove(&replica) {
            let _ = member.tx.send(TransportEvent::ConnectionLost);
            for peer in members.values() {
                let _ = peer.tx.send(TransportEvent::PeerLeft(replica));
            }
            if members.is_empty() {
                rooms.remove(room.as_str());
            }
        }
    }

    fn route(
        rooms: &Mutex<HashMap<String, Members>>,
        room: &str,
        from: ReplicaId,
        token: u64,
        msg: WireMessage,
    ) {
        let rooms = rooms.lock();
        let Some(members) = rooms.get(room) else {
            return;
        };
        // Frames sent on a severed link are lost, as on a real socket.
        if !members.get(&from).is_some_and(|member| member.token == token) {
            return;
        }

        // Sync responses are addressed; everything else fans out to
        // the rest of the room.
        if let WireMessage::SyncResponse { to, .. } = &msg {
            if let Some(member) = members.get(to) {
                let _ = member.tx.send(TransportEvent::Message(msg));
            }
            return;
        }

        for (replica, member) in members.iter() {
            if *replica != from {
                let _ = member.tx.send(TransportEvent::Message(msg.clone()));
            }
        }
    }

    fn leave(rooms: &Mutex<HashMap<String, Members>>, room: &str, replica: ReplicaId, token: u64) {
        let mut rooms = rooms.lock();
        let Some(members) = rooms.get_mut(room) else {
            return;
        };
        if members.get(&replica).is_some_and(|member| member.token == token) {
            members.remove(&replica);
            for peer in members.values() {
                let _ = peer.tx.send(TransportEvent::PeerLeft(replica));
            }
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }
}

#[async_trait]
impl RoomTransport for LocalHub {
    async fn join(&self, room: &RoomId, replica: ReplicaId) -> Result<Joined, TransportError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);

        let peers = {
            let mut rooms = self.rooms.lock();
            let members = rooms.entry(room.as_str().to_string()).or_default();
            let peers: Vec<ReplicaId> = members.keys().copied().collect();
            for member in members.values() {
                let _ = member.tx.send(TransportEvent::PeerJoined(replica));
            }
            members.insert(
                replica,
                Member {
                    token,
                    tx: event_tx,
                },
            );
            peers
        };

        let rooms = Arc::clone(&self.rooms);
        let room_key = room.as_str().to_string();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                Self::route(&rooms, &room_key, replica, token, msg);
            }
            // Sender dropped: the member has left.
            Self::leave(&rooms, &room_key, replica, token);
        });

        tracing::debug!(room = %room, replica = %replica, "joined local hub room");
        Ok(Joined {
            peers,
            outgoing: out_tx,
            incoming: event_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn recv(joined: &mut Joined) -> TransportEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), joined.incoming.recv())
            .await
            .expect("timed out")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_join_reports_existing_peers() {
        let hub = LocalHub::new();
        let room = RoomId::derive("p", "main", "a.ts");
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let first = hub.join(&room, a).await.unwrap();
        assert!(first.peers.is_empty());

        let second = hub.join(&room, b).await.unwrap();
        assert_eq!(second.peers, vec![a]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender_and_addressed_frames_are_private() {
        let hub = LocalHub::new();
        let room = RoomId::derive("p", "main", "a.ts");
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let mut first = hub.join(&room, a).await.unwrap();
        let mut second = hub.join(&room, b).await.unwrap();

        // a sees b join.
        assert!(matches!(recv(&mut first).await, TransportEvent::PeerJoined(r) if r == b));

        second
            .outgoing
            .send(WireMessage::AwarenessLeave { from: b })
            .unwrap();
        assert!(matches!(
            recv(&mut first).await,
            TransportEvent::Message(WireMessage::AwarenessLeave { from }) if from == b
        ));

        first
            .outgoing
            .send(WireMessage::SyncResponse {
                from: a,
                to: b,
                operations: Vec::new(),
            })
            .unwrap();
        assert!(matches!(
            recv(&mut second).await,
            TransportEvent::Message(WireMessage::SyncResponse { .. })
        ));
    }

    #[tokio::test]
    async fn test_dropping_sender_leaves_room() {
        let hub = LocalHub::new();
        let room = RoomId::derive("p", "main", "a.ts");
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let mut first = hub.join(&room, a).await.unwrap();
        let second = hub.join(&room, b).await.unwrap();
        assert!(matches!(recv(&mut first).await, TransportEvent::PeerJoined(r) if r == b));

        drop(second);
        assert!(matches!(recv(&mut first).await, TransportEvent::PeerLeft(r) if r == b));
    }

    #[tokio::test]
    async fn test_sever_notifies_both_sides() {
        let hub = LocalHub::new();
        let room = RoomId::derive("p", "main", "a.ts");
        let a = ReplicaId::from_u64(1);
        let b = ReplicaId::from_u64(2);

        let mut first = hub.join(&room, a).await.unwrap();
        let mut second = hub.join(&room, b).await.unwrap();
        assert!(matches!(recv(&mut first).await, TransportEvent::PeerJoined(r) if r == b));

        hub.sever(&room, b);
        assert!(matches!(recv(&mut second).await, TransportEvent::ConnectionLost));
        assert!(matches!(recv(&mut first).await, TransportEvent::PeerLeft(r) if r == b));
    }
}
