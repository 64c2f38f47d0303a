//! Collaboration wire protocol
//!
//! Every frame exchanged inside a room, for both the in-process hub
//! and the WebSocket transport. Serialized as tagged JSON.

use serde::{Deserialize, Serialize};

use crate::awareness::AwarenessState;
use crdt::{Operation, OperationBatch, ReplicaId, StateVector};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessage {
    /// First frame a client sends after opening a socket.
    Join { replica: ReplicaId },
    /// First frame a client receives: who was already in the room.
    Hello { peers: Vec<ReplicaId> },
    /// Another replica entered the room.
    PeerJoined { replica: ReplicaId },
    /// Another replica left the room.
    PeerLeft { replica: ReplicaId },

    /// Ask peers for everything past the given watermark.
    SyncRequest {
        from: ReplicaId,
        state_vector: StateVector,
    },
    /// Reply to a `SyncRequest`, addressed to the requester.
    SyncResponse {
        from: ReplicaId,
        to: ReplicaId,
        operations: Vec<Operation>,
    },
    /// Incremental operations broadcast to the whole room.
    Operations { batch: OperationBatch },

    /// A replica's current awareness record.
    Awareness {
        from: ReplicaId,
        state: AwarenessState,
    },
    /// A replica is withdrawing its awareness record.
    AwarenessLeave { from: ReplicaId },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trips_as_json() {
        let replica = ReplicaId::from_u64(5);
        let msg = WireMessage::SyncRequest {
            from: replica,
            state_vector: StateVector::new(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"SyncRequest\""));

        let back: WireMessage = serde_json::from_str(&json).unwrap();
        match back {
            WireMessage::SyncRequest { from, .. } => assert_eq!(from, replica),
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
