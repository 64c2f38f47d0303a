//! WebSocket transport
//!
//! Connects to a collaboration server speaking the room protocol as
//! JSON text frames: one socket per room, `Join` out, `Hello` back,
//! then free-form frame exchange until either side closes.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use crate::protocol::WireMessage;
use crate::room::RoomId;
use crate::transport::{Joined, RoomTransport, TransportError, TransportEvent};
use crdt::ReplicaId;

/// WebSocket room transport.
pub struct WsTransport {
    base_url: String,
}

impl WsTransport {
    /// `base_url` is the server root, e.g. `ws://host:port/rooms`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn room_url(&self, room: &RoomId) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), room)
    }
}

#[async_trait]
impl RoomTransport for WsTransport {
    async fn join(&self, room: &RoomId, replica: ReplicaId) -> Result<Joined, TransportError> {
        let url = self.room_url(room);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let join = serde_json::to_string(&WireMessage::Join { replica })
            .map_err(|err| TransportError::Protocol(err.to_string()))?;
        write
            .send(WsMessage::Text(join))
            .await
            .map_err(|err| TransportError::Connect(err.to_string()))?;

        // The server's first frame is the room roster.
        let peers = loop {
            match read.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<WireMessage>(&text) {
                        Ok(WireMessage::Hello { peers }) => break peers,
                        Ok(other) => {
                            return Err(TransportError::Protocol(format!(
                                "expected hello, got {other:?}"
                            )));
                        }
                        Err(err) => return Err(TransportError::Protocol(err.to_string())),
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(err)) => return Err(TransportError::Connect(err.to_string())),
                None => return Err(TransportError::Closed),
            }
        };

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WireMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer task: serialize outgoing frames onto the socket.
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match serde_json::to_string(&msg) {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(%err, "failed to encode frame");
                        continue;
                    }
                };
                if write.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = write.send(WsMessage::Close(None)).await;
        });

        // Reader task: decode frames into transport events.
        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(text)) => match serde_json::from_str::<WireMessage>(&text) {
                        Ok(WireMessage::PeerJoined { replica }) => TransportEvent::PeerJoined(replica),
                        Ok(WireMessage::PeerLeft { replica }) => TransportEvent::PeerLeft(replica),
                        Ok(msg) => TransportEvent::Message(msg),
                        Err(err) => {
                            tracing::warn!(%err, "dropping undecodable frame");
                            continue;
                        }
                    },
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                if event_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = event_tx.send(TransportEvent::ConnectionLost);
        });

        tracing::debug!(%url, %replica, "joined room over websocket");
        Ok(Joined {
            peers,
            outgoing: out_tx,
            incoming: event_rx,
        })
    }
}
