//! # Coscribe Collaboration
//!
//! Real-time multi-user editing over replicated documents:
//! - a per-document session channel exchanging CRDT operations
//! - awareness (cursors, online users) layered on the same room
//! - room naming derived from (project, branch, file)
//! - pluggable transports (in-process hub, WebSocket)

pub mod awareness;
pub mod protocol;
pub mod room;
pub mod session;
pub mod transport;
pub mod ws;

pub use awareness::{AwarenessChannel, AwarenessMap, AwarenessState, CursorPosition, Selection};
pub use protocol::WireMessage;
pub use room::RoomId;
pub use session::{SessionChannel, SessionError, SessionEvent, SessionState};
pub use transport::{Joined, LocalHub, RoomTransport, TransportError, TransportEvent};
pub use ws::WsTransport;

use serde::{Deserialize, Serialize};

use crdt::ReplicaId;

/// Local user identity, supplied by the host application.
#[derive(Debug, Clone)]
pub struct User {
    pub name: String,
    pub email: Option<String>,
    /// Preferred color; generated from the replica id if absent.
    pub color: Option<UserColor>,
}

impl User {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: None,
            color: None,
        }
    }

    /// The color to advertise for the given replica.
    pub fn color_for(&self, replica: ReplicaId) -> UserColor {
        self.color.unwrap_or_else(|| UserColor::from_replica(replica))
    }
}

/// A participant's assigned color (for cursor and selection highlights).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl UserColor {
    /// Derive a stable, pleasant color from a replica id.
    pub fn from_replica(replica: ReplicaId) -> Self {
        let bytes = replica.value().to_le_bytes();
        let hue = ((bytes[0] as u16 * 256 + bytes[1] as u16) % 360) as f32;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.5);
        Self { r, g, b }
    }

    /// Pick from a fixed palette by participant index.
    pub fn from_index(index: usize) -> Self {
        const COLORS: [(u8, u8, u8); 10] = [
            (66, 133, 244),  // Blue
            (234, 67, 53),   // Red
            (251, 188, 4),   // Yellow
            (52, 168, 83),   // Green
            (156, 39, 176),  // Purple
            (255, 87, 34),   // Orange
            (0, 188, 212),   // Cyan
            (233, 30, 99),   // Pink
            (63, 81, 181),   // Indigo
            (139, 195, 74),  // Light Green
        ];
        let (r, g, b) = COLORS[index % COLORS.len()];
        Self { r, g, b }
    }

    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }

    pub fn to_rgba(&self, alpha: f32) -> String {
        format!("rgba({}, {}, {}, {})", self.r, self.g, self.b, alpha)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (u8, u8, u8) {
    let c = (1.0 - (2.0 * l - 1.0).abs()) * s;
    let x = c * (1.0 - ((h / 60.0) % 2.0 - 1.0).abs());
    let m = l - c / 2.0;

    let (r, g, b) = match (h as u32) / 60 {
        0 => (c, x, 0.0),
        1 => (x, c, 0.0),
        2 => (0.0, c, x),
        3 => (0.0, x, c),
        4 => (x, 0.0, c),
        _ => (c, 0.0, x),
    };

    (
        ((r + m) * 255.0) as u8,
        ((g + m) * 255.0) as u8,
        ((b + m) * 255.0) as u8,
    )
}
