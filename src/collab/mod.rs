//! Realtime collaboration.
//!
//! Each document with at least one connected participant has a live room
//! holding the authoritative shared text and revision. Clients send Yrs
//! updates made on their replicas; the room merges each one, assigns the
//! next revision and relays it to everyone else. Rooms write back to the
//! store periodically and when they empty.

mod connection;
mod hub;
mod protocol;
mod room;
mod text;

use thiserror::Error;
use uuid::Uuid;

pub use connection::{serve_connection, Heartbeat};
pub use hub::{CollabHub, JoinedRoom, LiveState};
pub use protocol::{ClientMessage, Cursor, Participant, ServerMessage};
pub use room::RoomEvent;
pub use text::{SharedText, TEXT_NAME};

/// Identifies one realtime connection. A user may hold several.
pub type ConnectionId = Uuid;

#[derive(Debug, Error)]
pub enum CollabError {
    #[error("Document not found")]
    DocumentNotFound,
    #[error("You do not have access to this document")]
    AccessDenied,
    #[error("Join the document first")]
    NotJoined,
    #[error("You have read-only access to this document")]
    ReadOnly,
    #[error("Invalid update: {0}")]
    InvalidUpdate(String),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}
