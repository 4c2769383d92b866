//! Messages exchanged over the realtime channel.
//!
//! Every frame is a JSON text frame tagged by `type`. Yrs updates travel
//! as standard base64:
//!
//! ```json
//! {"type":"update","document_id":"...","update":"AQLK..."}
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::ConnectionId;
use crate::models::{Role, VersionSummary};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        document_id: Uuid,
    },
    Leave {
        document_id: Uuid,
    },
    /// A Yrs v1 update made on the client's replica.
    Update {
        document_id: Uuid,
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },
    Cursor {
        document_id: Uuid,
        position: u32,
        #[serde(default)]
        selection_end: Option<u32>,
    },
    SaveVersion {
        document_id: Uuid,
        #[serde(default)]
        label: Option<String>,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// `state` is the full Yrs state; clients build their replica from it.
    Joined {
        document_id: Uuid,
        revision: u64,
        content: String,
        #[serde(with = "base64_bytes")]
        state: Vec<u8>,
        participants: Vec<Participant>,
    },
    ParticipantJoined {
        document_id: Uuid,
        participant: Participant,
    },
    ParticipantLeft {
        document_id: Uuid,
        connection_id: ConnectionId,
        user_id: Uuid,
    },
    /// An update applied by someone else. `revision` is the revision it
    /// produced. `connection_id` is absent for server-side edits such as a
    /// version restore.
    Update {
        document_id: Uuid,
        revision: u64,
        connection_id: Option<ConnectionId>,
        user_id: Uuid,
        #[serde(with = "base64_bytes")]
        update: Vec<u8>,
    },
    /// The sender's own update was applied at `revision`.
    Ack {
        document_id: Uuid,
        revision: u64,
    },
    Cursor {
        document_id: Uuid,
        connection_id: ConnectionId,
        user_id: Uuid,
        position: u32,
        selection_end: Option<u32>,
    },
    VersionSaved {
        document_id: Uuid,
        version: VersionSummary,
    },
    DocumentDeleted {
        document_id: Uuid,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
    },
    Pong,
}

impl ServerMessage {
    pub fn error(message: impl Into<String>, document_id: Option<Uuid>) -> Self {
        Self::Error {
            message: message.into(),
            document_id,
        }
    }
}

/// A connection currently in a document's live session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Participant {
    pub connection_id: ConnectionId,
    pub user_id: Uuid,
    pub name: String,
    pub role: Role,
    pub cursor: Option<Cursor>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
/// Positions are UTF-16 code units into the shared text.
pub struct Cursor {
    pub position: u32,
    pub selection_end: Option<u32>,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<T: AsRef<[u8]>, S: Serializer>(bytes: T, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}
