use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use uuid::Uuid;
use yrs::StickyIndex;

use super::{CollabError, ConnectionId, Cursor, Participant, ServerMessage, SharedText};

/// A message published to a room, with the connection that caused it.
#[derive(Debug)]
pub struct RoomEvent {
    pub origin: Option<ConnectionId>,
    pub message: ServerMessage,
}

/// The live session of one document.
pub(crate) struct Room {
    pub document_id: Uuid,
    pub state: Mutex<RoomState>,
    events: broadcast::Sender<Arc<RoomEvent>>,
}

impl Room {
    pub fn new(document_id: Uuid, state: RoomState, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            document_id,
            state: Mutex::new(state),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RoomEvent>> {
        self.events.subscribe()
    }

    pub fn publish(&self, origin: Option<ConnectionId>, message: ServerMessage) {
        // No receivers is fine: the room may be empty.
        let _ = self.events.send(Arc::new(RoomEvent { origin, message }));
    }
}

struct CursorAnchor {
    position: StickyIndex,
    selection_end: Option<StickyIndex>,
}

pub(crate) struct RoomState {
    pub text: SharedText,
    pub revision: u64,
    participants: BTreeMap<ConnectionId, Participant>,
    cursors: HashMap<ConnectionId, CursorAnchor>,
    /// Content has changed since the last write to the store.
    pub dirty: bool,
    pub last_snapshot_revision: u64,
    /// Set once the room is removed from the hub; joiners must retry.
    pub closed: bool,
}

impl RoomState {
    pub fn new(content: &str, revision: u64, last_snapshot_revision: u64) -> Self {
        Self {
            text: SharedText::new(content),
            revision,
            participants: BTreeMap::new(),
            cursors: HashMap::new(),
            dirty: false,
            last_snapshot_revision,
            closed: false,
        }
    }

    pub fn content(&self) -> String {
        self.text.content()
    }

    /// Merge a participant's update as the next revision.
    pub fn apply_update(&mut self, update: &[u8]) -> Result<(), CollabError> {
        self.text.apply_update(update)?;
        self.revision += 1;
        self.dirty = true;
        Ok(())
    }

    /// Replace the whole text as the next revision. Returns the update to
    /// relay, or `None` when the text already matches.
    pub fn replace(&mut self, content: &str) -> Option<Vec<u8>> {
        let update = self.text.replace(content)?;
        self.revision += 1;
        self.dirty = true;
        Some(update)
    }

    pub fn is_member(&self, connection_id: ConnectionId) -> bool {
        self.participants.contains_key(&connection_id)
    }

    pub fn participant(&self, connection_id: ConnectionId) -> Option<&Participant> {
        self.participants.get(&connection_id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn add_participant(&mut self, participant: Participant) {
        self.participants.insert(participant.connection_id, participant);
    }

    pub fn remove_participant(&mut self, connection_id: ConnectionId) -> Option<Participant> {
        self.cursors.remove(&connection_id);
        self.participants.remove(&connection_id)
    }

    pub fn clear_participants(&mut self) {
        self.cursors.clear();
        self.participants.clear();
    }

    /// Everyone in the room, with cursors resolved against the current text.
    pub fn participants(&self) -> Vec<Participant> {
        self.participants
            .values()
            .map(|participant| Participant {
                cursor: self.cursor(participant.connection_id),
                ..participant.clone()
            })
            .collect()
    }

    /// Record a cursor clamped to the text and anchored so it follows later
    /// edits. Returns the clamped cursor.
    pub fn set_cursor(&mut self, connection_id: ConnectionId, position: u32, selection_end: Option<u32>) -> Cursor {
        let len = self.text.len();
        let cursor = Cursor {
            position: position.min(len),
            selection_end: selection_end.map(|end| end.min(len)),
        };
        if let Some(position) = self.text.anchor(cursor.position) {
            let selection_end = cursor.selection_end.and_then(|end| self.text.anchor(end));
            self.cursors.insert(connection_id, CursorAnchor { position, selection_end });
        }
        cursor
    }

    pub fn cursor(&self, connection_id: ConnectionId) -> Option<Cursor> {
        let anchor = self.cursors.get(&connection_id)?;
        Some(Cursor {
            position: self.text.resolve(&anchor.position)?,
            selection_end: anchor
                .selection_end
                .as_ref()
                .and_then(|end| self.text.resolve(end)),
        })
    }

    pub fn has_unsnapshotted_changes(&self) -> bool {
        self.revision > self.last_snapshot_revision
    }
}
