use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use super::room::{Room, RoomEvent, RoomState};
use super::{CollabError, ConnectionId, Participant, ServerMessage};
use crate::config::RealtimeConfig;
use crate::db::{Database, StoreError};
use crate::models::{NewVersion, Role, User, Version, VersionSummary};

/// Everything a connection needs after joining a room.
#[derive(Debug)]
pub struct JoinedRoom {
    pub role: Role,
    pub revision: u64,
    pub content: String,
    /// Full Yrs state for the joiner's replica.
    pub state: Vec<u8>,
    pub participants: Vec<Participant>,
    pub events: broadcast::Receiver<Arc<RoomEvent>>,
}

/// Content and revision of a live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveState {
    pub content: String,
    pub revision: u64,
}

/// Registry of live rooms. Cheap to clone.
///
/// Lock order: a room's state, then the room map. The map lock is never
/// held across an await.
#[derive(Clone)]
pub struct CollabHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    db: Database,
    config: RealtimeConfig,
    rooms: Mutex<HashMap<Uuid, Arc<Room>>>,
}

impl CollabHub {
    pub fn new(db: Database, config: RealtimeConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                db,
                config,
                rooms: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.inner.config
    }

    fn db(&self) -> &Database {
        &self.inner.db
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<Room>>> {
        self.inner.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn room(&self, document_id: Uuid) -> Option<Arc<Room>> {
        self.rooms().get(&document_id).cloned()
    }

    /// Get the live room, loading it from the store if needed.
    ///
    /// Loading happens under the map lock so a room is never built from
    /// content an earlier room has not finished writing back.
    fn get_or_load(&self, document_id: Uuid) -> Result<Arc<Room>, CollabError> {
        let mut rooms = self.rooms();
        if let Some(room) = rooms.get(&document_id) {
            return Ok(room.clone());
        }

        let document = self
            .db()
            .get_document(document_id)?
            .ok_or(CollabError::DocumentNotFound)?;
        let last_snapshot = self
            .db()
            .get_latest_version_revision(document_id)?
            .unwrap_or(0);

        let state = RoomState::new(&document.content, document.revision, last_snapshot);
        let room = Arc::new(Room::new(
            document_id,
            state,
            self.inner.config.broadcast_capacity,
        ));
        rooms.insert(document_id, room.clone());
        tracing::debug!("Opened room for document {}", document_id);
        Ok(room)
    }

    fn remove_room(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms();
        if rooms
            .get(&room.document_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&room.document_id);
        }
    }

    // ============================================================
    // Participation
    // ============================================================

    /// Add a connection to a document's live session.
    ///
    /// Joining a document the connection is already in returns the current
    /// state with a fresh event subscription.
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        user: &User,
        document_id: Uuid,
    ) -> Result<JoinedRoom, CollabError> {
        let role = match self.db().get_document_role(document_id, user.id) {
            Ok(Some(role)) => role,
            Ok(None) => return Err(CollabError::AccessDenied),
            Err(e) => return Err(store_error(e)),
        };

        loop {
            let room = self.get_or_load(document_id)?;
            let mut state = room.state.lock().await;
            if state.closed {
                continue;
            }

            if !state.is_member(connection_id) {
                let participant = Participant {
                    connection_id,
                    user_id: user.id,
                    name: user.name.clone(),
                    role,
                    cursor: None,
                };
                state.add_participant(participant.clone());
                room.publish(
                    Some(connection_id),
                    ServerMessage::ParticipantJoined {
                        document_id,
                        participant,
                    },
                );
                tracing::info!(
                    document_id = %document_id,
                    user_id = %user.id,
                    participants = state.participant_count(),
                    "Participant joined"
                );
            }
            // After our own announcement, so the joiner does not hear it.
            let events = room.subscribe();

            return Ok(JoinedRoom {
                role,
                revision: state.revision,
                content: state.content(),
                state: state.text.encode_state(),
                participants: state.participants(),
                events,
            });
        }
    }

    /// Remove a connection from a session. Returns false if it was not in it.
    ///
    /// The last participant out writes the room back, snapshots unsaved
    /// changes and closes it.
    pub async fn leave(&self, connection_id: ConnectionId, document_id: Uuid) -> Result<bool, CollabError> {
        let Some(room) = self.room(document_id) else {
            return Ok(false);
        };
        let mut state = room.state.lock().await;
        let Some(participant) = state.remove_participant(connection_id) else {
            return Ok(false);
        };

        room.publish(
            Some(connection_id),
            ServerMessage::ParticipantLeft {
                document_id,
                connection_id,
                user_id: participant.user_id,
            },
        );
        tracing::info!(
            document_id = %document_id,
            user_id = %participant.user_id,
            participants = state.participant_count(),
            "Participant left"
        );

        if state.participant_count() == 0 {
            self.retire(&room, &mut state)?;
        }
        Ok(true)
    }

    fn retire(&self, room: &Arc<Room>, state: &mut RoomState) -> Result<(), CollabError> {
        self.flush_locked(room.document_id, state)?;
        if state.has_unsnapshotted_changes() {
            let label = format!("Session ended at revision {}", state.revision);
            self.snapshot_locked(room, state, Some(label), None)?;
        }
        state.closed = true;
        self.remove_room(room);
        tracing::debug!("Closed room for document {}", room.document_id);
        Ok(())
    }

    pub async fn participants(&self, document_id: Uuid) -> Vec<Participant> {
        let Some(room) = self.room(document_id) else {
            return Vec::new();
        };
        let state = room.state.lock().await;
        if state.closed {
            return Vec::new();
        }
        state.participants()
    }

    /// Content and revision of the live session, if one is open.
    pub async fn live_state(&self, document_id: Uuid) -> Option<LiveState> {
        let room = self.room(document_id)?;
        let state = room.state.lock().await;
        if state.closed {
            return None;
        }
        Some(LiveState {
            content: state.content(),
            revision: state.revision,
        })
    }

    // ============================================================
    // Editing
    // ============================================================

    /// Merge a participant's update. Returns the revision it produced.
    pub async fn submit(
        &self,
        connection_id: ConnectionId,
        document_id: Uuid,
        update: Vec<u8>,
    ) -> Result<u64, CollabError> {
        let room = self.room(document_id).ok_or(CollabError::NotJoined)?;
        let mut state = room.state.lock().await;
        let participant = state
            .participant(connection_id)
            .ok_or(CollabError::NotJoined)?;
        if !participant.role.can_edit() {
            return Err(CollabError::ReadOnly);
        }
        let user_id = participant.user_id;

        state.apply_update(&update)?;
        room.publish(
            Some(connection_id),
            ServerMessage::Update {
                document_id,
                revision: state.revision,
                connection_id: Some(connection_id),
                user_id,
                update,
            },
        );

        if state.revision - state.last_snapshot_revision >= self.inner.config.snapshot_every {
            let label = format!("Auto-save at revision {}", state.revision);
            if let Err(e) = self.snapshot_locked(&room, &mut state, Some(label), None) {
                tracing::warn!("Automatic snapshot of {} failed: {:#}", document_id, e);
            }
        }

        Ok(state.revision)
    }

    pub async fn cursor(
        &self,
        connection_id: ConnectionId,
        document_id: Uuid,
        position: u32,
        selection_end: Option<u32>,
    ) -> Result<(), CollabError> {
        let room = self.room(document_id).ok_or(CollabError::NotJoined)?;
        let mut state = room.state.lock().await;
        let user_id = state
            .participant(connection_id)
            .ok_or(CollabError::NotJoined)?
            .user_id;

        let cursor = state.set_cursor(connection_id, position, selection_end);
        room.publish(
            Some(connection_id),
            ServerMessage::Cursor {
                document_id,
                connection_id,
                user_id,
                position: cursor.position,
                selection_end: cursor.selection_end,
            },
        );
        Ok(())
    }

    /// Back up the current content under `label`, then replace it with
    /// `content` as a new revision. Both happen under one lock, so no edit
    /// can land between the backup and the replacement.
    ///
    /// Live participants receive the change as an ordinary update.
    pub async fn restore(
        &self,
        document_id: Uuid,
        content: &str,
        label: String,
        author_id: Uuid,
    ) -> Result<(Version, LiveState), CollabError> {
        loop {
            let room = {
                let rooms = self.rooms();
                match rooms.get(&document_id) {
                    Some(room) => room.clone(),
                    // Holding the map keeps a room from loading mid-restore.
                    None => return self.restore_stored(document_id, content, label, author_id),
                }
            };

            let mut state = room.state.lock().await;
            if state.closed {
                continue;
            }

            let backup = self.snapshot_locked(&room, &mut state, Some(label), Some(author_id))?;
            if let Some(update) = state.replace(content) {
                room.publish(
                    None,
                    ServerMessage::Update {
                        document_id,
                        revision: state.revision,
                        connection_id: None,
                        user_id: author_id,
                        update,
                    },
                );
            }
            self.flush_locked(document_id, &mut state)?;

            let live = LiveState {
                content: state.content(),
                revision: state.revision,
            };
            return Ok((backup, live));
        }
    }

    fn restore_stored(
        &self,
        document_id: Uuid,
        content: &str,
        label: String,
        author_id: Uuid,
    ) -> Result<(Version, LiveState), CollabError> {
        let document = self
            .db()
            .get_document(document_id)?
            .ok_or(CollabError::DocumentNotFound)?;
        let backup = self.db().create_version(NewVersion {
            document_id,
            label: Some(label),
            content: document.content.clone(),
            revision: document.revision,
            author_id: Some(author_id),
        })?;
        if document.content == content {
            let live = LiveState {
                content: document.content,
                revision: document.revision,
            };
            return Ok((backup, live));
        }

        let revision = document.revision + 1;
        self.db()
            .save_document_content(document_id, content, revision)?;
        let live = LiveState {
            content: content.to_string(),
            revision,
        };
        Ok((backup, live))
    }

    /// Drop a deleted document's session without writing it back.
    pub async fn close_document(&self, document_id: Uuid) {
        let room = self.rooms().remove(&document_id);
        let Some(room) = room else {
            return;
        };

        let mut state = room.state.lock().await;
        state.closed = true;
        state.dirty = false;
        state.clear_participants();
        room.publish(None, ServerMessage::DocumentDeleted { document_id });
        tracing::info!("Closed live session of deleted document {}", document_id);
    }

    // ============================================================
    // Versions
    // ============================================================

    /// Snapshot the current content, reading through a live session.
    pub async fn snapshot_now(
        &self,
        document_id: Uuid,
        label: Option<String>,
        author_id: Option<Uuid>,
    ) -> Result<Version, CollabError> {
        if let Some(room) = self.room(document_id) {
            let mut state = room.state.lock().await;
            if !state.closed {
                return Ok(self.snapshot_locked(&room, &mut state, label, author_id)?);
            }
        }

        let document = self
            .db()
            .get_document(document_id)?
            .ok_or(CollabError::DocumentNotFound)?;
        let version = self.db().create_version(NewVersion {
            document_id,
            label,
            content: document.content,
            revision: document.revision,
            author_id,
        })?;
        Ok(version)
    }

    /// Snapshot on behalf of a participant.
    pub async fn save_version(
        &self,
        connection_id: ConnectionId,
        document_id: Uuid,
        label: Option<String>,
    ) -> Result<Version, CollabError> {
        let room = self.room(document_id).ok_or(CollabError::NotJoined)?;
        let mut state = room.state.lock().await;
        let participant = state
            .participant(connection_id)
            .ok_or(CollabError::NotJoined)?;
        if !participant.role.can_edit() {
            return Err(CollabError::ReadOnly);
        }
        let author_id = participant.user_id;

        Ok(self.snapshot_locked(&room, &mut state, label, Some(author_id))?)
    }

    fn snapshot_locked(
        &self,
        room: &Room,
        state: &mut RoomState,
        label: Option<String>,
        author_id: Option<Uuid>,
    ) -> anyhow::Result<Version> {
        self.flush_locked(room.document_id, state)?;
        let version = self.db().create_version(NewVersion {
            document_id: room.document_id,
            label,
            content: state.content(),
            revision: state.revision,
            author_id,
        })?;
        state.last_snapshot_revision = state.revision;

        room.publish(
            None,
            ServerMessage::VersionSaved {
                document_id: room.document_id,
                version: VersionSummary::from(&version),
            },
        );
        tracing::debug!(
            "Saved version {} of {} at revision {}",
            version.number,
            room.document_id,
            version.revision
        );
        Ok(version)
    }

    // ============================================================
    // Persistence
    // ============================================================

    fn flush_locked(&self, document_id: Uuid, state: &mut RoomState) -> anyhow::Result<()> {
        if !state.dirty {
            return Ok(());
        }
        if !self
            .db()
            .save_document_content(document_id, &state.content(), state.revision)?
        {
            tracing::warn!("Document {} was deleted before it could be saved", document_id);
        }
        state.dirty = false;
        Ok(())
    }

    /// Write every dirty room back to the store. Returns how many were
    /// written.
    ///
    /// Rooms left empty by a failed close are retried here.
    pub async fn flush_dirty(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms().values().cloned().collect();
        let mut flushed = 0;

        for room in rooms {
            let mut state = room.state.lock().await;
            if state.closed {
                continue;
            }
            if state.participant_count() == 0 {
                if let Err(e) = self.retire(&room, &mut state) {
                    tracing::error!("Failed to close room {}: {:#}", room.document_id, e);
                }
                continue;
            }
            if state.dirty {
                match self.flush_locked(room.document_id, &mut state) {
                    Ok(()) => flushed += 1,
                    Err(e) => tracing::error!("Failed to save document {}: {:#}", room.document_id, e),
                }
            }
        }

        flushed
    }

    /// Flush dirty rooms every `flush_interval`. Runs until aborted.
    pub async fn run_flusher(self) {
        let mut interval = tokio::time::interval(self.inner.config.flush_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let flushed = self.flush_dirty().await;
            if flushed > 0 {
                tracing::debug!("Flushed {} documents", flushed);
            }
        }
    }

    /// Write back and close every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<Room>> = self.rooms().drain().map(|(_, room)| room).collect();
        for room in rooms {
            let mut state = room.state.lock().await;
            if let Err(e) = self.flush_locked(room.document_id, &mut state) {
                tracing::error!("Failed to save document {} on shutdown: {:#}", room.document_id, e);
            }
            state.closed = true;
        }
    }
}

fn store_error(err: anyhow::Error) -> CollabError {
    match err.downcast_ref::<StoreError>() {
        Some(StoreError::NotFound(_)) => CollabError::DocumentNotFound,
        _ => CollabError::Store(err),
    }
}
