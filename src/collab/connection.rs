//! One realtime connection: frame dispatch, room forwarding, keep-alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ClientMessage, CollabError, CollabHub, ConnectionId, RoomEvent, ServerMessage};
use crate::models::User;

/// Tracks when a connection was last heard from.
#[derive(Debug)]
pub struct Heartbeat {
    last_seen: Instant,
    timeout: Duration,
}

impl Heartbeat {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_seen: Instant::now(),
            timeout,
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn is_expired(&self) -> bool {
        self.last_seen.elapsed() > self.timeout
    }
}

/// Drive an upgraded socket until it closes, errors or goes silent.
///
/// Every room the connection joined is left on the way out.
pub async fn serve_connection(socket: WebSocket, hub: CollabHub, user: User) {
    let config = hub.config().clone();
    let connection_id: ConnectionId = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    // Bounded, so a slow socket backs up into the room buffer and lags.
    let (tx, mut rx) = mpsc::channel(config.broadcast_capacity.max(1));

    tracing::info!(
        connection_id = %connection_id,
        user_id = %user.id,
        "Realtime connection opened"
    );

    let mut session = Session {
        connection_id,
        user,
        hub,
        tx,
        replies: Vec::new(),
        forwarders: HashMap::new(),
    };
    let mut heartbeat = Heartbeat::new(config.ping_interval + config.ping_timeout);
    let mut ping = tokio::time::interval(config.ping_interval);
    ping.tick().await;

    loop {
        tokio::select! {
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        tracing::debug!(connection_id = %connection_id, "Socket error: {}", e);
                        break;
                    }
                    None => break,
                };
                heartbeat.touch();
                match frame {
                    Message::Text(text) => session.handle_text(text.as_str()).await,
                    Message::Binary(_) => {
                        session.reply(ServerMessage::error("Binary frames are not supported", None))
                    }
                    Message::Close(_) => break,
                    Message::Ping(_) | Message::Pong(_) => {}
                }
                let mut failed = false;
                for message in session.replies.drain(..) {
                    if send_message(&mut sink, &message).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    break;
                }
            }
            Some(message) = rx.recv() => {
                if send_message(&mut sink, &message).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if heartbeat.is_expired() {
                    tracing::info!(connection_id = %connection_id, "Realtime connection timed out");
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    session.close().await;
    let _ = sink.close().await;
    tracing::info!(connection_id = %connection_id, "Realtime connection closed");
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(message) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to encode realtime message: {}", e);
            return Ok(());
        }
    };
    sink.send(Message::Text(text.into())).await
}

struct Session {
    connection_id: ConnectionId,
    user: User,
    hub: CollabHub,
    /// Room events, filled by the forwarders.
    tx: mpsc::Sender<ServerMessage>,
    /// Direct answers to the frame being handled. Written before anything
    /// else is read from `tx`, so a `joined` always precedes the room's
    /// events.
    replies: Vec<ServerMessage>,
    forwarders: HashMap<Uuid, JoinHandle<()>>,
}

impl Session {
    fn reply(&mut self, message: ServerMessage) {
        self.replies.push(message);
    }

    async fn handle_text(&mut self, text: &str) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => self.reply(ServerMessage::error(format!("Invalid message: {e}"), None)),
        }
    }

    async fn handle(&mut self, message: ClientMessage) {
        let connection_id = self.connection_id;
        let (document_id, result) = match message {
            ClientMessage::Join { document_id } => (document_id, self.join(document_id).await),
            ClientMessage::Leave { document_id } => (document_id, self.leave(document_id).await),
            ClientMessage::Update { document_id, update } => {
                // The ack reaches the author through its room forwarder.
                let result = self
                    .hub
                    .submit(connection_id, document_id, update)
                    .await
                    .map(|_| ());
                (document_id, result)
            }
            ClientMessage::Cursor {
                document_id,
                position,
                selection_end,
            } => {
                let result = self
                    .hub
                    .cursor(connection_id, document_id, position, selection_end)
                    .await;
                (document_id, result)
            }
            ClientMessage::SaveVersion { document_id, label } => {
                let result = self
                    .hub
                    .save_version(connection_id, document_id, label)
                    .await
                    .map(|_| ());
                (document_id, result)
            }
            ClientMessage::Ping => {
                self.reply(ServerMessage::Pong);
                return;
            }
        };

        match result {
            Ok(()) => {}
            Err(CollabError::Store(e)) => {
                tracing::error!(document_id = %document_id, "Realtime store error: {:#}", e);
                self.reply(ServerMessage::error("Internal server error", Some(document_id)));
            }
            Err(e) => {
                tracing::debug!(document_id = %document_id, "Rejected realtime message: {}", e);
                self.reply(ServerMessage::error(e.to_string(), Some(document_id)));
            }
        }
    }

    async fn join(&mut self, document_id: Uuid) -> Result<(), CollabError> {
        let joined = self
            .hub
            .join(self.connection_id, &self.user, document_id)
            .await?;
        self.stop_forwarding(document_id).await;

        self.reply(ServerMessage::Joined {
            document_id,
            revision: joined.revision,
            content: joined.content,
            state: joined.state,
            participants: joined.participants,
        });
        let forwarder = tokio::spawn(forward_events(
            document_id,
            self.connection_id,
            joined.events,
            self.tx.clone(),
        ));
        self.forwarders.insert(document_id, forwarder);
        Ok(())
    }

    async fn leave(&mut self, document_id: Uuid) -> Result<(), CollabError> {
        self.stop_forwarding(document_id).await;
        self.hub.leave(self.connection_id, document_id).await?;
        Ok(())
    }

    /// Stop relaying a room. Waits for the forwarder so nothing it held
    /// arrives after what is sent next.
    async fn stop_forwarding(&mut self, document_id: Uuid) {
        if let Some(forwarder) = self.forwarders.remove(&document_id) {
            forwarder.abort();
            let _ = forwarder.await;
        }
    }

    async fn close(mut self) {
        let documents: Vec<Uuid> = self.forwarders.keys().copied().collect();
        for document_id in documents {
            if let Err(e) = self.leave(document_id).await {
                tracing::warn!(document_id = %document_id, "Failed to leave room: {}", e);
            }
        }
    }
}

/// Relay a room's events to one connection.
///
/// The connection's own updates come back as acks; its other events are
/// not echoed. Sending waits for room in the connection's queue, so a
/// consumer that cannot keep up falls behind the room's buffer, is told to
/// re-join and stops receiving.
async fn forward_events(
    document_id: Uuid,
    connection_id: ConnectionId,
    mut events: broadcast::Receiver<Arc<RoomEvent>>,
    tx: mpsc::Sender<ServerMessage>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(
                    connection_id = %connection_id,
                    document_id = %document_id,
                    "Connection fell {} events behind",
                    missed
                );
                let _ = tx
                    .send(ServerMessage::error(
                        format!("Missed {missed} updates; re-join the document"),
                        Some(document_id),
                    ))
                    .await;
                return;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };

        let own = event.origin == Some(connection_id);
        let message = match &event.message {
            ServerMessage::Update { revision, .. } if own => ServerMessage::Ack {
                document_id,
                revision: *revision,
            },
            _ if own => continue,
            other => other.clone(),
        };

        let deleted = matches!(message, ServerMessage::DocumentDeleted { .. });
        if tx.send(message).await.is_err() || deleted {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(origin: Option<ConnectionId>, message: ServerMessage) -> Arc<RoomEvent> {
        Arc::new(RoomEvent { origin, message })
    }

    fn update_message(document_id: Uuid, revision: u64, connection_id: ConnectionId) -> ServerMessage {
        ServerMessage::Update {
            document_id,
            revision,
            connection_id: Some(connection_id),
            user_id: Uuid::new_v4(),
            update: vec![0, 0],
        }
    }

    #[test]
    fn heartbeat_expires_after_silence() {
        let mut heartbeat = Heartbeat::new(Duration::from_millis(20));
        assert!(!heartbeat.is_expired());
        std::thread::sleep(Duration::from_millis(40));
        assert!(heartbeat.is_expired());
        heartbeat.touch();
        assert!(!heartbeat.is_expired());
    }

    #[tokio::test]
    async fn own_updates_become_acks_and_others_pass_through() {
        let document_id = Uuid::new_v4();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let (events, rx) = broadcast::channel(16);
        let (tx, mut out) = mpsc::channel(16);
        let forwarder = tokio::spawn(forward_events(document_id, me, rx, tx));

        events.send(event(Some(other), update_message(document_id, 1, other))).unwrap();
        events.send(event(Some(me), update_message(document_id, 2, me))).unwrap();
        events
            .send(event(
                Some(me),
                ServerMessage::ParticipantLeft {
                    document_id,
                    connection_id: me,
                    user_id: Uuid::new_v4(),
                },
            ))
            .unwrap();
        events.send(event(None, ServerMessage::DocumentDeleted { document_id })).unwrap();

        assert!(matches!(out.recv().await, Some(ServerMessage::Update { revision: 1, .. })));
        assert_eq!(out.recv().await, Some(ServerMessage::Ack { document_id, revision: 2 }));
        assert_eq!(out.recv().await, Some(ServerMessage::DocumentDeleted { document_id }));
        forwarder.await.unwrap();
    }

    #[tokio::test]
    async fn lagging_consumer_is_told_to_rejoin() {
        let document_id = Uuid::new_v4();
        let (events, rx) = broadcast::channel(1);
        let (tx, mut out) = mpsc::channel(4);

        for revision in 1..=3 {
            let message = update_message(document_id, revision, Uuid::new_v4());
            events.send(event(None, message)).unwrap();
        }
        forward_events(document_id, Uuid::new_v4(), rx, tx).await;

        let Some(ServerMessage::Error { message, document_id: Some(id) }) = out.recv().await else {
            panic!("expected a lag error");
        };
        assert_eq!(id, document_id);
        assert!(message.contains("re-join"));
    }

    #[tokio::test]
    async fn stalled_socket_makes_the_forwarder_lag() {
        let document_id = Uuid::new_v4();
        let (events, rx) = broadcast::channel(4);
        let (tx, mut out) = mpsc::channel(2);
        let forwarder = tokio::spawn(forward_events(document_id, Uuid::new_v4(), rx, tx));

        // Nobody drains `out` while the room keeps publishing.
        for revision in 1..=50 {
            let message = update_message(document_id, revision, Uuid::new_v4());
            events.send(event(None, message)).unwrap();
            tokio::task::yield_now().await;
        }

        let mut received = Vec::new();
        while let Some(message) = out.recv().await {
            received.push(message);
        }
        forwarder.await.unwrap();

        assert!(received.len() < 50);
        assert!(matches!(
            received.last(),
            Some(ServerMessage::Error { message, .. }) if message.contains("re-join")
        ));
    }
}
