//! WebSocket log viewer endpoint and connection management.
//!
//! Each connection runs one reader loop (the handler task), one writer task
//! draining a bounded outbound queue, and one forwarder task per
//! subscription. Forwarders never touch the socket directly.

use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use buildcast_broker::Subscription;
use buildcast_types::LogPayload;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, net::SocketAddr, sync::Arc};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinSet;
use uuid::Uuid;

/// Capacity of a connection's outbound queue. Forwarders wait for room
/// rather than dropping, so a slow viewer backs up into its own broker
/// subscriptions and nowhere else.
pub const OUTBOUND_CAPACITY: usize = 256;

/// Incoming WebSocket request.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum IncomingMessage {
    Subscribe { channel: String },
}

impl IncomingMessage {
    /// Parses a text frame. Anything that is not a well-formed request with
    /// a non-empty channel yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str::<IncomingMessage>(text).ok()? {
            IncomingMessage::Subscribe { channel } if channel.is_empty() => None,
            request => Some(request),
        }
    }
}

/// Outgoing WebSocket frame: `{"message": "..."}`.
#[derive(Debug, Serialize)]
pub struct OutgoingMessage<'a> {
    pub message: &'a str,
}

impl OutgoingMessage<'_> {
    fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(json) => Some(json),
            Err(e) => {
                tracing::error!("failed to serialize WebSocket message: {}", e);
                None
            }
        }
    }
}

/// Lifecycle of one subscription on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Broker subscription being opened, no acknowledgement sent yet.
    Pending,
    /// Acknowledged; the forwarder is delivering.
    Active,
    /// Forwarder stopping; the broker subscription is being released.
    Draining,
    /// Released. Closed sessions are removed from the manager.
    Closed,
}

/// Result of [`ConnectionManager::open_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOpen {
    /// A new session was registered in the `Pending` state.
    New(Uuid),
    /// The connection already has a live session for this pattern.
    Existing(Uuid),
}

#[derive(Debug)]
struct SessionEntry {
    pattern: String,
    status: SessionStatus,
}

#[derive(Debug)]
struct ConnectionEntry {
    remote_addr: SocketAddr,
    sessions: HashMap<Uuid, SessionEntry>,
}

/// Tracks live viewer connections and their subscription sessions.
///
/// Used for supervision and reporting only; delivery never goes through it.
#[derive(Clone, Default)]
pub struct ConnectionManager {
    connections: Arc<RwLock<HashMap<Uuid, ConnectionEntry>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection and returns its id.
    pub async fn add_connection(&self, remote_addr: SocketAddr) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.connections.write().await.insert(
            connection_id,
            ConnectionEntry {
                remote_addr,
                sessions: HashMap::new(),
            },
        );
        connection_id
    }

    /// Forgets a connection and all of its sessions.
    ///
    /// Returns how many sessions were still registered.
    pub async fn remove_connection(&self, connection_id: Uuid) -> usize {
        self.connections
            .write()
            .await
            .remove(&connection_id)
            .map(|entry| entry.sessions.len())
            .unwrap_or(0)
    }

    /// Registers a session for `pattern` unless the connection already has
    /// a live one for the same pattern.
    ///
    /// Returns `None` if the connection is unknown.
    pub async fn open_session(&self, connection_id: Uuid, pattern: &str) -> Option<SessionOpen> {
        let mut connections = self.connections.write().await;
        let connection = connections.get_mut(&connection_id)?;

        let existing = connection.sessions.iter().find(|(_, session)| {
            session.pattern == pattern
                && matches!(session.status, SessionStatus::Pending | SessionStatus::Active)
        });
        if let Some((session_id, _)) = existing {
            return Some(SessionOpen::Existing(*session_id));
        }

        let session_id = Uuid::new_v4();
        connection.sessions.insert(
            session_id,
            SessionEntry {
                pattern: pattern.to_string(),
                status: SessionStatus::Pending,
            },
        );
        Some(SessionOpen::New(session_id))
    }

    /// Moves a session to `status`. `Closed` removes it.
    pub async fn set_status(&self, connection_id: Uuid, session_id: Uuid, status: SessionStatus) {
        let mut connections = self.connections.write().await;
        let Some(connection) = connections.get_mut(&connection_id) else {
            return;
        };
        if status == SessionStatus::Closed {
            connection.sessions.remove(&session_id);
        } else if let Some(session) = connection.sessions.get_mut(&session_id) {
            session.status = status;
        }
    }

    pub async fn session_status(&self, connection_id: Uuid, session_id: Uuid) -> Option<SessionStatus> {
        self.connections
            .read()
            .await
            .get(&connection_id)?
            .sessions
            .get(&session_id)
            .map(|session| session.status)
    }

    /// Patterns a connection is subscribed to, sorted.
    pub async fn patterns(&self, connection_id: Uuid) -> Vec<String> {
        let connections = self.connections.read().await;
        let mut patterns: Vec<String> = connections
            .get(&connection_id)
            .map(|c| c.sessions.values().map(|s| s.pattern.clone()).collect())
            .unwrap_or_default();
        patterns.sort();
        patterns
    }

    pub async fn remote_addr(&self, connection_id: Uuid) -> Option<SocketAddr> {
        self.connections
            .read()
            .await
            .get(&connection_id)
            .map(|c| c.remote_addr)
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Number of sessions that are pending or active across all connections.
    pub async fn session_count(&self) -> usize {
        self.connections
            .read()
            .await
            .values()
            .flat_map(|c| c.sessions.values())
            .filter(|s| matches!(s.status, SessionStatus::Pending | SessionStatus::Active))
            .count()
    }
}

/// WebSocket handler for `GET /ws`.
pub async fn ws_handler(
    Extension(state): Extension<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let connection_id = state.connections.add_connection(addr).await;
    tracing::info!(connection_id = %connection_id, remote_addr = %addr, "viewer connected");

    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);

    // Single writer for the socket.
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    let mut forwarders: JoinSet<Uuid> = JoinSet::new();

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match IncomingMessage::parse(text.as_str()) {
                    Some(IncomingMessage::Subscribe { channel }) => {
                        subscribe(&state, connection_id, channel, &tx, &mut forwarders).await;
                    }
                    None => {
                        tracing::debug!(connection_id = %connection_id, "ignoring malformed request");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection_id, "WebSocket read failed: {}", e);
                    break;
                }
            },
            Some(joined) = forwarders.join_next(), if !forwarders.is_empty() => {
                match joined {
                    Ok(session_id) => {
                        state
                            .connections
                            .set_status(connection_id, session_id, SessionStatus::Closed)
                            .await;
                    }
                    Err(e) => tracing::warn!(connection_id = %connection_id, "forwarder task failed: {}", e),
                }
            }
            () = tx.closed() => {
                tracing::debug!(connection_id = %connection_id, "WebSocket write failed");
                break;
            }
        }
    }

    // Teardown: forwarders first so their subscriptions are released, then
    // the writer.
    forwarders.shutdown().await;
    drop(tx);
    send_task.abort();
    let _ = send_task.await;

    let sessions = state.connections.remove_connection(connection_id).await;
    tracing::info!(
        connection_id = %connection_id,
        remote_addr = %addr,
        sessions,
        "viewer disconnected"
    );
}

/// Handles one subscribe request.
///
/// The acknowledgement is queued before the forwarder starts, so it always
/// reaches the viewer ahead of any log for that session.
async fn subscribe(
    state: &AppState,
    connection_id: Uuid,
    pattern: String,
    tx: &mpsc::Sender<String>,
    forwarders: &mut JoinSet<Uuid>,
) {
    let session_id = match state.connections.open_session(connection_id, &pattern).await {
        Some(SessionOpen::New(session_id)) => session_id,
        Some(SessionOpen::Existing(session_id)) => {
            tracing::debug!(
                connection_id = %connection_id,
                session_id = %session_id,
                pattern = %pattern,
                "already subscribed"
            );
            send_joined(tx, &pattern).await;
            return;
        }
        None => return,
    };

    let subscription = match state.broker.subscribe(&pattern).await {
        Ok(subscription) => subscription,
        Err(e) => {
            tracing::warn!(
                connection_id = %connection_id,
                pattern = %pattern,
                "failed to open subscription: {}",
                e
            );
            state
                .connections
                .set_status(connection_id, session_id, SessionStatus::Closed)
                .await;
            return;
        }
    };

    if !send_joined(tx, &pattern).await {
        state
            .connections
            .set_status(connection_id, session_id, SessionStatus::Closed)
            .await;
        return;
    }

    state
        .connections
        .set_status(connection_id, session_id, SessionStatus::Active)
        .await;
    tracing::info!(
        connection_id = %connection_id,
        session_id = %session_id,
        pattern = %pattern,
        "subscribed"
    );

    forwarders.spawn(forward(
        subscription,
        tx.clone(),
        state.connections.clone(),
        connection_id,
        session_id,
    ));
}

async fn send_joined(tx: &mpsc::Sender<String>, pattern: &str) -> bool {
    let message = format!("Joined {}", pattern);
    match (OutgoingMessage { message: &message }).to_json() {
        Some(json) => tx.send(json).await.is_ok(),
        None => false,
    }
}

/// Moves broker messages for one session into the connection's outbound
/// queue until the subscription ends or the writer goes away.
async fn forward(
    mut subscription: Subscription,
    outbound: mpsc::Sender<String>,
    connections: ConnectionManager,
    connection_id: Uuid,
    session_id: Uuid,
) -> Uuid {
    while let Some(msg) = subscription.next().await {
        if LogPayload::parse(&msg.payload).is_none() {
            tracing::warn!(
                connection_id = %connection_id,
                channel = %msg.channel,
                "skipping non-log payload"
            );
            continue;
        }
        let Some(json) = (OutgoingMessage {
            message: &msg.payload,
        })
        .to_json() else {
            continue;
        };
        if outbound.send(json).await.is_err() {
            break;
        }
    }

    connections
        .set_status(connection_id, session_id, SessionStatus::Draining)
        .await;
    subscription.unsubscribe();
    tracing::debug!(
        connection_id = %connection_id,
        session_id = %session_id,
        subscription = subscription.id(),
        pattern = subscription.pattern(),
        "session drained"
    );
    session_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[test]
    fn parses_subscribe_request() {
        match IncomingMessage::parse(r#"{"action":"subscribe","channel":"logs:abc123"}"#) {
            Some(IncomingMessage::Subscribe { channel }) => assert_eq!(channel, "logs:abc123"),
            None => panic!("expected subscribe"),
        }
    }

    #[test]
    fn rejects_malformed_requests() {
        for raw in [
            "not json",
            r#"{"action":"ping"}"#,
            r#"{"action":"subscribe"}"#,
            r#"{"action":"subscribe","channel":""}"#,
            r#"{"action":"subscribe","channel":42}"#,
            r#"{"channel":"logs:a"}"#,
            "[]",
        ] {
            assert!(IncomingMessage::parse(raw).is_none(), "accepted {raw}");
        }
    }

    #[test]
    fn outgoing_message_wraps_payload_as_string() {
        let json = OutgoingMessage {
            message: r#"{"log":"hi"}"#,
        }
        .to_json()
        .unwrap();
        assert_eq!(json, r#"{"message":"{\"log\":\"hi\"}"}"#);
    }

    #[tokio::test]
    async fn same_pattern_reuses_session() {
        let cm = ConnectionManager::new();
        let conn = cm.add_connection(addr()).await;

        let Some(SessionOpen::New(first)) = cm.open_session(conn, "logs:a").await else {
            panic!("expected new session");
        };
        assert_eq!(
            cm.open_session(conn, "logs:a").await,
            Some(SessionOpen::Existing(first))
        );
        assert!(matches!(
            cm.open_session(conn, "logs:*").await,
            Some(SessionOpen::New(_))
        ));
        assert_eq!(cm.patterns(conn).await, ["logs:*", "logs:a"]);
        assert_eq!(cm.session_count().await, 2);
    }

    #[tokio::test]
    async fn status_transitions_and_close_removes() {
        let cm = ConnectionManager::new();
        let conn = cm.add_connection(addr()).await;
        let Some(SessionOpen::New(session)) = cm.open_session(conn, "logs:a").await else {
            panic!("expected new session");
        };

        assert_eq!(cm.session_status(conn, session).await, Some(SessionStatus::Pending));
        cm.set_status(conn, session, SessionStatus::Active).await;
        assert_eq!(cm.session_status(conn, session).await, Some(SessionStatus::Active));
        cm.set_status(conn, session, SessionStatus::Draining).await;
        assert_eq!(cm.session_count().await, 0);

        // A draining session does not block a fresh subscribe.
        assert!(matches!(
            cm.open_session(conn, "logs:a").await,
            Some(SessionOpen::New(_))
        ));

        cm.set_status(conn, session, SessionStatus::Closed).await;
        assert_eq!(cm.session_status(conn, session).await, None);
    }

    #[tokio::test]
    async fn remove_connection_forgets_sessions() {
        let cm = ConnectionManager::new();
        let conn = cm.add_connection(addr()).await;
        cm.open_session(conn, "logs:a").await;
        cm.open_session(conn, "logs:b").await;

        assert_eq!(cm.remote_addr(conn).await, Some(addr()));
        assert_eq!(cm.remove_connection(conn).await, 2);
        assert_eq!(cm.connection_count().await, 0);
        assert_eq!(cm.open_session(conn, "logs:a").await, None);
        assert_eq!(cm.remove_connection(conn).await, 0);
    }

    #[tokio::test]
    async fn forwarder_drains_when_writer_is_gone() {
        use buildcast_broker::{Broker, MemoryBroker};

        let broker = MemoryBroker::new();
        let cm = ConnectionManager::new();
        let conn = cm.add_connection(addr()).await;
        let Some(SessionOpen::New(session)) = cm.open_session(conn, "logs:A").await else {
            panic!("expected a new session");
        };
        cm.set_status(conn, session, SessionStatus::Active).await;

        let subscription = broker.subscribe("logs:A").await.unwrap();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let forwarder = tokio::spawn(forward(subscription, tx, cm.clone(), conn, session));

        broker.publish("logs:A", r#"{"log":"lost"}"#).await.unwrap();

        assert_eq!(forwarder.await.unwrap(), session);
        assert_eq!(
            cm.session_status(conn, session).await,
            Some(SessionStatus::Draining)
        );
        assert_eq!(broker.subscriber_count(), 0);
    }
}
