//! WebSocket endpoint for live sessions.
//!
//! Each socket gets one [`Connection`]. The client starts (and restarts) the
//! event feed with `sync {last_seq}`; everything else maps to a session
//! operation.

use std::{fmt, path::PathBuf, sync::Arc};

use axum::{
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use gateway_session::{
    BackgroundSession, ManagerError, Resync, SessionHandle, SessionState, SyncError,
};
use serde::Deserialize;

use crate::{
    api::{ApiError, AppState},
    protocol::{ClientMessage, ServerMessage},
};

/// What a connection is attached to.
pub enum Target {
    Live(Arc<BackgroundSession>),
    /// Archived sessions can be replayed but not driven.
    Archived(SessionHandle),
}

/// Protocol state of one client connection, independent of the socket.
pub struct Connection {
    target: Target,
    feed: Option<Resync>,
    label: String,
}

impl Connection {
    #[must_use]
    pub fn new(target: Target, label: impl Into<String>) -> Self {
        Self {
            target,
            feed: None,
            label: label.into(),
        }
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        match &self.target {
            Target::Live(session) => session.id(),
            Target::Archived(handle) => handle.id(),
        }
    }

    /// Greeting sent when the socket opens.
    pub fn connected(&self) -> impl Future<Output = ServerMessage> + Send + 'static {
        let session_id = self.session_id().to_string();
        let target = match &self.target {
            Target::Live(session) => Target::Live(Arc::clone(session)),
            Target::Archived(handle) => Target::Archived(handle.clone()),
        };
        async move {
            let (last_seq, state) = match &target {
                Target::Live(session) => (session.last_seq(), session.state()),
                Target::Archived(handle) => match handle.metadata().await {
                    Ok(meta) => (meta.last_seq, SessionState::Archived),
                    Err(e) => return ServerMessage::error(e),
                },
            };
            ServerMessage::Connected {
                session_id,
                last_seq,
                state,
            }
        }
    }

    /// Apply one client message, returning the direct replies.
    pub async fn handle(&mut self, message: ClientMessage) -> Vec<ServerMessage> {
        match message {
            ClientMessage::Ping => vec![ServerMessage::Pong],
            ClientMessage::Sync { last_seq } => self.start_feed(last_seq).await.into_iter().collect(),
            ClientMessage::Keepalive { last_seen_seq } => {
                let (server_max_seq, state) = match &self.target {
                    Target::Live(session) => (session.last_seq(), session.state()),
                    Target::Archived(_) => (self.feed.as_ref().map_or(0, Resync::last_seq), SessionState::Archived),
                };
                tracing::trace!(session_id = %self.session_id(), ?last_seen_seq, server_max_seq, "Keepalive");
                vec![ServerMessage::KeepaliveAck { server_max_seq, state }]
            }
            other => {
                let Target::Live(session) = &self.target else {
                    return vec![ServerMessage::error("Session is archived")];
                };
                match apply(session, other).await {
                    Ok(reply) => reply.into_iter().collect(),
                    Err(message) => vec![ServerMessage::Error { message }],
                }
            }
        }
    }

    async fn start_feed(&mut self, last_seq: u64) -> Option<ServerMessage> {
        // Detach the previous feed before attaching the new one.
        self.feed = None;
        let started = match &self.target {
            Target::Live(session) => Resync::attach(session, last_seq, self.label.clone()).await,
            Target::Archived(handle) => Resync::replay_only(handle, last_seq).await,
        };
        match started {
            Ok(feed) => {
                self.feed = Some(feed);
                None
            }
            Err(e) => Some(ServerMessage::error(format!("Sync failed: {e}"))),
        }
    }

    /// Next message pushed from the session. Waits forever while there is
    /// no feed. `None` means the session is gone and the connection should
    /// end. Cancel safe.
    pub async fn next_outbound(&mut self) -> Option<ServerMessage> {
        loop {
            let Some(feed) = self.feed.as_mut() else {
                return std::future::pending().await;
            };
            match feed.next().await {
                Ok(Some(item)) => return Some(ServerMessage::from_sync(feed.session_id(), item)),
                Ok(None) => {
                    self.feed = None;
                    if matches!(self.target, Target::Live(_)) {
                        return None;
                    }
                }
                Err(SyncError::Overflow(_)) => {
                    let last_seq = feed.last_seq();
                    tracing::warn!(session_id = %self.session_id(), last_seq, "Connection fell behind, resync required");
                    self.feed = None;
                    return Some(ServerMessage::ResyncRequired { last_seq });
                }
                Err(e) => {
                    self.feed = None;
                    return Some(ServerMessage::error(e));
                }
            }
        }
    }
}

async fn apply(session: &Arc<BackgroundSession>, message: ClientMessage) -> Result<Option<ServerMessage>, String> {
    match message {
        ClientMessage::Prompt { message, prompt_id } => {
            let ack = session.start_prompt(message, prompt_id).await.map_err(|e| e.to_string())?;
            Ok(Some(ServerMessage::PromptReceived {
                prompt_id: ack.prompt_id,
                seq: ack.seq,
            }))
        }
        ClientMessage::Queue { message } => {
            session.enqueue(message).await.map_err(|e| e.to_string())?;
            Ok(None)
        }
        ClientMessage::Dequeue { message_id } => {
            session.dequeue(&message_id).await.map_err(|e| e.to_string())?;
            Ok(None)
        }
        ClientMessage::Cancel => {
            session.cancel().await.map_err(|e| e.to_string())?;
            Ok(None)
        }
        ClientMessage::PermissionAnswer { request_id, option_id } => {
            session
                .respond_permission(&request_id, &option_id)
                .await
                .map_err(|e| e.to_string())?;
            Ok(None)
        }
        ClientMessage::Rename { title } => {
            session.rename(title).await.map_err(|e| e.to_string())?;
            Ok(None)
        }
        ClientMessage::Sync { .. } | ClientMessage::Keepalive { .. } | ClientMessage::Ping => Ok(None),
    }
}

/// `GET /api/sessions/{id}/ws`
pub async fn session_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let target = match state.manager.open_session(&id).await {
        Ok(session) => Target::Live(session),
        Err(ManagerError::Archived(_)) => Target::Archived(state.manager.store().open(&id).await?),
        Err(e) => return Err(e.into()),
    };
    Ok(upgrade(ws, target))
}

#[derive(Debug, Deserialize)]
pub struct WorkspaceQuery {
    pub working_dir: PathBuf,
    #[serde(default)]
    pub agent_server: Option<String>,
}

/// `GET /api/ws?working_dir=..&agent_server=..`
pub async fn workspace_socket(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Response, ApiError> {
    let session = state
        .manager
        .resolve(&query.working_dir, query.agent_server.as_deref())
        .await?;
    Ok(upgrade(ws, Target::Live(session)))
}

fn upgrade(ws: WebSocketUpgrade, target: Target) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, target)).into_response()
}

async fn handle_socket(socket: WebSocket, target: Target) {
    let (sender, receiver) = socket.split();
    let connection_id = uuid::Uuid::new_v4().simple().to_string();
    let connection = Connection::new(target, format!("ws-{}", &connection_id[..8]));
    let session_id = connection.session_id().to_string();
    tracing::info!(%session_id, connection = %connection_id, "WebSocket connected");

    relay(connection, sender, receiver).await;
    tracing::info!(%session_id, connection = %connection_id, "WebSocket disconnected");
}

/// Pump messages between a client and its connection until either side ends.
///
/// Outbound messages are written straight to `sink`. A client that stops
/// reading stalls the feed, so its observer queue fills and it is told to
/// resync instead of buffering without bound.
async fn relay<S, R, E>(mut connection: Connection, mut sink: S, mut stream: R)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    let session_id = connection.session_id().to_string();
    let greeting = connection.connected().await;

    if send(&mut sink, &greeting).await {
        loop {
            tokio::select! {
                incoming = stream.next() => {
                    let text = match incoming {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(s) => s.into(),
                            Err(_) => continue,
                        },
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            tracing::debug!(%session_id, "WebSocket error: {e}");
                            break;
                        }
                    };
                    let replies = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => connection.handle(message).await,
                        Err(e) => {
                            tracing::warn!(%session_id, "Invalid client message: {e}");
                            vec![ServerMessage::error(format!("Invalid message: {e}"))]
                        }
                    };
                    if !send_all(&mut sink, &replies).await {
                        break;
                    }
                }
                outbound = connection.next_outbound() => match outbound {
                    Some(message) => {
                        if !send(&mut sink, &message).await {
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    }

    // Dropping the connection detaches its observer.
    drop(connection);
    if let Err(e) = sink.close().await {
        tracing::debug!(%session_id, "Failed to close WebSocket: {e}");
    }
}

/// Returns false once the client is gone.
async fn send<S>(sink: &mut S, message: &ServerMessage) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let json = match serde_json::to_string(message) {
        Ok(json) => json,
        Err(e) => {
            tracing::error!("Failed to serialize message: {e}");
            return true;
        }
    };
    match sink.send(Message::Text(json.into())).await {
        Ok(()) => true,
        Err(e) => {
            tracing::debug!("WebSocket send failed: {e}");
            false
        }
    }
}

async fn send_all<S>(sink: &mut S, messages: &[ServerMessage]) -> bool
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    for message in messages {
        if !send(sink, message).await {
            return false;
        }
    }
    true
}
