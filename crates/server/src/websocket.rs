//! WebSocket handling
//!
//! One `ChatConnection` per socket. The receive loop dispatches client
//! messages; executor events reach the client through the connection's
//! event queue and its fan-out task, never through the receive loop.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::{header::ORIGIN, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use futures::{SinkExt, Stream, StreamExt};
use serde_json::json;
use switchyard_protocol::{CancelLevel, ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{query_token, tokens_match};
use crate::error::SessionError;
use crate::fanout::{run_fanout, EventQueue};
use crate::paths;
use crate::registry::{valid_session_id, CreateOptions};
use crate::state::AppState;
use crate::surface::Surface;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const AUTH_TIMEOUT: Duration = Duration::from_secs(30);
const OUTBOUND_CAPACITY: usize = 256;
const FANOUT_STOP_GRACE: Duration = Duration::from_secs(1);

/// Messages that can be sent through the WebSocket
#[derive(Debug)]
pub(crate) enum OutboundMessage {
    Json(ServerMessage),
    Pong(Bytes),
}

impl From<ServerMessage> for OutboundMessage {
    fn from(msg: ServerMessage) -> Self {
        OutboundMessage::Json(msg)
    }
}

/// Origins served from this machine. Anything else is refused unless
/// remote origins are allowed.
pub(crate) fn is_local_origin(origin: &str) -> bool {
    let Some(rest) = origin
        .strip_prefix("http://")
        .or_else(|| origin.strip_prefix("https://"))
    else {
        return false;
    };
    let authority = rest.split('/').next().unwrap_or_default();
    let host = match authority.strip_prefix('[') {
        Some(v6) => v6.split(']').next().unwrap_or_default(),
        None => authority.split(':').next().unwrap_or_default(),
    };
    matches!(host, "localhost" | "127.0.0.1" | "::1")
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    uri: Uri,
    State(state): State<Arc<AppState>>,
) -> Response {
    if !state.settings.allow_remote_origins {
        if let Some(origin) = headers.get(ORIGIN).and_then(|v| v.to_str().ok()) {
            if !is_local_origin(origin) {
                warn!(
                    component = "websocket",
                    event = "ws.origin_rejected",
                    origin = %origin,
                    "Rejected WebSocket upgrade from non-local origin"
                );
                return StatusCode::FORBIDDEN.into_response();
            }
        }
    }

    let authenticated = match &state.settings.api_key {
        None => true,
        Some(key) => query_token(uri.query()).is_some_and(|token| tokens_match(token, key)),
    };

    ws.on_upgrade(move |socket| handle_socket(socket, state, authenticated))
        .into_response()
}

/// Handle a WebSocket connection
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, authenticated: bool) {
    let conn_id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
    info!(
        component = "websocket",
        event = "ws.connection.opened",
        connection_id = conn_id,
        "WebSocket connection opened"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            let result = match msg {
                OutboundMessage::Json(server_msg) => match serde_json::to_string(&server_msg) {
                    Ok(json) => ws_tx.send(Message::Text(json.into())).await,
                    Err(e) => {
                        error!(
                            component = "websocket",
                            event = "ws.send.serialize_failed",
                            connection_id = conn_id,
                            error = %e,
                            "Failed to serialize server message"
                        );
                        continue;
                    }
                },
                OutboundMessage::Pong(data) => ws_tx.send(Message::Pong(data)).await,
            };

            if result.is_err() {
                debug!(
                    component = "websocket",
                    event = "ws.send.disconnected",
                    connection_id = conn_id,
                    "WebSocket send failed, client disconnected"
                );
                break;
            }
        }
    });

    if !authenticated {
        let expected = state.settings.api_key.clone().unwrap_or_default();
        match authenticate(&mut ws_rx, &expected).await {
            Ok(()) => {
                let _ = outbound_tx.send(ServerMessage::AuthOk.into()).await;
            }
            Err(reason) => {
                warn!(
                    component = "websocket",
                    event = "ws.auth.failed",
                    connection_id = conn_id,
                    reason = reason,
                    "WebSocket authentication failed"
                );
                let _ = outbound_tx
                    .send(
                        ServerMessage::Error {
                            error: reason.to_string(),
                        }
                        .into(),
                    )
                    .await;
                // Let the error flush before the socket goes away.
                drop(outbound_tx);
                let _ = send_task.await;
                return;
            }
        }
    }

    let mut conn = ChatConnection::open(conn_id, state, outbound_tx.clone());

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(data)) => {
                let _ = outbound_tx.send(OutboundMessage::Pong(data)).await;
                continue;
            }
            Ok(Message::Close(_)) => {
                info!(
                    component = "websocket",
                    event = "ws.connection.close_frame",
                    connection_id = conn_id,
                    "Client sent close frame"
                );
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.connection.error",
                    connection_id = conn_id,
                    error = %e,
                    "WebSocket error"
                );
                break;
            }
        };

        let client_msg: ClientMessage = match serde_json::from_str(&msg) {
            Ok(m) => m,
            Err(e) => {
                warn!(
                    component = "websocket",
                    event = "ws.message.parse_failed",
                    connection_id = conn_id,
                    error = %e,
                    payload_bytes = msg.len(),
                    payload_preview = %truncate_for_log(&msg, 240),
                    "Failed to parse client message"
                );
                conn.send_error(format!("Invalid message: {}", e)).await;
                continue;
            }
        };

        conn.handle(client_msg).await;
    }

    conn.close().await;
    info!(
        component = "websocket",
        event = "ws.connection.closed",
        connection_id = conn_id,
        "WebSocket connection closed"
    );
    send_task.abort();
}

/// Wait for the first frame and check it is a matching `auth` message.
async fn authenticate<S>(ws_rx: &mut S, expected: &str) -> Result<(), &'static str>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let frame = tokio::time::timeout(AUTH_TIMEOUT, ws_rx.next())
        .await
        .map_err(|_| "Authentication timed out")?;
    let Some(Ok(Message::Text(text))) = frame else {
        return Err("Expected auth message");
    };
    match serde_json::from_str::<ClientMessage>(&text) {
        Ok(ClientMessage::Auth { token }) if tokens_match(&token, expected) => Ok(()),
        Ok(ClientMessage::Auth { .. }) => Err("Invalid API key"),
        _ => Err("Expected auth message"),
    }
}

fn truncate_for_log(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[derive(Debug, Clone)]
struct ActiveSession {
    id: String,
    cwd: String,
    profile: Option<String>,
}

/// State of one client connection
pub(crate) struct ChatConnection {
    conn_id: u64,
    state: Arc<AppState>,
    outbound: mpsc::Sender<OutboundMessage>,
    events: EventQueue,
    fanout_task: JoinHandle<()>,
    session: Option<ActiveSession>,
    prompt_task: Option<JoinHandle<()>>,
}

impl ChatConnection {
    pub(crate) fn open(
        conn_id: u64,
        state: Arc<AppState>,
        outbound: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let (events, events_rx) = EventQueue::bounded(state.settings.event_queue_capacity);
        let fanout_task = tokio::spawn(run_fanout(events_rx, outbound.clone(), conn_id));
        Self {
            conn_id,
            state,
            outbound,
            events,
            fanout_task,
            session: None,
            prompt_task: None,
        }
    }

    fn surface(&self) -> Surface {
        Surface::new(self.events.clone(), self.state.settings.auto_approve)
    }

    fn prompt_running(&self) -> bool {
        self.prompt_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    async fn send(&self, msg: ServerMessage) {
        let _ = self.outbound.send(msg.into()).await;
    }

    async fn send_error(&self, error: impl Into<String>) {
        self.send(ServerMessage::Error {
            error: error.into(),
        })
        .await;
    }

    pub(crate) async fn handle(&mut self, msg: ClientMessage) {
        debug!(
            component = "websocket",
            event = "ws.message.received",
            connection_id = self.conn_id,
            message = ?msg,
            "Received client message"
        );

        match msg {
            // Already authenticated by the time the loop runs.
            ClientMessage::Auth { .. } => self.send(ServerMessage::AuthOk).await,

            ClientMessage::CreateSession {
                cwd,
                profile,
                resume_session_id,
            } => {
                if let Err(err) = self.open_session(cwd, profile, resume_session_id).await {
                    self.send_error(err.to_string()).await;
                }
            }

            ClientMessage::Prompt { content } => self.start_prompt(content).await,

            ClientMessage::Cancel { level } => match &self.session {
                Some(active) => self.state.registry.cancel(&active.id, level).await,
                None => self.send_error("No active session").await,
            },

            ClientMessage::ApprovalResponse { id, choice } => {
                let Some(active) = &self.session else {
                    self.send_error("No active session").await;
                    return;
                };
                if !self
                    .state
                    .registry
                    .resolve_approval(&active.id, &id, &choice)
                {
                    self.send_error(format!("No pending approval request {}", id))
                        .await;
                }
            }

            ClientMessage::Command { name, args } => self.run_command(&name, &args).await,

            ClientMessage::Ping => self.send(ServerMessage::Pong).await,
        }
    }

    async fn open_session(
        &mut self,
        cwd: Option<String>,
        profile: Option<String>,
        resume_session_id: Option<String>,
    ) -> Result<(), SessionError> {
        if resume_session_id
            .as_deref()
            .is_some_and(|id| !valid_session_id(id))
        {
            return Err(SessionError::InvalidSessionId);
        }
        if cwd.as_deref().is_some_and(|dir| dir.contains('\0')) {
            return Err(SessionError::InvalidWorkingDir);
        }

        self.leave_session().await;
        // Queued ahead of any event from the new session.
        self.events.reset().await;

        let registry = &self.state.registry;
        let handle = match resume_session_id {
            Some(id) => registry.resume(&id, cwd.as_deref(), Some(self.surface())).await?,
            None => {
                registry
                    .create(
                        cwd.as_deref().unwrap_or_default(),
                        CreateOptions {
                            profile,
                            surface: Some(self.surface()),
                        },
                    )
                    .await?
            }
        };

        let active = ActiveSession {
            id: handle.session_id().to_string(),
            cwd: handle.working_dir().to_string(),
            profile: handle.profile().map(str::to_string),
        };
        info!(
            component = "websocket",
            event = "ws.session.attached",
            connection_id = self.conn_id,
            session_id = %active.id,
            resumed = handle.resumed(),
            "Connection attached to session"
        );
        self.send(ServerMessage::SessionCreated {
            session_id: active.id.clone(),
            cwd: active.cwd.clone(),
            profile: active.profile.clone(),
        })
        .await;
        self.session = Some(active);
        Ok(())
    }

    /// Forget the current session without ending it.
    /// Let go of the current session. A turn still running is cancelled
    /// gracefully; the session itself stays resumable.
    async fn leave_session(&mut self) {
        let was_running = self.prompt_running();
        if let Some(task) = self.prompt_task.take() {
            task.abort();
        }
        if let Some(active) = self.session.take() {
            self.state.registry.detach_surface(&active.id, &self.events);
            if was_running {
                self.state
                    .registry
                    .cancel(&active.id, CancelLevel::Graceful)
                    .await;
            }
        }
    }

    async fn start_prompt(&mut self, content: String) {
        let Some(active) = &self.session else {
            self.send_error("No active session. Send create_session first.")
                .await;
            return;
        };
        if self.prompt_running() {
            self.send(ServerMessage::ExecutionError {
                error: "A prompt is already running".to_string(),
            })
            .await;
            return;
        }

        let registry = self.state.registry.clone();
        let outbound = self.outbound.clone();
        let session_id = active.id.clone();
        let conn_id = self.conn_id;
        self.prompt_task = Some(tokio::spawn(async move {
            match registry.execute(&session_id, &content).await {
                Ok(_) => {}
                Err(SessionError::Cancelled) => {
                    debug!(
                        component = "websocket",
                        event = "ws.prompt.cancelled",
                        connection_id = conn_id,
                        session_id = %session_id,
                        "Prompt cancelled"
                    );
                }
                Err(err) => {
                    warn!(
                        component = "websocket",
                        event = "ws.prompt.failed",
                        connection_id = conn_id,
                        session_id = %session_id,
                        error = %err,
                        "Prompt failed"
                    );
                    let _ = outbound
                        .send(
                            ServerMessage::ExecutionError {
                                error: err.to_string(),
                            }
                            .into(),
                        )
                        .await;
                }
            }
        }));
    }

    async fn run_command(&mut self, name: &str, args: &[String]) {
        match name {
            "status" => {
                let result = json!({
                    "session_id": self.session.as_ref().map(|s| s.id.clone()),
                    "cwd": self.session.as_ref().map(|s| s.cwd.clone()),
                    "profile": self.session.as_ref().and_then(|s| s.profile.clone()),
                    "prompt_running": self.prompt_running(),
                    "dropped_events": self.events.dropped(),
                    "active_sessions": self.state.registry.list_active_sessions().len(),
                });
                self.send(ServerMessage::CommandResult {
                    command: name.to_string(),
                    result,
                })
                .await;
            }
            "profile" => {
                let Some(profile) = args.first() else {
                    self.send_error("Usage: profile <name>").await;
                    return;
                };
                let cwd = self.session.as_ref().map(|s| s.cwd.clone());
                self.replace_session(name, cwd, Some(profile.clone())).await;
            }
            "cwd" => {
                let Some(path) = args.first() else {
                    self.send_error("Usage: cwd <path>").await;
                    return;
                };
                let dir = paths::expand_working_dir(path);
                if !Path::new(&dir).is_dir() {
                    self.send_error(format!("Not a directory: {}", dir)).await;
                    return;
                }
                let profile = self.session.as_ref().and_then(|s| s.profile.clone());
                self.replace_session(name, Some(dir), profile).await;
            }
            other => self.send_error(format!("Unknown command: {}", other)).await,
        }
    }

    /// End the current session and start a fresh one with new settings.
    async fn replace_session(
        &mut self,
        command: &str,
        cwd: Option<String>,
        profile: Option<String>,
    ) {
        if self.prompt_running() {
            self.send(ServerMessage::ExecutionError {
                error: "Cannot change session settings while a prompt is running".to_string(),
            })
            .await;
            return;
        }

        let previous = self.session.as_ref().map(|s| s.id.clone());
        self.leave_session().await;
        if let Some(previous) = &previous {
            self.state.registry.end(previous).await;
        }

        match self.open_session(cwd, profile, None).await {
            Ok(()) => {
                let result = json!({
                    "ended_session_id": previous,
                    "session_id": self.session.as_ref().map(|s| s.id.clone()),
                });
                self.send(ServerMessage::CommandResult {
                    command: command.to_string(),
                    result,
                })
                .await;
            }
            Err(err) => self.send_error(err.to_string()).await,
        }
    }

    /// Disconnect: the session stays registered so a later connection can
    /// resume it.
    pub(crate) async fn close(mut self) {
        self.leave_session().await;

        let _ = tokio::time::timeout(FANOUT_STOP_GRACE, self.events.stop()).await;
        if tokio::time::timeout(FANOUT_STOP_GRACE, &mut self.fanout_task)
            .await
            .is_err()
        {
            self.fanout_task.abort();
        }
        debug!(
            component = "websocket",
            event = "ws.connection.released",
            connection_id = self.conn_id,
            dropped_events = self.events.dropped(),
            "Connection resources released"
        );
    }
}
