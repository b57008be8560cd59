//! Session Gateway: one WebSocket connection bound to one workspace.
//!
//! ```text
//! Connecting --(valid roomId, workspace exists)--> Active --(disconnect)--> Closed
//!      `-------------------(missing/invalid id: close 1008)------------------^
//! ```
//!
//! Every connection runs a receive loop and a writer task. Watcher events and
//! terminal output are forwarded by their own tasks into the same bounded
//! outbound queue, so there is no ordering between the two streams, but each
//! stream keeps its own order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::Response,
};
use base64::{Engine, engine::general_purpose::STANDARD};
use futures::{SinkExt, StreamExt};
use replbox_protocol::{ClientMessage, ServerMessage, entries::normalize_path};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{FsError, ProtocolError, SessionError};
use crate::fs::{LocalFs, WorkspaceFs};
use crate::pty::{PtyEvent, PtyHandle};
use crate::state::AppState;
use crate::watcher::{self, WatcherHandle};

const MAX_WORKSPACE_ID_LEN: usize = 128;

/// Time allowed for queued messages to drain after the session closes.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    #[serde(rename = "roomId")]
    pub room_id: Option<String>,
}

/// GET /ws?roomId=<workspace id>
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.room_id))
}

/// Accept ids usable as a single directory name and object key segment.
pub fn validate_workspace_id(raw: Option<&str>) -> Result<String, ProtocolError> {
    let id = raw.map(str::trim).unwrap_or_default();
    if id.is_empty() {
        return Err(ProtocolError::MissingWorkspaceId);
    }

    let valid_chars = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid_chars || id.starts_with('.') || id.len() > MAX_WORKSPACE_ID_LEN {
        return Err(ProtocolError::InvalidWorkspaceId(id.to_string()));
    }

    Ok(id.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

/// Per-connection coordinator. Owns the watcher and at most one terminal.
pub struct Session {
    connection_id: String,
    workspace_id: String,
    workspace_dir: PathBuf,
    state: SessionState,
    app: AppState,
    fs: Arc<dyn WorkspaceFs>,
    outbound: mpsc::Sender<ServerMessage>,
    watcher: Option<WatcherHandle>,
    watch_forwarder: Option<JoinHandle<()>>,
    terminal: Option<PtyHandle>,
    terminal_forwarder: Option<JoinHandle<()>>,
}

impl Session {
    /// Validate the handshake. Nothing is started until [`Session::activate`].
    pub fn connect(
        app: AppState,
        connection_id: &str,
        room_id: Option<&str>,
        outbound: mpsc::Sender<ServerMessage>,
    ) -> Result<Self, ProtocolError> {
        let workspace_id = validate_workspace_id(room_id)?;
        let workspace_dir = app.workspace_dir(&workspace_id);
        if !workspace_dir.is_dir() {
            return Err(ProtocolError::UnknownWorkspace(workspace_id));
        }

        Ok(Self {
            connection_id: connection_id.to_string(),
            fs: Arc::new(LocalFs::new(&workspace_dir)),
            workspace_id,
            workspace_dir,
            state: SessionState::Connecting,
            app,
            outbound,
            watcher: None,
            watch_forwarder: None,
            terminal: None,
            terminal_forwarder: None,
        })
    }

    /// Start the watcher, push the `loaded` snapshot, then start forwarding
    /// watcher events. The watcher starts first so nothing between snapshot
    /// and forwarding is lost.
    pub async fn activate(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Connecting {
            return Err(SessionError::NotActive);
        }

        let capacity = self.app.config.server.outbound_buffer.max(1);
        let (watch_tx, mut watch_rx) = mpsc::channel(capacity);
        self.watcher = Some(watcher::start(&self.workspace_dir, watch_tx)?);

        let root_content = self.fs.snapshot().await?;
        if !self.send(ServerMessage::Loaded { root_content }).await {
            return Err(SessionError::ConnectionClosed);
        }

        let outbound = self.outbound.clone();
        self.watch_forwarder = Some(tokio::spawn(async move {
            while let Some(diff) = watch_rx.recv().await {
                if outbound.send(ServerMessage::FileRefresh(diff)).await.is_err() {
                    break;
                }
            }
        }));

        self.state = SessionState::Active;
        info!(
            "Session {} active for workspace {}",
            self.connection_id, self.workspace_id
        );
        Ok(())
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The live terminal, if any. A shell that exited on its own is not live.
    pub fn terminal(&self) -> Option<&PtyHandle> {
        let current = self.app.pty.handle(&self.connection_id)?;
        self.terminal
            .as_ref()
            .filter(|h| h.generation() == current.generation())
    }

    async fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).await.is_ok()
    }

    /// Parse and handle one text frame. Malformed frames are answered with an
    /// error and do not end the session.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                warn!("Malformed request on session {}: {}", self.connection_id, e);
                let id = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(|id| id.as_str()).map(str::to_string));
                Some(ServerMessage::error(
                    id.as_deref(),
                    ProtocolError::Malformed(e.to_string()).to_string(),
                ))
            }
        }
    }

    /// Handle one request, returning the reply to send, if any.
    pub async fn handle(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        if self.state != SessionState::Active {
            return Some(ServerMessage::error(
                message.request_id(),
                SessionError::NotActive.to_string(),
            ));
        }

        match message {
            ClientMessage::FetchDir { id, path } => Some(match self.fs.list_entries(&path).await {
                Ok(entries) => ServerMessage::DirContents {
                    id,
                    path: normalize_path(&path),
                    entries,
                },
                Err(e) => self.fs_failure(id, &path, e),
            }),
            ClientMessage::FetchContent { id, path } => Some(match self.fs.read_file(&path).await {
                Ok(bytes) => ServerMessage::Content {
                    id,
                    path: normalize_path(&path),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                },
                Err(e) => self.fs_failure(id, &path, e),
            }),
            ClientMessage::UpdateContent { id, path, content } => {
                Some(match self.fs.write_file(&path, content.as_bytes()).await {
                    Ok(()) => {
                        self.mirror_write(&path, content);
                        ack(id, &path)
                    }
                    Err(e) => self.fs_failure(id, &path, e),
                })
            }
            ClientMessage::CreateFile { id, path } => Some(match self.fs.write_file(&path, b"").await {
                Ok(()) => ack(id, &path),
                Err(e) => self.fs_failure(id, &path, e),
            }),
            ClientMessage::CreateFolder { id, path } => Some(match self.fs.mkdir(&path).await {
                Ok(()) => ack(id, &path),
                Err(e) => self.fs_failure(id, &path, e),
            }),
            ClientMessage::RequestTerminal { id } => Some(self.request_terminal(id)),
            ClientMessage::TerminalData { data } => {
                if let Err(e) = self.app.pty.write(&self.connection_id, data.as_bytes()) {
                    debug!("Dropping terminal input: {}", e);
                }
                None
            }
        }
    }

    fn fs_failure(&self, id: Option<String>, path: &str, err: FsError) -> ServerMessage {
        warn!(
            "File operation on {} failed for session {}: {}",
            path, self.connection_id, err
        );
        ServerMessage::error(id.as_deref(), err.to_string())
    }

    /// Spawn (or replace) this connection's shell and forward its output.
    fn request_terminal(&mut self, id: Option<String>) -> ServerMessage {
        let (handle, mut events) = match self
            .app
            .pty
            .create(&self.connection_id, &self.workspace_dir)
        {
            Ok(created) => created,
            Err(e) => {
                error!(
                    "Failed to start terminal for session {}: {}",
                    self.connection_id, e
                );
                return ServerMessage::error(id.as_deref(), e.to_string());
            }
        };

        if let Some(previous) = self.terminal_forwarder.take() {
            previous.abort();
        }

        let outbound = self.outbound.clone();
        self.terminal_forwarder = Some(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let exited = event == PtyEvent::Exited;
                let message = match event {
                    PtyEvent::Output(bytes) => ServerMessage::Terminal {
                        data: STANDARD.encode(&bytes),
                    },
                    PtyEvent::Exited => ServerMessage::TerminalExit,
                };
                if outbound.send(message).await.is_err() || exited {
                    break;
                }
            }
        }));
        self.terminal = Some(handle);

        ServerMessage::Ack { id, path: None }
    }

    /// Upload the new content in the background when write mirroring is on.
    fn mirror_write(&self, path: &str, content: String) {
        let Some((storage, mirror)) = self.app.storage() else {
            return;
        };
        if !storage.mirror_writes {
            return;
        }

        let prefix = storage.code_key_prefix(&self.workspace_id);
        let path = normalize_path(path);
        let mirror = mirror.clone();
        tokio::spawn(async move {
            if let Err(e) = mirror.save(&prefix, &path, content).await {
                warn!("Mirroring {}{} failed: {}", prefix, path, e);
            }
        });
    }

    /// Stop the watcher and terminate the terminal. Both steps always run and
    /// are no-ops when there is nothing to release.
    pub fn close(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.stop();
        }
        if let Some(task) = self.watch_forwarder.take() {
            task.abort();
        }

        self.app.pty.terminate(&self.connection_id);
        self.terminal = None;
        if let Some(task) = self.terminal_forwarder.take() {
            task.abort();
        }

        if self.state != SessionState::Closed {
            self.state = SessionState::Closed;
            info!("Session {} closed", self.connection_id);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

fn ack(id: Option<String>, path: &str) -> ServerMessage {
    ServerMessage::Ack {
        id,
        path: Some(normalize_path(path)),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: Option<String>) {
    let connection_id = Uuid::new_v4().to_string();
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<ServerMessage>(state.config.server.outbound_buffer.max(1));

    let mut session = match Session::connect(state, &connection_id, room_id.as_deref(), outbound_tx)
    {
        Ok(session) => session,
        Err(e) => {
            warn!("Rejecting connection {}: {}", connection_id, e);
            let frame = CloseFrame {
                code: close_code::POLICY,
                reason: e.to_string().into(),
            };
            let _ = sender.send(Message::Close(Some(frame))).await;
            return;
        }
    };

    info!(
        "Connection {} opened for workspace {}",
        connection_id,
        session.workspace_id()
    );

    let mut writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    warn!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    if let Err(e) = session.activate().await {
        error!("Failed to activate session {}: {}", connection_id, e);
        let _ = session
            .outbound
            .send(ServerMessage::error(None, e.to_string()))
            .await;
    } else {
        while let Some(msg_result) = receiver.next().await {
            match msg_result {
                Ok(Message::Text(text)) => {
                    if let Some(reply) = session.handle_text(text.as_str()).await {
                        if !session.send(reply).await {
                            break;
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    debug!("Ignoring binary frame on session {}", connection_id);
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Ok(Message::Close(_)) => {
                    info!("Client closed session {}", connection_id);
                    break;
                }
                Err(e) => {
                    warn!("WebSocket error on session {}: {}", connection_id, e);
                    break;
                }
            }
        }
    }

    session.close();
    drop(session);

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
        .await
        .is_err()
    {
        writer.abort();
    }
    info!("Connection {} finished", connection_id);
}
