//! Connection protocol messages.

use serde::{Deserialize, Serialize};

use crate::entries::{TreeDiffEvent, WorkspaceEntry};

// ============================================================================
// Incoming (client -> server)
// ============================================================================

/// Requests sent by the browser over the session WebSocket.
///
/// `id` is echoed back on the matching response so the client can correlate
/// request/response pairs. Fire-and-forget requests may omit it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientMessage {
    /// List the direct children of a directory.
    FetchDir {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
    },
    /// Read a file's content.
    FetchContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
    },
    /// Overwrite a file with the full new content.
    UpdateContent {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
        content: String,
    },
    CreateFile {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
    },
    CreateFolder {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
    },
    /// Spawn (or replace) the shell attached to this connection.
    RequestTerminal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    /// Keystrokes for the shell.
    TerminalData { data: String },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<&str> {
        match self {
            Self::FetchDir { id, .. }
            | Self::FetchContent { id, .. }
            | Self::UpdateContent { id, .. }
            | Self::CreateFile { id, .. }
            | Self::CreateFolder { id, .. }
            | Self::RequestTerminal { id } => id.as_deref(),
            Self::TerminalData { .. } => None,
        }
    }
}

// ============================================================================
// Outgoing (server -> client)
// ============================================================================

/// Messages pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum ServerMessage {
    /// Initial recursive snapshot, sent once when the session becomes active.
    #[serde(rename = "loaded")]
    Loaded {
        #[serde(rename = "rootContent")]
        root_content: Vec<WorkspaceEntry>,
    },
    /// A change observed by the workspace watcher.
    #[serde(rename = "file:refresh")]
    FileRefresh(TreeDiffEvent),
    /// Base64-encoded shell output, in the order the shell produced it.
    #[serde(rename = "terminal")]
    Terminal { data: String },
    /// The shell exited on its own.
    #[serde(rename = "terminal:exit")]
    TerminalExit,
    #[serde(rename = "dirContents")]
    DirContents {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
        entries: Vec<WorkspaceEntry>,
    },
    #[serde(rename = "content")]
    Content {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        path: String,
        content: String,
    },
    /// A fire-and-forget request completed.
    #[serde(rename = "ack")]
    Ack {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        error: String,
    },
}

impl ServerMessage {
    pub fn error(id: Option<&str>, error: impl Into<String>) -> Self {
        Self::Error {
            id: id.map(str::to_string),
            error: error.into(),
        }
    }
}
