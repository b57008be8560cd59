use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::watcher::WatchError;

/// Filesystem Adapter failures. Reported to the requesting client only.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Path is outside the workspace")]
    PathTraversal,

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-level protocol violations.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Missing workspace id")]
    MissingWorkspaceId,

    #[error("Invalid workspace id: {0}")]
    InvalidWorkspaceId(String),

    #[error("Unknown workspace: {0}")]
    UnknownWorkspace(String),

    #[error("Malformed request: {0}")]
    Malformed(String),
}

/// Failures that prevent a session from becoming active.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Watch(#[from] WatchError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("Session is not active")]
    NotActive,

    #[error("Connection closed")]
    ConnectionClosed,
}

/// Errors returned by HTTP handlers.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ProtocolError> for ApiError {
    fn from(err: ProtocolError) -> Self {
        ApiError::BadRequest(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Fs(FsError::NotFound(_)) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::Fs(FsError::PathTraversal) => (StatusCode::FORBIDDEN, "PATH_TRAVERSAL"),
            ApiError::Fs(FsError::InvalidPath(_)) => (StatusCode::BAD_REQUEST, "INVALID_PATH"),
            ApiError::Fs(FsError::Io(_)) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            ApiError::Storage(_) => (StatusCode::BAD_GATEWAY, "STORAGE_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        let body = ErrorResponse {
            error: self.to_string(),
            code,
        };

        (status, Json(body)).into_response()
    }
}
