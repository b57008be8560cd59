//! Replbox session server.
//!
//! Backs a browser-based coding sandbox: each workspace is a directory under
//! the configured root, each WebSocket connection gets a file-tree watcher
//! and optionally a shell, and workspaces are provisioned from object storage
//! or local templates.

pub mod config;
pub mod error;
pub mod fs;
pub mod gateway;
pub mod provision;
pub mod pty;
pub mod routes;
pub mod state;
pub mod watcher;

pub use config::AppConfig;
pub use routes::create_router;
pub use state::AppState;
