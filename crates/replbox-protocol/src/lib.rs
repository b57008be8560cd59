//! Wire types for replbox workspace sessions.
//!
//! ```text
//! Browser <--[WS: ClientMessage / ServerMessage]--> Session Gateway
//!                                                    |-- PTY Session Manager
//!                                                    |-- Workspace Watcher Bridge
//!                                                    `-- Filesystem Adapter
//! ```
//!
//! Every frame is a JSON object tagged by its `event` field. Tree entries use
//! workspace-relative, `/`-separated paths with a leading slash.

pub mod entries;
pub mod messages;

pub use entries::{EntryKind, TreeDiffEvent, TreeState, WorkspaceEntry};
pub use messages::{ClientMessage, ServerMessage};
