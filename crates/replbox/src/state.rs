use std::path::{Path, PathBuf};
use std::sync::Arc;

use replbox_storage::StorageMirror;

use crate::config::{AppConfig, StorageConfig};
use crate::pty::PtyManager;

/// Shared state for HTTP handlers and WebSocket sessions.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pty: Arc<PtyManager>,
    pub mirror: Option<StorageMirror>,
}

impl AppState {
    pub fn new(config: AppConfig, mirror: Option<StorageMirror>) -> Self {
        let pty = Arc::new(PtyManager::new(config.terminal.clone()));
        Self {
            config: Arc::new(config),
            pty,
            mirror,
        }
    }

    pub fn workspaces_root(&self) -> &Path {
        &self.config.workspaces.root
    }

    /// Directory backing `workspace_id`. The id must already be validated.
    pub fn workspace_dir(&self, workspace_id: &str) -> PathBuf {
        self.config.workspaces.root.join(workspace_id)
    }

    /// Storage settings together with a mirror, when both are available.
    pub fn storage(&self) -> Option<(&StorageConfig, &StorageMirror)> {
        self.config.storage.as_ref().zip(self.mirror.as_ref())
    }
}
