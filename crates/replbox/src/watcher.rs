//! Workspace Watcher Bridge.
//!
//! Turns `notify` events for a workspace tree into [`TreeDiffEvent`]s.
//! Creations and deletions are reported; content modifications are not.
//! Events are forwarded in the order the OS delivers them. Missed events under
//! heavy bulk changes are a known limitation of the underlying notification
//! mechanism and are not compensated for.

use std::path::{Path, PathBuf};

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{CreateKind, ModifyKind, RemoveKind, RenameMode},
};
use replbox_protocol::{EntryKind, TreeDiffEvent, WorkspaceEntry};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::fs::{is_hidden, relative_entry_path};

const RAW_EVENT_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("workspace directory does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("failed to watch {path}: {source}")]
    Notify {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// A running watch. Dropping it stops the watch.
pub struct WatcherHandle {
    root: PathBuf,
    watcher: Option<RecommendedWatcher>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    /// Release the OS watch and stop forwarding. Safe to call more than once.
    pub fn stop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            drop(watcher);
            info!("Stopped watching {}", self.root.display());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Watch `root` recursively, sending one diff event per relevant
/// notification to `events`. Pre-existing entries are not reported.
pub fn start(root: &Path, events: mpsc::Sender<TreeDiffEvent>) -> Result<WatcherHandle, WatchError> {
    let root = root
        .canonicalize()
        .map_err(|_| WatchError::MissingRoot(root.to_path_buf()))?;
    if !root.is_dir() {
        return Err(WatchError::MissingRoot(root));
    }

    let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(RAW_EVENT_BUFFER);
    let mut watcher = notify::recommended_watcher(move |res| {
        if tx.blocking_send(res).is_err() {
            debug!("File watch channel closed");
        }
    })
    .map_err(|source| WatchError::Notify {
        path: root.clone(),
        source,
    })?;

    watcher
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|source| WatchError::Notify {
            path: root.clone(),
            source,
        })?;

    let task_root = root.clone();
    let task = tokio::spawn(async move {
        while let Some(incoming) = rx.recv().await {
            let event = match incoming {
                Ok(event) => event,
                Err(err) => {
                    warn!("Watcher error: {:?}", err);
                    continue;
                }
            };

            for diff in translate(&task_root, &event) {
                debug!("Workspace change: {:?}", diff);
                if events.send(diff).await.is_err() {
                    return;
                }
            }
        }
    });

    info!("Watching {}", root.display());
    Ok(WatcherHandle {
        root,
        watcher: Some(watcher),
        task: Some(task),
    })
}

/// Map one notification to zero or more diff events.
///
/// Renames become `Removed(old)` followed by `Added(new)`. Backends that
/// report a combined rename also report its two halves, so the combined form
/// is skipped.
pub fn translate(root: &Path, event: &Event) -> Vec<TreeDiffEvent> {
    let mut diffs = Vec::new();

    match &event.kind {
        EventKind::Create(kind) => {
            for path in &event.paths {
                let hint = matches!(kind, CreateKind::Folder).then_some(EntryKind::Dir);
                if let Some(diff) = added(root, path, hint) {
                    diffs.push(diff);
                }
            }
        }
        EventKind::Remove(_) => {
            for path in &event.paths {
                if let Some(diff) = removed(root, path) {
                    diffs.push(diff);
                }
            }
        }
        EventKind::Modify(ModifyKind::Name(mode)) => match mode {
            RenameMode::From => {
                diffs.extend(event.paths.iter().filter_map(|p| removed(root, p)));
            }
            RenameMode::To => {
                diffs.extend(event.paths.iter().filter_map(|p| added(root, p, None)));
            }
            RenameMode::Both => {}
            RenameMode::Any | RenameMode::Other => {
                for path in &event.paths {
                    let diff = if path.exists() {
                        added(root, path, None)
                    } else {
                        removed(root, path)
                    };
                    diffs.extend(diff);
                }
            }
        },
        _ => {}
    }

    diffs
}

fn visible_relative(root: &Path, path: &Path) -> Option<String> {
    let relative = relative_entry_path(root, path);
    if relative.is_empty() || relative.split('/').any(is_hidden) {
        return None;
    }
    Some(relative)
}

fn added(root: &Path, path: &Path, hint: Option<EntryKind>) -> Option<TreeDiffEvent> {
    let relative = visible_relative(root, path)?;
    let kind = match hint {
        Some(kind) => kind,
        None if path.is_dir() => EntryKind::Dir,
        None => EntryKind::File,
    };
    Some(TreeDiffEvent::added(WorkspaceEntry::new(relative, kind)))
}

fn removed(root: &Path, path: &Path) -> Option<TreeDiffEvent> {
    visible_relative(root, path).map(TreeDiffEvent::removed)
}
