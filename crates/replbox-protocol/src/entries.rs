//! File tree entries and tree-diff events.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of a workspace entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Dir,
}

/// A node in a workspace file tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    /// Workspace-relative path with a leading `/`.
    pub path: String,
    /// Final path component.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
}

impl WorkspaceEntry {
    /// Build an entry from a workspace-relative path, deriving `name` from it.
    pub fn new(path: impl Into<String>, kind: EntryKind) -> Self {
        let path = normalize_path(&path.into());
        let name = path.rsplit('/').next().unwrap_or_default().to_string();
        Self { path, name, kind }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// One change to a workspace tree, as pushed in `file:refresh`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TreeDiffEvent {
    #[serde(rename = "add")]
    Added { data: WorkspaceEntry },
    #[serde(rename = "unlink")]
    Removed { path: String },
}

impl TreeDiffEvent {
    pub fn added(entry: WorkspaceEntry) -> Self {
        Self::Added { data: entry }
    }

    pub fn removed(path: impl Into<String>) -> Self {
        Self::Removed {
            path: normalize_path(&path.into()),
        }
    }

    /// Path the event refers to.
    pub fn path(&self) -> &str {
        match self {
            Self::Added { data } => &data.path,
            Self::Removed { path } => path,
        }
    }
}

/// Client-side view of a workspace tree, rebuilt from the `loaded` snapshot
/// and the stream of `file:refresh` events.
///
/// Entries are keyed by path, so a repeated `Added` for the same path replaces
/// the previous entry instead of duplicating it.
#[derive(Debug, Clone, Default)]
pub struct TreeState {
    entries: BTreeMap<String, WorkspaceEntry>,
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(entries: impl IntoIterator<Item = WorkspaceEntry>) -> Self {
        let mut state = Self::new();
        for entry in entries {
            state.entries.insert(entry.path.clone(), entry);
        }
        state
    }

    pub fn apply(&mut self, event: &TreeDiffEvent) {
        match event {
            TreeDiffEvent::Added { data } => {
                self.entries.insert(data.path.clone(), data.clone());
            }
            TreeDiffEvent::Removed { path } => {
                // A removed directory takes its descendants with it.
                let prefix = format!("{}/", path.trim_end_matches('/'));
                self.entries
                    .retain(|key, _| key != path && !key.starts_with(&prefix));
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&WorkspaceEntry> {
        self.entries.get(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorted list of known paths.
    pub fn paths(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// Ensure a workspace-relative path starts with exactly one `/` and uses `/`
/// separators.
pub fn normalize_path(path: &str) -> String {
    let trimmed = path.replace('\\', "/");
    let trimmed = trimmed.trim_start_matches('/');
    format!("/{trimmed}")
}
