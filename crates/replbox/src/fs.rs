//! Filesystem Adapter: workspace-scoped file access for the session gateway.

use std::cmp::Ordering;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use replbox_protocol::{EntryKind, WorkspaceEntry};
use tokio::fs;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::FsError;

/// File operations a session may perform inside its workspace.
///
/// All paths are workspace-relative (`/src/app.js`, `src/app.js` and `/` are
/// accepted).
#[async_trait]
pub trait WorkspaceFs: Send + Sync {
    /// Direct children of `dir`, directories first.
    async fn list_entries(&self, dir: &str) -> Result<Vec<WorkspaceEntry>, FsError>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;

    /// Create or fully overwrite `path`, creating missing parent directories.
    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), FsError>;

    /// Create `path` and any missing parents.
    async fn mkdir(&self, path: &str) -> Result<(), FsError>;

    /// Recursive listing of the whole workspace, hidden entries excluded.
    async fn snapshot(&self) -> Result<Vec<WorkspaceEntry>, FsError>;
}

/// [`WorkspaceFs`] over a local directory.
#[derive(Debug, Clone)]
pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> Result<PathBuf, FsError> {
        resolve_path(&self.root, relative)
    }
}

#[async_trait]
impl WorkspaceFs for LocalFs {
    async fn list_entries(&self, dir: &str) -> Result<Vec<WorkspaceEntry>, FsError> {
        let path = self.resolve(dir)?;
        let mut read_dir = fs::read_dir(&path)
            .await
            .map_err(|e| not_found_or_io(e, dir))?;

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if is_hidden(&name) {
                continue;
            }
            let kind = match entry.file_type().await {
                Ok(ft) if ft.is_dir() => EntryKind::Dir,
                Ok(_) => EntryKind::File,
                Err(e) => {
                    warn!("Skipping {}: {}", entry.path().display(), e);
                    continue;
                }
            };
            let relative = relative_entry_path(&self.root, &entry.path());
            entries.push(WorkspaceEntry::new(relative, kind));
        }

        entries.sort_by(dirs_first);
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let full = self.resolve(path)?;
        fs::read(&full).await.map_err(|e| not_found_or_io(e, path))
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if full == self.root {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full, bytes).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&full).await?;
        Ok(())
    }

    async fn snapshot(&self) -> Result<Vec<WorkspaceEntry>, FsError> {
        let root = self.root.clone();
        if !fs::metadata(&root).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(FsError::NotFound(root.display().to_string()));
        }

        tokio::task::spawn_blocking(move || walk_tree(&root))
            .await
            .map_err(|e| FsError::Io(std::io::Error::other(e)))?
    }
}

fn walk_tree(root: &Path) -> Result<Vec<WorkspaceEntry>, FsError> {
    let walker = WalkDir::new(root)
        .min_depth(1)
        .sort_by(|a, b| {
            b.file_type()
                .is_dir()
                .cmp(&a.file_type().is_dir())
                .then_with(|| a.file_name().cmp(b.file_name()))
        })
        .into_iter()
        .filter_entry(|e| !is_hidden(&e.file_name().to_string_lossy()));

    let mut entries = Vec::new();
    for entry in walker {
        let entry = entry.map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        let kind = if entry.file_type().is_dir() {
            EntryKind::Dir
        } else {
            EntryKind::File
        };
        entries.push(WorkspaceEntry::new(
            relative_entry_path(root, entry.path()),
            kind,
        ));
    }
    Ok(entries)
}

fn dirs_first(a: &WorkspaceEntry, b: &WorkspaceEntry) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.cmp(&b.name))
}

fn not_found_or_io(err: std::io::Error, path: &str) -> FsError {
    if err.kind() == std::io::ErrorKind::NotFound {
        FsError::NotFound(path.to_string())
    } else {
        FsError::Io(err)
    }
}

/// Dot-prefixed names are never shown to clients.
pub fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

/// Resolve a workspace-relative path below `root`.
///
/// The path is rebuilt component by component; `..` and absolute components
/// are rejected even when they would land inside the root.
pub fn resolve_path(root: &Path, relative: &str) -> Result<PathBuf, FsError> {
    let relative = relative.trim_start_matches('/');

    if relative.is_empty() || relative == "." {
        return Ok(root.to_path_buf());
    }

    let mut result = root.to_path_buf();

    for component in Path::new(relative).components() {
        match component {
            Component::Normal(name) => {
                if name.to_string_lossy().contains('\0') {
                    warn!("Path component contains null byte: {:?}", name);
                    return Err(FsError::PathTraversal);
                }
                result.push(name);
            }
            Component::ParentDir => {
                warn!("Path traversal attempt detected: parent directory (..) in path");
                return Err(FsError::PathTraversal);
            }
            Component::CurDir => continue,
            Component::RootDir | Component::Prefix(_) => {
                warn!("Absolute path component in relative path");
                return Err(FsError::PathTraversal);
            }
        }
    }

    Ok(result)
}

/// `/`-joined path of `full_path` relative to `root`, with a leading `/`.
/// Empty when `full_path` is not below `root`.
pub fn relative_entry_path(root: &Path, full_path: &Path) -> String {
    let Ok(relative) = full_path.strip_prefix(root) else {
        return String::new();
    };

    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect();

    if parts.is_empty() {
        return String::new();
    }
    format!("/{}", parts.join("/"))
}
