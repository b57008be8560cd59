//! Folder-level transfers between the object store and local disk.

use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::StorageError;
use crate::store::ObjectStore;

/// An object that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedObject {
    pub key: String,
    pub error: String,
}

/// Overall result of a multi-object transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferOutcome {
    /// Every listed object was transferred and the listing ran to completion.
    Completed,
    /// Some objects were transferred, but at least one failure occurred.
    Partial,
    /// Nothing was transferred and at least one failure occurred.
    Failed,
}

/// Per-object account of a folder transfer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransferReport {
    /// Source keys transferred successfully.
    pub transferred: Vec<String>,
    /// Objects whose transfer failed; siblings were not affected.
    pub failed: Vec<FailedObject>,
    /// Set when listing stopped early; objects on later pages were never seen.
    pub listing_error: Option<String>,
    /// Number of listing pages processed.
    pub pages: usize,
}

impl TransferReport {
    pub fn outcome(&self) -> TransferOutcome {
        let had_errors = !self.failed.is_empty() || self.listing_error.is_some();
        match (had_errors, self.transferred.is_empty()) {
            (false, _) => TransferOutcome::Completed,
            (true, true) => TransferOutcome::Failed,
            (true, false) => TransferOutcome::Partial,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome() == TransferOutcome::Completed
    }
}

/// Destination key for `key`: the first occurrence of `source_prefix` is
/// replaced by `destination_prefix`.
pub fn rewrite_key(key: &str, source_prefix: &str, destination_prefix: &str) -> String {
    key.replacen(source_prefix, destination_prefix, 1)
}

/// Mirrors key-prefix "folders" of one bucket.
#[derive(Clone)]
pub struct StorageMirror {
    store: Arc<dyn ObjectStore>,
}

impl StorageMirror {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Download every object under `prefix` into `local_dir`, at the path
    /// left after removing `prefix` from the key.
    ///
    /// Downloads within one listing page are issued together and awaited
    /// together. A failed download is recorded and does not abort its
    /// siblings; nothing is retried.
    pub async fn fetch_folder(&self, prefix: &str, local_dir: &Path) -> TransferReport {
        info!(
            "Fetching folder '{}' into {}",
            prefix,
            local_dir.display()
        );

        let store = self.store.clone();
        let report = self
            .for_each_page(prefix, |key| {
                let store = store.clone();
                let prefix = prefix.to_string();
                let local_dir = local_dir.to_path_buf();
                async move {
                    fetch_object(store.as_ref(), &prefix, &key, &local_dir)
                        .await
                        .map(|_| key.clone())
                        .map_err(|e| {
                            warn!("Error fetching {}: {}", key, e);
                            FailedObject {
                                key,
                                error: e.to_string(),
                            }
                        })
                }
            })
            .await;

        log_report("fetch", prefix, &report);
        report
    }

    /// Server-side copy of every object under `source_prefix` to the
    /// matching key under `destination_prefix`.
    ///
    /// Pages are processed one at a time, so at most one page of copies is in
    /// flight; the operation returns only after the final, non-truncated page.
    pub async fn copy_folder(&self, source_prefix: &str, destination_prefix: &str) -> TransferReport {
        info!(
            "Copying folder '{}' to '{}'",
            source_prefix, destination_prefix
        );

        // Copies into a nested destination show up in later pages of the same
        // listing; those must not be copied again.
        let nested = destination_prefix.starts_with(source_prefix)
            && destination_prefix != source_prefix;

        let store = self.store.clone();
        let report = self
            .for_each_page(source_prefix, |key| {
                let store = store.clone();
                let skip = nested && key.starts_with(destination_prefix);
                let destination_key = rewrite_key(&key, source_prefix, destination_prefix);
                async move {
                    if skip {
                        debug!("Skipping {} (inside destination prefix)", key);
                        return Ok(None);
                    }
                    match store.copy(&key, &destination_key).await {
                        Ok(()) => {
                            debug!("Copied {} to {}", key, destination_key);
                            Ok(Some(key))
                        }
                        Err(e) => {
                            warn!("Error copying {}: {}", key, e);
                            Err(FailedObject {
                                key,
                                error: e.to_string(),
                            })
                        }
                    }
                }
            })
            .await;

        log_report("copy", source_prefix, &report);
        report
    }

    /// Upload (create or overwrite) a single object at `prefix + relative_path`.
    pub async fn save(
        &self,
        prefix: &str,
        relative_path: &str,
        content: impl Into<Bytes>,
    ) -> Result<(), StorageError> {
        let key = format!("{prefix}{relative_path}");
        let content = content.into();
        let size = content.len();

        self.store.put(&key, content).await.inspect_err(|e| {
            error!("Error saving {}: {}", key, e);
        })?;

        debug!("Saved {} ({} bytes)", key, size);
        Ok(())
    }

    /// Walk every listing page under `prefix`, running `per_object` for all
    /// keys of a page concurrently before requesting the next page.
    ///
    /// `per_object` resolves to `Ok(Some(key))` for a transferred object,
    /// `Ok(None)` for a skipped one and `Err` for a failure.
    async fn for_each_page<F, Fut, T>(&self, prefix: &str, mut per_object: F) -> TransferReport
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, FailedObject>>,
        T: Into<Option<String>>,
    {
        let mut report = TransferReport::default();
        let mut continuation_token: Option<String> = None;

        loop {
            let page = match self
                .store
                .list_page(prefix, continuation_token.take())
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    error!("Listing '{}' failed: {}", prefix, e);
                    report.listing_error = Some(e.to_string());
                    break;
                }
            };
            report.pages += 1;

            let results = join_all(page.keys.into_iter().map(&mut per_object)).await;
            for result in results {
                match result {
                    Ok(done) => {
                        if let Some(key) = done.into() {
                            report.transferred.push(key);
                        }
                    }
                    Err(failed) => report.failed.push(failed),
                }
            }

            if !page.is_truncated {
                break;
            }

            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => {
                    let e = StorageError::TruncatedWithoutToken {
                        prefix: prefix.to_string(),
                    };
                    error!("{}", e);
                    report.listing_error = Some(e.to_string());
                    break;
                }
            }
        }

        report
    }
}

/// Download one object and write it below `local_dir`.
async fn fetch_object(
    store: &dyn ObjectStore,
    prefix: &str,
    key: &str,
    local_dir: &Path,
) -> Result<(), StorageError> {
    let Some(relative) = local_relative_path(prefix, key)? else {
        // Directory marker object
        let dir = local_dir.join(key.replacen(prefix, "", 1).trim_matches('/'));
        return tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::LocalIo { path: dir, source });
    };

    let body = store.get(key).await?;
    let path = local_dir.join(relative);

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StorageError::LocalIo {
                path: parent.to_path_buf(),
                source,
            })?;
    }

    tokio::fs::write(&path, &body)
        .await
        .map_err(|source| StorageError::LocalIo {
            path: path.clone(),
            source,
        })?;

    debug!("Downloaded {} to {}", key, path.display());
    Ok(())
}

/// Local path for `key` relative to the fetch directory.
///
/// Returns `None` for directory marker keys (ending in `/`), including a
/// marker equal to the prefix. Keys whose
/// remainder would escape the directory are rejected.
fn local_relative_path(prefix: &str, key: &str) -> Result<Option<PathBuf>, StorageError> {
    let remainder = key.replacen(prefix, "", 1);
    // A marker for the prefix itself maps to the fetch directory.
    if remainder.ends_with('/') || (remainder.is_empty() && key.ends_with('/')) {
        let marker = Path::new(remainder.trim_matches('/'));
        if marker
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        return Ok(None);
    }

    let remainder = remainder.trim_start_matches('/');
    if remainder.is_empty() {
        return Err(StorageError::InvalidKey(key.to_string()));
    }

    let mut relative = PathBuf::new();
    for component in Path::new(remainder).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => continue,
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::InvalidKey(key.to_string()));
            }
        }
    }

    Ok(Some(relative))
}

fn log_report(operation: &str, prefix: &str, report: &TransferReport) {
    match report.outcome() {
        TransferOutcome::Completed => info!(
            "{} '{}' completed: {} objects over {} pages",
            operation,
            prefix,
            report.transferred.len(),
            report.pages
        ),
        outcome => warn!(
            "{} '{}' {:?}: {} transferred, {} failed, listing error: {:?}",
            operation,
            prefix,
            outcome,
            report.transferred.len(),
            report.failed.len(),
            report.listing_error
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::ListPage;
    use async_trait::async_trait;
    use tempfile::TempDir;

    /// Store whose listing always reports more pages but never a token.
    struct TokenlessStore;

    #[async_trait]
    impl ObjectStore for TokenlessStore {
        async fn list_page(
            &self,
            _prefix: &str,
            _continuation_token: Option<String>,
        ) -> Result<ListPage, StorageError> {
            Ok(ListPage {
                keys: vec!["src/a".to_string()],
                is_truncated: true,
                next_continuation_token: None,
            })
        }

        async fn get(&self, _key: &str) -> Result<Bytes, StorageError> {
            Ok(Bytes::from_static(b"a"))
        }

        async fn put(&self, _key: &str, _body: Bytes) -> Result<(), StorageError> {
            Ok(())
        }

        async fn copy(&self, _source: &str, _destination: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    /// Store that cannot list at all.
    struct UnreachableStore;

    #[async_trait]
    impl ObjectStore for UnreachableStore {
        async fn list_page(
            &self,
            prefix: &str,
            _continuation_token: Option<String>,
        ) -> Result<ListPage, StorageError> {
            Err(StorageError::List {
                prefix: prefix.to_string(),
                message: "connection refused".to_string(),
            })
        }

        async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
            Err(StorageError::NotFound(key.to_string()))
        }

        async fn put(&self, key: &str, _body: Bytes) -> Result<(), StorageError> {
            Err(StorageError::Put {
                key: key.to_string(),
                message: "connection refused".to_string(),
            })
        }

        async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError> {
            Err(StorageError::Copy {
                source_key: source.to_string(),
                destination_key: destination.to_string(),
                message: "connection refused".to_string(),
            })
        }
    }

    fn mirror_over(store: Arc<MemoryStore>) -> StorageMirror {
        StorageMirror::new(store)
    }

    #[test]
    fn test_rewrite_key_replaces_first_occurrence_only() {
        assert_eq!(
            rewrite_key("base/node/index.js", "base/node", "code/proj1"),
            "code/proj1/index.js"
        );
        assert_eq!(
            rewrite_key("base/node/base/node/x.js", "base/node", "code/proj1"),
            "code/proj1/base/node/x.js"
        );
    }

    #[test]
    fn test_local_relative_path() {
        assert_eq!(
            local_relative_path("code/proj1/", "code/proj1/src/app.js").unwrap(),
            Some(PathBuf::from("src/app.js"))
        );
        assert_eq!(
            local_relative_path("code/proj1", "code/proj1/index.js").unwrap(),
            Some(PathBuf::from("index.js"))
        );
        assert_eq!(
            local_relative_path("code/proj1/", "code/proj1/src/").unwrap(),
            None
        );
        assert!(matches!(
            local_relative_path("code/proj1/", "code/proj1/../../etc/passwd"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_prefix_marker_is_the_fetch_root() {
        assert_eq!(local_relative_path("code/p/", "code/p/").unwrap(), None);
        assert_eq!(local_relative_path("code/p", "code/p/").unwrap(), None);
        assert!(matches!(
            local_relative_path("code/p", "code/p"),
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_folder_with_prefix_marker_completes() {
        let store = Arc::new(MemoryStore::new());
        store.insert("code/p/", "").await;
        store.insert("code/p/index.js", "hello").await;

        let temp = TempDir::new().unwrap();
        let local = temp.path().join("p");
        let report = mirror_over(store).fetch_folder("code/p/", &local).await;

        assert_eq!(report.outcome(), TransferOutcome::Completed);
        assert!(report.failed.is_empty());
        assert_eq!(report.transferred.len(), 2);
        assert!(local.is_dir());
        assert_eq!(
            std::fs::read_to_string(local.join("index.js")).unwrap(),
            "hello"
        );
    }

    #[test]
    fn test_outcome_classification() {
        let mut report = TransferReport::default();
        assert_eq!(report.outcome(), TransferOutcome::Completed);

        report.failed.push(FailedObject {
            key: "a".into(),
            error: "boom".into(),
        });
        assert_eq!(report.outcome(), TransferOutcome::Failed);

        report.transferred.push("b".into());
        assert_eq!(report.outcome(), TransferOutcome::Partial);

        report.failed.clear();
        report.listing_error = Some("page 2 failed".into());
        assert_eq!(report.outcome(), TransferOutcome::Partial);
    }

    #[tokio::test]
    async fn test_fetch_folder_writes_files_below_local_dir() {
        let store = Arc::new(MemoryStore::new());
        store.insert("code/proj1/index.js", "hello").await;
        store.insert("code/proj1/src/app.js", "world").await;
        store.insert("code/proj2/other.js", "nope").await;

        let temp = TempDir::new().unwrap();
        let local = temp.path().join("proj1");

        let report = mirror_over(store)
            .fetch_folder("code/proj1/", &local)
            .await;

        assert!(report.is_complete());
        assert_eq!(report.transferred.len(), 2);
        assert_eq!(
            std::fs::read_to_string(local.join("index.js")).unwrap(),
            "hello"
        );
        assert_eq!(
            std::fs::read_to_string(local.join("src/app.js")).unwrap(),
            "world"
        );
        assert!(!local.join("other.js").exists());
    }

    #[tokio::test]
    async fn test_fetch_folder_follows_pagination() {
        let store = Arc::new(MemoryStore::with_page_size(2));
        for i in 0..5 {
            store
                .insert(format!("code/p/file{i}.txt"), format!("{i}"))
                .await;
        }

        let temp = TempDir::new().unwrap();
        let report = mirror_over(store.clone())
            .fetch_folder("code/p/", temp.path())
            .await;

        assert!(report.is_complete());
        assert_eq!(report.pages, 3);
        for i in 0..5 {
            assert_eq!(
                std::fs::read_to_string(temp.path().join(format!("file{i}.txt"))).unwrap(),
                format!("{i}")
            );
        }
    }

    #[tokio::test]
    async fn test_fetch_folder_isolates_failures() {
        let store = Arc::new(MemoryStore::new());
        store.insert("code/p/good.txt", "ok").await;
        store.insert("code/p/bad.txt", "broken").await;
        store.fail_on("code/p/bad.txt").await;

        let temp = TempDir::new().unwrap();
        let report = mirror_over(store).fetch_folder("code/p/", temp.path()).await;

        assert_eq!(report.outcome(), TransferOutcome::Partial);
        assert_eq!(report.transferred, vec!["code/p/good.txt"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].key, "code/p/bad.txt");
        assert!(temp.path().join("good.txt").exists());
        assert!(!temp.path().join("bad.txt").exists());
    }

    #[tokio::test]
    async fn test_copy_folder_copies_every_page() {
        let store = Arc::new(MemoryStore::with_page_size(3));
        for i in 0..8 {
            store
                .insert(format!("base/node/f{i}.js"), format!("content {i}"))
                .await;
        }
        store.insert("base/python/main.py", "print()").await;

        let report = mirror_over(store.clone())
            .copy_folder("base/node", "code/proj1")
            .await;

        assert!(report.is_complete());
        assert_eq!(report.transferred.len(), 8);
        assert_eq!(report.pages, 3);
        assert_eq!(store.list_calls(), 3);

        let copied = store.keys_with_prefix("code/proj1/").await;
        assert_eq!(copied.len(), 8);
        for i in 0..8 {
            let key = format!("code/proj1/f{i}.js");
            assert_eq!(
                store.object(&key).await.unwrap(),
                Bytes::from(format!("content {i}"))
            );
        }
        assert!(store.object("code/proj1/main.py").await.is_none());
        assert_eq!(store.keys_with_prefix("base/node/").await.len(), 8);
    }

    #[tokio::test]
    async fn test_copy_folder_reports_partial_failure() {
        let store = Arc::new(MemoryStore::with_page_size(2));
        store.insert("base/a", "a").await;
        store.insert("base/b", "b").await;
        store.insert("base/c", "c").await;
        store.fail_on("base/b").await;

        let report = mirror_over(store.clone()).copy_folder("base/", "code/x/").await;

        assert_eq!(report.outcome(), TransferOutcome::Partial);
        assert_eq!(report.transferred, vec!["base/a", "base/c"]);
        assert_eq!(report.failed[0].key, "base/b");
        assert!(store.object("code/x/c").await.is_some());
    }

    #[tokio::test]
    async fn test_copy_folder_into_nested_destination_terminates() {
        let store = Arc::new(MemoryStore::with_page_size(1));
        store.insert("ws/a", "a").await;
        store.insert("ws/b", "b").await;

        let report = mirror_over(store.clone())
            .copy_folder("ws/", "ws/backup/")
            .await;

        assert!(report.is_complete());
        assert_eq!(report.transferred, vec!["ws/a", "ws/b"]);
        assert_eq!(
            store.keys_with_prefix("ws/backup/").await,
            vec!["ws/backup/a", "ws/backup/b"]
        );
    }

    #[tokio::test]
    async fn test_copy_folder_empty_prefix_completes() {
        let store = Arc::new(MemoryStore::new());
        let report = mirror_over(store).copy_folder("base/none/", "code/x/").await;
        assert!(report.is_complete());
        assert!(report.transferred.is_empty());
        assert_eq!(report.pages, 1);
    }

    #[tokio::test]
    async fn test_truncated_listing_without_token_is_reported() {
        let mirror = StorageMirror::new(Arc::new(TokenlessStore));
        let report = mirror.copy_folder("src/", "dst/").await;

        assert_eq!(report.outcome(), TransferOutcome::Partial);
        assert!(report.listing_error.unwrap().contains("continuation token"));
        assert_eq!(report.pages, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_reports_failure() {
        let mirror = StorageMirror::new(Arc::new(UnreachableStore));

        let temp = TempDir::new().unwrap();
        let report = mirror.fetch_folder("code/p/", temp.path()).await;
        assert_eq!(report.outcome(), TransferOutcome::Failed);
        assert_eq!(report.pages, 0);

        let result = mirror.save("code/p", "/index.js", "x").await;
        assert!(matches!(result, Err(StorageError::Put { .. })));
    }

    #[tokio::test]
    async fn test_save_concatenates_prefix_and_path() {
        let store = Arc::new(MemoryStore::new());
        let mirror = mirror_over(store.clone());

        mirror
            .save("code/proj1", "/src/index.js", "v1")
            .await
            .unwrap();
        mirror
            .save("code/proj1", "/src/index.js", "v2")
            .await
            .unwrap();

        assert_eq!(
            store.object("code/proj1/src/index.js").await.unwrap(),
            Bytes::from_static(b"v2")
        );
    }
}
