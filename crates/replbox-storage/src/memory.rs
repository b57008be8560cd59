//! In-memory object store.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use crate::error::StorageError;
use crate::store::{ListPage, ObjectStore};

/// Default page size, matching the S3 `ListObjectsV2` maximum.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Object store kept in process memory.
///
/// Listings are paginated with the last returned key as the continuation
/// token, so a small `page_size` exercises the same multi-page paths as a
/// large bucket. Keys registered with [`MemoryStore::fail_on`] fail on get
/// and copy.
#[derive(Debug)]
pub struct MemoryStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    failing: RwLock<HashSet<String>>,
    page_size: usize,
    list_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_page_size(DEFAULT_PAGE_SIZE)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: RwLock::new(BTreeMap::new()),
            failing: RwLock::new(HashSet::new()),
            page_size: page_size.max(1),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub async fn insert(&self, key: impl Into<String>, body: impl Into<Bytes>) {
        self.objects.write().await.insert(key.into(), body.into());
    }

    pub async fn fail_on(&self, key: impl Into<String>) {
        self.failing.write().await.insert(key.into());
    }

    pub async fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    /// Keys under `prefix`, sorted.
    pub async fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.objects
            .read()
            .await
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Number of `list_page` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    async fn check_failing(&self, key: &str) -> bool {
        self.failing.read().await.contains(key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.objects.read().await;

        let lower = match continuation_token {
            Some(token) => Bound::Excluded(token),
            None => Bound::Unbounded,
        };

        let mut keys: Vec<String> = objects
            .range((lower, Bound::Unbounded))
            .map(|(key, _)| key)
            .filter(|key| key.starts_with(prefix))
            .take(self.page_size + 1)
            .cloned()
            .collect();

        let is_truncated = keys.len() > self.page_size;
        if is_truncated {
            keys.truncate(self.page_size);
        }
        let next_continuation_token = if is_truncated {
            keys.last().cloned()
        } else {
            None
        };

        Ok(ListPage {
            keys,
            is_truncated,
            next_continuation_token,
        })
    }

    async fn get(&self, key: &str) -> Result<Bytes, StorageError> {
        if self.check_failing(key).await {
            return Err(StorageError::Get {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.objects
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        if self.check_failing(key).await {
            return Err(StorageError::Put {
                key: key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        self.objects.write().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn copy(&self, source_key: &str, destination_key: &str) -> Result<(), StorageError> {
        if self.check_failing(source_key).await {
            return Err(StorageError::Copy {
                source_key: source_key.to_string(),
                destination_key: destination_key.to_string(),
                message: "injected failure".to_string(),
            });
        }
        let mut objects = self.objects.write().await;
        let body = objects
            .get(source_key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(source_key.to_string()))?;
        objects.insert(destination_key.to_string(), body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_pages_follow_tokens() {
        let store = MemoryStore::with_page_size(2);
        for name in ["a", "b", "c", "d", "e"] {
            store.insert(format!("p/{name}"), "x").await;
        }
        store.insert("q/other", "x").await;

        let first = store.list_page("p/", None).await.unwrap();
        assert_eq!(first.keys, vec!["p/a", "p/b"]);
        assert!(first.is_truncated);

        let second = store
            .list_page("p/", first.next_continuation_token)
            .await
            .unwrap();
        assert_eq!(second.keys, vec!["p/c", "p/d"]);
        assert!(second.is_truncated);

        let third = store
            .list_page("p/", second.next_continuation_token)
            .await
            .unwrap();
        assert_eq!(third.keys, vec!["p/e"]);
        assert!(!third.is_truncated);
        assert!(third.next_continuation_token.is_none());
        assert_eq!(store.list_calls(), 3);
    }

    #[tokio::test]
    async fn test_exact_page_is_not_truncated() {
        let store = MemoryStore::with_page_size(2);
        store.insert("p/a", "x").await;
        store.insert("p/b", "x").await;

        let page = store.list_page("p/", None).await.unwrap();
        assert_eq!(page.keys.len(), 2);
        assert!(!page.is_truncated);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.insert("k", "v").await;
        store.fail_on("k").await;

        assert!(matches!(store.get("k").await, Err(StorageError::Get { .. })));
        assert!(matches!(
            store.copy("k", "k2").await,
            Err(StorageError::Copy { .. })
        ));
        assert!(matches!(
            store.get("missing").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
