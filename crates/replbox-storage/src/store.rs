//! Storage capability used by the mirror.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StorageError;

/// One page of a prefix listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    /// Object keys in this page.
    pub keys: Vec<String>,
    /// Whether more keys remain after this page.
    pub is_truncated: bool,
    /// Cursor for the next page; present whenever `is_truncated` is set.
    pub next_continuation_token: Option<String>,
}

/// Flat key/value object store with paginated prefix listings.
///
/// All operations target the single bucket the store was configured with.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List keys under `prefix`, starting at `continuation_token` when given.
    async fn list_page(
        &self,
        prefix: &str,
        continuation_token: Option<String>,
    ) -> Result<ListPage, StorageError>;

    /// Download an object body.
    async fn get(&self, key: &str) -> Result<Bytes, StorageError>;

    /// Create or overwrite an object.
    async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError>;

    /// Server-side copy; no data leaves the storage service.
    async fn copy(&self, source_key: &str, destination_key: &str) -> Result<(), StorageError>;
}
