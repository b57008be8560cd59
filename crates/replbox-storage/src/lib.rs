//! Object storage mirror for replbox workspaces.
//!
//! Moves whole workspace "folders" (key-prefix trees) between a bucket and
//! local disk, and between two prefixes of the same bucket. Listings are
//! followed page by page until the store reports no continuation token;
//! transfers within one page run concurrently.
//!
//! The mirror talks to storage through the [`ObjectStore`] trait. Two
//! implementations ship with the crate: [`S3Store`] for S3-compatible
//! services and [`MemoryStore`] for tests and local development.

pub mod error;
pub mod memory;
pub mod mirror;
pub mod s3;
pub mod store;

pub use error::StorageError;
pub use memory::MemoryStore;
pub use mirror::{FailedObject, StorageMirror, TransferOutcome, TransferReport, rewrite_key};
pub use s3::{S3Config, S3Store};
pub use store::{ListPage, ObjectStore};
