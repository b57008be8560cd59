use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to list objects under '{prefix}': {message}")]
    List { prefix: String, message: String },

    #[error("Listing under '{prefix}' was truncated without a continuation token")]
    TruncatedWithoutToken { prefix: String },

    #[error("Failed to get object '{key}': {message}")]
    Get { key: String, message: String },

    #[error("Failed to put object '{key}': {message}")]
    Put { key: String, message: String },

    #[error("Failed to copy '{source_key}' to '{destination_key}': {message}")]
    Copy {
        source_key: String,
        destination_key: String,
        message: String,
    },

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key for local path: {0}")]
    InvalidKey(String),

    #[error("Local IO error at {path}: {source}")]
    LocalIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
