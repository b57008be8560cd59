//! Application configuration.
//!
//! Loaded from `$XDG_CONFIG_HOME/replbox/config.toml`, then overridden by
//! `REPLBOX__<SECTION>__<KEY>` environment variables and finally CLI flags.

use std::path::PathBuf;

use replbox_storage::S3Config;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub workspaces: WorkspacesConfig,
    pub terminal: TerminalConfig,
    /// Object storage mirror. Provisioning falls back to local templates when unset.
    pub storage: Option<StorageConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Capacity of each connection's outbound message queue.
    pub outbound_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            outbound_buffer: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspacesConfig {
    /// Directory holding one sub-directory per workspace id.
    pub root: PathBuf,
    /// Local template trees, one directory per language.
    pub templates_dir: PathBuf,
}

impl Default for WorkspacesConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./tmp"),
            templates_dir: PathBuf::from("./templates"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalConfig {
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    /// Value of `TERM` for spawned shells.
    pub term: String,
    /// Capacity of the per-terminal output channel, in chunks.
    pub output_buffer: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            cols: 100,
            rows: 24,
            term: "xterm".to_string(),
            output_buffer: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub bucket: String,
    /// Custom endpoint for S3-compatible services (MinIO, R2, ...).
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    /// Prefix holding the per-language base trees.
    #[serde(default = "default_base_prefix")]
    pub base_prefix: String,
    /// Prefix holding one tree per workspace.
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,
    /// Also upload every `updateContent` to the workspace's code prefix.
    #[serde(default)]
    pub mirror_writes: bool,
}

fn default_base_prefix() -> String {
    "base".to_string()
}

fn default_code_prefix() -> String {
    "code".to_string()
}

impl StorageConfig {
    pub fn s3(&self) -> S3Config {
        S3Config {
            bucket: self.bucket.clone(),
            endpoint: self.endpoint.clone(),
            region: self.region.clone(),
        }
    }

    /// `<base_prefix>/<language>/`
    pub fn base_folder(&self, language: &str) -> String {
        format!("{}/{}/", self.base_prefix.trim_end_matches('/'), language)
    }

    /// `<code_prefix>/<workspace_id>`, without a trailing slash so that
    /// workspace paths (which start with `/`) can be appended directly.
    pub fn code_key_prefix(&self, workspace_id: &str) -> String {
        format!("{}/{}", self.code_prefix.trim_end_matches('/'), workspace_id)
    }

    /// `<code_prefix>/<workspace_id>/`
    pub fn code_folder(&self, workspace_id: &str) -> String {
        format!("{}/", self.code_key_prefix(workspace_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
