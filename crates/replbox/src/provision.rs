//! Workspace provisioning: `POST /project`.
//!
//! With object storage configured, the language's base tree is copied to the
//! workspace's code prefix and then fetched to local disk. Without storage a
//! local template directory is copied instead.

use std::path::{Path, PathBuf};

use axum::{Json, extract::State};
use replbox_storage::{TransferOutcome, TransferReport};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::error::{ApiError, FsError};
use crate::fs::resolve_path;
use crate::gateway::validate_workspace_id;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    #[serde(rename = "replId")]
    pub repl_id: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReportSummary {
    pub outcome: TransferOutcome,
    #[serde(flatten)]
    pub report: TransferReport,
}

impl From<TransferReport> for ReportSummary {
    fn from(report: TransferReport) -> Self {
        Self {
            outcome: report.outcome(),
            report,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ProvisionResponse {
    Storage {
        #[serde(rename = "replId")]
        repl_id: String,
        copy: ReportSummary,
        fetch: ReportSummary,
    },
    Template {
        #[serde(rename = "replId")]
        repl_id: String,
        files: usize,
    },
}

/// POST /project
pub async fn create_project(
    State(state): State<AppState>,
    Json(request): Json<CreateProjectRequest>,
) -> Result<Json<ProvisionResponse>, ApiError> {
    let repl_id = validate_workspace_id(request.repl_id.as_deref())?;
    let language = validate_language(request.language.as_deref())?;
    let destination = state.workspace_dir(&repl_id);

    info!("Provisioning workspace {} ({})", repl_id, language);

    if let Some((storage, mirror)) = state.storage() {
        let copy = mirror
            .copy_folder(&storage.base_folder(&language), &storage.code_folder(&repl_id))
            .await;
        match copy.outcome() {
            TransferOutcome::Failed => {
                return Err(ApiError::Storage(format!(
                    "copying base content for {language} failed"
                )));
            }
            TransferOutcome::Completed if copy.transferred.is_empty() => {
                return Err(ApiError::BadRequest(
                    "Invalid language or base content missing".to_string(),
                ));
            }
            _ => {}
        }

        let fetch = mirror
            .fetch_folder(&storage.code_folder(&repl_id), &destination)
            .await;
        if fetch.outcome() == TransferOutcome::Failed {
            return Err(ApiError::Storage(format!(
                "fetching workspace {repl_id} failed"
            )));
        }

        return Ok(Json(ProvisionResponse::Storage {
            repl_id,
            copy: copy.into(),
            fetch: fetch.into(),
        }));
    }

    let template = resolve_path(&state.config.workspaces.templates_dir, &language)?;
    if !template.is_dir() {
        return Err(ApiError::BadRequest(
            "Invalid language or base content missing".to_string(),
        ));
    }

    let files = tokio::task::spawn_blocking(move || copy_tree(&template, &destination))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;

    info!("Workspace {} created from template ({} files)", repl_id, files);
    Ok(Json(ProvisionResponse::Template { repl_id, files }))
}

fn validate_language(raw: Option<&str>) -> Result<String, ApiError> {
    let language = raw.map(str::trim).unwrap_or_default();
    let valid = !language.is_empty()
        && !language.starts_with('.')
        && language
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(ApiError::BadRequest(format!("Invalid language: {language:?}")));
    }
    Ok(language.to_string())
}

/// Recursively copy `source` into `destination`, merging with existing
/// content. Returns the number of files copied.
fn copy_tree(source: &Path, destination: &Path) -> Result<usize, FsError> {
    std::fs::create_dir_all(destination)?;

    let mut files = 0;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| FsError::InvalidPath(entry.path().display().to_string()))?;
        let target: PathBuf = destination.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
            files += 1;
        } else {
            warn!("Skipping non-regular template entry {}", entry.path().display());
        }
    }
    Ok(files)
}
