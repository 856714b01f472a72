use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use url::Url;

use crate::models::job::MediaRef;
use crate::services::storage::MediaStore;

/// A job input copied into the job workspace.
#[derive(Debug, Clone)]
pub struct StagedFile {
    pub path: PathBuf,
    pub bytes: u64,
}

/// Resolves job media references into local files.
pub struct ResourceStager {
    store: Arc<dyn MediaStore>,
    legacy_root: PathBuf,
}

impl ResourceStager {
    pub fn new(store: Arc<dyn MediaStore>, legacy_root: impl Into<PathBuf>) -> Self {
        Self {
            store,
            legacy_root: legacy_root.into(),
        }
    }

    /// Copy the referenced media to `dest`.
    ///
    /// On failure nothing is left behind at `dest`.
    pub async fn stage(&self, media: &MediaRef, dest: &Path) -> Result<StagedFile, StageError> {
        let result = match media {
            MediaRef::Remote(url) => self.stage_remote(url, dest).await,
            MediaRef::Legacy(path) => self.stage_legacy(path, dest).await,
        };

        if result.is_err() {
            remove_partial(dest).await;
        }
        result
    }

    async fn stage_remote(&self, url: &Url, dest: &Path) -> Result<StagedFile, StageError> {
        tracing::debug!(url = %url, dest = %dest.display(), "Downloading remote media");

        let bytes = self
            .store
            .download(url, dest)
            .await
            .map_err(|e| StageError::DownloadFailed {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if bytes == 0 {
            return Err(StageError::DownloadFailed {
                url: url.to_string(),
                reason: "empty response body".to_string(),
            });
        }

        Ok(StagedFile {
            path: dest.to_path_buf(),
            bytes,
        })
    }

    async fn stage_legacy(&self, relative: &Path, dest: &Path) -> Result<StagedFile, StageError> {
        let resolved = self.resolve_legacy(relative)?;
        tracing::debug!(path = %resolved.display(), dest = %dest.display(), "Copying legacy media");

        match tokio::fs::metadata(&resolved).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => {}
            Ok(_) => return Err(StageError::NotFound(resolved)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StageError::NotFound(resolved))
            }
            Err(e) => return Err(StageError::Io(e)),
        }

        let bytes = tokio::fs::copy(&resolved, dest).await?;
        Ok(StagedFile {
            path: dest.to_path_buf(),
            bytes,
        })
    }

    /// Join a legacy path onto the root, refusing anything that could escape it.
    fn resolve_legacy(&self, relative: &Path) -> Result<PathBuf, StageError> {
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(StageError::InvalidReference(relative.display().to_string()));
        }
        Ok(self.legacy_root.join(relative))
    }
}

async fn remove_partial(dest: &Path) {
    if let Err(e) = tokio::fs::remove_file(dest).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %dest.display(), error = %e, "Failed to remove partial staged file");
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("legacy media not found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("download of {url} failed: {reason}")]
    DownloadFailed { url: String, reason: String },

    #[error("invalid media reference {0}")]
    InvalidReference(String),

    #[error("IO error while staging: {0}")]
    Io(#[from] std::io::Error),
}
