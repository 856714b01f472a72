use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use url::Url;

/// Ledger identifier of a swap job.
pub type JobId = i64;

/// Status of a swap job in the async pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// Completed and Failed jobs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Which processing branch a job runs through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, EnumString, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum JobKind {
    Image,
    Video,
}

/// Reference to a job input, resolved once when the job is loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaRef {
    /// Object reachable over HTTP(S).
    Remote(Url),
    /// File under the legacy upload root, stored relative to it.
    Legacy(PathBuf),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaRefError {
    #[error("media reference is empty")]
    Empty,

    #[error("invalid media URL {0}")]
    InvalidUrl(String),
}

impl MediaRef {
    /// Classify a stored reference string.
    ///
    /// `http://` and `https://` references are remote; anything else is a
    /// path under the legacy root. A leading `/` (as in `/static/uploads/a.jpg`)
    /// is dropped so the path stays relative to that root.
    pub fn parse(raw: &str) -> Result<Self, MediaRefError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(MediaRefError::Empty);
        }

        let lower = raw.to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            let url = Url::parse(raw).map_err(|_| MediaRefError::InvalidUrl(raw.to_string()))?;
            return Ok(MediaRef::Remote(url));
        }

        let relative = raw.trim_start_matches('/');
        if relative.is_empty() {
            return Err(MediaRefError::Empty);
        }
        Ok(MediaRef::Legacy(PathBuf::from(relative)))
    }

    /// Lowercased file extension of the referenced object, if it has one.
    pub fn extension(&self) -> Option<String> {
        let name = match self {
            MediaRef::Remote(url) => url
                .path_segments()
                .and_then(|mut segments| segments.next_back())
                .unwrap_or_default()
                .to_string(),
            MediaRef::Legacy(path) => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };

        Path::new(&name)
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .filter(|ext| !ext.is_empty())
    }
}

impl std::fmt::Display for MediaRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaRef::Remote(url) => write!(f, "{}", url),
            MediaRef::Legacy(path) => write!(f, "legacy:{}", path.display()),
        }
    }
}

/// A face swap job as recorded in the ledger.
#[derive(Debug, Clone)]
pub struct SwapJob {
    pub id: JobId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Gems charged when the job was submitted.
    pub cost: i32,
    pub source_ref: MediaRef,
    pub template_ref: MediaRef,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
