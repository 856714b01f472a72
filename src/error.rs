//! Failure taxonomy for a single swap job.

use strum::Display;

use crate::services::face_model::FaceModelError;
use crate::services::stager::StageError;
use crate::services::transcode::TranscodeError;

/// Which job input an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum InputRole {
    Source,
    Template,
}

/// Everything that can end a job in the Failed state.
#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("failed to stage {role} media: {error}")]
    Stage {
        role: InputRole,
        #[source]
        error: StageError,
    },

    #[error("no face detected in {0}")]
    NoFaceDetected(InputRole),

    #[error(transparent)]
    Transcode(#[from] TranscodeError),

    #[error("template video contains no frames")]
    NoFrames,

    #[error("failed to upload result: {0}")]
    UploadFailed(String),

    #[error("face model error: {0}")]
    FaceModel(#[from] FaceModelError),

    #[error("image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("processing aborted unexpectedly: {0}")]
    Panicked(String),
}

impl SwapError {
    pub fn stage(role: InputRole, error: StageError) -> Self {
        Self::Stage { role, error }
    }

    /// Short label used for metrics and log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            SwapError::Stage { error, .. } => match error {
                StageError::NotFound(_) => "stage_not_found",
                StageError::DownloadFailed { .. } => "download_failed",
                StageError::InvalidReference(_) => "invalid_reference",
                StageError::Io(_) => "stage_io",
            },
            SwapError::NoFaceDetected(_) => "no_face_detected",
            SwapError::Transcode(TranscodeError::Timeout { .. }) => "transcode_timeout",
            SwapError::Transcode(_) | SwapError::NoFrames => "transcode_failed",
            SwapError::UploadFailed(_) => "upload_failed",
            SwapError::FaceModel(_) => "face_model",
            SwapError::Image(_) | SwapError::Io(_) | SwapError::Panicked(_) => "internal",
        }
    }

    /// Whether an operator re-queue could plausibly succeed with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SwapError::Transcode(_) | SwapError::FaceModel(_))
    }
}
