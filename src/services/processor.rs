//! Drives one swap job from pending to a terminal state.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;

use crate::db::{JobLedger, LedgerError};
use crate::error::{InputRole, SwapError};
use crate::models::job::{JobId, JobKind, JobStatus, SwapJob};
use crate::services::face_model::FaceModel;
use crate::services::frames::{load_rgb, save_rgb, FramePipeline};
use crate::services::stager::ResourceStager;
use crate::services::storage::MediaStore;
use crate::services::transcode::Transcoder;

/// Settings the processor needs beyond its collaborators.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Parent directory of per-job workspaces.
    pub workspace_root: PathBuf,
    /// Bucket results are uploaded to.
    pub results_bucket: String,
    /// Root for legacy path references.
    pub legacy_root: PathBuf,
    pub max_frame_height: u32,
    pub frame_concurrency: usize,
}

/// What a call to [`JobProcessor::process`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    Completed { result_ref: String },
    Failed { message: String },
    /// The job had already finished; nothing was written.
    AlreadyTerminal(JobStatus),
    /// Another delivery holds the job.
    AlreadyClaimed,
    /// The ledger has no such job.
    NotFound,
    /// The ledger failed before the job was claimed. Nothing was written, so
    /// the task must be delivered again.
    Deferred,
    /// The ledger failed after the claim; the job is left in processing.
    LedgerUnavailable,
}

impl ProcessOutcome {
    /// Whether the task message can be dropped from the queue.
    pub fn should_ack(&self) -> bool {
        !matches!(self, ProcessOutcome::Deferred)
    }
}

pub struct JobProcessor {
    ledger: Arc<dyn JobLedger>,
    store: Arc<dyn MediaStore>,
    face_model: Arc<dyn FaceModel>,
    stager: ResourceStager,
    frames: FramePipeline,
    config: ProcessorConfig,
}

impl JobProcessor {
    pub fn new(
        ledger: Arc<dyn JobLedger>,
        store: Arc<dyn MediaStore>,
        face_model: Arc<dyn FaceModel>,
        transcoder: Transcoder,
        config: ProcessorConfig,
    ) -> Self {
        let stager = ResourceStager::new(store.clone(), config.legacy_root.clone());
        let frames = FramePipeline::new(
            face_model.clone(),
            transcoder,
            config.max_frame_height,
            config.frame_concurrency,
        );

        Self {
            ledger,
            store,
            face_model,
            stager,
            frames,
            config,
        }
    }

    /// Process one job. Never fails: every error ends up in the ledger or the log.
    pub async fn process(&self, job_id: JobId) -> ProcessOutcome {
        let job = match self.ledger.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(job_id, "Job not found in ledger, dropping task");
                return ProcessOutcome::NotFound;
            }
            Err(LedgerError::MalformedJob { reason, .. }) => {
                tracing::error!(job_id, reason = %reason, "Job record is unusable");
                return self.reject_malformed(job_id, &reason).await;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to load job, deferring task");
                return ProcessOutcome::Deferred;
            }
        };

        if job.status.is_terminal() {
            tracing::info!(job_id, status = %job.status, "Job already finished, ignoring redelivery");
            return ProcessOutcome::AlreadyTerminal(job.status);
        }

        match self.ledger.claim_job(job_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(job_id, status = %job.status, "Job is held by another delivery, skipping");
                return ProcessOutcome::AlreadyClaimed;
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to claim job, deferring task");
                return ProcessOutcome::Deferred;
            }
        }

        tracing::info!(
            job_id,
            kind = %job.kind,
            source = %job.source_ref,
            template = %job.template_ref,
            "Processing swap job"
        );

        let start = Instant::now();
        let result = self.execute(&job).await;
        metrics::histogram!("swap_processing_seconds", "kind" => job.kind.as_ref().to_string())
            .record(start.elapsed().as_secs_f64());

        match result {
            Ok(result_ref) => self.finish_completed(job_id, result_ref).await,
            Err(e) => {
                tracing::error!(
                    job_id,
                    error = %e,
                    error_kind = e.kind(),
                    retryable = e.is_retryable(),
                    "Swap job failed"
                );
                metrics::counter!("swap_jobs_failed_total", "kind" => e.kind()).increment(1);
                self.finish_failed(job_id, e.to_string()).await
            }
        }
    }

    /// Run the job inside its own workspace, turning panics into errors.
    /// The workspace is gone when this returns.
    async fn execute(&self, job: &SwapJob) -> Result<String, SwapError> {
        tokio::fs::create_dir_all(&self.config.workspace_root).await?;
        let workspace = tempfile::Builder::new()
            .prefix(&format!("swap-{}-", job.id))
            .tempdir_in(&self.config.workspace_root)?;

        let result = AssertUnwindSafe(self.run_job(job, workspace.path()))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(SwapError::Panicked(panic_message(panic.as_ref()))));

        let workspace_path = workspace.path().to_path_buf();
        if let Err(e) = workspace.close() {
            tracing::warn!(job_id = job.id, path = %workspace_path.display(), error = %e, "Failed to remove job workspace");
        }
        result
    }

    async fn run_job(&self, job: &SwapJob, workspace: &Path) -> Result<String, SwapError> {
        let (default_template_ext, result_ext) = match job.kind {
            JobKind::Image => {
                let ext = job.template_ref.extension();
                ("png", image_result_extension(ext.as_deref()))
            }
            JobKind::Video => ("mp4", "mp4"),
        };

        let source_path = workspace.join(format!(
            "source.{}",
            job.source_ref.extension().unwrap_or_else(|| "img".to_string())
        ));
        let template_path = workspace.join(format!(
            "template.{}",
            job.template_ref
                .extension()
                .unwrap_or_else(|| default_template_ext.to_string())
        ));

        let source = self
            .stager
            .stage(&job.source_ref, &source_path)
            .await
            .map_err(|e| SwapError::stage(InputRole::Source, e))?;
        let template = self
            .stager
            .stage(&job.template_ref, &template_path)
            .await
            .map_err(|e| SwapError::stage(InputRole::Template, e))?;
        tracing::debug!(
            job_id = job.id,
            source_bytes = source.bytes,
            template_bytes = template.bytes,
            "Inputs staged"
        );

        let result_path = workspace.join(format!("result.{}", result_ext));
        match job.kind {
            JobKind::Image => {
                let faces = self.swap_image(&source.path, &template.path, &result_path).await?;
                tracing::info!(job_id = job.id, faces, "Image swap complete");
            }
            JobKind::Video => {
                let report = self.frames.run(&source.path, &template.path, &result_path).await?;
                tracing::info!(
                    job_id = job.id,
                    frames = report.frames_written,
                    width = report.width,
                    height = report.height,
                    has_audio = report.has_audio,
                    "Video swap complete"
                );
            }
        }

        let key = format!("results/{}.{}", job.id, result_ext);
        let url = self
            .store
            .upload(&result_path, &self.config.results_bucket, &key)
            .await
            .map_err(|e| SwapError::UploadFailed(e.to_string()))?;
        if url.is_empty() {
            return Err(SwapError::UploadFailed("storage returned an empty URL".to_string()));
        }

        Ok(url)
    }

    /// Replace every face in the template with the first source face.
    /// Returns how many faces were swapped.
    async fn swap_image(&self, source: &Path, template: &Path, output: &Path) -> Result<usize, SwapError> {
        let source_image = load_rgb(source.to_path_buf()).await?;
        let mut target = load_rgb(template.to_path_buf()).await?;

        let source_faces = self.face_model.detect(&source_image).await?;
        let source_face = source_faces
            .first()
            .ok_or(SwapError::NoFaceDetected(InputRole::Source))?;

        let target_faces = self.face_model.detect(&target).await?;
        if target_faces.is_empty() {
            return Err(SwapError::NoFaceDetected(InputRole::Template));
        }

        for face in &target_faces {
            target = self.face_model.swap(&target, face, source_face).await?;
        }

        save_rgb(target, output.to_path_buf()).await?;
        Ok(target_faces.len())
    }

    async fn finish_completed(&self, job_id: JobId, result_ref: String) -> ProcessOutcome {
        match self.ledger.complete_job(job_id, &result_ref).await {
            Ok(true) => {
                metrics::counter!("swap_jobs_completed_total").increment(1);
                tracing::info!(job_id, result = %result_ref, "Swap job completed");
                ProcessOutcome::Completed { result_ref }
            }
            Ok(false) => {
                tracing::warn!(job_id, "Job left processing before completion was recorded");
                ProcessOutcome::AlreadyClaimed
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to record job completion");
                ProcessOutcome::LedgerUnavailable
            }
        }
    }

    async fn finish_failed(&self, job_id: JobId, message: String) -> ProcessOutcome {
        match self.ledger.fail_job(job_id, &message).await {
            Ok(true) => ProcessOutcome::Failed { message },
            Ok(false) => {
                tracing::warn!(job_id, "Job left processing before failure was recorded");
                ProcessOutcome::AlreadyClaimed
            }
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to record job failure");
                ProcessOutcome::LedgerUnavailable
            }
        }
    }

    /// A job whose record cannot be interpreted still gets a terminal status.
    async fn reject_malformed(&self, job_id: JobId, reason: &str) -> ProcessOutcome {
        match self.ledger.claim_job(job_id).await {
            Ok(true) => {
                metrics::counter!("swap_jobs_failed_total", "kind" => "invalid_reference").increment(1);
                self.finish_failed(job_id, format!("invalid job record: {}", reason)).await
            }
            Ok(false) => ProcessOutcome::AlreadyClaimed,
            Err(e) => {
                tracing::error!(job_id, error = %e, "Failed to claim malformed job, deferring task");
                ProcessOutcome::Deferred
            }
        }
    }
}

/// Image results keep the template's format when it is one we can write.
fn image_result_extension(template_ext: Option<&str>) -> &'static str {
    match template_ext {
        Some("jpg") | Some("jpeg") => "jpg",
        Some("webp") => "webp",
        _ => "png",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
