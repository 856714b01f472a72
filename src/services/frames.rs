//! Video branch: swap faces frame by frame and rebuild the video.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use image::{ImageReader, RgbImage};

use crate::error::{InputRole, SwapError};
use crate::models::face::Face;
use crate::services::face_model::FaceModel;
use crate::services::transcode::{target_dimensions, Transcoder};

/// Summary of a finished video run.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameReport {
    pub frames_written: usize,
    pub width: u32,
    pub height: u32,
    pub frame_rate: String,
    pub has_audio: bool,
}

pub struct FramePipeline {
    face_model: Arc<dyn FaceModel>,
    transcoder: Transcoder,
    max_height: u32,
    frame_concurrency: usize,
}

impl FramePipeline {
    pub fn new(
        face_model: Arc<dyn FaceModel>,
        transcoder: Transcoder,
        max_height: u32,
        frame_concurrency: usize,
    ) -> Self {
        Self {
            face_model,
            transcoder,
            max_height,
            frame_concurrency: frame_concurrency.max(1),
        }
    }

    /// Swap the face from `source` into every frame of `template` and write
    /// the finished video to `output`.
    ///
    /// Intermediate frames and videos live in a scratch directory next to
    /// `output` which is removed before returning.
    pub async fn run(&self, source: &Path, template: &Path, output: &Path) -> Result<FrameReport, SwapError> {
        let source_image = load_rgb(source.to_path_buf()).await?;
        let source_face = self
            .face_model
            .detect(&source_image)
            .await?
            .into_iter()
            .next()
            .ok_or(SwapError::NoFaceDetected(InputRole::Source))?;
        drop(source_image);

        let scratch_parent = output.parent().map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        let scratch = tempfile::Builder::new()
            .prefix("frames-")
            .tempdir_in(&scratch_parent)?;

        let result = self.run_in(&source_face, template, output, scratch.path()).await;

        if let Err(e) = scratch.close() {
            tracing::warn!(error = %e, "Failed to remove frame scratch directory");
        }
        result
    }

    async fn run_in(
        &self,
        source_face: &Face,
        template: &Path,
        output: &Path,
        scratch: &Path,
    ) -> Result<FrameReport, SwapError> {
        let info = self.transcoder.probe_video(template).await?;
        let (width, height) = target_dimensions(info.width, info.height, self.max_height);
        let scale = ((width, height) != (info.width, info.height)).then_some((width, height));

        tracing::info!(
            source_width = info.width,
            source_height = info.height,
            width,
            height,
            frame_rate = %info.frame_rate,
            fps = info.fps(),
            declared_frames = info.frame_count,
            "Processing template video"
        );

        let frames_dir = scratch.join("frames");
        let swapped_dir = scratch.join("swapped");
        tokio::fs::create_dir(&frames_dir).await?;
        tokio::fs::create_dir(&swapped_dir).await?;

        self.transcoder
            .run_stage(&self.transcoder.extract_frames_stage(template, &frames_dir, scale))
            .await?;

        let frames = list_frames(&frames_dir).await?;
        if frames.is_empty() {
            return Err(SwapError::NoFrames);
        }
        if let Some(declared) = info.frame_count {
            if declared != frames.len() as u64 {
                tracing::debug!(declared, extracted = frames.len(), "Frame count differs from container metadata");
            }
        }

        let frames_written = self.swap_frames(source_face, &frames, &swapped_dir).await?;
        metrics::counter!("swap_frames_processed_total").increment(frames_written as u64);

        let has_audio = self.transcoder.has_audio(template).await?;
        let intermediate = scratch.join("intermediate.mp4");
        self.transcoder
            .run_stages(&[
                self.transcoder
                    .encode_frames_stage(&swapped_dir, &info.frame_rate, &intermediate),
                self.transcoder
                    .remux_stage(&intermediate, template, has_audio, output),
            ])
            .await?;

        Ok(FrameReport {
            frames_written,
            width,
            height,
            frame_rate: info.frame_rate,
            has_audio,
        })
    }

    /// Swap every frame, writing results as a contiguous sequence in input order.
    async fn swap_frames(&self, source_face: &Face, frames: &[PathBuf], swapped_dir: &Path) -> Result<usize, SwapError> {
        let swapped = futures::stream::iter(frames.iter().cloned())
            .map(|frame| self.swap_frame(frame, source_face))
            .buffered(self.frame_concurrency);
        let mut swapped = std::pin::pin!(swapped);

        let mut written = 0usize;
        while let Some(image) = swapped.try_next().await? {
            written += 1;
            let path = swapped_dir.join(format!("frame_{:06}.png", written));
            save_rgb(image, path).await?;
        }
        Ok(written)
    }

    async fn swap_frame(&self, frame: PathBuf, source_face: &Face) -> Result<RgbImage, SwapError> {
        let mut image = load_rgb(frame).await?;
        for face in self.face_model.detect(&image).await? {
            image = self.face_model.swap(&image, &face, source_face).await?;
        }
        Ok(image)
    }
}

/// Extracted frame files, sorted by frame number.
///
/// The index is compared numerically: past 999999 frames the names grow a
/// seventh digit and no longer sort as strings.
async fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, SwapError> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut frames = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if let Some(index) = frame_index(&path) {
            frames.push((index, path));
        }
    }
    frames.sort_unstable_by_key(|(index, _)| *index);
    Ok(frames.into_iter().map(|(_, path)| path).collect())
}

/// Frame number of a `frame_NNNNNN.png` file.
fn frame_index(path: &Path) -> Option<u64> {
    if path.extension()? != "png" {
        return None;
    }
    path.file_stem()?
        .to_str()?
        .strip_prefix("frame_")?
        .parse()
        .ok()
}

/// Decode an image file off the async runtime, sniffing the format from content.
pub(crate) async fn load_rgb(path: PathBuf) -> Result<RgbImage, SwapError> {
    tokio::task::spawn_blocking(move || -> Result<RgbImage, SwapError> {
        let image = ImageReader::open(&path)?.with_guessed_format()?.decode()?;
        Ok(image.to_rgb8())
    })
    .await
    .map_err(|e| SwapError::Panicked(e.to_string()))?
}

/// Encode an image off the async runtime; the format follows the file extension.
pub(crate) async fn save_rgb(image: RgbImage, path: PathBuf) -> Result<(), SwapError> {
    tokio::task::spawn_blocking(move || image.save(&path))
        .await
        .map_err(|e| SwapError::Panicked(e.to_string()))??;
    Ok(())
}
