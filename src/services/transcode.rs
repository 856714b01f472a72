//! ffmpeg/ffprobe orchestration.
//!
//! Every external invocation is a named [`Stage`] run through a
//! [`ProcessRunner`] with a wall-clock timeout, so a failure anywhere reports
//! which step broke together with the tool's stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;

pub const STAGE_PROBE: &str = "probe";
pub const STAGE_EXTRACT_FRAMES: &str = "extract_frames";
pub const STAGE_ENCODE_FRAMES: &str = "encode_frames";
pub const STAGE_PROBE_AUDIO: &str = "probe_audio";
pub const STAGE_REMUX: &str = "remux";

/// File name pattern shared by frame extraction and encoding.
pub const FRAME_PATTERN: &str = "frame_%06d.png";

/// Longest stderr tail kept in error messages.
const STDERR_TAIL: usize = 2000;

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub name: &'static str,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Stage {
    fn new(name: &'static str, program: &Path) -> Self {
        Self {
            name,
            program: program.to_path_buf(),
            args: Vec::new(),
        }
    }

    fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    /// Command line for logs.
    pub fn command_line(&self) -> String {
        format!("{} {}", self.program.display(), self.args.join(" "))
    }
}

/// Captured output of a successful stage.
#[derive(Debug, Clone, Default)]
pub struct StageOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Executes stages. Swapped out in tests to avoid real ffmpeg runs.
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, stage: &Stage, timeout: Duration) -> Result<StageOutput, TranscodeError>;
}

/// Runs stages as child processes of the worker.
pub struct SystemRunner;

#[async_trait]
impl ProcessRunner for SystemRunner {
    async fn run(&self, stage: &Stage, timeout: Duration) -> Result<StageOutput, TranscodeError> {
        let child = Command::new(&stage.program)
            .args(&stage.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                stage: stage.name,
                source,
            })?;

        // Dropping the pending future on timeout kills the child.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| TranscodeError::Spawn {
                stage: stage.name,
                source,
            })?,
            Err(_) => {
                return Err(TranscodeError::Timeout {
                    stage: stage.name,
                    seconds: timeout.as_secs(),
                })
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(TranscodeError::Failed {
                stage: stage.name,
                exit_code: output.status.code(),
                stderr: stderr_tail(&stderr),
            });
        }

        Ok(StageOutput {
            stdout: output.stdout,
            stderr,
        })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// Properties of the template video's first video stream.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoInfo {
    pub width: u32,
    pub height: u32,
    /// Frame rate exactly as ffprobe reports it (e.g. "30000/1001").
    pub frame_rate: String,
    /// Container-declared frame count, when present.
    pub frame_count: Option<u64>,
}

impl VideoInfo {
    /// Frame rate as a number, 0 when unparseable.
    pub fn fps(&self) -> f64 {
        parse_frame_rate(&self.frame_rate).unwrap_or(0.0)
    }
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

fn parse_frame_rate(rate: &str) -> Option<f64> {
    match rate.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0).then(|| num / den)
        }
        None => rate.trim().parse().ok(),
    }
}

/// Parse `ffprobe -show_entries stream=width,height,r_frame_rate,nb_frames -of json`.
pub fn parse_video_probe(stdout: &[u8]) -> Result<VideoInfo, TranscodeError> {
    let probe: ProbeOutput = serde_json::from_slice(stdout)
        .map_err(|e| TranscodeError::InvalidVideo(format!("unreadable probe output: {}", e)))?;

    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| TranscodeError::InvalidVideo("no video stream found".to_string()))?;

    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => return Err(TranscodeError::InvalidVideo("video stream has no dimensions".to_string())),
    };

    let frame_rate = stream
        .r_frame_rate
        .filter(|r| parse_frame_rate(r).is_some_and(|fps| fps > 0.0))
        .ok_or_else(|| TranscodeError::InvalidVideo("video stream has no frame rate".to_string()))?;

    Ok(VideoInfo {
        width,
        height,
        frame_rate,
        frame_count: stream.nb_frames.and_then(|n| n.parse().ok()),
    })
}

/// Dimensions frames are processed at.
///
/// Heights above `max_height` are brought down to it and the width is scaled
/// by the same factor. Both sides are kept even for yuv420p.
pub fn target_dimensions(width: u32, height: u32, max_height: u32) -> (u32, u32) {
    if height <= max_height {
        return (even_floor(width), even_floor(height));
    }

    let target_height = even_floor(max_height);
    let scaled = f64::from(width) * f64::from(target_height) / f64::from(height);
    let target_width = ((scaled / 2.0).round() as u32).max(1) * 2;
    (target_width, target_height)
}

fn even_floor(value: u32) -> u32 {
    (value & !1).max(2)
}

/// Builds and runs the transcoding stages for one worker.
#[derive(Clone)]
pub struct Transcoder {
    runner: Arc<dyn ProcessRunner>,
    ffmpeg_bin: PathBuf,
    ffprobe_bin: PathBuf,
    timeout: Duration,
}

impl Transcoder {
    pub fn new(
        runner: Arc<dyn ProcessRunner>,
        ffmpeg_bin: impl Into<PathBuf>,
        ffprobe_bin: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            ffmpeg_bin: ffmpeg_bin.into(),
            ffprobe_bin: ffprobe_bin.into(),
            timeout,
        }
    }

    /// Run one stage with the configured timeout.
    pub async fn run_stage(&self, stage: &Stage) -> Result<StageOutput, TranscodeError> {
        tracing::debug!(stage = stage.name, command = %stage.command_line(), "Running transcode stage");
        let start = Instant::now();

        let result = self.runner.run(stage, self.timeout).await;
        match &result {
            Ok(output) => tracing::debug!(
                stage = stage.name,
                duration_ms = start.elapsed().as_millis() as u64,
                stderr = %stderr_tail(&output.stderr),
                "Transcode stage finished"
            ),
            Err(e) => tracing::warn!(stage = stage.name, error = %e, "Transcode stage failed"),
        }
        result
    }

    /// Run stages in order, stopping at the first failure.
    pub async fn run_stages(&self, stages: &[Stage]) -> Result<(), TranscodeError> {
        for stage in stages {
            self.run_stage(stage).await?;
        }
        Ok(())
    }

    pub async fn probe_video(&self, input: &Path) -> Result<VideoInfo, TranscodeError> {
        let output = self.run_stage(&self.probe_stage(input)).await?;
        parse_video_probe(&output.stdout)
    }

    pub async fn has_audio(&self, input: &Path) -> Result<bool, TranscodeError> {
        let output = self.run_stage(&self.probe_audio_stage(input)).await?;
        let probe: ProbeOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            TranscodeError::InvalidVideo(format!("unreadable audio probe output: {}", e))
        })?;
        Ok(!probe.streams.is_empty())
    }

    pub fn probe_stage(&self, input: &Path) -> Stage {
        Stage::new(STAGE_PROBE, &self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "v:0"])
            .args(["-show_entries", "stream=width,height,r_frame_rate,nb_frames"])
            .args(["-of", "json"])
            .path_arg(input)
    }

    pub fn probe_audio_stage(&self, input: &Path) -> Stage {
        Stage::new(STAGE_PROBE_AUDIO, &self.ffprobe_bin)
            .args(["-v", "error", "-select_streams", "a"])
            .args(["-show_entries", "stream=index", "-of", "json"])
            .path_arg(input)
    }

    /// Decode every frame of `input` into `frames_dir`, resized when `scale` is set.
    pub fn extract_frames_stage(&self, input: &Path, frames_dir: &Path, scale: Option<(u32, u32)>) -> Stage {
        let mut stage = Stage::new(STAGE_EXTRACT_FRAMES, &self.ffmpeg_bin)
            .args(["-y", "-v", "error", "-i"])
            .path_arg(input);
        if let Some((width, height)) = scale {
            stage = stage.arg("-vf").arg(format!("scale={}:{}", width, height));
        }
        stage.path_arg(&frames_dir.join(FRAME_PATTERN))
    }

    /// Encode a numbered frame sequence into a silent intermediate video.
    ///
    /// The intermediate is lossless; the remux stage does the only lossy encode.
    pub fn encode_frames_stage(&self, frames_dir: &Path, frame_rate: &str, output: &Path) -> Stage {
        Stage::new(STAGE_ENCODE_FRAMES, &self.ffmpeg_bin)
            .args(["-y", "-v", "error", "-framerate", frame_rate, "-i"])
            .path_arg(&frames_dir.join(FRAME_PATTERN))
            .args(["-c:v", "libx264", "-preset", "ultrafast", "-qp", "0", "-pix_fmt", "yuv420p"])
            .path_arg(output)
    }

    /// Final encode. With audio, the template's first audio track is muxed back
    /// in and the output stops at the shorter stream.
    pub fn remux_stage(&self, video: &Path, template: &Path, with_audio: bool, output: &Path) -> Stage {
        let stage = Stage::new(STAGE_REMUX, &self.ffmpeg_bin)
            .args(["-y", "-v", "error", "-i"])
            .path_arg(video);

        let stage = if with_audio {
            stage
                .arg("-i")
                .path_arg(template)
                .args(["-map", "0:v:0", "-map", "1:a:0"])
                .args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-c:a", "aac", "-shortest"])
        } else {
            stage.args(["-c:v", "libx264", "-pix_fmt", "yuv420p", "-an"])
        };

        stage.args(["-movflags", "+faststart"]).path_arg(output)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("transcode stage {stage} could not be started: {source}")]
    Spawn {
        stage: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("transcode stage {stage} failed (exit code {}): {stderr}", fmt_exit_code(.exit_code))]
    Failed {
        stage: &'static str,
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("transcode stage {stage} timed out after {seconds} seconds")]
    Timeout { stage: &'static str, seconds: u64 },

    #[error("invalid template video: {0}")]
    InvalidVideo(String),
}

fn fmt_exit_code(code: &Option<i32>) -> String {
    code.map_or_else(|| "none".to_string(), |c| c.to_string())
}
