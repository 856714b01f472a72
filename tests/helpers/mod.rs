//! In-memory collaborators for exercising the pipeline without Postgres,
//! object storage, a face model service or ffmpeg.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use faceswap_worker::db::{JobLedger, LedgerError};
use faceswap_worker::models::face::Face;
use faceswap_worker::models::job::{JobId, JobKind, JobStatus, MediaRef, SwapJob};
use faceswap_worker::services::face_model::{FaceModel, FaceModelError};
use faceswap_worker::services::processor::{JobProcessor, ProcessorConfig};
use faceswap_worker::services::storage::{MediaStore, StorageError};
use faceswap_worker::services::transcode::{
    ProcessRunner, Stage, StageOutput, TranscodeError, Transcoder, STAGE_ENCODE_FRAMES,
    STAGE_EXTRACT_FRAMES, STAGE_PROBE, STAGE_PROBE_AUDIO, STAGE_REMUX,
};
use image::{Rgb, RgbImage};
use url::Url;

// ---------------------------------------------------------------------------
// Images
// ---------------------------------------------------------------------------

/// A tiny image the fake face model sees `faces` faces in.
///
/// The green channel of the top-left pixel encodes the face count and the
/// red channel carries a marker (used as the frame index in videos).
pub fn face_image(faces: u8, marker: u8) -> RgbImage {
    RgbImage::from_pixel(8, 8, Rgb([marker, faces, 0]))
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)
        .unwrap();
    buf
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeLedger {
    jobs: Mutex<HashMap<JobId, SwapJob>>,
    /// Every status the ledger accepted, in order.
    pub transitions: Mutex<Vec<(JobId, JobStatus)>>,
    /// Upcoming `get_job` calls that fail as if the pool timed out.
    read_outages: AtomicUsize,
    /// Upcoming `claim_job` calls that fail as if the pool timed out.
    claim_outages: AtomicUsize,
}

impl FakeLedger {
    pub fn insert(&self, job: SwapJob) {
        self.jobs.lock().unwrap().insert(job.id, job);
    }

    pub fn job(&self, id: JobId) -> SwapJob {
        self.jobs.lock().unwrap().get(&id).cloned().expect("job exists")
    }

    pub fn fail_next_reads(&self, n: usize) {
        self.read_outages.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_claims(&self, n: usize) {
        self.claim_outages.store(n, Ordering::SeqCst);
    }

    pub fn transitions(&self) -> Vec<(JobId, JobStatus)> {
        self.transitions.lock().unwrap().clone()
    }

    fn transition(
        &self,
        id: JobId,
        from: JobStatus,
        to: JobStatus,
        result_ref: Option<&str>,
        error_message: Option<&str>,
    ) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        let Some(job) = jobs.get_mut(&id) else {
            return false;
        };
        if job.status != from {
            return false;
        }
        job.status = to;
        if let Some(r) = result_ref {
            job.result_ref = Some(r.to_string());
        }
        if let Some(m) = error_message {
            job.error_message = Some(m.to_string());
        }
        job.updated_at = Utc::now();
        self.transitions.lock().unwrap().push((id, to));
        true
    }
}

/// Consume one pending outage, if any.
fn take_outage(counter: &AtomicUsize) -> Result<(), LedgerError> {
    let hit = counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if hit {
        return Err(LedgerError::Database(sqlx::Error::PoolTimedOut));
    }
    Ok(())
}

#[async_trait]
impl JobLedger for FakeLedger {
    async fn get_job(&self, id: JobId) -> Result<Option<SwapJob>, LedgerError> {
        take_outage(&self.read_outages)?;
        Ok(self.jobs.lock().unwrap().get(&id).cloned())
    }

    async fn claim_job(&self, id: JobId) -> Result<bool, LedgerError> {
        take_outage(&self.claim_outages)?;
        Ok(self.transition(id, JobStatus::Pending, JobStatus::Processing, None, None))
    }

    async fn complete_job(&self, id: JobId, result_ref: &str) -> Result<bool, LedgerError> {
        Ok(self.transition(id, JobStatus::Processing, JobStatus::Completed, Some(result_ref), None))
    }

    async fn fail_job(&self, id: JobId, error_message: &str) -> Result<bool, LedgerError> {
        Ok(self.transition(id, JobStatus::Processing, JobStatus::Failed, None, Some(error_message)))
    }
}

pub fn job(id: JobId, kind: JobKind, source: &str, template: &str) -> SwapJob {
    SwapJob {
        id,
        kind,
        status: JobStatus::Pending,
        cost: match kind {
            JobKind::Image => 1,
            JobKind::Video => 10,
        },
        source_ref: MediaRef::parse(source).unwrap(),
        template_ref: MediaRef::parse(template).unwrap(),
        result_ref: None,
        error_message: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRecord {
    pub bucket: String,
    pub key: String,
    pub bytes: usize,
}

#[derive(Default)]
pub struct FakeStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<Vec<UploadRecord>>,
    pub fail_uploads: bool,
}

impl FakeStore {
    pub fn failing_uploads() -> Self {
        Self {
            fail_uploads: true,
            ..Default::default()
        }
    }

    pub fn put(&self, url: &str, bytes: Vec<u8>) {
        self.objects.lock().unwrap().insert(url.to_string(), bytes);
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaStore for FakeStore {
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, StorageError> {
        let bytes = self
            .objects
            .lock()
            .unwrap()
            .get(url.as_str())
            .cloned()
            .ok_or(StorageError::Rejected { status: 404 })?;
        tokio::fs::write(dest, &bytes).await?;
        Ok(bytes.len() as u64)
    }

    async fn upload(&self, local: &Path, bucket: &str, dest_key: &str) -> Result<String, StorageError> {
        if self.fail_uploads {
            return Err(StorageError::Rejected { status: 503 });
        }
        let bytes = tokio::fs::read(local).await?;
        self.uploads.lock().unwrap().push(UploadRecord {
            bucket: bucket.to_string(),
            key: dest_key.to_string(),
            bytes: bytes.len(),
        });
        Ok(format!("https://cdn.test/{}/{}", bucket, dest_key))
    }
}

// ---------------------------------------------------------------------------
// Face model
// ---------------------------------------------------------------------------

/// Sees as many faces as the top-left pixel's green channel says; swapping
/// returns the target unchanged.
#[derive(Default)]
pub struct FakeFaceModel {
    pub detect_calls: AtomicUsize,
    pub swap_calls: AtomicUsize,
    pub panic_on_swap: bool,
}

impl FakeFaceModel {
    pub fn panicking() -> Self {
        Self {
            panic_on_swap: true,
            ..Default::default()
        }
    }

    pub fn swaps(&self) -> usize {
        self.swap_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceModel for FakeFaceModel {
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, FaceModelError> {
        self.detect_calls.fetch_add(1, Ordering::SeqCst);
        let count = image.get_pixel(0, 0)[1];
        Ok((0..count)
            .map(|i| Face {
                bbox: [i as f32, 0.0, i as f32 + 1.0, 1.0],
                score: 0.99,
                embedding: vec![0.5; 4],
            })
            .collect())
    }

    async fn swap(&self, target: &RgbImage, _target_face: &Face, _source_face: &Face) -> Result<RgbImage, FaceModelError> {
        if self.panic_on_swap {
            panic!("inference runtime crashed");
        }
        self.swap_calls.fetch_add(1, Ordering::SeqCst);
        Ok(target.clone())
    }
}

// ---------------------------------------------------------------------------
// Transcoder
// ---------------------------------------------------------------------------

/// Stands in for ffmpeg/ffprobe: answers probes from its settings, writes
/// fake frames on extraction and records what reaches the encoder.
pub struct RecordingRunner {
    pub width: u32,
    pub height: u32,
    pub frame_rate: String,
    pub frames: u8,
    pub has_audio: bool,
    pub fail_stage: Option<&'static str>,
    pub stages: Mutex<Vec<Stage>>,
    /// Red-channel markers of the frames handed to the encoder, in order.
    pub encoded_markers: Mutex<Vec<u8>>,
}

impl RecordingRunner {
    pub fn new(width: u32, height: u32, frames: u8, has_audio: bool) -> Self {
        Self {
            width,
            height,
            frame_rate: "25/1".to_string(),
            frames,
            has_audio,
            fail_stage: None,
            stages: Mutex::new(Vec::new()),
            encoded_markers: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_at(mut self, stage: &'static str) -> Self {
        self.fail_stage = Some(stage);
        self
    }

    pub fn stages(&self) -> Vec<Stage> {
        self.stages.lock().unwrap().clone()
    }

    pub fn stage(&self, name: &str) -> Option<Stage> {
        self.stages().into_iter().find(|s| s.name == name)
    }

    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages().iter().map(|s| s.name).collect()
    }
}

/// Directory of an `ffmpeg` frame pattern argument such as `/w/frames/frame_%06d.png`.
fn pattern_dir(pattern: &str) -> PathBuf {
    Path::new(pattern).parent().unwrap().to_path_buf()
}

fn arg_after<'a>(stage: &'a Stage, flag: &str) -> &'a str {
    let pos = stage.args.iter().position(|a| a == flag).unwrap();
    &stage.args[pos + 1]
}

#[async_trait]
impl ProcessRunner for RecordingRunner {
    async fn run(&self, stage: &Stage, _timeout: Duration) -> Result<StageOutput, TranscodeError> {
        self.stages.lock().unwrap().push(stage.clone());

        if self.fail_stage == Some(stage.name) {
            return Err(TranscodeError::Failed {
                stage: stage.name,
                exit_code: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }

        let last = stage.args.last().cloned().unwrap_or_default();
        let stdout = match stage.name {
            STAGE_PROBE => format!(
                r#"{{"streams":[{{"width":{},"height":{},"r_frame_rate":"{}","nb_frames":"{}"}}]}}"#,
                self.width, self.height, self.frame_rate, self.frames
            )
            .into_bytes(),
            STAGE_PROBE_AUDIO => {
                if self.has_audio {
                    br#"{"streams":[{"index":1}]}"#.to_vec()
                } else {
                    br#"{"streams":[]}"#.to_vec()
                }
            }
            STAGE_EXTRACT_FRAMES => {
                let dir = pattern_dir(&last);
                for i in 0..self.frames {
                    face_image(1, i)
                        .save(dir.join(format!("frame_{:06}.png", u32::from(i) + 1)))
                        .unwrap();
                }
                Vec::new()
            }
            STAGE_ENCODE_FRAMES => {
                let dir = pattern_dir(arg_after(stage, "-i"));
                let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
                    .unwrap()
                    .map(|e| e.unwrap().path())
                    .collect();
                files.sort();
                let markers = files
                    .iter()
                    .map(|f| image::open(f).unwrap().to_rgb8().get_pixel(0, 0)[0])
                    .collect();
                *self.encoded_markers.lock().unwrap() = markers;
                std::fs::write(&last, b"intermediate").unwrap();
                Vec::new()
            }
            STAGE_REMUX => {
                std::fs::write(&last, b"final video").unwrap();
                Vec::new()
            }
            other => panic!("unexpected stage {other}"),
        };

        Ok(StageOutput {
            stdout,
            stderr: String::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Assembly
// ---------------------------------------------------------------------------

pub struct Harness {
    pub ledger: Arc<FakeLedger>,
    pub store: Arc<FakeStore>,
    pub model: Arc<FakeFaceModel>,
    pub runner: Arc<RecordingRunner>,
    pub processor: JobProcessor,
    pub workspace_root: tempfile::TempDir,
    pub legacy_root: tempfile::TempDir,
}

impl Harness {
    pub fn new(store: FakeStore, model: FakeFaceModel, runner: RecordingRunner) -> Self {
        let ledger = Arc::new(FakeLedger::default());
        let store = Arc::new(store);
        let model = Arc::new(model);
        let runner = Arc::new(runner);
        let workspace_root = tempfile::tempdir().unwrap();
        let legacy_root = tempfile::tempdir().unwrap();

        let transcoder = Transcoder::new(runner.clone(), "ffmpeg", "ffprobe", Duration::from_secs(30));
        let processor = JobProcessor::new(
            ledger.clone(),
            store.clone(),
            model.clone(),
            transcoder,
            ProcessorConfig {
                workspace_root: workspace_root.path().to_path_buf(),
                results_bucket: "results".to_string(),
                legacy_root: legacy_root.path().to_path_buf(),
                max_frame_height: 720,
                frame_concurrency: 3,
            },
        );

        Self {
            ledger,
            store,
            model,
            runner,
            processor,
            workspace_root,
            legacy_root,
        }
    }

    pub fn images() -> Self {
        Self::new(FakeStore::default(), FakeFaceModel::default(), RecordingRunner::new(640, 360, 0, false))
    }

    /// Entries left under the workspace root (should always be empty after processing).
    pub fn leftover_workspaces(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.workspace_root.path())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    /// Assert the ledger invariants linking status, result and error.
    pub fn assert_job_consistent(&self, id: JobId) {
        let job = self.ledger.job(id);
        let has_result = job.result_ref.as_deref().is_some_and(|r| !r.is_empty());
        let has_error = job.error_message.as_deref().is_some_and(|m| !m.is_empty());
        assert_eq!(has_result, job.status == JobStatus::Completed, "result_ref iff completed: {job:?}");
        assert_eq!(has_error, job.status == JobStatus::Failed, "error_message iff failed: {job:?}");
    }
}
