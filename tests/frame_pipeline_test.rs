//! Video branch: frame extraction, ordered swapping and the transcode stages.

mod helpers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use faceswap_worker::error::{InputRole, SwapError};
use faceswap_worker::models::job::{JobKind, JobStatus};
use faceswap_worker::services::frames::FramePipeline;
use faceswap_worker::services::processor::ProcessOutcome;
use faceswap_worker::services::transcode::{
    TranscodeError, Transcoder, STAGE_ENCODE_FRAMES, STAGE_EXTRACT_FRAMES, STAGE_PROBE,
    STAGE_PROBE_AUDIO, STAGE_REMUX,
};
use helpers::*;

const SOURCE_URL: &str = "https://media.test/uploads/face.png";
const TEMPLATE_URL: &str = "https://media.test/templates/clip.mp4";

struct PipelineRun {
    runner: Arc<RecordingRunner>,
    model: Arc<FakeFaceModel>,
    result: Result<faceswap_worker::services::frames::FrameReport, SwapError>,
    workdir: tempfile::TempDir,
}

async fn run_pipeline(runner: RecordingRunner, source_faces: u8) -> PipelineRun {
    let runner = Arc::new(runner);
    let model = Arc::new(FakeFaceModel::default());
    let transcoder = Transcoder::new(runner.clone(), "ffmpeg", "ffprobe", Duration::from_secs(30));
    let pipeline = FramePipeline::new(model.clone(), transcoder, 720, 4);

    let workdir = tempfile::tempdir().unwrap();
    let source = workdir.path().join("source.png");
    let template = workdir.path().join("template.mp4");
    face_image(source_faces, 0).save(&source).unwrap();
    std::fs::write(&template, b"not really a video").unwrap();

    let result = pipeline
        .run(&source, &template, &workdir.path().join("result.mp4"))
        .await;

    PipelineRun {
        runner,
        model,
        result,
        workdir,
    }
}

fn only_entries(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_frames_are_swapped_and_encoded_in_order() {
    let run = run_pipeline(RecordingRunner::new(640, 360, 12, true), 1).await;

    let report = run.result.unwrap();
    assert_eq!(report.frames_written, 12);
    assert_eq!((report.width, report.height), (640, 360));
    assert_eq!(report.frame_rate, "25/1");
    assert!(report.has_audio);

    // Buffered swapping must not reorder frames.
    assert_eq!(*run.runner.encoded_markers.lock().unwrap(), (0..12).collect::<Vec<u8>>());
    assert_eq!(run.model.swaps(), 12);

    assert_eq!(
        run.runner.stage_names(),
        vec![STAGE_PROBE, STAGE_EXTRACT_FRAMES, STAGE_PROBE_AUDIO, STAGE_ENCODE_FRAMES, STAGE_REMUX]
    );

    // Small videos are not rescaled.
    let extract = run.runner.stage(STAGE_EXTRACT_FRAMES).unwrap();
    assert!(!extract.args.iter().any(|a| a == "-vf"));

    let encode = run.runner.stage(STAGE_ENCODE_FRAMES).unwrap();
    assert!(encode.args.windows(2).any(|w| w[0] == "-framerate" && w[1] == "25/1"));

    // Only the result survives; scratch frames are gone.
    assert_eq!(only_entries(run.workdir.path()), vec!["result.mp4", "source.png", "template.mp4"]);
}

#[tokio::test]
async fn test_1440p_template_is_downscaled_to_720p() {
    let run = run_pipeline(RecordingRunner::new(2560, 1440, 3, false), 1).await;

    let report = run.result.unwrap();
    assert_eq!((report.width, report.height), (1280, 720));

    let extract = run.runner.stage(STAGE_EXTRACT_FRAMES).unwrap();
    assert!(extract.args.windows(2).any(|w| w[0] == "-vf" && w[1] == "scale=1280:720"));
}

#[tokio::test]
async fn test_audio_track_is_mapped_from_template() {
    let run = run_pipeline(RecordingRunner::new(640, 360, 2, true), 1).await;
    run.result.unwrap();

    let remux = run.runner.stage(STAGE_REMUX).unwrap();
    let line = remux.args.join(" ");
    assert!(line.contains("-map 1:a:0"), "{line}");
    assert!(line.contains("-shortest"), "{line}");
    assert!(remux.args.iter().any(|a| a.ends_with("template.mp4")));
}

#[tokio::test]
async fn test_silent_template_produces_silent_output() {
    let run = run_pipeline(RecordingRunner::new(640, 360, 2, false), 1).await;

    assert!(!run.result.unwrap().has_audio);
    let remux = run.runner.stage(STAGE_REMUX).unwrap();
    assert!(!remux.args.iter().any(|a| a == "-map"));
    assert!(remux.args.iter().any(|a| a == "-an"));
    assert!(!remux.args.iter().any(|a| a.ends_with("template.mp4")));
}

#[tokio::test]
async fn test_source_without_face_runs_no_stage() {
    let run = run_pipeline(RecordingRunner::new(640, 360, 5, false), 0).await;

    assert!(matches!(run.result, Err(SwapError::NoFaceDetected(InputRole::Source))));
    assert!(run.runner.stages().is_empty());
    assert_eq!(run.model.swaps(), 0);
}

#[tokio::test]
async fn test_template_without_frames_fails() {
    let run = run_pipeline(RecordingRunner::new(640, 360, 0, false), 1).await;

    assert!(matches!(run.result, Err(SwapError::NoFrames)));
    assert!(run.runner.stage(STAGE_ENCODE_FRAMES).is_none());
    assert_eq!(only_entries(run.workdir.path()), vec!["source.png", "template.mp4"]);
}

#[tokio::test]
async fn test_transcode_failure_names_stage() {
    let runner = RecordingRunner::new(640, 360, 3, false).failing_at(STAGE_ENCODE_FRAMES);
    let run = run_pipeline(runner, 1).await;

    match run.result {
        Err(SwapError::Transcode(TranscodeError::Failed { stage, stderr, .. })) => {
            assert_eq!(stage, STAGE_ENCODE_FRAMES);
            assert_eq!(stderr, "simulated failure");
        }
        other => panic!("expected encode failure, got {other:?}"),
    }
    assert!(run.runner.stage(STAGE_REMUX).is_none());
    assert_eq!(only_entries(run.workdir.path()), vec!["source.png", "template.mp4"]);
}

#[tokio::test]
async fn test_video_job_without_audio_completes() {
    let h = Harness::new(
        FakeStore::default(),
        FakeFaceModel::default(),
        RecordingRunner::new(1920, 1080, 4, false),
    );
    h.store.put(SOURCE_URL, png_bytes(&face_image(1, 0)));
    h.store.put(TEMPLATE_URL, b"mp4 bytes".to_vec());
    h.ledger.insert(job(3, JobKind::Video, SOURCE_URL, TEMPLATE_URL));

    let outcome = h.processor.process(3).await;

    assert_eq!(
        outcome,
        ProcessOutcome::Completed {
            result_ref: "https://cdn.test/results/results/3.mp4".to_string()
        }
    );
    let uploads = h.store.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].key, "results/3.mp4");

    let remux = h.runner.stage(STAGE_REMUX).unwrap();
    assert!(!remux.args.iter().any(|a| a == "-map"));
    assert!(h.leftover_workspaces().is_empty());
    h.assert_job_consistent(3);
}

#[tokio::test]
async fn test_video_job_transcode_failure_is_recorded() {
    let h = Harness::new(
        FakeStore::default(),
        FakeFaceModel::default(),
        RecordingRunner::new(640, 360, 2, true).failing_at(STAGE_REMUX),
    );
    h.store.put(SOURCE_URL, png_bytes(&face_image(1, 0)));
    h.store.put(TEMPLATE_URL, b"mp4 bytes".to_vec());
    h.ledger.insert(job(4, JobKind::Video, SOURCE_URL, TEMPLATE_URL));

    let outcome = h.processor.process(4).await;

    match outcome {
        ProcessOutcome::Failed { message } => assert!(message.contains(STAGE_REMUX), "{message}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(h.ledger.job(4).status, JobStatus::Failed);
    assert!(h.store.uploads().is_empty());
    assert!(h.leftover_workspaces().is_empty());
    h.assert_job_consistent(4);
}
