use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct AppConfig {
    /// Health and metrics listener (e.g., "0.0.0.0:9000").
    #[serde(default = "default_ops_bind_addr")]
    pub ops_bind_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the task queue
    pub redis_url: String,

    /// S3-compatible storage endpoint URL
    pub storage_endpoint: String,

    /// Storage region name ("auto" for R2)
    #[serde(default = "default_storage_region")]
    pub storage_region: String,

    /// Storage access key ID
    pub storage_access_key: String,

    /// Storage secret access key
    pub storage_secret_key: String,

    /// Public URL prefix under which buckets are served
    pub public_base_url: String,

    /// Bucket receiving swap results
    #[serde(default = "default_results_bucket")]
    pub results_bucket: String,

    /// Root directory that legacy (path-style) media references resolve against
    #[serde(default = "default_legacy_root")]
    pub legacy_root: PathBuf,

    /// Directory under which per-job workspaces are created
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Base URL of the face model inference service
    pub face_model_url: String,

    /// Maximum concurrent calls into the face model
    #[serde(default = "default_face_model_concurrency")]
    pub face_model_concurrency: usize,

    /// Number of jobs processed in parallel by this worker
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    /// Number of video frames in flight per job
    #[serde(default = "default_frame_concurrency")]
    pub frame_concurrency: usize,

    /// Videos taller than this are downscaled before swapping
    #[serde(default = "default_max_frame_height")]
    pub max_frame_height: u32,

    /// Wall-clock limit for each ffmpeg/ffprobe invocation
    #[serde(default = "default_transcode_timeout_secs")]
    pub transcode_timeout_secs: u64,

    /// Timeout for HTTP downloads and face model requests
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,

    #[serde(default = "default_ffmpeg_bin")]
    pub ffmpeg_bin: PathBuf,

    #[serde(default = "default_ffprobe_bin")]
    pub ffprobe_bin: PathBuf,

    /// Delay between queue polls when the queue is empty
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_ops_bind_addr() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_storage_region() -> String {
    "auto".to_string()
}

fn default_results_bucket() -> String {
    "results".to_string()
}

fn default_legacy_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_workspace_root() -> PathBuf {
    std::env::temp_dir().join("faceswap")
}

fn default_face_model_concurrency() -> usize {
    1
}

fn default_worker_concurrency() -> usize {
    2
}

fn default_frame_concurrency() -> usize {
    4
}

fn default_max_frame_height() -> u32 {
    720
}

fn default_transcode_timeout_secs() -> u64 {
    900
}

fn default_http_timeout_secs() -> u64 {
    120
}

fn default_ffmpeg_bin() -> PathBuf {
    PathBuf::from("ffmpeg")
}

fn default_ffprobe_bin() -> PathBuf {
    PathBuf::from("ffprobe")
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl AppConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }
}
