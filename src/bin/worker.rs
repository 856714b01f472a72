use faceswap_worker::{
    app_state::AppState,
    config::AppConfig,
    db::{self, queries::PgJobLedger, JobLedger},
    routes,
    services::{
        consumer::QueueConsumer,
        face_model::{FaceModel, GatedFaceModel, RemoteFaceModel},
        processor::{JobProcessor, ProcessorConfig},
        queue::JobQueue,
        storage::{MediaStore, R2Client},
        transcode::{SystemRunner, Transcoder},
    },
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting face swap worker");

    // Load configuration
    let config = AppConfig::from_env().expect("Failed to load configuration");

    // Initialize Prometheus metrics recorder
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");

    metrics::describe_histogram!("swap_processing_seconds", "Time to process a swap job");
    metrics::describe_counter!("swap_jobs_completed_total", "Swap jobs completed");
    metrics::describe_counter!("swap_jobs_failed_total", "Swap jobs failed, by error kind");
    metrics::describe_counter!("swap_frames_processed_total", "Video frames swapped");
    metrics::describe_gauge!("swap_queue_depth", "Task messages waiting in the queue");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Initialize services
    tracing::info!("Initializing services");
    let http_timeout = Duration::from_secs(config.http_timeout_secs);

    let store: Arc<dyn MediaStore> = Arc::new(
        R2Client::new(
            &config.storage_endpoint,
            &config.storage_region,
            &config.storage_access_key,
            &config.storage_secret_key,
            &config.public_base_url,
            http_timeout,
        )
        .expect("Failed to initialize storage client"),
    );

    // Loaded once and shared by every job on this worker
    let remote_model = RemoteFaceModel::new(&config.face_model_url, http_timeout)
        .expect("Failed to initialize face model client");
    let face_model: Arc<dyn FaceModel> = Arc::new(GatedFaceModel::new(
        Arc::new(remote_model),
        config.face_model_concurrency,
    ));

    let transcoder = Transcoder::new(
        Arc::new(SystemRunner),
        config.ffmpeg_bin.clone(),
        config.ffprobe_bin.clone(),
        Duration::from_secs(config.transcode_timeout_secs),
    );

    let ledger: Arc<dyn JobLedger> = Arc::new(PgJobLedger::new(db_pool.clone()));

    let processor = Arc::new(JobProcessor::new(
        ledger,
        store,
        face_model,
        transcoder,
        ProcessorConfig {
            workspace_root: config.workspace_root.clone(),
            results_bucket: config.results_bucket.clone(),
            legacy_root: config.legacy_root.clone(),
            max_frame_height: config.max_frame_height,
            frame_concurrency: config.frame_concurrency,
        },
    ));

    tracing::info!("Connecting to Redis task queue");
    let queue = Arc::new(JobQueue::new(&config.redis_url).expect("Failed to initialize task queue"));

    match queue.recover_in_flight().await {
        Ok(0) => {}
        Ok(n) => tracing::warn!(recovered = n, "Requeued tasks left in flight by a previous worker"),
        Err(e) => tracing::error!(error = %e, "Failed to recover in-flight tasks"),
    }

    // Health and metrics endpoints
    let state = AppState::new(db_pool, queue.clone(), prometheus_handle);
    let listener = tokio::net::TcpListener::bind(&config.ops_bind_addr)
        .await
        .expect("Failed to bind ops address");
    tracing::info!("Ops endpoints listening on {}", config.ops_bind_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes::ops_router(state)).await {
            tracing::error!(error = %e, "Ops server stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested, finishing in-flight jobs");
            let _ = shutdown_tx.send(true);
        }
    });

    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    let workers = config.worker_concurrency.max(1);
    tracing::info!(workers, "Worker ready, starting task consumers");

    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let consumer = QueueConsumer::new(worker, queue.clone(), processor.clone(), poll_interval);
            tokio::spawn(consumer.run(shutdown_rx.clone()))
        })
        .collect();

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Consumer task aborted");
        }
    }

    tracing::info!("Face swap worker stopped");
}
