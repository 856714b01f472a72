use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;
use std::sync::Arc;

use crate::services::queue::JobQueue;

/// Shared state for the worker's health and metrics endpoints.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub queue: Arc<JobQueue>,
    pub prometheus: Arc<PrometheusHandle>,
}

impl AppState {
    pub fn new(db: PgPool, queue: Arc<JobQueue>, prometheus: PrometheusHandle) -> Self {
        Self {
            db,
            queue,
            prometheus: Arc::new(prometheus),
        }
    }
}
