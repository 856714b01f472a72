use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use image::{ImageFormat, RgbImage};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::models::face::Face;

/// Face detection and swapping capability.
///
/// Implementations hold their weights for the life of the worker and are
/// shared between jobs.
#[async_trait]
pub trait FaceModel: Send + Sync {
    /// Detect all faces in `image`.
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, FaceModelError>;

    /// Replace `target_face` in `target` with the identity of `source_face`.
    async fn swap(
        &self,
        target: &RgbImage,
        target_face: &Face,
        source_face: &Face,
    ) -> Result<RgbImage, FaceModelError>;
}

/// Client for the face inference service (detector + swapper behind HTTP).
pub struct RemoteFaceModel {
    http: Client,
    base_url: String,
}

#[derive(Serialize)]
struct DetectRequest {
    image: String,
}

#[derive(Deserialize)]
struct DetectResponse {
    faces: Vec<Face>,
}

#[derive(Serialize)]
struct SwapRequest<'a> {
    image: String,
    target_face: &'a Face,
    source_face: &'a Face,
}

#[derive(Deserialize)]
struct SwapResponse {
    image: String,
}

impl RemoteFaceModel {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, FaceModelError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(FaceModelError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FaceModel for RemoteFaceModel {
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, FaceModelError> {
        let body = DetectRequest {
            image: encode_png(image)?,
        };

        let response: DetectResponse = self
            .http
            .post(format!("{}/detect", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(FaceModelError::Http)?
            .json()
            .await
            .map_err(FaceModelError::Http)?;

        Ok(response.faces)
    }

    async fn swap(
        &self,
        target: &RgbImage,
        target_face: &Face,
        source_face: &Face,
    ) -> Result<RgbImage, FaceModelError> {
        let body = SwapRequest {
            image: encode_png(target)?,
            target_face,
            source_face,
        };

        let response: SwapResponse = self
            .http
            .post(format!("{}/swap", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(FaceModelError::Http)?
            .json()
            .await
            .map_err(FaceModelError::Http)?;

        let swapped = decode_png(&response.image)?;
        if swapped.dimensions() != target.dimensions() {
            return Err(FaceModelError::InvalidResponse(format!(
                "swapped image is {:?}, expected {:?}",
                swapped.dimensions(),
                target.dimensions()
            )));
        }
        Ok(swapped)
    }
}

/// Limits how many calls run inside the wrapped model at once.
pub struct GatedFaceModel {
    inner: Arc<dyn FaceModel>,
    permits: Semaphore,
}

impl GatedFaceModel {
    pub fn new(inner: Arc<dyn FaceModel>, max_concurrent: usize) -> Self {
        Self {
            inner,
            permits: Semaphore::new(max_concurrent.max(1)),
        }
    }
}

#[async_trait]
impl FaceModel for GatedFaceModel {
    async fn detect(&self, image: &RgbImage) -> Result<Vec<Face>, FaceModelError> {
        let _permit = self.permits.acquire().await.map_err(|_| FaceModelError::Closed)?;
        self.inner.detect(image).await
    }

    async fn swap(
        &self,
        target: &RgbImage,
        target_face: &Face,
        source_face: &Face,
    ) -> Result<RgbImage, FaceModelError> {
        let _permit = self.permits.acquire().await.map_err(|_| FaceModelError::Closed)?;
        self.inner.swap(target, target_face, source_face).await
    }
}

fn encode_png(image: &RgbImage) -> Result<String, FaceModelError> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .map_err(FaceModelError::Image)?;
    Ok(base64::engine::general_purpose::STANDARD.encode(buf))
}

fn decode_png(encoded: &str) -> Result<RgbImage, FaceModelError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| FaceModelError::InvalidResponse(e.to_string()))?;
    let image = image::load_from_memory(&bytes).map_err(FaceModelError::Image)?;
    Ok(image.to_rgb8())
}

#[derive(Debug, thiserror::Error)]
pub enum FaceModelError {
    #[error("Face model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Face model returned an invalid response: {0}")]
    InvalidResponse(String),

    #[error("Image encoding failed: {0}")]
    Image(#[from] image::ImageError),

    #[error("Face model is shutting down")]
    Closed,
}
