use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use s3::creds::Credentials;
use s3::{Bucket, Region};
use tokio::io::AsyncWriteExt;
use url::Url;

/// Object storage as seen by the pipeline.
#[async_trait]
pub trait MediaStore: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, StorageError>;

    /// Store `local` under `dest_key` in `bucket` and return its public URL.
    /// Uploading to an existing key overwrites it.
    async fn upload(&self, local: &Path, bucket: &str, dest_key: &str) -> Result<String, StorageError>;
}

/// Client for S3-compatible object storage (R2, Supabase storage).
pub struct R2Client {
    http: reqwest::Client,
    region: Region,
    credentials: Credentials,
    public_base_url: String,
}

impl R2Client {
    pub fn new(
        endpoint: &str,
        region: &str,
        access_key: &str,
        secret_key: &str,
        public_base_url: &str,
        http_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let region = Region::Custom {
            region: region.to_string(),
            endpoint: endpoint.to_string(),
        };

        let credentials =
            Credentials::new(Some(access_key), Some(secret_key), None, None, None)
                .map_err(|e| StorageError::Config(e.to_string()))?;

        let http = reqwest::Client::builder()
            .timeout(http_timeout)
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(Self {
            http,
            region,
            credentials,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn bucket(&self, name: &str) -> Result<Box<Bucket>, StorageError> {
        let bucket = Bucket::new(name, self.region.clone(), self.credentials.clone())
            .map_err(StorageError::S3)?;
        Ok(bucket.with_path_style())
    }

    /// Public URL under which `key` in `bucket` is served.
    pub fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.public_base_url, bucket, key.trim_start_matches('/'))
    }
}

#[async_trait]
impl MediaStore for R2Client {
    async fn download(&self, url: &Url, dest: &Path) -> Result<u64, StorageError> {
        let mut response = self
            .http
            .get(url.clone())
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(StorageError::Http)?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await.map_err(StorageError::Http)? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }

    async fn upload(&self, local: &Path, bucket: &str, dest_key: &str) -> Result<String, StorageError> {
        let data = tokio::fs::read(local).await?;
        let response = self
            .bucket(bucket)?
            .put_object_with_content_type(dest_key, &data, content_type_for(dest_key))
            .await
            .map_err(StorageError::S3)?;

        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(StorageError::Rejected { status });
        }

        Ok(self.public_url(bucket, dest_key))
    }
}

/// MIME type for an object key, from its extension.
pub fn content_type_for(key: &str) -> &'static str {
    let ext = Path::new(key)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("HTTP transfer failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("S3 operation failed: {0}")]
    S3(#[from] s3::error::S3Error),

    #[error("Storage rejected the request with status {status}")]
    Rejected { status: u16 },

    #[error("Local file error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage configuration error: {0}")]
    Config(String),
}
