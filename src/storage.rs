//! Instructor file access
//!
//! Commands reference instructor-uploaded files for stdin and expected
//! output. Production reads them from MinIO/S3; tests and embedders can use
//! the in-memory provider.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::core::command::FileRef;

/// Source of instructor file contents
#[async_trait]
pub trait FileProvider: Send + Sync {
    async fn read(&self, file: &FileRef) -> Result<Vec<u8>>;

    async fn read_string(&self, file: &FileRef) -> Result<String> {
        let bytes = self.read(file).await?;
        String::from_utf8(bytes).with_context(|| format!("{} is not valid UTF-8", file.name))
    }
}

/// Object key of an instructor file
pub fn object_key(file: &FileRef) -> String {
    format!("projects/{}/files/{}", file.project_id, file.name)
}

/// S3/MinIO storage client
#[derive(Clone)]
pub struct StorageClient {
    client: Client,
    bucket: String,
}

impl StorageClient {
    /// Create a new storage client from environment variables
    pub async fn from_env() -> Result<Self> {
        let endpoint = std::env::var("MINIO_ENDPOINT").unwrap_or_else(|_| "localhost".into());
        let port = std::env::var("MINIO_PORT").unwrap_or_else(|_| "9000".into());
        let access_key = std::env::var("MINIO_ACCESS_KEY").unwrap_or_else(|_| "minioadmin".into());
        let secret_key = std::env::var("MINIO_SECRET_KEY").unwrap_or_else(|_| "minioadmin".into());
        let bucket = std::env::var("MINIO_BUCKET").unwrap_or_else(|_| "autograder-files".into());
        let use_ssl = std::env::var("MINIO_USE_SSL")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let protocol = if use_ssl { "https" } else { "http" };
        let endpoint_url = format!("{}://{}:{}", protocol, endpoint, port);

        info!("Connecting to MinIO at {}", endpoint_url);

        let credentials = Credentials::new(access_key, secret_key, None, None, "minio");

        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(&endpoint_url)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(config),
            bucket,
        })
    }

    /// Download an object
    pub async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to download {}", key))?;

        let data = response
            .body
            .collect()
            .await
            .with_context(|| format!("Failed to read body of {}", key))?;
        Ok(data.into_bytes().to_vec())
    }
}

#[async_trait]
impl FileProvider for StorageClient {
    async fn read(&self, file: &FileRef) -> Result<Vec<u8>> {
        let key = object_key(file);
        debug!("Fetching instructor file {}", key);
        self.download(&key).await
    }
}

/// Instructor files held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryFileProvider {
    files: HashMap<FileRef, Vec<u8>>,
}

impl MemoryFileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, file: FileRef, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(file, content.into());
        self
    }
}

#[async_trait]
impl FileProvider for MemoryFileProvider {
    async fn read(&self, file: &FileRef) -> Result<Vec<u8>> {
        self.files
            .get(file)
            .cloned()
            .with_context(|| format!("No such instructor file: {}", object_key(file)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_key() {
        assert_eq!(
            object_key(&FileRef::new(12, "expected.txt")),
            "projects/12/files/expected.txt"
        );
    }

    #[tokio::test]
    async fn test_memory_provider() {
        let file = FileRef::new(1, "in.txt");
        let provider = MemoryFileProvider::new().with_file(file.clone(), "1 2\n");

        let text = tokio_test::assert_ok!(provider.read_string(&file).await);
        assert_eq!(text, "1 2\n");
        let missing = provider.read(&FileRef::new(2, "in.txt")).await.unwrap_err();
        assert!(missing.to_string().contains("projects/2/files/in.txt"));
    }

    #[tokio::test]
    async fn test_read_string_rejects_invalid_utf8() {
        let file = FileRef::new(1, "bin");
        let provider = MemoryFileProvider::new().with_file(file.clone(), vec![0xff, 0xfe]);
        tokio_test::assert_err!(provider.read_string(&file).await);
    }
}
