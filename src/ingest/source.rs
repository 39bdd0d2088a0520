//! Byte stream providers for job input.

use crate::error::JobError;
use async_trait::async_trait;
use futures_util::TryStreamExt;
use std::io::Cursor;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Opens the input of one job. Called exactly once, from the worker.
#[async_trait]
pub trait ByteStreamProvider: Send + Sync {
    async fn open(&self) -> Result<ByteStream, JobError>;

    /// Short human-readable origin, used in logs.
    fn describe(&self) -> String;
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ByteStreamProvider for FileSource {
    async fn open(&self) -> Result<ByteStream, JobError> {
        let file = tokio::fs::File::open(&self.path).await.map_err(|e| {
            JobError::StreamAcquisition(format!("{}: {}", self.path.display(), e))
        })?;
        Ok(Box::new(tokio::io::BufReader::new(file)))
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Input already held in memory.
pub struct MemorySource {
    bytes: Vec<u8>,
}

impl MemorySource {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }
}

#[async_trait]
impl ByteStreamProvider for MemorySource {
    async fn open(&self) -> Result<ByteStream, JobError> {
        Ok(Box::new(Cursor::new(self.bytes.clone())))
    }

    fn describe(&self) -> String {
        format!("{} bytes in memory", self.bytes.len())
    }
}

/// Streams the body of an HTTP(S) GET.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
}

impl HttpSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ByteStreamProvider for HttpSource {
    async fn open(&self) -> Result<ByteStream, JobError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| JobError::StreamAcquisition(format!("{}: {}", self.url, e)))?;

        let body = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(body))))
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}
