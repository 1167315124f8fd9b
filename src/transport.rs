//! Byte-range sources and sinks used by the resumable transfer.
//!
//! `file://` URIs (and bare paths) map to local files, `http(s)://` URIs to
//! presigned object-storage URLs handed out by the provider adapters.

use crate::error::ErrorKind;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::Mutex;

const READ_BLOCK: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transient transport fault: {0}")]
    Transient(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported location: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Transient(_) => ErrorKind::Transient,
            TransportError::NotFound(_) => ErrorKind::NotFound,
            TransportError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            TransportError::Unsupported(_) => ErrorKind::InvalidIdentifier,
            TransportError::Io(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return status_error(status, err.to_string());
        }
        // Connect, timeout, reset and body decode errors are all retryable.
        TransportError::Transient(err.to_string())
    }
}

fn status_error(status: StatusCode, context: String) -> TransportError {
    match status {
        StatusCode::NOT_FOUND => TransportError::NotFound(context),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => TransportError::PermissionDenied(context),
        s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
            TransportError::Transient(format!("{}: {}", s, context))
        }
        s => TransportError::Unsupported(format!("{}: {}", s, context)),
    }
}

/// Readable side of a transfer.
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn size(&self) -> Result<u64, TransportError>;

    /// Append bytes `[offset, offset + len)` to `buf` as they arrive. On error
    /// `buf` keeps whatever was received before the fault.
    async fn read_range(&self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<(), TransportError>;

    fn describe(&self) -> String;
}

/// Writable side of a transfer.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    /// Called once before any write. A fresh transfer (`resume_offset == 0`)
    /// may discard existing content; a resumed one must not.
    async fn prepare(&self, resume_offset: u64, total: u64) -> Result<(), TransportError>;

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransportError>;

    /// Make every completed write durable.
    async fn sync(&self) -> Result<(), TransportError>;

    async fn size(&self) -> Result<u64, TransportError>;

    fn describe(&self) -> String;
}

/// Resolves URIs into sources and sinks.
pub trait Transports: Send + Sync {
    fn source(&self, uri: &str) -> Result<Arc<dyn ChunkSource>, TransportError>;
    fn sink(&self, uri: &str) -> Result<Arc<dyn ChunkSink>, TransportError>;
}

pub fn local_path(uri: &str) -> Option<PathBuf> {
    if let Some(rest) = uri.strip_prefix("file://") {
        return Some(PathBuf::from(rest));
    }
    if uri.contains("://") {
        return None;
    }
    Some(PathBuf::from(uri))
}

pub fn file_uri(path: &Path) -> String {
    format!("file://{}", path.display())
}

pub struct DefaultTransports {
    http: reqwest::Client,
}

impl DefaultTransports {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for DefaultTransports {
    fn default() -> Self {
        Self::new()
    }
}

impl Transports for DefaultTransports {
    fn source(&self, uri: &str) -> Result<Arc<dyn ChunkSource>, TransportError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Arc::new(HttpSource::new(self.http.clone(), uri)));
        }
        match local_path(uri) {
            Some(path) => Ok(Arc::new(FileSource::new(path))),
            None => Err(TransportError::Unsupported(uri.to_string())),
        }
    }

    fn sink(&self, uri: &str) -> Result<Arc<dyn ChunkSink>, TransportError> {
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return Ok(Arc::new(HttpSink::new(self.http.clone(), uri)));
        }
        match local_path(uri) {
            Some(path) => Ok(Arc::new(FileSink::new(path))),
            None => Err(TransportError::Unsupported(uri.to_string())),
        }
    }
}

pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn open_error(path: &Path, err: std::io::Error) -> TransportError {
    match err.kind() {
        std::io::ErrorKind::NotFound => TransportError::NotFound(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => {
            TransportError::PermissionDenied(path.display().to_string())
        }
        _ => TransportError::Io(err),
    }
}

#[async_trait]
impl ChunkSource for FileSource {
    async fn size(&self) -> Result<u64, TransportError> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| open_error(&self.path, e))?;
        Ok(meta.len())
    }

    async fn read_range(&self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        let mut file = File::open(&self.path)
            .await
            .map_err(|e| open_error(&self.path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut remaining = len;
        let mut block = vec![0u8; READ_BLOCK.min(len as usize).max(1)];
        while remaining > 0 {
            let want = remaining.min(block.len() as u64) as usize;
            let n = file.read(&mut block[..want]).await?;
            if n == 0 {
                return Err(TransportError::Transient(format!(
                    "{} ended {} bytes early",
                    self.path.display(),
                    remaining
                )));
            }
            buf.extend_from_slice(&block[..n]);
            remaining -= n as u64;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> Result<File, TransportError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&self.path)
            .await
            .map_err(|e| open_error(&self.path, e))
    }
}

#[async_trait]
impl ChunkSink for FileSink {
    async fn prepare(&self, resume_offset: u64, _total: u64) -> Result<(), TransportError> {
        let file = self.open().await?;
        if resume_offset == 0 {
            file.set_len(0).await?;
        } else {
            let current = file.metadata().await?.len();
            if current < resume_offset {
                return Err(TransportError::Unsupported(format!(
                    "{} holds {} bytes but resume offset is {}",
                    self.path.display(),
                    current,
                    resume_offset
                )));
            }
        }
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        if let Some(file) = guard.as_mut() {
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(data).await?;
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), TransportError> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.as_mut() {
            file.flush().await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    async fn size(&self) -> Result<u64, TransportError> {
        let meta = tokio::fs::metadata(&self.path)
            .await
            .map_err(|e| open_error(&self.path, e))?;
        Ok(meta.len())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

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
impl ChunkSource for HttpSource {
    async fn size(&self) -> Result<u64, TransportError> {
        let response = self.client.head(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response.status(), redact(&self.url)));
        }
        response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Unsupported("missing Content-Length".to_string()))
    }

    async fn read_range(&self, offset: u64, len: u64, buf: &mut Vec<u8>) -> Result<(), TransportError> {
        if len == 0 {
            return Ok(());
        }
        let end = offset + len - 1;
        let mut response = self
            .client
            .get(&self.url)
            .header(RANGE, format!("bytes={}-{}", offset, end))
            .send()
            .await?;

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if offset == 0 => {}
            status if status.is_success() => {
                return Err(TransportError::Unsupported(format!(
                    "server ignored range request ({})",
                    status
                )));
            }
            status => return Err(status_error(status, redact(&self.url))),
        }

        let start_len = buf.len();
        while let Some(bytes) = response.chunk().await? {
            let received = (buf.len() - start_len) as u64;
            let take = (len - received).min(bytes.len() as u64) as usize;
            buf.extend_from_slice(&bytes[..take]);
            if (buf.len() - start_len) as u64 >= len {
                return Ok(());
            }
        }

        let received = (buf.len() - start_len) as u64;
        Err(TransportError::Transient(format!(
            "truncated body: got {} of {} bytes at offset {}",
            received, len, offset
        )))
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}

/// Uploads ranges with `PUT` + `Content-Range`, the resumable protocol
/// exposed by the staging buckets. Each request carries a SHA-256 checksum.
pub struct HttpSink {
    client: reqwest::Client,
    url: String,
    total: Mutex<u64>,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            total: Mutex::new(0),
        }
    }
}

#[async_trait]
impl ChunkSink for HttpSink {
    async fn prepare(&self, _resume_offset: u64, total: u64) -> Result<(), TransportError> {
        *self.total.lock().await = total;
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransportError> {
        if data.is_empty() {
            return Ok(());
        }
        let total = *self.total.lock().await;
        let end = offset + data.len() as u64 - 1;
        let checksum = BASE64.encode(Sha256::digest(data));

        let response = self
            .client
            .put(&self.url)
            .header(CONTENT_RANGE, format!("bytes {}-{}/{}", offset, end, total))
            .header("x-amz-checksum-sha256", checksum)
            .body(data.to_vec())
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), redact(&self.url)));
        }
        Ok(())
    }

    async fn sync(&self) -> Result<(), TransportError> {
        // Every successful PUT is already committed server-side.
        Ok(())
    }

    async fn size(&self) -> Result<u64, TransportError> {
        HttpSource::new(self.client.clone(), self.url.clone()).size().await
    }

    fn describe(&self) -> String {
        redact(&self.url)
    }
}

/// Drop the query string, which carries the signature of presigned URLs.
fn redact(url: &str) -> String {
    match url.split_once('?') {
        Some((base, _)) => format!("{}?<redacted>", base),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn resolves_local_paths() {
        assert_eq!(local_path("file:///tmp/a.vhd"), Some(PathBuf::from("/tmp/a.vhd")));
        assert_eq!(local_path("/tmp/b.qcow2"), Some(PathBuf::from("/tmp/b.qcow2")));
        assert_eq!(local_path("s3://bucket/key"), None);
    }

    #[test]
    fn signatures_are_not_logged() {
        let url = "https://acct.blob.core.windows.net/vhds/os.vhd?sv=2023&sig=SECRET";
        assert!(!redact(url).contains("SECRET"));
    }

    #[test]
    fn unsupported_schemes_are_rejected() {
        let transports = DefaultTransports::new();
        assert!(matches!(
            transports.source("gs://bucket/disk.vmdk"),
            Err(TransportError::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn file_round_trip_preserves_offsets() {
        let dir = TempDir::new().unwrap();
        let src_path = dir.path().join("src.img");
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&src_path, &data).await.unwrap();

        let source = FileSource::new(&src_path);
        let sink = FileSink::new(dir.path().join("out/dst.img"));
        sink.prepare(0, data.len() as u64).await.unwrap();

        let mut buf = Vec::new();
        source.read_range(4000, 6000, &mut buf).await.unwrap();
        sink.write_at(4000, &buf).await.unwrap();
        buf.clear();
        source.read_range(0, 4000, &mut buf).await.unwrap();
        sink.write_at(0, &buf).await.unwrap();
        sink.sync().await.unwrap();

        let written = tokio::fs::read(dir.path().join("out/dst.img")).await.unwrap();
        assert_eq!(written, data);
    }

    #[tokio::test]
    async fn short_file_is_a_transient_fault() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.img");
        tokio::fs::write(&path, vec![1u8; 100]).await.unwrap();

        let mut buf = Vec::new();
        let err = FileSource::new(&path).read_range(50, 100, &mut buf).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(buf.len(), 50);
    }

    #[tokio::test]
    async fn resumed_sink_keeps_existing_bytes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.img");
        tokio::fs::write(&path, vec![7u8; 64]).await.unwrap();

        let sink = FileSink::new(&path);
        sink.prepare(64, 128).await.unwrap();
        sink.write_at(64, &[9u8; 64]).await.unwrap();
        sink.sync().await.unwrap();

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written.len(), 128);
        assert!(written[..64].iter().all(|b| *b == 7));
        assert!(written[64..].iter().all(|b| *b == 9));
    }
}
