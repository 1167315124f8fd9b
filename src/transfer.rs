//! Chunked, range-resumable copy between a [`ChunkSource`] and a [`ChunkSink`].
//!
//! Chunks are copied by a small pool of workers. Completion is tracked per
//! chunk and the reported resume offset only ever covers a contiguous prefix
//! of durably written bytes, so a crash can never resume past a hole.

use crate::error::ErrorKind;
use crate::transport::{ChunkSink, ChunkSource, TransportError};
use crate::{log_debug, log_info, log_warn};
use async_trait::async_trait;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::AsyncReadExt;
use tokio::task::JoinSet;
use tokio::time::{Duration, sleep, timeout};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferPolicy {
    pub chunk_size: u64,
    pub workers: usize,
    /// Consecutive faults tolerated per chunk before giving up.
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub chunk_timeout: Duration,
}

impl Default for TransferPolicy {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024 * 1024,
            workers: 4,
            max_retries: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            chunk_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("Transfer interrupted after {bytes_completed} bytes: {reason}")]
    TransferFailed { bytes_completed: u64, reason: String },

    #[error("Integrity check failed: expected {expected}, found {actual}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Transfer cancelled after {bytes_completed} bytes")]
    Cancelled { bytes_completed: u64 },

    #[error("Transport failed after {bytes_completed} bytes: {source}")]
    Transport {
        bytes_completed: u64,
        #[source]
        source: TransportError,
    },

    #[error("Could not record progress: {0}")]
    Checkpoint(String),
}

impl TransferError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::TransferFailed { .. } => ErrorKind::TransferFailed,
            TransferError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            TransferError::Cancelled { .. } => ErrorKind::Cancelled,
            TransferError::Transport { source, .. } => source.kind(),
            TransferError::Checkpoint(_) => ErrorKind::Internal,
        }
    }

    /// Durable progress at the time of failure, if any was made.
    pub fn bytes_completed(&self) -> Option<u64> {
        match self {
            TransferError::TransferFailed { bytes_completed, .. }
            | TransferError::Cancelled { bytes_completed }
            | TransferError::Transport { bytes_completed, .. } => Some(*bytes_completed),
            _ => None,
        }
    }
}

/// Receives the durable resume offset whenever it advances.
#[async_trait]
pub trait Checkpoint: Send + Sync {
    async fn checkpoint(&self, offset: u64) -> Result<(), TransferError>;
}

/// Checkpoint that discards progress; for one-shot copies.
pub struct NoCheckpoint;

#[async_trait]
impl Checkpoint for NoCheckpoint {
    async fn checkpoint(&self, _offset: u64) -> Result<(), TransferError> {
        Ok(())
    }
}

/// Cooperative cancellation, honoured between chunks only.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Tracks finished chunks and exposes the end of the contiguous finished prefix.
#[derive(Debug)]
struct ContiguousProgress {
    watermark: u64,
    next_index: u64,
    done: BTreeMap<u64, u64>,
}

impl ContiguousProgress {
    fn new(start: u64) -> Self {
        Self {
            watermark: start,
            next_index: 0,
            done: BTreeMap::new(),
        }
    }

    /// Record chunk `index` as complete up to `end`. Returns true when the
    /// watermark moved.
    fn complete(&mut self, index: u64, end: u64) -> bool {
        self.done.insert(index, end);
        let before = self.watermark;
        while let Some(end) = self.done.remove(&self.next_index) {
            self.watermark = end;
            self.next_index += 1;
        }
        self.watermark != before
    }

    /// A failed chunk that is next in line still contributes its durable bytes.
    fn partial(&mut self, index: u64, durable_end: u64) -> bool {
        if index == self.next_index && durable_end > self.watermark {
            self.watermark = durable_end;
            return true;
        }
        false
    }
}

struct ChunkFailure {
    index: u64,
    durable_end: u64,
    error: ChunkError,
}

enum ChunkError {
    Exhausted(String),
    Permanent(TransportError),
}

/// Copy `source` into `sink`, starting at `resume_offset`.
///
/// Returns the total size on success. On exhausted retries the error carries
/// the durable offset so the caller can persist it and resume later.
pub async fn transfer(
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
    resume_offset: u64,
    expected_size: Option<u64>,
    policy: &TransferPolicy,
    checkpoint: &dyn Checkpoint,
    cancel: &CancelFlag,
) -> Result<u64, TransferError> {
    let total = match expected_size {
        Some(size) => size,
        None => source.size().await.map_err(|e| TransferError::Transport {
            bytes_completed: resume_offset,
            source: e,
        })?,
    };
    let start = resume_offset.min(total);

    log_info!(
        source = %source.describe(),
        sink = %sink.describe(),
        total,
        resume_offset = start,
        "Starting transfer"
    );

    sink.prepare(start, total)
        .await
        .map_err(|e| TransferError::Transport {
            bytes_completed: start,
            source: e,
        })?;

    let chunk_size = policy.chunk_size.max(1);
    let chunk_count = (total - start).div_ceil(chunk_size);
    let mut progress = ContiguousProgress::new(start);
    let mut workers: JoinSet<Result<(u64, u64), ChunkFailure>> = JoinSet::new();
    let mut next_chunk = 0u64;
    let mut failure: Option<ChunkFailure> = None;
    let mut cancelled = false;

    loop {
        while failure.is_none()
            && !cancelled
            && next_chunk < chunk_count
            && workers.len() < policy.workers.max(1)
        {
            if cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let index = next_chunk;
            let begin = start + index * chunk_size;
            let end = (begin + chunk_size).min(total);
            let source = source.clone();
            let sink = sink.clone();
            let policy = *policy;
            workers.spawn(async move { copy_chunk(source, sink, index, begin, end, &policy).await });
            next_chunk += 1;
        }

        let Some(joined) = workers.join_next().await else {
            break;
        };

        let moved = match joined {
            Ok(Ok((index, end))) => progress.complete(index, end),
            Ok(Err(chunk_failure)) => {
                let moved = progress.partial(chunk_failure.index, chunk_failure.durable_end);
                if failure.is_none() {
                    failure = Some(chunk_failure);
                }
                moved
            }
            Err(join_err) => {
                if failure.is_none() {
                    failure = Some(ChunkFailure {
                        index: u64::MAX,
                        durable_end: 0,
                        error: ChunkError::Exhausted(format!("chunk worker aborted: {}", join_err)),
                    });
                }
                false
            }
        };

        if moved {
            checkpoint.checkpoint(progress.watermark).await?;
            log_debug!(offset = progress.watermark, total, "Transfer checkpoint");
        }
    }

    let bytes_completed = progress.watermark;

    if let Some(chunk_failure) = failure {
        return Err(match chunk_failure.error {
            ChunkError::Exhausted(reason) => {
                log_warn!(bytes_completed, %reason, "Transfer interrupted");
                TransferError::TransferFailed {
                    bytes_completed,
                    reason,
                }
            }
            ChunkError::Permanent(source) => TransferError::Transport {
                bytes_completed,
                source,
            },
        });
    }

    if cancelled {
        log_info!(bytes_completed, "Transfer cancelled at chunk boundary");
        return Err(TransferError::Cancelled { bytes_completed });
    }

    let written = sink.size().await.map_err(|e| TransferError::Transport {
        bytes_completed,
        source: e,
    })?;
    if written != total {
        return Err(TransferError::IntegrityMismatch {
            expected: format!("{} bytes", total),
            actual: format!("{} bytes", written),
        });
    }

    log_info!(total, "Transfer complete");
    Ok(total)
}

async fn copy_chunk(
    source: Arc<dyn ChunkSource>,
    sink: Arc<dyn ChunkSink>,
    index: u64,
    begin: u64,
    end: u64,
    policy: &TransferPolicy,
) -> Result<(u64, u64), ChunkFailure> {
    let mut pos = begin;
    let mut faults = 0u32;
    let mut backoff = policy.initial_backoff;

    let fail = |pos: u64, error: ChunkError| ChunkFailure {
        index,
        durable_end: pos,
        error,
    };

    while pos < end {
        let mut buf = Vec::with_capacity((end - pos) as usize);
        let read = timeout(policy.chunk_timeout, source.read_range(pos, end - pos, &mut buf)).await;

        // Whatever arrived before a fault is kept; the retry asks only for the rest.
        let appended = !buf.is_empty();
        if appended {
            if let Err(err) = sink.write_at(pos, &buf).await {
                return Err(fail(pos, sink_error(err)));
            }
            pos += buf.len() as u64;
            faults = 0;
            backoff = policy.initial_backoff;
        }

        let reason = match read {
            Ok(Ok(())) if appended => continue,
            Ok(Ok(())) => "source returned no data".to_string(),
            Ok(Err(err)) if err.is_transient() => err.to_string(),
            Ok(Err(err)) => {
                let durable = sync_or(pos, begin, sink.as_ref()).await;
                return Err(fail(durable, ChunkError::Permanent(err)));
            }
            Err(_) => format!("no response within {:?}", policy.chunk_timeout),
        };

        if pos >= end {
            break;
        }

        faults += 1;
        if faults > policy.max_retries {
            let durable = sync_or(pos, begin, sink.as_ref()).await;
            return Err(fail(
                durable,
                ChunkError::Exhausted(format!("{} (offset {})", reason, pos)),
            ));
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
        log_debug!(offset = pos, attempt = faults, %reason, "Retrying chunk");
        sleep(backoff + Duration::from_millis(jitter_ms)).await;
        backoff = (backoff * 2).min(policy.max_backoff);
    }

    if let Err(err) = sink.sync().await {
        return Err(fail(begin, sink_error(err)));
    }
    Ok((index, end))
}

fn sink_error(err: TransportError) -> ChunkError {
    if err.is_transient() {
        ChunkError::Exhausted(err.to_string())
    } else {
        ChunkError::Permanent(err)
    }
}

/// Sync the sink; if that fails nothing past `fallback` can be trusted.
async fn sync_or(pos: u64, fallback: u64, sink: &dyn ChunkSink) -> u64 {
    match sink.sync().await {
        Ok(()) => pos,
        Err(_) => fallback,
    }
}

/// Hex SHA-256 of a local file.
pub async fn sha256_file(path: &Path) -> Result<String, std::io::Error> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut block = vec![0u8; 8 * 1024 * 1024];
    loop {
        let n = file.read(&mut block).await?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compare a downloaded file against the checksum the provider published.
pub async fn verify_checksum(path: &Path, expected: &str) -> Result<(), TransferError> {
    let actual = sha256_file(path)
        .await
        .map_err(|e| TransferError::Checkpoint(format!("hashing {}: {}", path.display(), e)))?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(TransferError::IntegrityMismatch {
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
