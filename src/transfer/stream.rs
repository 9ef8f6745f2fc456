//! Streaming transfer of one file item: resume offsets, chunked writes,
//! durable progress flushes, and checksum verification.
//!
//! The durable offset lives in two places, the temp file on disk and the
//! `bytes_downloaded` column, and they are reconciled before every ranged
//! transfer: the resume offset is the minimum of the two, the temp file is
//! truncated to it, and the MD5 state is re-seeded from the surviving
//! prefix so the final digest always covers the whole file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::{ApiError, ByteStream};
use crate::limiter::BandwidthLimiter;
use crate::progress::ProgressTracker;
use crate::state::{StateError, Store};

/// Errors from a single transfer attempt.
#[derive(Debug, Error)]
pub enum TransferError {
    /// Remote call or stream failure.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Downloaded content does not match the declared checksum or size.
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        /// Download path that failed verification.
        path: PathBuf,
        /// Expected checksum or size.
        expected: String,
        /// Actual checksum or size.
        actual: String,
    },

    /// State store failure (fatal for the session).
    #[error(transparent)]
    State(#[from] StateError),
}

impl TransferError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Outcome of one streaming attempt.
#[derive(Debug)]
pub enum StreamOutcome {
    /// Stream drained; total bytes now in the temp file.
    Complete {
        /// Total temp file size (resume prefix + newly written).
        total_bytes: u64,
    },
    /// Cancellation fired; progress was flushed before returning.
    Cancelled,
}

/// Tuning knobs for one streaming attempt.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    /// Processing unit for writes, hashing, and bandwidth metering.
    pub chunk_size: usize,
    /// Bytes of new data between durable progress flushes.
    pub flush_interval_bytes: u64,
    /// Time between durable progress flushes.
    pub flush_interval: Duration,
    /// Idle-read deadline per network chunk.
    pub idle_timeout: Duration,
}

/// Reconciles the on-disk temp file with the store's durable offset.
///
/// Returns the resume offset. The temp file is truncated to the offset when
/// the two disagree; a missing temp file yields offset 0 regardless of the
/// recorded value (the bytes are simply gone).
///
/// # Errors
///
/// Returns [`TransferError::Io`] if the truncate fails.
pub async fn reconcile_resume_offset(
    temp_path: &Path,
    recorded_bytes: u64,
) -> Result<u64, TransferError> {
    let temp_len = tokio::fs::metadata(temp_path)
        .await
        .map(|m| m.len())
        .unwrap_or(0);

    let offset = temp_len.min(recorded_bytes);

    if temp_len != recorded_bytes {
        warn!(
            temp = %temp_path.display(),
            temp_len,
            recorded_bytes,
            offset,
            "temp file and durable offset disagree, truncating to minimum"
        );
    }

    if temp_len > offset {
        let file = OpenOptions::new()
            .write(true)
            .open(temp_path)
            .await
            .map_err(|e| TransferError::io(temp_path, e))?;
        file.set_len(offset)
            .await
            .map_err(|e| TransferError::io(temp_path, e))?;
    }

    Ok(offset)
}

/// Feeds the surviving temp-file prefix into a fresh MD5 state.
///
/// # Errors
///
/// Returns [`TransferError::Io`] if the prefix cannot be read.
pub async fn seed_hasher(
    temp_path: &Path,
    offset: u64,
    chunk_size: usize,
) -> Result<md5::Context, TransferError> {
    let mut context = md5::Context::new();
    if offset == 0 {
        return Ok(context);
    }

    let mut file = File::open(temp_path)
        .await
        .map_err(|e| TransferError::io(temp_path, e))?;
    let mut remaining = offset;
    let mut buf = vec![0u8; chunk_size];

    while remaining > 0 {
        #[allow(clippy::cast_possible_truncation)]
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file
            .read(&mut buf[..want])
            .await
            .map_err(|e| TransferError::io(temp_path, e))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
        remaining -= n as u64;
    }

    Ok(context)
}

/// Streams a remote body into the temp file from `offset`, flushing durable
/// progress on the byte/time cadence and stopping at a chunk boundary on
/// cancellation.
///
/// `hasher` is `None` when no verification will happen (no remote checksum).
/// `durable` is false for exports, whose offsets are meaningless across
/// restarts.
///
/// # Errors
///
/// Returns [`TransferError::Api`] on stream failure, [`TransferError::Io`]
/// on write failure, [`TransferError::State`] on a store failure.
#[allow(clippy::too_many_arguments)]
pub async fn stream_to_temp(
    mut body: ByteStream,
    temp_path: &Path,
    offset: u64,
    hasher: &mut Option<md5::Context>,
    settings: StreamSettings,
    store: &Store,
    item_id: i64,
    durable: bool,
    bandwidth: &BandwidthLimiter,
    progress: &ProgressTracker,
    cancel: &CancellationToken,
    context: &str,
) -> Result<StreamOutcome, TransferError> {
    let file = if offset > 0 {
        OpenOptions::new()
            .append(true)
            .open(temp_path)
            .await
            .map_err(|e| TransferError::io(temp_path, e))?
    } else {
        File::create(temp_path)
            .await
            .map_err(|e| TransferError::io(temp_path, e))?
    };
    let mut writer = BufWriter::new(file);

    let mut written: u64 = 0;
    let mut unflushed: u64 = 0;
    let mut last_flush = Instant::now();

    loop {
        let next = tokio::select! {
            chunk = tokio::time::timeout(settings.idle_timeout, body.next()) => match chunk {
                Ok(next) => next,
                Err(_) => return Err(ApiError::timeout(context).into()),
            },
            () = cancel.cancelled() => {
                flush_progress(
                    &mut writer, temp_path, store, item_id, offset + written, durable,
                )
                .await?;
                debug!(item_id, flushed = offset + written, "transfer cancelled at chunk boundary");
                return Ok(StreamOutcome::Cancelled);
            }
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;

        // Network chunks are re-cut to the configured processing unit so
        // bandwidth metering and cancellation stay fine-grained.
        for piece in chunk.chunks(settings.chunk_size.max(1)) {
            if bandwidth.acquire_bytes(piece.len(), cancel).await.is_err() {
                flush_progress(
                    &mut writer, temp_path, store, item_id, offset + written, durable,
                )
                .await?;
                return Ok(StreamOutcome::Cancelled);
            }

            if let Some(md5_state) = hasher.as_mut() {
                md5_state.consume(piece);
            }
            writer
                .write_all(piece)
                .await
                .map_err(|e| TransferError::io(temp_path, e))?;

            written += piece.len() as u64;
            unflushed += piece.len() as u64;
            progress.add_transferred(piece.len() as u64);

            if unflushed >= settings.flush_interval_bytes
                || last_flush.elapsed() >= settings.flush_interval
            {
                flush_progress(
                    &mut writer, temp_path, store, item_id, offset + written, durable,
                )
                .await?;
                unflushed = 0;
                last_flush = Instant::now();
            }
        }
    }

    flush_progress(&mut writer, temp_path, store, item_id, offset + written, durable).await?;

    Ok(StreamOutcome::Complete {
        total_bytes: offset + written,
    })
}

/// Flushes buffered writes and records the durable offset.
///
/// A non-monotonic rejection is tolerated: after temp-file loss the transfer
/// restarts below the recorded offset and only overtakes it later.
#[allow(clippy::cast_possible_wrap)]
async fn flush_progress(
    writer: &mut BufWriter<File>,
    temp_path: &Path,
    store: &Store,
    item_id: i64,
    total_bytes: u64,
    durable: bool,
) -> Result<(), TransferError> {
    writer
        .flush()
        .await
        .map_err(|e| TransferError::io(temp_path, e))?;

    if !durable {
        return Ok(());
    }

    match store.update_file_progress(item_id, total_bytes as i64).await {
        Ok(()) => Ok(()),
        Err(StateError::NonMonotonicProgress { .. }) => {
            debug!(
                item_id,
                total_bytes, "progress below recorded offset, catching up after temp loss"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Verifies the assembled temp file against the remote checksum.
///
/// # Errors
///
/// Returns [`TransferError::Integrity`] on mismatch.
pub fn verify_checksum(
    temp_path: &Path,
    digest: md5::Digest,
    expected: &str,
) -> Result<(), TransferError> {
    let actual = format!("{digest:x}");
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(TransferError::Integrity {
            path: temp_path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Computes the MD5 of an existing local file, for duplicate detection.
///
/// # Errors
///
/// Returns [`TransferError::Io`] if the file cannot be read.
pub async fn hash_local_file(path: &Path, chunk_size: usize) -> Result<String, TransferError> {
    let mut file = File::open(path)
        .await
        .map_err(|e| TransferError::io(path, e))?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; chunk_size.max(1)];

    loop {
        let n = file
            .read(&mut buf)
            .await
            .map_err(|e| TransferError::io(path, e))?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }

    Ok(format!("{:x}", context.compute()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::state::NewFileItem;

    use tempfile::TempDir;

    async fn store_with_item() -> (Store, i64, i64) {
        let db = Database::new_in_memory().await.unwrap();
        let store = Store::new(db);
        let session_id = store.create_session("root", "/tmp/d").await.unwrap();
        store
            .enqueue_files(
                session_id,
                &[NewFileItem {
                    remote_id: "f1".to_string(),
                    parent_remote_id: None,
                    rel_path: "f1.bin".to_string(),
                    size: Some(1000),
                    checksum: None,
                    mime_type: "application/octet-stream".to_string(),
                    export_mime: None,
                    modified_at: None,
                    skip_reason: None,
                }],
            )
            .await
            .unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();
        (store, session_id, item.id)
    }

    fn body_of(chunks: Vec<Vec<u8>>) -> ByteStream {
        Box::pin(futures_util::stream::iter(
            chunks.into_iter().map(|c| Ok(bytes::Bytes::from(c))),
        ))
    }

    fn settings() -> StreamSettings {
        StreamSettings {
            chunk_size: 4,
            flush_interval_bytes: 8,
            flush_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_reconcile_missing_temp_is_zero() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");

        let offset = reconcile_resume_offset(&temp, 500).await.unwrap();
        assert_eq!(offset, 0);
    }

    #[tokio::test]
    async fn test_reconcile_truncates_longer_temp() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");
        tokio::fs::write(&temp, vec![1u8; 100]).await.unwrap();

        // Store only saw 60 bytes flushed; the excess is untrusted
        let offset = reconcile_resume_offset(&temp, 60).await.unwrap();
        assert_eq!(offset, 60);
        assert_eq!(tokio::fs::metadata(&temp).await.unwrap().len(), 60);
    }

    #[tokio::test]
    async fn test_reconcile_agreement_untouched() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");
        tokio::fs::write(&temp, vec![1u8; 64]).await.unwrap();

        let offset = reconcile_resume_offset(&temp, 64).await.unwrap();
        assert_eq!(offset, 64);
        assert_eq!(tokio::fs::metadata(&temp).await.unwrap().len(), 64);
    }

    #[tokio::test]
    async fn test_stream_appends_and_records_progress() {
        let (store, _session, item_id) = store_with_item().await;
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");

        let body = body_of(vec![b"hello ".to_vec(), b"world".to_vec()]);
        let outcome = stream_to_temp(
            body,
            &temp,
            0,
            &mut None,
            settings(),
            &store,
            item_id,
            true,
            &BandwidthLimiter::new(0),
            &ProgressTracker::new(),
            &CancellationToken::new(),
            "test",
        )
        .await
        .unwrap();

        match outcome {
            StreamOutcome::Complete { total_bytes } => assert_eq!(total_bytes, 11),
            StreamOutcome::Cancelled => panic!("unexpected cancel"),
        }
        assert_eq!(tokio::fs::read(&temp).await.unwrap(), b"hello world");

        let item = store.get_file(item_id).await.unwrap().unwrap();
        assert_eq!(item.bytes_downloaded, 11);
    }

    #[tokio::test]
    async fn test_stream_resumes_from_offset() {
        let (store, _session, item_id) = store_with_item().await;
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");
        tokio::fs::write(&temp, b"hello ").await.unwrap();

        let body = body_of(vec![b"world".to_vec()]);
        let outcome = stream_to_temp(
            body,
            &temp,
            6,
            &mut None,
            settings(),
            &store,
            item_id,
            true,
            &BandwidthLimiter::new(0),
            &ProgressTracker::new(),
            &CancellationToken::new(),
            "test",
        )
        .await
        .unwrap();

        match outcome {
            StreamOutcome::Complete { total_bytes } => assert_eq!(total_bytes, 11),
            StreamOutcome::Cancelled => panic!("unexpected cancel"),
        }
        assert_eq!(tokio::fs::read(&temp).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_stream_cancel_flushes_offset() {
        let (store, _session, item_id) = store_with_item().await;
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");

        let cancel = CancellationToken::new();
        cancel.cancel();

        // A never-ending body; cancellation must win the select
        let body: ByteStream = Box::pin(futures_util::stream::pending());
        let outcome = stream_to_temp(
            body,
            &temp,
            0,
            &mut None,
            settings(),
            &store,
            item_id,
            true,
            &BandwidthLimiter::new(0),
            &ProgressTracker::new(),
            &cancel,
            "test",
        )
        .await
        .unwrap();

        assert!(matches!(outcome, StreamOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_stream_surfaces_body_error() {
        let (store, _session, item_id) = store_with_item().await;
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");

        let body: ByteStream = Box::pin(futures_util::stream::iter(vec![
            Ok(bytes::Bytes::from_static(b"part")),
            Err(ApiError::http_status("download", 500)),
        ]));
        let result = stream_to_temp(
            body,
            &temp,
            0,
            &mut None,
            settings(),
            &store,
            item_id,
            true,
            &BandwidthLimiter::new(0),
            &ProgressTracker::new(),
            &CancellationToken::new(),
            "test",
        )
        .await;

        assert!(matches!(result, Err(TransferError::Api(_))));
    }

    #[tokio::test]
    async fn test_hasher_seeded_prefix_matches_whole_file() {
        let dir = TempDir::new().unwrap();
        let temp = dir.path().join("1.part");
        tokio::fs::write(&temp, b"hello ").await.unwrap();

        let mut context = seed_hasher(&temp, 6, 4).await.unwrap();
        context.consume(b"world");
        let resumed = format!("{:x}", context.compute());

        let whole = format!("{:x}", md5::compute(b"hello world"));
        assert_eq!(resumed, whole);
    }

    #[test]
    fn test_verify_checksum_match_case_insensitive() {
        let digest = md5::compute(b"content");
        let expected = format!("{digest:x}").to_uppercase();
        assert!(verify_checksum(Path::new("/tmp/x"), digest, &expected).is_ok());
    }

    #[test]
    fn test_verify_checksum_mismatch() {
        let digest = md5::compute(b"content");
        let result = verify_checksum(Path::new("/tmp/x"), digest, "deadbeef");
        assert!(matches!(result, Err(TransferError::Integrity { .. })));
    }

    #[tokio::test]
    async fn test_hash_local_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"local bytes").await.unwrap();

        let hash = hash_local_file(&path, 4).await.unwrap();
        assert_eq!(hash, format!("{:x}", md5::compute(b"local bytes")));
    }
}
