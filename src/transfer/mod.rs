//! Download worker pool.
//!
//! Workers claim file items from the state store, stream their content with
//! byte-range resume, verify checksums, and atomically rename the result
//! into place. Two admission gates apply: the pool size itself (one item per
//! worker) and a remote-call semaphore bounding concurrent API streams,
//! which may be sized differently from the pool.
//!
//! Retry behavior follows the shared policy: transient failures back off and
//! retry the same item from its current offset; permanent failures mark the
//! item failed and the worker moves on. Attempt counts persist, so a process
//! restart does not reset an item's retry budget.

mod stream;

pub use stream::{StreamOutcome, StreamSettings, TransferError};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use filetime::FileTime;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::RemoteApi;
use crate::config::SyncConfig;
use crate::limiter::{BandwidthLimiter, RateLimiter};
use crate::paths::{item_temp_path, resolve_final_path};
use crate::progress::ProgressTracker;
use crate::retry::{self, ErrorClass, RetryDecision, RetryPolicy};
use crate::state::{FileItem, FileStatus, StateError, Store};

/// Idle poll interval while waiting for the walker to produce items.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Consecutive local-IO item failures before the storage is declared
/// unusable and the session fails.
const STORAGE_UNUSABLE_THRESHOLD: u32 = 5;

/// Worker-fatal errors; anything else is folded into item rows.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// The state store failed; the session cannot continue.
    #[error(transparent)]
    State(#[from] StateError),

    /// The session crossed its error threshold.
    #[error("session exceeded max errors ({count})")]
    TooManyFailures {
        /// The error count that crossed the threshold.
        count: i64,
    },

    /// Repeated local IO failures across items; the destination is unusable.
    #[error("local storage unusable after {count} consecutive IO failures")]
    StorageUnusable {
        /// Consecutive failed items.
        count: u32,
    },
}

/// Outcome of processing one claimed item.
#[derive(Debug, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
    FailedLocalIo,
    Cancelled,
}

/// Shared download worker over the capability bundle.
///
/// The engine spawns `workers` clones of this; coordination happens through
/// item rows and the shared semaphore.
#[derive(Clone)]
pub struct Worker {
    api: Arc<dyn RemoteApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    bandwidth: Arc<BandwidthLimiter>,
    policy: RetryPolicy,
    config: Arc<SyncConfig>,
    progress: Arc<ProgressTracker>,
    remote_slots: Arc<Semaphore>,
}

impl Worker {
    /// Creates a download worker.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Store,
        limiter: Arc<RateLimiter>,
        bandwidth: Arc<BandwidthLimiter>,
        config: Arc<SyncConfig>,
        progress: Arc<ProgressTracker>,
        remote_slots: Arc<Semaphore>,
    ) -> Self {
        let policy = RetryPolicy::with_max_attempts(config.max_file_attempts);
        Self {
            api,
            store,
            limiter,
            bandwidth,
            policy,
            config,
            progress,
            remote_slots,
        }
    }

    /// Runs this worker until the queue drains or `cancel` fires.
    ///
    /// The worker exits cleanly when the walk is done and no pending or
    /// in-progress items remain anywhere in the session.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError`] only for session-fatal conditions.
    #[instrument(skip(self, dest_root, temp_dir, cancel), fields(session_id))]
    pub async fn run(
        &self,
        session_id: i64,
        dest_root: &Path,
        temp_dir: &Path,
        cancel: CancellationToken,
    ) -> Result<(), WorkerError> {
        let mut consecutive_io_failures: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                debug!("worker exiting on cancellation");
                return Ok(());
            }

            let Some(item) = self.store.claim_next_file(session_id).await? else {
                let session = self
                    .store
                    .get_session(session_id)
                    .await?
                    .ok_or(StateError::NotFound(session_id))?;
                let in_progress = self
                    .store
                    .count_files_by_status(session_id, FileStatus::InProgress)
                    .await?;
                if session.walk_done && in_progress == 0 {
                    debug!("queue drained, worker exiting");
                    return Ok(());
                }
                tokio::select! {
                    () = tokio::time::sleep(IDLE_POLL) => {}
                    () = cancel.cancelled() => return Ok(()),
                }
                continue;
            };

            self.progress.worker_started();
            self.progress.set_current_file(&item.rel_path);
            let outcome = self.process_item(&item, dest_root, temp_dir, &cancel).await;
            self.progress.worker_finished();

            match outcome? {
                ItemOutcome::Completed | ItemOutcome::Failed => {
                    consecutive_io_failures = 0;
                }
                ItemOutcome::FailedLocalIo => {
                    consecutive_io_failures += 1;
                    if consecutive_io_failures >= STORAGE_UNUSABLE_THRESHOLD {
                        return Err(WorkerError::StorageUnusable {
                            count: consecutive_io_failures,
                        });
                    }
                }
                ItemOutcome::Cancelled => return Ok(()),
            }
        }
    }

    /// Runs the per-item procedure: paths, duplicate check, transfer with
    /// retries, verification, and commit.
    async fn process_item(
        &self,
        item: &FileItem,
        dest_root: &Path,
        temp_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome, WorkerError> {
        let final_path = match resolve_final_path(dest_root, &item.rel_path) {
            Ok(path) => path,
            Err(e) => {
                warn!(item_id = item.id, error = %e, "rejecting unsafe path");
                return self.finalize_failure(item, &e.to_string()).await;
            }
        };

        if let Some(parent) = final_path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(item_id = item.id, error = %e, "cannot create destination directory");
                let count = self.store.fail_file(item.id, &e.to_string()).await?;
                self.progress.add_failed();
                return self.check_threshold(count, ItemOutcome::FailedLocalIo);
            }
        }

        let temp_path = item_temp_path(temp_dir, item.id);

        // An identical file already in place completes without a transfer.
        if self.config.skip_duplicates
            && self.is_duplicate(item, &final_path).await.unwrap_or(false)
        {
            let len = tokio::fs::metadata(&final_path)
                .await
                .map(|m| m.len())
                .unwrap_or(0);
            info!(item_id = item.id, path = %final_path.display(), "identical file exists, skipping transfer");
            #[allow(clippy::cast_possible_wrap)]
            self.store.complete_file(item.id, len as i64).await?;
            self.progress.add_completed(len, item.size.is_none());
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Ok(ItemOutcome::Completed);
        }

        self.transfer_with_retry(item, &temp_path, &final_path, cancel)
            .await
    }

    /// Transfers one item, retrying per the shared policy.
    async fn transfer_with_retry(
        &self,
        item: &FileItem,
        temp_path: &Path,
        final_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<ItemOutcome, WorkerError> {
        loop {
            match self.transfer_once(item, temp_path, cancel).await {
                Ok(StreamOutcome::Cancelled) => {
                    // Offset already flushed; the row stays in_progress for
                    // orphan reclamation on resume.
                    return Ok(ItemOutcome::Cancelled);
                }
                Ok(StreamOutcome::Complete { total_bytes }) => {
                    if let Err(e) = self.commit(item, temp_path, final_path).await {
                        warn!(item_id = item.id, error = %e, "commit failed");
                        let count = self.store.fail_file(item.id, &e.to_string()).await?;
                        self.progress.add_failed();
                        return self.check_threshold(count, ItemOutcome::FailedLocalIo);
                    }

                    #[allow(clippy::cast_possible_wrap)]
                    self.store.complete_file(item.id, total_bytes as i64).await?;
                    self.progress
                        .add_completed(total_bytes, item.size.is_none());
                    #[allow(clippy::cast_sign_loss)]
                    self.progress
                        .clear_transferred(total_bytes.saturating_sub(item.bytes_downloaded.max(0) as u64));
                    info!(
                        item_id = item.id,
                        path = %final_path.display(),
                        bytes = total_bytes,
                        "download completed"
                    );
                    return Ok(ItemOutcome::Completed);
                }
                Err(TransferError::State(e)) => return Err(e.into()),
                Err(error) => {
                    let (class, retry_after, local_io) = classify_transfer_error(&error);

                    if matches!(error, TransferError::Integrity { .. }) {
                        // A corrupt partial poisons every later resume
                        let _ = tokio::fs::remove_file(temp_path).await;
                    }

                    let attempts = self
                        .store
                        .record_file_attempt(item.id, &error.to_string())
                        .await?;
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let decision = self.policy.decide(class, attempts as u32, retry_after);

                    match decision {
                        RetryDecision::Retry { delay, .. } => {
                            info!(
                                item_id = item.id,
                                attempt = attempts + 1,
                                max_attempts = self.policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                error = %error,
                                "retrying download"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = cancel.cancelled() => return Ok(ItemOutcome::Cancelled),
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(
                                item_id = item.id,
                                error = %error,
                                %reason,
                                "download failed after all attempts"
                            );
                            let _ = tokio::fs::remove_file(temp_path).await;
                            let count = self.store.fail_file(item.id, &error.to_string()).await?;
                            self.progress.add_failed();
                            let failed_kind = if local_io {
                                ItemOutcome::FailedLocalIo
                            } else {
                                ItemOutcome::Failed
                            };
                            return self.check_threshold(count, failed_kind);
                        }
                    }
                }
            }
        }
    }

    /// One streaming attempt: export whole-body or ranged resume.
    async fn transfer_once(
        &self,
        item: &FileItem,
        temp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StreamOutcome, TransferError> {
        // Bound concurrent remote calls separately from pool size
        let Ok(_slot) = Arc::clone(&self.remote_slots).acquire_owned().await else {
            return Ok(StreamOutcome::Cancelled);
        };
        if self.limiter.acquire(cancel).await.is_err() {
            return Ok(StreamOutcome::Cancelled);
        }

        #[allow(clippy::cast_possible_truncation)]
        let chunk_size = self.config.chunk_size_bytes.max(1) as usize;
        let settings = StreamSettings {
            chunk_size,
            flush_interval_bytes: self.config.flush_interval_bytes.max(1),
            flush_interval: self.config.flush_interval(),
            idle_timeout: self.config.request_timeout(),
        };
        let context = format!("download of {}", item.remote_id);

        let (body, offset, mut hasher, durable) = if let Some(export_mime) = &item.export_mime {
            // Exports are one-shot; a partial from a previous run is useless
            let _ = tokio::fs::remove_file(temp_path).await;
            let body = self.api.export(&item.remote_id, export_mime).await?;
            let hasher = item.checksum.as_ref().map(|_| md5::Context::new());
            (body, 0u64, hasher, false)
        } else {
            #[allow(clippy::cast_sign_loss)]
            let recorded = item.bytes_downloaded.max(0) as u64;
            let offset = stream::reconcile_resume_offset(temp_path, recorded).await?;
            let hasher = match &item.checksum {
                Some(_) => Some(stream::seed_hasher(temp_path, offset, settings.chunk_size).await?),
                None => None,
            };
            let body = self.api.open_range(&item.remote_id, offset, None).await?;
            (body, offset, hasher, true)
        };

        let outcome = stream::stream_to_temp(
            body,
            temp_path,
            offset,
            &mut hasher,
            settings,
            &self.store,
            item.id,
            durable,
            &self.bandwidth,
            &self.progress,
            cancel,
            &context,
        )
        .await?;

        if let StreamOutcome::Complete { total_bytes } = &outcome {
            // Declared size (ranged downloads only) and checksum must match
            if durable {
                if let Some(size) = item.size {
                    #[allow(clippy::cast_sign_loss)]
                    if size.max(0) as u64 != *total_bytes {
                        return Err(TransferError::Integrity {
                            path: temp_path.to_path_buf(),
                            expected: format!("{size} bytes"),
                            actual: format!("{total_bytes} bytes"),
                        });
                    }
                }
            }
            if let (Some(md5_state), Some(expected)) = (hasher.take(), &item.checksum) {
                stream::verify_checksum(temp_path, md5_state.compute(), expected)?;
            }
        }

        Ok(outcome)
    }

    /// Commits a verified temp file: timestamps, then atomic rename.
    async fn commit(
        &self,
        item: &FileItem,
        temp_path: &Path,
        final_path: &Path,
    ) -> Result<(), TransferError> {
        if self.config.preserve_timestamps {
            if let Some(mtime) = item
                .modified_at
                .as_deref()
                .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            {
                let file_time = FileTime::from_unix_time(
                    mtime.timestamp(),
                    mtime.timestamp_subsec_nanos(),
                );
                filetime::set_file_mtime(temp_path, file_time)
                    .map_err(|e| TransferError::io(temp_path, e))?;
            }
        }

        tokio::fs::rename(temp_path, final_path)
            .await
            .map_err(|e| TransferError::io(final_path, e))
    }

    /// Whether an existing final file is identical to the remote item.
    async fn is_duplicate(&self, item: &FileItem, final_path: &Path) -> Option<bool> {
        let metadata = tokio::fs::metadata(final_path).await.ok()?;
        if !metadata.is_file() {
            return Some(false);
        }

        if let Some(size) = item.size {
            #[allow(clippy::cast_sign_loss)]
            if metadata.len() != size.max(0) as u64 {
                return Some(false);
            }
        } else {
            // No declared size (export): an existing file can't be trusted
            return Some(false);
        }

        match &item.checksum {
            Some(expected) => {
                #[allow(clippy::cast_possible_truncation)]
                let chunk = self.config.chunk_size_bytes.max(1) as usize;
                let actual = stream::hash_local_file(final_path, chunk).await.ok()?;
                Some(actual.eq_ignore_ascii_case(expected))
            }
            None => Some(true),
        }
    }

    /// Fails an item for a non-transfer reason (e.g. path rejection).
    async fn finalize_failure(
        &self,
        item: &FileItem,
        message: &str,
    ) -> Result<ItemOutcome, WorkerError> {
        let count = self.store.fail_file(item.id, message).await?;
        self.progress.add_failed();
        self.check_threshold(count, ItemOutcome::Failed)
    }

    /// Maps a failure outcome through the session error threshold.
    #[allow(clippy::cast_possible_wrap)]
    fn check_threshold(
        &self,
        error_count: i64,
        outcome: ItemOutcome,
    ) -> Result<ItemOutcome, WorkerError> {
        if error_count > self.config.max_errors as i64 {
            Err(WorkerError::TooManyFailures { count: error_count })
        } else {
            Ok(outcome)
        }
    }
}

/// Classifies a transfer error: retry class, server delay, and whether it
/// was local IO (counted toward storage-unusable).
fn classify_transfer_error(
    error: &TransferError,
) -> (ErrorClass, Option<Duration>, bool) {
    match error {
        TransferError::Api(api) => (retry::classify(api), retry::retry_after_delay(api), false),
        TransferError::Integrity { .. } => (ErrorClass::Transient, None, false),
        TransferError::Io { .. } => (ErrorClass::Permanent, None, true),
        TransferError::State(_) => (ErrorClass::Permanent, None, false),
    }
}
