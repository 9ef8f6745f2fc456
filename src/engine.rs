//! Session coordinator: lifecycle, task ownership, checkpoints, and
//! cancellation fan-out.
//!
//! The engine is the only component that spawns tasks. It receives its
//! collaborators (remote API, state store, configuration) explicitly and
//! wires the shared rate limiter, bandwidth cap, and progress tracker from
//! them; nothing in the pipeline reaches for globals. One cancellation token
//! fans out to every task; on cancellation, workers flush their offsets at
//! the next chunk boundary and the session parks as `paused`, resumable.
//!
//! # Example
//!
//! ```ignore
//! let engine = SyncEngine::new(api, store, config)?;
//! let summary = engine
//!     .start_new("root-folder-id", Path::new("/data/sync"), SyncOptions::default(), cancel)
//!     .await?;
//! println!("{}: {}/{} files", summary.status, summary.completed_files, summary.total_files);
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::api::RemoteApi;
use crate::config::SyncConfig;
use crate::limiter::{BandwidthLimiter, RateLimiter};
use crate::paths::session_temp_dir;
use crate::progress::{EngineState, ProgressTracker, SAMPLE_INTERVAL};
use crate::state::{FolderStatus, SessionStatus, StateError, Store};
use crate::transfer::{Worker, WorkerError};
use crate::walker::{FilterError, PathFilter, WalkError, Walker};

/// Shutdown grace after cancellation before tasks are aborted outright.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Failed-item samples carried in the summary, per error kind.
const SUMMARY_ERRORS_PER_KIND: usize = 5;

/// Engine-level errors: infrastructure only. Item and folder failures are
/// folded into the session and reported through the summary.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The state store failed beyond its one-retry budget.
    #[error(transparent)]
    State(#[from] StateError),

    /// A configured include/exclude pattern is malformed.
    #[error(transparent)]
    Filter(#[from] FilterError),

    /// The requested session does not exist.
    #[error("session {0} not found")]
    SessionNotFound(i64),

    /// The destination directory cannot be prepared.
    #[error("cannot prepare destination {path}: {source}")]
    Destination {
        /// The destination path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },
}

/// Per-run options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SyncOptions {
    /// Enumerate the tree without engaging the download workers. The session
    /// parks as `paused`, so a later real run resumes from the enumeration.
    pub dry_run: bool,
}

/// One sampled error in the summary.
#[derive(Debug, Clone)]
pub struct ErrorSample {
    /// Coarse kind: `not-found`, `authorization`, `integrity`, `transient`,
    /// `local-io`, `other`.
    pub kind: &'static str,
    /// Relative path of the failed item.
    pub path: String,
    /// The recorded error message.
    pub message: String,
}

/// Final report of a sync run.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// The session this run operated on.
    pub session_id: i64,
    /// Terminal (or parked) session status.
    pub status: SessionStatus,
    /// Files discovered.
    pub total_files: i64,
    /// Files completed.
    pub completed_files: i64,
    /// Files failed.
    pub failed_files: i64,
    /// Files skipped at enqueue time.
    pub skipped_files: i64,
    /// Bytes discovered.
    pub total_bytes: i64,
    /// Bytes completed.
    pub completed_bytes: i64,
    /// Non-fatal errors recorded.
    pub error_count: i64,
    /// Session-level error message, if any.
    pub last_error: Option<String>,
    /// First few failed items per error kind.
    pub errors: Vec<ErrorSample>,
}

/// The sync engine: owns every task of a running session.
pub struct SyncEngine {
    api: Arc<dyn RemoteApi>,
    store: Store,
    config: Arc<SyncConfig>,
    limiter: Arc<RateLimiter>,
    bandwidth: Arc<BandwidthLimiter>,
    progress: Arc<ProgressTracker>,
}

impl SyncEngine {
    /// Creates an engine over the capability bundle.
    #[must_use]
    pub fn new(api: Arc<dyn RemoteApi>, store: Store, config: SyncConfig) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.api_rate_per_sec, config.api_burst));
        let bandwidth = Arc::new(BandwidthLimiter::new(config.bandwidth_limit_bps));
        Self {
            api,
            store,
            config: Arc::new(config),
            limiter,
            bandwidth,
            progress: Arc::new(ProgressTracker::new()),
        }
    }

    /// The progress tracker; subscribe before starting a run to observe it.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.progress)
    }

    /// Starts a fresh session and runs it to a terminal or parked state.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError`] on infrastructure failure; item-level failures
    /// land in the summary instead.
    #[instrument(skip(self, dest, options, cancel), fields(root_id = %root_id))]
    pub async fn start_new(
        &self,
        root_id: &str,
        dest: &Path,
        options: SyncOptions,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let dest_str = dest.to_string_lossy();
        let session_id = self.store.create_session(root_id, &dest_str).await?;
        self.store
            .upsert_folder(session_id, root_id, None, "", 0)
            .await?;

        info!(session_id, root_id, dest = %dest_str, "session created");
        self.run_session(session_id, options, cancel).await
    }

    /// Resumes an interrupted session.
    ///
    /// Resuming a session already in a terminal state is a no-op that
    /// returns the stored summary immediately.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionNotFound`] for an unknown id, otherwise
    /// as [`start_new`](Self::start_new).
    #[instrument(skip(self, cancel))]
    pub async fn resume(
        &self,
        session_id: i64,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;

        if session.status().is_terminal() {
            debug!(session_id, status = %session.status(), "session already terminal, nothing to resume");
            return self.build_summary(session_id).await;
        }

        let (files, folders) = self.store.reclaim_orphans(session_id).await?;
        if files > 0 || folders > 0 {
            info!(session_id, files, folders, "reclaimed orphaned work");
        }
        self.progress.seed_from_session(&session);

        self.run_session(session_id, SyncOptions::default(), cancel)
            .await
    }

    /// Marks a resumable session as abandoned.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::SessionNotFound`] for an unknown id.
    #[instrument(skip(self))]
    pub async fn cancel_session(&self, session_id: i64) -> Result<(), SyncError> {
        self.store
            .get_session(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;
        self.store
            .set_session_status(session_id, SessionStatus::Cancelled)
            .await?;
        Ok(())
    }

    /// Runs an existing session to its end state.
    async fn run_session(
        &self,
        session_id: i64,
        options: SyncOptions,
        external_cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;
        let dest_root = PathBuf::from(&session.dest_path);
        let temp_dir = session_temp_dir(&dest_root, session_id);

        tokio::fs::create_dir_all(&dest_root)
            .await
            .map_err(|source| SyncError::Destination {
                path: dest_root.clone(),
                source,
            })?;
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .map_err(|source| SyncError::Destination {
                path: temp_dir.clone(),
                source,
            })?;

        self.store
            .set_session_status(session_id, SessionStatus::Active)
            .await?;
        self.progress.set_state(EngineState::Running);

        let cancel = external_cancel.child_token();
        let filter = Arc::new(PathFilter::new(
            &self.config.include_patterns,
            &self.config.exclude_patterns,
        )?);

        // Walkers (skipped entirely when the walk already finished)
        let walk_handle = if session.walk_done {
            tokio::spawn(async move { Ok::<(), WalkError>(()) })
        } else {
            self.spawn_walk(session_id, Arc::clone(&filter), cancel.clone())
        };

        // Download workers (none in a dry run)
        let mut workers: JoinSet<Result<(), WorkerError>> = JoinSet::new();
        if !options.dry_run {
            // One admission semaphore across the whole pool
            let remote_slots = Arc::new(Semaphore::new(self.config.max_remote_concurrent.max(1)));
            for _ in 0..self.config.workers.max(1) {
                let worker = Worker::new(
                    Arc::clone(&self.api),
                    self.store.clone(),
                    Arc::clone(&self.limiter),
                    Arc::clone(&self.bandwidth),
                    Arc::clone(&self.config),
                    Arc::clone(&self.progress),
                    Arc::clone(&remote_slots),
                );
                let dest_root = dest_root.clone();
                let temp_dir = temp_dir.clone();
                let cancel = cancel.clone();
                workers.spawn(async move {
                    worker.run(session_id, &dest_root, &temp_dir, cancel).await
                });
            }
        }

        let checkpoint_handle = self.spawn_checkpoint_loop(session_id, cancel.clone());
        let progress_handle = self.spawn_progress_loop(cancel.clone());

        // Supervise: collect worker exits, applying the shutdown grace once
        // cancellation is observed.
        let mut fatal: Option<String> = None;
        let mut storage_dead = false;
        let mut grace_armed = false;

        let grace = async {
            external_cancel.cancelled().await;
            tokio::time::sleep(SHUTDOWN_GRACE).await;
        };
        tokio::pin!(grace);

        loop {
            tokio::select! {
                joined = workers.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        warn!(error = %e, "worker reported fatal condition");
                        storage_dead |= matches!(
                            e,
                            WorkerError::StorageUnusable { .. } | WorkerError::State(_)
                        );
                        fatal.get_or_insert(e.to_string());
                        cancel.cancel();
                    }
                    Some(Err(e)) if e.is_cancelled() => {}
                    Some(Err(e)) => {
                        error!(error = %e, "worker task panicked");
                        fatal.get_or_insert(format!("worker task panicked: {e}"));
                        cancel.cancel();
                    }
                },
                () = &mut grace, if !grace_armed => {
                    grace_armed = true;
                    warn!("shutdown grace expired, aborting remaining workers");
                    workers.abort_all();
                }
            }
        }

        // The walk supervisor exits once its workers do (they observe the
        // same cancellation token).
        match walk_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                fatal.get_or_insert(e.to_string());
            }
            Err(e) => {
                fatal.get_or_insert(format!("walk supervisor panicked: {e}"));
            }
        }

        cancel.cancel();
        let _ = progress_handle.await;
        if let Ok(Err(e)) = checkpoint_handle.await {
            fatal.get_or_insert(format!("checkpoint loop failed: {e}"));
            storage_dead = true;
        }

        self.finish_session(
            session_id,
            &temp_dir,
            options,
            &external_cancel,
            fatal,
            storage_dead,
        )
        .await
    }

    /// Spawns walker workers plus a supervisor that marks `walk_done`.
    fn spawn_walk(
        &self,
        session_id: i64,
        filter: Arc<PathFilter>,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), WalkError>> {
        let mut walkers: JoinSet<Result<(), WalkError>> = JoinSet::new();
        for _ in 0..self.config.walker_workers.max(1) {
            let walker = Walker::new(
                Arc::clone(&self.api),
                self.store.clone(),
                Arc::clone(&self.limiter),
                Arc::clone(&filter),
                Arc::clone(&self.config),
                Arc::clone(&self.progress),
            );
            let cancel = cancel.clone();
            walkers.spawn(async move { walker.run(session_id, cancel).await });
        }

        let store = self.store.clone();
        tokio::spawn(async move {
            let mut result: Result<(), WalkError> = Ok(());
            while let Some(joined) = walkers.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        // A dead store ends the session; release the workers
                        cancel.cancel();
                        result = Err(e);
                    }
                    Err(e) => {
                        error!(error = %e, "walker task panicked");
                        cancel.cancel();
                        result = Err(WalkError::Internal(e.to_string()));
                    }
                }
            }

            if result.is_ok() && !cancel.is_cancelled() {
                let pending = store
                    .count_folders_by_status(session_id, FolderStatus::Pending)
                    .await?;
                let listing = store
                    .count_folders_by_status(session_id, FolderStatus::Listing)
                    .await?;
                if pending == 0 && listing == 0 {
                    store.mark_walk_done(session_id).await?;
                    info!(session_id, "walk complete");
                }
            }
            result
        })
    }

    /// Spawns the periodic checkpoint loop; one retry per tick, a second
    /// failure is fatal for the session.
    fn spawn_checkpoint_loop(
        &self,
        session_id: i64,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), StateError>> {
        let store = self.store.clone();
        let interval = self.config.checkpoint_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick is uninteresting

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(first) = store.checkpoint(session_id).await {
                            warn!(error = %first, "checkpoint failed, retrying once");
                            if let Err(second) = store.checkpoint(session_id).await {
                                error!(error = %second, "checkpoint failed twice, aborting session");
                                cancel.cancel();
                                return Err(second);
                            }
                        }
                        debug!(session_id, "checkpoint written");
                    }
                    () = cancel.cancelled() => return Ok(()),
                }
            }
        })
    }

    /// Spawns the speed sampler + snapshot publisher loop.
    fn spawn_progress_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let progress = Arc::clone(&self.progress);
        let publish_interval = self.config.progress_interval();
        tokio::spawn(async move {
            let mut sample = tokio::time::interval(SAMPLE_INTERVAL);
            let mut publish = tokio::time::interval(publish_interval);
            sample.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            publish.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = sample.tick() => progress.record_sample(),
                    _ = publish.tick() => progress.publish_snapshot(),
                    () = cancel.cancelled() => return,
                }
            }
        })
    }

    /// Decides the end state, persists it, and builds the summary.
    async fn finish_session(
        &self,
        session_id: i64,
        temp_dir: &Path,
        options: SyncOptions,
        external_cancel: &CancellationToken,
        fatal: Option<String>,
        storage_dead: bool,
    ) -> Result<SyncSummary, SyncError> {
        // Final counter flush; a dead store can't even report, so one retry
        // then surface the error.
        if let Err(first) = self.store.checkpoint(session_id).await {
            warn!(error = %first, "final checkpoint failed, retrying once");
            self.store.checkpoint(session_id).await?;
        }

        let root_failed = matches!(
            self.store.get_root_folder(session_id).await?,
            Some(folder) if folder.status() == FolderStatus::Failed
        );

        let (status, state) = if let Some(message) = fatal {
            self.store.record_session_error(session_id, &message).await?;
            if storage_dead {
                error!(session_id, %message, "session failed");
            }
            (SessionStatus::Failed, EngineState::Error)
        } else if root_failed {
            self.store
                .record_session_error(session_id, "root folder inaccessible")
                .await?;
            (SessionStatus::Failed, EngineState::Error)
        } else if external_cancel.is_cancelled() || options.dry_run {
            // Interrupted (or enumerate-only): park resumable
            (SessionStatus::Paused, EngineState::Paused)
        } else {
            (SessionStatus::Completed, EngineState::Completed)
        };

        self.store.set_session_status(session_id, status).await?;
        self.progress.set_state(state);
        self.progress.publish_snapshot();

        if status == SessionStatus::Completed {
            // Partial files can no longer exist; drop the whole temp tree
            let _ = tokio::fs::remove_dir_all(temp_dir).await;
        }

        info!(session_id, status = %status, "session finished");
        self.build_summary(session_id).await
    }

    /// Builds the caller-facing summary from the session row.
    async fn build_summary(&self, session_id: i64) -> Result<SyncSummary, SyncError> {
        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or(SyncError::SessionNotFound(session_id))?;

        let failed = self
            .store
            .list_failed_files(session_id, 200)
            .await?;

        let mut errors: Vec<ErrorSample> = Vec::new();
        for item in failed {
            let message = item.last_error.clone().unwrap_or_default();
            let kind = error_kind(&message);
            if errors.iter().filter(|e| e.kind == kind).count() < SUMMARY_ERRORS_PER_KIND {
                errors.push(ErrorSample {
                    kind,
                    path: item.rel_path,
                    message,
                });
            }
        }

        Ok(SyncSummary {
            session_id,
            status: session.status(),
            total_files: session.total_files,
            completed_files: session.completed_files,
            failed_files: session.failed_files,
            skipped_files: session.skipped_files,
            total_bytes: session.total_bytes,
            completed_bytes: session.completed_bytes,
            error_count: session.error_count,
            last_error: session.last_error,
            errors,
        })
    }
}

/// Coarse error kind from a recorded message, for summary grouping.
fn error_kind(message: &str) -> &'static str {
    if message.contains("HTTP 404") || message.contains("HTTP 410") {
        "not-found"
    } else if message.contains("HTTP 401") || message.contains("authentication") {
        "authentication"
    } else if message.contains("HTTP 403") {
        "authorization"
    } else if message.contains("integrity") {
        "integrity"
    } else if message.contains("timeout") || message.contains("network") {
        "transient"
    } else if message.contains("IO error") {
        "local-io"
    } else {
        "other"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        assert_eq!(error_kind("HTTP 404 during download of f1"), "not-found");
        assert_eq!(error_kind("HTTP 403 during download of f1"), "authorization");
        assert_eq!(error_kind("authentication failed during x: expired"), "authentication");
        assert_eq!(
            error_kind("integrity check failed for /tmp/x: expected a, got b"),
            "integrity"
        );
        assert_eq!(error_kind("timeout during download of f1"), "transient");
        assert_eq!(error_kind("IO error at /tmp/x: disk full"), "local-io");
        assert_eq!(error_kind("something else"), "other");
    }

    #[test]
    fn test_sync_options_default_is_real_run() {
        assert!(!SyncOptions::default().dry_run);
    }
}
