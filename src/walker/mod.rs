//! Breadth-first remote tree walker.
//!
//! Walker workers repeatedly claim a `pending` folder from the state store,
//! page through its children via the remote API, persist discovered folders
//! and files, and mark the folder `done`, strictly after all its children
//! are enqueued. Claiming is an atomic conditional update, so any number of
//! workers can walk concurrently; insertion order preserves BFS because
//! parents are always inserted before their children.
//!
//! The walker never holds the tree in memory: one listing page is the only
//! in-flight state, everything else is rows.

mod filter;

pub use filter::{FilterError, PathFilter};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ApiError, RemoteApi, RemoteItem};
use crate::config::SyncConfig;
use crate::limiter::RateLimiter;
use crate::paths::child_rel_path;
use crate::progress::ProgressTracker;
use crate::retry::{self, RetryDecision, RetryPolicy};
use crate::state::{Folder, NewFileItem, Store, WalkTotals};

/// Files are enqueued in batches of this size.
const ENQUEUE_BATCH: usize = 100;

/// Idle poll interval while other workers are still listing.
const IDLE_POLL: Duration = Duration::from_millis(200);

/// Prefix of Google-native mime-types that cannot be downloaded directly.
const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps.";

/// Walker errors that abort the whole walk (state-store failures only;
/// remote failures are folded into folder rows).
#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    /// The state store failed; the session cannot continue.
    #[error(transparent)]
    State(#[from] crate::state::StateError),

    /// A walker task died without completing its share of the walk.
    #[error("walker task failed: {0}")]
    Internal(String),
}

/// One walker worker over a shared capability bundle.
///
/// The engine spawns `walker_workers` clones of this; they coordinate
/// entirely through folder rows in the store.
#[derive(Clone)]
pub struct Walker {
    api: Arc<dyn RemoteApi>,
    store: Store,
    limiter: Arc<RateLimiter>,
    policy: RetryPolicy,
    filter: Arc<PathFilter>,
    config: Arc<SyncConfig>,
    progress: Arc<ProgressTracker>,
}

impl Walker {
    /// Creates a walker worker.
    #[must_use]
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: Store,
        limiter: Arc<RateLimiter>,
        filter: Arc<PathFilter>,
        config: Arc<SyncConfig>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        let policy = RetryPolicy::with_max_attempts(config.max_folder_attempts);
        Self {
            api,
            store,
            limiter,
            policy,
            filter,
            config,
            progress,
        }
    }

    /// Runs this worker until the walk is exhausted or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`WalkError::State`] on state-store failure; remote failures
    /// are recorded per folder and do not abort the walk.
    #[instrument(skip(self, cancel), fields(session_id))]
    pub async fn run(&self, session_id: i64, cancel: CancellationToken) -> Result<(), WalkError> {
        loop {
            if cancel.is_cancelled() {
                debug!("walker exiting on cancellation");
                return Ok(());
            }

            match self.store.claim_next_folder(session_id).await? {
                Some(folder) => {
                    self.process_folder(session_id, &folder, &cancel).await?;
                }
                None => {
                    // Another worker may still be listing a folder whose
                    // children will become pending; only a fully quiet tree
                    // ends the walk.
                    let listing = self
                        .store
                        .count_folders_by_status(session_id, crate::state::FolderStatus::Listing)
                        .await?;
                    if listing == 0 {
                        debug!("no pending or listing folders left, walker exiting");
                        return Ok(());
                    }
                    tokio::select! {
                        () = tokio::time::sleep(IDLE_POLL) => {}
                        () = cancel.cancelled() => return Ok(()),
                    }
                }
            }
        }
    }

    /// Lists one folder completely, enqueueing children, then marks it done.
    async fn process_folder(
        &self,
        session_id: i64,
        folder: &Folder,
        cancel: &CancellationToken,
    ) -> Result<(), WalkError> {
        debug!(folder = %folder.remote_id, path = %folder.rel_path, "listing folder");

        let mut page_token: Option<String> = None;
        let mut batch: Vec<NewFileItem> = Vec::new();
        let mut totals = WalkTotals::default();

        loop {
            let page = match self.list_page_with_retry(folder, page_token.as_deref(), cancel).await
            {
                Ok(Some(page)) => page,
                Ok(None) => {
                    // Retries exhausted or cancelled mid-backoff; the folder
                    // row already carries the outcome.
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            for item in page.items {
                self.handle_child(session_id, folder, item, &mut batch, cancel)
                    .await?;
                if batch.len() >= ENQUEUE_BATCH {
                    totals.add(self.store.enqueue_files(session_id, &batch).await?);
                    batch.clear();
                }
            }

            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        if !batch.is_empty() {
            totals.add(self.store.enqueue_files(session_id, &batch).await?);
        }

        // Children are durable; only now may the folder read as done.
        self.store.mark_folder_done(folder.id).await?;
        self.store.add_walk_totals(session_id, totals).await?;
        #[allow(clippy::cast_sign_loss)]
        self.progress
            .add_discovered(totals.files.max(0) as u64, totals.bytes.max(0) as u64);

        info!(
            folder = %folder.remote_id,
            files = totals.files,
            bytes = totals.bytes,
            skipped = totals.skipped,
            "folder listed"
        );
        Ok(())
    }

    /// Fetches one listing page, retrying transient failures with backoff.
    ///
    /// Returns `Ok(None)` when the folder was finalized as failed or the
    /// walk was cancelled mid-backoff.
    async fn list_page_with_retry(
        &self,
        folder: &Folder,
        page_token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Option<crate::api::FileList>, WalkError> {
        loop {
            if self.limiter.acquire(cancel).await.is_err() {
                return Ok(None);
            }

            match self.api.list_children(&folder.remote_id, page_token).await {
                Ok(page) => return Ok(Some(page)),
                Err(e) => {
                    let attempts = self
                        .store
                        .record_folder_attempt(folder.id, &e.to_string())
                        .await?;
                    let class = retry::classify(&e);
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let decision =
                        self.policy
                            .decide(class, attempts as u32, retry::retry_after_delay(&e));

                    match decision {
                        RetryDecision::Retry { delay, .. } => {
                            warn!(
                                folder = %folder.remote_id,
                                error = %e,
                                delay_ms = delay.as_millis(),
                                "listing failed, will retry"
                            );
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = cancel.cancelled() => return Ok(None),
                            }
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(
                                folder = %folder.remote_id,
                                error = %e,
                                %reason,
                                "listing failed permanently, pruning subtree"
                            );
                            self.store.fail_folder(folder.id, &e.to_string()).await?;
                            self.store
                                .record_session_error(
                                    folder.session_id,
                                    &format!("folder {} failed: {e}", folder.rel_path),
                                )
                                .await?;
                            return Ok(None);
                        }
                    }
                }
            }
        }
    }

    /// Routes one listed child: subfolder, shortcut, or file.
    async fn handle_child(
        &self,
        session_id: i64,
        parent: &Folder,
        item: RemoteItem,
        batch: &mut Vec<NewFileItem>,
        cancel: &CancellationToken,
    ) -> Result<(), WalkError> {
        let rel_path = child_rel_path(&parent.rel_path, &item.name);
        let child_depth = parent.depth + 1;

        if item.is_folder() {
            if self.depth_allowed(child_depth) {
                self.store
                    .upsert_folder(
                        session_id,
                        &item.id,
                        Some(&parent.remote_id),
                        &rel_path,
                        child_depth,
                    )
                    .await?;
            } else {
                debug!(path = %rel_path, depth = child_depth, "folder beyond max depth, not traversed");
            }
            return Ok(());
        }

        if item.is_shortcut() {
            self.handle_shortcut(session_id, parent, &item, rel_path, child_depth, batch, cancel)
                .await?;
            return Ok(());
        }

        batch.push(self.build_file_item(&item, rel_path, Some(parent.remote_id.clone())));
        Ok(())
    }

    /// Follows (or records) a shortcut child.
    #[allow(clippy::too_many_arguments)]
    async fn handle_shortcut(
        &self,
        session_id: i64,
        parent: &Folder,
        item: &RemoteItem,
        rel_path: String,
        child_depth: i64,
        batch: &mut Vec<NewFileItem>,
        cancel: &CancellationToken,
    ) -> Result<(), WalkError> {
        if !self.config.follow_shortcuts {
            batch.push(skipped_item(item, rel_path, "shortcut not followed"));
            return Ok(());
        }

        let Some(target_id) = item.shortcut_target.clone() else {
            batch.push(skipped_item(item, rel_path, "shortcut has no target"));
            return Ok(());
        };

        // A shortcut to a folder expands under the shortcut's own path; the
        // unique (session_id, remote_id) constraint on the target id bounds
        // the traversal and breaks shortcut cycles.
        if item.shortcut_target_mime.as_deref() == Some(crate::api::FOLDER_MIME_TYPE) {
            if self.depth_allowed(child_depth) {
                self.store
                    .upsert_folder(
                        session_id,
                        &target_id,
                        Some(&parent.remote_id),
                        &rel_path,
                        child_depth,
                    )
                    .await?;
            }
            return Ok(());
        }

        // File shortcut: the target's metadata carries size and checksum.
        match self.resolve_target(&target_id, cancel).await {
            Some(target) => {
                let mut file = self.build_file_item(&target, rel_path, Some(parent.remote_id.clone()));
                // Keep the shortcut's display name, target's content identity
                file.remote_id = target.id;
                batch.push(file);
            }
            None => {
                batch.push(skipped_item(item, rel_path, "shortcut target unresolvable"));
            }
        }
        Ok(())
    }

    /// Resolves a shortcut target's metadata with in-memory retries.
    async fn resolve_target(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Option<RemoteItem> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            if self.limiter.acquire(cancel).await.is_err() {
                return None;
            }
            match self.api.get_metadata(target_id).await {
                Ok(item) => return Some(item),
                Err(e) => {
                    let class = retry::classify(&e);
                    match self
                        .policy
                        .decide(class, attempt, retry::retry_after_delay(&e))
                    {
                        RetryDecision::Retry { delay, .. } => {
                            tokio::select! {
                                () = tokio::time::sleep(delay) => {}
                                () = cancel.cancelled() => return None,
                            }
                        }
                        RetryDecision::DoNotRetry { .. } => {
                            debug!(target = %target_id, error = %e, "shortcut target unresolvable");
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Builds the persisted form of a downloadable (or skipped) file.
    #[allow(clippy::cast_possible_wrap)]
    fn build_file_item(
        &self,
        item: &RemoteItem,
        rel_path: String,
        parent_remote_id: Option<String>,
    ) -> NewFileItem {
        let export_mime = self
            .config
            .export_target(&item.mime_type)
            .map(ToString::to_string);

        // Native documents without an export mapping cannot be fetched at all
        let skip_reason = if item.mime_type.starts_with(NATIVE_MIME_PREFIX) && export_mime.is_none()
        {
            Some(format!("no export mapping for {}", item.mime_type))
        } else {
            self.filter.skip_reason(&rel_path)
        };

        NewFileItem {
            remote_id: item.id.clone(),
            parent_remote_id,
            rel_path,
            size: item.size.map(|s| s as i64),
            checksum: item.md5_checksum.clone(),
            mime_type: item.mime_type.clone(),
            export_mime,
            modified_at: item.modified_time.clone(),
            skip_reason,
        }
    }

    fn depth_allowed(&self, depth: i64) -> bool {
        self.config.max_depth < 0 || depth <= self.config.max_depth
    }
}

/// A file row recording why an item was not enqueued for download.
#[allow(clippy::cast_possible_wrap)]
fn skipped_item(item: &RemoteItem, rel_path: String, reason: &str) -> NewFileItem {
    NewFileItem {
        remote_id: item.id.clone(),
        parent_remote_id: None,
        rel_path,
        size: item.size.map(|s| s as i64),
        checksum: item.md5_checksum.clone(),
        mime_type: item.mime_type.clone(),
        export_mime: None,
        modified_at: item.modified_time.clone(),
        skip_reason: Some(reason.to_string()),
    }
}
