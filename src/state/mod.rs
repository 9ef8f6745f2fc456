//! Durable sync state: sessions, folders, and file items in SQLite.
//!
//! The store is the single source of truth and the only handoff between the
//! walker and the download workers; no in-memory queue crosses that
//! boundary, which is what makes resume and backpressure simple. All
//! multi-row updates are transactional; claims are single atomic
//! `UPDATE ... RETURNING` statements so at most one worker ever holds an
//! item, across tasks and across process restarts.
//!
//! # Example
//!
//! ```ignore
//! use cloudpull_core::state::Store;
//! use cloudpull_core::Database;
//!
//! let store = Store::new(Database::open(path).await?);
//! let session_id = store.create_session("root-id", "/tmp/sync").await?;
//! if let Some(item) = store.claim_next_file(session_id).await? {
//!     // ... download the item ...
//!     store.complete_file(item.id, 1024).await?;
//! }
//! ```

mod error;
mod types;

pub use error::StateError;
pub use types::{
    FileItem, FileStatus, Folder, FolderStatus, NewFileItem, Session, SessionStatus,
};

use sqlx::Row;
use tracing::{debug, instrument};

use crate::db::Database;

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StateError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StateError::NotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StateError::NotFound(id))
    } else {
        Ok(())
    }
}

/// Totals accumulated while walking one folder, applied to the session row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkTotals {
    /// Newly enqueued downloadable files.
    pub files: i64,
    /// Bytes of the newly enqueued files with known sizes.
    pub bytes: i64,
    /// Newly recorded skipped files.
    pub skipped: i64,
}

impl WalkTotals {
    /// Accumulates another batch.
    pub fn add(&mut self, other: WalkTotals) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.skipped += other.skipped;
    }
}

/// Transactional state store over the embedded database.
#[derive(Debug, Clone)]
pub struct Store {
    db: Database,
}

impl Store {
    /// Creates a store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // ==================== Sessions ====================

    /// Creates a new active session and returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the insert fails.
    #[instrument(skip(self), fields(root_id = %root_id, dest = %dest_path))]
    pub async fn create_session(&self, root_id: &str, dest_path: &str) -> Result<i64> {
        let result = sqlx::query(
            r"INSERT INTO sessions (root_folder_id, dest_path, status)
              VALUES (?, ?, ?)
              RETURNING id",
        )
        .bind(root_id)
        .bind(dest_path)
        .bind(SessionStatus::Active.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("id"))
    }

    /// Gets a session by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_session(&self, id: i64) -> Result<Option<Session>> {
        let session = sqlx::query_as::<_, Session>(r"SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(session)
    }

    /// Lists all sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(r"SELECT * FROM sessions ORDER BY id DESC")
            .fetch_all(self.db.pool())
            .await?;

        Ok(sessions)
    }

    /// Lists sessions that can be resumed (active or paused).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_resumable_sessions(&self) -> Result<Vec<Session>> {
        let sessions = sqlx::query_as::<_, Session>(
            r"SELECT * FROM sessions WHERE status IN (?, ?) ORDER BY id DESC",
        )
        .bind(SessionStatus::Active.as_str())
        .bind(SessionStatus::Paused.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(sessions)
    }

    /// Transitions a session's status.
    ///
    /// Terminal statuses are permanent: a session already in one is left
    /// untouched and `Ok(false)` is returned. Entering a terminal status
    /// stamps `ended_at`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn set_session_status(&self, id: i64, status: SessionStatus) -> Result<bool> {
        let ended = status.is_terminal();
        let result = sqlx::query(
            r"UPDATE sessions
              SET status = ?,
                  ended_at = CASE WHEN ? THEN datetime('now') ELSE ended_at END
              WHERE id = ? AND status NOT IN (?, ?, ?)",
        )
        .bind(status.as_str())
        .bind(ended)
        .bind(id)
        .bind(SessionStatus::Completed.as_str())
        .bind(SessionStatus::Failed.as_str())
        .bind(SessionStatus::Cancelled.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a non-fatal session error and returns the new error count.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the session does not exist.
    #[instrument(skip(self, message))]
    pub async fn record_session_error(&self, id: i64, message: &str) -> Result<i64> {
        let row = sqlx::query(
            r"UPDATE sessions
              SET error_count = error_count + 1, last_error = ?
              WHERE id = ?
              RETURNING error_count",
        )
        .bind(message)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| r.get("error_count"))
            .ok_or(StateError::NotFound(id))
    }

    /// Adds walk-discovered totals to the session counters.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the session does not exist.
    #[instrument(skip(self))]
    pub async fn add_walk_totals(&self, id: i64, totals: WalkTotals) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions
              SET total_files = total_files + ?,
                  total_bytes = total_bytes + ?,
                  skipped_files = skipped_files + ?
              WHERE id = ?",
        )
        .bind(totals.files)
        .bind(totals.bytes)
        .bind(totals.skipped)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Marks the session's walk as complete; totals are final from here on.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the session does not exist.
    #[instrument(skip(self))]
    pub async fn mark_walk_done(&self, id: i64) -> Result<()> {
        let result = sqlx::query(r"UPDATE sessions SET walk_done = 1 WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;

        check_affected(id, result.rows_affected())
    }

    /// Checkpoints a session: recomputes counters from the file rows and
    /// stamps `checkpoint_at`, in one atomic statement.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if the session does not exist.
    #[instrument(skip(self))]
    pub async fn checkpoint(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE sessions SET
                completed_files = (SELECT COUNT(*) FROM files
                                   WHERE session_id = sessions.id AND status = 'completed'),
                failed_files    = (SELECT COUNT(*) FROM files
                                   WHERE session_id = sessions.id AND status = 'failed'),
                skipped_files   = (SELECT COUNT(*) FROM files
                                   WHERE session_id = sessions.id AND status = 'skipped'),
                completed_bytes = (SELECT COALESCE(SUM(size), 0) FROM files
                                   WHERE session_id = sessions.id AND status = 'completed'),
                checkpoint_at   = datetime('now')
              WHERE id = ?",
        )
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Reverts rows abandoned by a dead process: `in_progress` files and
    /// `listing` folders go back to `pending`, attempt counts preserved.
    ///
    /// Returns `(files_reclaimed, folders_reclaimed)`. After this, no row of
    /// the session is `in_progress` or `listing`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if either update fails.
    #[instrument(skip(self))]
    pub async fn reclaim_orphans(&self, session_id: i64) -> Result<(u64, u64)> {
        let files = sqlx::query(
            r"UPDATE files SET status = ?, updated_at = datetime('now')
              WHERE session_id = ? AND status = ?",
        )
        .bind(FileStatus::Pending.as_str())
        .bind(session_id)
        .bind(FileStatus::InProgress.as_str())
        .execute(self.db.pool())
        .await?;

        let folders = sqlx::query(
            r"UPDATE folders SET status = ?, updated_at = datetime('now')
              WHERE session_id = ? AND status = ?",
        )
        .bind(FolderStatus::Pending.as_str())
        .bind(session_id)
        .bind(FolderStatus::Listing.as_str())
        .execute(self.db.pool())
        .await?;

        debug!(
            files = files.rows_affected(),
            folders = folders.rows_affected(),
            "reclaimed orphaned rows"
        );

        Ok((files.rows_affected(), folders.rows_affected()))
    }

    // ==================== Folders ====================

    /// Inserts a folder if it is not already known to the session.
    ///
    /// Idempotent on `(session_id, remote_id)`; returns whether a row was
    /// inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the insert fails.
    #[instrument(skip(self), fields(remote_id = %remote_id, rel_path = %rel_path))]
    pub async fn upsert_folder(
        &self,
        session_id: i64,
        remote_id: &str,
        parent_remote_id: Option<&str>,
        rel_path: &str,
        depth: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"INSERT INTO folders (session_id, remote_id, parent_remote_id, rel_path, depth, status)
              VALUES (?, ?, ?, ?, ?, ?)
              ON CONFLICT (session_id, remote_id) DO NOTHING",
        )
        .bind(session_id)
        .bind(remote_id)
        .bind(parent_remote_id)
        .bind(rel_path)
        .bind(depth)
        .bind(FolderStatus::Pending.as_str())
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Atomically claims the next pending folder for listing.
    ///
    /// Insertion order determines walk order, which preserves BFS because
    /// parents are always inserted before their children.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next_folder(&self, session_id: i64) -> Result<Option<Folder>> {
        // Atomic UPDATE...RETURNING ensures no race between select and update
        let folder = sqlx::query_as::<_, Folder>(
            r"UPDATE folders
              SET status = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM folders
                  WHERE session_id = ? AND status = ?
                  ORDER BY id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(FolderStatus::Listing.as_str())
        .bind(session_id)
        .bind(FolderStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(folder)
    }

    /// Marks a folder's listing as complete.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no folder exists with the id.
    #[instrument(skip(self))]
    pub async fn mark_folder_done(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE folders SET status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(FolderStatus::Done.as_str())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Records a failed listing attempt; returns the new attempt count.
    ///
    /// The folder stays in its current status; the walker either retries
    /// in-process or finalizes with [`fail_folder`](Self::fail_folder).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no folder exists with the id.
    #[instrument(skip(self, error))]
    pub async fn record_folder_attempt(&self, id: i64, error: &str) -> Result<i64> {
        let row = sqlx::query(
            r"UPDATE folders
              SET attempts = attempts + 1, last_error = ?, updated_at = datetime('now')
              WHERE id = ?
              RETURNING attempts",
        )
        .bind(error)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| r.get("attempts"))
            .ok_or(StateError::NotFound(id))
    }

    /// Marks a folder failed; its subtree is not expanded.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no folder exists with the id.
    #[instrument(skip(self, error))]
    pub async fn fail_folder(&self, id: i64, error: &str) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE folders
              SET status = ?, last_error = ?, updated_at = datetime('now')
              WHERE id = ?",
        )
        .bind(FolderStatus::Failed.as_str())
        .bind(error)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Counts folders in a status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_folders_by_status(
        &self,
        session_id: i64,
        status: FolderStatus,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"SELECT COUNT(*) as count FROM folders WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(status.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("count"))
    }

    /// The session's root folder row (the one without a parent).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_root_folder(&self, session_id: i64) -> Result<Option<Folder>> {
        let folder = sqlx::query_as::<_, Folder>(
            r"SELECT * FROM folders
              WHERE session_id = ? AND parent_remote_id IS NULL
              ORDER BY id ASC LIMIT 1",
        )
        .bind(session_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(folder)
    }

    // ==================== File items ====================

    /// Enqueues a batch of discovered files in one transaction.
    ///
    /// Duplicates (same `(session_id, remote_id)`) are ignored. Items with a
    /// `skip_reason` are inserted as `skipped`. Returns the totals actually
    /// inserted, ready for [`add_walk_totals`](Self::add_walk_totals).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the transaction fails.
    #[instrument(skip(self, items), fields(batch = items.len()))]
    pub async fn enqueue_files(
        &self,
        session_id: i64,
        items: &[NewFileItem],
    ) -> Result<WalkTotals> {
        let mut totals = WalkTotals::default();
        let mut tx = self.db.pool().begin().await?;

        for item in items {
            let (status, last_error) = match &item.skip_reason {
                Some(reason) => (FileStatus::Skipped, Some(reason.as_str())),
                None => (FileStatus::Pending, None),
            };

            let result = sqlx::query(
                r"INSERT INTO files (
                    session_id, remote_id, parent_remote_id, rel_path, size, checksum,
                    mime_type, export_mime, modified_at, status, last_error, priority
                  )
                  VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                  ON CONFLICT (session_id, remote_id) DO NOTHING",
            )
            .bind(session_id)
            .bind(&item.remote_id)
            .bind(item.parent_remote_id.as_deref())
            .bind(&item.rel_path)
            .bind(item.size)
            .bind(item.checksum.as_deref())
            .bind(&item.mime_type)
            .bind(item.export_mime.as_deref())
            .bind(item.modified_at.as_deref())
            .bind(status.as_str())
            .bind(last_error)
            .bind(item.priority())
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() > 0 {
                if status == FileStatus::Skipped {
                    totals.skipped += 1;
                } else {
                    totals.files += 1;
                    totals.bytes += item.size.unwrap_or(0);
                }
            }
        }

        tx.commit().await?;
        Ok(totals)
    }

    /// Atomically claims the next pending file for download.
    ///
    /// Selection is smallest-first (materialized `priority`), ties broken by
    /// insertion order. The `UPDATE ... RETURNING` form guarantees at most
    /// one claimant per item across tasks and process restarts.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn claim_next_file(&self, session_id: i64) -> Result<Option<FileItem>> {
        let item = sqlx::query_as::<_, FileItem>(
            r"UPDATE files
              SET status = ?, updated_at = datetime('now')
              WHERE id = (
                  SELECT id FROM files
                  WHERE session_id = ? AND status = ?
                  ORDER BY priority ASC, id ASC
                  LIMIT 1
              )
              RETURNING *",
        )
        .bind(FileStatus::InProgress.as_str())
        .bind(session_id)
        .bind(FileStatus::Pending.as_str())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(item)
    }

    /// Records durable download progress for an item.
    ///
    /// Progress is monotonic: the write is conditioned on strictly
    /// increasing `bytes_downloaded`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NonMonotonicProgress`] if the offset does not
    /// increase, [`StateError::Database`] if the update fails.
    #[instrument(skip(self))]
    pub async fn update_file_progress(&self, id: i64, bytes_downloaded: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files
              SET bytes_downloaded = ?1, updated_at = datetime('now')
              WHERE id = ?2 AND bytes_downloaded < ?1",
        )
        .bind(bytes_downloaded)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(StateError::NonMonotonicProgress {
                id,
                bytes: bytes_downloaded,
            });
        }
        Ok(())
    }

    /// Completes a file item and rolls its bytes into the session counters,
    /// in one transaction.
    ///
    /// For items whose size was unknown at walk time (native documents), the
    /// final byte count becomes the size and is contributed to the session's
    /// `total_bytes` now.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no item exists with the id.
    #[instrument(skip(self))]
    pub async fn complete_file(&self, id: i64, final_bytes: i64) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;

        // Size must be read before the update coalesces it, to know whether
        // this item's bytes still owe a contribution to total_bytes.
        let row = sqlx::query(r"SELECT session_id, size FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StateError::NotFound(id))?;

        let session_id: i64 = row.get("session_id");
        let size_was_unknown = row.get::<Option<i64>, _>("size").is_none();

        sqlx::query(
            r"UPDATE files
              SET status = ?1, bytes_downloaded = ?2, size = COALESCE(size, ?2),
                  updated_at = datetime('now')
              WHERE id = ?3",
        )
        .bind(FileStatus::Completed.as_str())
        .bind(final_bytes)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r"UPDATE sessions
              SET completed_files = completed_files + 1,
                  completed_bytes = completed_bytes + ?1,
                  total_bytes = total_bytes + CASE WHEN ?2 THEN ?1 ELSE 0 END
              WHERE id = ?3",
        )
        .bind(final_bytes)
        .bind(size_was_unknown)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Records a failed download attempt; returns the new attempt count.
    ///
    /// The item stays `in_progress`; the worker retries the same item from
    /// its current offset or finalizes with [`fail_file`](Self::fail_file).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no item exists with the id.
    #[instrument(skip(self, error))]
    pub async fn record_file_attempt(&self, id: i64, error: &str) -> Result<i64> {
        let row = sqlx::query(
            r"UPDATE files
              SET attempts = attempts + 1, last_error = ?, updated_at = datetime('now')
              WHERE id = ?
              RETURNING attempts",
        )
        .bind(error)
        .bind(id)
        .fetch_optional(self.db.pool())
        .await?;

        row.map(|r| r.get("attempts"))
            .ok_or(StateError::NotFound(id))
    }

    /// Marks an item failed and bumps the session's failure counters, in one
    /// transaction. Returns the session's new error count so the caller can
    /// check the fatal threshold.
    ///
    /// Attempts are not touched here; each one was already counted by
    /// [`record_file_attempt`](Self::record_file_attempt).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no item exists with the id.
    #[instrument(skip(self, error))]
    pub async fn fail_file(&self, id: i64, error: &str) -> Result<i64> {
        let mut tx = self.db.pool().begin().await?;

        let row = sqlx::query(
            r"UPDATE files
              SET status = ?, last_error = ?,
                  updated_at = datetime('now')
              WHERE id = ?
              RETURNING session_id",
        )
        .bind(FileStatus::Failed.as_str())
        .bind(error)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StateError::NotFound(id))?;

        let session_id: i64 = row.get("session_id");

        let counts = sqlx::query(
            r"UPDATE sessions
              SET failed_files = failed_files + 1,
                  error_count = error_count + 1,
                  last_error = ?
              WHERE id = ?
              RETURNING error_count",
        )
        .bind(error)
        .bind(session_id)
        .fetch_one(&mut *tx)
        .await?;

        let error_count: i64 = counts.get("error_count");
        tx.commit().await?;
        Ok(error_count)
    }

    /// Returns an item to pending for a later retry (e.g. after a transient
    /// failure the worker does not want to hold the slot for).
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no item exists with the id.
    #[instrument(skip(self))]
    pub async fn requeue_file(&self, id: i64) -> Result<()> {
        let result = sqlx::query(
            r"UPDATE files SET status = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(FileStatus::Pending.as_str())
        .bind(id)
        .execute(self.db.pool())
        .await?;

        check_affected(id, result.rows_affected())
    }

    /// Gets a file item by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn get_file(&self, id: i64) -> Result<Option<FileItem>> {
        let item = sqlx::query_as::<_, FileItem>(r"SELECT * FROM files WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(item)
    }

    /// Counts file items in a status.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn count_files_by_status(
        &self,
        session_id: i64,
        status: FileStatus,
    ) -> Result<i64> {
        let result = sqlx::query(
            r"SELECT COUNT(*) as count FROM files WHERE session_id = ? AND status = ?",
        )
        .bind(session_id)
        .bind(status.as_str())
        .fetch_one(self.db.pool())
        .await?;

        Ok(result.get("count"))
    }

    /// Lists file items in a status, claim order.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_files_by_status(
        &self,
        session_id: i64,
        status: FileStatus,
    ) -> Result<Vec<FileItem>> {
        let items = sqlx::query_as::<_, FileItem>(
            r"SELECT * FROM files WHERE session_id = ? AND status = ?
              ORDER BY priority ASC, id ASC",
        )
        .bind(session_id)
        .bind(status.as_str())
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }

    /// Lists the first `limit` failed items, oldest first, for the session
    /// summary.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_failed_files(&self, session_id: i64, limit: i64) -> Result<Vec<FileItem>> {
        let items = sqlx::query_as::<_, FileItem>(
            r"SELECT * FROM files WHERE session_id = ? AND status = ?
              ORDER BY updated_at ASC, id ASC LIMIT ?",
        )
        .bind(session_id)
        .bind(FileStatus::Failed.as_str())
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        Ok(items)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn new_item(remote_id: &str, rel_path: &str, size: Option<i64>) -> NewFileItem {
        NewFileItem {
            remote_id: remote_id.to_string(),
            parent_remote_id: Some("root".to_string()),
            rel_path: rel_path.to_string(),
            size,
            checksum: None,
            mime_type: "application/octet-stream".to_string(),
            export_mime: None,
            modified_at: None,
            skip_reason: None,
        }
    }

    async fn store_with_session() -> (Store, i64) {
        let db = Database::new_in_memory().await.unwrap();
        let store = Store::new(db);
        let session_id = store.create_session("root", "/tmp/sync").await.unwrap();
        (store, session_id)
    }

    // ==================== Session Tests ====================

    #[tokio::test]
    async fn test_create_and_get_session() {
        let (store, session_id) = store_with_session().await;

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.root_folder_id, "root");
        assert_eq!(session.dest_path, "/tmp/sync");
        assert_eq!(session.status(), SessionStatus::Active);
        assert!(!session.walk_done);
        assert_eq!(session.total_files, 0);
    }

    #[tokio::test]
    async fn test_terminal_status_is_permanent() {
        let (store, session_id) = store_with_session().await;

        assert!(
            store
                .set_session_status(session_id, SessionStatus::Completed)
                .await
                .unwrap()
        );
        // A terminal session cannot move again
        assert!(
            !store
                .set_session_status(session_id, SessionStatus::Active)
                .await
                .unwrap()
        );

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.status(), SessionStatus::Completed);
        assert!(session.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_active_paused_flip_flops() {
        let (store, session_id) = store_with_session().await;

        assert!(
            store
                .set_session_status(session_id, SessionStatus::Paused)
                .await
                .unwrap()
        );
        assert!(
            store
                .set_session_status(session_id, SessionStatus::Active)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_list_resumable_sessions() {
        let db = Database::new_in_memory().await.unwrap();
        let store = Store::new(db);

        let active = store.create_session("r1", "/a").await.unwrap();
        let paused = store.create_session("r2", "/b").await.unwrap();
        let done = store.create_session("r3", "/c").await.unwrap();
        store
            .set_session_status(paused, SessionStatus::Paused)
            .await
            .unwrap();
        store
            .set_session_status(done, SessionStatus::Completed)
            .await
            .unwrap();

        let resumable = store.list_resumable_sessions().await.unwrap();
        let ids: Vec<i64> = resumable.iter().map(|s| s.id).collect();
        assert!(ids.contains(&active));
        assert!(ids.contains(&paused));
        assert!(!ids.contains(&done));
    }

    #[tokio::test]
    async fn test_record_session_error_increments() {
        let (store, session_id) = store_with_session().await;

        assert_eq!(
            store
                .record_session_error(session_id, "boom")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .record_session_error(session_id, "boom again")
                .await
                .unwrap(),
            2
        );

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.last_error.as_deref(), Some("boom again"));
    }

    // ==================== Folder Tests ====================

    #[tokio::test]
    async fn test_upsert_folder_idempotent() {
        let (store, session_id) = store_with_session().await;

        assert!(
            store
                .upsert_folder(session_id, "d1", Some("root"), "d1", 1)
                .await
                .unwrap()
        );
        assert!(
            !store
                .upsert_folder(session_id, "d1", Some("root"), "d1", 1)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_claim_folder_transitions_to_listing() {
        let (store, session_id) = store_with_session().await;
        store
            .upsert_folder(session_id, "root", None, "", 0)
            .await
            .unwrap();

        let folder = store.claim_next_folder(session_id).await.unwrap().unwrap();
        assert_eq!(folder.remote_id, "root");
        assert_eq!(folder.status(), FolderStatus::Listing);

        // Nothing else pending
        assert!(store.claim_next_folder(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_folder_insertion_order() {
        let (store, session_id) = store_with_session().await;
        store
            .upsert_folder(session_id, "a", None, "a", 1)
            .await
            .unwrap();
        store
            .upsert_folder(session_id, "b", None, "b", 1)
            .await
            .unwrap();

        let first = store.claim_next_folder(session_id).await.unwrap().unwrap();
        let second = store.claim_next_folder(session_id).await.unwrap().unwrap();
        assert_eq!(first.remote_id, "a");
        assert_eq!(second.remote_id, "b");
    }

    #[tokio::test]
    async fn test_folder_attempt_and_fail() {
        let (store, session_id) = store_with_session().await;
        store
            .upsert_folder(session_id, "root", None, "", 0)
            .await
            .unwrap();
        let folder = store.claim_next_folder(session_id).await.unwrap().unwrap();

        assert_eq!(
            store
                .record_folder_attempt(folder.id, "HTTP 503")
                .await
                .unwrap(),
            1
        );
        assert_eq!(
            store
                .record_folder_attempt(folder.id, "HTTP 503")
                .await
                .unwrap(),
            2
        );

        store.fail_folder(folder.id, "HTTP 503").await.unwrap();
        assert_eq!(
            store
                .count_folders_by_status(session_id, FolderStatus::Failed)
                .await
                .unwrap(),
            1
        );
    }

    // ==================== File Tests ====================

    #[tokio::test]
    async fn test_enqueue_files_returns_totals_and_ignores_duplicates() {
        let (store, session_id) = store_with_session().await;

        let batch = vec![
            new_item("f1", "f1.bin", Some(1024)),
            new_item("f2", "f2.bin", Some(2048)),
        ];
        let totals = store.enqueue_files(session_id, &batch).await.unwrap();
        assert_eq!(totals.files, 2);
        assert_eq!(totals.bytes, 3072);
        assert_eq!(totals.skipped, 0);

        // Re-enqueueing the same remote ids inserts nothing
        let totals = store.enqueue_files(session_id, &batch).await.unwrap();
        assert_eq!(totals, WalkTotals::default());
    }

    #[tokio::test]
    async fn test_enqueue_skipped_item() {
        let (store, session_id) = store_with_session().await;

        let mut item = new_item("f1", "f1.tmp", Some(10));
        item.skip_reason = Some("excluded by pattern *.tmp".to_string());
        let totals = store.enqueue_files(session_id, &[item]).await.unwrap();
        assert_eq!(totals.files, 0);
        assert_eq!(totals.skipped, 1);

        assert_eq!(
            store
                .count_files_by_status(session_id, FileStatus::Skipped)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_claim_smallest_first_with_insertion_tiebreak() {
        let (store, session_id) = store_with_session().await;

        let batch = vec![
            new_item("big", "big.bin", Some(100 * 1024 * 1024)),
            new_item("small", "small.bin", Some(1024)),
            new_item("mid", "mid.bin", Some(10 * 1024 * 1024)),
            new_item("unknown", "doc", None),
        ];
        store.enqueue_files(session_id, &batch).await.unwrap();

        let order: Vec<String> = [
            store.claim_next_file(session_id).await.unwrap().unwrap(),
            store.claim_next_file(session_id).await.unwrap().unwrap(),
            store.claim_next_file(session_id).await.unwrap().unwrap(),
            store.claim_next_file(session_id).await.unwrap().unwrap(),
        ]
        .into_iter()
        .map(|i| i.remote_id)
        .collect();

        assert_eq!(order, ["small", "mid", "big", "unknown"]);
        assert!(store.claim_next_file(session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(10))])
            .await
            .unwrap();

        let first = store.claim_next_file(session_id).await.unwrap();
        let second = store.claim_next_file(session_id).await.unwrap();

        assert!(first.is_some());
        assert!(second.is_none(), "an in-progress item must not be claimable");
    }

    #[tokio::test]
    async fn test_contending_claims_get_distinct_items() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(
                session_id,
                &[
                    new_item("f1", "f1.bin", Some(10)),
                    new_item("f2", "f2.bin", Some(10)),
                ],
            )
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            store.claim_next_file(session_id),
            store.claim_next_file(session_id)
        );
        let a = a.unwrap().unwrap();
        let b = b.unwrap().unwrap();
        assert_ne!(a.id, b.id, "two claimants must never share an item");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(100))])
            .await
            .unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();

        store.update_file_progress(item.id, 10).await.unwrap();
        store.update_file_progress(item.id, 50).await.unwrap();

        // Equal and lower offsets are rejected
        assert!(matches!(
            store.update_file_progress(item.id, 50).await,
            Err(StateError::NonMonotonicProgress { .. })
        ));
        assert!(matches!(
            store.update_file_progress(item.id, 20).await,
            Err(StateError::NonMonotonicProgress { .. })
        ));

        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.bytes_downloaded, 50);
    }

    #[tokio::test]
    async fn test_complete_file_updates_session_counters() {
        let (store, session_id) = store_with_session().await;
        let totals = store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(1024))])
            .await
            .unwrap();
        store.add_walk_totals(session_id, totals).await.unwrap();

        let item = store.claim_next_file(session_id).await.unwrap().unwrap();
        store.complete_file(item.id, 1024).await.unwrap();

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.completed_files, 1);
        assert_eq!(session.completed_bytes, 1024);
        assert_eq!(session.total_bytes, 1024);

        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.status(), FileStatus::Completed);
        assert_eq!(item.bytes_downloaded, 1024);
    }

    #[tokio::test]
    async fn test_complete_unknown_size_contributes_bytes_lazily() {
        let (store, session_id) = store_with_session().await;
        let totals = store
            .enqueue_files(session_id, &[new_item("doc1", "doc1.docx", None)])
            .await
            .unwrap();
        assert_eq!(totals.bytes, 0);
        store.add_walk_totals(session_id, totals).await.unwrap();

        let item = store.claim_next_file(session_id).await.unwrap().unwrap();
        store.complete_file(item.id, 4096).await.unwrap();

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.total_bytes, 4096, "export size lands after transfer");
        assert_eq!(session.completed_bytes, 4096);

        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.size, Some(4096));
    }

    #[tokio::test]
    async fn test_fail_file_returns_error_count() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(10))])
            .await
            .unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();

        let count = store.fail_file(item.id, "HTTP 404").await.unwrap();
        assert_eq!(count, 1);

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.failed_files, 1);
        assert_eq!(session.last_error.as_deref(), Some("HTTP 404"));

        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.status(), FileStatus::Failed);
        assert_eq!(item.attempts, 0, "attempts are counted per recorded attempt");
    }

    #[tokio::test]
    async fn test_record_file_attempt_preserves_status() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(10))])
            .await
            .unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();

        assert_eq!(
            store
                .record_file_attempt(item.id, "HTTP 503")
                .await
                .unwrap(),
            1
        );

        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.status(), FileStatus::InProgress);
    }

    #[tokio::test]
    async fn test_reclaim_orphans_reverts_claims() {
        let (store, session_id) = store_with_session().await;
        store
            .upsert_folder(session_id, "root", None, "", 0)
            .await
            .unwrap();
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(10))])
            .await
            .unwrap();

        let folder = store.claim_next_folder(session_id).await.unwrap().unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();
        store
            .record_file_attempt(item.id, "interrupted")
            .await
            .unwrap();

        let (files, folders) = store.reclaim_orphans(session_id).await.unwrap();
        assert_eq!(files, 1);
        assert_eq!(folders, 1);

        // No in-progress/listing rows remain, attempts preserved
        assert_eq!(
            store
                .count_files_by_status(session_id, FileStatus::InProgress)
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            store
                .count_folders_by_status(session_id, FolderStatus::Listing)
                .await
                .unwrap(),
            0
        );
        let item = store.get_file(item.id).await.unwrap().unwrap();
        assert_eq!(item.status(), FileStatus::Pending);
        assert_eq!(item.attempts, 1);

        let _ = folder;
    }

    #[tokio::test]
    async fn test_checkpoint_recomputes_counters() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(
                session_id,
                &[
                    new_item("f1", "f1.bin", Some(100)),
                    new_item("f2", "f2.bin", Some(200)),
                ],
            )
            .await
            .unwrap();

        let item = store.claim_next_file(session_id).await.unwrap().unwrap();
        store.complete_file(item.id, 100).await.unwrap();

        store.checkpoint(session_id).await.unwrap();

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert_eq!(session.completed_files, 1);
        assert_eq!(session.completed_bytes, 100);
        assert!(session.checkpoint_at.is_some());
    }

    #[tokio::test]
    async fn test_walk_done_flag() {
        let (store, session_id) = store_with_session().await;
        store.mark_walk_done(session_id).await.unwrap();

        let session = store.get_session(session_id).await.unwrap().unwrap();
        assert!(session.walk_done);
    }

    #[tokio::test]
    async fn test_requeue_file() {
        let (store, session_id) = store_with_session().await;
        store
            .enqueue_files(session_id, &[new_item("f1", "f1.bin", Some(10))])
            .await
            .unwrap();
        let item = store.claim_next_file(session_id).await.unwrap().unwrap();

        store.requeue_file(item.id).await.unwrap();
        let again = store.claim_next_file(session_id).await.unwrap().unwrap();
        assert_eq!(again.id, item.id);
    }
}
