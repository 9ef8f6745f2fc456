//! Row types and status definitions for sessions, folders, and file items.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Status of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Sync is running (or was running when the process died).
    Active,
    /// Interrupted by the user; resumable.
    Paused,
    /// All work finished.
    Completed,
    /// Aborted by a fatal condition.
    Failed,
    /// Abandoned; kept for inspection.
    Cancelled,
}

impl SessionStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Whether this status is terminal (no resume possible).
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("invalid session status: {s}")),
        }
    }
}

/// Walk status of a remote folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderStatus {
    /// Discovered, not yet listed.
    Pending,
    /// A walker is paging through its children.
    Listing,
    /// All children enqueued.
    Done,
    /// Listing exhausted retries; subtree pruned.
    Failed,
}

impl FolderStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Listing => "listing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for FolderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FolderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "listing" => Ok(Self::Listing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid folder status: {s}")),
        }
    }
}

/// Status of a file item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Downloaded, verified, renamed into place.
    Completed,
    /// Exhausted retries or hit a permanent error.
    Failed,
    /// Excluded at enqueue time (pattern, unresolvable shortcut).
    Skipped,
}

impl FileStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for FileStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("invalid file status: {s}")),
        }
    }
}

/// One sync session row.
#[derive(Debug, Clone, FromRow)]
pub struct Session {
    /// Unique identifier.
    pub id: i64,
    /// Remote id of the root folder being synced.
    pub root_folder_id: String,
    /// Local destination root.
    pub dest_path: String,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Whether the walk has enumerated the whole tree.
    pub walk_done: bool,
    /// Files discovered so far (grows until `walk_done`).
    pub total_files: i64,
    /// Files completed.
    pub completed_files: i64,
    /// Files failed.
    pub failed_files: i64,
    /// Files skipped at enqueue time.
    pub skipped_files: i64,
    /// Bytes discovered so far (sizes known at walk time).
    pub total_bytes: i64,
    /// Bytes of completed files.
    pub completed_bytes: i64,
    /// Non-fatal errors recorded so far.
    pub error_count: i64,
    /// Most recent error message.
    pub last_error: Option<String>,
    /// When the session was created.
    pub created_at: String,
    /// When the session reached a terminal status.
    pub ended_at: Option<String>,
    /// When counters were last checkpointed.
    pub checkpoint_at: Option<String>,
}

impl Session {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Active` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status_str.parse().unwrap_or(SessionStatus::Active)
    }
}

/// One remote folder row.
#[derive(Debug, Clone, FromRow)]
pub struct Folder {
    /// Unique identifier.
    pub id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Remote folder id.
    pub remote_id: String,
    /// Remote id of the parent folder; `None` for the session root.
    pub parent_remote_id: Option<String>,
    /// Path relative to the destination root; empty for the session root.
    pub rel_path: String,
    /// Depth below the root (root = 0).
    pub depth: i64,
    /// Current walk status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Listing attempts made.
    pub attempts: i64,
    /// Last listing error.
    pub last_error: Option<String>,
    /// When the folder was discovered.
    pub created_at: String,
    /// When the folder was last updated.
    pub updated_at: String,
}

impl Folder {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> FolderStatus {
        self.status_str.parse().unwrap_or(FolderStatus::Pending)
    }
}

/// One file item row.
#[derive(Debug, Clone, FromRow)]
pub struct FileItem {
    /// Unique identifier.
    pub id: i64,
    /// Owning session.
    pub session_id: i64,
    /// Remote file id.
    pub remote_id: String,
    /// Remote id of the containing folder.
    pub parent_remote_id: Option<String>,
    /// Path relative to the destination root.
    pub rel_path: String,
    /// Declared size in bytes; `None` for native documents until exported.
    pub size: Option<i64>,
    /// Remote MD5 checksum, when reported.
    pub checksum: Option<String>,
    /// Remote mime-type.
    pub mime_type: String,
    /// Export target mime for native documents; `None` for plain files.
    pub export_mime: Option<String>,
    /// RFC 3339 remote modification time.
    pub modified_at: Option<String>,
    /// Current status (stored as text, parsed via `status()`).
    #[sqlx(rename = "status")]
    pub status_str: String,
    /// Bytes durably written so far (supports resume).
    pub bytes_downloaded: i64,
    /// Download attempts made, preserved across restarts.
    pub attempts: i64,
    /// Last download error.
    pub last_error: Option<String>,
    /// Claim ordering score; size when known, `i64::MAX` otherwise.
    pub priority: i64,
    /// When the item was created.
    pub created_at: String,
    /// When the item was last updated.
    pub updated_at: String,
}

impl FileItem {
    /// Returns the parsed status enum.
    ///
    /// Falls back to `Pending` if the status string is invalid.
    #[must_use]
    pub fn status(&self) -> FileStatus {
        self.status_str.parse().unwrap_or(FileStatus::Pending)
    }

    /// Whether this item must be exported rather than range-downloaded.
    #[must_use]
    pub fn is_export(&self) -> bool {
        self.export_mime.is_some()
    }
}

impl fmt::Display for FileItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "FileItem {{ id: {}, path: {}, status: {} }}",
            self.id,
            self.rel_path,
            self.status()
        )
    }
}

/// A file discovered by the walker, not yet persisted.
#[derive(Debug, Clone)]
pub struct NewFileItem {
    /// Remote file id.
    pub remote_id: String,
    /// Remote id of the containing folder.
    pub parent_remote_id: Option<String>,
    /// Path relative to the destination root.
    pub rel_path: String,
    /// Declared size, when the remote reports one.
    pub size: Option<i64>,
    /// Remote MD5 checksum, when reported.
    pub checksum: Option<String>,
    /// Remote mime-type.
    pub mime_type: String,
    /// Export target mime for native documents.
    pub export_mime: Option<String>,
    /// RFC 3339 remote modification time.
    pub modified_at: Option<String>,
    /// Skip reason; `Some` enqueues the item as `skipped`.
    pub skip_reason: Option<String>,
}

impl NewFileItem {
    /// Claim ordering score: size when known, `i64::MAX` otherwise so
    /// unknown-size items go last.
    #[must_use]
    pub fn priority(&self) -> i64 {
        self.size.unwrap_or(i64::MAX)
    }
}
