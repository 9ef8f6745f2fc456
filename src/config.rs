//! Typed configuration for the sync engine.
//!
//! Loading and merging (YAML files, environment, flags) happens outside the
//! core; the engine receives this record fully resolved. Every field carries
//! the documented default so `SyncConfig::default()` is a working
//! configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of concurrent download workers.
pub const DEFAULT_WORKERS: usize = 3;

/// Default number of concurrent folder-listing workers.
pub const DEFAULT_WALKER_WORKERS: usize = 5;

/// Default download chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Default retry ceiling for file downloads.
pub const DEFAULT_MAX_FILE_ATTEMPTS: u32 = 5;

/// Default retry ceiling for folder listings.
pub const DEFAULT_MAX_FOLDER_ATTEMPTS: u32 = 3;

/// Default session-fatal error threshold.
pub const DEFAULT_MAX_ERRORS: u64 = 100;

/// Configuration inputs recognized by the sync core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Concurrent download workers.
    pub workers: usize,

    /// Concurrent folder-listing workers.
    pub walker_workers: usize,

    /// Download chunk size in bytes.
    pub chunk_size_bytes: u64,

    /// Bytes of new data between durable progress flushes.
    pub flush_interval_bytes: u64,

    /// Milliseconds between durable progress flushes (whichever of the two
    /// flush thresholds trips first wins).
    pub flush_interval_ms: u64,

    /// Retry limit per file item, counted across process restarts.
    pub max_file_attempts: u32,

    /// Retry limit per folder listing.
    pub max_folder_attempts: u32,

    /// Failed-item count at which the whole session is failed.
    pub max_errors: u64,

    /// Seconds between durable session checkpoints.
    pub checkpoint_interval_secs: u64,

    /// Milliseconds between published progress snapshots.
    pub progress_interval_ms: u64,

    /// Remote API admission rate, tokens per second.
    pub api_rate_per_sec: f64,

    /// Remote API admission burst.
    pub api_burst: u32,

    /// Global download bandwidth cap in bytes/sec (0 = unlimited).
    pub bandwidth_limit_bps: u64,

    /// Remote calls allowed in flight at once (may differ from `workers`).
    pub max_remote_concurrent: usize,

    /// Per-request timeout for remote calls, in seconds.
    pub request_timeout_secs: u64,

    /// Follow shortcuts to folders/files during the walk.
    pub follow_shortcuts: bool,

    /// Treat an identical existing file at the final path as already done.
    pub skip_duplicates: bool,

    /// Set local mtime to the remote modified time on completion.
    pub preserve_timestamps: bool,

    /// Export mapping: native document mime-type → downloadable target mime.
    pub export_formats: HashMap<String, String>,

    /// Globs selecting relative file paths to sync (empty = everything).
    pub include_patterns: Vec<String>,

    /// Globs excluding relative file paths from the sync.
    pub exclude_patterns: Vec<String>,

    /// Maximum folder depth below the root (-1 = unlimited).
    pub max_depth: i64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            walker_workers: DEFAULT_WALKER_WORKERS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            flush_interval_bytes: DEFAULT_CHUNK_SIZE,
            flush_interval_ms: 500,
            max_file_attempts: DEFAULT_MAX_FILE_ATTEMPTS,
            max_folder_attempts: DEFAULT_MAX_FOLDER_ATTEMPTS,
            max_errors: DEFAULT_MAX_ERRORS,
            checkpoint_interval_secs: 30,
            progress_interval_ms: 1000,
            api_rate_per_sec: 10.0,
            api_burst: 10,
            bandwidth_limit_bps: 0,
            max_remote_concurrent: DEFAULT_WORKERS,
            request_timeout_secs: 30,
            follow_shortcuts: false,
            skip_duplicates: true,
            preserve_timestamps: true,
            export_formats: default_export_formats(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            max_depth: -1,
        }
    }
}

impl SyncConfig {
    /// Checkpoint interval as a [`Duration`].
    #[must_use]
    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_secs(self.checkpoint_interval_secs)
    }

    /// Progress snapshot interval as a [`Duration`].
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    /// Durable flush interval as a [`Duration`].
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    /// Per-request timeout as a [`Duration`].
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Export target mime for a native document mime, if one is mapped.
    #[must_use]
    pub fn export_target(&self, mime_type: &str) -> Option<&str> {
        self.export_formats.get(mime_type).map(String::as_str)
    }
}

/// Default export mapping for Google Workspace document types.
fn default_export_formats() -> HashMap<String, String> {
    let mut formats = HashMap::new();
    formats.insert(
        "application/vnd.google-apps.document".to_string(),
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document".to_string(),
    );
    formats.insert(
        "application/vnd.google-apps.spreadsheet".to_string(),
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet".to_string(),
    );
    formats.insert(
        "application/vnd.google-apps.presentation".to_string(),
        "application/vnd.openxmlformats-officedocument.presentationml.presentation".to_string(),
    );
    formats.insert(
        "application/vnd.google-apps.drawing".to_string(),
        "image/png".to_string(),
    );
    formats
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = SyncConfig::default();
        assert_eq!(config.workers, 3);
        assert_eq!(config.walker_workers, 5);
        assert_eq!(config.chunk_size_bytes, 1024 * 1024);
        assert_eq!(config.max_file_attempts, 5);
        assert_eq!(config.max_folder_attempts, 3);
        assert_eq!(config.max_errors, 100);
        assert_eq!(config.checkpoint_interval(), Duration::from_secs(30));
        assert_eq!(config.progress_interval(), Duration::from_millis(1000));
        assert_eq!(config.bandwidth_limit_bps, 0);
        assert_eq!(config.max_depth, -1);
        assert!(config.skip_duplicates);
        assert!(config.preserve_timestamps);
        assert!(!config.follow_shortcuts);
    }

    #[test]
    fn test_default_export_formats_cover_workspace_types() {
        let config = SyncConfig::default();
        assert!(
            config
                .export_target("application/vnd.google-apps.document")
                .unwrap()
                .contains("wordprocessingml")
        );
        assert!(
            config
                .export_target("application/vnd.google-apps.spreadsheet")
                .unwrap()
                .contains("spreadsheetml")
        );
        assert!(config.export_target("application/pdf").is_none());
    }

    #[test]
    fn test_config_deserializes_with_partial_fields() {
        let config: SyncConfig = serde_json::from_str(r#"{"workers": 8, "max_depth": 2}"#).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_depth, 2);
        // Everything else falls back to defaults
        assert_eq!(config.walker_workers, 5);
        assert!(config.skip_duplicates);
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = SyncConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: SyncConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.workers, config.workers);
        assert_eq!(parsed.export_formats, config.export_formats);
    }
}
