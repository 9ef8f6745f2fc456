//! Local path construction and safety checks.
//!
//! Remote item names come from an external service and are joined into local
//! paths, so every component is sanitized and relative paths are checked for
//! traversal before any filesystem operation.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Directory under the destination root holding per-session partial files.
pub const TEMP_DIR_NAME: &str = ".cloudpull-downloads";

/// Path construction errors.
#[derive(Debug, Error)]
pub enum PathError {
    /// The relative path escapes the destination root after normalization.
    #[error("path traversal rejected: {path}")]
    Traversal {
        /// The offending relative path.
        path: String,
    },

    /// The relative path is empty after sanitization.
    #[error("empty relative path")]
    Empty,
}

/// Sanitizes a single remote name into a safe path component.
///
/// Path separators and NUL are replaced with `_`; leading dots are kept
/// (hidden files are legitimate) but a bare `.` or `..` collapses to `_`.
#[must_use]
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() || trimmed == "." || trimmed == ".." {
        "_".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Joins a parent relative path and a child name into a child relative path.
///
/// The name is sanitized; an empty parent yields just the name.
#[must_use]
pub fn child_rel_path(parent_rel: &str, name: &str) -> String {
    let component = sanitize_component(name);
    if parent_rel.is_empty() {
        component
    } else {
        format!("{parent_rel}/{component}")
    }
}

/// Resolves a stored relative path against the destination root.
///
/// Rejects absolute paths and any `..` component. Stored paths are produced
/// by [`child_rel_path`] so this only trips on tampered or migrated state.
///
/// # Errors
///
/// Returns [`PathError::Traversal`] for absolute or escaping paths and
/// [`PathError::Empty`] for an empty input.
pub fn resolve_final_path(dest_root: &Path, rel_path: &str) -> Result<PathBuf, PathError> {
    if rel_path.is_empty() {
        return Err(PathError::Empty);
    }

    let relative = Path::new(rel_path);
    for component in relative.components() {
        match component {
            Component::Normal(_) => {}
            Component::CurDir => {}
            _ => {
                return Err(PathError::Traversal {
                    path: rel_path.to_string(),
                });
            }
        }
    }

    Ok(dest_root.join(relative))
}

/// Per-session temp directory under the destination root.
#[must_use]
pub fn session_temp_dir(dest_root: &Path, session_id: i64) -> PathBuf {
    dest_root.join(TEMP_DIR_NAME).join(session_id.to_string())
}

/// Temp path for one file item inside the session temp directory.
#[must_use]
pub fn item_temp_path(temp_dir: &Path, item_id: i64) -> PathBuf {
    temp_dir.join(format!("{item_id}.part"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_component_passthrough() {
        assert_eq!(sanitize_component("report.pdf"), "report.pdf");
        assert_eq!(sanitize_component(".hidden"), ".hidden");
    }

    #[test]
    fn test_sanitize_component_replaces_separators() {
        assert_eq!(sanitize_component("a/b"), "a_b");
        assert_eq!(sanitize_component("a\\b"), "a_b");
    }

    #[test]
    fn test_sanitize_component_collapses_dot_names() {
        assert_eq!(sanitize_component("."), "_");
        assert_eq!(sanitize_component(".."), "_");
        assert_eq!(sanitize_component("  "), "_");
    }

    #[test]
    fn test_child_rel_path_joins() {
        assert_eq!(child_rel_path("", "f1.bin"), "f1.bin");
        assert_eq!(child_rel_path("d1", "f2.bin"), "d1/f2.bin");
        assert_eq!(child_rel_path("d1/d2", "f3.bin"), "d1/d2/f3.bin");
    }

    #[test]
    fn test_child_rel_path_sanitizes_name() {
        assert_eq!(child_rel_path("d1", "../escape"), "d1/.._escape");
    }

    #[test]
    fn test_resolve_final_path_plain() {
        let path = resolve_final_path(Path::new("/tmp/sync"), "d1/f2.bin").unwrap();
        assert_eq!(path, PathBuf::from("/tmp/sync/d1/f2.bin"));
    }

    #[test]
    fn test_resolve_final_path_rejects_parent_dir() {
        let result = resolve_final_path(Path::new("/tmp/sync"), "d1/../../etc/passwd");
        assert!(matches!(result, Err(PathError::Traversal { .. })));
    }

    #[test]
    fn test_resolve_final_path_rejects_absolute() {
        let result = resolve_final_path(Path::new("/tmp/sync"), "/etc/passwd");
        assert!(matches!(result, Err(PathError::Traversal { .. })));
    }

    #[test]
    fn test_resolve_final_path_rejects_empty() {
        let result = resolve_final_path(Path::new("/tmp/sync"), "");
        assert!(matches!(result, Err(PathError::Empty)));
    }

    #[test]
    fn test_session_temp_dir_layout() {
        let dir = session_temp_dir(Path::new("/tmp/sync"), 7);
        assert_eq!(dir, PathBuf::from("/tmp/sync/.cloudpull-downloads/7"));
    }

    #[test]
    fn test_item_temp_path_uses_item_id() {
        let temp = session_temp_dir(Path::new("/tmp/sync"), 7);
        assert_eq!(
            item_temp_path(&temp, 42),
            PathBuf::from("/tmp/sync/.cloudpull-downloads/7/42.part")
        );
    }
}
