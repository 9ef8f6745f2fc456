//! Include/exclude glob filtering applied to relative file paths.
//!
//! Filtering happens at enqueue time, in the walker, so excluded items are
//! persisted as `skipped` once instead of being re-evaluated by every
//! download worker. Folders are never filtered: their non-skipped
//! descendants must stay discoverable.

use globset::{Glob, GlobSet, GlobSetBuilder};
use thiserror::Error;

/// Filter construction errors.
#[derive(Debug, Error)]
pub enum FilterError {
    /// A configured pattern is not a valid glob.
    #[error("invalid glob pattern {pattern:?}: {source}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying glob error.
        #[source]
        source: globset::Error,
    },
}

/// Compiled include/exclude matcher over relative file paths.
#[derive(Debug)]
pub struct PathFilter {
    /// `None` means "include everything".
    include: Option<GlobSet>,
    exclude: GlobSet,
}

impl PathFilter {
    /// Compiles the configured pattern lists.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError::InvalidPattern`] for a malformed glob.
    pub fn new(include_patterns: &[String], exclude_patterns: &[String]) -> Result<Self, FilterError> {
        let include = if include_patterns.is_empty() {
            None
        } else {
            Some(build_set(include_patterns)?)
        };
        let exclude = build_set(exclude_patterns)?;

        Ok(Self { include, exclude })
    }

    /// Evaluates a relative file path.
    ///
    /// Returns `None` when the file should be synced, or a skip reason when
    /// it is excluded. Excludes win over includes.
    #[must_use]
    pub fn skip_reason(&self, rel_path: &str) -> Option<String> {
        if self.exclude.is_match(rel_path) {
            return Some(format!("excluded by pattern: {rel_path}"));
        }
        if let Some(include) = &self.include {
            if !include.is_match(rel_path) {
                return Some(format!("not matched by include patterns: {rel_path}"));
            }
        }
        None
    }
}

fn build_set(patterns: &[String]) -> Result<GlobSet, FilterError> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|source| FilterError::InvalidPattern {
            pattern: pattern.clone(),
            source,
        })?;
        builder.add(glob);
    }
    builder.build().map_err(|source| FilterError::InvalidPattern {
        pattern: String::new(),
        source,
    })
}
