//! Remote API capability boundary.
//!
//! The sync core depends only on the [`RemoteApi`] trait: list a folder's
//! children page by page, fetch one item's metadata, open a byte-range read
//! on a file, and export a native document. [`DriveApi`] implements it
//! against the Google Drive v3 wire shape; tests implement it in-process.
//!
//! Authentication is an external collaborator behind [`AuthProvider`]: the
//! adapter asks it for a bearer token per request and invokes `refresh()`
//! exactly once when a request comes back 401.

mod drive;
mod error;

pub use drive::{DriveApi, FOLDER_MIME_TYPE, SHORTCUT_MIME_TYPE};
pub use error::ApiError;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

/// A streamed file body: chunks of bytes or a stream-level error.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// One remote item as reported by a listing or metadata fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    /// Stable remote identifier.
    pub id: String,
    /// Display name (one path component, unsanitized).
    pub name: String,
    /// Remote mime-type.
    pub mime_type: String,
    /// Declared size in bytes; absent for native documents.
    pub size: Option<u64>,
    /// Remote MD5 checksum (hex), when the service reports one.
    pub md5_checksum: Option<String>,
    /// RFC 3339 modification time.
    pub modified_time: Option<String>,
    /// Identifier of the shortcut target, for shortcut items.
    pub shortcut_target: Option<String>,
    /// Mime-type of the shortcut target, for shortcut items.
    pub shortcut_target_mime: Option<String>,
}

impl RemoteItem {
    /// Whether this item is a folder.
    #[must_use]
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Whether this item is a shortcut.
    #[must_use]
    pub fn is_shortcut(&self) -> bool {
        self.mime_type == SHORTCUT_MIME_TYPE
    }
}

/// One page of a folder listing.
#[derive(Debug, Clone, Default)]
pub struct FileList {
    /// Items on this page.
    pub items: Vec<RemoteItem>,
    /// Token for the next page; `None` on the last page.
    pub next_page_token: Option<String>,
}

/// The capability set the sync core requires from the remote store.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Lists one page of a folder's children.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport, status, or decode failure.
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, ApiError>;

    /// Fetches metadata for a single item.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on transport, status, or decode failure
    /// (`HttpStatus { status: 404, .. }` when the item is gone).
    async fn get_metadata(&self, id: &str) -> Result<RemoteItem, ApiError>;

    /// Opens a byte-range read on a file.
    ///
    /// `length: None` reads to EOF. The returned stream yields chunks as the
    /// transport delivers them; chunk sizing is the caller's concern.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the request cannot be opened; stream-level
    /// failures surface as `Err` items on the stream.
    async fn open_range(
        &self,
        file_id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, ApiError>;

    /// Exports a native document to the target mime-type.
    ///
    /// Export streams are opaque one-shot bodies: no range resume.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the export cannot be opened.
    async fn export(&self, file_id: &str, target_mime: &str) -> Result<ByteStream, ApiError>;
}

/// Authentication collaborator: yields bearer tokens, refreshes on demand.
///
/// Credential acquisition (OAuth2 code exchange, token storage) lives outside
/// the core; this trait is the whole surface the core touches.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Auth`] when no credential is available.
    async fn token(&self) -> Result<String, ApiError>;

    /// Refreshes the credential after a 401.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Auth`] when the refresh fails; the caller then
    /// surfaces the original 401 as permanent.
    async fn refresh(&self) -> Result<(), ApiError>;
}

/// Fixed-token provider for tests and pre-authorized environments.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    /// Creates a provider that always yields the given token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

#[async_trait]
impl AuthProvider for StaticTokenProvider {
    async fn token(&self) -> Result<String, ApiError> {
        Ok(self.token.clone())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        Err(ApiError::auth(
            "token refresh",
            "static token cannot be refreshed",
        ))
    }
}
