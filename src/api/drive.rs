//! Google Drive v3 implementation of the remote API boundary.
//!
//! Thin wire adapter: builds requests, attaches the bearer token, maps
//! responses into [`RemoteItem`]/[`FileList`], and converts failures into
//! [`ApiError`] with status, service reason, and Retry-After context.
//! A 401 triggers exactly one token refresh before the request is retried.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{AUTHORIZATION, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument, warn};
use url::Url;

use super::error::ApiError;
use super::{AuthProvider, ByteStream, FileList, RemoteApi, RemoteItem};

/// Drive mime-type identifying folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Drive mime-type identifying shortcuts.
pub const SHORTCUT_MIME_TYPE: &str = "application/vnd.google-apps.shortcut";

/// Production API endpoint.
const DEFAULT_BASE_URL: &str = "https://www.googleapis.com";

/// Listing page size; Drive caps at 1000.
const PAGE_SIZE: u32 = 1000;

/// Connect timeout for all requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Item fields requested on every listing/metadata call.
const ITEM_FIELDS: &str = "id,name,mimeType,size,md5Checksum,modifiedTime,shortcutDetails";

/// Google Drive v3 remote API adapter.
///
/// Holds a pooled HTTP client and the authentication collaborator. Metadata
/// and listing requests carry a total per-request timeout; media and export
/// requests carry only connect/idle-read deadlines so long transfers are not
/// cut off mid-body.
pub struct DriveApi {
    client: Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
    request_timeout: Duration,
}

impl std::fmt::Debug for DriveApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveApi")
            .field("base_url", &self.base_url.as_str())
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Wire shape of one Drive file resource.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    /// Drive serializes int64 fields as JSON strings.
    size: Option<String>,
    md5_checksum: Option<String>,
    modified_time: Option<String>,
    shortcut_details: Option<DriveShortcutDetails>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveShortcutDetails {
    target_id: Option<String>,
    target_mime_type: Option<String>,
}

/// Wire shape of a files.list page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    next_page_token: Option<String>,
    #[serde(default)]
    files: Vec<DriveFile>,
}

/// Wire shape of a Drive error body, for extracting the failure reason.
#[derive(Debug, Deserialize)]
struct DriveErrorBody {
    error: Option<DriveErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorDetail {
    #[serde(default)]
    errors: Vec<DriveErrorItem>,
}

#[derive(Debug, Deserialize)]
struct DriveErrorItem {
    reason: Option<String>,
}

impl From<DriveFile> for RemoteItem {
    fn from(file: DriveFile) -> Self {
        let (shortcut_target, shortcut_target_mime) = file
            .shortcut_details
            .map(|d| (d.target_id, d.target_mime_type))
            .unwrap_or((None, None));
        Self {
            id: file.id,
            name: file.name,
            mime_type: file.mime_type,
            size: file.size.and_then(|s| s.parse().ok()),
            md5_checksum: file.md5_checksum,
            modified_time: file.modified_time,
            shortcut_target,
            shortcut_target_mime,
        }
    }
}

impl DriveApi {
    /// Creates an adapter against the production endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the HTTP client cannot be constructed.
    pub fn new(auth: Arc<dyn AuthProvider>, request_timeout: Duration) -> Result<Self, ApiError> {
        Self::with_base_url(auth, request_timeout, DEFAULT_BASE_URL)
    }

    /// Creates an adapter against a custom endpoint (mock servers in tests).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] if the base URL is invalid or the HTTP client
    /// cannot be constructed.
    pub fn with_base_url(
        auth: Arc<dyn AuthProvider>,
        request_timeout: Duration,
        base_url: &str,
    ) -> Result<Self, ApiError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| ApiError::auth("adapter setup", format!("invalid base url: {e}")))?;
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            // Idle-read deadline per read; deliberately no total timeout so
            // large media bodies can stream for as long as data keeps flowing.
            .read_timeout(request_timeout)
            .gzip(true)
            .build()
            .map_err(|e| ApiError::auth("adapter setup", format!("client build failed: {e}")))?;
        Ok(Self {
            client,
            base_url,
            auth,
            request_timeout,
        })
    }

    fn files_url(&self) -> Url {
        let mut url = self.base_url.clone();
        url.set_path("/drive/v3/files");
        url
    }

    fn file_url(&self, id: &str, suffix: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        match suffix {
            Some(suffix) => url.set_path(&format!("/drive/v3/files/{id}/{suffix}")),
            None => url.set_path(&format!("/drive/v3/files/{id}")),
        }
        url
    }

    /// Sends a request with bearer auth, refreshing the token once on 401.
    async fn send_authorized(
        &self,
        build: impl Fn() -> reqwest::RequestBuilder,
        context: &str,
    ) -> Result<Response, ApiError> {
        let mut refreshed = false;
        loop {
            let token = self.auth.token().await?;
            let response = build()
                .header(AUTHORIZATION, format!("Bearer {token}"))
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        ApiError::timeout(context)
                    } else {
                        ApiError::network(context, e)
                    }
                })?;

            if response.status() == StatusCode::UNAUTHORIZED && !refreshed {
                refreshed = true;
                debug!(context, "401 response, refreshing credential once");
                self.auth.refresh().await?;
                continue;
            }

            if !response.status().is_success() {
                return Err(error_from_response(context, response).await);
            }

            return Ok(response);
        }
    }

    fn stream_body(response: Response, context: String) -> ByteStream {
        Box::pin(response.bytes_stream().map(move |chunk| {
            chunk.map_err(|e| {
                if e.is_timeout() {
                    ApiError::timeout(&context)
                } else {
                    ApiError::network(&context, e)
                }
            })
        }))
    }
}

/// Builds an [`ApiError`] from a non-success response, pulling the service
/// reason out of the JSON error body and preserving Retry-After.
async fn error_from_response(context: &str, response: Response) -> ApiError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);

    let reason = match response.json::<DriveErrorBody>().await {
        Ok(body) => body
            .error
            .and_then(|detail| detail.errors.into_iter().find_map(|item| item.reason)),
        Err(e) => {
            debug!(context, error = %e, "error body was not parseable JSON");
            None
        }
    };

    if status >= 500 || status == 429 {
        warn!(context, status, ?reason, "remote service error");
    }

    ApiError::http_status_full(context, status, reason, retry_after)
}

#[async_trait]
impl RemoteApi for DriveApi {
    #[instrument(skip(self), fields(folder_id = %folder_id))]
    async fn list_children(
        &self,
        folder_id: &str,
        page_token: Option<&str>,
    ) -> Result<FileList, ApiError> {
        let context = format!("list children of {folder_id}");
        let query = format!("'{folder_id}' in parents and trashed = false");
        let fields = format!("nextPageToken,files({ITEM_FIELDS})");
        let url = self.files_url();
        let timeout = self.request_timeout;

        let response = self
            .send_authorized(
                || {
                    let mut request = self
                        .client
                        .get(url.clone())
                        .timeout(timeout)
                        .query(&[
                            ("q", query.as_str()),
                            ("fields", fields.as_str()),
                            ("orderBy", "name"),
                        ])
                        .query(&[("pageSize", PAGE_SIZE)]);
                    if let Some(token) = page_token {
                        request = request.query(&[("pageToken", token)]);
                    }
                    request
                },
                &context,
            )
            .await?;

        let page: DriveFileList = response
            .json()
            .await
            .map_err(|e| ApiError::decode(&context, e))?;

        Ok(FileList {
            items: page.files.into_iter().map(RemoteItem::from).collect(),
            next_page_token: page.next_page_token,
        })
    }

    #[instrument(skip(self), fields(id = %id))]
    async fn get_metadata(&self, id: &str) -> Result<RemoteItem, ApiError> {
        let context = format!("metadata for {id}");
        let url = self.file_url(id, None);
        let timeout = self.request_timeout;

        let response = self
            .send_authorized(
                || {
                    self.client
                        .get(url.clone())
                        .timeout(timeout)
                        .query(&[("fields", ITEM_FIELDS)])
                },
                &context,
            )
            .await?;

        let file: DriveFile = response
            .json()
            .await
            .map_err(|e| ApiError::decode(&context, e))?;
        Ok(RemoteItem::from(file))
    }

    #[instrument(skip(self), fields(file_id = %file_id, offset))]
    async fn open_range(
        &self,
        file_id: &str,
        offset: u64,
        length: Option<u64>,
    ) -> Result<ByteStream, ApiError> {
        let context = format!("download of {file_id}");
        let url = self.file_url(file_id, None);
        let range = match length {
            Some(length) if length > 0 => format!("bytes={offset}-{}", offset + length - 1),
            _ => format!("bytes={offset}-"),
        };

        let response = self
            .send_authorized(
                || {
                    self.client
                        .get(url.clone())
                        .query(&[("alt", "media")])
                        .header(RANGE, range.clone())
                },
                &context,
            )
            .await?;

        Ok(Self::stream_body(response, context))
    }

    #[instrument(skip(self), fields(file_id = %file_id, target_mime = %target_mime))]
    async fn export(&self, file_id: &str, target_mime: &str) -> Result<ByteStream, ApiError> {
        let context = format!("export of {file_id}");
        let url = self.file_url(file_id, Some("export"));

        let response = self
            .send_authorized(
                || {
                    self.client
                        .get(url.clone())
                        .query(&[("mimeType", target_mime)])
                },
                &context,
            )
            .await?;

        Ok(Self::stream_body(response, context))
    }
}
