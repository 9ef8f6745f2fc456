//! Full-pipeline tests over the real Drive adapter and a mock HTTP server.
//!
//! Where `engine_integration` scripts the remote in-process, these tests
//! exercise the actual wire shape: files.list paging, `alt=media` range
//! reads, export, bearer headers, and the single 401 refresh.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cloudpull_core::api::{ApiError, AuthProvider, DriveApi, RemoteApi};
use cloudpull_core::{
    Database, SessionStatus, StaticTokenProvider, Store, SyncConfig, SyncEngine, SyncOptions,
};

const FOLDER_MIME: &str = "application/vnd.google-apps.folder";

fn file_json(id: &str, name: &str, content: &[u8]) -> serde_json::Value {
    json!({
        "id": id,
        "name": name,
        "mimeType": "application/octet-stream",
        "size": content.len().to_string(),
        "md5Checksum": format!("{:x}", md5::compute(content)),
        "modifiedTime": "2024-06-01T00:00:00Z"
    })
}

async fn drive_engine(server: &MockServer) -> (SyncEngine, Store) {
    let store = Store::new(Database::new_in_memory().await.unwrap());
    let api = DriveApi::with_base_url(
        Arc::new(StaticTokenProvider::new("test-token")),
        Duration::from_secs(5),
        &server.uri(),
    )
    .unwrap();
    let engine = SyncEngine::new(Arc::new(api), store.clone(), SyncConfig::default());
    (engine, store)
}

#[tokio::test]
async fn test_sync_over_drive_wire_shape() {
    let server = MockServer::start().await;
    let f1 = b"first file body".to_vec();
    let f2 = b"nested file body".to_vec();

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root1' in parents and trashed = false"))
        .and(header("Authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [
                file_json("f1", "f1.bin", &f1),
                {"id": "d1", "name": "d1", "mimeType": FOLDER_MIME}
            ]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'d1' in parents and trashed = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file_json("f2", "f2.bin", &f2)]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f1"))
        .and(query_param("alt", "media"))
        .and(header("Range", "bytes=0-"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(f1.clone()))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/f2"))
        .and(query_param("alt", "media"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(f2.clone()))
        .mount(&server)
        .await;

    let dest = TempDir::new().unwrap();
    let (engine, _store) = drive_engine(&server).await;

    let summary = engine
        .start_new(
            "root1",
            dest.path(),
            SyncOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.completed_files, 2);
    assert_eq!(std::fs::read(dest.path().join("f1.bin")).unwrap(), f1);
    assert_eq!(std::fs::read(dest.path().join("d1/f2.bin")).unwrap(), f2);
}

#[tokio::test]
async fn test_listing_follows_page_tokens() {
    let server = MockServer::start().await;
    let a = b"page one file".to_vec();
    let b = b"page two file".to_vec();

    // First page carries a nextPageToken
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root1' in parents and trashed = false"))
        .and(query_param("pageToken", "page2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [file_json("b", "b.bin", &b)]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root1' in parents and trashed = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "nextPageToken": "page2",
            "files": [file_json("a", "a.bin", &a)]
        })))
        .mount(&server)
        .await;

    for (id, body) in [("a", a.clone()), ("b", b.clone())] {
        Mock::given(method("GET"))
            .and(path(format!("/drive/v3/files/{id}")))
            .and(query_param("alt", "media"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
    }

    let dest = TempDir::new().unwrap();
    let (engine, _store) = drive_engine(&server).await;

    let summary = engine
        .start_new(
            "root1",
            dest.path(),
            SyncOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.completed_files, 2);
    assert!(dest.path().join("a.bin").exists());
    assert!(dest.path().join("b.bin").exists());
}

#[tokio::test]
async fn test_export_streams_document_body() {
    let server = MockServer::start().await;
    let exported = b"exported document body".to_vec();

    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .and(query_param("q", "'root1' in parents and trashed = false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "files": [{
                "id": "doc1",
                "name": "notes",
                "mimeType": "application/vnd.google-apps.document",
                "modifiedTime": "2024-06-01T00:00:00Z"
            }]
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/doc1/export"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(exported.clone()))
        .mount(&server)
        .await;

    let dest = TempDir::new().unwrap();
    let (engine, _store) = drive_engine(&server).await;

    let summary = engine
        .start_new(
            "root1",
            dest.path(),
            SyncOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.status, SessionStatus::Completed);
    assert_eq!(summary.completed_files, 1);
    // Export size lands in totals only after the transfer
    assert_eq!(summary.total_bytes, exported.len() as i64);
    assert_eq!(std::fs::read(dest.path().join("notes")).unwrap(), exported);
}

/// Auth collaborator whose refresh mints a working token.
struct RefreshingAuth {
    token: Mutex<String>,
    refreshes: Mutex<u32>,
}

#[async_trait]
impl AuthProvider for RefreshingAuth {
    async fn token(&self) -> Result<String, ApiError> {
        Ok(self.token.lock().unwrap().clone())
    }

    async fn refresh(&self) -> Result<(), ApiError> {
        *self.refreshes.lock().unwrap() += 1;
        *self.token.lock().unwrap() = "fresh-token".to_string();
        Ok(())
    }
}

#[tokio::test]
async fn test_401_refreshes_token_once_and_recovers() {
    let server = MockServer::start().await;

    // Stale token is rejected; the refreshed one works
    Mock::given(method("GET"))
        .and(path("/drive/v3/files/item1"))
        .and(header("Authorization", "Bearer fresh-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "item1",
            "name": "item1.bin",
            "mimeType": "application/octet-stream",
            "size": "4"
        })))
        .with_priority(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/drive/v3/files/item1"))
        .respond_with(ResponseTemplate::new(401))
        .with_priority(u8::MAX)
        .mount(&server)
        .await;

    let auth = Arc::new(RefreshingAuth {
        token: Mutex::new("stale-token".to_string()),
        refreshes: Mutex::new(0),
    });
    let api = DriveApi::with_base_url(
        Arc::clone(&auth) as Arc<dyn AuthProvider>,
        Duration::from_secs(5),
        &server.uri(),
    )
    .unwrap();

    let item = api.get_metadata("item1").await.unwrap();
    assert_eq!(item.name, "item1.bin");
    assert_eq!(*auth.refreshes.lock().unwrap(), 1);
}

#[tokio::test]
async fn test_server_error_with_reason_fails_folder_visibly() {
    let server = MockServer::start().await;

    // The root listing is forbidden outright (non-quota 403)
    Mock::given(method("GET"))
        .and(path("/drive/v3/files"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": {"errors": [{"reason": "insufficientFilePermissions"}]}
        })))
        .mount(&server)
        .await;

    let dest = TempDir::new().unwrap();
    let (engine, store) = drive_engine(&server).await;

    let summary = engine
        .start_new(
            "root1",
            dest.path(),
            SyncOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // Root inaccessible: the session is failed, not completed
    assert_eq!(summary.status, SessionStatus::Failed);
    assert!(
        summary
            .last_error
            .as_deref()
            .unwrap()
            .contains("root folder inaccessible")
    );

    let root = store.get_root_folder(summary.session_id).await.unwrap().unwrap();
    assert_eq!(
        root.status(),
        cloudpull_core::state::FolderStatus::Failed
    );
}
