//! Transport and uploader behavior against the in-process mock backend.

use labsite_client::{HttpUploader, RequestOptions, SessionToken, Transport};
use labsite_core::{ApiConfig, FileUploader, LabError, TokenProvider};
use labsite_test_utils::{fixtures, Method, MockBackend};
use serde_json::json;
use std::sync::Arc;

fn transport_for(backend: &MockBackend) -> Transport {
    Transport::new(&ApiConfig::new(backend.base_url())).expect("transport")
}

// ============================================================================
// RESPONSE NORMALIZATION
// ============================================================================

#[tokio::test]
async fn test_list_is_unwrapped_and_aliased() {
    let backend = MockBackend::start().await;
    backend.seed("projects", fixtures::projects(2, 1));
    let transport = transport_for(&backend);

    let payload = transport.get("/api/projects").await.expect("list");
    let records = payload.as_array().expect("array payload");
    assert_eq!(records.len(), 3);
    for record in records {
        assert_eq!(record["_id"], record["id"]);
    }
}

#[tokio::test]
async fn test_query_parameters_filter_list() {
    let backend = MockBackend::start().await;
    backend.seed("projects", fixtures::projects(2, 3));
    let transport = transport_for(&backend);

    let payload = transport
        .request("/api/projects", RequestOptions::get().query("status", "past"))
        .await
        .expect("filtered list");
    assert_eq!(payload.as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_create_returns_unwrapped_record() {
    let backend = MockBackend::start().await;
    let transport = transport_for(&backend);

    let created = transport
        .post("/api/news", json!({"title": "Lab opens"}))
        .await
        .expect("create");
    assert_eq!(created["title"], "Lab opens");
    assert!(created["id"].as_str().is_some());
    assert_eq!(created["_id"], created["id"]);
    assert_eq!(backend.records("news").len(), 1);
}

#[tokio::test]
async fn test_error_status_carries_server_message() {
    let backend = MockBackend::start().await;
    backend.fail_next(Method::POST, "/api/projects", 422, "title required");
    let transport = transport_for(&backend);

    let err = transport
        .post("/api/projects", json!({}))
        .await
        .expect_err("should fail");
    assert_eq!(
        err,
        LabError::RequestFailed {
            status: 422,
            message: Some("title required".to_string())
        }
    );
}

#[tokio::test]
async fn test_missing_record_is_not_found() {
    let backend = MockBackend::start().await;
    backend.seed("team", vec![]);
    let transport = transport_for(&backend);

    let err = transport.delete("/api/team/ghost").await.expect_err("404");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_unreachable_backend_is_network_error() {
    let transport = Transport::new(&ApiConfig::new("http://127.0.0.1:9")).expect("transport");
    let err = transport.get("/api/projects").await.expect_err("refused");
    assert!(matches!(err, LabError::Network { .. }));
}

// ============================================================================
// AUTHENTICATION
// ============================================================================

#[tokio::test]
async fn test_configured_token_is_sent_as_bearer() {
    let backend = MockBackend::start().await;
    backend.seed("projects", vec![]);
    let transport =
        Transport::new(&ApiConfig::new(backend.base_url()).with_token("s3cret")).expect("transport");

    transport.get("/api/projects").await.expect("list");
    let requests = backend.requests();
    assert_eq!(requests[0].authorization.as_deref(), Some("Bearer s3cret"));
}

#[tokio::test]
async fn test_session_token_follows_login_state() {
    let backend = MockBackend::start().await;
    backend.seed("projects", vec![]);
    let session = Arc::new(SessionToken::new());
    let transport = transport_for(&backend)
        .with_token_provider(Arc::clone(&session) as Arc<dyn TokenProvider>);

    transport.get("/api/projects").await.expect("anonymous");
    session.login("admin-token");
    transport.get("/api/projects").await.expect("authorized");

    let requests = backend.requests();
    assert_eq!(requests[0].authorization, None);
    assert_eq!(
        requests[1].authorization.as_deref(),
        Some("Bearer admin-token")
    );
}

// ============================================================================
// UPLOADS
// ============================================================================

#[tokio::test]
async fn test_upload_returns_urls_in_order() {
    let backend = MockBackend::start().await;
    let config = ApiConfig::new(backend.base_url());
    let uploader = HttpUploader::from_config(transport_for(&backend), &config);

    let urls = uploader
        .upload(&[fixtures::attachment("a.png"), fixtures::attachment("b.png")])
        .await
        .expect("upload");
    assert_eq!(urls.len(), 2);
    assert!(urls[0].ends_with("a.png"));
    assert!(urls[1].ends_with("b.png"));
    assert_eq!(backend.request_count("POST", "/api/upload"), 1);
}

#[tokio::test]
async fn test_empty_upload_sends_nothing() {
    let backend = MockBackend::start().await;
    let config = ApiConfig::new(backend.base_url());
    let uploader = HttpUploader::from_config(transport_for(&backend), &config);

    assert!(uploader.upload(&[]).await.expect("noop").is_empty());
    assert!(backend.requests().is_empty());
}

#[tokio::test]
async fn test_upload_rejection_maps_to_upload_failed() {
    let backend = MockBackend::start().await;
    backend.fail_next(Method::POST, "/api/upload", 413, "file too large");
    let config = ApiConfig::new(backend.base_url());
    let uploader = HttpUploader::from_config(transport_for(&backend), &config);

    let err = uploader
        .upload(&[fixtures::attachment("huge.png")])
        .await
        .expect_err("rejected");
    assert_eq!(
        err,
        LabError::UploadFailed {
            status: Some(413),
            reason: "file too large".to_string()
        }
    );
}
