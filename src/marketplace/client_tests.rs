//! Tests for the marketplace HTTP client against a mock server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use rusqlite::Connection;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::*;
use crate::engine::SyncEngine;
use crate::retry::RetryPolicy;
use crate::store;

const TRUNCATED_BODY: &str = r#"{"results":[{"id":1,"updated_at":"2026-03-01T10:00:00Z"}"#;

fn client_with_mock(mock_uri: &str) -> MarketplaceClient {
    MarketplaceClient::new(mock_uri, "test_token").unwrap()
}

#[test]
fn new_trims_trailing_slash() {
    let client = MarketplaceClient::new("https://api.example.com/v3/", "tok").unwrap();
    assert_eq!(client.base_url, "https://api.example.com/v3");
    assert_eq!(client.api_token, "tok");
    assert_eq!(
        client.collection_url(RecordKind::SaleEvent),
        "https://api.example.com/v3/sale-events"
    );
}

#[tokio::test]
async fn fetch_first_page_with_zero_cursor() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/listings"))
        .and(query_param("limit", "50"))
        .and(header("Authorization", "Bearer test_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                { "id": 1001, "updated_at": "2026-03-01T10:00:00Z", "title": "Mug", "price": 18.5 },
                { "id": "1002", "updated_at": "2026-03-01T11:00:00Z", "title": "Bowl" }
            ],
            "next_cursor": "page-2",
            "has_more": true
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let page = client
        .fetch_page(RecordKind::Listing, &SyncCursor::zero(RecordKind::Listing), 50)
        .await
        .unwrap();

    assert_eq!(page.records.len(), 2);
    assert_eq!(page.records[0].id, "1001");
    assert_eq!(page.records[0].payload["price"], serde_json::json!(18.5));
    assert_eq!(page.records[1].id, "1002");
    assert_eq!(page.next_token.as_deref(), Some("page-2"));
    assert!(page.has_more);
}

#[tokio::test]
async fn fetch_passes_continuation_token() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/orders"))
        .and(query_param("cursor", "abc123"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [],
            "next_cursor": null,
            "has_more": false
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut cursor = SyncCursor::zero(RecordKind::Order);
    cursor.token = Some("abc123".to_string());
    cursor.updated_after = Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());

    let page = client.fetch_page(RecordKind::Order, &cursor, 100).await.unwrap();
    assert!(page.records.is_empty());
    assert!(page.next_token.is_none());
    assert!(!page.has_more);
}

#[tokio::test]
async fn fetch_falls_back_to_updated_after() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/shops"))
        .and(query_param("updated_after", "2026-03-01T00:00:00.000000000Z"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": []
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let mut cursor = SyncCursor::zero(RecordKind::Shop);
    cursor.updated_after = Some(Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap());

    let page = client.fetch_page(RecordKind::Shop, &cursor, 10).await.unwrap();
    assert!(page.records.is_empty());
    assert!(!page.has_more);
}

#[tokio::test]
async fn unauthorized_maps_to_auth_error() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Listing, &SyncCursor::zero(RecordKind::Listing), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Auth(ref msg) if msg.contains("token expired")));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn too_many_requests_carries_retry_after() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "12"))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Order, &SyncCursor::zero(RecordKind::Order), 10)
        .await
        .unwrap_err();
    match err {
        SyncError::RateLimited { retry_after } => {
            assert_eq!(retry_after, Some(Duration::from_secs(12)));
        }
        other => panic!("expected RateLimited, got {:?}", other),
    }
}

#[tokio::test]
async fn server_error_is_transient() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/sale-events"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(
            RecordKind::SaleEvent,
            &SyncCursor::zero(RecordKind::SaleEvent),
            10,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransientNetwork(_)));
}

#[tokio::test]
async fn not_found_is_permanent() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Listing, &SyncCursor::zero(RecordKind::Listing), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::HttpStatus(StatusCode::NOT_FOUND)));
    assert!(err.is_fatal());
}

#[tokio::test]
async fn malformed_body_is_parse_error() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Listing, &SyncCursor::zero(RecordKind::Listing), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Parse(_)));
}

#[tokio::test]
async fn truncated_body_is_transient() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRUNCATED_BODY))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Order, &SyncCursor::zero(RecordKind::Order), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TransientNetwork(ref msg) if msg.contains("truncated")));
    assert!(err.is_retryable());
}

fn engine_for(client: MarketplaceClient) -> SyncEngine {
    let conn = Connection::open_in_memory().unwrap();
    store::init_schema(&conn).unwrap();
    SyncEngine::new(Arc::new(client), Arc::new(Mutex::new(conn)))
        .with_retry_policy(RetryPolicy::immediate(3))
}

#[tokio::test]
async fn engine_retries_truncated_page() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_string(TRUNCATED_BODY))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path("/orders"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [
                { "id": 1, "updated_at": "2026-03-01T10:00:00Z" },
                { "id": 2, "updated_at": "2026-03-01T11:00:00Z" }
            ],
            "next_cursor": null,
            "has_more": false
        })))
        .mount(&mock_server)
        .await;

    let engine = engine_for(client_with_mock(&mock_server.uri()));
    let result = engine
        .sync(RecordKind::Order, SyncCursor::zero(RecordKind::Order))
        .await
        .unwrap();

    assert!(result.is_complete());
    assert_eq!(result.created, 2);
    assert_eq!(result.cursor.token, None);
    assert_eq!(mock_server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn more_results_without_cursor_stops_sync() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{ "id": 1, "updated_at": "2026-03-01T10:00:00Z" }],
            "next_cursor": null,
            "has_more": true
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let engine = engine_for(client_with_mock(&mock_server.uri()));
    let err = engine
        .sync(RecordKind::Listing, SyncCursor::zero(RecordKind::Listing))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidRecord(_)));

    let db = engine.db();
    let conn = db.lock().unwrap();
    assert_eq!(store::count_records(&conn, RecordKind::Listing).unwrap(), 0);
    assert!(store::load_cursor(&conn, RecordKind::Listing).unwrap().is_zero());
}

#[tokio::test]
async fn record_without_timestamp_is_rejected() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/listings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": [{ "id": 1 }],
            "has_more": false
        })))
        .mount(&mock_server)
        .await;

    let err = client
        .fetch_page(RecordKind::Listing, &SyncCursor::zero(RecordKind::Listing), 10)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::InvalidRecord(_)));
}

#[tokio::test]
async fn unreachable_host_is_transient() {
    // Nothing listens on port 1
    let client = MarketplaceClient::new("http://127.0.0.1:1", "test_token").unwrap();

    let err = client
        .fetch_page(RecordKind::Shop, &SyncCursor::zero(RecordKind::Shop), 10)
        .await
        .unwrap_err();
    assert!(err.is_retryable(), "got {:?}", err);
}

#[tokio::test]
async fn test_connection_succeeds() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/shops"))
        .and(query_param("limit", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "results": []
        })))
        .mount(&mock_server)
        .await;

    assert!(client.test_connection().await.unwrap());
}

#[tokio::test]
async fn test_connection_reports_server_failure() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/shops"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    assert!(!client.test_connection().await.unwrap());
}

#[tokio::test]
async fn test_connection_rejects_bad_token() {
    let mock_server = MockServer::start().await;
    let client = client_with_mock(&mock_server.uri());

    Mock::given(method("GET"))
        .and(path("/shops"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&mock_server)
        .await;

    assert!(matches!(
        client.test_connection().await,
        Err(SyncError::Auth(_))
    ));
}
