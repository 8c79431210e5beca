//! Integration tests for HttpPlatformClient using wiremock

mod common;

use std::sync::Arc;

use cadence::clock::Clock;
use cadence::models::{ContentRecord, ContentStatus, Credential, MediaType, Platform};
use cadence::platform::{HttpPlatformClient, PlatformError, PublishRequest, SocialPlatformClient};
use cadence::publish::{ContentPublisher, PublishConfig, PublishOutcome, PublishPath};
use cadence::storage::ContentStore;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn credential() -> Credential {
    Credential {
        account_id: "acct-1".to_string(),
        access_token: "token-acct-1".to_string(),
    }
}

fn image_request() -> PublishRequest {
    PublishRequest {
        media_refs: vec!["https://cdn.example.com/a.jpg".to_string()],
        caption: "hello".to_string(),
        media_type: MediaType::Image,
    }
}

/// Stats are read from the account endpoint with the bearer token
#[tokio::test]
async fn test_fetch_account_stats() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/acct-1/stats"))
        .and(header("authorization", "Bearer token-acct-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "followers_count": 1200,
            "media_count": 48,
            "engagement": 3.25
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap();
    let stats = client.fetch_account_stats(&credential()).await.unwrap();

    assert_eq!(stats.follower_count, 1200);
    assert_eq!(stats.media_count, 48);
    assert!((stats.engagement - 3.25).abs() < f64::EPSILON);
}

#[tokio::test]
async fn test_publish_returns_external_id() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts/acct-1/media"))
        .and(body_partial_json(json!({
            "media_type": "image",
            "caption": "hello"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "17890001" })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let client = HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap();
    let receipt = client.publish(&credential(), &image_request()).await.unwrap();

    assert_eq!(receipt.external_id, "17890001");
}

/// Permission errors are permanent and carry the platform message
#[tokio::test]
async fn test_permission_denied_is_permanent() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts/acct-1/media"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({
            "error": { "message": "missing publish permission" }
        })))
        .mount(&mock_server)
        .await;

    let client = HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap();
    let err = client.publish(&credential(), &image_request()).await.unwrap_err();

    assert!(matches!(&err, PlatformError::PermissionDenied(m) if m == "missing publish permission"));
    assert!(err.is_permanent());
}

#[tokio::test]
async fn test_rate_limit_reads_retry_after() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/acct-1/stats"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "90"))
        .mount(&mock_server)
        .await;

    let client = HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap();
    let err = client.fetch_account_stats(&credential()).await.unwrap_err();

    assert!(matches!(
        err,
        PlatformError::RateLimited {
            retry_after_secs: Some(90)
        }
    ));
    assert!(!err.is_permanent());
}

#[tokio::test]
async fn test_malformed_body_is_invalid_response() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/accounts/acct-1/stats"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .mount(&mock_server)
        .await;

    let client = HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap();
    let err = client.fetch_account_stats(&credential()).await.unwrap_err();

    assert!(matches!(err, PlatformError::InvalidResponse(_)));
}

/// A permanent rejection fails the content on the first attempt
#[tokio::test]
async fn test_publisher_fails_fast_on_permanent_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/accounts/acct-1/media"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "error": { "message": "unsupported aspect ratio" }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let clock = common::test_clock();
    let store = common::store_with_account("acct-1").await;
    let client = Arc::new(HttpPlatformClient::with_base_url(&mock_server.uri()).unwrap());
    let publisher = ContentPublisher::new(
        store.clone(),
        client,
        common::shared(&clock),
        PublishConfig::default(),
    );

    let record = ContentRecord::new("c-1", "ws-1", "acct-1", Platform::Instagram, clock.now())
        .with_media("https://cdn.example.com/wide.jpg");
    store.upsert_content(&record).await.unwrap();

    let outcome = publisher.publish("c-1", PublishPath::Queue).await.unwrap();
    assert!(matches!(outcome, PublishOutcome::Failed { .. }));

    let stored = store.get_content("c-1").await.unwrap().unwrap();
    assert_eq!(stored.status, ContentStatus::Failed);
    assert_eq!(stored.attempt_count, 1);
    assert!(stored
        .failure_reason
        .as_deref()
        .is_some_and(|r| r.contains("unsupported aspect ratio")));
}
