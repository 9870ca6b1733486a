//! HTTP behavior of the upstream client against a mock TMS.

use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use loadsync::config::UpstreamConfig;
use loadsync::upstream::{Upstream, UpstreamClient, UpstreamError};

fn client(server: &MockServer) -> UpstreamClient {
    let config = UpstreamConfig {
        base_url: server.uri(),
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        min_request_interval_ms: 0,
        ..UpstreamConfig::default()
    };
    UpstreamClient::new(&config).unwrap()
}

fn token(value: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "access_token": value,
        "expires_in": 3600,
    }))
}

fn page(references: &[&str], more_available: bool) -> ResponseTemplate {
    let loads: Vec<_> = references
        .iter()
        .map(|r| json!({ "referenceNumber": r, "status": "In Transit", "containerNumber": "MSCU1234567" }))
        .collect();
    ResponseTemplate::new(200).set_body_json(json!({
        "loads": loads,
        "pagination": { "moreAvailable": more_available },
    }))
}

#[tokio::test]
async fn test_pages_with_cached_token() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .and(body_partial_json(json!({
            "grant_type": "client_credentials",
            "client_id": "client",
        })))
        .respond_with(token("t1"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .and(query_param("page", "1"))
        .and(query_param("pageSize", "2"))
        .and(header("authorization", "Bearer t1"))
        .respond_with(page(&["REF-1", "REF-2"], true))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .and(query_param("page", "2"))
        .respond_with(page(&["REF-3"], false))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);

    let first = client.fetch_page(1, 2).await.unwrap();
    assert_eq!(first.loads.len(), 2);
    assert!(first.more_available);
    assert_eq!(first.loads[0].reference_number, "REF-1");
    assert_eq!(first.loads[0].container_number.as_deref(), Some("MSCU1234567"));

    let second = client.fetch_page(2, 2).await.unwrap();
    assert_eq!(second.loads.len(), 1);
    assert!(!second.more_available);
}

#[tokio::test]
async fn test_rejected_token_is_refreshed_once() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token("stale"))
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token("fresh"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .and(header("authorization", "Bearer stale"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .and(header("authorization", "Bearer fresh"))
        .respond_with(page(&["REF-1"], false))
        .expect(1)
        .mount(&server)
        .await;

    let result = client(&server).fetch_page(1, 100).await.unwrap();
    assert_eq!(result.loads.len(), 1);
}

#[tokio::test]
async fn test_rate_limit_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token("t1"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_page(1, 100).await.unwrap_err();
    assert!(matches!(
        err,
        UpstreamError::RateLimited {
            retry_after_secs: Some(7)
        }
    ));
}

#[tokio::test]
async fn test_token_failure_is_an_auth_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(ResponseTemplate::new(403).set_body_string("bad client"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_page(1, 100).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Auth(_)));
}

#[tokio::test]
async fn test_server_error_carries_status() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/oauth/token"))
        .respond_with(token("t1"))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/loads"))
        .respond_with(ResponseTemplate::new(502).set_body_string("upstream down"))
        .mount(&server)
        .await;

    let err = client(&server).fetch_page(1, 100).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Status { status: 502, .. }));
}
