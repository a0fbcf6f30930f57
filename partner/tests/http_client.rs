//! `PartnerHttpClient` against a mock partner.

#![allow(clippy::unwrap_used)]
#![allow(clippy::panic)]

use order_gateway_core::config::PartnerConfig;
use order_gateway_core::order::OrderId;
use order_gateway_core::partner::{PartnerClient, PartnerError, PartnerResult};
use order_gateway_partner::{MAX_ERROR_BODY, PartnerHttpClient};
use serde_json::json;
use std::time::Duration;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> PartnerConfig {
    PartnerConfig {
        base_url: server.uri(),
        api_key: "secret".to_string(),
        connect_timeout_secs: 1,
        read_timeout_secs: 1,
        ..PartnerConfig::default()
    }
}

fn order(raw: i64) -> OrderId {
    OrderId::new(raw).unwrap()
}

#[tokio::test]
async fn create_request_posts_order_and_reads_correlation_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/requests"))
        .and(query_param("api-key", "secret"))
        .and(body_json(json!({"OrderId": 42})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"Id": "corr-abc"})))
        .expect(1)
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    let receipt = client.create_request(order(42)).await.unwrap();
    assert_eq!(receipt.correlation_id, "corr-abc");
}

#[tokio::test]
async fn server_errors_keep_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/requests"))
        .respond_with(ResponseTemplate::new(503).set_body_string("x".repeat(MAX_ERROR_BODY * 2)))
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    match client.create_request(order(1)).await {
        Err(PartnerError::Status { status, body }) => {
            assert_eq!(status, 503);
            assert_eq!(body.len(), MAX_ERROR_BODY);
        }
        other => panic!("expected status error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_response_without_id_is_a_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"accepted": true})))
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    assert!(matches!(
        client.create_request(order(1)).await,
        Err(PartnerError::Decode(_))
    ));
}

#[tokio::test]
async fn get_result_requests_json_and_returns_body() {
    let server = MockServer::start().await;
    let payload = json!({"hasError": false, "Data": {"pledge": "ok"}});
    Mock::given(method("GET"))
        .and(path("/api/requests/result/corr-7"))
        .and(query_param("Type", "JSON"))
        .and(query_param("api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(payload.clone()))
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    let result = client.get_result(order(7), "corr-7").await.unwrap();
    assert_eq!(result, PartnerResult::Ready(payload));
}

#[tokio::test]
async fn accepted_or_pending_body_means_not_ready() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/requests/result/corr-1"))
        .respond_with(ResponseTemplate::new(202))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/requests/result/corr-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "PENDING"})))
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    assert_eq!(client.get_result(order(1), "corr-1").await.unwrap(), PartnerResult::Pending);
    assert_eq!(client.get_result(order(2), "corr-2").await.unwrap(), PartnerResult::Pending);
}

#[tokio::test]
async fn request_kinds_returns_catalogue() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/requests/kinds"))
        .and(query_param("api-key", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"kind": "STANDARD"}])))
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    let kinds = client.request_kinds().await.unwrap();
    assert_eq!(kinds[0]["kind"], "STANDARD");
}

#[tokio::test]
async fn slow_partner_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_secs(4)),
        )
        .mount(&server)
        .await;

    let client = PartnerHttpClient::new(&config(&server)).unwrap();
    assert!(matches!(
        client.request_kinds().await,
        Err(PartnerError::Timeout(_))
    ));
}

#[tokio::test]
async fn refused_connection_is_a_connect_error() {
    let config = PartnerConfig {
        base_url: "http://127.0.0.1:1".to_string(),
        connect_timeout_secs: 1,
        read_timeout_secs: 1,
        ..PartnerConfig::default()
    };
    let client = PartnerHttpClient::new(&config).unwrap();
    assert!(matches!(
        client.request_kinds().await,
        Err(PartnerError::Connect(_))
    ));
}
