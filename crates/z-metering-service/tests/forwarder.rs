//! Observability forwarder integration tests.

use std::time::Duration;

use chrono::Utc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use z_metering_core::{Agent, UsageRecord, UserId};
use z_metering_engine::UsageSink;
use z_metering_service::HttpSink;

fn sample_record() -> UsageRecord {
    UsageRecord::denied(
        UserId::generate(),
        Agent::Chat,
        "send_message".into(),
        5,
        "insufficient_credits".into(),
        serde_json::json!({ "session_id": "s-1" }),
        Utc::now(),
    )
}

/// Poll until the mock server has seen `count` requests or five seconds pass.
async fn wait_for_requests(server: &MockServer, count: usize) -> Vec<wiremock::Request> {
    for _ in 0..100 {
        let received = server.received_requests().await.unwrap_or_default();
        if received.len() >= count {
            return received;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    server.received_requests().await.unwrap_or_default()
}

#[tokio::test]
async fn published_records_are_posted_with_bearer_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/usage"))
        .and(header("authorization", "Bearer obs-key"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (sink, _handle) =
        HttpSink::spawn(format!("{}/usage", server.uri()), Some("obs-key".into()), 16).unwrap();
    let record = sample_record();
    sink.publish(&record);

    let received = wait_for_requests(&server, 1).await;
    assert_eq!(received.len(), 1);
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["record"]["id"], record.id.to_string());
    assert_eq!(body["record"]["outcome"], "denied");
    assert!(body.get("append_error").is_none());
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (sink, _handle) = HttpSink::spawn(server.uri(), None, 16).unwrap();
    sink.publish(&sample_record());

    let received = wait_for_requests(&server, 2).await;
    assert_eq!(received.len(), 2);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(400))
        .mount(&server)
        .await;

    let (sink, _handle) = HttpSink::spawn(server.uri(), None, 16).unwrap();
    sink.publish(&sample_record());

    wait_for_requests(&server, 1).await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(server.received_requests().await.unwrap_or_default().len(), 1);
}

#[tokio::test]
async fn append_failures_are_forwarded_for_audit() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let (sink, _handle) = HttpSink::spawn(server.uri(), None, 16).unwrap();
    sink.report_failure(&sample_record(), "usage log offline");

    let received = wait_for_requests(&server, 1).await;
    let body: serde_json::Value = serde_json::from_slice(&received[0].body).unwrap();
    assert_eq!(body["append_error"], "usage log offline");
}
