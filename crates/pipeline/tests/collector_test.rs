//! HttpCollector against a local axum collector.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{TimeZone, Utc};
use tokio::time::timeout;

use relay_core::{CollectorConfig, DispatchConfig};
use relay_pipeline::{Collector, DeliveryError, Dispatcher, HttpCollector, NormalizedRecord, Source};

const TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct Received {
    idempotency_header: Option<String>,
    authorization: Option<String>,
    body: serde_json::Value,
}

/// Mock collector: answers `failures` requests with 500, then `success`.
struct MockServer {
    failures: usize,
    success: StatusCode,
    calls: AtomicUsize,
    received: Mutex<Vec<Received>>,
}

async fn events(
    State(server): State<Arc<MockServer>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
    };
    server.received.lock().unwrap().push(Received {
        idempotency_header: header("idempotency-key"),
        authorization: header("authorization"),
        body,
    });

    if server.calls.fetch_add(1, Ordering::SeqCst) < server.failures {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        server.success
    }
}

async fn spawn_server(failures: usize, success: StatusCode) -> (Arc<MockServer>, String) {
    let server = Arc::new(MockServer {
        failures,
        success,
        calls: AtomicUsize::new(0),
        received: Mutex::new(Vec::new()),
    });
    let app = Router::new()
        .route("/events", post(events))
        .with_state(server.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{addr}"))
}

fn collector(url: String, token: Option<&str>) -> HttpCollector {
    HttpCollector::new(&CollectorConfig {
        url,
        token: token.map(String::from),
        timeout_ms: 2_000,
    })
    .unwrap()
}

fn record() -> NormalizedRecord {
    NormalizedRecord::new(
        Source::Mail,
        Utc.timestamp_millis_opt(1_700_000_000_000).single().unwrap(),
        "alerts@bank.example",
        "Your code is 123456",
    )
    .with_subject("Sign-in code")
    .with_platform_id("msg-42")
}

#[tokio::test]
async fn posts_json_with_idempotency_header() {
    let (server, url) = spawn_server(0, StatusCode::CREATED).await;
    let collector = collector(url, Some("s3cret"));
    let record = record();
    let key = record.idempotency_key();

    collector.deliver(&record, &key).await.unwrap();

    let received = server.received.lock().unwrap().clone();
    assert_eq!(received.len(), 1);
    let request = &received[0];
    assert_eq!(request.idempotency_header.as_deref(), Some(key.as_str()));
    assert_eq!(request.authorization.as_deref(), Some("Bearer s3cret"));
    assert_eq!(request.body["source"], "mail");
    assert_eq!(request.body["sender"], "alerts@bank.example");
    assert_eq!(request.body["body"], "Your code is 123456");
    assert_eq!(request.body["subject"], "Sign-in code");
    assert_eq!(request.body["idempotencyKey"], key.as_str());
    assert_eq!(request.body["receivedAt"], "2023-11-14T22:13:20Z");
}

#[tokio::test]
async fn ok_status_is_success() {
    let (_server, url) = spawn_server(0, StatusCode::OK).await;
    let record = record();
    assert!(collector(url, None)
        .deliver(&record, &record.idempotency_key())
        .await
        .is_ok());
}

#[tokio::test]
async fn other_statuses_are_delivery_errors() {
    let (_server, url) = spawn_server(0, StatusCode::ACCEPTED).await;
    let record = record();
    let err = collector(url, None)
        .deliver(&record, &record.idempotency_key())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Status { status: 202, .. }));

    let (_server, url) = spawn_server(1, StatusCode::OK).await;
    let err = collector(url, None)
        .deliver(&record, &record.idempotency_key())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Status { status: 500, .. }));
}

#[tokio::test]
async fn unreachable_collector_is_transport_error() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let record = record();
    let err = collector(format!("http://{addr}"), None)
        .deliver(&record, &record.idempotency_key())
        .await
        .unwrap_err();
    assert!(matches!(err, DeliveryError::Http(_)));
}

#[tokio::test]
async fn dispatcher_retries_server_errors_with_same_key() {
    let (server, url) = spawn_server(2, StatusCode::CREATED).await;
    let dispatcher = Dispatcher::builder(Arc::new(collector(url, None)))
        .config(DispatchConfig {
            max_attempts: 5,
            base_backoff_ms: 5,
            max_backoff_ms: 20,
            max_concurrent_sends: 4,
        })
        .build();

    let record = record();
    let key = record.idempotency_key();
    dispatcher.submit(record);
    timeout(TIMEOUT, dispatcher.flush()).await.unwrap();

    let stats = dispatcher.stats();
    assert_eq!(stats.delivered, 1);
    assert_eq!(stats.retried, 2);
    let received = server.received.lock().unwrap().clone();
    assert_eq!(received.len(), 3);
    assert!(received
        .iter()
        .all(|r| r.idempotency_header.as_deref() == Some(key.as_str())));

    dispatcher.shutdown().await;
}
