//! Retry, error normalization and cancellation behavior of the request executor.

use std::io::{Cursor, Write};
use std::time::{Duration, Instant};

use chrono::Utc;
use cloud_drive::{
    Authenticator, ClientConfig, CloudDrive, CloudDriveError, Credentials, Endpoints, ErrorCode,
};
use mockito::{Matcher, Server};
use reqwest::Client;
use tokio_util::sync::CancellationToken;

const RATE_EXCEEDED: &str = r#"{"logref":"LOGREF-UUID","message":"Rate exceeded","code":""}"#;

fn credentials() -> Credentials {
    Credentials {
        client_id: "client".to_string(),
        client_secret: "secret".to_string(),
        redirect_uri: "http://localhost/callback".to_string(),
        access_token: "test-token".to_string(),
        refresh_token: "refresh".to_string(),
        expires_at: Utc::now() + chrono::Duration::hours(1),
    }
}

fn client_for(server: &Server, config: ClientConfig) -> CloudDrive {
    let endpoints = Endpoints::new(
        &format!("{}/content", server.url()),
        &format!("{}/metadata", server.url()),
    )
    .unwrap();
    CloudDrive::with_endpoints(
        Client::new(),
        Authenticator::new(credentials()),
        &config,
        endpoints,
    )
}

fn fast_config(max_retries: u32) -> ClientConfig {
    ClientConfig::default()
        .with_max_retries(max_retries)
        .with_backoff_unit(Duration::from_millis(1))
        .with_jitter_seed(1)
}

#[tokio::test]
async fn rate_limit_exhausts_retries() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/metadata/nodes/f1/children")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(RATE_EXCEEDED)
        .expect(2)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(2));
    let err = client.node_children("f1").await.unwrap_err();

    match err {
        CloudDriveError::Api(api) => {
            assert_eq!(api.code, ErrorCode::TooManyRequests);
            assert_eq!(api.message, "Rate exceeded");
            assert_eq!(api.logref, "LOGREF-UUID");
            assert_eq!(api.status().map(|s| s.as_u16()), Some(429));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn rate_limit_retry_then_success() {
    let mut server = Server::new_async().await;
    let limited = server
        .mock("GET", "/metadata/nodes/f1/children")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(RATE_EXCEEDED)
        .expect(2)
        .create_async()
        .await;
    let ok = server
        .mock("GET", "/metadata/nodes/f1/children")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"data":[],"count":0}"#)
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(3));
    let children = client.node_children("f1").await.unwrap();

    assert!(children.is_empty());
    limited.assert_async().await;
    ok.assert_async().await;
}

#[tokio::test]
async fn stream_body_gets_single_attempt() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", Matcher::Regex(r"^/content/nodes(\?|$)".to_string()))
        .match_query(Matcher::Any)
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(RATE_EXCEEDED)
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let err = client
        .upload_node("root", "a.txt", Cursor::new(b"12345".to_vec()))
        .await
        .unwrap_err();

    assert_eq!(err.api_code(), Some(&ErrorCode::TooManyRequests));
    mock.assert_async().await;
}

#[tokio::test]
async fn other_failures_are_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/metadata/account/quota")
        .with_status(500)
        .with_header("content-type", "text/plain")
        .with_body("backend exploded")
        .expect(1)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let err = client.quota().await.unwrap_err();

    match err {
        CloudDriveError::Api(api) => {
            assert_eq!(api.code, ErrorCode::Unknown);
            assert_eq!(api.message, "backend exploded");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    mock.assert_async().await;
}

#[tokio::test]
async fn missing_node_message_maps_to_not_found() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/metadata/nodes/nonexistentid/children")
        .with_status(404)
        .with_header("content-type", "application/vnd.error+json")
        .with_body(r#"{"message":"Node does not exists"}"#)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let err = client.node_children("nonexistentid").await.unwrap_err();

    assert_eq!(err.api_code(), Some(&ErrorCode::NodeNotFound));
    assert_eq!(err.to_string(), "NODE_NOT_FOUND: Node does not exists");
}

#[tokio::test]
async fn bearer_token_attached() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/metadata/account/quota")
        .match_header("authorization", "Bearer test-token")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"quota":100,"available":40,"lastCalculated":"2015-06-01T10:00:00.000Z"}"#)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let quota = client.quota().await.unwrap();

    assert_eq!(quota.quota, 100);
    assert_eq!(quota.available, 40);
    assert!(quota.last_calculated.is_some());
    mock.assert_async().await;
}

#[tokio::test]
async fn cancelled_client_sends_nothing() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("GET", "/metadata/account/quota")
        .with_status(200)
        .expect(0)
        .create_async()
        .await;

    let token = CancellationToken::new();
    token.cancel();

    let client = client_for(&server, fast_config(5)).with_cancellation(token);
    let err = client.quota().await.unwrap_err();

    assert!(matches!(err, CloudDriveError::Cancelled));
    mock.assert_async().await;
}

#[tokio::test]
async fn cancellation_interrupts_backoff() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/metadata/account/quota")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(RATE_EXCEEDED)
        .create_async()
        .await;

    let config = ClientConfig::default()
        .with_max_retries(5)
        .with_backoff_unit(Duration::from_secs(10))
        .with_jitter_seed(3);
    let token = CancellationToken::new();
    let client = client_for(&server, config).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = client.quota().await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, CloudDriveError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn cancelling_one_handle_leaves_others_running() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/metadata/account/quota")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"quota":1,"available":1}"#)
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let token = CancellationToken::new();
    let scoped = client.with_cancellation(token.clone());
    token.cancel();

    assert!(matches!(
        scoped.quota().await.unwrap_err(),
        CloudDriveError::Cancelled
    ));
    assert_eq!(client.quota().await.unwrap().quota, 1);
}

#[tokio::test]
async fn malformed_json_surfaces_decode_error() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/metadata/account/quota")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body("{not json")
        .create_async()
        .await;

    let client = client_for(&server, fast_config(5));
    let err = client.quota().await.unwrap_err();

    assert!(matches!(err, CloudDriveError::JsonError(_)));
}

#[tokio::test]
async fn cancellation_interrupts_slow_change_feed_body() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/metadata/changes")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_chunked_body(|w| {
            w.write_all(br#"{"checkpoint":"cp1","#)?;
            w.flush()?;
            std::thread::sleep(Duration::from_secs(3));
            w.write_all(br#""nodes":[],"reset":false}"#)
        })
        .create_async()
        .await;

    let token = CancellationToken::new();
    let client = client_for(&server, fast_config(5)).with_cancellation(token.clone());

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let started = Instant::now();
    let err = client.changes("").await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, CloudDriveError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn cancellation_interrupts_slow_download() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", "/content/nodes/n1/content")
        .with_status(200)
        .with_chunked_body(|w| {
            w.write_all(b"first chunk")?;
            w.flush()?;
            std::thread::sleep(Duration::from_secs(3));
            w.write_all(b"second chunk")
        })
        .create_async()
        .await;

    let token = CancellationToken::new();
    let client = client_for(&server, fast_config(5)).with_cancellation(token.clone());
    let download = client.download_node("n1", None).await.unwrap();

    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let dir = tempfile::tempdir().unwrap();
    let started = Instant::now();
    let err = download.save_to(dir.path().join("n1.bin")).await.unwrap_err();
    canceller.await.unwrap();

    assert!(matches!(err, CloudDriveError::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(2));
}
