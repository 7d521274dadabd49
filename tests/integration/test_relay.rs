//! End-to-end tests for the Block Tutor relay
//!
//! Each test binds a real listener, points the relay at a mock chat API and
//! drives it over HTTP the way the editor does.

use std::net::TcpListener;
use std::time::Duration;

use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::json;
use tutor_server::{create_router, AppState, Config, ErrorResponse, MessageResponse};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CLIENT_IP: &str = "198.51.100.23";

/// Find an available port for testing.
fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to port")
        .local_addr()
        .expect("Failed to get local addr")
        .port()
}

fn config_for(upstream: &MockServer) -> Config {
    let mut config = Config::default();
    config.openai_api_key = Some("sk-integration".to_string());
    config.openai_base_url = format!("{}/v1", upstream.uri());
    config.typing_delay_ms = 5;
    config.validate().expect("Test config should be valid");
    config
}

/// Spawns the relay on a free port and returns its base URL.
async fn spawn_relay(config: Config) -> (String, tokio::task::JoinHandle<()>) {
    let port = find_available_port();
    let addr = format!("127.0.0.1:{port}");

    let router = create_router(AppState::from_config(config).expect("Failed to build state"));
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("Failed to bind");

    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("Server failed");
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://{addr}"), handle)
}

fn sse_chunk(delta: &str) -> String {
    let chunk = json!({
        "id": "chatcmpl-integration",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "gpt-4-vision-preview",
        "choices": [{"index": 0, "delta": {"content": delta}}]
    });
    format!("data: {chunk}\n\n")
}

fn sse_body(deltas: &[&str]) -> String {
    let mut body: String = deltas.iter().map(|delta| sse_chunk(delta)).collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn completion(content: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "id": "chatcmpl-integration",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-3.5-turbo",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    }))
}

/// Streamed output arrives in order and concatenates to the buffered answer.
#[tokio::test]
async fn test_streamed_text_matches_buffered_text() {
    let deltas = ["このプログラムは", "ネコを", "10かい うごかすよ。"];
    let full: String = deltas.concat();

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(json!({"stream": true})))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&deltas), "text/event-stream"))
        .mount(&upstream)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(completion(&full))
        .mount(&upstream)
        .await;

    let (base, _handle) = spawn_relay(config_for(&upstream)).await;
    let client = reqwest::Client::new();
    let body = json!({"image": "iVBORw0KGgo", "xml": "<xml/>", "level": "beginner"});

    let response = client
        .post(format!("{base}/blockly-insight"))
        .header("cf-connecting-ip", CLIENT_IP)
        .json(&body)
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream")));

    let mut streamed = Vec::new();
    let mut chunks = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        streamed.extend_from_slice(&chunk.expect("Stream failed"));
        chunks += 1;
    }
    let streamed = String::from_utf8(streamed).expect("Streamed text should be UTF-8");
    assert_eq!(streamed, full);
    assert!(chunks > 1, "Expected the answer to arrive in several chunks");

    let buffered: MessageResponse = client
        .post(format!("{base}/blockly-insight?stream=false"))
        .header("cf-connecting-ip", CLIENT_IP)
        .json(&body)
        .send()
        .await
        .expect("Request failed")
        .json()
        .await
        .expect("Invalid JSON");
    assert_eq!(buffered.message, streamed);
}

/// The eleventh request inside the window is rejected; other clients are unaffected.
#[tokio::test]
async fn test_eleventh_request_is_rate_limited() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(completion("こたえ"))
        .mount(&upstream)
        .await;

    let (base, _handle) = spawn_relay(config_for(&upstream)).await;
    let client = reqwest::Client::new();
    let ask = |ip: &'static str| {
        client
            .post(format!("{base}/ask"))
            .header("cf-connecting-ip", ip)
            .json(&json!({"prompt": "ループってなに？", "level": "beginner"}))
            .send()
    };

    for i in 0..10 {
        let response = ask(CLIENT_IP).await.expect("Request failed");
        assert_eq!(response.status(), StatusCode::OK, "request {i} should pass");
    }

    let response = ask(CLIENT_IP).await.expect("Request failed");
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(
        response.headers().get("x-ratelimit-limit").unwrap(),
        "10"
    );
    let error: ErrorResponse = response.json().await.expect("Invalid JSON");
    assert_eq!(error.error, "Too many requests");

    let other = ask("192.0.2.1").await.expect("Request failed");
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_missing_ip_is_rejected() {
    let upstream = MockServer::start().await;
    let (base, _handle) = spawn_relay(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/build-block"))
        .json(&json!({"prompt": "p", "level": "beginner"}))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: ErrorResponse = response.json().await.expect("Invalid JSON");
    assert_eq!(error.error, "IP not found");
}

#[tokio::test]
async fn test_cors_preflight() {
    let upstream = MockServer::start().await;
    let (base, _handle) = spawn_relay(config_for(&upstream)).await;
    let client = reqwest::Client::new();

    let preflight = |origin: &'static str| {
        client
            .request(Method::OPTIONS, format!("{base}/build-block"))
            .header("origin", origin)
            .header("access-control-request-method", "PATCH")
            .send()
    };

    let allowed = preflight("http://localhost:5173")
        .await
        .expect("Request failed");
    assert!(allowed.status().is_success());
    assert_eq!(
        allowed
            .headers()
            .get("access-control-allow-origin")
            .unwrap(),
        "http://localhost:5173"
    );

    let foreign = preflight("https://example.com")
        .await
        .expect("Request failed");
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_upstream_failure_is_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .mount(&upstream)
        .await;

    let (base, _handle) = spawn_relay(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/build-block"))
        .header("cf-connecting-ip", CLIENT_IP)
        .json(&json!({"prompt": "ねこをうごかしたい", "level": "beginner"}))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let error: ErrorResponse = response.json().await.expect("Invalid JSON");
    assert!(error.error.contains("503"));
}

/// A malformed chunk after the answer started cuts the body short.
#[tokio::test]
async fn test_stream_failure_ends_body_early() {
    let mut body = sse_chunk("ループを");
    body.push_str("data: {not json}\n\n");
    body.push_str(&sse_chunk("つかおう"));
    body.push_str("data: [DONE]\n\n");

    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&upstream)
        .await;

    let (base, _handle) = spawn_relay(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/blockly-insight"))
        .header("cf-connecting-ip", CLIENT_IP)
        .json(&json!({"image": "iVBORw0KGgo", "xml": "<xml/>", "level": "beginner"}))
        .send()
        .await
        .expect("Request failed");
    assert_eq!(response.status(), StatusCode::OK);

    let mut received = Vec::new();
    let mut failed = false;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => received.extend_from_slice(&bytes),
            Err(_) => {
                failed = true;
                break;
            }
        }
    }

    assert!(failed, "The body should end with an error, not a clean EOF");
    // Bytes still buffered when the connection is aborted may be lost.
    assert!("ループを".as_bytes().starts_with(&received));
}

/// An upstream stream without any text is a bad gateway, not an empty 200.
#[tokio::test]
async fn test_empty_stream_is_bad_gateway() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body(&[]), "text/event-stream"))
        .mount(&upstream)
        .await;

    let (base, _handle) = spawn_relay(config_for(&upstream)).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/build-block"))
        .header("cf-connecting-ip", CLIENT_IP)
        .json(&json!({"prompt": "ねこをうごかしたい", "level": "beginner"}))
        .send()
        .await
        .expect("Request failed");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let error: ErrorResponse = response.json().await.expect("Invalid JSON");
    assert!(error.error.contains("empty response"));
}
