use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use cloudcode_relay::config::parse_config;
use cloudcode_relay::protocol::conversation::{ChatRequest, ConversationTurn};
use cloudcode_relay::stream::StreamEvent;
use cloudcode_relay::Relay;
use parking_lot::Mutex;
use serde_json::json;
use tokio_util::sync::CancellationToken;

const SSE_BODY: &str = concat!(
    "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Let me check.\",\"thought\":true,\"thoughtSignature\":\"sig-abc\"}]}}]}}\n\n",
    "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"text\":\"Looking it up. \"}]}}]}}\n\n",
    "data: {\"response\":{\"candidates\":[{\"content\":{\"role\":\"model\",\"parts\":[{\"functionCall\":{\"name\":\"search\",\"args\":{\"q\":\"tokio\"}}}]},\"finishReason\":\"STOP\"}],",
    "\"usageMetadata\":{\"promptTokenCount\":9,\"candidatesTokenCount\":4,\"totalTokenCount\":13},\"modelVersion\":\"gemini-2.5-pro-001\"}}\n\n",
    "data: [DONE]\n\n",
);

type Captured = Arc<Mutex<Vec<(String, serde_json::Value)>>>;

fn sse_response(body: &'static str) -> Response {
    // Split mid-event to exercise reassembly across network reads.
    let pieces: Vec<Result<Bytes, Infallible>> = body
        .as_bytes()
        .chunks(37)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(Body::from_stream(futures_util::stream::iter(pieces)))
        .expect("build sse response")
}

async fn spawn_mock(
    captured: Captured,
    failures_before_success: usize,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new().route(
        "/v1/streamGenerateContent",
        post(move |headers: HeaderMap, Json(body): Json<serde_json::Value>| {
            let captured = captured.clone();
            let calls = calls.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                captured.lock().push((auth, body));
                if calls.fetch_add(1, Ordering::SeqCst) < failures_before_success {
                    return Response::builder()
                        .status(StatusCode::TOO_MANY_REQUESTS)
                        .header("content-type", "application/json")
                        .body(Body::from(
                            json!({"error": {"code": 429, "details": [{"retryDelay": "0.05s"}]}})
                                .to_string(),
                        ))
                        .expect("build error response");
                }
                sse_response(SSE_BODY)
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock upstream");
    let addr = listener.local_addr().expect("local addr");
    let server = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, server)
}

fn relay_for(addr: std::net::SocketAddr) -> Relay {
    let config = parse_config(&format!(
        r#"
endpoints:
  - "http://{addr}/v1"
retry:
  quota_backoff_base_ms: 10
stream:
  text_max_latency_ms: 20
accounts:
  - id: mock
    token: mock-token
    project: mock-project
"#
    ))
    .expect("parse config");
    Relay::from_config(config).expect("build relay")
}

#[tokio::test]
async fn test_streams_events_from_http_upstream() {
    let captured: Captured = Arc::default();
    let (addr, server) = spawn_mock(captured.clone(), 0).await;
    let relay = relay_for(addr);

    let mut request = ChatRequest::new("gemini-2.5-pro", vec![ConversationTurn::user_text("ping")]);
    request.session_id = Some("session-1".into());
    let (mut rx, handle) = relay.spawn_chat(request, CancellationToken::new());
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    let summary = handle.await.expect("join").expect("stream ok");

    assert_eq!(
        events[0],
        StreamEvent::ThinkingDelta {
            id: "thinking_1".into(),
            text: "Let me check.".into()
        }
    );
    assert_eq!(
        events[1],
        StreamEvent::TextDelta {
            text: "Looking it up. ".into()
        }
    );
    let StreamEvent::ToolCall { id, name, args } = &events[2] else {
        panic!("expected tool call, got {:?}", events[2]);
    };
    assert!(id.starts_with("call_"));
    assert_eq!(name, "search");
    assert_eq!(args, &json!({"q": "tokio"}));
    assert_eq!(events.len(), 3);

    assert_eq!(summary.finish_reason.as_deref(), Some("STOP"));
    assert_eq!(summary.model_version.as_deref(), Some("gemini-2.5-pro-001"));
    assert_eq!(summary.usage.and_then(|u| u.total_token_count), Some(13));
    assert_eq!(summary.tool_calls, 1);
    assert_eq!(summary.attempts, 1);
    assert_eq!(
        relay.state().signatures.lookup(id, Some("session-1")).as_deref(),
        Some("sig-abc")
    );

    let seen = captured.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, "Bearer mock-token");
    assert_eq!(seen[0].1["model"], "gemini-2.5-pro");
    assert_eq!(seen[0].1["project"], "mock-project");
    assert_eq!(seen[0].1["request"]["sessionId"], "session-1");
    assert_eq!(seen[0].1["request"]["contents"][0]["parts"][0]["text"], "ping");

    server.abort();
}

#[tokio::test]
async fn test_retries_quota_failure_over_http() {
    let captured: Captured = Arc::default();
    let (addr, server) = spawn_mock(captured.clone(), 1).await;
    let relay = relay_for(addr);

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let request = ChatRequest::new("gemini-2.5-pro", vec![ConversationTurn::user_text("ping")]);
    let collector = tokio::spawn(async move {
        let mut count = 0usize;
        while rx.recv().await.is_some() {
            count += 1;
        }
        count
    });
    let summary = relay
        .stream_chat(&request, &tx, &CancellationToken::new())
        .await
        .expect("stream ok after retry");
    drop(tx);

    assert_eq!(summary.attempts, 2);
    assert_eq!(collector.await.expect("join"), 3);
    assert_eq!(captured.lock().len(), 2);
    let first_id = captured.lock()[0].1["user_prompt_id"].clone();
    assert_eq!(captured.lock()[1].1["user_prompt_id"], first_id);

    server.abort();
}
