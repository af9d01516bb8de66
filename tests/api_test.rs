use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chatwire::provider::{ProviderEvent, ScriptedProvider};
use chatwire::server::router;
use chatwire::store::{MemoryMessageStore, MessageStore};
use chatwire::uploader::FsImageUploader;
use chatwire::wire::{decode_line, WireEvent};
use chatwire::*;
use serde_json::json;
use std::sync::Arc;
use tower::util::ServiceExt;

struct TestApp {
    app: axum::Router,
    store: Arc<MemoryMessageStore>,
    _dir: tempfile::TempDir,
}

fn setup_test_app(events: Vec<ProviderEvent>) -> TestApp {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir: {}", e),
    };
    let mut args = Args::default();
    args.upload_dir = dir.path().to_string_lossy().to_string();

    let store = Arc::new(MemoryMessageStore::new());
    let state = AppState::build(
        args,
        store.clone(),
        Arc::new(ScriptedProvider::new(events)),
        Arc::new(FsImageUploader::new(dir.path())),
    );
    TestApp {
        app: router(Arc::new(state)),
        store,
        _dir: dir,
    }
}

fn hello_world() -> Vec<ProviderEvent> {
    vec![
        ProviderEvent::TextDelta("Hello".to_string()),
        ProviderEvent::ReasoningDelta("thinking".to_string()),
        ProviderEvent::TextDelta(" world".to_string()),
        ProviderEvent::Finish {
            reason: Some("stop".to_string()),
        },
    ]
}

fn chat_body(stream_id: &str) -> serde_json::Value {
    json!({
        "messages": [
            {"id": "user-1", "role": "user", "parts": [{"type": "text", "text": "Say hello"}]}
        ],
        "threadMetadata": {"threadId": "thread-1"},
        "responseMessageId": "resp-1",
        "streamId": stream_id,
        "model": "test/model",
        "userInfo": {"id": "user-42"}
    })
}

fn post_json(uri: &str, body: &serde_json::Value) -> Request<Body> {
    match Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
    {
        Ok(r) => r,
        Err(e) => panic!("request build failed: {}", e),
    }
}

fn get(uri: &str) -> Request<Body> {
    match Request::builder().uri(uri).body(Body::empty()) {
        Ok(r) => r,
        Err(e) => panic!("request build failed: {}", e),
    }
}

async fn send(app: &axum::Router, req: Request<Body>) -> axum::response::Response {
    match app.clone().oneshot(req).await {
        Ok(r) => r,
        Err(e) => panic!("router failed: {}", e),
    }
}

async fn body_string(response: axum::response::Response) -> String {
    match axum::body::to_bytes(response.into_body(), usize::MAX).await {
        Ok(b) => String::from_utf8_lossy(&b).to_string(),
        Err(e) => panic!("body read failed: {}", e),
    }
}

fn decode_all(body: &str) -> Vec<WireEvent> {
    body.lines()
        .flat_map(|line| match decode_line(line) {
            Ok(events) => events,
            Err(e) => panic!("undecodable line {:?}: {}", line, e),
        })
        .collect()
}

#[tokio::test]
async fn test_health_endpoints() {
    let t = setup_test_app(Vec::new());

    let live = send(&t.app, get("/health")).await;
    assert_eq!(live.status(), StatusCode::OK);
    assert!(live.headers().contains_key("x-request-id"));

    let ready = send(&t.app, get("/readyz")).await;
    assert_eq!(ready.status(), StatusCode::OK);
    let body: serde_json::Value = match serde_json::from_str(&body_string(ready).await) {
        Ok(v) => v,
        Err(e) => panic!("bad readiness body: {}", e),
    };
    assert_eq!(body["status"], "ready");
    assert_eq!(body["provider"], "scripted");
}

#[tokio::test]
async fn test_chat_streams_and_persists() {
    let t = setup_test_app(hello_world());

    let response = send(&t.app, post_json("/api/chat", &chat_body("stream-1"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("x-stream-id")
            .and_then(|v| v.to_str().ok()),
        Some("stream-1")
    );
    let body = body_string(response).await;
    let events = decode_all(&body);

    let text: String = events
        .iter()
        .filter_map(|e| match e {
            WireEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Hello world");
    assert!(events.contains(&WireEvent::ReasoningDelta("thinking".to_string())));
    assert_eq!(
        events.last(),
        Some(&WireEvent::Finish {
            finish_reason: Some("stop".to_string())
        })
    );

    let user = t.store.get(&MessageId::from("user-1")).await.ok().flatten();
    assert_eq!(user.map(|m| m.status), Some(MessageStatus::Done));

    let assistant = match t.store.get(&MessageId::from("resp-1")).await {
        Ok(Some(m)) => m,
        other => panic!("assistant missing: {:?}", other.map(|_| ())),
    };
    assert_eq!(assistant.status, MessageStatus::Done);
    assert_eq!(assistant.text(), "Hello world");
    assert_eq!(assistant.reasoning(), "thinking");
    assert_eq!(assistant.resumable_stream_id, None);

    let fetched = send(&t.app, get("/api/messages/resp-1")).await;
    assert_eq!(fetched.status(), StatusCode::OK);
    let json: serde_json::Value = match serde_json::from_str(&body_string(fetched).await) {
        Ok(v) => v,
        Err(e) => panic!("bad message body: {}", e),
    };
    assert_eq!(json["status"], "done");
    assert_eq!(json["parts"][0]["type"], "text");
}

#[tokio::test]
async fn test_resume_replays_tail_of_finished_stream() {
    let t = setup_test_app(hello_world());
    let full = body_string(send(&t.app, post_json("/api/chat", &chat_body("stream-2"))).await).await;
    let first_line_len = match full.find('\n') {
        Some(i) => i + 1,
        None => panic!("no lines in {:?}", full),
    };

    let resumed = send(
        &t.app,
        get(&format!("/api/chat?streamId=stream-2&offset={}", first_line_len)),
    )
    .await;
    assert_eq!(resumed.status(), StatusCode::OK);
    assert_eq!(body_string(resumed).await, full[first_line_len..]);
}

#[tokio::test]
async fn test_resume_requires_stream_id() {
    let t = setup_test_app(Vec::new());
    let response = send(&t.app, get("/api/chat")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_resume_of_unknown_stream_is_already_done() {
    let t = setup_test_app(Vec::new());
    let response = send(&t.app, get("/api/chat?streamId=gone&offset=0")).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body_string(response).await.contains("Stream is already done"));
}

#[tokio::test]
async fn test_invalid_chat_request_is_rejected() {
    let t = setup_test_app(hello_world());
    let mut body = chat_body("stream-3");
    body["model"] = json!("");
    let response = send(&t.app, post_json("/api/chat", &body)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(t
        .store
        .get(&MessageId::from("resp-1"))
        .await
        .ok()
        .flatten()
        .is_none());
}

#[tokio::test]
async fn test_cancel_of_unknown_stream_is_not_found() {
    let t = setup_test_app(Vec::new());
    let response = send(&t.app, post_json("/api/chat/nope/cancel", &json!({}))).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_message_is_not_found() {
    let t = setup_test_app(Vec::new());
    let response = send(&t.app, get("/api/messages/ghost")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

async fn assistant_record(t: &TestApp) -> Message {
    match t.store.get(&MessageId::from("resp-1")).await {
        Ok(Some(m)) => m,
        other => panic!("assistant missing: {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_retried_post_leaves_the_finished_answer_intact() {
    let t = setup_test_app(hello_world());
    let first = send(&t.app, post_json("/api/chat", &chat_body("stream-4"))).await;
    assert_eq!(first.status(), StatusCode::OK);
    let _ = body_string(first).await;

    let retry = send(&t.app, post_json("/api/chat", &chat_body("stream-4"))).await;
    assert_eq!(retry.status(), StatusCode::CONFLICT);

    let assistant = assistant_record(&t).await;
    assert_eq!(assistant.status, MessageStatus::Done);
    assert_eq!(assistant.text(), "Hello world");
}

#[tokio::test]
async fn test_finished_answer_is_replaced_only_by_a_regeneration() {
    let t = setup_test_app(hello_world());
    let first = send(&t.app, post_json("/api/chat", &chat_body("stream-5"))).await;
    let _ = body_string(first).await;

    let fresh = send(&t.app, post_json("/api/chat", &chat_body("stream-6"))).await;
    assert_eq!(fresh.status(), StatusCode::CONFLICT);

    let mut body = chat_body("stream-7");
    body["isRegeneration"] = json!(true);
    let regenerated = send(&t.app, post_json("/api/chat", &body)).await;
    assert_eq!(regenerated.status(), StatusCode::OK);
    assert_eq!(
        regenerated
            .headers()
            .get("x-stream-id")
            .and_then(|v| v.to_str().ok()),
        Some("stream-7")
    );
    let _ = body_string(regenerated).await;

    let assistant = assistant_record(&t).await;
    assert_eq!(assistant.status, MessageStatus::Done);
    assert_eq!(assistant.text(), "Hello world");
    assert_eq!(assistant.resumable_stream_id, None);
}
