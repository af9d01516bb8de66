use async_trait::async_trait;
use chatwire::aggregator::{AggregateOutcome, AggregateReport, AggregatorConfig, StreamAggregator, StreamTarget};
use chatwire::hardening::RetryPolicy;
use chatwire::provider::{ImagePayload, ProviderEvent, ScriptStep, ScriptedProvider, ToolOutput};
use chatwire::store::{MemoryMessageStore, MessageStore};
use chatwire::uploader::{FsImageUploader, ImageUploader};
use chatwire::wire::WireEvent;
use chatwire::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

struct FailingUploader;

#[async_trait]
impl ImageUploader for FailingUploader {
    async fn upload(&self, _bytes: Vec<u8>, _owner: &str) -> Result<String> {
        Err(ChatwireError::Upload("bucket unavailable".to_string()).into())
    }
}

struct Harness {
    store: Arc<MemoryMessageStore>,
    aggregator: StreamAggregator,
    tasks: TaskTracker,
    _dir: tempfile::TempDir,
}

fn message_id() -> MessageId {
    MessageId::from("resp-1")
}

fn target() -> StreamTarget {
    StreamTarget {
        message_id: message_id(),
        stream_id: StreamId::from("stream-1"),
        owner: "user-1".to_string(),
    }
}

async fn harness_with(store: MemoryMessageStore, uploader: Option<Arc<dyn ImageUploader>>) -> Harness {
    let dir = match tempfile::tempdir() {
        Ok(d) => d,
        Err(e) => panic!("tempdir: {}", e),
    };
    let uploader = match uploader {
        Some(u) => u,
        None => Arc::new(FsImageUploader::new(dir.path())),
    };
    let store = Arc::new(store);
    let mut placeholder = Message::new(
        message_id(),
        ThreadId::from("thread-1"),
        Role::Assistant,
        MessageStatus::Pending,
        Vec::new(),
        "test-model",
    );
    placeholder.resumable_stream_id = Some(StreamId::from("stream-1"));
    if let Err(e) = store.upsert(placeholder).await {
        panic!("seed failed: {}", e);
    }
    let tasks = TaskTracker::new();
    let aggregator = StreamAggregator::new(
        store.clone(),
        uploader,
        tasks.clone(),
        AggregatorConfig {
            throttle: Duration::from_millis(500),
            upload_retry: RetryPolicy::new(1, 1),
        },
    );
    Harness {
        store,
        aggregator,
        tasks,
        _dir: dir,
    }
}

async fn harness() -> Harness {
    harness_with(MemoryMessageStore::new(), None).await
}

async fn run(h: &Harness, steps: Vec<ScriptStep>) -> (AggregateReport, Vec<WireEvent>) {
    let (tx, mut rx) = mpsc::channel(1024);
    let provider = ScriptedProvider::from_steps(steps).into_stream();
    let report = h
        .aggregator
        .run(target(), provider, tx, CancellationToken::new())
        .await;
    let mut wire = Vec::new();
    while let Ok(event) = rx.try_recv() {
        wire.push(event);
    }
    (report, wire)
}

async fn persisted(h: &Harness) -> Message {
    match h.store.get(&message_id()).await {
        Ok(Some(m)) => m,
        Ok(None) => panic!("message vanished"),
        Err(e) => panic!("get failed: {}", e),
    }
}

fn emit(event: ProviderEvent) -> ScriptStep {
    ScriptStep::Emit(event)
}

fn text(t: &str) -> ScriptStep {
    emit(ProviderEvent::TextDelta(t.to_string()))
}

fn tool_start(id: &str) -> ScriptStep {
    emit(ProviderEvent::ToolCallStart {
        tool_call_id: ToolCallId::from(id),
        tool_name: "image_gen".to_string(),
    })
}

fn tool_result(id: &str, images: &[&str]) -> ScriptStep {
    emit(ProviderEvent::ToolResult {
        tool_call_id: ToolCallId::from(id),
        tool_name: "image_gen".to_string(),
        output: ToolOutput::Images(
            images
                .iter()
                .map(|b| ImagePayload {
                    base64: b.to_string(),
                    mime_type: "image/png".to_string(),
                })
                .collect(),
        ),
    })
}

fn finish() -> ScriptStep {
    emit(ProviderEvent::Finish {
        reason: Some("stop".to_string()),
    })
}

#[tokio::test(start_paused = true)]
async fn persisted_text_matches_deltas_under_slow_writes() {
    let h = harness_with(MemoryMessageStore::with_write_delay(Duration::from_millis(300)), None).await;
    let mut steps = Vec::new();
    let mut expected = String::new();
    for i in 0..20 {
        let delta = format!("tok{} ", i);
        expected.push_str(&delta);
        steps.push(text(&delta));
        steps.push(ScriptStep::Pause(Duration::from_millis(50)));
    }
    steps.push(finish());

    let (report, wire) = run(&h, steps).await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);

    let message = persisted(&h).await;
    assert_eq!(message.status, MessageStatus::Done);
    assert_eq!(message.text(), expected);
    assert_eq!(message.resumable_stream_id, None);

    // One in-flight write at a time: far fewer writes than deltas.
    assert!(h.store.patch_calls() < 8, "too many writes: {}", h.store.patch_calls());

    let streamed: String = wire
        .iter()
        .filter_map(|e| match e {
            WireEvent::TextDelta(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(streamed, expected);
}

#[tokio::test]
async fn replaying_the_terminal_write_is_a_no_op() {
    let h = harness().await;
    let (report, _) = run(&h, vec![text("hello"), finish()]).await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);
    let before = persisted(&h).await;

    let replay = MessagePatch {
        parts: Some(vec![MessagePart::Text {
            text: "hello".to_string(),
        }]),
        status: Some(MessageStatus::Done),
        ..MessagePatch::default()
    };
    let outcome = h.store.patch(&message_id(), replay).await;
    assert!(matches!(outcome, Ok(PatchOutcome::IgnoredTerminal)));
    assert_eq!(persisted(&h).await, before);
}

#[tokio::test]
async fn provider_error_is_terminal_and_never_overwritten() {
    let h = harness().await;
    let (report, wire) = run(
        &h,
        vec![
            text("partial"),
            emit(ProviderEvent::Error("rate limited".to_string())),
            text("ignored"),
        ],
    )
    .await;
    assert_eq!(report.outcome, AggregateOutcome::Failed);
    assert!(wire.contains(&WireEvent::Error("rate limited".to_string())));
    assert!(!wire.iter().any(|e| matches!(e, WireEvent::Finish { .. })));

    let late_done = MessagePatch {
        status: Some(MessageStatus::Done),
        ..MessagePatch::default()
    };
    let outcome = h.store.patch(&message_id(), late_done).await;
    assert!(matches!(outcome, Ok(PatchOutcome::IgnoredTerminal)));

    let message = persisted(&h).await;
    assert_eq!(message.status, MessageStatus::Error);
    assert_eq!(message.text(), "partial");
    assert_eq!(
        message.server_error.map(|e| e.message),
        Some("rate limited".to_string())
    );
}

#[tokio::test]
async fn cancellation_keeps_partial_content_without_error() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(1024);
    let provider =
        ScriptedProvider::from_steps(vec![text("half an ans"), ScriptStep::Hang]).into_stream();

    let aggregator = h.aggregator.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { aggregator.run(target(), provider, tx, token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let report = match handle.await {
        Ok(r) => r,
        Err(e) => panic!("aggregation panicked: {}", e),
    };
    assert_eq!(report.outcome, AggregateOutcome::Cancelled);

    let message = persisted(&h).await;
    assert!(!message.status.is_terminal());
    assert!(message.text().starts_with("half an ans"));
    assert!(message.server_error.is_none());

    // The live wire ends with a finish the client can tell apart from a normal one.
    let mut last = None;
    while let Ok(event) = rx.try_recv() {
        last = Some(event);
    }
    assert_eq!(
        last,
        Some(WireEvent::Finish {
            finish_reason: Some("cancelled".to_string())
        })
    );
}

#[tokio::test]
async fn cancelled_stream_leaves_a_regenerated_record_alone() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1024);
    let provider =
        ScriptedProvider::from_steps(vec![text("old answer"), ScriptStep::Hang]).into_stream();

    let aggregator = h.aggregator.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { aggregator.run(target(), provider, tx, token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(persisted(&h).await.text(), "old answer");

    // A regeneration takes the message over, then the old stream is cancelled.
    let mut regenerated = Message::new(
        message_id(),
        ThreadId::from("thread-1"),
        Role::Assistant,
        MessageStatus::Pending,
        Vec::new(),
        "test-model",
    );
    regenerated.resumable_stream_id = Some(StreamId::from("stream-2"));
    if let Err(e) = h.store.upsert(regenerated).await {
        panic!("regeneration upsert failed: {}", e);
    }
    cancel.cancel();

    let report = match handle.await {
        Ok(r) => r,
        Err(e) => panic!("aggregation panicked: {}", e),
    };
    assert_eq!(report.outcome, AggregateOutcome::Cancelled);

    let message = persisted(&h).await;
    assert_eq!(message.status, MessageStatus::Pending);
    assert_eq!(message.text(), "");
    assert_eq!(message.resumable_stream_id, Some(StreamId::from("stream-2")));
}

#[tokio::test]
async fn loading_placeholder_is_persisted_before_any_result() {
    let h = harness().await;
    let cancel = CancellationToken::new();
    let (tx, _rx) = mpsc::channel(1024);
    let provider = ScriptedProvider::from_steps(vec![
        text("Sure."),
        tool_start("call-1"),
        ScriptStep::Hang,
    ])
    .into_stream();

    let aggregator = h.aggregator.clone();
    let token = cancel.clone();
    let handle = tokio::spawn(async move { aggregator.run(target(), provider, tx, token).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let message = persisted(&h).await;
    let images = message.generated_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].file_key, "loading-call-1");
    assert!(images[0].is_loading);
    assert!(message.text().ends_with("🖼️ Image Generation"));
    assert_eq!(message.status, MessageStatus::Streaming);

    cancel.cancel();
    let _ = handle.await;
}

#[tokio::test]
async fn late_attach_takes_prompt_from_the_final_arguments() {
    let h = harness().await;
    let (report, wire) = run(
        &h,
        vec![
            text("Here you go."),
            // Attached mid-call: only the tail of the argument text was seen.
            emit(ProviderEvent::ToolCallDelta {
                tool_call_id: ToolCallId::from("call-9"),
                tool_name: "image_gen".to_string(),
                args_delta: r#"mpt":"a cat"}"#.to_string(),
            }),
            emit(ProviderEvent::ToolCall {
                tool_call_id: ToolCallId::from("call-9"),
                tool_name: "image_gen".to_string(),
                args: serde_json::json!({"prompt": "a cat"}),
            }),
            tool_result("call-9", &["AQID"]),
            finish(),
        ],
    )
    .await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);

    let message = persisted(&h).await;
    let images = message.generated_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].alt, "a cat");
    assert!(!images[0].is_loading);
    assert!(message.text().ends_with(chatwire::constants::IMAGE_GENERATION_MARKER));
    assert!(wire.iter().any(|e| matches!(
        e,
        WireEvent::GeneratedImageStream(img) if img.alt == "a cat"
    )));
}

#[tokio::test]
async fn first_image_replaces_placeholder_second_is_appended() {
    let h = harness().await;
    let (report, wire) = run(
        &h,
        vec![
            tool_start("call-1"),
            emit(ProviderEvent::ToolCallDelta {
                tool_call_id: ToolCallId::from("call-1"),
                tool_name: "image_gen".to_string(),
                args_delta: r#"{"prompt":"a red fox"}"#.to_string(),
            }),
            emit(ProviderEvent::ToolCall {
                tool_call_id: ToolCallId::from("call-1"),
                tool_name: "image_gen".to_string(),
                args: serde_json::json!({"prompt": "a red fox"}),
            }),
            tool_result("call-1", &["AQID", "BAUG"]),
            finish(),
        ],
    )
    .await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);

    let images = persisted(&h).await.generated_images();
    assert_eq!(images.len(), 2);
    assert_ne!(images[0].file_key, images[1].file_key);
    assert!(images.iter().all(|i| !i.is_loading));
    assert!(images.iter().all(|i| i.alt == "a red fox"));
    assert!(images[0].file_key.starts_with("generated-images/user-1/"));

    let loading = wire
        .iter()
        .filter(|e| matches!(e, WireEvent::GeneratedImageLoading(_)))
        .count();
    let streamed = wire
        .iter()
        .filter(|e| matches!(e, WireEvent::GeneratedImageStream(_)))
        .count();
    assert_eq!((loading, streamed), (1, 2));
}

#[tokio::test]
async fn each_result_replaces_its_own_placeholder_once() {
    let h = harness().await;
    let (_, _) = run(
        &h,
        vec![
            tool_start("call-1"),
            tool_start("call-2"),
            tool_result("call-2", &["BAUG"]),
            tool_result("call-1", &["AQID"]),
            tool_result("call-1", &["BwgJ"]),
            finish(),
        ],
    )
    .await;

    let images = persisted(&h).await.generated_images();
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|i| !i.is_loading));
    assert_ne!(images[0].file_key, images[1].file_key);
}

#[tokio::test]
async fn failed_upload_batch_leaves_a_failed_slot() {
    let h = harness_with(MemoryMessageStore::new(), Some(Arc::new(FailingUploader))).await;
    let (report, wire) = run(&h, vec![tool_start("call-1"), tool_result("call-1", &["AQID"]), finish()]).await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);
    assert!(!wire
        .iter()
        .any(|e| matches!(e, WireEvent::GeneratedImageStream(_))));

    let message = persisted(&h).await;
    assert_eq!(message.status, MessageStatus::Done);
    let images = message.generated_images();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].file_key, "failed-call-1");
    assert!(!images[0].is_loading);
}

#[tokio::test]
async fn provider_metadata_lands_after_done() {
    let h = harness().await;
    let (tx, mut rx) = mpsc::channel(1024);
    let provider = ScriptedProvider::new(vec![
        ProviderEvent::TextDelta("ok".to_string()),
        ProviderEvent::Finish { reason: None },
    ])
    .with_metadata(serde_json::json!({"usage": {"total_tokens": 12}}))
    .into_stream();

    let report = h
        .aggregator
        .run(target(), provider, tx, CancellationToken::new())
        .await;
    assert_eq!(report.outcome, AggregateOutcome::Completed);

    h.tasks.close();
    h.tasks.wait().await;

    let message = persisted(&h).await;
    assert_eq!(message.status, MessageStatus::Done);
    assert_eq!(
        message.provider_metadata,
        Some(serde_json::json!({"usage": {"total_tokens": 12}}))
    );

    let mut saw_metadata = false;
    while let Ok(event) = rx.try_recv() {
        if matches!(event, WireEvent::ProviderMetadata(_)) {
            saw_metadata = true;
        }
    }
    assert!(saw_metadata);
}
