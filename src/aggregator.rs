//! Server-side stream aggregation.
//!
//! One [`StreamAggregator::run`] call consumes one provider response in order
//! and fans it out twice: every user-visible event goes to the live wire
//! immediately, and the accumulated message is written to the store, throttled
//! to one write per interval, with immediate writes when an image placeholder
//! appears or resolves and a single terminal write at the end.
//!
//! Cancellation is checked at every suspension point. A cancelled stream never
//! writes a terminal status; its partial content is flushed once as
//! `streaming`.

use crate::constants::{
    CANCELLED_FINISH_REASON, DEFAULT_IMAGE_ALT, IMAGE_GENERATION_MARKER, IMAGE_GEN_TOOL,
};
use crate::hardening::RetryPolicy;
use crate::logging::StreamMetric;
use crate::provider::{ImagePayload, ProviderEvent, ProviderStream, ToolOutput};
use crate::store::MessageStore;
use crate::types::{
    ChatwireError, GeneratedImageRef, MessageId, MessagePart, MessagePatch, MessageStatus,
    PatchOutcome, Result, ServerError, ServerErrorKind, SourceRef, StreamId, ToolCallId,
};
use crate::uploader::ImageUploader;
use crate::upstream::{prompt_from_fragments, resolve_prompt};
use crate::wire::{LoadingImage, StreamedImage, WireEvent};
use base64::Engine;
use futures_util::future::join_all;
use futures_util::{FutureExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

#[derive(Debug, Clone, Copy)]
pub struct AggregatorConfig {
    pub throttle: Duration,
    pub upload_retry: RetryPolicy,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(crate::constants::DEFAULT_THROTTLE_MS),
            upload_retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StreamTarget {
    pub message_id: MessageId,
    pub stream_id: StreamId,
    /// Owner key under which generated images are stored.
    pub owner: String,
}

/// Everything accumulated for one message during one stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Accumulation {
    pub content: String,
    pub reasoning: String,
    pub sources: Vec<SourceRef>,
    pub images: Vec<GeneratedImageRef>,
}

impl Accumulation {
    pub fn to_parts(&self) -> Vec<MessagePart> {
        let mut parts = Vec::new();
        if !self.content.is_empty() {
            parts.push(MessagePart::Text {
                text: self.content.clone(),
            });
        }
        if !self.reasoning.is_empty() {
            parts.push(MessagePart::Reasoning {
                reasoning: self.reasoning.clone(),
            });
        }
        parts.extend(self.sources.iter().cloned().map(|source| MessagePart::Source { source }));
        parts.extend(self.images.iter().cloned().map(MessagePart::from));
        parts
    }

    /// Swaps the placeholder for `tool_call_id` (else the oldest loading one)
    /// with `resolved[0]` and appends the rest.
    fn resolve_images(&mut self, tool_call_id: &ToolCallId, resolved: Vec<GeneratedImageRef>) {
        let loading_key = tool_call_id.loading_key();
        let slot = self
            .images
            .iter()
            .position(|i| i.file_key == loading_key)
            .or_else(|| self.images.iter().position(|i| i.is_loading));

        let mut resolved = resolved.into_iter();
        match (slot, resolved.next()) {
            (Some(idx), Some(first)) => self.images[idx] = first,
            (None, Some(first)) => self.images.push(first),
            (Some(idx), None) => {
                // Nothing uploaded: keep the slot visible but stop it spinning.
                if self.images[idx].file_key == loading_key {
                    self.images[idx].file_key = tool_call_id.failed_key();
                    self.images[idx].is_loading = false;
                }
            }
            (None, None) => {}
        }
        for image in resolved {
            if !self.images.iter().any(|i| i.file_key == image.file_key) {
                self.images.push(image);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateOutcome {
    Completed,
    Failed,
    Cancelled,
}

impl AggregateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateOutcome::Completed => "completed",
            AggregateOutcome::Failed => "failed",
            AggregateOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregateReport {
    pub outcome: AggregateOutcome,
    pub snapshot: Accumulation,
    pub finish_reason: Option<String>,
    pub persist_writes: usize,
}

#[derive(Debug, Default)]
struct PendingToolCall {
    args: String,
    started: bool,
}

enum Step {
    Continue,
    Failed,
    Cancelled,
}

/// Single-flight throttle. The in-flight write's handle is the busy flag; it
/// resolves to the completion time of a successful write.
struct WriteThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
    in_flight: Option<JoinHandle<Option<Instant>>>,
}

impl WriteThrottle {
    fn is_due(&self, now: Instant) -> bool {
        match self.last_sent {
            Some(t) => now.duration_since(t) >= self.interval,
            None => true,
        }
    }

    /// Takes a finished handle without waiting.
    fn reap(&mut self) {
        let finished = match &self.in_flight {
            Some(handle) => handle.is_finished(),
            None => false,
        };
        if !finished {
            return;
        }
        if let Some(handle) = self.in_flight.take() {
            if let Some(Ok(Some(done_at))) = handle.now_or_never() {
                self.last_sent = Some(done_at);
            }
        }
    }

    async fn join(&mut self) {
        if let Some(handle) = self.in_flight.take() {
            match handle.await {
                Ok(Some(done_at)) => self.last_sent = Some(done_at),
                Ok(None) => {}
                Err(e) => tracing::error!("[⚙️  -> 💾] Throttled write task failed: {}", e),
            }
        }
    }
}

#[derive(Clone)]
pub struct StreamAggregator {
    store: Arc<dyn MessageStore>,
    uploader: Arc<dyn ImageUploader>,
    tasks: TaskTracker,
    config: AggregatorConfig,
}

impl StreamAggregator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        uploader: Arc<dyn ImageUploader>,
        tasks: TaskTracker,
        config: AggregatorConfig,
    ) -> Self {
        Self {
            store,
            uploader,
            tasks,
            config,
        }
    }

    /// Consumes `provider` to its end (or until `cancel` fires), forwarding
    /// wire events to `wire` and persisting into `target.message_id`.
    pub async fn run(
        &self,
        target: StreamTarget,
        provider: ProviderStream,
        wire: mpsc::Sender<WireEvent>,
        cancel: CancellationToken,
    ) -> AggregateReport {
        let ProviderStream {
            mut events,
            metadata,
        } = provider;
        let mut session = StreamSession::new(self, target, wire, cancel.clone());

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = events.next() => Some(next),
            };
            let event = match next {
                None => break AggregateOutcome::Cancelled,
                Some(None) => break AggregateOutcome::Completed,
                Some(Some(event)) => event,
            };
            session.metric.record_event(&event);
            match session.handle(event).await {
                Step::Continue => session.tick(),
                Step::Failed => break AggregateOutcome::Failed,
                Step::Cancelled => break AggregateOutcome::Cancelled,
            }
        };
        // Releases the upstream connection before the final writes.
        drop(events);

        let outcome = match outcome {
            AggregateOutcome::Completed => session.complete(metadata).await,
            AggregateOutcome::Cancelled => {
                tracing::info!("[⚙️  -> 💾] Stream aborted by client; flushing partial content");
                session.flush_partial().await;
                AggregateOutcome::Cancelled
            }
            AggregateOutcome::Failed => AggregateOutcome::Failed,
        };
        if outcome == AggregateOutcome::Cancelled {
            session
                .emit(WireEvent::Finish {
                    finish_reason: Some(CANCELLED_FINISH_REASON.to_string()),
                })
                .await;
        }

        session.metric.log_summary(outcome.as_str());
        AggregateReport {
            outcome,
            snapshot: session.acc.clone(),
            finish_reason: session.finish_reason.clone(),
            persist_writes: session.metric.persist_writes,
        }
    }

    async fn upload_one(
        &self,
        payload: ImagePayload,
        owner: &str,
    ) -> Result<(String, String)> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(payload.base64.as_bytes())
            .map_err(|e| ChatwireError::Upload(format!("invalid base64 image: {}", e)))?;
        let key = self
            .config
            .upload_retry
            .execute_with_retry("image upload", || self.uploader.upload(bytes.clone(), owner))
            .await?;
        Ok((key, payload.base64))
    }
}

struct StreamSession<'a> {
    agg: &'a StreamAggregator,
    target: StreamTarget,
    wire: mpsc::Sender<WireEvent>,
    cancel: CancellationToken,
    acc: Accumulation,
    pending: HashMap<ToolCallId, PendingToolCall>,
    resolved_calls: HashSet<ToolCallId>,
    throttle: WriteThrottle,
    metric: StreamMetric,
    finish_reason: Option<String>,
    wire_closed: bool,
}

impl<'a> StreamSession<'a> {
    fn new(
        agg: &'a StreamAggregator,
        target: StreamTarget,
        wire: mpsc::Sender<WireEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let metric = StreamMetric::new(target.stream_id.short());
        Self {
            agg,
            target,
            wire,
            cancel,
            acc: Accumulation::default(),
            pending: HashMap::new(),
            resolved_calls: HashSet::new(),
            throttle: WriteThrottle {
                interval: agg.config.throttle,
                last_sent: None,
                in_flight: None,
            },
            metric,
            finish_reason: None,
            wire_closed: false,
        }
    }

    async fn emit(&mut self, event: WireEvent) {
        if self.wire.send(event).await.is_err() && !self.wire_closed {
            self.wire_closed = true;
            tracing::debug!("[⚙️  -> 🖥️ ] Live stream consumer gone; continuing to persist");
        }
    }

    async fn handle(&mut self, event: ProviderEvent) -> Step {
        match event {
            ProviderEvent::TextDelta(delta) => {
                self.acc.content.push_str(&delta);
                self.emit(WireEvent::TextDelta(delta)).await;
            }
            ProviderEvent::ReasoningDelta(delta) => {
                self.acc.reasoning.push_str(&delta);
                self.emit(WireEvent::ReasoningDelta(delta)).await;
            }
            ProviderEvent::Source(source) => {
                self.acc.sources.push(source.clone());
                self.emit(WireEvent::Source(source)).await;
            }
            ProviderEvent::File { mime_type, data } => {
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Ignoring provider file ({}, {} bytes)",
                    mime_type,
                    data.len()
                );
            }
            ProviderEvent::ToolCallStart {
                tool_call_id,
                tool_name,
            } => {
                if tool_name != IMAGE_GEN_TOOL {
                    tracing::debug!("[☁️  -> ⚙️ ] Untracked tool call start: {}", tool_name);
                    return Step::Continue;
                }
                return self.start_image_generation(tool_call_id).await;
            }
            ProviderEvent::ToolCallDelta {
                tool_call_id,
                tool_name,
                args_delta,
            } => {
                if tool_name == IMAGE_GEN_TOOL || self.pending.contains_key(&tool_call_id) {
                    self.pending
                        .entry(tool_call_id)
                        .or_default()
                        .args
                        .push_str(&args_delta);
                }
            }
            ProviderEvent::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => {
                if tool_name != IMAGE_GEN_TOOL {
                    return Step::Continue;
                }
                let call = self.pending.entry(tool_call_id.clone()).or_default();
                let prompt = prompt_from_fragments(&call.args).or_else(|| resolve_prompt(&args));
                let late_attach = !call.started;
                call.started = true;
                if let Some(prompt) = prompt {
                    call.args = serde_json::json!({ "prompt": prompt }).to_string();
                }
                tracing::debug!(
                    "[☁️  -> ⚙️ ] Image generation call {} finalized (late attach: {})",
                    tool_call_id.short(),
                    late_attach
                );
                if late_attach {
                    self.acc.content.push_str(IMAGE_GENERATION_MARKER);
                    self.emit(WireEvent::TextDelta(IMAGE_GENERATION_MARKER.to_string()))
                        .await;
                }
            }
            ProviderEvent::ToolResult {
                tool_call_id,
                tool_name,
                output,
            } => {
                if tool_name != IMAGE_GEN_TOOL {
                    tracing::debug!("[☁️  -> ⚙️ ] Untracked tool result: {}", tool_name);
                    return Step::Continue;
                }
                return match output {
                    ToolOutput::Images(images) => self.resolve_tool_images(tool_call_id, images).await,
                    ToolOutput::Json(value) => {
                        tracing::warn!(
                            "[☁️  -> ⚙️ ] Image generation {} returned no images: {}",
                            tool_call_id.short(),
                            value
                        );
                        self.resolve_tool_images(tool_call_id, Vec::new()).await
                    }
                };
            }
            ProviderEvent::Error(message) => {
                if self.cancel.is_cancelled() {
                    tracing::debug!("[☁️  -> ⚙️ ] Provider error after client abort: {}", message);
                    return Step::Cancelled;
                }
                self.fail(message).await;
                return Step::Failed;
            }
            ProviderEvent::Finish { reason } => {
                self.finish_reason = reason.clone();
                self.emit(WireEvent::Finish {
                    finish_reason: reason,
                })
                .await;
            }
        }
        Step::Continue
    }

    async fn start_image_generation(&mut self, tool_call_id: ToolCallId) -> Step {
        let call = self.pending.entry(tool_call_id.clone()).or_default();
        if call.started {
            return Step::Continue;
        }
        call.started = true;

        let placeholder = GeneratedImageRef::loading(&tool_call_id);
        if !self
            .acc
            .images
            .iter()
            .any(|i| i.file_key == placeholder.file_key)
        {
            self.acc.images.push(placeholder.clone());
        }
        self.acc.content.push_str(IMAGE_GENERATION_MARKER);

        tracing::info!(
            "[☁️  -> ⚙️ ] Image generation started for call {}",
            tool_call_id.short()
        );
        self.emit(WireEvent::TextDelta(IMAGE_GENERATION_MARKER.to_string()))
            .await;
        self.emit(WireEvent::GeneratedImageLoading(LoadingImage {
            file_key: placeholder.file_key,
            alt: placeholder.alt,
            is_loading: true,
            tool_call_id: Some(tool_call_id.0.clone()),
        }))
        .await;

        self.persist_now(MessageStatus::Streaming).await;
        if self.cancel.is_cancelled() {
            return Step::Cancelled;
        }
        Step::Continue
    }

    async fn resolve_tool_images(
        &mut self,
        tool_call_id: ToolCallId,
        images: Vec<ImagePayload>,
    ) -> Step {
        if !self.resolved_calls.insert(tool_call_id.clone()) {
            tracing::warn!(
                "[☁️  -> ⚙️ ] Duplicate result for call {} ignored",
                tool_call_id.short()
            );
            return Step::Continue;
        }
        let alt = self
            .pending
            .get(&tool_call_id)
            .and_then(|c| prompt_from_fragments(&c.args))
            .unwrap_or_else(|| DEFAULT_IMAGE_ALT.to_string());

        let agg = self.agg;
        let owner = self.target.owner.clone();
        let uploads = join_all(images.into_iter().map(|image| agg.upload_one(image, &owner)));
        let results = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Step::Cancelled,
            results = uploads => results,
        };

        let mut resolved = Vec::new();
        for result in results {
            match result {
                Ok((file_key, base64)) => {
                    self.metric.images_stored += 1;
                    self.emit(WireEvent::GeneratedImageStream(StreamedImage {
                        base64,
                        file_key: file_key.clone(),
                        alt: alt.clone(),
                        tool_call_id: Some(tool_call_id.0.clone()),
                    }))
                    .await;
                    resolved.push(GeneratedImageRef {
                        file_key,
                        alt: alt.clone(),
                        is_loading: false,
                    });
                }
                Err(e) => {
                    self.metric.upload_failures += 1;
                    tracing::error!(
                        "[⚙️  -> 🗄️ ] Image upload for call {} failed: {}",
                        tool_call_id.short(),
                        e.inner
                    );
                }
            }
        }

        self.acc.resolve_images(&tool_call_id, resolved);
        self.pending.remove(&tool_call_id);
        self.persist_now(MessageStatus::Streaming).await;
        if self.cancel.is_cancelled() {
            return Step::Cancelled;
        }
        Step::Continue
    }

    fn snapshot_patch(&self, status: MessageStatus) -> MessagePatch {
        let stream_id = match status {
            MessageStatus::Streaming => Some(self.target.stream_id.clone()),
            _ => None,
        };
        MessagePatch {
            parts: Some(self.acc.to_parts()),
            status: Some(status),
            resumable_stream_id: Some(stream_id),
            expected_stream_id: Some(self.target.stream_id.clone()),
            ..MessagePatch::default()
        }
    }

    /// Throttled write: fire-and-forget, at most one in flight, skipped while busy.
    fn tick(&mut self) {
        self.throttle.reap();
        let now = Instant::now();
        if !self.throttle.is_due(now) {
            return;
        }
        if self.throttle.in_flight.is_some() {
            self.metric.skipped_ticks += 1;
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }

        let store = self.agg.store.clone();
        let message_id = self.target.message_id.clone();
        let patch = self.snapshot_patch(MessageStatus::Streaming);
        let handle = tokio::spawn(
            async move {
                match store.patch(&message_id, patch).await {
                    Ok(_) => Some(Instant::now()),
                    Err(e) => {
                        tracing::warn!("[⚙️  -> 💾] Throttled write failed: {}", e.inner);
                        None
                    }
                }
            }
            .instrument(tracing::Span::current()),
        );
        self.throttle.last_sent = Some(now);
        self.throttle.in_flight = Some(handle);
        self.metric.persist_writes += 1;
    }

    async fn write(&mut self, patch: MessagePatch) -> Option<PatchOutcome> {
        self.metric.persist_writes += 1;
        match self.agg.store.patch(&self.target.message_id, patch).await {
            Ok(outcome) => {
                self.throttle.last_sent = Some(Instant::now());
                match outcome {
                    PatchOutcome::Applied => {}
                    PatchOutcome::IgnoredTerminal => tracing::debug!(
                        "[⚙️  -> 💾] Message {} already terminal; write dropped",
                        self.target.message_id.short()
                    ),
                    PatchOutcome::IgnoredSuperseded => tracing::info!(
                        "[⚙️  -> 💾] Message {} now belongs to another stream; write dropped",
                        self.target.message_id.short()
                    ),
                }
                Some(outcome)
            }
            Err(e) => {
                tracing::error!("[⚙️  -> 💾] Write failed: {}", e.inner);
                None
            }
        }
    }

    /// Immediate (non-throttled) write. Waits out any throttled write first.
    async fn persist_now(&mut self, status: MessageStatus) {
        self.throttle.join().await;
        if self.cancel.is_cancelled() {
            return;
        }
        let patch = self.snapshot_patch(status);
        self.write(patch).await;
    }

    async fn fail(&mut self, message: String) {
        tracing::error!("[☁️  -> ⚙️ ] Provider error: {}", message);
        self.throttle.join().await;
        let mut patch = self.snapshot_patch(MessageStatus::Error);
        patch.server_error = Some(ServerError {
            kind: ServerErrorKind::Provider,
            message: message.clone(),
        });
        self.write(patch).await;
        self.emit(WireEvent::Error(message)).await;
    }

    async fn complete(&mut self, metadata: Option<oneshot::Receiver<serde_json::Value>>) -> AggregateOutcome {
        self.throttle.join().await;
        if self.cancel.is_cancelled() {
            self.flush_partial().await;
            return AggregateOutcome::Cancelled;
        }
        let patch = self.snapshot_patch(MessageStatus::Done);
        self.write(patch).await;

        if let Some(metadata) = metadata {
            let store = self.agg.store.clone();
            let message_id = self.target.message_id.clone();
            let wire = self.wire.clone();
            self.agg.tasks.spawn(
                async move {
                    let value = match metadata.await {
                        Ok(v) => v,
                        Err(_) => {
                            tracing::debug!("Provider metadata never resolved");
                            return;
                        }
                    };
                    let _ = wire.send(WireEvent::ProviderMetadata(value.clone())).await;
                    if let Err(e) = store.patch(&message_id, MessagePatch::metadata(value)).await {
                        tracing::warn!("[⚙️  -> 💾] Metadata write failed: {}", e.inner);
                    }
                }
                .instrument(tracing::Span::current()),
            );
        }
        AggregateOutcome::Completed
    }

    /// The one write allowed after cancellation: partial content, non-terminal.
    async fn flush_partial(&mut self) {
        self.throttle.join().await;
        let mut patch = self.snapshot_patch(MessageStatus::Streaming);
        patch.resumable_stream_id = Some(None);
        self.write(patch).await;
    }
}
