//! Reconnecting client for the chat endpoints.
//!
//! The HTTP read loop feeds a [`StreamParser`] and, through it, a shared
//! [`Reconciler`]. A second task follows the persisted record over SSE and
//! asks the reconciler whether the streamed state can be dropped. A dropped
//! connection is resumed from the byte offset already consumed.

use crate::constants::CANCELLED_FINISH_REASON;
use crate::ingress::ChatRequest;
use crate::parser::{ParseError, StreamParser};
use crate::reconciler::{Reconciler, ReconcilerConfig, StreamPhase};
use crate::types::{ChatwireError, Message, MessageId, Result, StreamId};
use crate::wire::WireEvent;
use futures_util::{StreamExt, TryStreamExt};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientOutcome {
    Finished { finish_reason: Option<String> },
    /// Cancelled by us, or cut short by the server.
    Cancelled,
    /// The server had already discarded the stream when we tried to resume.
    AlreadyDone,
}

#[derive(Debug, Clone)]
pub struct ChatTranscript {
    pub outcome: ClientOutcome,
    pub text: String,
    pub reasoning: String,
    pub resumes: u32,
    /// Last persisted record seen on the watch channel.
    pub persisted: Option<Message>,
    /// The streamed view converged with the persisted record.
    pub reconciled: bool,
}

fn lock(reconciler: &Mutex<Reconciler>) -> MutexGuard<'_, Reconciler> {
    match reconciler.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Clone)]
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    reconciler: Arc<Mutex<Reconciler>>,
    max_resumes: u32,
    settle_timeout: Duration,
}

impl ChatClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self::with_config(http, base_url, ReconcilerConfig::default())
    }

    pub fn with_config(
        http: reqwest::Client,
        base_url: impl Into<String>,
        config: ReconcilerConfig,
    ) -> Self {
        let settle_timeout = config
            .force_after
            .map(|d| d + Duration::from_secs(5))
            .unwrap_or(Duration::from_secs(35));
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            reconciler: Arc::new(Mutex::new(Reconciler::new(config))),
            max_resumes: 5,
            settle_timeout,
        }
    }

    pub fn reconciler(&self) -> Arc<Mutex<Reconciler>> {
        self.reconciler.clone()
    }

    /// Sends `request`, follows the live stream and the persisted record
    /// together, and returns once the stream ended and the record settled.
    pub async fn chat<F>(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        on_event: F,
    ) -> Result<ChatTranscript>
    where
        F: FnMut(&WireEvent),
    {
        lock(&self.reconciler).begin(request.response_message_id.clone());

        let watch_cancel = cancel.child_token();
        let watcher = {
            let client = self.clone();
            let message_id = request.response_message_id.clone();
            let token = watch_cancel.clone();
            tokio::spawn(async move { client.watch(&message_id, &token).await })
        };

        let streamed = self.send(request, cancel, on_event).await;
        let finished = matches!(streamed, Ok((ClientOutcome::Finished { .. }, _, _)));
        let mut latest = None;
        if finished {
            // The record may have settled before the last bytes were read.
            match self.fetch_message(&request.response_message_id).await {
                Ok(Some(message)) => {
                    lock(&self.reconciler).observe(Some(&message));
                    latest = Some(message);
                }
                Ok(None) => {}
                Err(e) => tracing::debug!("Post-stream fetch failed: {}", e.inner),
            }
        }
        if !finished || lock(&self.reconciler).is_finished() {
            watch_cancel.cancel();
        }

        let persisted = match tokio::time::timeout(self.settle_timeout, watcher).await {
            Ok(Ok(Ok(watched))) => newest(watched, latest),
            Ok(Ok(Err(e))) => {
                tracing::warn!("[💾 -> 🖥️ ] Watch failed: {}", e.inner);
                latest
            }
            Ok(Err(e)) => {
                tracing::error!("[💾 -> 🖥️ ] Watch task failed: {}", e);
                latest
            }
            Err(_) => {
                watch_cancel.cancel();
                tracing::warn!(
                    "[💾 -> 🖥️ ] Persisted record did not settle in {:?}",
                    self.settle_timeout
                );
                latest
            }
        };

        let (outcome, parser, resumes) = streamed?;
        let reconciled = lock(&self.reconciler).phase() == StreamPhase::Reconciled;
        Ok(ChatTranscript {
            outcome,
            text: parser.text().to_string(),
            reasoning: parser.reasoning().to_string(),
            resumes,
            persisted,
            reconciled,
        })
    }

    /// The HTTP half: POST, parse, resume on transport errors.
    async fn send<F>(
        &self,
        request: &ChatRequest,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(ClientOutcome, StreamParser, u32)>
    where
        F: FnMut(&WireEvent),
    {
        let response = self
            .http
            .post(format!("{}/api/chat", self.base_url))
            .json(request)
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let reconciler = self.reconciler.clone();
        let mut apply = |event: WireEvent| {
            lock(&reconciler).apply(&event);
            on_event(&event);
        };

        let mut parser = StreamParser::new();
        let mut body = response.bytes_stream();
        let mut resumes = 0;
        loop {
            match parser.parse(body, cancel, &mut apply).await {
                Ok(()) if parser.finish_reason() == Some(CANCELLED_FINISH_REASON) => {
                    tracing::info!(
                        "[🌐 -> 🖥️ ] Server cancelled stream {}",
                        request.stream_id.short()
                    );
                    lock(&self.reconciler).abort();
                    return Ok((ClientOutcome::Cancelled, parser, resumes));
                }
                Ok(()) => {
                    let finish_reason = parser.finish_reason().map(str::to_string);
                    return Ok((ClientOutcome::Finished { finish_reason }, parser, resumes));
                }
                Err(ParseError::Cancelled) => {
                    lock(&self.reconciler).abort();
                    self.cancel(&request.stream_id).await;
                    return Ok((ClientOutcome::Cancelled, parser, resumes));
                }
                Err(ParseError::Transport(msg)) => {
                    resumes += 1;
                    if resumes > self.max_resumes {
                        return Err(ChatwireError::internal(format!(
                            "gave up after {} resumes: {}",
                            self.max_resumes, msg
                        ))
                        .into());
                    }
                    tracing::info!(
                        "[🌐 -> 🖥️ ] Resuming stream {} from byte {} (attempt {})",
                        request.stream_id.short(),
                        parser.bytes_consumed(),
                        resumes
                    );
                    match self.resume(&request.stream_id, parser.bytes_consumed()).await? {
                        Some(response) => body = response.bytes_stream(),
                        None => return Ok((ClientOutcome::AlreadyDone, parser, resumes)),
                    }
                }
            }
        }
    }

    /// `GET /api/chat` from `offset`. `None` when the stream is already done.
    pub async fn resume(
        &self,
        stream_id: &StreamId,
        offset: usize,
    ) -> Result<Option<reqwest::Response>> {
        let response = self
            .http
            .get(format!("{}/api/chat", self.base_url))
            .query(&[("streamId", stream_id.as_str()), ("offset", &offset.to_string())])
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::UNPROCESSABLE_ENTITY {
            return Ok(None);
        }
        Ok(Some(ensure_success(response).await?))
    }

    pub async fn fetch_message(&self, message_id: &MessageId) -> Result<Option<Message>> {
        let response = self
            .http
            .get(format!("{}/api/messages/{}", self.base_url, message_id))
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        Ok(Some(response.json::<Message>().await?))
    }

    pub async fn cancel(&self, stream_id: &StreamId) {
        let url = format!("{}/api/chat/{}/cancel", self.base_url, stream_id);
        match self.http.post(url).send().await {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => tracing::debug!("Cancel for {} returned {}", stream_id.short(), r.status()),
            Err(e) => tracing::warn!("Cancel for {} failed: {}", stream_id.short(), e),
        }
    }

    /// Follows the persisted record until the reconciler lets go of it.
    /// Returns the last record seen.
    pub async fn watch(
        &self,
        message_id: &MessageId,
        cancel: &CancellationToken,
    ) -> Result<Option<Message>> {
        let response = self
            .http
            .get(format!("{}/api/messages/{}/watch", self.base_url, message_id))
            .send()
            .await?;
        let response = ensure_success(response).await?;

        let reader = StreamReader::new(
            response
                .bytes_stream()
                .map_err(std::io::Error::other),
        );
        let mut lines = FramedRead::new(reader, LinesCodec::new());
        let mut last = None;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(last),
                line = lines.next() => line,
            };
            let line = match line {
                Some(Ok(l)) => l,
                Some(Err(e)) => {
                    tracing::warn!("[💾 -> 🖥️ ] Watch stream broke: {}", e);
                    return Ok(last);
                }
                None => return Ok(last),
            };
            let data = match line.strip_prefix("data:") {
                Some(d) => d.trim_start(),
                None => continue,
            };
            let message: Message = match serde_json::from_str(data) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!("[💾 -> 🖥️ ] Skipping undecodable record: {}", e);
                    continue;
                }
            };
            let done = {
                let mut reconciler = lock(&self.reconciler);
                reconciler.observe(Some(&message));
                reconciler.is_finished()
            };
            last = Some(message);
            if done {
                return Ok(last);
            }
        }
    }
}

fn newest(a: Option<Message>, b: Option<Message>) -> Option<Message> {
    match (a, b) {
        (Some(a), Some(b)) if b.updated_at >= a.updated_at => Some(b),
        (Some(a), _) => Some(a),
        (None, b) => b,
    }
}

async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let status = axum::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(axum::http::StatusCode::BAD_GATEWAY);
    Err(ChatwireError::Upstream(status, body).into())
}
