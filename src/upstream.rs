//! OpenAI-compatible upstream: streamed chat completions mapped onto
//! [`ProviderEvent`]s, plus execution of the `image_gen` tool.

use crate::constants::{IMAGE_GENERATION_MODEL, IMAGE_GEN_TOOL, MAX_UPSTREAM_LINE_BYTES};
use crate::hardening::RetryPolicy;
use crate::provider::{
    GenerationRequest, ImagePayload, ModelProvider, ProviderContent, ProviderEvent,
    ProviderStream, ToolOutput,
};
use crate::tag_extract::{Segment, ThinkTagSplitter};
use crate::types::{ChatwireError, Result, SourceRef, ToolCallId};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
}

#[derive(Clone)]
pub struct OpenAiCompatProvider {
    client: reqwest::Client,
    config: UpstreamConfig,
    retry: RetryPolicy,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    error: Option<UpstreamErrorBody>,
}

#[derive(Debug, Deserialize)]
struct UpstreamErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallChunk>>,
    #[serde(default)]
    annotations: Option<Vec<Annotation>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallChunk {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<FunctionChunk>,
}

#[derive(Debug, Deserialize)]
struct FunctionChunk {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Annotation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url_citation: Option<UrlCitation>,
}

#[derive(Debug, Deserialize)]
struct UrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default)]
struct ToolCallState {
    id: String,
    name: String,
    arguments: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalizedCall {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub args: Value,
}

/// Stateful translation of upstream chunks into provider events.
#[derive(Debug, Default)]
pub struct ChunkMapper {
    think: ThinkTagSplitter,
    tool_index_map: BTreeMap<u32, ToolCallState>,
    seen_sources: HashSet<String>,
    finish_reason: Option<String>,
    model: Option<String>,
    upstream_id: Option<String>,
    usage: Option<Value>,
}

impl ChunkMapper {
    fn map(&mut self, chunk: ChatChunk) -> Vec<ProviderEvent> {
        let mut events = Vec::new();
        if chunk.model.is_some() {
            self.model = chunk.model;
        }
        if chunk.id.is_some() {
            self.upstream_id = chunk.id;
        }
        if chunk.usage.is_some() {
            self.usage = chunk.usage;
        }

        for choice in chunk.choices {
            let delta = choice.delta;
            if let Some(reasoning) = delta.reasoning.filter(|r| !r.is_empty()) {
                events.push(ProviderEvent::ReasoningDelta(reasoning));
            }
            if let Some(content) = delta.content.filter(|c| !c.is_empty()) {
                for segment in self.think.push(&content) {
                    events.push(segment_event(segment));
                }
            }
            for call in delta.tool_calls.unwrap_or_default() {
                self.map_tool_call(call, &mut events);
            }
            for annotation in delta.annotations.unwrap_or_default() {
                if annotation.kind != "url_citation" {
                    continue;
                }
                if let Some(citation) = annotation.url_citation {
                    if self.seen_sources.insert(citation.url.clone()) {
                        events.push(ProviderEvent::Source(SourceRef {
                            id: format!("src_{}", self.seen_sources.len()),
                            url: citation.url,
                            title: citation.title,
                        }));
                    }
                }
            }
            if choice.finish_reason.is_some() {
                self.finish_reason = choice.finish_reason;
            }
        }
        events
    }

    fn map_tool_call(&mut self, call: ToolCallChunk, events: &mut Vec<ProviderEvent>) {
        let state = self.tool_index_map.entry(call.index).or_default();
        let is_new = state.id.is_empty();
        if let Some(id) = call.id {
            if state.id.is_empty() {
                state.id = id;
            }
        }
        let (name, arguments) = match call.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        if let Some(name) = name {
            if state.name.is_empty() {
                state.name = name;
            }
        }
        if state.id.is_empty() {
            // Some upstreams omit ids entirely; index keeps calls apart.
            state.id = format!("call_{}", call.index);
        }
        if is_new {
            events.push(ProviderEvent::ToolCallStart {
                tool_call_id: ToolCallId(state.id.clone()),
                tool_name: state.name.clone(),
            });
        }
        if let Some(arguments) = arguments.filter(|a| !a.is_empty()) {
            state.arguments.push_str(&arguments);
            events.push(ProviderEvent::ToolCallDelta {
                tool_call_id: ToolCallId(state.id.clone()),
                tool_name: state.name.clone(),
                args_delta: arguments,
            });
        }
    }

    /// Flushes held-back text and finalizes every tool call seen.
    fn finish(&mut self) -> (Vec<ProviderEvent>, Vec<FinalizedCall>) {
        let mut events: Vec<ProviderEvent> =
            self.think.finish().into_iter().map(segment_event).collect();
        let mut calls = Vec::new();
        for (_, state) in std::mem::take(&mut self.tool_index_map) {
            let args = match serde_json::from_str::<Value>(&state.arguments) {
                Ok(v) => v,
                Err(_) if state.arguments.trim().is_empty() => json!({}),
                Err(e) => {
                    tracing::warn!(
                        "[☁️  -> ⚙️ ] Tool call {} has unparseable arguments: {}",
                        state.id,
                        e
                    );
                    Value::String(state.arguments.clone())
                }
            };
            let call = FinalizedCall {
                tool_call_id: ToolCallId(state.id),
                tool_name: state.name,
                args,
            };
            events.push(ProviderEvent::ToolCall {
                tool_call_id: call.tool_call_id.clone(),
                tool_name: call.tool_name.clone(),
                args: call.args.clone(),
            });
            calls.push(call);
        }
        (events, calls)
    }

    fn metadata(&self) -> Value {
        json!({
            "model": self.model,
            "upstreamId": self.upstream_id,
            "usage": self.usage,
            "finishReason": self.finish_reason,
        })
    }
}

fn segment_event(segment: Segment) -> ProviderEvent {
    match segment {
        Segment::Text(t) => ProviderEvent::TextDelta(t),
        Segment::Reasoning(r) => ProviderEvent::ReasoningDelta(r),
    }
}

fn content_json(content: &[ProviderContent]) -> Value {
    let parts: Vec<Value> = content
        .iter()
        .map(|c| match c {
            ProviderContent::Text(text) => json!({ "type": "text", "text": text }),
            ProviderContent::ImageUrl(url) => {
                json!({ "type": "image_url", "image_url": { "url": url } })
            }
            ProviderContent::File {
                filename,
                mime_type,
                data,
            } => json!({
                "type": "file",
                "file": {
                    "filename": filename,
                    "file_data": format!("data:{};base64,{}", mime_type, data),
                }
            }),
        })
        .collect();
    Value::Array(parts)
}

fn image_gen_tool_schema() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": IMAGE_GEN_TOOL,
            "description": "Generate an image based on a prompt",
            "parameters": {
                "type": "object",
                "properties": {
                    "prompt": {
                        "type": "string",
                        "description": "The prompt to generate an image from"
                    }
                },
                "required": ["prompt"]
            }
        }
    })
}

/// Prompt from argument text accumulated out of streamed deltas. A partial
/// or truncated payload yields `None`.
pub fn prompt_from_fragments(raw: &str) -> Option<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(parsed @ Value::Object(_)) => resolve_prompt(&parsed),
        _ => None,
    }
}

/// Picks the image prompt out of finalized arguments.
pub fn resolve_prompt(args: &Value) -> Option<String> {
    match args {
        Value::Object(map) => map
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string),
        Value::String(raw) => match serde_json::from_str::<Value>(raw) {
            Ok(parsed) => resolve_prompt(&parsed),
            Err(_) if !raw.trim().is_empty() => Some(raw.clone()),
            Err(_) => None,
        },
        _ => None,
    }
}

impl OpenAiCompatProvider {
    pub fn new(client: reqwest::Client, config: UpstreamConfig, retry: RetryPolicy) -> Self {
        Self {
            client,
            config,
            retry,
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    pub fn build_body(&self, request: &GenerationRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role.as_str(), "content": content_json(&m.content) }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": true,
            "stream_options": { "include_usage": true },
            "user": request.user,
        });
        if let Some(effort) = &request.params.reasoning_effort {
            body["reasoning"] = json!({ "effort": effort });
        }
        if request.params.include_search {
            body["plugins"] = json!([{ "id": "web" }]);
        }
        if request.params.include_image_generation {
            body["tools"] = json!([image_gen_tool_schema()]);
            body["tool_choice"] = json!("auto");
        }
        body
    }

    async fn open(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.endpoint("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = match response.text().await {
                Ok(t) => t,
                Err(_) => "Unknown error (failed to read response text)".to_string(),
            };
            return Err(ChatwireError::Upstream(status, err_body).into());
        }
        Ok(response)
    }

    pub async fn generate_images(&self, prompt: &str, user: &str) -> Result<Vec<ImagePayload>> {
        #[derive(Deserialize)]
        struct ImageResponse {
            data: Vec<ImageDatum>,
        }
        #[derive(Deserialize)]
        struct ImageDatum {
            #[serde(default)]
            b64_json: Option<String>,
        }

        let body = json!({
            "model": IMAGE_GENERATION_MODEL,
            "prompt": prompt,
            "n": 1,
            "user": user,
        });
        let response = self
            .client
            .post(self.endpoint("images/generations"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ChatwireError::Upstream(status, text).into());
        }
        let parsed: ImageResponse = response.json().await?;
        Ok(parsed
            .data
            .into_iter()
            .filter_map(|d| d.b64_json)
            .map(|base64| ImagePayload {
                base64,
                mime_type: crate::constants::GENERATED_IMAGE_MIME.to_string(),
            })
            .collect())
    }

    async fn pump(
        self,
        response: reqwest::Response,
        tx: mpsc::Sender<ProviderEvent>,
        metadata_tx: oneshot::Sender<Value>,
        cancel: CancellationToken,
        user: String,
    ) {
        let bytes_stream = response
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut lines = FramedRead::new(
            tokio_util::io::StreamReader::new(bytes_stream),
            LinesCodec::new_with_max_length(MAX_UPSTREAM_LINE_BYTES),
        );
        let mut mapper = ChunkMapper::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!("[☁️  -> ⚙️ ] Upstream read cancelled");
                    return;
                }
                next = lines.next() => next,
            };
            let line = match next {
                None => break,
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    tracing::error!("[☁️  -> ⚙️ ] Line Parse Error: {}", e);
                    let _ = tx.send(ProviderEvent::Error(e.to_string())).await;
                    return;
                }
            };
            // Comment lines (": keep-alive") and blank separators carry nothing.
            let data = match line.strip_prefix("data:") {
                Some(d) => d.trim(),
                None => continue,
            };
            if data == "[DONE]" {
                tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                break;
            }
            let chunk: ChatChunk = match serde_json::from_str(data) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!("[☁️  -> ⚙️ ] Unknown Line Event ({}): {}", e, data);
                    continue;
                }
            };
            if let Some(err) = chunk.error {
                let _ = tx.send(ProviderEvent::Error(err.message)).await;
                return;
            }
            for event in mapper.map(chunk) {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }

        let (tail, calls) = mapper.finish();
        for event in tail {
            if tx.send(event).await.is_err() {
                return;
            }
        }

        for call in calls.into_iter().filter(|c| c.tool_name == IMAGE_GEN_TOOL) {
            let prompt = match resolve_prompt(&call.args) {
                Some(p) => p,
                None => {
                    let _ = tx
                        .send(ProviderEvent::Error(format!(
                            "{} called without a prompt",
                            IMAGE_GEN_TOOL
                        )))
                        .await;
                    return;
                }
            };
            let generated = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                generated = self.generate_images(&prompt, &user) => generated,
            };
            let event = match generated {
                Ok(images) => ProviderEvent::ToolResult {
                    tool_call_id: call.tool_call_id,
                    tool_name: call.tool_name,
                    output: ToolOutput::Images(images),
                },
                Err(e) => {
                    tracing::error!("[☁️  -> ⚙️ ] Image generation failed: {}", e.inner);
                    ProviderEvent::Error(e.inner.to_string())
                }
            };
            let failed = matches!(event, ProviderEvent::Error(_));
            if tx.send(event).await.is_err() || failed {
                return;
            }
        }

        let _ = tx
            .send(ProviderEvent::Finish {
                reason: mapper.finish_reason.clone(),
            })
            .await;
        let _ = metadata_tx.send(mapper.metadata());
    }
}

#[async_trait]
impl ModelProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        let body = self.build_body(request);
        let response = self
            .retry
            .execute_with_retry("upstream connect", || self.open(&body))
            .await?;
        tracing::info!(
            "[⚙️  -> ☁️ ] Upstream stream opened for model {}",
            request.model
        );

        let (tx, rx) = mpsc::channel(crate::constants::WIRE_CHANNEL_CAPACITY);
        let (metadata_tx, metadata_rx) = oneshot::channel();
        tokio::spawn(
            self.clone()
                .pump(response, tx, metadata_tx, cancel, request.user.clone())
                .instrument(tracing::Span::current()),
        );

        Ok(ProviderStream {
            events: ReceiverStream::new(rx).boxed(),
            metadata: Some(metadata_rx),
        })
    }
}
