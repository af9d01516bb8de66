use crate::types::{Result, Role, SourceRef, ToolCallId};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub base64: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutput {
    Images(Vec<ImagePayload>),
    Json(Value),
}

/// One event of a model response, in provider order.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderEvent {
    TextDelta(String),
    ReasoningDelta(String),
    Source(SourceRef),
    File {
        mime_type: String,
        data: String,
    },
    ToolCallStart {
        tool_call_id: ToolCallId,
        tool_name: String,
    },
    ToolCallDelta {
        tool_call_id: ToolCallId,
        tool_name: String,
        args_delta: String,
    },
    ToolCall {
        tool_call_id: ToolCallId,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        tool_call_id: ToolCallId,
        tool_name: String,
        output: ToolOutput,
    },
    Error(String),
    Finish {
        reason: Option<String>,
    },
}

impl ProviderEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderEvent::TextDelta(_) => "text-delta",
            ProviderEvent::ReasoningDelta(_) => "reasoning-delta",
            ProviderEvent::Source(_) => "source",
            ProviderEvent::File { .. } => "file",
            ProviderEvent::ToolCallStart { .. } => "tool-call-streaming-start",
            ProviderEvent::ToolCallDelta { .. } => "tool-call-delta",
            ProviderEvent::ToolCall { .. } => "tool-call",
            ProviderEvent::ToolResult { .. } => "tool-result",
            ProviderEvent::Error(_) => "error",
            ProviderEvent::Finish { .. } => "finish",
        }
    }
}

/// A live model response: the ordered events plus provider metadata that
/// resolves once the events are exhausted.
pub struct ProviderStream {
    pub events: BoxStream<'static, ProviderEvent>,
    pub metadata: Option<oneshot::Receiver<Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<String>,
    #[serde(default)]
    pub include_search: bool,
    #[serde(default)]
    pub include_image_generation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderContent {
    Text(String),
    ImageUrl(String),
    File {
        filename: String,
        mime_type: String,
        data: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderMessage {
    pub role: Role,
    pub content: Vec<ProviderContent>,
}

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model: String,
    pub messages: Vec<ProviderMessage>,
    pub params: ModelParams,
    /// Owner key for uploads and upstream attribution.
    pub user: String,
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<ProviderStream>;
}

#[derive(Debug, Clone)]
pub enum ScriptStep {
    Emit(ProviderEvent),
    Pause(Duration),
    /// Never yields again; the consumer has to be cancelled.
    Hang,
}

/// Replays a fixed script. Used by tests and offline demos.
#[derive(Debug, Clone, Default)]
pub struct ScriptedProvider {
    steps: Vec<ScriptStep>,
    metadata: Option<Value>,
}

impl ScriptedProvider {
    pub fn new(events: Vec<ProviderEvent>) -> Self {
        Self {
            steps: events.into_iter().map(ScriptStep::Emit).collect(),
            metadata: None,
        }
    }

    pub fn from_steps(steps: Vec<ScriptStep>) -> Self {
        Self {
            steps,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn into_stream(self) -> ProviderStream {
        let events = futures_util::stream::iter(self.steps)
            .then(|step| async move {
                match step {
                    ScriptStep::Emit(event) => Some(event),
                    ScriptStep::Pause(d) => {
                        tokio::time::sleep(d).await;
                        None
                    }
                    ScriptStep::Hang => {
                        futures_util::future::pending::<()>().await;
                        None
                    }
                }
            })
            .filter_map(futures_util::future::ready)
            .boxed();

        let metadata = self.metadata.map(|value| {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(value);
            rx
        });

        ProviderStream { events, metadata }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn stream(
        &self,
        _request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<ProviderStream> {
        Ok(self.clone().into_stream())
    }
}
