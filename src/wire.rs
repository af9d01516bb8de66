//! Line-oriented wire encoding shared by the server stream and the client parser.
//!
//! The encoder writes the compact `code:json` framing, one event per line:
//!
//! | code | event                                   |
//! |------|-----------------------------------------|
//! | `0`  | text delta (JSON string)                |
//! | `g`  | reasoning delta (JSON string)           |
//! | `h`  | source (object)                         |
//! | `2`  | data array of side-channel items        |
//! | `3`  | error (JSON string)                     |
//! | `9`  | tool call (object)                      |
//! | `a`  | tool result (object)                    |
//! | `d`  | finish (`{"finishReason": ...}`)        |
//!
//! The decoder additionally accepts the older `data: {json}` framing where every
//! line is a single typed object.

use crate::types::SourceRef;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadingImage {
    pub file_key: String,
    pub alt: String,
    #[serde(default = "default_true")]
    pub is_loading: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamedImage {
    pub base64: String,
    pub file_key: String,
    pub alt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WireEvent {
    TextDelta(String),
    ReasoningDelta(String),
    Source(SourceRef),
    GeneratedImageLoading(LoadingImage),
    GeneratedImageStream(StreamedImage),
    ProviderMetadata(Value),
    ToolCall(Value),
    ToolResult(Value),
    Error(String),
    Finish { finish_reason: Option<String> },
}

impl WireEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            WireEvent::TextDelta(_) => "text-delta",
            WireEvent::ReasoningDelta(_) => "reasoning-delta",
            WireEvent::Source(_) => "source",
            WireEvent::GeneratedImageLoading(_) => "generated-image-loading",
            WireEvent::GeneratedImageStream(_) => "generated-image-stream",
            WireEvent::ProviderMetadata(_) => "provider-metadata",
            WireEvent::ToolCall(_) => "tool-call",
            WireEvent::ToolResult(_) => "tool-result",
            WireEvent::Error(_) => "error",
            WireEvent::Finish { .. } => "finish",
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("line has no recognizable framing")]
    Malformed,

    #[error("unknown line code '{0}'")]
    UnknownCode(String),

    #[error("invalid payload for '{code}': {source}")]
    Payload {
        code: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("unexpected payload shape for '{0}'")]
    Shape(String),
}

fn source_json(source: &SourceRef) -> Value {
    let mut value = json!({
        "sourceType": "url",
        "id": source.id,
        "url": source.url,
    });
    if let Some(title) = &source.title {
        value["title"] = Value::String(title.clone());
    }
    value
}

fn data_item(kind: &str, content: Value) -> String {
    // Side-channel payloads travel as a JSON-encoded string in `content`.
    let item = json!([{ "type": kind, "content": content.to_string() }]);
    format!("2:{}\n", item)
}

/// Encodes one event as a single compact line, newline included.
pub fn encode_line(event: &WireEvent) -> String {
    match event {
        WireEvent::TextDelta(t) => format!("0:{}\n", Value::String(t.clone())),
        WireEvent::ReasoningDelta(t) => format!("g:{}\n", Value::String(t.clone())),
        WireEvent::Source(s) => format!("h:{}\n", source_json(s)),
        WireEvent::GeneratedImageLoading(img) => data_item(
            "generated-image-loading",
            json!({
                "fileKey": img.file_key,
                "alt": img.alt,
                "isLoading": img.is_loading,
                "toolCallId": img.tool_call_id,
            }),
        ),
        WireEvent::GeneratedImageStream(img) => data_item(
            "generated-image-stream",
            json!({
                "base64": img.base64,
                "fileKey": img.file_key,
                "alt": img.alt,
                "toolCallId": img.tool_call_id,
            }),
        ),
        WireEvent::ProviderMetadata(v) => data_item("provider-metadata", v.clone()),
        WireEvent::ToolCall(v) => format!("9:{}\n", v),
        WireEvent::ToolResult(v) => format!("a:{}\n", v),
        WireEvent::Error(msg) => format!("3:{}\n", Value::String(msg.clone())),
        WireEvent::Finish { finish_reason } => {
            format!("d:{}\n", json!({ "finishReason": finish_reason }))
        }
    }
}

fn parse_payload<T: serde::de::DeserializeOwned>(
    code: &str,
    raw: &str,
) -> Result<T, DecodeError> {
    serde_json::from_str(raw).map_err(|source| DecodeError::Payload {
        code: code.to_string(),
        source,
    })
}

/// Decodes one line (without its trailing newline). Blank lines and
/// protocol bookkeeping lines decode to no events.
pub fn decode_line(line: &str) -> Result<Vec<WireEvent>, DecodeError> {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
        return Ok(Vec::new());
    }

    if let Some(rest) = line.strip_prefix("data:") {
        let rest = rest.trim_start();
        if rest == "[DONE]" {
            return Ok(Vec::new());
        }
        let value: Value = parse_payload("data", rest)?;
        return Ok(decode_item(&value).into_iter().collect());
    }

    let (code, payload) = match line.split_once(':') {
        Some(split) => split,
        None => return Err(DecodeError::Malformed),
    };

    let event = match code {
        "0" => WireEvent::TextDelta(parse_payload(code, payload)?),
        "g" => WireEvent::ReasoningDelta(parse_payload(code, payload)?),
        "h" => WireEvent::Source(parse_payload(code, payload)?),
        "3" => WireEvent::Error(parse_payload(code, payload)?),
        "9" => WireEvent::ToolCall(parse_payload(code, payload)?),
        "a" => WireEvent::ToolResult(parse_payload(code, payload)?),
        "d" => {
            let value: Value = parse_payload(code, payload)?;
            WireEvent::Finish {
                finish_reason: value
                    .get("finishReason")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            }
        }
        "2" => {
            let value: Value = parse_payload(code, payload)?;
            let items = match value.as_array() {
                Some(items) => items,
                None => return Err(DecodeError::Shape(code.to_string())),
            };
            return Ok(items.iter().filter_map(decode_item).collect());
        }
        // Tool-call deltas, step markers and message annotations carry nothing we display.
        "b" | "c" | "e" | "f" | "8" => return Ok(Vec::new()),
        other => return Err(DecodeError::UnknownCode(other.to_string())),
    };
    Ok(vec![event])
}

/// Side-channel `content` is normally a JSON-encoded string, but inline objects are accepted.
fn item_content<T: serde::de::DeserializeOwned>(item: &Value) -> Option<T> {
    let content = item.get("content")?;
    let parsed = match content {
        Value::String(raw) => serde_json::from_str(raw),
        other => serde_json::from_value(other.clone()),
    };
    match parsed {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Skipping side-channel item with bad content: {}", e);
            None
        }
    }
}

fn decode_item(item: &Value) -> Option<WireEvent> {
    let kind = item.get("type").and_then(Value::as_str)?;
    let text_delta = || {
        item.get("textDelta")
            .or_else(|| item.get("delta"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    match kind {
        "text-delta" => text_delta().map(WireEvent::TextDelta),
        "reasoning" | "reasoning-delta" => text_delta().map(WireEvent::ReasoningDelta),
        "generated-image-loading" => item_content(item).map(WireEvent::GeneratedImageLoading),
        "generated-image-stream" => item_content(item).map(WireEvent::GeneratedImageStream),
        "provider-metadata" => item_content(item).map(WireEvent::ProviderMetadata),
        "error" => item
            .get("error")
            .or_else(|| item.get("errorText"))
            .and_then(Value::as_str)
            .map(|m| WireEvent::Error(m.to_string())),
        other => {
            tracing::debug!("Ignoring side-channel item '{}'", other);
            None
        }
    }
}
