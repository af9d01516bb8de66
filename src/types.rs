use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_error::SpanTrace;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct MessageId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ThreadId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct StreamId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ToolCallId(pub String);

macro_rules! string_id {
    ($name:ident, $short:expr) => {
        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                crate::str_utils::prefix_chars(&self.0, $short)
            }
        }
    };
}

string_id!(MessageId, 8);
string_id!(ThreadId, 6);
string_id!(StreamId, 8);
string_id!(ToolCallId, 12);

impl StreamId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for StreamId {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolCallId {
    /// Placeholder key used while this call's image is still being produced.
    pub fn loading_key(&self) -> String {
        format!("{}{}", crate::constants::LOADING_KEY_PREFIX, self.0)
    }

    pub fn failed_key(&self) -> String {
        format!("{}{}", crate::constants::FAILED_KEY_PREFIX, self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ChatwireError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(ChatwireError::InvalidRequest(format!(
                "unknown role '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Waiting,
    Pending,
    Streaming,
    Done,
    Error,
    Cancelled,
    Rejected,
    Deleted,
}

impl MessageStatus {
    /// Terminal messages accept no further content mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Done
                | MessageStatus::Error
                | MessageStatus::Cancelled
                | MessageStatus::Rejected
                | MessageStatus::Deleted
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Waiting => "waiting",
            MessageStatus::Pending => "pending",
            MessageStatus::Streaming => "streaming",
            MessageStatus::Done => "done",
            MessageStatus::Error => "error",
            MessageStatus::Cancelled => "cancelled",
            MessageStatus::Rejected => "rejected",
            MessageStatus::Deleted => "deleted",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageStatus {
    type Err = ChatwireError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "waiting" => MessageStatus::Waiting,
            "pending" => MessageStatus::Pending,
            "streaming" => MessageStatus::Streaming,
            "done" => MessageStatus::Done,
            "error" => MessageStatus::Error,
            "cancelled" => MessageStatus::Cancelled,
            "rejected" => MessageStatus::Rejected,
            "deleted" => MessageStatus::Deleted,
            other => {
                return Err(ChatwireError::InvalidRequest(format!(
                    "unknown message status '{}'",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub id: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedImageRef {
    pub file_key: String,
    pub alt: String,
    #[serde(default)]
    pub is_loading: bool,
}

impl GeneratedImageRef {
    pub fn loading(tool_call_id: &ToolCallId) -> Self {
        Self {
            file_key: tool_call_id.loading_key(),
            alt: crate::constants::LOADING_ALT.to_string(),
            is_loading: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Reasoning {
        reasoning: String,
    },
    Source {
        source: SourceRef,
    },
    File {
        data: String,
        filename: String,
        mime_type: String,
    },
    Image {
        image: String,
        mime_type: String,
    },
    GeneratedImage {
        file_key: String,
        alt: String,
        #[serde(default)]
        is_loading: bool,
    },
}

impl From<GeneratedImageRef> for MessagePart {
    fn from(image: GeneratedImageRef) -> Self {
        MessagePart::GeneratedImage {
            file_key: image.file_key,
            alt: image.alt,
            is_loading: image.is_loading,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerErrorKind {
    Provider,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerError {
    #[serde(rename = "type")]
    pub kind: ServerErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub role: Role,
    pub status: MessageStatus,
    pub parts: Vec<MessagePart>,
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_error: Option<ServerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumable_stream_id: Option<StreamId>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Message {
    pub fn new(
        message_id: MessageId,
        thread_id: ThreadId,
        role: Role,
        status: MessageStatus,
        parts: Vec<MessagePart>,
        model: impl Into<String>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            message_id,
            thread_id,
            role,
            status,
            parts,
            model: model.into(),
            server_error: None,
            provider_metadata: None,
            resumable_stream_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Concatenation of every text part.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn reasoning(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::Reasoning { reasoning } => Some(reasoning.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn generated_images(&self) -> Vec<GeneratedImageRef> {
        self.parts
            .iter()
            .filter_map(|p| match p {
                MessagePart::GeneratedImage {
                    file_key,
                    alt,
                    is_loading,
                } => Some(GeneratedImageRef {
                    file_key: file_key.clone(),
                    alt: alt.clone(),
                    is_loading: *is_loading,
                }),
                _ => None,
            })
            .collect()
    }
}

/// Partial update of a persisted message. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub parts: Option<Vec<MessagePart>>,
    pub status: Option<MessageStatus>,
    pub server_error: Option<ServerError>,
    pub provider_metadata: Option<serde_json::Value>,
    /// `Some(None)` clears the stream id.
    pub resumable_stream_id: Option<Option<StreamId>>,
    /// Applies only while the record still belongs to this stream.
    pub expected_stream_id: Option<StreamId>,
}

impl MessagePatch {
    pub fn metadata(metadata: serde_json::Value) -> Self {
        Self {
            provider_metadata: Some(metadata),
            ..Self::default()
        }
    }

    /// Metadata-only patches are not content mutations and pass the terminal guard.
    pub fn is_metadata_only(&self) -> bool {
        self.provider_metadata.is_some()
            && self.parts.is_none()
            && self.status.is_none()
            && self.server_error.is_none()
            && self.resumable_stream_id.is_none()
            && self.expected_stream_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    IgnoredTerminal,
    /// The record was taken over by another stream (regeneration).
    IgnoredSuperseded,
}

#[derive(Error, Debug)]
pub enum ChatwireError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl ChatwireError {
    pub fn internal(msg: impl Into<String>) -> Self {
        ChatwireError::Internal(msg.into(), SpanTrace::capture())
    }
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let (status, msg, code) = match &self.inner {
            ChatwireError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            ChatwireError::InvalidRequest(m) => {
                (StatusCode::BAD_REQUEST, m.clone(), "INVALID_REQUEST")
            }
            ChatwireError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND"),
            ChatwireError::Conflict(m) => (StatusCode::CONFLICT, m.clone(), "CONFLICT"),
            ChatwireError::Network(e) => {
                (StatusCode::BAD_GATEWAY, e.to_string(), "NETWORK_ERROR")
            }
            ChatwireError::Upload(m) => (StatusCode::BAD_GATEWAY, m.clone(), "UPLOAD_ERROR"),
            ChatwireError::Database(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            ChatwireError::Serialization(e) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            ChatwireError::Io(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string(), "IO_ERROR"),
            ChatwireError::Internal(m, _) => {
                (StatusCode::INTERNAL_SERVER_ERROR, m.clone(), "INTERNAL_ERROR")
            }
        };
        if status.is_server_error() {
            tracing::error!(code, "{}", self);
        }
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ChatwireError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ChatwireError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;
