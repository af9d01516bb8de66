//! Inbound `POST /api/chat` body and its conversion into provider history.

use crate::constants::{
    FAILED_KEY_PREFIX, LOADING_KEY_PREFIX, MAX_HISTORY_MESSAGES, MAX_PARTS_PER_MESSAGE,
};
use crate::provider::{GenerationRequest, ModelParams, ProviderContent, ProviderMessage};
use crate::types::*;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ThreadMetadata {
    pub thread_id: ThreadId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct UserInfo {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub id: MessageId,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub messages: Vec<IncomingMessage>,
    pub thread_metadata: ThreadMetadata,
    pub response_message_id: MessageId,
    pub stream_id: StreamId,
    pub model: String,
    #[serde(default)]
    pub model_params: ModelParams,
    #[serde(default)]
    pub is_regeneration: bool,
    #[serde(default)]
    pub user_info: UserInfo,
}

impl ChatRequest {
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ChatwireError::InvalidRequest("model is required".to_string()).into());
        }
        if self.stream_id.as_str().is_empty() || self.response_message_id.as_str().is_empty() {
            return Err(ChatwireError::InvalidRequest(
                "streamId and responseMessageId are required".to_string(),
            )
            .into());
        }
        if self.messages.len() > MAX_HISTORY_MESSAGES {
            return Err(ChatwireError::InvalidRequest(format!(
                "history has {} messages (max {})",
                self.messages.len(),
                MAX_HISTORY_MESSAGES
            ))
            .into());
        }
        for (index, message) in self.messages.iter().enumerate() {
            if message.parts.len() > MAX_PARTS_PER_MESSAGE {
                return Err(ChatwireError::InvalidRequest(format!(
                    "message {} has {} parts (max {})",
                    index,
                    message.parts.len(),
                    MAX_PARTS_PER_MESSAGE
                ))
                .into());
            }
            if message.id == self.response_message_id && message.role == Role::User {
                return Err(ChatwireError::InvalidRequest(format!(
                    "message {} reuses the response id",
                    index
                ))
                .into());
            }
        }
        match self.messages.last() {
            Some(last) if last.role == Role::User => Ok(()),
            Some(_) if self.is_regeneration => Ok(()),
            _ => Err(ChatwireError::InvalidRequest(
                "history must end with a user message".to_string(),
            )
            .into()),
        }
    }

    /// Owner key for uploads; falls back to the thread when anonymous.
    pub fn owner(&self) -> String {
        match &self.user_info.id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("thread-{}", self.thread_metadata.thread_id),
        }
    }

    /// The newest user message, which is persisted before streaming starts.
    pub fn latest_user_message(&self) -> Option<&IncomingMessage> {
        self.messages.iter().rev().find(|m| m.role == Role::User)
    }

    pub fn to_generation_request(&self) -> GenerationRequest {
        GenerationRequest {
            model: self.model.clone(),
            messages: to_provider_messages(&self.messages, &self.response_message_id),
            params: self.model_params.clone(),
            user: self.owner(),
        }
    }
}

/// Prior history as the provider sees it. Reasoning and sources are
/// display-only, generated images survive as a short text mention, and
/// loading or failed placeholders are dropped. The response message itself is
/// skipped so a regeneration does not feed the old answer back.
pub fn to_provider_messages(
    messages: &[IncomingMessage],
    response_id: &MessageId,
) -> Vec<ProviderMessage> {
    messages
        .iter()
        .filter(|m| &m.id != response_id)
        .filter_map(|m| {
            let content: Vec<ProviderContent> = m.parts.iter().filter_map(to_content).collect();
            if content.is_empty() {
                tracing::debug!("Dropping empty {} message {}", m.role.as_str(), m.id.short());
                return None;
            }
            Some(ProviderMessage {
                role: m.role,
                content,
            })
        })
        .collect()
}

fn to_content(part: &MessagePart) -> Option<ProviderContent> {
    match part {
        MessagePart::Text { text } if !text.is_empty() => Some(ProviderContent::Text(text.clone())),
        MessagePart::Text { .. } => None,
        MessagePart::Reasoning { .. } | MessagePart::Source { .. } => None,
        MessagePart::File {
            data,
            filename,
            mime_type,
        } => Some(ProviderContent::File {
            filename: filename.clone(),
            mime_type: mime_type.clone(),
            data: data.clone(),
        }),
        MessagePart::Image { image, .. } => Some(ProviderContent::ImageUrl(image.clone())),
        MessagePart::GeneratedImage {
            is_loading: true, ..
        } => None,
        MessagePart::GeneratedImage { file_key, .. }
            if file_key.starts_with(LOADING_KEY_PREFIX) || file_key.starts_with(FAILED_KEY_PREFIX) =>
        {
            None
        }
        MessagePart::GeneratedImage { alt, .. } => Some(ProviderContent::Text(format!(
            "[Generated image: {}]",
            alt
        ))),
    }
}
