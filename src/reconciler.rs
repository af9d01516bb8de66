//! Client-side streaming state and its hand-off to the persisted record.
//!
//! While a response streams, the client displays an ephemeral record built from
//! wire events. Once the persisted record reaches a terminal status and matches
//! what was streamed, the ephemeral record is dropped and the persisted record
//! is shown instead.

use crate::constants::{
    FORCE_RECONCILE_AFTER_SECS, IMAGE_GENERATION_MARKER_NEEDLE, LOADING_ALT,
    LOADING_KEY_PREFIX, RECONCILE_SLACK_CHARS, TEXT_BASED_LOADING_KEY,
};
use crate::str_utils::char_len_diff;
use crate::types::{Message, MessageId, MessagePart, MessageStatus};
use crate::wire::WireEvent;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageData {
    Loading,
    Inline(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingImage {
    pub image: ImageData,
    pub file_key: String,
    pub alt: String,
}

impl StreamingImage {
    pub fn is_loading(&self) -> bool {
        matches!(self.image, ImageData::Loading)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamingState {
    pub message_id: MessageId,
    pub content: String,
    pub reasoning: String,
    pub streaming_images: Vec<StreamingImage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Idle,
    Streaming,
    Reconciled,
    Aborted,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerConfig {
    /// Maximum text or reasoning length difference, in chars, tolerated on a `done` record.
    pub slack_chars: usize,
    /// Clear anyway once a terminal status has been observed for this long.
    pub force_after: Option<Duration>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            slack_chars: RECONCILE_SLACK_CHARS,
            force_after: Some(Duration::from_secs(FORCE_RECONCILE_AFTER_SECS)),
        }
    }
}

#[derive(Debug)]
pub struct Reconciler {
    config: ReconcilerConfig,
    phase: StreamPhase,
    state: Option<StreamingState>,
    terminal_seen_at: Option<Instant>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(ReconcilerConfig::default())
    }
}

impl Reconciler {
    pub fn new(config: ReconcilerConfig) -> Self {
        Self {
            config,
            phase: StreamPhase::Idle,
            state: None,
            terminal_seen_at: None,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    pub fn state(&self) -> Option<&StreamingState> {
        self.state.as_ref()
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.phase, StreamPhase::Reconciled | StreamPhase::Aborted)
    }

    /// Starts tracking a new stream, replacing any previous one.
    pub fn begin(&mut self, message_id: MessageId) {
        self.state = Some(StreamingState {
            message_id,
            content: String::new(),
            reasoning: String::new(),
            streaming_images: Vec::new(),
        });
        self.phase = StreamPhase::Streaming;
        self.terminal_seen_at = None;
    }

    /// Folds one decoded wire event into the ephemeral record.
    pub fn apply(&mut self, event: &WireEvent) {
        if self.phase != StreamPhase::Streaming {
            return;
        }
        let state = match self.state.as_mut() {
            Some(s) => s,
            None => return,
        };

        match event {
            WireEvent::TextDelta(delta) => {
                state.content.push_str(delta);
                let has_loading = state.streaming_images.iter().any(|i| i.is_loading());
                if !has_loading && state.content.contains(IMAGE_GENERATION_MARKER_NEEDLE) {
                    state.streaming_images.push(StreamingImage {
                        image: ImageData::Loading,
                        file_key: TEXT_BASED_LOADING_KEY.to_string(),
                        alt: LOADING_ALT.to_string(),
                    });
                }
            }
            WireEvent::ReasoningDelta(delta) => state.reasoning.push_str(delta),
            WireEvent::GeneratedImageLoading(img) => {
                let exists = state
                    .streaming_images
                    .iter()
                    .any(|i| i.file_key == img.file_key);
                if !exists {
                    // A text-derived placeholder stands in for this one; swap it.
                    if let Some(slot) = state
                        .streaming_images
                        .iter_mut()
                        .find(|i| i.file_key == TEXT_BASED_LOADING_KEY)
                    {
                        slot.file_key = img.file_key.clone();
                        slot.alt = img.alt.clone();
                    } else {
                        state.streaming_images.push(StreamingImage {
                            image: ImageData::Loading,
                            file_key: img.file_key.clone(),
                            alt: img.alt.clone(),
                        });
                    }
                }
            }
            WireEvent::GeneratedImageStream(img) => {
                let resolved = StreamingImage {
                    image: ImageData::Inline(img.base64.clone()),
                    file_key: img.file_key.clone(),
                    alt: img.alt.clone(),
                };
                let by_tool_call = img
                    .tool_call_id
                    .as_ref()
                    .map(|id| format!("{}{}", LOADING_KEY_PREFIX, id));
                let slot = by_tool_call
                    .and_then(|key| {
                        state
                            .streaming_images
                            .iter()
                            .position(|i| i.file_key == key)
                    })
                    .or_else(|| state.streaming_images.iter().position(|i| i.is_loading()));
                match slot {
                    Some(idx) => state.streaming_images[idx] = resolved,
                    None => state.streaming_images.push(resolved),
                }
            }
            WireEvent::Error(msg) => {
                tracing::debug!("Stream reported error: {}", msg);
            }
            WireEvent::Source(_)
            | WireEvent::ProviderMetadata(_)
            | WireEvent::ToolCall(_)
            | WireEvent::ToolResult(_)
            | WireEvent::Finish { .. } => {}
        }
    }

    /// Compares the ephemeral record against the persisted live view.
    /// Returns true when this call cleared the ephemeral record.
    pub fn observe(&mut self, persisted: Option<&Message>) -> bool {
        if self.phase != StreamPhase::Streaming {
            return false;
        }
        let (state, message) = match (self.state.as_ref(), persisted) {
            (Some(s), Some(m)) if s.message_id == m.message_id => (s, m),
            _ => return false,
        };

        let converged = match message.status {
            MessageStatus::Error
            | MessageStatus::Cancelled
            | MessageStatus::Rejected
            | MessageStatus::Deleted => true,
            MessageStatus::Done => {
                let text_gap = char_len_diff(&state.content, &message.text());
                let reasoning_gap = char_len_diff(&state.reasoning, &message.reasoning());
                if text_gap <= self.config.slack_chars && reasoning_gap <= self.config.slack_chars
                {
                    true
                } else {
                    let first_seen = *self.terminal_seen_at.get_or_insert_with(Instant::now);
                    match self.config.force_after {
                        Some(limit) if first_seen.elapsed() >= limit => {
                            tracing::warn!(
                                "Force reconciling {} (text gap {}, reasoning gap {})",
                                message.message_id.short(),
                                text_gap,
                                reasoning_gap
                            );
                            true
                        }
                        _ => false,
                    }
                }
            }
            _ => false,
        };

        if converged {
            tracing::debug!(
                "Reconciled {} against persisted status {}",
                message.message_id.short(),
                message.status
            );
            self.state = None;
            self.phase = StreamPhase::Reconciled;
        }
        converged
    }

    /// Client-initiated stop: the ephemeral record is dropped at once.
    pub fn abort(&mut self) {
        if self.phase == StreamPhase::Streaming {
            self.state = None;
            self.phase = StreamPhase::Aborted;
        }
    }

    /// The message to display: the persisted record overlaid with streamed
    /// content while the stream is live.
    pub fn display(&self, persisted: &Message) -> Message {
        let state = match self.state.as_ref() {
            Some(s) if s.message_id == persisted.message_id => s,
            _ => return persisted.clone(),
        };
        let mut shown = persisted.clone();
        shown.status = MessageStatus::Streaming;
        let mut parts = Vec::new();
        if !state.content.is_empty() {
            parts.push(MessagePart::Text {
                text: state.content.clone(),
            });
        }
        if !state.reasoning.is_empty() {
            parts.push(MessagePart::Reasoning {
                reasoning: state.reasoning.clone(),
            });
        }
        parts.extend(
            persisted
                .parts
                .iter()
                .filter(|p| matches!(p, MessagePart::Source { .. }))
                .cloned(),
        );
        for image in &state.streaming_images {
            parts.push(MessagePart::GeneratedImage {
                file_key: image.file_key.clone(),
                alt: image.alt.clone(),
                is_loading: image.is_loading(),
            });
        }
        shown.parts = parts;
        shown
    }
}
