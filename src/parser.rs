use crate::wire::{decode_line, WireEvent};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("stream parsing was cancelled")]
    Cancelled,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Client-side decoder for a wire byte stream.
///
/// Partial lines are buffered as raw bytes so a multi-byte character split
/// across two reads is decoded intact. The same parser can be fed a resumed
/// stream after a transport error: the buffered partial line and the byte
/// count carry over.
#[derive(Debug, Default)]
pub struct StreamParser {
    text: String,
    reasoning: String,
    buffer: Vec<u8>,
    bytes_consumed: usize,
    finish_reason: Option<String>,
    skipped_lines: usize,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    /// Bytes read from the wire so far, the offset to resume from.
    pub fn bytes_consumed(&self) -> usize {
        self.bytes_consumed
    }

    /// Finish reason reported by the server, once the stream has ended.
    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Reads `stream` to its end, invoking `on_update` for every decoded event
    /// and a final `Finish` on a clean end.
    pub async fn parse<S, B, E, F>(
        &mut self,
        stream: S,
        cancel: &CancellationToken,
        mut on_update: F,
    ) -> Result<(), ParseError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: std::fmt::Display,
        F: FnMut(WireEvent),
    {
        tokio::pin!(stream);

        loop {
            if cancel.is_cancelled() {
                return Err(ParseError::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ParseError::Cancelled),
                next = stream.next() => next,
            };
            match next {
                None => break,
                Some(Err(e)) => {
                    let msg = e.to_string();
                    tracing::warn!(
                        "[🌐 -> 🖥️ ] Stream read failed after {} bytes: {}",
                        self.bytes_consumed,
                        msg
                    );
                    on_update(WireEvent::Error(msg.clone()));
                    return Err(ParseError::Transport(msg));
                }
                Some(Ok(chunk)) => {
                    let bytes = chunk.as_ref();
                    self.bytes_consumed += bytes.len();
                    self.buffer.extend_from_slice(bytes);
                    self.drain_complete_lines(cancel, &mut on_update)?;
                }
            }
        }

        if !self.buffer.is_empty() {
            let trailing = std::mem::take(&mut self.buffer);
            self.handle_line(&trailing, &mut on_update);
        }

        on_update(WireEvent::Finish {
            finish_reason: self.finish_reason.clone(),
        });
        Ok(())
    }

    fn drain_complete_lines<F>(
        &mut self,
        cancel: &CancellationToken,
        on_update: &mut F,
    ) -> Result<(), ParseError>
    where
        F: FnMut(WireEvent),
    {
        let buffer = std::mem::take(&mut self.buffer);
        let mut start = 0;
        while let Some(rel) = buffer[start..].iter().position(|b| *b == b'\n') {
            if cancel.is_cancelled() {
                self.buffer = buffer[start..].to_vec();
                return Err(ParseError::Cancelled);
            }
            let end = start + rel;
            self.handle_line(&buffer[start..end], on_update);
            start = end + 1;
        }
        self.buffer = buffer[start..].to_vec();
        Ok(())
    }

    fn handle_line<F>(&mut self, raw: &[u8], on_update: &mut F)
    where
        F: FnMut(WireEvent),
    {
        let line = match std::str::from_utf8(raw) {
            Ok(l) => l,
            Err(e) => {
                self.skipped_lines += 1;
                tracing::warn!("Skipping non UTF-8 wire line: {}", e);
                return;
            }
        };
        let events = match decode_line(line) {
            Ok(events) => events,
            Err(e) => {
                self.skipped_lines += 1;
                tracing::warn!(
                    "Skipping undecodable wire line ({}): {}",
                    e,
                    crate::str_utils::prefix_chars(line, 80)
                );
                return;
            }
        };
        for event in events {
            match &event {
                WireEvent::TextDelta(t) => self.text.push_str(t),
                WireEvent::ReasoningDelta(t) => self.reasoning.push_str(t),
                WireEvent::Finish { finish_reason } => {
                    // Reported once, at the end of the stream.
                    self.finish_reason = finish_reason.clone();
                    continue;
                }
                _ => {}
            }
            on_update(event);
        }
    }
}
