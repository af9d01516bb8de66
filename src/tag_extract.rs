//! Incremental extraction of `<think>...</think>` reasoning from streamed text.
//!
//! Some models inline their reasoning in the content channel. Tags may be split
//! across deltas, so a suffix that could be the start of a tag is held back
//! until the next delta decides it.

const OPEN: &str = "<think>";
const CLOSE: &str = "</think>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Text(String),
    Reasoning(String),
}

#[derive(Debug, Default)]
pub struct ThinkTagSplitter {
    inside: bool,
    pending: String,
}

impl ThinkTagSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, delta: &str) -> Vec<Segment> {
        self.pending.push_str(delta);
        let mut out = Vec::new();

        loop {
            let tag = if self.inside { CLOSE } else { OPEN };
            match self.pending.find(tag) {
                Some(idx) => {
                    let before: String = self.pending.drain(..idx).collect();
                    self.emit(&mut out, before);
                    self.pending.drain(..tag.len());
                    self.inside = !self.inside;
                }
                None => {
                    let keep = partial_suffix_len(&self.pending, tag);
                    let emit_len = self.pending.len() - keep;
                    let ready: String = self.pending.drain(..emit_len).collect();
                    self.emit(&mut out, ready);
                    break;
                }
            }
        }
        out
    }

    /// Flushes anything held back. An unterminated `<think>` block stays reasoning.
    pub fn finish(&mut self) -> Vec<Segment> {
        let rest = std::mem::take(&mut self.pending);
        let mut out = Vec::new();
        self.emit(&mut out, rest);
        out
    }

    fn emit(&self, out: &mut Vec<Segment>, chunk: String) {
        if chunk.is_empty() {
            return;
        }
        if self.inside {
            out.push(Segment::Reasoning(chunk));
        } else {
            out.push(Segment::Text(chunk));
        }
    }
}

/// Length of the longest proper prefix of `tag` that `s` ends with.
fn partial_suffix_len(s: &str, tag: &str) -> usize {
    (1..tag.len())
        .rev()
        .find(|&k| s.ends_with(&tag[..k]))
        .unwrap_or(0)
}
