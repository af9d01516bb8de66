use lazy_static::lazy_static;
use regex::Regex;
use std::io::Write;
use tracing_subscriber::fmt::MakeWriter;

lazy_static! {
    static ref REDACTION_REGEX: Regex = Regex::new(
        r#"(?i)(sk-[A-Za-z0-9_-]{20,}|Bearer\s+[^\s"]+|x-api-key:\s*[^\s"]+|UPSTREAM_API_KEY=[^\s"]+)"#
    ).expect("Invalid redaction regex");
}

pub fn redact(input: &str) -> std::borrow::Cow<'_, str> {
    REDACTION_REGEX.replace_all(input, "[REDACTED]")
}

pub struct RedactingWriter<W: Write> {
    inner: W,
}

impl<W: Write> RedactingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: Write> Write for RedactingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let input = String::from_utf8_lossy(buf);
        let redacted = redact(&input);
        self.inner.write_all(redacted.as_bytes())?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Wraps any `MakeWriter` so every writer it hands out redacts secrets.
#[derive(Clone)]
pub struct RedactingMakeWriter<M> {
    inner: M,
}

impl<M> RedactingMakeWriter<M> {
    pub fn new(inner: M) -> Self {
        Self { inner }
    }
}

impl<'a, M> MakeWriter<'a> for RedactingMakeWriter<M>
where
    M: MakeWriter<'a>,
{
    type Writer = RedactingWriter<M::Writer>;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter::new(self.inner.make_writer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrubs_bearer_tokens_and_keys() {
        let line = r#"{"msg":"POST with Authorization: Bearer abc.def and sk-or-v1-0123456789abcdefghij"}"#;
        let out = redact(line);
        assert!(!out.contains("abc.def"));
        assert!(!out.contains("0123456789abcdefghij"));
        assert!(out.ends_with("\"}"));
    }

    #[test]
    fn writer_reports_full_input_length() {
        let mut sink = Vec::new();
        let written = {
            let mut writer = RedactingWriter::new(&mut sink);
            writer.write(b"UPSTREAM_API_KEY=secret rest")
        };
        assert!(matches!(written, Ok(28)));
        assert_eq!(String::from_utf8_lossy(&sink), "[REDACTED] rest");
    }
}
