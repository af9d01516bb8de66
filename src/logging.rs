use crate::constants::REQUEST_ID_HEADER;
use crate::provider::ProviderEvent;
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use std::time::Instant;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use tracing_appender::non_blocking::WorkerGuard;
use uuid::Uuid;

/// Installs the global subscriber: stderr, a redacted daily JSON file under
/// `log_dir`, and the span-trace error layer. Keep the guard alive for the
/// life of the process or buffered file lines are lost.
pub fn init_tracing(log_dir: &str) -> WorkerGuard {
    use tracing_subscriber::prelude::*;

    let filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => "chatwire=debug,tower_http=info".into(),
    };

    let _ = std::fs::create_dir_all(log_dir);
    let file_appender = tracing_appender::rolling::daily(log_dir, "chatwire.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(crate::redaction_layer::RedactingMakeWriter::new(non_blocking))
                .with_ansi(false),
        )
        .with(tracing_error::ErrorLayer::default())
        .try_init();
    if let Err(e) = installed {
        eprintln!("Tracing already initialized: {}", e);
    }
    guard
}

/// Sets up a global panic hook that logs panics using tracing.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Tags every request with an id (reusing the caller's when present) and runs
/// it inside a `request` span.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = match req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => Uuid::new_v4().to_string(),
    };
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    let mut response = next.run(req).instrument(span).await;
    if let Ok(val) = request_id.parse() {
        response.headers_mut().insert(REQUEST_ID_HEADER, val);
    }
    response
}

/// Per-stream counters, logged once when the aggregation ends.
#[derive(Debug)]
pub struct StreamMetric {
    pub stream_id: String,
    pub events: usize,
    pub text_chars: usize,
    pub reasoning_chars: usize,
    pub sources: usize,
    pub tool_calls: usize,
    pub images_stored: usize,
    pub upload_failures: usize,
    pub persist_writes: usize,
    pub skipped_ticks: usize,
    started: Instant,
}

impl StreamMetric {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            events: 0,
            text_chars: 0,
            reasoning_chars: 0,
            sources: 0,
            tool_calls: 0,
            images_stored: 0,
            upload_failures: 0,
            persist_writes: 0,
            skipped_ticks: 0,
            started: Instant::now(),
        }
    }

    pub fn record_event(&mut self, event: &ProviderEvent) {
        self.events += 1;
        match event {
            ProviderEvent::TextDelta(t) => self.text_chars += t.chars().count(),
            ProviderEvent::ReasoningDelta(t) => self.reasoning_chars += t.chars().count(),
            ProviderEvent::Source(_) => self.sources += 1,
            ProviderEvent::ToolCallStart { .. } => self.tool_calls += 1,
            _ => {}
        }
    }

    pub fn log_summary(&self, outcome: &str) {
        info!(
            target: "flight_recorder",
            "[STREAM END] Stream: {} | Outcome: {} | Events: {} | Text: {} chars | Reasoning: {} chars | Sources: {} | Tools: {} | Images: {} ({} failed) | Writes: {} ({} ticks skipped) | {:?}",
            self.stream_id,
            outcome,
            self.events,
            self.text_chars,
            self.reasoning_chars,
            self.sources,
            self.tool_calls,
            self.images_stored,
            self.upload_failures,
            self.persist_writes,
            self.skipped_ticks,
            self.started.elapsed()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_carries_its_stream_and_counts_chars() {
        let mut metric = StreamMetric::new("stream-7");
        metric.record_event(&ProviderEvent::TextDelta("héllo".to_string()));
        metric.record_event(&ProviderEvent::ReasoningDelta("ok".to_string()));
        assert_eq!(metric.stream_id, "stream-7");
        assert_eq!(metric.events, 2);
        assert_eq!(metric.text_chars, 5);
        assert_eq!(metric.reasoning_chars, 2);
    }
}
