use crate::aggregator::{AggregatorConfig, StreamAggregator};
use crate::hardening::RetryPolicy;
use crate::provider::ModelProvider;
use crate::registry::StreamRegistry;
use crate::store::MessageStore;
use crate::types::StreamId;
use crate::uploader::ImageUploader;
use clap::Parser;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    #[arg(long, default_value = "chatwire.db")]
    pub database: String,
    /// Minimum interval between throttled persistence writes.
    #[arg(long, default_value_t = crate::constants::DEFAULT_THROTTLE_MS)]
    pub throttle_ms: u64,
    /// Upper bound on one response; the stream is cancelled after this.
    #[arg(long, default_value_t = 60)]
    pub max_stream_secs: u64,
    #[arg(long, default_value = "uploads")]
    pub upload_dir: String,
    #[arg(long, default_value = crate::constants::DEFAULT_UPSTREAM_BASE_URL)]
    pub upstream_base_url: String,
    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 50 * 1024 * 1024)]
    pub max_body_size: usize,
    #[arg(long, default_value_t = 3)]
    pub max_upload_retries: u32,
    /// Messages left pending/streaming longer than this are swept at startup.
    #[arg(long, default_value_t = 6)]
    pub stale_stream_hours: i64,
    #[arg(long, default_value = "logs")]
    pub log_dir: String,
}

impl Default for Args {
    fn default() -> Self {
        Self::parse_from(["chatwire"])
    }
}

/// Cancellation handles of the responses currently being generated.
#[derive(Default)]
pub struct ActiveStreams {
    tokens: Mutex<HashMap<StreamId, CancellationToken>>,
}

impl ActiveStreams {
    fn tokens(&self) -> std::sync::MutexGuard<'_, HashMap<StreamId, CancellationToken>> {
        match self.tokens.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, stream_id: StreamId, token: CancellationToken) {
        self.tokens().insert(stream_id, token);
    }

    pub fn remove(&self, stream_id: &StreamId) {
        self.tokens().remove(stream_id);
    }

    /// Fires the token for `stream_id`. Returns false when nothing is running.
    pub fn cancel(&self, stream_id: &StreamId) -> bool {
        match self.tokens().get(stream_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct AppState {
    pub args: Arc<Args>,
    pub store: Arc<dyn MessageStore>,
    pub registry: Arc<StreamRegistry>,
    pub provider: Arc<dyn ModelProvider>,
    pub aggregator: Arc<StreamAggregator>,
    pub active: Arc<ActiveStreams>,
    pub tasks: TaskTracker,
}

impl AppState {
    /// Wires the shared services together. Every spawned stream task is
    /// tracked so shutdown can wait for final writes.
    pub fn build(
        args: Args,
        store: Arc<dyn MessageStore>,
        provider: Arc<dyn ModelProvider>,
        uploader: Arc<dyn ImageUploader>,
    ) -> Self {
        let tasks = TaskTracker::new();
        let registry = Arc::new(StreamRegistry::new(
            Duration::from_secs(crate::constants::STREAM_LINGER_SECS),
            tasks.clone(),
        ));
        let aggregator = Arc::new(StreamAggregator::new(
            store.clone(),
            uploader,
            tasks.clone(),
            AggregatorConfig {
                throttle: Duration::from_millis(args.throttle_ms),
                upload_retry: RetryPolicy::new(args.max_upload_retries, 200),
            },
        ));
        Self {
            args: Arc::new(args),
            store,
            registry,
            provider,
            aggregator,
            active: Arc::new(ActiveStreams::default()),
            tasks,
        }
    }
}
