pub const RETRYABLE_STATUS_CODES: &[u16] = &[429, 500, 502, 503, 504, 520];

/// The only tool whose lifecycle the aggregator tracks.
pub const IMAGE_GEN_TOOL: &str = "image_gen";

/// Synthetic text appended to content when image generation starts.
pub const IMAGE_GENERATION_MARKER: &str = "\n\n🖼️ Image Generation";
pub const IMAGE_GENERATION_MARKER_NEEDLE: &str = "🖼️ Image Generation";

pub const LOADING_KEY_PREFIX: &str = "loading-";
pub const FAILED_KEY_PREFIX: &str = "failed-";
/// Placeholder added client-side when the marker is seen before any loading event.
pub const TEXT_BASED_LOADING_KEY: &str = "loading-text-based";
pub const LOADING_ALT: &str = "Generating image...";
pub const DEFAULT_IMAGE_ALT: &str = "Generated image";
pub const GENERATED_IMAGE_MIME: &str = "image/png";

/// Persistence throttle
pub const DEFAULT_THROTTLE_MS: u64 = 500;

/// Reconciliation
pub const RECONCILE_SLACK_CHARS: usize = 10;
pub const FORCE_RECONCILE_AFTER_SECS: u64 = 30;

/// Wire framing
pub const WIRE_CHANNEL_CAPACITY: usize = 256;
pub const STREAM_LINGER_SECS: u64 = 30;
/// Finish reason sent when the server cuts a stream short.
pub const CANCELLED_FINISH_REASON: &str = "cancelled";
pub const STREAM_ID_HEADER: &str = "x-stream-id";
pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const MAX_UPSTREAM_LINE_BYTES: usize = 32 * 1024 * 1024;

/// Request limits
pub const MAX_HISTORY_MESSAGES: usize = 500;
pub const MAX_PARTS_PER_MESSAGE: usize = 64;

/// Upstream endpoints
pub const DEFAULT_UPSTREAM_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const IMAGE_GENERATION_MODEL: &str = "gpt-image-1";

/// Database defaults
pub const DB_PRAGMAS: &[&str] = &[
    "PRAGMA journal_mode = WAL",
    "PRAGMA synchronous = NORMAL",
    "PRAGMA busy_timeout = 5000",
];
