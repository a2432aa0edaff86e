// * Configuration Constants
// * Central location for every default threshold, limit and timeout

// * Worker pool size (global concurrency)
pub const DEFAULT_THREADS: usize = 4;

// * Concurrent requests allowed against a single domain
pub const DEFAULT_PER_SITE_CONCURRENCY: usize = 2;

// * Work queue capacity per worker thread
pub const QUEUE_SLOTS_PER_THREAD: usize = 20;

// * Base inter-request delay in seconds (jittered to 0.5x..1.5x)
pub const DEFAULT_REQUEST_DELAY_SECS: f64 = 1.0;

// * Fetch attempts per URL before it is abandoned
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// * Exponential backoff base: sleep backoff_base ^ attempt seconds after a failure
pub const DEFAULT_BACKOFF_BASE: f64 = 2.0;

// * Total request timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 25;

// * Response bodies above this size are rejected (50 MiB)
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 50 * 1024 * 1024;

// * Circuit breaker: consecutive failures before a trip
pub const DEFAULT_BREAKER_THRESHOLD: u32 = 3;

// * Circuit breaker: how long a tripped domain stays blocked
pub const DEFAULT_BREAKER_COOLDOWN_SECS: u64 = 60;

// * Minimum length of the shorter image side in pixels
pub const DEFAULT_MIN_SIDE: u32 = 512;

// * Near-duplicate Hamming distance threshold
pub const DEFAULT_HAMMING_THRESHOLD: u32 = 5;

// * Watermark heuristic defaults
pub const DEFAULT_WATERMARK_BAND_RATIO: f64 = 0.15;
pub const DEFAULT_WATERMARK_EDGE_THRESHOLD: u8 = 25;
pub const DEFAULT_WATERMARK_EDGE_DENSITY: f64 = 0.08;

// * Minimum classifier score to keep an image
pub const DEFAULT_CLASSIFIER_THRESHOLD: f32 = 0.5;

// * JPEG encoder quality when re-encoding
pub const DEFAULT_JPEG_QUALITY: u8 = 95;

// * Progress heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;

// * Orientation ratio band treated as square (inclusive)
pub const SQUARE_RATIO_MIN: f64 = 0.9;
pub const SQUARE_RATIO_MAX: f64 = 1.1;

// * Fallback UA when the configured pool is empty
pub const FALLBACK_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/14.0 Safari/605.1.15",
];

pub const DEFAULT_WATERMARK_KEYWORDS: &[&str] = &["watermark", "wm", "overlay", "preview", "thumb"];

pub const DEFAULT_EXTENSIONS: &[&str] = &[".jpg", ".jpeg", ".png"];
