// * Operations: logging setup, Prometheus metrics and the metrics endpoint

pub mod telemetry;

// * Re-exports for convenient access
pub use telemetry::{
    decrement_in_flight, get_metrics_string, increment_in_flight, init_tracing,
    init_tracing_pretty, init_tracing_with_level, record_breaker_trip, record_bytes_downloaded,
    record_drop, record_fetch_attempt, record_image_saved, set_queue_depth, start_metrics_server,
    MetricsServerHandle,
};
