// * Telemetry - JSON Logging and Prometheus Metrics
// * Structured logging setup plus the pipeline's counters and gauges

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, StatusCode};
use lazy_static::lazy_static;
use prometheus::{
    register_counter, register_counter_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Counter, CounterVec, Encoder, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// * Registration only fails on a duplicate name, which is a programming error
lazy_static! {
    // * Images persisted to the storage tree
    pub static ref IMAGES_SAVED_TOTAL: IntCounter = register_int_counter!(
        "snapcrawler_images_saved_total",
        "Total images persisted"
    ).unwrap();

    // * Candidates that produced nothing, by reason
    pub static ref CANDIDATES_DROPPED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "snapcrawler_candidates_dropped_total",
        "Candidates dropped by reason",
        &["reason"]
    ).unwrap();

    // * Individual HTTP attempts by result
    pub static ref FETCH_ATTEMPTS_TOTAL: CounterVec = register_counter_vec!(
        "snapcrawler_fetch_attempts_total",
        "Fetch attempts by result",
        &["result"]
    ).unwrap();

    pub static ref BYTES_DOWNLOADED_TOTAL: Counter = register_counter!(
        "snapcrawler_bytes_downloaded_total",
        "Image bytes downloaded"
    ).unwrap();

    pub static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "snapcrawler_queue_depth",
        "Candidates waiting in the work queue"
    ).unwrap();

    pub static ref BREAKER_TRIPS_TOTAL: IntCounter = register_int_counter!(
        "snapcrawler_breaker_trips_total",
        "Circuit breaker trips across all domains"
    ).unwrap();

    pub static ref WORKERS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "snapcrawler_workers_in_flight",
        "Candidates currently being processed"
    ).unwrap();
}

/// Initializes the tracing subscriber with JSON formatting
///
/// # Example
/// ```ignore
/// use snapcrawler::ops::telemetry;
///
/// telemetry::init_tracing();
/// tracing::info!(url = "https://example.com/a.jpg", "Fetching image");
/// ```
pub fn init_tracing() {
    init_tracing_with_level("info");
}

/// Initializes tracing with a custom default level; `RUST_LOG` still wins
pub fn init_tracing_with_level(level: &str) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initializes tracing with pretty formatting (for development)
pub fn init_tracing_pretty() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().pretty())
        .init();
}

/// Metrics server handle for graceful shutdown
pub struct MetricsServerHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    running: Arc<AtomicBool>,
    addr: SocketAddr,
}

impl MetricsServerHandle {
    /// Signals the metrics server to shut down
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

/// Starts the Prometheus metrics HTTP server (`/metrics`, `/health`).
///
/// Port 0 binds an ephemeral port; read it back from the handle.
pub async fn start_metrics_server(port: u16) -> Result<MetricsServerHandle, hyper::Error> {
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();

    let bind_addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc = hyper::service::make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(hyper::service::service_fn(handle_metrics_request))
    });
    let server = hyper::Server::try_bind(&bind_addr)?.serve(make_svc);
    let addr = server.local_addr();

    tokio::spawn(async move {
        let server = server.with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });

        tracing::info!(port = addr.port(), "Metrics server started");

        if let Err(e) = server.await {
            tracing::error!(error = %e, "Metrics server error");
        }

        running_clone.store(false, Ordering::Relaxed);
        tracing::info!("Metrics server stopped");
    });

    Ok(MetricsServerHandle {
        shutdown_tx: Some(shutdown_tx),
        running,
        addr,
    })
}

async fn handle_metrics_request(
    req: Request<Body>,
) -> Result<Response<Body>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => respond(
            StatusCode::OK,
            prometheus::TEXT_FORMAT,
            Body::from(get_metrics_string()),
        ),
        "/health" => respond(StatusCode::OK, "text/plain", Body::from("OK")),
        _ => respond(StatusCode::NOT_FOUND, "text/plain", Body::from("Not Found")),
    };
    Ok(response)
}

fn respond(status: StatusCode, content_type: &'static str, body: Body) -> Response<Body> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

/// Returns the current metrics in the Prometheus text format
pub fn get_metrics_string() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub fn record_image_saved() {
    IMAGES_SAVED_TOTAL.inc();
}

pub fn record_drop(reason: &str) {
    CANDIDATES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
}

/// Records one HTTP attempt: "success", or a failure reason label
pub fn record_fetch_attempt(result: &str) {
    FETCH_ATTEMPTS_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_bytes_downloaded(bytes: u64) {
    BYTES_DOWNLOADED_TOTAL.inc_by(bytes as f64);
}

pub fn record_breaker_trip() {
    BREAKER_TRIPS_TOTAL.inc();
}

pub fn set_queue_depth(depth: i64) {
    QUEUE_DEPTH.set(depth);
}

pub fn increment_in_flight() {
    WORKERS_IN_FLIGHT.inc();
}

pub fn decrement_in_flight() {
    WORKERS_IN_FLIGHT.dec();
}
