//! Prometheus collectors for the watch engine and the `/metrics` endpoint.
//!
//! Collectors are process-wide statics; an engine built with
//! `enable_metrics = false` simply never touches them.


use std::sync::Once;

use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Histogram;
use prometheus::HistogramOpts;
use prometheus::IntCounter;
use prometheus::IntGauge;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref WATCHER_TOTAL: IntGauge =
        IntGauge::new("watcher_total", "Number of active watchers")
            .expect("metric can not be created");

    pub static ref SLOW_WATCHER_TOTAL: IntGauge =
        IntGauge::new("slow_watcher_total", "Number of watchers in the unsynced group")
            .expect("metric can not be created");

    pub static ref WATCH_STREAM_TOTAL: IntGauge =
        IntGauge::new("watch_stream_total", "Number of open watch streams")
            .expect("metric can not be created");

    pub static ref WATCHER_DEMOTED_TOTAL: IntCounter = IntCounter::new(
        "watcher_demoted_total",
        "Synced watchers moved to the unsynced group because their buffer was full"
    )
    .expect("metric can not be created");

    pub static ref WATCHER_COMPACTED_TOTAL: IntCounter = IntCounter::new(
        "watcher_compacted_total",
        "Watchers cancelled because their history was compacted"
    )
    .expect("metric can not be created");

    pub static ref WATCH_CATCHUP_LAG_REVISIONS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "watch_catchup_lag_revisions",
            "Revisions an unsynced watcher trails the store by, sampled each catch-up round"
        )
        .buckets(exponential_buckets(1.0, 4.0, 10).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref WATCH_CATCHUP_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "watch_catchup_duration_seconds",
            "Wall time of one catch-up round"
        )
        .buckets(exponential_buckets(0.0005, 2.0, 16).expect("valid buckets"))
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

static REGISTER_DEFAULT: Once = Once::new();

pub(crate) fn register_custom_metrics(registry: &Registry) {
    registry
        .register(Box::new(WATCHER_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(SLOW_WATCHER_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_STREAM_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCHER_DEMOTED_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCHER_COMPACTED_TOTAL.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_CATCHUP_LAG_REVISIONS.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_CATCHUP_DURATION_SECONDS.clone()))
        .expect("collector can be registered");
}

/// Registers every collector into [`REGISTRY`]; safe to call more than once
pub fn init_metrics() {
    REGISTER_DEFAULT.call_once(|| register_custom_metrics(&REGISTRY));
}

/// Text exposition of everything in `registry`
pub fn gather_metrics(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    };
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}

/// Serves `/metrics` on `0.0.0.0:port` until `shutdown_signal` fires
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    init_metrics();
    info!("metrics endpoint listening on port {}", port);

    let (_, server) = warp::serve(metrics_route(REGISTRY.clone()))
        .bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
            let _ = shutdown_signal.changed().await;
        });
    server.await;
}

fn metrics_route(
    registry: Registry
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    warp::path!("metrics")
        .map(move || registry.clone())
        .and_then(metrics_handler)
}

async fn metrics_handler(registry: Registry) -> Result<impl Reply, Rejection> {
    Ok(gather_metrics(&registry))
}
