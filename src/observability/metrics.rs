use std::time::Instant;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// ---------------------------------------------------------------------------
// Metrics catalog
// ---------------------------------------------------------------------------

/// Register all metric descriptors at startup.
///
/// Call once after the recorder is installed and before anything is recorded.
pub fn describe_all_metrics() {
    // -- Delivery --
    describe_counter!(
        "tunebridge_stream_requests_total",
        "Stream proxy requests by response status"
    );
    describe_counter!(
        "tunebridge_stream_bytes_sent_total",
        "Audio bytes relayed to clients"
    );
    describe_histogram!(
        "tunebridge_upstream_fetch_duration_seconds",
        "Time until the object store answered a download with headers"
    );

    // -- Object store --
    describe_counter!(
        "tunebridge_provider_authorizations_total",
        "Account authorization round-trips by result"
    );

    // -- Synchronization --
    describe_counter!("tunebridge_sync_runs_total", "Reconciliation runs by result");
    describe_counter!(
        "tunebridge_sync_items_total",
        "Reconciled objects by outcome"
    );
    describe_histogram!(
        "tunebridge_sync_duration_seconds",
        "Wall time of one reconciliation run"
    );

    // -- System --
    describe_gauge!("tunebridge_uptime_seconds", "Process uptime");
}

// ---------------------------------------------------------------------------
// Metric recording helpers
// ---------------------------------------------------------------------------

// -- Delivery --

pub fn inc_stream_request(status: u16) {
    counter!("tunebridge_stream_requests_total", "status" => status.to_string()).increment(1);
}

pub fn add_stream_bytes_sent(bytes: u64) {
    counter!("tunebridge_stream_bytes_sent_total").increment(bytes);
}

pub fn record_upstream_fetch_duration(seconds: f64) {
    histogram!("tunebridge_upstream_fetch_duration_seconds").record(seconds);
}

// -- Object store --

pub fn inc_provider_authorization(result: &str) {
    counter!("tunebridge_provider_authorizations_total", "result" => result.to_string())
        .increment(1);
}

// -- Synchronization --

pub fn record_sync_run(result: &str, seconds: f64) {
    counter!("tunebridge_sync_runs_total", "result" => result.to_string()).increment(1);
    histogram!("tunebridge_sync_duration_seconds").record(seconds);
}

pub fn inc_sync_item(status: &str) {
    counter!("tunebridge_sync_items_total", "status" => status.to_string()).increment(1);
}

// -- System --

pub fn set_uptime_seconds(seconds: f64) {
    gauge!("tunebridge_uptime_seconds").set(seconds);
}

// ---------------------------------------------------------------------------
// Uptime tracking task
// ---------------------------------------------------------------------------

/// Update the uptime gauge every second until cancelled.
pub async fn run_uptime_task(start_time: Instant, cancel: tokio_util::sync::CancellationToken) {
    let interval = std::time::Duration::from_secs(1);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {
                set_uptime_seconds(start_time.elapsed().as_secs_f64());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Prometheus recorder installation
// ---------------------------------------------------------------------------

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_prometheus_recorder() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}"))
}
