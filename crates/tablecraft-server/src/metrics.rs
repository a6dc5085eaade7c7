//! Prometheus metrics

use axum::http::StatusCode;
use axum::response::Response;
use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use tracing::{debug, error};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    /// Requests by endpoint and outcome
    pub static ref REQUESTS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tablecraft_requests_total", "Total number of API requests"),
        &["endpoint", "status"]
    ).unwrap();

    pub static ref REQUEST_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("tablecraft_request_duration_seconds", "API request duration in seconds")
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]),
        &["endpoint"]
    ).unwrap();

    /// Committed operations by label, e.g. Create-Table or Insert
    pub static ref OPERATIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new("tablecraft_operations_total", "Total number of committed operations"),
        &["kind"]
    ).unwrap();
}

pub fn init_metrics() -> anyhow::Result<()> {
    REGISTRY.register(Box::new(REQUESTS_TOTAL.clone()))?;
    REGISTRY.register(Box::new(REQUEST_DURATION.clone()))?;
    REGISTRY.register(Box::new(OPERATIONS_TOTAL.clone()))?;

    debug!("Metrics initialized successfully");
    Ok(())
}

pub fn record_request(endpoint: &str, status: &str, duration_seconds: f64) {
    REQUESTS_TOTAL.with_label_values(&[endpoint, status]).inc();
    REQUEST_DURATION
        .with_label_values(&[endpoint])
        .observe(duration_seconds);
}

pub fn record_operations<'a>(kinds: impl IntoIterator<Item = &'a str>) {
    for kind in kinds {
        OPERATIONS_TOTAL.with_label_values(&[kind]).inc();
    }
}

/// `GET /metrics`
pub async fn metrics_handler() -> Result<Response<String>, StatusCode> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("Failed to encode metrics: {}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    let body = String::from_utf8(buffer).map_err(|e| {
        error!("Failed to convert metrics to string: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    Response::builder()
        .status(200)
        .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
        .body(body)
        .map_err(|e| {
            error!("Failed to build response: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let before = REQUESTS_TOTAL.with_label_values(&["test_endpoint", "ok"]).get();
        record_request("test_endpoint", "ok", 0.01);
        assert_eq!(REQUESTS_TOTAL.with_label_values(&["test_endpoint", "ok"]).get(), before + 1.0);
    }

    #[test]
    fn test_record_operations() {
        let before = OPERATIONS_TOTAL.with_label_values(&["Test-Kind"]).get();
        record_operations(["Test-Kind", "Test-Kind"]);
        assert_eq!(OPERATIONS_TOTAL.with_label_values(&["Test-Kind"]).get(), before + 2.0);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        // Another test may have registered already.
        let _ = init_metrics();
        record_request("schema", "ok", 0.02);

        let response = metrics_handler().await.unwrap();
        assert_eq!(response.status(), 200);
        assert!(response.body().contains("tablecraft_requests_total"));
    }
}
