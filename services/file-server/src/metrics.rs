use axum::http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, HistogramVec, TextEncoder,
};
use tokio::time::Instant;

static REQUEST_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "http_request_duration_seconds",
        "A histogram of latencies for requests",
        &["ip"]
    )
    .expect("register request latency histogram")
});

static REQUEST_STATUS_CODES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "http_request_status_codes",
        "Counter of status codes returned by HTTP server",
        &["code", "ip"]
    )
    .expect("register status code counter")
});

/// Records one finished request against the per-IP series.
pub fn observe_request(start: Instant, status: StatusCode, ip: &str) {
    REQUEST_LATENCY
        .with_label_values(&[ip])
        .observe(start.elapsed().as_secs_f64());
    REQUEST_STATUS_CODES
        .with_label_values(&[status.as_str(), ip])
        .inc();
}

/// The default registry in Prometheus text format. The process collector is
/// registered there automatically, so `process_cpu_seconds_total` rides
/// along with the request series.
pub fn render() -> anyhow::Result<String> {
    Ok(TextEncoder::new().encode_to_string(&prometheus::gather())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn observed_requests_show_up_in_the_exposition() {
        let start = Instant::now() - Duration::from_millis(5);
        observe_request(start, StatusCode::OK, "1.2.3.4");
        observe_request(start, StatusCode::NOT_FOUND, "1.2.3.4");

        let text = render().expect("render metrics");
        assert!(text.contains("http_request_duration_seconds"));
        assert!(text.contains(r#"http_request_status_codes{code="200",ip="1.2.3.4"}"#));
        assert!(text.contains(r#"http_request_status_codes{code="404",ip="1.2.3.4"}"#));
    }
}
