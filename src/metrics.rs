use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use prometheus::{
    Encoder, Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder,
};
use std::env;
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "rampload".to_string());

    // === Request Metrics ===

    pub static ref REQUEST_TOTAL: IntCounter =
        IntCounter::with_opts(
            Opts::new("requests_total", "Total number of HTTP requests made")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_STATUS_CODES: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_status_codes_total", "Number of HTTP requests by status code")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["status_code"]
        ).unwrap();

    pub static ref REQUEST_ERRORS_BY_CATEGORY: IntCounterVec =
        IntCounterVec::new(
            Opts::new("requests_errors_total", "Failed HTTP requests by error category")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["category"]
        ).unwrap();

    pub static ref CONCURRENT_REQUESTS: IntGauge =
        IntGauge::with_opts(
            Opts::new("concurrent_requests", "Number of HTTP requests currently in flight")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref REQUEST_DURATION_SECONDS: Histogram =
        Histogram::with_opts(
            prometheus::HistogramOpts::new(
                "request_duration_seconds",
                "HTTP request latencies in seconds."
            ).namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    // === Scenario Metrics ===

    pub static ref SCENARIO_EXECUTIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("scenario_executions_total", "Total number of scenario executions")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario", "status"]  // status: success, failed
        ).unwrap();

    pub static ref SCENARIO_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "scenario_duration_seconds",
                "Scenario execution duration in seconds"
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["scenario"]
        ).unwrap();

    pub static ref SCENARIO_STEPS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("scenario_steps_total", "Total number of scenario steps")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["scenario", "step", "status"]  // status: success, failed, skipped
        ).unwrap();

    pub static ref CHECK_RESULTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("check_results_total", "Check outcomes by check name")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["check", "result"]  // result: pass, fail
        ).unwrap();

    // === Scheduler Metrics ===

    pub static ref ACTIVE_VUS: IntGauge =
        IntGauge::with_opts(
            Opts::new("active_vus", "Virtual users currently running")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref TARGET_VUS: IntGauge =
        IntGauge::with_opts(
            Opts::new("target_vus", "Virtual users requested by the ramp profile")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref THRESHOLD_VIOLATIONS: IntGauge =
        IntGauge::with_opts(
            Opts::new("threshold_violations", "Thresholds failing at the last evaluation")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let registry = prometheus::default_registry();

    registry.register(Box::new(REQUEST_TOTAL.clone()))?;
    registry.register(Box::new(REQUEST_STATUS_CODES.clone()))?;
    registry.register(Box::new(REQUEST_ERRORS_BY_CATEGORY.clone()))?;
    registry.register(Box::new(CONCURRENT_REQUESTS.clone()))?;
    registry.register(Box::new(REQUEST_DURATION_SECONDS.clone()))?;

    registry.register(Box::new(SCENARIO_EXECUTIONS_TOTAL.clone()))?;
    registry.register(Box::new(SCENARIO_DURATION_SECONDS.clone()))?;
    registry.register(Box::new(SCENARIO_STEPS_TOTAL.clone()))?;
    registry.register(Box::new(CHECK_RESULTS_TOTAL.clone()))?;

    registry.register(Box::new(ACTIVE_VUS.clone()))?;
    registry.register(Box::new(TARGET_VUS.clone()))?;
    registry.register(Box::new(THRESHOLD_VIOLATIONS.clone()))?;

    Ok(())
}

/// Encodes everything in the default registry in the text exposition format.
pub fn gather_metrics_string() -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let response = match gather_metrics_string() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", TextEncoder::new().format_type())
            .body(Body::from(text)),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("failed to encode metrics"))
        }
    };

    Ok(response.unwrap_or_else(|_| Response::new(Body::empty())))
}

/// Serves `/metrics` (any path, in fact) until the process exits.
pub async fn start_metrics_server(port: u16) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let make_svc =
        make_service_fn(|_conn| async { Ok::<_, hyper::Error>(service_fn(metrics_handler)) });

    let server = match Server::try_bind(&addr) {
        Ok(builder) => builder.serve(make_svc),
        Err(e) => {
            error!(port = port, error = %e, "Failed to bind metrics server");
            return;
        }
    };
    info!(port = port, addr = %addr, "Metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "Metrics server error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_contains_namespaced_metric() {
        // registration is process-wide; a second call in the same binary fails harmlessly
        let _ = register_metrics();
        REQUEST_TOTAL.inc();
        let text = gather_metrics_string().unwrap();
        assert!(text.contains("rampload_requests_total"));
    }
}
