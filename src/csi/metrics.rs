use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// CSI metrics collector
pub struct CsiMetrics {
    /// Total CSI operations
    pub operations_total: CounterVec,
    /// CSI operation duration in seconds
    pub operation_duration: HistogramVec,
    /// CSI operation errors
    pub operation_errors: CounterVec,
    /// Fencing calls by action (stop/start) and result
    pub fencing_actions: CounterVec,
}

impl CsiMetrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = CounterVec::new(
            Opts::new("alcub_csi_operations_total", "Total CSI operations"),
            &["method"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "alcub_csi_operation_duration_seconds",
                "CSI operation duration in seconds",
            ),
            &["method"],
        )?;

        let operation_errors = CounterVec::new(
            Opts::new("alcub_csi_operation_errors_total", "CSI operation errors"),
            &["method"],
        )?;

        let fencing_actions = CounterVec::new(
            Opts::new("alcub_fencing_actions_total", "Node fencing calls"),
            &["action", "result"],
        )?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(fencing_actions.clone()))?;

        Ok(Self { operations_total, operation_duration, operation_errors, fencing_actions })
    }

    /// Record an operation
    pub fn record_operation(&self, method: &str, duration_secs: f64, success: bool) {
        self.operations_total.with_label_values(&[method]).inc();
        self.operation_duration.with_label_values(&[method]).observe(duration_secs);
        if !success {
            self.operation_errors.with_label_values(&[method]).inc();
        }
    }

    pub fn record_fencing(&self, action: &str, success: bool) {
        let result = if success { "ok" } else { "error" };
        self.fencing_actions.with_label_values(&[action, result]).inc();
    }
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    match encoder.encode(&registry.gather(), &mut buffer) {
        Ok(()) => (StatusCode::OK, [(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer)
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

/// `/metrics` in Prometheus text format plus a `/healthz` liveness probe.
pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(registry)
}

pub async fn serve(addr: SocketAddr, registry: Arc<Registry>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Metrics listening on {}", listener.local_addr()?);
    axum::serve(listener, router(registry)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csi_metrics_creation() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry).unwrap();

        metrics.record_operation("CreateVolume", 1.5, true);
        assert_eq!(metrics.operations_total.with_label_values(&["CreateVolume"]).get(), 1.0);
        assert_eq!(metrics.operation_errors.with_label_values(&["CreateVolume"]).get(), 0.0);
    }

    #[test]
    fn test_fencing_metrics() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry).unwrap();

        metrics.record_fencing("stop", true);
        metrics.record_fencing("stop", false);
        assert_eq!(metrics.fencing_actions.with_label_values(&["stop", "ok"]).get(), 1.0);
        assert_eq!(metrics.fencing_actions.with_label_values(&["stop", "error"]).get(), 1.0);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        CsiMetrics::new(registry.clone()).unwrap();
        assert!(CsiMetrics::new(registry).is_err());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = Arc::new(Registry::new());
        let metrics = CsiMetrics::new(registry.clone()).unwrap();
        metrics.record_operation("NodePublishVolume", 0.1, false);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router(registry)).await.unwrap() });

        let body = reqwest::get(format!("http://{}/metrics", addr)).await.unwrap().text().await.unwrap();
        assert!(body.contains("alcub_csi_operation_errors_total"));
        let health = reqwest::get(format!("http://{}/healthz", addr)).await.unwrap();
        assert!(health.status().is_success());
    }
}
