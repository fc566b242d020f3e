use axum::{http::StatusCode, response::IntoResponse};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder");

        // Initialize metrics
        metrics::describe_counter!(
            "matchmaking_searches_total",
            "Total number of started matchmaking searches"
        );
        metrics::describe_counter!(
            "matchmaking_matches_total",
            "Total number of matches produced, labeled by kind"
        );
        metrics::describe_counter!(
            "matchmaking_cancellations_total",
            "Total number of cancelled searches"
        );
        metrics::describe_gauge!(
            "push_sessions_active",
            "Number of connected push sessions"
        );

        Self { handle }
    }

    pub fn handle(&self) -> &PrometheusHandle {
        &self.handle
    }
}

impl Default for MetricsRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler for Prometheus metrics endpoint
pub async fn metrics_handler(handle: axum::extract::State<PrometheusHandle>) -> impl IntoResponse {
    let rendered = handle.render();
    (StatusCode::OK, rendered)
}
