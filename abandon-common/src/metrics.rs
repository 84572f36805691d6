use std::future::ready;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it.
/// This function is intended to take a Router as returned by `setup_metrics_router`.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

pub async fn index() -> &'static str {
    "abandonment worker"
}

/// Build a Router exposing Prometheus metrics and the liveness probe.
pub fn setup_metrics_router(liveness: HealthRegistry) -> Router {
    let recorder_handle = setup_metrics_recorder();

    Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
        .route("/metrics", get(move || ready(recorder_handle.render())))
}

/// Install the global Prometheus recorder. Panics if a recorder is already installed,
/// so this must run once at startup.
pub fn setup_metrics_recorder() -> PrometheusHandle {
    // Stage latencies: cache round trips sit at the low end, lookups and writes higher up.
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)
        .expect("histogram buckets are not empty")
        .install_recorder()
        .expect("failed to install prometheus recorder")
}
