use std::sync::Arc;

use axum::{routing::get, Router};
use futures::future::ready;
use health::HealthMonitor;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::AdapterError;

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const BUCKETS: &[f64] = &[0.0, 0.5, 1.0];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .install_recorder()
}

/// `/_liveness` reports the aggregate health, `/_readiness` only that the
/// process is serving.
pub fn router(monitor: Arc<HealthMonitor>, recorder: Option<PrometheusHandle>) -> Router {
    let router = Router::new()
        .route("/", get(|| async { "bus adapter" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let monitor = monitor.clone();
                async move { monitor.get_status() }
            }),
        );

    match recorder {
        Some(recorder) => router.route("/metrics", get(move || ready(recorder.render()))),
        None => router,
    }
}

/// Binds the monitoring listener. Failing here aborts startup before the
/// transport is touched.
pub async fn bind(address: &str) -> Result<TcpListener, AdapterError> {
    let listener = TcpListener::bind(address)
        .await
        .map_err(AdapterError::Monitoring)?;
    info!(entity = "monitoring", "listening on {}", address);
    Ok(listener)
}

pub fn serve(listener: TcpListener, router: Router, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            error!(entity = "monitoring", "monitoring server failed: {}", e);
        }
    })
}
