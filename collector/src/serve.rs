//! Operational HTTP surface: liveness, Prometheus metrics and the read-only
//! cluster report projection. The public tenant-facing API lives elsewhere.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use prometheus::{Encoder, TextEncoder};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::cluster::Cluster;
use crate::report;

pub async fn run_server(
    cluster: Arc<Cluster>,
    listen: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/v1/cluster", get(cluster_report))
        .layer(TraceLayer::new_for_http())
        .with_state(cluster);

    info!("operational server listening on {listen}");
    let listener = tokio::net::TcpListener::bind(listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn healthz(State(cluster): State<Arc<Cluster>>) -> impl IntoResponse {
    match sqlx::query("SELECT 1").execute(&cluster.pool).await {
        Ok(_) => (StatusCode::OK, "ok"),
        Err(e) => {
            error!(error = %e, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "database unreachable")
        }
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "metric encoding failed");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (
        StatusCode::OK,
        String::from_utf8(buffer).unwrap_or_default(),
    )
}

async fn cluster_report(
    State(cluster): State<Arc<Cluster>>,
) -> Result<Json<report::ClusterReport>, StatusCode> {
    report::load_cluster_report(&cluster.pool, &cluster.config)
        .await
        .map(Json)
        .map_err(|e| {
            error!(error = %e, "cluster report failed");
            StatusCode::INTERNAL_SERVER_ERROR
        })
}
