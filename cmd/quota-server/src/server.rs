use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use pkg_cluster::{ClusterError, ClusterRegistry};
use pkg_metrics::MetricsRegistry;
use pkg_quota::{QuotaEngine, QuotaError};
use pkg_types::cluster::ClusterFilters;
use pkg_types::context::RequestContext;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QuotaEngine>,
    pub clusters: Arc<ClusterRegistry>,
    pub metrics: Arc<MetricsRegistry>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/v1/projects/{project}/quotas", get(project_quotas))
        .route("/v1/clusters", get(list_clusters))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    info!("Starting quota server on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// GET /healthz
async fn healthz() -> &'static str {
    "ok"
}

/// GET /metrics: Prometheus text exposition.
async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// GET /v1/projects/{project}/quotas: effective limits with usage.
async fn project_quotas(State(state): State<AppState>, Path(project): Path<String>) -> Response {
    let ctx = RequestContext::admin();
    match state.engine.get_project_quotas(&ctx, &project, true).await {
        Ok(quotas) => (StatusCode::OK, Json(quotas)).into_response(),
        Err(e) => quota_error(e),
    }
}

/// GET /v1/clusters: every live cluster with its membership summary.
async fn list_clusters(State(state): State<AppState>) -> Response {
    let ctx = RequestContext::admin();
    let filters = ClusterFilters {
        services_summary: true,
        ..Default::default()
    };
    match state.clusters.cluster_get_all(&ctx, &filters).await {
        Ok(views) => (StatusCode::OK, Json(views)).into_response(),
        Err(e) => cluster_error(e),
    }
}

fn quota_error(e: QuotaError) -> Response {
    let status = match &e {
        QuotaError::OverQuota(_) => StatusCode::PAYLOAD_TOO_LARGE,
        QuotaError::ProjectQuotaNotFound { .. }
        | QuotaError::QuotaClassNotFound { .. }
        | QuotaError::QuotaUsageNotFound { .. } => StatusCode::NOT_FOUND,
        QuotaError::UnknownResources(_)
        | QuotaError::InvalidQuotaValue { .. }
        | QuotaError::InvalidReservationExpiration(_) => StatusCode::BAD_REQUEST,
        QuotaError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        QuotaError::Store(_) => {
            error!("Quota store error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}

fn cluster_error(e: ClusterError) -> Response {
    let status = match &e {
        ClusterError::ClusterExists { .. } | ClusterError::ClusterHasHosts { .. } => {
            StatusCode::CONFLICT
        }
        ClusterError::ClusterNotFound(_) | ClusterError::ServiceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        ClusterError::Invalid(_) => StatusCode::BAD_REQUEST,
        ClusterError::NotAuthorized(_) => StatusCode::FORBIDDEN,
        ClusterError::Store(_) => {
            error!("Cluster store error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string()).into_response()
}
