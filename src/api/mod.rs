//! HTTP API of a node
//!
//! Three groups of routes:
//! - client routes, behind the readiness gate and the forwarder
//! - status, admin and internal routes, behind the readiness gate only
//! - the peer status resource and liveness check, always served

mod internal;
mod status;
mod titles;

pub use status::{HealthView, NodeHealth};
pub use titles::replication_targets;

use crate::cluster::{
    forwarding_middleware, ClusterState, Forwarder, HealthMonitor, PeerClient,
    LOCAL_FAILURE_HEADER, STATUS_PATH,
};
use crate::common::tracing_middleware::request_tracing_middleware;
use crate::common::Config;
use crate::recovery::{readiness_middleware, ReadinessGate, RecoveryCoordinator};
use crate::storage::QueryExecutor;
use crate::txlog::TransactionLog;
use axum::{
    http::HeaderValue,
    middleware::{from_fn, from_fn_with_state},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;

/// Everything a handler can reach
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub cluster: Arc<ClusterState>,
    pub monitor: Arc<HealthMonitor>,
    pub executor: Arc<dyn QueryExecutor>,
    pub txlog: Arc<TransactionLog>,
    pub peers: Arc<PeerClient>,
    pub recovery: Arc<RecoveryCoordinator>,
    pub forwarder: Arc<Forwarder>,
    pub gate: ReadinessGate,
}

/// Error returned by handlers; rendered as JSON with the mapped status.
///
/// Connectivity failures are tagged so the forwarder can fail over.
pub struct ApiError(pub crate::Error);

impl<E: Into<crate::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        ApiError(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let mut response = (
            err.to_http_status(),
            Json(json!({
                "success": false,
                "error": err.code(),
                "message": err.to_string(),
            })),
        )
            .into_response();
        if err.is_connectivity() {
            response
                .headers_mut()
                .insert(LOCAL_FAILURE_HEADER, HeaderValue::from_static("connectivity"));
        }
        response
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn create_router(state: AppState) -> Router {
    let forwarded = Router::new()
        .route("/api/titles/distributed-insert", post(titles::insert))
        .route("/api/titles/distributed-update", post(titles::update))
        .route("/api/titles/distributed-delete", post(titles::delete))
        .route("/api/titles/add-reviews", post(titles::add_reviews))
        .route("/api/titles/distributed-select", get(titles::select))
        .route("/api/titles/distributed-search", get(titles::search))
        .route("/api/titles/search-advanced", get(titles::search_advanced))
        .route("/api/titles/top-by-year", get(titles::top_by_year))
        .route("/api/aggregation", get(titles::aggregation))
        .route_layer(from_fn_with_state(
            state.forwarder.clone(),
            forwarding_middleware,
        ));

    let gated = Router::new()
        .route("/api/db-status", get(status::db_status))
        .route("/api/db-check-health", post(status::db_check_health))
        .route("/api/recovery/check-status", get(status::check_status))
        .route("/api/recovery/run", post(status::run_recovery))
        .route("/api/transactions", get(status::transactions))
        .route("/api/admin/node-mode", post(status::set_node_mode))
        .route("/api/internal/apply", post(internal::apply))
        .route("/api/recovery/digest", get(internal::digest))
        .route("/api/recovery/sync", post(internal::sync))
        .route("/api/recovery/outstanding/:node", get(internal::outstanding))
        .route("/api/recovery/replayed", post(internal::replayed))
        .merge(forwarded)
        .route_layer(from_fn_with_state(state.gate.clone(), readiness_middleware));

    Router::new()
        .route(STATUS_PATH, get(status::node_status))
        .route("/health/live", get(status::live))
        .merge(gated)
        .layer(from_fn(request_tracing_middleware))
        .with_state(state)
}
