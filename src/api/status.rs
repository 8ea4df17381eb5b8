//! Status, recovery and admin routes

use super::{ApiError, ApiResult, AppState};
use crate::cluster::NodeStatus;
use crate::common::{NodeId, NodeMode};
use crate::recovery::{PassKind, RecoveryState};
use crate::storage::{ExecOptions, QueryOutput, Statement};
use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 1000;

/// Status resource polled by peers
pub async fn node_status(State(state): State<AppState>) -> Json<NodeStatus> {
    let node = state.cluster.node();
    let database_healthy = state.monitor.check_local_health().await;
    let table = state.cluster.snapshot();
    let peers = table
        .iter()
        .map(|(n, record)| (n.as_str().to_string(), record.clone()))
        .collect::<BTreeMap<_, _>>();

    Json(NodeStatus {
        node,
        is_coordinator: node.is_coordinator(),
        database_healthy,
        is_acting_master: table.get(node).is_acting_master,
        recovering: state.cluster.is_recovering() || !state.gate.is_open(),
        peers,
    })
}

pub async fn live() -> StatusCode {
    StatusCode::OK
}

/// One row of the health table as shown to operators
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeHealth {
    pub node: NodeId,
    pub name: String,
    pub url: String,
    pub available: bool,
    pub is_acting_master: bool,
    pub last_checked: Option<DateTime<Utc>>,
}

/// Body of the db-status routes
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthView {
    pub current_node: NodeId,
    pub nodes: Vec<NodeHealth>,
    pub best_read_node: Option<NodeId>,
    pub best_write_node: Option<NodeId>,
    pub recovery_state: RecoveryState,
    pub ready: bool,
}

fn health_view(state: &AppState) -> HealthView {
    let table = state.cluster.snapshot();
    let nodes = table
        .iter()
        .map(|(node, record)| NodeHealth {
            node,
            name: node.display_name().to_string(),
            url: state.cluster.url_of(node).to_string(),
            available: record.available,
            is_acting_master: record.is_acting_master,
            last_checked: record.last_checked,
        })
        .collect();

    HealthView {
        current_node: state.cluster.node(),
        nodes,
        best_read_node: state.monitor.get_best_read_node().ok(),
        best_write_node: state.monitor.get_best_write_node().ok(),
        recovery_state: state.recovery.state(),
        ready: state.gate.is_open(),
    }
}

pub async fn db_status(State(state): State<AppState>) -> Json<HealthView> {
    Json(health_view(&state))
}

/// Refresh the whole health table before answering
pub async fn db_check_health(State(state): State<AppState>) -> Json<HealthView> {
    state.monitor.check_local_health_now().await;
    state.monitor.check_peers_now().await;
    Json(health_view(&state))
}

pub async fn check_status(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let node = state.cluster.node();
    let mut outstanding = serde_json::Map::new();
    for peer in node.peers() {
        let count = state.txlog.find_outstanding(peer, None)?.len();
        outstanding.insert(peer.as_str().to_string(), json!(count));
    }

    // Workers compare their own slice, MAIN compares both
    let workers: Vec<NodeId> = if node.is_coordinator() {
        vec![NodeId::NodeA, NodeId::NodeB]
    } else {
        vec![node]
    };
    let mut partitions = Vec::new();
    let mut errors = serde_json::Map::new();
    for worker in workers {
        match state.recovery.partition_health(worker).await {
            Ok(health) => partitions.push(health),
            Err(e) => {
                warn!(%worker, error = %e, "Partition comparison failed");
                errors.insert(worker.as_str().to_string(), json!(e.to_string()));
            }
        }
    }
    let needs_recovery = partitions.iter().any(|h| h.needs_recovery);
    let health = if node.is_coordinator() {
        None
    } else {
        partitions.first().cloned()
    };

    Ok(Json(json!({
        "success": true,
        "node": node,
        "isCoordinator": node.is_coordinator(),
        "state": state.recovery.state(),
        "recovering": state.cluster.is_recovering(),
        "pendingLocal": state.txlog.count_pending()?,
        "outstanding": outstanding,
        "needsRecovery": needs_recovery,
        "health": health,
        "partitions": partitions,
        "errors": errors,
        "lastPass": state.recovery.last_pass(),
    })))
}

/// Run a recovery pass now and return its report
pub async fn run_recovery(State(state): State<AppState>) -> Json<Value> {
    let report = state.recovery.run_pass(PassKind::Manual).await;
    Json(json!({
        "success": true,
        "report": report,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    limit: Option<usize>,
}

pub async fn transactions(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> ApiResult<Json<Value>> {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT);
    let entries = state.txlog.list(limit)?;
    Ok(Json(json!({
        "success": true,
        "node": state.cluster.node(),
        "count": entries.len(),
        "entries": entries,
    })))
}

#[derive(Debug, Deserialize)]
pub struct NodeModeRequest {
    mode: String,
}

/// Switch NODE_A between VICE and ACTING_MASTER
pub async fn set_node_mode(
    State(state): State<AppState>,
    Json(req): Json<NodeModeRequest>,
) -> ApiResult<Json<Value>> {
    if state.cluster.node() != NodeId::NodeA {
        return Err(ApiError(crate::Error::InvalidRequest(
            "only NODE_A has a node mode".into(),
        )));
    }
    let mode = NodeMode::parse(req.mode.trim()).ok_or_else(|| {
        crate::Error::InvalidRequest(format!("unknown node mode: {}", req.mode))
    })?;

    state
        .executor
        .execute(&Statement::SetNodeMode(mode), ExecOptions::write())
        .await?;
    let current = match state
        .executor
        .execute(&Statement::GetNodeMode, ExecOptions::read())
        .await?
    {
        QueryOutput::Mode(mode) => mode,
        _ => mode,
    };
    state.monitor.check_local_health_now().await;
    info!(mode = current.as_str(), "Node mode changed");

    Ok(Json(json!({
        "success": true,
        "node": state.cluster.node(),
        "mode": current,
    })))
}
