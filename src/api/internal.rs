//! Node-to-node endpoints used by replication and recovery

use super::{ApiError, ApiResult, AppState};
use crate::cluster::peer::{
    ApplyRequest, ApplyResponse, DigestResponse, ReplayedReport, SyncRequest, SyncResponse,
};
use crate::common::NodeId;
use crate::storage::{ExecOptions, Partition, QueryOutput, Statement};
use crate::txlog::{TxEntry, TxStatus};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

/// Execute a write replicated from `origin`
pub async fn apply(
    State(state): State<AppState>,
    Json(req): Json<ApplyRequest>,
) -> ApiResult<Json<ApplyResponse>> {
    if req.statement.op_kind().is_none() {
        return Err(ApiError(crate::Error::InvalidRequest(
            "only inserts, updates and deletes can be applied".into(),
        )));
    }
    debug!(origin = %req.origin, op = ?req.statement.op_kind(), "Applying replicated write");
    let output = state
        .executor
        .execute(&req.statement, ExecOptions::write())
        .await?;
    Ok(Json(ApplyResponse {
        node: state.cluster.node(),
        affected: output.affected(),
    }))
}

fn own_partition(state: &AppState) -> Partition {
    Partition::for_node(state.cluster.node(), state.config.partition_split_year)
}

#[derive(Debug, Deserialize)]
pub struct DigestQuery {
    /// Slice to digest; defaults to this node's own partition
    pub node: Option<NodeId>,
}

pub async fn digest(
    State(state): State<AppState>,
    Query(query): Query<DigestQuery>,
) -> ApiResult<Json<DigestResponse>> {
    let node = state.cluster.node();
    let holder = query.node.unwrap_or(node);
    // Only MAIN holds every row
    if holder != node && !node.is_coordinator() {
        return Err(ApiError(crate::Error::InvalidRequest(format!(
            "{} does not hold the {} partition",
            node, holder
        ))));
    }
    let partition = Partition::for_node(holder, state.config.partition_split_year);
    let rows = state
        .executor
        .execute(&Statement::Digest(partition), ExecOptions::read())
        .await?
        .into_digest()?;
    Ok(Json(DigestResponse {
        node: state.cluster.node(),
        partition,
        rows,
    }))
}

/// Replace this node's partition with the rows MAIN holds
pub async fn sync(
    State(state): State<AppState>,
    Json(req): Json<SyncRequest>,
) -> ApiResult<Json<SyncResponse>> {
    let expected = own_partition(&state);
    if req.partition != expected {
        return Err(ApiError(crate::Error::InvalidRequest(format!(
            "{} holds {:?}, not {:?}",
            state.cluster.node(),
            expected,
            req.partition
        ))));
    }

    let received = req.rows.len();
    let output = state
        .executor
        .execute(
            &Statement::Sync {
                partition: req.partition,
                rows: req.rows,
            },
            ExecOptions::write(),
        )
        .await?;
    let QueryOutput::Synced(counts) = output else {
        return Err(ApiError(crate::Error::Internal(
            "sync returned no counts".into(),
        )));
    };
    info!(
        received,
        inserted = counts.inserted,
        updated = counts.updated,
        removed = counts.removed,
        "Partition synced"
    );
    Ok(Json(SyncResponse {
        node: state.cluster.node(),
        records_inserted: counts.inserted,
        records_updated: counts.updated,
        records_removed: counts.removed,
    }))
}

#[derive(Debug, Deserialize)]
pub struct OutstandingQuery {
    since: Option<u64>,
}

pub async fn outstanding(
    State(state): State<AppState>,
    Path(target): Path<String>,
    Query(query): Query<OutstandingQuery>,
) -> ApiResult<Json<Vec<TxEntry>>> {
    let target: NodeId = target
        .parse()
        .map_err(|_| crate::Error::InvalidRequest(format!("unknown node: {}", target)))?;
    Ok(Json(state.txlog.find_outstanding(target, query.since)?))
}

/// Record that another node replayed one of this node's entries
pub async fn replayed(
    State(state): State<AppState>,
    Json(report): Json<ReplayedReport>,
) -> ApiResult<Json<Value>> {
    let original = state
        .txlog
        .get(&report.entry_id)?
        .ok_or_else(|| crate::Error::NotFound(format!("transaction {}", report.entry_id)))?;

    if original.status == TxStatus::Pending {
        state
            .txlog
            .mark_status(&original.id, TxStatus::Failed, Some("abandoned".into()))?;
    }
    let replay_id = state.txlog.append_replay(&original)?;
    let status = if report.success {
        TxStatus::Committed
    } else {
        TxStatus::Failed
    };
    state
        .txlog
        .mark_status(&replay_id, status, report.error.clone())?;
    if !report.success {
        warn!(entry = %original.id, error = ?report.error, "Remote replay failed");
    }

    Ok(Json(json!({
        "success": true,
        "replayOf": original.id,
        "transactionId": replay_id,
        "status": status,
    })))
}
