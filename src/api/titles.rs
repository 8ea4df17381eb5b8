//! Client title routes and write replication

use super::{ApiError, ApiResult, AppState};
use crate::common::{validate_tconst, NodeId, NodeMode};
use crate::storage::{
    ExecOptions, IsolationLevel, Partition, QueryOutput, SortColumn, Statement, Title,
    TitleFilter, TitleUpdate,
};
use crate::txlog::TxStatus;
use axum::{
    extract::{Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

const DEFAULT_LIMIT: u32 = 10;
const DEFAULT_SEARCH_LIMIT: u32 = 20;
const DEFAULT_TOP_START_YEAR: i32 = 2000;
const DEFAULT_TOP_END_YEAR: i32 = 2020;
const DEFAULT_TOP_MIN_VOTES: i64 = 1000;
const MAX_LIMIT: u32 = 1000;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InsertRequest {
    tconst: Option<String>,
    primary_title: Option<String>,
    runtime_minutes: Option<i32>,
    average_rating: Option<f64>,
    num_votes: Option<i64>,
    start_year: Option<i32>,
    isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    tconst: String,
    primary_title: Option<String>,
    runtime_minutes: Option<i32>,
    average_rating: Option<f64>,
    num_votes: Option<i64>,
    start_year: Option<i32>,
    isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    tconst: String,
    isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddReviewsRequest {
    tconst: String,
    new_rating: f64,
    #[serde(alias = "numNewReviews")]
    new_votes: i64,
    isolation_level: Option<IsolationLevel>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectQuery {
    #[serde(alias = "select_column")]
    column: Option<String>,
    #[serde(alias = "order_direction")]
    order: Option<String>,
    #[serde(alias = "limit_count")]
    limit: Option<u32>,
    #[serde(alias = "isolation_level")]
    isolation_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    #[serde(alias = "search_term")]
    q: Option<String>,
    #[serde(alias = "limit_count")]
    limit: Option<u32>,
    #[serde(alias = "isolation_level")]
    isolation_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdvancedSearchQuery {
    title_query: Option<String>,
    min_rating: Option<f64>,
    max_rating: Option<f64>,
    min_votes: Option<i64>,
    result_limit: Option<u32>,
    #[serde(alias = "isolationLevel")]
    isolation_level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopByYearQuery {
    start_year: Option<i32>,
    end_year: Option<i32>,
    min_votes: Option<i64>,
    #[serde(alias = "isolationLevel")]
    isolation_level: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationQuery {
    isolation_level: Option<String>,
}

/// Replication result for one peer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Replication {
    pub node: NodeId,
    pub status: TxStatus,
    pub transaction_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn parse_isolation(raw: Option<&str>) -> ApiResult<Option<IsolationLevel>> {
    Ok(raw.map(str::parse::<IsolationLevel>).transpose()?)
}

fn bad_request(message: impl Into<String>) -> ApiError {
    ApiError(crate::Error::InvalidRequest(message.into()))
}

/// Peers that must receive a write executed on `node`
pub fn replication_targets(node: NodeId, statement: &Statement, split_year: i32) -> Vec<NodeId> {
    match (node, statement) {
        (NodeId::Main, Statement::InsertTitle(t)) => {
            vec![Partition::owner(t.start_year, split_year)]
        }
        (NodeId::Main, _) => vec![NodeId::NodeA, NodeId::NodeB],
        (NodeId::NodeA, Statement::InsertTitle(t)) => {
            if Partition::owner(t.start_year, split_year) == NodeId::NodeB {
                vec![NodeId::Main, NodeId::NodeB]
            } else {
                vec![NodeId::Main]
            }
        }
        (NodeId::NodeA, _) => vec![NodeId::Main, NodeId::NodeB],
        (NodeId::NodeB, _) => Vec::new(),
    }
}

/// Refuse writes on a node that may not accept them
async fn ensure_writable(state: &AppState) -> ApiResult<()> {
    match state.cluster.node() {
        NodeId::Main => Ok(()),
        NodeId::NodeA => {
            let mode = state
                .executor
                .execute(&Statement::GetNodeMode, ExecOptions::read())
                .await?;
            match mode {
                QueryOutput::Mode(NodeMode::ActingMaster) => Ok(()),
                _ => Err(ApiError(crate::Error::NoWritableNode)),
            }
        }
        NodeId::NodeB => Err(ApiError(crate::Error::NoWritableNode)),
    }
}

/// Log, execute, resolve, then replicate a client write
async fn execute_write(
    state: &AppState,
    statement: Statement,
    isolation: Option<IsolationLevel>,
) -> ApiResult<Json<Value>> {
    ensure_writable(state).await?;

    let node = state.cluster.node();
    let kind = statement
        .op_kind()
        .ok_or_else(|| bad_request("not a write statement"))?;

    let entry_id = match state.txlog.append(kind, node, &statement) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(error = %e, "Transaction log write failed, continuing without entry");
            None
        }
    };

    let options = ExecOptions::write().with_isolation(isolation);
    let result = state.executor.execute(&statement, options).await;

    let resolution = match &result {
        Ok(_) => (TxStatus::Committed, None),
        Err(e) => (TxStatus::Failed, Some(e.message.clone())),
    };
    if let Some(id) = &entry_id {
        if let Err(e) = state.txlog.mark_status(id, resolution.0, resolution.1) {
            warn!(id = %id, error = %e, "Could not resolve transaction");
        }
    }

    let output = result?;
    let replication = replicate(state, &statement).await;

    Ok(Json(json!({
        "success": true,
        "node": node,
        "operation": kind,
        "affectedRows": output.affected(),
        "transactionId": entry_id,
        "replication": replication,
    })))
}

/// Send a committed write to every peer that holds a copy.
///
/// Failures are logged as FAILED entries for recovery; they never fail the request.
async fn replicate(state: &AppState, statement: &Statement) -> Vec<Replication> {
    let node = state.cluster.node();
    let Some(kind) = statement.op_kind() else {
        return Vec::new();
    };

    let mut results = Vec::new();
    for target in replication_targets(node, statement, state.config.partition_split_year) {
        let entry_id = match state.txlog.append(kind, target, statement) {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(%target, error = %e, "Transaction log write failed for replication");
                None
            }
        };

        let outcome = if !state.cluster.is_available(target) {
            Err(format!("{} unavailable, left for recovery", target))
        } else {
            match state.peers.apply(target, node, statement).await {
                Ok(_) => Ok(()),
                Err(e) => {
                    if e.is_connectivity() {
                        state.monitor.mark_unavailable(target);
                    }
                    Err(e.to_string())
                }
            }
        };

        let (status, error) = match outcome {
            Ok(()) => (TxStatus::Committed, None),
            Err(message) => {
                warn!(%target, error = %message, "Replication failed");
                (TxStatus::Failed, Some(message))
            }
        };
        if let Some(id) = &entry_id {
            if let Err(e) = state.txlog.mark_status(id, status, error.clone()) {
                warn!(id = %id, error = %e, "Could not resolve replication entry");
            }
        }
        results.push(Replication {
            node: target,
            status,
            transaction_id: entry_id,
            error,
        });
    }
    results
}

pub async fn insert(
    State(state): State<AppState>,
    Json(req): Json<InsertRequest>,
) -> ApiResult<Json<Value>> {
    let (
        Some(tconst),
        Some(primary_title),
        Some(runtime_minutes),
        Some(average_rating),
        Some(num_votes),
        Some(start_year),
    ) = (
        req.tconst,
        req.primary_title,
        req.runtime_minutes,
        req.average_rating,
        req.num_votes,
        req.start_year,
    )
    else {
        return Err(bad_request(
            "All fields are required: tconst, primaryTitle, runtimeMinutes, averageRating, numVotes, startYear",
        ));
    };
    validate_tconst(&tconst)?;
    if !(0.0..=10.0).contains(&average_rating) || num_votes < 0 || runtime_minutes < 0 {
        return Err(bad_request("rating must be within 0-10, counts must not be negative"));
    }

    let title = Title {
        tconst,
        primary_title,
        runtime_minutes,
        average_rating,
        num_votes,
        start_year,
    };
    info!(tconst = %title.tconst, "Insert");
    execute_write(&state, Statement::InsertTitle(title), req.isolation_level).await
}

pub async fn update(
    State(state): State<AppState>,
    Json(req): Json<UpdateRequest>,
) -> ApiResult<Json<Value>> {
    validate_tconst(&req.tconst)?;
    if req.average_rating.is_some_and(|r| !(0.0..=10.0).contains(&r)) {
        return Err(bad_request("averageRating must be within 0-10"));
    }
    let update = TitleUpdate {
        tconst: req.tconst,
        primary_title: req.primary_title,
        runtime_minutes: req.runtime_minutes,
        average_rating: req.average_rating,
        num_votes: req.num_votes,
        start_year: req.start_year,
    };
    execute_write(&state, Statement::UpdateTitle(update), req.isolation_level).await
}

pub async fn delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteRequest>,
) -> ApiResult<Json<Value>> {
    validate_tconst(&req.tconst)?;
    execute_write(
        &state,
        Statement::DeleteTitle { tconst: req.tconst },
        req.isolation_level,
    )
    .await
}

pub async fn add_reviews(
    State(state): State<AppState>,
    Json(req): Json<AddReviewsRequest>,
) -> ApiResult<Json<Value>> {
    validate_tconst(&req.tconst)?;
    if !(0.0..=10.0).contains(&req.new_rating) {
        return Err(bad_request("newRating must be within 0-10"));
    }
    if req.new_votes <= 0 {
        return Err(bad_request("newVotes must be positive"));
    }
    execute_write(
        &state,
        Statement::AddReviews {
            tconst: req.tconst,
            new_rating: req.new_rating,
            new_votes: req.new_votes,
        },
        req.isolation_level,
    )
    .await
}

async fn read_rows(
    state: &AppState,
    statement: Statement,
    isolation: Option<IsolationLevel>,
) -> ApiResult<Json<Value>> {
    let rows = state
        .executor
        .execute(&statement, ExecOptions::read().with_isolation(isolation))
        .await?
        .into_rows()?;
    Ok(Json(json!({
        "success": true,
        "node": state.cluster.node(),
        "count": rows.len(),
        "data": rows,
    })))
}

pub async fn select(
    State(state): State<AppState>,
    Query(query): Query<SelectQuery>,
) -> ApiResult<Json<Value>> {
    let column: SortColumn = query.column.as_deref().unwrap_or("averageRating").parse()?;
    let descending = !matches!(query.order.as_deref(), Some(o) if o.eq_ignore_ascii_case("asc"));
    let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let isolation = parse_isolation(query.isolation_level.as_deref())?;
    read_rows(
        &state,
        Statement::SelectTop {
            column,
            descending,
            limit,
        },
        isolation,
    )
    .await
}

pub async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Json<Value>> {
    // An empty term matches every title
    let term = query.q.map(|q| q.trim().to_string()).unwrap_or_default();
    let limit = query.limit.unwrap_or(DEFAULT_SEARCH_LIMIT).clamp(1, MAX_LIMIT);
    let isolation = parse_isolation(query.isolation_level.as_deref())?;
    read_rows(&state, Statement::Search { term, limit }, isolation).await
}

pub async fn search_advanced(
    State(state): State<AppState>,
    Query(query): Query<AdvancedSearchQuery>,
) -> ApiResult<Json<Value>> {
    if let (Some(min), Some(max)) = (query.min_rating, query.max_rating) {
        if min > max {
            return Err(bad_request("min_rating must not exceed max_rating"));
        }
    }
    let filter = TitleFilter {
        title_query: query
            .title_query
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty()),
        min_rating: query.min_rating,
        max_rating: query.max_rating,
        min_votes: query.min_votes,
        limit: query.result_limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT),
    };
    let isolation = parse_isolation(query.isolation_level.as_deref())?;
    read_rows(&state, Statement::SearchAdvanced(filter), isolation).await
}

pub async fn top_by_year(
    State(state): State<AppState>,
    Query(query): Query<TopByYearQuery>,
) -> ApiResult<Json<Value>> {
    let start_year = query.start_year.unwrap_or(DEFAULT_TOP_START_YEAR);
    let end_year = query.end_year.unwrap_or(DEFAULT_TOP_END_YEAR);
    let min_votes = query.min_votes.unwrap_or(DEFAULT_TOP_MIN_VOTES);
    let isolation = parse_isolation(query.isolation_level.as_deref())?;

    let tops = state
        .executor
        .execute(
            &Statement::TopByYear {
                start_year,
                end_year,
                min_votes,
            },
            ExecOptions::read().with_isolation(isolation),
        )
        .await?
        .into_year_tops()?;
    Ok(Json(json!({
        "success": true,
        "node": state.cluster.node(),
        "count": tops.len(),
        "filters": {
            "start_year": start_year,
            "end_year": end_year,
            "min_votes": min_votes,
        },
        "data": tops,
    })))
}

pub async fn aggregation(
    State(state): State<AppState>,
    Query(query): Query<AggregationQuery>,
) -> ApiResult<Json<Value>> {
    let isolation = parse_isolation(query.isolation_level.as_deref())?;
    let output = state
        .executor
        .execute(
            &Statement::Aggregate,
            ExecOptions::read().with_isolation(isolation),
        )
        .await?;
    match output {
        QueryOutput::Aggregate(stats) => Ok(Json(json!({
            "success": true,
            "node": state.cluster.node(),
            "data": stats,
        }))),
        other => Err(ApiError(crate::Error::Internal(format!(
            "unexpected aggregate result {:?}",
            other
        )))),
    }
}
