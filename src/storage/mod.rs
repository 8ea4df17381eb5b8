//! Title database access
//!
//! Every node owns one local database reached through a [`QueryExecutor`].
//! Statements are typed values instead of SQL text so they can be written to
//! the transaction log and replayed later on any backend. Backend errors are
//! classified exactly once, here, into [`StorageErrorKind`].

pub mod memory;
pub mod sqlite;

use crate::common::{NodeId, NodeMode};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub use memory::MemoryExecutor;
pub use sqlite::SqliteExecutor;

/// A replicated title row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Title {
    pub tconst: String,
    pub primary_title: String,
    pub runtime_minutes: i32,
    pub average_rating: f64,
    pub num_votes: i64,
    pub start_year: i32,
}

impl Title {
    /// Content hash used to detect divergent copies of the same row
    pub fn digest(&self) -> String {
        let canonical = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{:.4}\u{1f}{}\u{1f}{}",
            self.tconst,
            self.primary_title,
            self.runtime_minutes,
            self.average_rating,
            self.num_votes,
            self.start_year
        );
        blake3::hash(canonical.as_bytes()).to_hex().to_string()
    }

    fn apply_update(&mut self, update: &TitleUpdate) {
        if let Some(v) = &update.primary_title {
            self.primary_title = v.clone();
        }
        if let Some(v) = update.runtime_minutes {
            self.runtime_minutes = v;
        }
        if let Some(v) = update.average_rating {
            self.average_rating = v;
        }
        if let Some(v) = update.num_votes {
            self.num_votes = v;
        }
        if let Some(v) = update.start_year {
            self.start_year = v;
        }
    }

    fn add_reviews(&mut self, new_rating: f64, new_votes: i64) {
        let total = self.num_votes + new_votes;
        if total > 0 {
            self.average_rating = (self.average_rating * self.num_votes as f64
                + new_rating * new_votes as f64)
                / total as f64;
        }
        self.num_votes = total;
    }
}

/// Partial update; `None` keeps the stored value
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleUpdate {
    pub tconst: String,
    pub primary_title: Option<String>,
    pub runtime_minutes: Option<i32>,
    pub average_rating: Option<f64>,
    pub num_votes: Option<i64>,
    pub start_year: Option<i32>,
}

/// Filters of the advanced title search; `None` leaves a filter out
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TitleFilter {
    /// Substring of the primary title
    pub title_query: Option<String>,
    pub min_rating: Option<f64>,
    pub max_rating: Option<f64>,
    pub min_votes: Option<i64>,
    pub limit: u32,
}

impl TitleFilter {
    pub fn matches(&self, title: &Title) -> bool {
        let title_ok = self.title_query.as_deref().map_or(true, |q| {
            title
                .primary_title
                .to_lowercase()
                .contains(&q.to_lowercase())
        });
        title_ok
            && self.min_rating.map_or(true, |r| title.average_rating >= r)
            && self.max_rating.map_or(true, |r| title.average_rating <= r)
            && self.min_votes.map_or(true, |v| title.num_votes >= v)
    }
}

/// Highest rated title of one start year
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct YearTop {
    pub start_year: i32,
    pub tconst: String,
    pub primary_title: String,
    pub highest: f64,
}

/// Slice of the title table held by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    All,
    /// `start_year < year`
    Before(i32),
    /// `start_year >= year`
    From(i32),
}

impl Partition {
    /// Slice held by `node`: MAIN everything, NODE_A older titles, NODE_B the rest
    pub fn for_node(node: NodeId, split_year: i32) -> Self {
        match node {
            NodeId::Main => Partition::All,
            NodeId::NodeA => Partition::Before(split_year),
            NodeId::NodeB => Partition::From(split_year),
        }
    }

    /// Worker that owns `title`
    pub fn owner(title_year: i32, split_year: i32) -> NodeId {
        if title_year < split_year {
            NodeId::NodeA
        } else {
            NodeId::NodeB
        }
    }

    pub fn contains(&self, title: &Title) -> bool {
        let (lo, hi) = self.bounds();
        let year = title.start_year as i64;
        year >= lo && year < hi
    }

    /// Half-open `[lo, hi)` range of `start_year`
    pub fn bounds(&self) -> (i64, i64) {
        match *self {
            Partition::All => (i64::MIN, i64::MAX),
            Partition::Before(y) => (i64::MIN, y as i64),
            Partition::From(y) => (y as i64, i64::MAX),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortColumn {
    AverageRating,
    NumVotes,
    StartYear,
    RuntimeMinutes,
    PrimaryTitle,
}

impl SortColumn {
    pub fn sql_name(&self) -> &'static str {
        match self {
            SortColumn::AverageRating => "average_rating",
            SortColumn::NumVotes => "num_votes",
            SortColumn::StartYear => "start_year",
            SortColumn::RuntimeMinutes => "runtime_minutes",
            SortColumn::PrimaryTitle => "primary_title",
        }
    }
}

impl FromStr for SortColumn {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "averageRating" | "average_rating" => Ok(SortColumn::AverageRating),
            "numVotes" | "num_votes" => Ok(SortColumn::NumVotes),
            "startYear" | "start_year" => Ok(SortColumn::StartYear),
            "runtimeMinutes" | "runtime_minutes" => Ok(SortColumn::RuntimeMinutes),
            "primaryTitle" | "primary_title" => Ok(SortColumn::PrimaryTitle),
            other => Err(crate::Error::InvalidRequest(format!(
                "cannot sort by {}",
                other
            ))),
        }
    }
}

/// Kind of mutating operation, as recorded in the transaction log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OpKind::Insert => "INSERT",
            OpKind::Update => "UPDATE",
            OpKind::Delete => "DELETE",
        })
    }
}

/// A statement understood by every backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "params", rename_all = "snake_case")]
pub enum Statement {
    /// Liveness check (`SELECT 1`)
    Ping,
    /// Insert, replacing any row with the same `tconst`
    InsertTitle(Title),
    UpdateTitle(TitleUpdate),
    DeleteTitle {
        tconst: String,
    },
    AddReviews {
        tconst: String,
        new_rating: f64,
        new_votes: i64,
    },
    SelectTop {
        column: SortColumn,
        descending: bool,
        limit: u32,
    },
    Search {
        term: String,
        limit: u32,
    },
    /// Filtered search, most voted first
    SearchAdvanced(TitleFilter),
    /// Best rated title per year strictly between the bounds, counting
    /// only titles with more than `min_votes` votes
    TopByYear {
        start_year: i32,
        end_year: i32,
        min_votes: i64,
    },
    Aggregate,
    GetNodeMode,
    SetNodeMode(NodeMode),
    Digest(Partition),
    FetchPartition(Partition),
    /// Make `partition` hold exactly `rows`
    Sync {
        partition: Partition,
        rows: Vec<Title>,
    },
}

impl Statement {
    /// Operation kind for statements that are logged and replicated
    pub fn op_kind(&self) -> Option<OpKind> {
        match self {
            Statement::InsertTitle(_) => Some(OpKind::Insert),
            Statement::UpdateTitle(_) | Statement::AddReviews { .. } => Some(OpKind::Update),
            Statement::DeleteTitle { .. } => Some(OpKind::Delete),
            _ => None,
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Statement::InsertTitle(_)
                | Statement::UpdateTitle(_)
                | Statement::DeleteTitle { .. }
                | Statement::AddReviews { .. }
                | Statement::SetNodeMode(_)
                | Statement::Sync { .. }
        )
    }

    /// Split into operation name and JSON parameters for the transaction log
    pub fn to_parts(&self) -> crate::Result<(String, String)> {
        let mut value = serde_json::to_value(self)?;
        let op = value
            .get("op")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| crate::Error::Internal("statement without op tag".into()))?;
        let params = value
            .as_object_mut()
            .and_then(|o| o.remove("params"))
            .unwrap_or(serde_json::Value::Null);
        Ok((op, params.to_string()))
    }

    /// Rebuild a statement from its logged parts
    pub fn from_parts(op: &str, params: &str) -> crate::Result<Self> {
        let params: serde_json::Value = serde_json::from_str(params)?;
        let value = if params.is_null() {
            serde_json::json!({ "op": op })
        } else {
            serde_json::json!({ "op": op, "params": params })
        };
        Ok(serde_json::from_value(value)?)
    }
}

/// Transaction isolation requested by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    #[default]
    RepeatableRead,
    Serializable,
}

impl FromStr for IsolationLevel {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace([' ', '-'], "_").as_str() {
            "READ_UNCOMMITTED" => Ok(IsolationLevel::ReadUncommitted),
            "READ_COMMITTED" => Ok(IsolationLevel::ReadCommitted),
            "REPEATABLE_READ" => Ok(IsolationLevel::RepeatableRead),
            "SERIALIZABLE" => Ok(IsolationLevel::Serializable),
            other => Err(crate::Error::InvalidRequest(format!(
                "unknown isolation level: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions {
    pub is_write: bool,
    pub isolation: IsolationLevel,
}

impl ExecOptions {
    pub fn read() -> Self {
        Self::default()
    }

    pub fn write() -> Self {
        Self {
            is_write: true,
            ..Self::default()
        }
    }

    pub fn with_isolation(mut self, isolation: Option<IsolationLevel>) -> Self {
        if let Some(level) = isolation {
            self.isolation = level;
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateStats {
    pub movie_count: u64,
    pub average_rating: Option<f64>,
    pub average_weighted_rating: Option<f64>,
    pub total_votes: Option<i64>,
    pub average_votes: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDigest {
    pub tconst: String,
    pub hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncCounts {
    pub inserted: u64,
    pub updated: u64,
    pub removed: u64,
}

/// Result of a statement
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutput {
    Pong,
    Affected(u64),
    Rows(Vec<Title>),
    YearTops(Vec<YearTop>),
    Aggregate(AggregateStats),
    Mode(NodeMode),
    Digest(Vec<RowDigest>),
    Synced(SyncCounts),
}

impl QueryOutput {
    pub fn into_rows(self) -> Result<Vec<Title>, StorageError> {
        match self {
            QueryOutput::Rows(rows) => Ok(rows),
            other => Err(StorageError::unexpected("rows", &other)),
        }
    }

    pub fn into_year_tops(self) -> Result<Vec<YearTop>, StorageError> {
        match self {
            QueryOutput::YearTops(tops) => Ok(tops),
            other => Err(StorageError::unexpected("per-year", &other)),
        }
    }

    pub fn into_digest(self) -> Result<Vec<RowDigest>, StorageError> {
        match self {
            QueryOutput::Digest(d) => Ok(d),
            other => Err(StorageError::unexpected("digest", &other)),
        }
    }

    pub fn affected(&self) -> u64 {
        match self {
            QueryOutput::Affected(n) => *n,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorKind {
    /// Database unreachable: refused, timed out, pool exhausted
    Connection,
    SyntaxOrLogic,
    /// Deadlock or serialization failure
    LockConflict,
}

#[derive(Debug, Clone, Error)]
#[error("{kind:?}: {message}")]
pub struct StorageError {
    pub kind: StorageErrorKind,
    pub message: String,
}

impl StorageError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::Connection,
            message: message.into(),
        }
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::SyntaxOrLogic,
            message: message.into(),
        }
    }

    pub fn lock_conflict(message: impl Into<String>) -> Self {
        Self {
            kind: StorageErrorKind::LockConflict,
            message: message.into(),
        }
    }

    fn unexpected(wanted: &str, got: &QueryOutput) -> Self {
        Self::logic(format!("expected {} result, got {:?}", wanted, got))
    }
}

/// Runs statements against one node's local database
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(
        &self,
        statement: &Statement,
        options: ExecOptions,
    ) -> Result<QueryOutput, StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// Best title per start year among `titles`.
///
/// Ties on rating go to the most voted title, then the lowest `tconst`.
pub(crate) fn top_by_year<'a>(
    titles: impl Iterator<Item = &'a Title>,
    start_year: i32,
    end_year: i32,
    min_votes: i64,
) -> Vec<YearTop> {
    let mut best: std::collections::BTreeMap<i32, &Title> = std::collections::BTreeMap::new();
    for t in titles.filter(|t| {
        t.num_votes > min_votes && t.start_year > start_year && t.start_year < end_year
    }) {
        let better = match best.get(&t.start_year) {
            None => true,
            Some(current) => t
                .average_rating
                .total_cmp(&current.average_rating)
                .then(t.num_votes.cmp(&current.num_votes))
                .then(current.tconst.cmp(&t.tconst))
                .is_gt(),
        };
        if better {
            best.insert(t.start_year, t);
        }
    }
    best.into_values()
        .map(|t| YearTop {
            start_year: t.start_year,
            tconst: t.tconst.clone(),
            primary_title: t.primary_title.clone(),
            highest: t.average_rating,
        })
        .collect()
}

/// Apply a bulk sync to an in-memory view of `partition`.
pub(crate) fn sync_rows(
    existing: &mut std::collections::BTreeMap<String, Title>,
    partition: Partition,
    rows: &[Title],
) -> SyncCounts {
    let mut counts = SyncCounts::default();
    let wanted: std::collections::HashSet<&str> = rows.iter().map(|r| r.tconst.as_str()).collect();

    existing.retain(|tconst, title| {
        let keep = !partition.contains(title) || wanted.contains(tconst.as_str());
        if !keep {
            counts.removed += 1;
        }
        keep
    });

    for row in rows {
        match existing.get_mut(&row.tconst) {
            Some(current) if current == row => {}
            Some(current) => {
                *current = row.clone();
                counts.updated += 1;
            }
            None => {
                existing.insert(row.tconst.clone(), row.clone());
                counts.inserted += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
pub(crate) fn sample_title(tconst: &str, year: i32) -> Title {
    Title {
        tconst: tconst.to_string(),
        primary_title: format!("Title {}", tconst),
        runtime_minutes: 90,
        average_rating: 7.0,
        num_votes: 100,
        start_year: year,
    }
}
