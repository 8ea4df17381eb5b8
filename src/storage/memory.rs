//! In-memory title store
//!
//! Used by tests and single-process demos. Outages and lock conflicts can be
//! injected so failover paths can be exercised without a real database.

use super::{
    sync_rows, top_by_year, AggregateStats, ExecOptions, QueryExecutor, QueryOutput, RowDigest, SortColumn,
    Statement, StorageError, Title,
};
use crate::common::NodeMode;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct MemState {
    titles: BTreeMap<String, Title>,
    mode: NodeMode,
}

pub struct MemoryExecutor {
    state: Mutex<MemState>,
    available: AtomicBool,
    pending_lock_conflicts: AtomicU32,
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExecutor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemState::default()),
            available: AtomicBool::new(true),
            pending_lock_conflicts: AtomicU32::new(0),
        }
    }

    pub fn with_titles(titles: impl IntoIterator<Item = Title>) -> Self {
        let exec = Self::new();
        exec.seed(titles);
        exec
    }

    /// Insert rows directly, bypassing availability checks
    pub fn seed(&self, titles: impl IntoIterator<Item = Title>) {
        let mut state = self.lock();
        for t in titles {
            state.titles.insert(t.tconst.clone(), t);
        }
    }

    /// Simulate the database going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fail the next `n` writes with a lock conflict
    pub fn inject_lock_conflicts(&self, n: u32) {
        self.pending_lock_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn get(&self, tconst: &str) -> Option<Title> {
        self.lock().titles.get(tconst).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().titles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_lock_conflict(&self) -> bool {
        self.pending_lock_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn compare(column: SortColumn, a: &Title, b: &Title) -> std::cmp::Ordering {
    match column {
        SortColumn::AverageRating => a.average_rating.total_cmp(&b.average_rating),
        SortColumn::NumVotes => a.num_votes.cmp(&b.num_votes),
        SortColumn::StartYear => a.start_year.cmp(&b.start_year),
        SortColumn::RuntimeMinutes => a.runtime_minutes.cmp(&b.runtime_minutes),
        SortColumn::PrimaryTitle => a.primary_title.cmp(&b.primary_title),
    }
}

fn aggregate<'a>(titles: impl Iterator<Item = &'a Title>) -> AggregateStats {
    let mut count = 0u64;
    let mut rating_sum = 0.0;
    let mut votes_sum = 0i64;
    let mut weighted_sum = 0.0;
    for t in titles {
        count += 1;
        rating_sum += t.average_rating;
        votes_sum += t.num_votes;
        weighted_sum += t.average_rating * t.num_votes as f64;
    }
    if count == 0 {
        return AggregateStats {
            movie_count: 0,
            average_rating: None,
            average_weighted_rating: None,
            total_votes: None,
            average_votes: None,
        };
    }
    AggregateStats {
        movie_count: count,
        average_rating: Some(rating_sum / count as f64),
        average_weighted_rating: (votes_sum > 0).then(|| weighted_sum / votes_sum as f64),
        total_votes: Some(votes_sum),
        average_votes: Some(votes_sum as f64 / count as f64),
    }
}

#[async_trait]
impl QueryExecutor for MemoryExecutor {
    async fn execute(
        &self,
        statement: &Statement,
        options: ExecOptions,
    ) -> Result<QueryOutput, StorageError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StorageError::connection("connect ECONNREFUSED (memory store offline)"));
        }
        if (options.is_write || statement.is_write()) && self.take_lock_conflict() {
            return Err(StorageError::lock_conflict(
                "Deadlock found when trying to get lock",
            ));
        }

        let mut state = self.lock();
        let output = match statement {
            Statement::Ping => QueryOutput::Pong,
            Statement::InsertTitle(title) => {
                state.titles.insert(title.tconst.clone(), title.clone());
                QueryOutput::Affected(1)
            }
            Statement::UpdateTitle(update) => match state.titles.get_mut(&update.tconst) {
                Some(t) => {
                    t.apply_update(update);
                    QueryOutput::Affected(1)
                }
                None => QueryOutput::Affected(0),
            },
            Statement::DeleteTitle { tconst } => {
                QueryOutput::Affected(state.titles.remove(tconst).map_or(0, |_| 1))
            }
            Statement::AddReviews {
                tconst,
                new_rating,
                new_votes,
            } => match state.titles.get_mut(tconst) {
                Some(t) => {
                    t.add_reviews(*new_rating, *new_votes);
                    QueryOutput::Affected(1)
                }
                None => QueryOutput::Affected(0),
            },
            Statement::SelectTop {
                column,
                descending,
                limit,
            } => {
                let mut rows: Vec<Title> = state.titles.values().cloned().collect();
                rows.sort_by(|a, b| {
                    let ord = compare(*column, a, b);
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                rows.truncate(*limit as usize);
                QueryOutput::Rows(rows)
            }
            Statement::Search { term, limit } => {
                let needle = term.to_lowercase();
                let mut rows: Vec<Title> = state
                    .titles
                    .values()
                    .filter(|t| {
                        t.tconst == *term || t.primary_title.to_lowercase().contains(&needle)
                    })
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| b.num_votes.cmp(&a.num_votes));
                rows.truncate(*limit as usize);
                QueryOutput::Rows(rows)
            }
            Statement::SearchAdvanced(filter) => {
                let mut rows: Vec<Title> = state
                    .titles
                    .values()
                    .filter(|t| filter.matches(t))
                    .cloned()
                    .collect();
                rows.sort_by(|a, b| b.num_votes.cmp(&a.num_votes));
                rows.truncate(filter.limit as usize);
                QueryOutput::Rows(rows)
            }
            Statement::TopByYear {
                start_year,
                end_year,
                min_votes,
            } => QueryOutput::YearTops(top_by_year(
                state.titles.values(),
                *start_year,
                *end_year,
                *min_votes,
            )),
            Statement::Aggregate => QueryOutput::Aggregate(aggregate(state.titles.values())),
            Statement::GetNodeMode => QueryOutput::Mode(state.mode),
            Statement::SetNodeMode(mode) => {
                state.mode = *mode;
                QueryOutput::Affected(1)
            }
            Statement::Digest(partition) => QueryOutput::Digest(
                state
                    .titles
                    .values()
                    .filter(|t| partition.contains(t))
                    .map(|t| RowDigest {
                        tconst: t.tconst.clone(),
                        hash: t.digest(),
                    })
                    .collect(),
            ),
            Statement::FetchPartition(partition) => QueryOutput::Rows(
                state
                    .titles
                    .values()
                    .filter(|t| partition.contains(t))
                    .cloned()
                    .collect(),
            ),
            Statement::Sync { partition, rows } => {
                QueryOutput::Synced(sync_rows(&mut state.titles, *partition, rows))
            }
        };
        Ok(output)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
