//! SQLite title store
//!
//! A pooled (r2d2) SQLite database in WAL mode. Statements run on the
//! blocking thread pool; every write is a `BEGIN IMMEDIATE` transaction so
//! concurrent writers surface as lock conflicts instead of corrupt reads.
//!
//! # Schema
//!
//! - `titles`: one row per title, keyed by `tconst`
//! - `node_config`: `(config_key, config_value)`, holds `node_mode`

use super::{
    sync_rows, AggregateStats, ExecOptions, IsolationLevel, Partition, QueryExecutor,
    QueryOutput, RowDigest, Statement, StorageError, Title, YearTop,
};
use crate::common::NodeMode;
use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const BUSY_TIMEOUT: Duration = Duration::from_millis(2_000);
const TITLE_COLUMNS: &str =
    "tconst, primary_title, runtime_minutes, average_rating, num_votes, start_year";

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS titles (
    tconst TEXT PRIMARY KEY,
    primary_title TEXT NOT NULL,
    runtime_minutes INTEGER NOT NULL,
    average_rating REAL NOT NULL,
    num_votes INTEGER NOT NULL,
    start_year INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_titles_start_year ON titles(start_year);
CREATE TABLE IF NOT EXISTS node_config (
    config_key TEXT PRIMARY KEY,
    config_value TEXT NOT NULL
);
";

pub struct SqliteExecutor {
    pool: Pool<SqliteConnectionManager>,
    path: PathBuf,
}

impl SqliteExecutor {
    /// Open (creating if needed) the database at `path`
    pub fn open(path: impl AsRef<Path>, pool_size: u32) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                StorageError::connection(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let manager = SqliteConnectionManager::file(&path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")
        });
        let pool = Pool::builder()
            .max_size(pool_size.max(1))
            .build(manager)
            .map_err(|e| StorageError::connection(format!("connection pool: {}", e)))?;

        let conn = pool
            .get()
            .map_err(|e| StorageError::connection(e.to_string()))?;
        conn.execute_batch(SCHEMA).map_err(classify)?;

        info!("Opened SQLite title store at {}", path.display());
        Ok(Self { pool, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Map a SQLite failure onto the three error kinds the router cares about
pub fn classify(err: rusqlite::Error) -> StorageError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                return StorageError::lock_conflict(err.to_string())
            }
            ErrorCode::CannotOpen
            | ErrorCode::SystemIoFailure
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::FileLockingProtocolFailed => {
                return StorageError::connection(err.to_string())
            }
            _ => {}
        }
    }
    StorageError::logic(err.to_string())
}

fn row_to_title(row: &rusqlite::Row<'_>) -> rusqlite::Result<Title> {
    Ok(Title {
        tconst: row.get(0)?,
        primary_title: row.get(1)?,
        runtime_minutes: row.get(2)?,
        average_rating: row.get(3)?,
        num_votes: row.get(4)?,
        start_year: row.get(5)?,
    })
}

fn partition_rows(conn: &Connection, partition: Partition) -> rusqlite::Result<Vec<Title>> {
    let (lo, hi) = partition.bounds();
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM titles WHERE start_year >= ?1 AND start_year < ?2 ORDER BY tconst",
        TITLE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![lo, hi], row_to_title)?;
    rows.collect()
}

fn upsert(conn: &Connection, t: &Title) -> rusqlite::Result<usize> {
    conn.execute(
        "INSERT INTO titles (tconst, primary_title, runtime_minutes, average_rating, num_votes, start_year)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(tconst) DO UPDATE SET
            primary_title = excluded.primary_title,
            runtime_minutes = excluded.runtime_minutes,
            average_rating = excluded.average_rating,
            num_votes = excluded.num_votes,
            start_year = excluded.start_year",
        params![
            t.tconst,
            t.primary_title,
            t.runtime_minutes,
            t.average_rating,
            t.num_votes,
            t.start_year
        ],
    )
}

fn read_node_mode(conn: &Connection) -> rusqlite::Result<NodeMode> {
    let value: Option<String> = conn
        .query_row(
            "SELECT config_value FROM node_config WHERE config_key = 'node_mode'",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value.and_then(|v| NodeMode::parse(&v)).unwrap_or_default())
}

fn run_write(conn: &mut Connection, statement: &Statement) -> rusqlite::Result<QueryOutput> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let output = match statement {
        Statement::InsertTitle(t) => QueryOutput::Affected(upsert(&tx, t)? as u64),
        Statement::UpdateTitle(u) => QueryOutput::Affected(tx.execute(
            "UPDATE titles SET
                primary_title = COALESCE(?2, primary_title),
                runtime_minutes = COALESCE(?3, runtime_minutes),
                average_rating = COALESCE(?4, average_rating),
                num_votes = COALESCE(?5, num_votes),
                start_year = COALESCE(?6, start_year)
             WHERE tconst = ?1",
            params![
                u.tconst,
                u.primary_title,
                u.runtime_minutes,
                u.average_rating,
                u.num_votes,
                u.start_year
            ],
        )? as u64),
        Statement::DeleteTitle { tconst } => QueryOutput::Affected(
            tx.execute("DELETE FROM titles WHERE tconst = ?1", params![tconst])? as u64,
        ),
        Statement::AddReviews {
            tconst,
            new_rating,
            new_votes,
        } => QueryOutput::Affected(tx.execute(
            "UPDATE titles SET
                average_rating = CASE WHEN num_votes + ?3 > 0
                    THEN (average_rating * num_votes + ?2 * ?3) / (num_votes + ?3)
                    ELSE average_rating END,
                num_votes = num_votes + ?3
             WHERE tconst = ?1",
            params![tconst, new_rating, new_votes],
        )? as u64),
        Statement::SetNodeMode(mode) => QueryOutput::Affected(tx.execute(
            "INSERT INTO node_config (config_key, config_value) VALUES ('node_mode', ?1)
             ON CONFLICT(config_key) DO UPDATE SET config_value = excluded.config_value",
            params![mode.as_str()],
        )? as u64),
        Statement::Sync { partition, rows } => {
            let before: BTreeMap<String, Title> = partition_rows(&tx, *partition)?
                .into_iter()
                .map(|t| (t.tconst.clone(), t))
                .collect();
            let mut after = before.clone();
            let counts = sync_rows(&mut after, *partition, rows);

            for tconst in before.keys().filter(|k| !after.contains_key(*k)) {
                tx.execute("DELETE FROM titles WHERE tconst = ?1", params![tconst])?;
            }
            for (tconst, row) in &after {
                if before.get(tconst) != Some(row) {
                    upsert(&tx, row)?;
                }
            }
            QueryOutput::Synced(counts)
        }
        other => run_read(&tx, other)?,
    };
    tx.commit()?;
    Ok(output)
}

fn run_read(conn: &Connection, statement: &Statement) -> rusqlite::Result<QueryOutput> {
    let output = match statement {
        Statement::Ping => {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            QueryOutput::Pong
        }
        Statement::SelectTop {
            column,
            descending,
            limit,
        } => {
            let sql = format!(
                "SELECT {} FROM titles ORDER BY {} {} LIMIT ?1",
                TITLE_COLUMNS,
                column.sql_name(),
                if *descending { "DESC" } else { "ASC" }
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params![limit], row_to_title)?;
            QueryOutput::Rows(rows.collect::<rusqlite::Result<_>>()?)
        }
        Statement::Search { term, limit } => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM titles
                 WHERE tconst = ?1 OR primary_title LIKE '%' || ?1 || '%'
                 ORDER BY num_votes DESC LIMIT ?2",
                TITLE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![term, limit], row_to_title)?;
            QueryOutput::Rows(rows.collect::<rusqlite::Result<_>>()?)
        }
        Statement::SearchAdvanced(filter) => {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM titles
                 WHERE (?1 IS NULL OR primary_title LIKE '%' || ?1 || '%')
                   AND (?2 IS NULL OR average_rating >= ?2)
                   AND (?3 IS NULL OR average_rating <= ?3)
                   AND (?4 IS NULL OR num_votes >= ?4)
                 ORDER BY num_votes DESC LIMIT ?5",
                TITLE_COLUMNS
            ))?;
            let rows = stmt.query_map(
                params![
                    filter.title_query,
                    filter.min_rating,
                    filter.max_rating,
                    filter.min_votes,
                    filter.limit
                ],
                row_to_title,
            )?;
            QueryOutput::Rows(rows.collect::<rusqlite::Result<_>>()?)
        }
        Statement::TopByYear {
            start_year,
            end_year,
            min_votes,
        } => {
            let mut stmt = conn.prepare_cached(
                "SELECT start_year, tconst, primary_title, average_rating FROM (
                    SELECT start_year, tconst, primary_title, average_rating,
                           ROW_NUMBER() OVER (
                               PARTITION BY start_year
                               ORDER BY average_rating DESC, num_votes DESC, tconst
                           ) AS rnk
                    FROM titles
                    WHERE num_votes > ?1 AND start_year > ?2 AND start_year < ?3
                 )
                 WHERE rnk = 1
                 ORDER BY start_year",
            )?;
            let tops = stmt.query_map(params![min_votes, start_year, end_year], |row| {
                Ok(YearTop {
                    start_year: row.get(0)?,
                    tconst: row.get(1)?,
                    primary_title: row.get(2)?,
                    highest: row.get(3)?,
                })
            })?;
            QueryOutput::YearTops(tops.collect::<rusqlite::Result<_>>()?)
        }
        Statement::Aggregate => conn.query_row(
            "SELECT COUNT(*), AVG(average_rating),
                    SUM(average_rating * num_votes) / NULLIF(SUM(num_votes), 0),
                    SUM(num_votes), AVG(num_votes)
             FROM titles",
            [],
            |row| {
                Ok(QueryOutput::Aggregate(AggregateStats {
                    movie_count: row.get::<_, i64>(0)? as u64,
                    average_rating: row.get(1)?,
                    average_weighted_rating: row.get(2)?,
                    total_votes: row.get(3)?,
                    average_votes: row.get(4)?,
                }))
            },
        )?,
        Statement::GetNodeMode => QueryOutput::Mode(read_node_mode(conn)?),
        Statement::Digest(partition) => QueryOutput::Digest(
            partition_rows(conn, *partition)?
                .iter()
                .map(|t| RowDigest {
                    tconst: t.tconst.clone(),
                    hash: t.digest(),
                })
                .collect(),
        ),
        Statement::FetchPartition(partition) => {
            QueryOutput::Rows(partition_rows(conn, *partition)?)
        }
        other => {
            return Err(rusqlite::Error::InvalidParameterName(format!(
                "{:?} is a write statement",
                other
            )))
        }
    };
    Ok(output)
}

fn run(
    pool: &Pool<SqliteConnectionManager>,
    statement: &Statement,
    options: ExecOptions,
) -> Result<QueryOutput, StorageError> {
    let mut conn = pool
        .get()
        .map_err(|e| StorageError::connection(format!("connection pool: {}", e)))?;

    let uncommitted = options.isolation == IsolationLevel::ReadUncommitted;
    conn.pragma_update(None, "read_uncommitted", uncommitted)
        .map_err(classify)?;

    if options.is_write || statement.is_write() {
        run_write(&mut conn, statement).map_err(classify)
    } else {
        run_read(&conn, statement).map_err(classify)
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(
        &self,
        statement: &Statement,
        options: ExecOptions,
    ) -> Result<QueryOutput, StorageError> {
        let pool = self.pool.clone();
        let statement = statement.clone();
        debug!(op = ?statement.op_kind(), isolation = ?options.isolation, "sqlite execute");

        tokio::task::spawn_blocking(move || run(&pool, &statement, options))
            .await
            .map_err(|e| StorageError::logic(format!("query task failed: {}", e)))?
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{sample_title, StorageErrorKind, SyncCounts, TitleFilter, TitleUpdate};
    use tempfile::tempdir;

    fn open_temp() -> (tempfile::TempDir, SqliteExecutor) {
        let dir = tempdir().unwrap();
        let exec = SqliteExecutor::open(dir.path().join("titles.db"), 4).unwrap();
        assert_eq!(exec.path(), dir.path().join("titles.db"));
        (dir, exec)
    }

    #[tokio::test]
    async fn test_insert_update_select() {
        let (_dir, exec) = open_temp();
        exec.execute(
            &Statement::InsertTitle(sample_title("tt0000001", 1995)),
            ExecOptions::write(),
        )
        .await
        .unwrap();

        let update = TitleUpdate {
            tconst: "tt0000001".into(),
            average_rating: Some(8.2),
            ..Default::default()
        };
        let out = exec
            .execute(&Statement::UpdateTitle(update), ExecOptions::write())
            .await
            .unwrap();
        assert_eq!(out.affected(), 1);

        let rows = exec
            .execute(
                &Statement::Search {
                    term: "tt0000001".into(),
                    limit: 5,
                },
                ExecOptions::read(),
            )
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].average_rating - 8.2).abs() < 1e-9);
        assert_eq!(rows[0].primary_title, "Title tt0000001");
    }

    #[tokio::test]
    async fn test_insert_replaces_existing_row() {
        let (_dir, exec) = open_temp();
        let mut t = sample_title("tt1", 2001);
        exec.execute(&Statement::InsertTitle(t.clone()), ExecOptions::write())
            .await
            .unwrap();
        t.num_votes = 5;
        exec.execute(&Statement::InsertTitle(t), ExecOptions::write())
            .await
            .unwrap();

        let rows = exec
            .execute(&Statement::FetchPartition(Partition::All), ExecOptions::read())
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].num_votes, 5);
    }

    #[tokio::test]
    async fn test_add_reviews() {
        let (_dir, exec) = open_temp();
        let mut t = sample_title("tt1", 2001);
        t.average_rating = 6.0;
        t.num_votes = 2;
        exec.execute(&Statement::InsertTitle(t), ExecOptions::write())
            .await
            .unwrap();
        exec.execute(
            &Statement::AddReviews {
                tconst: "tt1".into(),
                new_rating: 9.0,
                new_votes: 1,
            },
            ExecOptions::write(),
        )
        .await
        .unwrap();

        let rows = exec
            .execute(&Statement::FetchPartition(Partition::All), ExecOptions::read())
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows[0].num_votes, 3);
        assert!((rows[0].average_rating - 7.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_node_mode_round_trip() {
        let (_dir, exec) = open_temp();
        assert_eq!(
            exec.execute(&Statement::GetNodeMode, ExecOptions::read())
                .await
                .unwrap(),
            QueryOutput::Mode(NodeMode::Vice)
        );
        exec.execute(
            &Statement::SetNodeMode(NodeMode::ActingMaster),
            ExecOptions::write(),
        )
        .await
        .unwrap();
        assert_eq!(
            exec.execute(&Statement::GetNodeMode, ExecOptions::read())
                .await
                .unwrap(),
            QueryOutput::Mode(NodeMode::ActingMaster)
        );
    }

    #[tokio::test]
    async fn test_sync_partition() {
        let (_dir, exec) = open_temp();
        for t in [
            sample_title("tt1", 2000),
            sample_title("tt2", 2001),
            sample_title("tt9", 2020),
        ] {
            exec.execute(&Statement::InsertTitle(t), ExecOptions::write())
                .await
                .unwrap();
        }
        let mut changed = sample_title("tt1", 2000);
        changed.num_votes = 1;
        let out = exec
            .execute(
                &Statement::Sync {
                    partition: Partition::Before(2010),
                    rows: vec![changed, sample_title("tt3", 2003)],
                },
                ExecOptions::write(),
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            QueryOutput::Synced(SyncCounts {
                inserted: 1,
                updated: 1,
                removed: 1
            })
        );

        let all = exec
            .execute(&Statement::FetchPartition(Partition::All), ExecOptions::read())
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        let ids: Vec<_> = all.iter().map(|t| t.tconst.as_str()).collect();
        assert_eq!(ids, vec!["tt1", "tt3", "tt9"]);
    }

    #[tokio::test]
    async fn test_advanced_search_and_top_by_year() {
        let (_dir, exec) = open_temp();
        let mut night = sample_title("tt1", 2001);
        night.primary_title = "The Long Night".into();
        night.average_rating = 8.0;
        night.num_votes = 5000;
        let mut day = sample_title("tt2", 2001);
        day.primary_title = "A Long Day".into();
        day.average_rating = 6.5;
        day.num_votes = 9000;
        let mut other = sample_title("tt3", 2002);
        other.average_rating = 9.0;
        other.num_votes = 2000;
        for t in [night, day, other] {
            exec.execute(&Statement::InsertTitle(t), ExecOptions::write())
                .await
                .unwrap();
        }

        let rows = exec
            .execute(
                &Statement::SearchAdvanced(TitleFilter {
                    title_query: Some("LONG".into()),
                    limit: 10,
                    ..Default::default()
                }),
                ExecOptions::read(),
            )
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|t| t.tconst.as_str()).collect();
        assert_eq!(ids, vec!["tt2", "tt1"]);

        let rows = exec
            .execute(
                &Statement::SearchAdvanced(TitleFilter {
                    min_rating: Some(7.0),
                    min_votes: Some(3000),
                    limit: 10,
                    ..Default::default()
                }),
                ExecOptions::read(),
            )
            .await
            .unwrap()
            .into_rows()
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].tconst, "tt1");

        let tops = exec
            .execute(
                &Statement::TopByYear {
                    start_year: 2000,
                    end_year: 2010,
                    min_votes: 1000,
                },
                ExecOptions::read(),
            )
            .await
            .unwrap()
            .into_year_tops()
            .unwrap();
        assert_eq!(tops.len(), 2);
        assert_eq!((tops[0].start_year, tops[0].tconst.as_str()), (2001, "tt1"));
        assert_eq!(tops[0].highest, 8.0);
        assert_eq!((tops[1].start_year, tops[1].tconst.as_str()), (2002, "tt3"));
    }

    #[test]
    fn test_classify_busy_as_lock_conflict() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        );
        assert_eq!(classify(err).kind, StorageErrorKind::LockConflict);

        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
            None,
        );
        assert_eq!(classify(err).kind, StorageErrorKind::Connection);

        let err = rusqlite::Error::QueryReturnedNoRows;
        assert_eq!(classify(err).kind, StorageErrorKind::SyntaxOrLogic);
    }
}
