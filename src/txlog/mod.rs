//! Write-ahead transaction log using RocksDB
//!
//! Stores:
//! - Entries (big-endian seq → bincode `TxEntry`)
//! - Id index (entry uuid → seq)
//!
//! Every entry is written PENDING before the statement runs and moves exactly
//! once to COMMITTED or FAILED. Replays never rewrite history: they append a
//! new entry linked to the one they replay.

mod entry;

pub use entry::{EntryId, TxEntry, TxStatus};

use crate::common::{timestamp_now_millis, NodeId, Result};
use crate::storage::{OpKind, Statement};
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const CF_ENTRIES: &str = "entries";
const CF_IDS: &str = "ids";

pub struct TransactionLog {
    db: DB,
    next_seq: AtomicU64,
    /// Serializes status transitions (read-modify-write)
    transitions: Mutex<()>,
}

impl TransactionLog {
    /// Open or create the log
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_ENTRIES, CF_IDS])?;

        let last_seq = {
            let cf = db
                .cf_handle(CF_ENTRIES)
                .ok_or_else(|| crate::Error::Internal("missing entries column family".into()))?;
            match db.iterator_cf(cf, IteratorMode::End).next() {
                Some(item) => {
                    let (key, _) = item?;
                    decode_seq(&key)?
                }
                None => 0,
            }
        };

        Ok(Self {
            db,
            next_seq: AtomicU64::new(last_seq + 1),
            transitions: Mutex::new(()),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| crate::Error::Internal(format!("missing column family {}", name)))
    }

    /// Persist a PENDING entry for `statement` against `target`
    pub fn append(&self, kind: OpKind, target: NodeId, statement: &Statement) -> Result<EntryId> {
        let (op, params) = statement
            .to_parts()
            .map_err(|e| crate::Error::LogWrite(e.to_string()))?;
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let now = timestamp_now_millis();
        let entry = TxEntry {
            id: Uuid::new_v4().to_string(),
            seq,
            kind,
            target,
            statement: op,
            params,
            status: TxStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            replay_of: None,
            origin_seq: seq,
            origin_created_at: now,
        };
        self.insert(&entry)?;
        debug!(id = %entry.id, seq, %target, %kind, "Logged pending transaction");
        Ok(entry.id)
    }

    /// Append a PENDING entry that replays `original`
    pub fn append_replay(&self, original: &TxEntry) -> Result<EntryId> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let now = timestamp_now_millis();
        let entry = TxEntry {
            id: Uuid::new_v4().to_string(),
            seq,
            kind: original.kind,
            target: original.target,
            statement: original.statement.clone(),
            params: original.params.clone(),
            status: TxStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
            replay_of: Some(original.id.clone()),
            origin_seq: original.origin_seq,
            origin_created_at: original.origin_created_at,
        };
        self.insert(&entry)?;
        debug!(id = %entry.id, replay_of = %original.id, "Logged replay");
        Ok(entry.id)
    }

    fn insert(&self, entry: &TxEntry) -> Result<()> {
        let value = bincode::serialize(entry)
            .map_err(|e| crate::Error::LogWrite(format!("Serialize error: {}", e)))?;
        let mut batch = WriteBatch::default();
        batch.put_cf(self.cf(CF_ENTRIES)?, entry.seq.to_be_bytes(), value);
        batch.put_cf(self.cf(CF_IDS)?, entry.id.as_bytes(), entry.seq.to_be_bytes());
        self.db
            .write(batch)
            .map_err(|e| crate::Error::LogWrite(e.to_string()))
    }

    /// Move a PENDING entry to a terminal status.
    ///
    /// Repeating the current terminal status is a no-op; switching between
    /// terminal statuses is refused.
    pub fn mark_status(&self, id: &str, status: TxStatus, error: Option<String>) -> Result<()> {
        if !status.is_terminal() {
            return Err(crate::Error::InvalidRequest(
                "entries can only move to COMMITTED or FAILED".into(),
            ));
        }

        let _guard = self.transitions.lock().unwrap_or_else(|e| e.into_inner());
        let mut entry = self
            .get(id)?
            .ok_or_else(|| crate::Error::NotFound(format!("transaction {}", id)))?;

        if entry.status == status {
            return Ok(());
        }
        if entry.status.is_terminal() {
            return Err(crate::Error::LogConflict {
                id: id.to_string(),
                current: entry.status.to_string(),
                requested: status.to_string(),
            });
        }

        entry.status = status;
        entry.error = error;
        entry.updated_at = timestamp_now_millis();
        let value = bincode::serialize(&entry)
            .map_err(|e| crate::Error::LogWrite(format!("Serialize error: {}", e)))?;
        self.db
            .put_cf(self.cf(CF_ENTRIES)?, entry.seq.to_be_bytes(), value)
            .map_err(|e| crate::Error::LogWrite(e.to_string()))?;
        debug!(id, %status, "Transaction resolved");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<TxEntry>> {
        let seq = match self.db.get_cf(self.cf(CF_IDS)?, id.as_bytes())? {
            Some(bytes) => decode_seq(&bytes)?,
            None => return Ok(None),
        };
        self.get_by_seq(seq)
    }

    fn get_by_seq(&self, seq: u64) -> Result<Option<TxEntry>> {
        match self.db.get_cf(self.cf(CF_ENTRIES)?, seq.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode_entry(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, mode: IteratorMode) -> Result<Vec<TxEntry>> {
        let mut entries = Vec::new();
        for item in self.db.iterator_cf(self.cf(CF_ENTRIES)?, mode) {
            let (_, value) = item?;
            entries.push(decode_entry(&value)?);
        }
        Ok(entries)
    }

    /// FAILED or PENDING entries for `target` not yet superseded by a replay,
    /// oldest original write first.
    ///
    /// `since_ms` keeps only chains that started at or after that time.
    pub fn find_outstanding(&self, target: NodeId, since_ms: Option<u64>) -> Result<Vec<TxEntry>> {
        let all = self.scan(IteratorMode::Start)?;
        let superseded: HashSet<&str> = all
            .iter()
            .filter_map(|e| e.replay_of.as_deref())
            .collect();

        let mut outstanding: Vec<TxEntry> = all
            .iter()
            .filter(|e| e.target == target)
            .filter(|e| e.status != TxStatus::Committed)
            .filter(|e| !superseded.contains(e.id.as_str()))
            .filter(|e| since_ms.map_or(true, |since| e.origin_created_at >= since))
            .cloned()
            .collect();
        outstanding.sort_by_key(|e| (e.origin_seq, e.seq));
        Ok(outstanding)
    }

    /// Most recent entries first
    pub fn list(&self, limit: usize) -> Result<Vec<TxEntry>> {
        let mut entries = Vec::new();
        for item in self
            .db
            .iterator_cf(self.cf(CF_ENTRIES)?, IteratorMode::End)
            .take(limit)
        {
            let (_, value) = item?;
            entries.push(decode_entry(&value)?);
        }
        Ok(entries)
    }

    /// Entries still PENDING (in flight, or abandoned by a crash)
    pub fn count_pending(&self) -> Result<usize> {
        Ok(self
            .scan(IteratorMode::Start)?
            .iter()
            .filter(|e| e.status == TxStatus::Pending)
            .count())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_seq(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| crate::Error::LogCorrupted(format!("bad seq key of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_entry(bytes: &[u8]) -> Result<TxEntry> {
    bincode::deserialize(bytes).map_err(|e| crate::Error::LogCorrupted(e.to_string()))
}
