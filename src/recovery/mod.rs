//! Recovery of peers after outages
//!
//! MAIN repairs its workers in two steps: replay the writes its log says a
//! peer missed, then compare partition digests and bulk-sync when they drift
//! apart. A blocking pass runs at startup, a windowed pass periodically.

pub mod coordinator;
pub mod gate;

pub use coordinator::RecoveryCoordinator;
pub use gate::{readiness_middleware, ReadinessGate};

use crate::common::NodeId;
use crate::storage::{RowDigest, SyncCounts};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryState {
    Idle,
    Checking,
    Replaying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PassKind {
    Startup,
    Periodic,
    Manual,
}

/// Comparison of MAIN's copy of a partition with a peer's
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiffSummary {
    pub local_count: u64,
    pub peer_count: u64,
    pub only_local: u64,
    pub only_peer: u64,
    pub divergent: u64,
    pub synced: bool,
}

impl DiffSummary {
    pub fn compute(local: &[RowDigest], peer: &[RowDigest]) -> Self {
        let peer_map: HashMap<&str, &str> = peer
            .iter()
            .map(|d| (d.tconst.as_str(), d.hash.as_str()))
            .collect();
        let local_map: HashMap<&str, &str> = local
            .iter()
            .map(|d| (d.tconst.as_str(), d.hash.as_str()))
            .collect();

        let mut summary = DiffSummary {
            local_count: local.len() as u64,
            peer_count: peer.len() as u64,
            ..Default::default()
        };
        for (tconst, hash) in &local_map {
            match peer_map.get(tconst) {
                None => summary.only_local += 1,
                Some(peer_hash) if peer_hash != hash => summary.divergent += 1,
                Some(_) => {}
            }
        }
        summary.only_peer = peer_map
            .keys()
            .filter(|k| !local_map.contains_key(*k))
            .count() as u64;
        summary
    }

    /// Count drift beyond `tolerance`, or rows present on one side only
    pub fn needs_sync(&self, tolerance: u64) -> bool {
        self.local_count.abs_diff(self.peer_count) > tolerance
            || self.only_local > 0
            || self.only_peer > 0
    }
}

/// A worker's partition measured against MAIN's copy of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionHealth {
    pub node: NodeId,
    pub local_records: u64,
    pub main_records: u64,
    /// `local_records - main_records`
    pub difference: i64,
    pub missing_from_local: u64,
    pub extra_in_local: u64,
    pub divergent: u64,
    pub needs_recovery: bool,
}

impl PartitionHealth {
    pub fn compare(node: NodeId, local: &[RowDigest], main: &[RowDigest], tolerance: u64) -> Self {
        let diff = DiffSummary::compute(local, main);
        let difference = diff.local_count as i64 - diff.peer_count as i64;
        Self {
            node,
            local_records: diff.local_count,
            main_records: diff.peer_count,
            difference,
            missing_from_local: diff.only_peer,
            extra_in_local: diff.only_local,
            divergent: diff.divergent,
            needs_recovery: difference.unsigned_abs() > tolerance || diff.only_peer > 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum RecoveryOutcome {
    Skipped {
        reason: String,
    },
    #[serde(rename_all = "camelCase")]
    Completed {
        replayed: u64,
        replay_failed: u64,
        inserted: u64,
        updated: u64,
        removed: u64,
        diff: Option<DiffSummary>,
    },
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryReport {
    pub node: NodeId,
    #[serde(flatten)]
    pub outcome: RecoveryOutcome,
}

impl RecoveryReport {
    pub fn skipped(node: NodeId, reason: impl Into<String>) -> Self {
        Self {
            node,
            outcome: RecoveryOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn error(node: NodeId, message: impl Into<String>) -> Self {
        Self {
            node,
            outcome: RecoveryOutcome::Error {
                message: message.into(),
            },
        }
    }

    pub fn completed(node: NodeId, replay: ReplayCounts, sync: SyncCounts, diff: Option<DiffSummary>) -> Self {
        Self {
            node,
            outcome: RecoveryOutcome::Completed {
                replayed: replay.replayed,
                replay_failed: replay.failed,
                inserted: sync.inserted,
                updated: sync.updated,
                removed: sync.removed,
                diff,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayCounts {
    pub replayed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub kind: PassKind,
    pub node: NodeId,
    pub reports: Vec<RecoveryReport>,
    /// Local entries still PENDING when the pass started
    pub outstanding_local: usize,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

impl PassReport {
    pub fn report_for(&self, node: NodeId) -> Option<&RecoveryReport> {
        self.reports.iter().find(|r| r.node == node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(tconst: &str, hash: &str) -> RowDigest {
        RowDigest {
            tconst: tconst.into(),
            hash: hash.into(),
        }
    }

    #[test]
    fn test_diff_counts() {
        let local = vec![d("tt1", "a"), d("tt2", "b"), d("tt3", "c")];
        let peer = vec![d("tt2", "b"), d("tt3", "x"), d("tt4", "d")];
        let diff = DiffSummary::compute(&local, &peer);
        assert_eq!(diff.only_local, 1);
        assert_eq!(diff.only_peer, 1);
        assert_eq!(diff.divergent, 1);
        assert!(diff.needs_sync(5));
    }

    #[test]
    fn test_partition_health() {
        let local = vec![d("tt1", "a"), d("tt9", "z")];
        let main = vec![d("tt1", "b"), d("tt2", "b"), d("tt3", "c")];
        let health = PartitionHealth::compare(NodeId::NodeA, &local, &main, 5);
        assert_eq!(health.local_records, 2);
        assert_eq!(health.main_records, 3);
        assert_eq!(health.difference, -1);
        assert_eq!(health.missing_from_local, 2);
        assert_eq!(health.extra_in_local, 1);
        assert_eq!(health.divergent, 1);
        assert!(health.needs_recovery);

        // Extra rows on the worker alone stay within tolerance
        let local = vec![d("tt1", "a"), d("tt2", "b")];
        let main = vec![d("tt1", "a")];
        let health = PartitionHealth::compare(NodeId::NodeB, &local, &main, 5);
        assert_eq!(health.difference, 1);
        assert!(!health.needs_recovery);
    }

    #[test]
    fn test_divergent_rows_alone_do_not_sync() {
        let local = vec![d("tt1", "a")];
        let peer = vec![d("tt1", "b")];
        let diff = DiffSummary::compute(&local, &peer);
        assert_eq!(diff.divergent, 1);
        assert!(!diff.needs_sync(5));
    }

    #[test]
    fn test_report_json_shape() {
        let report = RecoveryReport::skipped(NodeId::NodeB, "not coordinator");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["node"], "NODE_B");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["reason"], "not coordinator");
    }
}
