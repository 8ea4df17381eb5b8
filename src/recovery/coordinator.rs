//! Recovery coordinator
//!
//! Passes are serialized; a pass never fails as a whole. Every problem ends
//! up as an `Error` entry in the report for the node it concerns.
//!
//! A pass moves IDLE -> CHECKING (peer health, partition comparison) ->
//! REPLAYING (log replay, bulk sync) -> IDLE.

use super::{
    DiffSummary, PartitionHealth, PassKind, PassReport, ReadinessGate, RecoveryReport,
    RecoveryState, ReplayCounts,
};
use crate::cluster::peer::ReplayedReport;
use crate::cluster::{HealthMonitor, PeerClient};
use crate::common::{timestamp_now_millis, NodeId, RecoveryConfig, Result};
use crate::storage::{ExecOptions, Partition, QueryExecutor, RowDigest, Statement, SyncCounts};
use crate::txlog::{TransactionLog, TxEntry, TxStatus};
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct RecoveryCoordinator {
    monitor: Arc<HealthMonitor>,
    executor: Arc<dyn QueryExecutor>,
    txlog: Arc<TransactionLog>,
    peers: Arc<PeerClient>,
    config: RecoveryConfig,
    split_year: i32,
    phase: watch::Sender<RecoveryState>,
    pass_lock: tokio::sync::Mutex<()>,
    last_pass: Mutex<Option<PassReport>>,
}

impl RecoveryCoordinator {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        executor: Arc<dyn QueryExecutor>,
        txlog: Arc<TransactionLog>,
        peers: Arc<PeerClient>,
        config: RecoveryConfig,
        split_year: i32,
    ) -> Self {
        let (phase, _) = watch::channel(RecoveryState::Idle);
        Self {
            monitor,
            executor,
            txlog,
            peers,
            config,
            split_year,
            phase,
            pass_lock: tokio::sync::Mutex::new(()),
            last_pass: Mutex::new(None),
        }
    }

    pub fn node(&self) -> NodeId {
        self.monitor.node()
    }

    pub fn state(&self) -> RecoveryState {
        *self.phase.borrow()
    }

    /// Follow state changes as they happen
    pub fn watch_state(&self) -> watch::Receiver<RecoveryState> {
        self.phase.subscribe()
    }

    fn set_state(&self, state: RecoveryState) {
        self.phase.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(from = ?current, to = ?state, "Recovery state");
            *current = state;
            true
        });
    }

    pub fn last_pass(&self) -> Option<PassReport> {
        self.last_pass
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Run the startup pass with the gate closed
    pub async fn run_startup(&self, gate: &ReadinessGate) -> PassReport {
        gate.close();
        let report = self.run_pass(PassKind::Startup).await;
        gate.open();
        info!("Startup recovery finished, accepting requests");
        report
    }

    /// One pass: check every worker, then replay and sync the healthy ones
    pub async fn run_pass(&self, kind: PassKind) -> PassReport {
        let _pass = self.pass_lock.lock().await;
        let node = self.node();
        let started_at = Utc::now();
        let state = self.monitor.state();
        state.set_recovering(true);

        let outstanding_local = match self.txlog.count_pending() {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Could not count pending transactions");
                0
            }
        };
        if kind == PassKind::Startup && outstanding_local > 0 {
            warn!(
                count = outstanding_local,
                "Found uncommitted transactions from a previous run"
            );
        }

        let since = match kind {
            PassKind::Periodic => Some(
                timestamp_now_millis()
                    .saturating_sub(self.config.periodic_window_secs * 1000),
            ),
            PassKind::Startup | PassKind::Manual => None,
        };

        let reports = if node.is_coordinator() {
            info!(?kind, "Recovery pass started");
            self.set_state(RecoveryState::Checking);
            let mut checks = Vec::new();
            for peer in [NodeId::NodeA, NodeId::NodeB] {
                checks.push((peer, self.check_peer(peer, since).await));
            }

            self.set_state(RecoveryState::Replaying);
            let mut reports = vec![self.recover_main_from_node_a(since).await];
            for (peer, check) in checks {
                reports.push(match check {
                    Ok(()) => self.recover_peer(peer, since).await,
                    Err(message) => RecoveryReport::error(peer, message),
                });
            }
            reports
        } else {
            node.peers()
                .map(|peer| RecoveryReport::skipped(peer, "not coordinator"))
                .collect()
        };

        self.set_state(RecoveryState::Idle);
        state.set_recovering(false);

        let report = PassReport {
            kind,
            node,
            reports,
            outstanding_local,
            started_at,
            finished_at: Utc::now(),
        };
        if node.is_coordinator() {
            info!(
                ?kind,
                duration_ms = (report.finished_at - started_at).num_milliseconds(),
                "Recovery pass finished"
            );
        }
        *self.last_pass.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    fn is_fresh_pending(&self, entry: &TxEntry) -> bool {
        entry.status == TxStatus::Pending
            && timestamp_now_millis().saturating_sub(entry.created_at)
                < self.config.pending_grace_secs * 1000
    }

    /// Check `peer` and compare its partition with MAIN's copy
    async fn check_peer(&self, peer: NodeId, since: Option<u64>) -> std::result::Result<(), String> {
        if !self.monitor.check_peer_health(peer).await {
            warn!(%peer, "Skipping recovery, peer unreachable or unhealthy");
            return Err(format!("{} unreachable or database unhealthy", peer));
        }

        let outstanding = match self.txlog.find_outstanding(peer, since) {
            Ok(entries) => entries.len(),
            Err(e) => {
                warn!(%peer, error = %e, "Could not read outstanding entries");
                0
            }
        };
        match self.partition_health(peer).await {
            Ok(health) => info!(
                %peer,
                outstanding,
                local = health.local_records,
                main = health.main_records,
                missing = health.missing_from_local,
                needs_recovery = health.needs_recovery,
                "Peer checked"
            ),
            Err(e) => warn!(%peer, outstanding, error = %e, "Could not compare partitions"),
        }
        Ok(())
    }

    /// Compare `worker`'s partition with MAIN's copy of it
    pub async fn partition_health(&self, worker: NodeId) -> Result<PartitionHealth> {
        let node = self.node();
        let partition = Partition::for_node(worker, self.split_year);
        let main_rows = if node == NodeId::Main {
            self.local_digest(partition).await?
        } else {
            self.peers.digest_of(NodeId::Main, worker).await?.rows
        };
        let worker_rows = if node == worker {
            self.local_digest(partition).await?
        } else {
            self.peers.digest(worker).await?.rows
        };
        Ok(PartitionHealth::compare(
            worker,
            &worker_rows,
            &main_rows,
            self.config.diff_tolerance,
        ))
    }

    async fn local_digest(&self, partition: Partition) -> Result<Vec<RowDigest>> {
        Ok(self
            .executor
            .execute(&Statement::Digest(partition), ExecOptions::read())
            .await?
            .into_digest()?)
    }

    async fn recover_peer(&self, peer: NodeId, since: Option<u64>) -> RecoveryReport {
        let mut replay = match self.replay_outstanding(peer, since).await {
            Ok(counts) => counts,
            Err(e) => {
                error!(%peer, error = %e, "Log replay failed");
                return RecoveryReport::error(peer, format!("log replay: {}", e));
            }
        };

        // Writes NODE_A accepted as acting master while NODE_B was away
        if peer == NodeId::NodeB {
            match self.drain_node_a(peer, since).await {
                Ok(counts) => {
                    replay.replayed += counts.replayed;
                    replay.failed += counts.failed;
                }
                Err(e) => {
                    warn!(error = %e, "NODE_A log unavailable, its writes for NODE_B wait for the next pass")
                }
            }
        }

        match self.reconcile(peer).await {
            Ok((diff, sync)) => {
                info!(
                    %peer,
                    replayed = replay.replayed,
                    replay_failed = replay.failed,
                    inserted = sync.inserted,
                    updated = sync.updated,
                    removed = sync.removed,
                    "Peer recovered"
                );
                RecoveryReport::completed(peer, replay, sync, Some(diff))
            }
            Err(e) => {
                error!(%peer, error = %e, "Partition check failed");
                RecoveryReport::error(peer, format!("partition check: {}", e))
            }
        }
    }

    /// Resend every write `peer` missed, oldest first
    async fn replay_outstanding(&self, peer: NodeId, since: Option<u64>) -> Result<ReplayCounts> {
        let mut counts = ReplayCounts::default();
        for entry in self.txlog.find_outstanding(peer, since)? {
            if self.is_fresh_pending(&entry) {
                continue;
            }
            if entry.status == TxStatus::Pending {
                self.txlog
                    .mark_status(&entry.id, TxStatus::Failed, Some("abandoned".into()))?;
            }

            let replay_id = self.txlog.append_replay(&entry)?;
            let result = match entry.to_statement() {
                Ok(statement) => self
                    .peers
                    .apply(peer, self.node(), &statement)
                    .await
                    .map(|_| ()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    self.txlog.mark_status(&replay_id, TxStatus::Committed, None)?;
                    counts.replayed += 1;
                }
                Err(e) => {
                    warn!(%peer, entry = %entry.id, error = %e, "Replay failed");
                    self.txlog
                        .mark_status(&replay_id, TxStatus::Failed, Some(e.to_string()))?;
                    counts.failed += 1;
                }
            }
        }
        Ok(counts)
    }

    /// Compare partition digests and bulk-sync the peer when they drifted
    async fn reconcile(&self, peer: NodeId) -> Result<(DiffSummary, SyncCounts)> {
        let partition = Partition::for_node(peer, self.split_year);
        let local = self.local_digest(partition).await?;
        let remote = self.peers.digest(peer).await?;

        let mut diff = DiffSummary::compute(&local, &remote.rows);
        if !diff.needs_sync(self.config.diff_tolerance) {
            if diff.divergent > 0 {
                info!(%peer, divergent = diff.divergent, "Rows differ but counts match, not syncing");
            }
            return Ok((diff, SyncCounts::default()));
        }

        info!(
            %peer,
            local = diff.local_count,
            remote = diff.peer_count,
            only_local = diff.only_local,
            only_peer = diff.only_peer,
            "Partition drifted, syncing"
        );
        let rows = self
            .executor
            .execute(&Statement::FetchPartition(partition), ExecOptions::read())
            .await?
            .into_rows()?;
        let counts = self.peers.sync(peer, partition, rows).await?;
        diff.synced = true;
        Ok((diff, counts))
    }

    /// Apply writes NODE_A accepted for MAIN while MAIN was down
    async fn recover_main_from_node_a(&self, since: Option<u64>) -> RecoveryReport {
        let main = self.node();
        match self.drain_node_a(main, since).await {
            Ok(counts) => {
                if counts.replayed + counts.failed > 0 {
                    info!(
                        replayed = counts.replayed,
                        failed = counts.failed,
                        "Applied writes accepted by NODE_A"
                    );
                }
                RecoveryReport::completed(main, counts, SyncCounts::default(), None)
            }
            Err(e) => RecoveryReport::skipped(main, format!("NODE_A log unavailable: {}", e)),
        }
    }

    /// Deliver NODE_A's outstanding entries for `target`, reporting each
    /// outcome back so NODE_A's log records the replay
    async fn drain_node_a(&self, target: NodeId, since: Option<u64>) -> Result<ReplayCounts> {
        let entries = self.peers.outstanding(NodeId::NodeA, target, since).await?;

        let mut counts = ReplayCounts::default();
        for entry in entries {
            if self.is_fresh_pending(&entry) {
                continue;
            }
            let result = match entry.to_statement() {
                Ok(statement) => self.apply_to(target, &statement).await,
                Err(e) => Err(e),
            };
            let report = ReplayedReport {
                entry_id: entry.id.clone(),
                success: result.is_ok(),
                error: result.as_ref().err().map(|e| e.to_string()),
            };
            match result {
                Ok(()) => counts.replayed += 1,
                Err(e) => {
                    warn!(%target, entry = %entry.id, error = %e, "Could not apply NODE_A entry");
                    counts.failed += 1;
                }
            }
            if let Err(e) = self.peers.report_replayed(NodeId::NodeA, &report).await {
                warn!(entry = %entry.id, error = %e, "Could not report replay to NODE_A");
            }
        }
        Ok(counts)
    }

    async fn apply_to(&self, target: NodeId, statement: &Statement) -> Result<()> {
        if target == self.node() {
            self.executor
                .execute(statement, ExecOptions::write())
                .await
                .map(|_| ())
                .map_err(crate::Error::from)
        } else {
            self.peers
                .apply(target, NodeId::NodeA, statement)
                .await
                .map(|_| ())
        }
    }

    /// Run a windowed pass every `interval_secs`
    pub fn spawn_periodic(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(self.config.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick fires immediately; startup already covered it
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_pass(PassKind::Periodic).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::peer::{DigestResponse, DIGEST_PATH, OUTSTANDING_PATH};
    use crate::cluster::{ClusterState, NodeStatus, STATUS_PATH};
    use axum::{routing::get, Json, Router};
    use std::collections::BTreeMap;
    use crate::common::{HealthConfig, PeerUrls};
    use crate::storage::MemoryExecutor;
    use crate::recovery::RecoveryOutcome;
    use tempfile::tempdir;

    fn dead_url() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        format!("http://{}", addr)
    }

    /// Peer that is healthy but answers digest and log requests slowly
    async fn slow_peer(node: NodeId) -> String {
        let app = Router::new()
            .route(
                STATUS_PATH,
                get(move || async move {
                    Json(NodeStatus {
                        node,
                        is_coordinator: false,
                        database_healthy: true,
                        is_acting_master: false,
                        recovering: false,
                        peers: BTreeMap::new(),
                    })
                }),
            )
            .route(
                DIGEST_PATH,
                get(move || async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Json(DigestResponse {
                        node,
                        partition: Partition::for_node(node, 2010),
                        rows: Vec::new(),
                    })
                }),
            )
            .route(
                &format!("{}/:target", OUTSTANDING_PATH),
                get(|| async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Json(Vec::<TxEntry>::new())
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn coordinator(node: NodeId, dir: &std::path::Path) -> RecoveryCoordinator {
        let mut peers = PeerUrls::default();
        for n in NodeId::ALL {
            peers.set(n, dead_url());
        }
        coordinator_with(node, dir, peers)
    }

    fn coordinator_with(node: NodeId, dir: &std::path::Path, peers: PeerUrls) -> RecoveryCoordinator {
        let executor: Arc<dyn QueryExecutor> = Arc::new(MemoryExecutor::new());
        let state = Arc::new(ClusterState::new(node, peers.clone()));
        let monitor = Arc::new(
            HealthMonitor::new(state, executor.clone(), HealthConfig::default(), NodeId::Main)
                .unwrap(),
        );
        let txlog = Arc::new(TransactionLog::open(dir).unwrap());
        let client = Arc::new(PeerClient::new(peers, Duration::from_secs(1)).unwrap());
        RecoveryCoordinator::new(
            monitor,
            executor,
            txlog,
            client,
            RecoveryConfig::default(),
            2010,
        )
    }

    #[tokio::test]
    async fn test_workers_skip_recovery() {
        let dir = tempdir().unwrap();
        let coord = coordinator(NodeId::NodeB, dir.path());
        let report = coord.run_pass(PassKind::Manual).await;

        assert_eq!(report.reports.len(), 2);
        for r in &report.reports {
            assert_eq!(
                r.outcome,
                RecoveryOutcome::Skipped {
                    reason: "not coordinator".into()
                }
            );
        }
        assert_eq!(coord.state(), RecoveryState::Idle);
    }

    #[tokio::test]
    async fn test_unreachable_peers_reported_as_errors() {
        let dir = tempdir().unwrap();
        let coord = coordinator(NodeId::Main, dir.path());
        let gate = ReadinessGate::new(true);
        let report = coord.run_startup(&gate).await;

        assert!(gate.is_open());
        assert!(matches!(
            report.report_for(NodeId::NodeA).unwrap().outcome,
            RecoveryOutcome::Error { .. }
        ));
        assert!(matches!(
            report.report_for(NodeId::NodeB).unwrap().outcome,
            RecoveryOutcome::Error { .. }
        ));
        assert!(matches!(
            report.report_for(NodeId::Main).unwrap().outcome,
            RecoveryOutcome::Skipped { .. }
        ));
        assert_eq!(coord.last_pass(), Some(report));
        assert!(!coord.monitor.state().is_recovering());
    }

    #[tokio::test]
    async fn test_pass_checks_every_peer_before_replaying() {
        let dir = tempdir().unwrap();
        let mut peers = PeerUrls::default();
        peers.set(NodeId::Main, dead_url());
        peers.set(NodeId::NodeA, slow_peer(NodeId::NodeA).await);
        peers.set(NodeId::NodeB, slow_peer(NodeId::NodeB).await);
        let coord = coordinator_with(NodeId::Main, dir.path(), peers);

        let mut states = coord.watch_state();
        let recorder = tokio::spawn(async move {
            let mut seen = Vec::new();
            while states.changed().await.is_ok() {
                let state = *states.borrow_and_update();
                seen.push(state);
                if state == RecoveryState::Idle {
                    break;
                }
            }
            seen
        });

        let report = coord.run_pass(PassKind::Manual).await;
        let seen = recorder.await.unwrap();

        assert_eq!(
            seen,
            vec![
                RecoveryState::Checking,
                RecoveryState::Replaying,
                RecoveryState::Idle
            ]
        );
        for node in NodeId::ALL {
            assert!(matches!(
                report.report_for(node).unwrap().outcome,
                RecoveryOutcome::Completed { .. }
            ));
        }
    }
}
