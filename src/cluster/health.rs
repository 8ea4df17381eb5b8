//! Health monitoring
//!
//! Keeps the shared health table fresh:
//! - the local database is pinged (debounced, so hot request paths can call it)
//! - peers are checked over HTTP through their status resource
//! - a background task refreshes both on fixed intervals

use super::state::{ClusterState, HealthRecord};
use crate::common::{HealthConfig, NodeId, NodeMode, Result};
use crate::storage::{ExecOptions, QueryExecutor, QueryOutput, Statement};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Path of the status resource every node serves
pub const STATUS_PATH: &str = "/api/recovery/status";

/// Body of the status resource
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node: NodeId,
    pub is_coordinator: bool,
    pub database_healthy: bool,
    pub is_acting_master: bool,
    #[serde(default)]
    pub recovering: bool,
    #[serde(default)]
    pub peers: BTreeMap<String, HealthRecord>,
}

pub struct HealthMonitor {
    state: Arc<ClusterState>,
    executor: Arc<dyn QueryExecutor>,
    client: reqwest::Client,
    config: HealthConfig,
    preferred_read: NodeId,
    last_local_check: Mutex<Option<Instant>>,
}

/// Returns true when the window has passed (and restarts it)
fn claim_window(slot: &Mutex<Option<Instant>>, window: Duration) -> bool {
    let mut last = slot.lock().unwrap_or_else(|e| e.into_inner());
    match *last {
        Some(at) if at.elapsed() < window => false,
        _ => {
            *last = Some(Instant::now());
            true
        }
    }
}

impl HealthMonitor {
    pub fn new(
        state: Arc<ClusterState>,
        executor: Arc<dyn QueryExecutor>,
        config: HealthConfig,
        preferred_read: NodeId,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.peer_timeout())
            .build()?;
        Ok(Self {
            state,
            executor,
            client,
            config,
            preferred_read,
            last_local_check: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &Arc<ClusterState> {
        &self.state
    }

    pub fn node(&self) -> NodeId {
        self.state.node()
    }

    /// Ping the local database unless it was checked within the debounce window
    pub async fn check_local_health(&self) -> bool {
        if !claim_window(&self.last_local_check, self.config.local_debounce()) {
            return self.state.is_available(self.node());
        }
        self.query_local().await
    }

    /// Ping the local database now
    pub async fn check_local_health_now(&self) -> bool {
        if let Ok(mut last) = self.last_local_check.lock() {
            *last = Some(Instant::now());
        }
        self.query_local().await
    }

    async fn query_local(&self) -> bool {
        let node = self.node();
        let timeout = self.config.peer_timeout();
        let ping = tokio::time::timeout(
            timeout,
            self.executor.execute(&Statement::Ping, ExecOptions::read()),
        )
        .await;

        let healthy = match ping {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%node, error = %e, "Local database ping failed");
                false
            }
            Err(_) => {
                debug!(%node, "Local database ping timed out");
                false
            }
        };

        if node == NodeId::NodeA {
            let acting = healthy && self.read_acting_master().await;
            self.state.set_acting_master(node, acting);
        }

        self.apply(node, healthy);
        healthy
    }

    async fn read_acting_master(&self) -> bool {
        match self
            .executor
            .execute(&Statement::GetNodeMode, ExecOptions::read())
            .await
        {
            Ok(QueryOutput::Mode(mode)) => mode == NodeMode::ActingMaster,
            Ok(_) => false,
            Err(e) => {
                debug!(error = %e, "Could not read node mode");
                false
            }
        }
    }

    fn apply(&self, node: NodeId, healthy: bool) {
        match self.state.record(node, healthy, Utc::now()) {
            Some(false) => info!(%node, "{} is available again", node.display_name()),
            Some(true) => warn!(%node, "{} became unavailable", node.display_name()),
            None => {}
        }
    }

    /// Fetch a peer's status resource
    pub async fn fetch_status(&self, node: NodeId) -> Result<NodeStatus> {
        let url = format!("{}{}", self.state.url_of(node), STATUS_PATH);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(crate::Error::Http(format!(
                "{} answered {}",
                node,
                response.status()
            )));
        }
        Ok(response.json::<NodeStatus>().await?)
    }

    /// Check one peer; healthy means HTTP 200 and `databaseHealthy`
    pub async fn check_peer_health(&self, node: NodeId) -> bool {
        let healthy = match self.fetch_status(node).await {
            Ok(status) => {
                self.state.set_acting_master(node, status.is_acting_master);
                status.database_healthy
            }
            Err(e) => {
                debug!(%node, error = %e, "Peer health check failed");
                false
            }
        };
        self.apply(node, healthy);
        healthy
    }

    pub async fn check_peers_now(&self) {
        let peers: Vec<NodeId> = self.node().peers().collect();
        if let [first, second] = peers[..] {
            let (first_ok, second_ok) = tokio::join!(
                self.check_peer_health(first),
                self.check_peer_health(second)
            );
            debug!(%first, first_ok, %second, second_ok, "Peers checked");
        }
    }

    /// Preferred node if available, else the first available in hierarchy order
    pub fn get_best_read_node(&self) -> Result<NodeId> {
        let table = self.state.snapshot();
        std::iter::once(self.preferred_read)
            .chain(NodeId::ALL)
            .find(|n| table.is_available(*n))
            .ok_or(crate::Error::NoAvailableNode)
    }

    /// MAIN if available, else NODE_A while it is acting master
    pub fn get_best_write_node(&self) -> Result<NodeId> {
        let table = self.state.snapshot();
        [NodeId::Main, NodeId::NodeA]
            .into_iter()
            .find(|n| table.is_available(*n) && table.can_write(*n))
            .ok_or(crate::Error::NoWritableNode)
    }

    pub fn mark_unavailable(&self, node: NodeId) {
        if self.state.mark_unavailable(node) {
            warn!(%node, "{} marked unavailable", node.display_name());
        }
    }

    /// Start the background refresh loops
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        let local = {
            let monitor = self.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(monitor.config.check_interval());
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    monitor.check_local_health_now().await;
                }
            })
        };
        let peers = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.peer_check_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.check_peers_now().await;
            }
        });
        vec![local, peers]
    }
}
