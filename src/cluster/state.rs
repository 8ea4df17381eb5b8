//! Shared health table
//!
//! One `ClusterState` per process, injected wherever health is read or
//! written. The lock is only held for single reads/assignments, never across
//! an `.await`.

use crate::common::{NodeId, PeerUrls};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthRecord {
    pub available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub is_acting_master: bool,
}

impl Default for HealthRecord {
    fn default() -> Self {
        Self {
            available: true,
            last_checked: None,
            is_acting_master: false,
        }
    }
}

/// Health of all three nodes as seen by this process
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthTable {
    records: [HealthRecord; 3],
}

fn slot(node: NodeId) -> usize {
    match node {
        NodeId::Main => 0,
        NodeId::NodeA => 1,
        NodeId::NodeB => 2,
    }
}

impl HealthTable {
    pub fn get(&self, node: NodeId) -> &HealthRecord {
        &self.records[slot(node)]
    }

    fn get_mut(&mut self, node: NodeId) -> &mut HealthRecord {
        &mut self.records[slot(node)]
    }

    pub fn is_available(&self, node: NodeId) -> bool {
        self.get(node).available
    }

    /// MAIN always, NODE_A only as acting master, NODE_B never
    pub fn can_write(&self, node: NodeId) -> bool {
        match node {
            NodeId::Main => true,
            NodeId::NodeA => self.get(node).is_acting_master,
            NodeId::NodeB => false,
        }
    }

    /// Record a check result. Returns the previous availability when it changed.
    pub fn record(
        &mut self,
        node: NodeId,
        available: bool,
        checked_at: DateTime<Utc>,
    ) -> Option<bool> {
        let record = self.get_mut(node);
        let previous = record.available;
        record.available = available;
        record.last_checked = Some(match record.last_checked {
            Some(last) if last > checked_at => last,
            _ => checked_at,
        });
        (previous != available).then_some(previous)
    }

    pub fn set_acting_master(&mut self, node: NodeId, acting: bool) {
        self.get_mut(node).is_acting_master = acting;
    }

    /// Build a table directly, mostly for tests
    pub fn with(mut self, node: NodeId, available: bool, acting_master: bool) -> Self {
        let record = self.get_mut(node);
        record.available = available;
        record.is_acting_master = acting_master;
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &HealthRecord)> {
        NodeId::ALL.into_iter().map(move |n| (n, self.get(n)))
    }
}

pub struct ClusterState {
    node: NodeId,
    peers: PeerUrls,
    table: RwLock<HealthTable>,
    recovering: AtomicBool,
}

impl ClusterState {
    pub fn new(node: NodeId, peers: PeerUrls) -> Self {
        Self {
            node,
            peers,
            table: RwLock::new(HealthTable::default()),
            recovering: AtomicBool::new(false),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn peers(&self) -> &PeerUrls {
        &self.peers
    }

    pub fn url_of(&self, node: NodeId) -> &str {
        self.peers.url_of(node)
    }

    fn read(&self) -> RwLockReadGuard<'_, HealthTable> {
        self.table.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HealthTable> {
        self.table.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> HealthTable {
        self.read().clone()
    }

    pub fn record_of(&self, node: NodeId) -> HealthRecord {
        self.read().get(node).clone()
    }

    pub fn is_available(&self, node: NodeId) -> bool {
        self.read().is_available(node)
    }

    pub fn record(&self, node: NodeId, available: bool, checked_at: DateTime<Utc>) -> Option<bool> {
        self.write().record(node, available, checked_at)
    }

    /// Returns true when the node was considered available until now
    pub fn mark_unavailable(&self, node: NodeId) -> bool {
        self.write().record(node, false, Utc::now()).is_some()
    }

    pub fn set_acting_master(&self, node: NodeId, acting: bool) {
        self.write().set_acting_master(node, acting);
    }

    pub fn set_recovering(&self, recovering: bool) {
        self.recovering.store(recovering, Ordering::SeqCst);
    }

    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }
}
