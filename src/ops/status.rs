//! Cluster-wide status report

use crate::api::HealthView;
use crate::cluster::{NodeStatus, STATUS_PATH};
use crate::common::{NodeId, PeerUrls, Result};
use std::time::Duration;

/// What one node said about itself, or why it could not be asked
#[derive(Debug)]
pub struct NodeReport {
    pub node: NodeId,
    pub url: String,
    pub status: std::result::Result<NodeStatus, String>,
}

#[derive(Debug)]
pub struct ClusterReport {
    pub nodes: Vec<NodeReport>,
}

impl ClusterReport {
    pub fn healthy(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| matches!(&n.status, Ok(s) if s.database_healthy))
            .count()
    }

    pub fn acting_master(&self) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|n| matches!(&n.status, Ok(s) if s.is_acting_master))
            .map(|n| n.node)
    }
}

/// Ask every node for its status resource
pub async fn cluster_status(peers: &PeerUrls, timeout: Duration) -> Result<ClusterReport> {
    tracing::info!("Collecting cluster status");
    let client = reqwest::Client::builder().timeout(timeout).build()?;

    let mut nodes = Vec::with_capacity(NodeId::ALL.len());
    for node in NodeId::ALL {
        let url = peers.url_of(node).to_string();
        let status = fetch(&client, &url).await.map_err(|e| e.to_string());
        nodes.push(NodeReport { node, url, status });
    }
    Ok(ClusterReport { nodes })
}

async fn fetch(client: &reqwest::Client, url: &str) -> Result<NodeStatus> {
    let response = client.get(format!("{}{}", url, STATUS_PATH)).send().await?;
    if !response.status().is_success() {
        return Err(crate::Error::Http(format!("answered {}", response.status())));
    }
    Ok(response.json().await?)
}

/// Make the node at `url` re-check itself and its peers, then return its table
pub async fn force_health_check(client: &reqwest::Client, url: &str) -> Result<HealthView> {
    tracing::info!("Requesting health check from {}", url);
    let response = client
        .post(format!("{}/api/db-check-health", url.trim_end_matches('/')))
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(crate::Error::Http(format!("answered {}", response.status())));
    }
    Ok(response.json().await?)
}
