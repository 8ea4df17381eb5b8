//! Client for the internal endpoints of peer nodes

use crate::common::{NodeId, PeerUrls, Result};
use crate::storage::{Partition, RowDigest, Statement, SyncCounts, Title};
use crate::txlog::TxEntry;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const APPLY_PATH: &str = "/api/internal/apply";
pub const DIGEST_PATH: &str = "/api/recovery/digest";
pub const SYNC_PATH: &str = "/api/recovery/sync";
pub const OUTSTANDING_PATH: &str = "/api/recovery/outstanding";
pub const REPLAYED_PATH: &str = "/api/recovery/replayed";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub origin: NodeId,
    pub statement: Statement,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyResponse {
    pub node: NodeId,
    pub affected: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestResponse {
    pub node: NodeId,
    pub partition: Partition,
    pub rows: Vec<RowDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub partition: Partition,
    pub rows: Vec<Title>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub node: NodeId,
    pub records_inserted: u64,
    pub records_updated: u64,
    pub records_removed: u64,
}

impl From<SyncResponse> for SyncCounts {
    fn from(r: SyncResponse) -> Self {
        SyncCounts {
            inserted: r.records_inserted,
            updated: r.records_updated,
            removed: r.records_removed,
        }
    }
}

/// Outcome of replaying one of a peer's log entries elsewhere
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplayedReport {
    pub entry_id: String,
    pub success: bool,
    pub error: Option<String>,
}

pub struct PeerClient {
    client: reqwest::Client,
    peers: PeerUrls,
}

impl PeerClient {
    pub fn new(peers: PeerUrls, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, peers })
    }

    fn url(&self, node: NodeId, path: &str) -> String {
        format!("{}{}", self.peers.url_of(node), path)
    }

    /// Run a replicated statement on `node`; the caller's log tracks it
    pub async fn apply(&self, node: NodeId, origin: NodeId, statement: &Statement) -> Result<ApplyResponse> {
        let body = ApplyRequest {
            origin,
            statement: statement.clone(),
        };
        let response = self
            .client
            .post(self.url(node, APPLY_PATH))
            .json(&body)
            .send()
            .await?;
        decode(node, response).await
    }

    pub async fn digest(&self, node: NodeId) -> Result<DigestResponse> {
        let response = self.client.get(self.url(node, DIGEST_PATH)).send().await?;
        decode(node, response).await
    }

    /// `node`'s digest of the slice `holder` owns
    pub async fn digest_of(&self, node: NodeId, holder: NodeId) -> Result<DigestResponse> {
        let response = self
            .client
            .get(self.url(node, DIGEST_PATH))
            .query(&[("node", holder.as_str())])
            .send()
            .await?;
        decode(node, response).await
    }

    pub async fn sync(&self, node: NodeId, partition: Partition, rows: Vec<Title>) -> Result<SyncCounts> {
        let response = self
            .client
            .post(self.url(node, SYNC_PATH))
            .json(&SyncRequest { partition, rows })
            .send()
            .await?;
        Ok(decode::<SyncResponse>(node, response).await?.into())
    }

    /// Outstanding entries in `node`'s log that target `target`
    pub async fn outstanding(
        &self,
        node: NodeId,
        target: NodeId,
        since_ms: Option<u64>,
    ) -> Result<Vec<TxEntry>> {
        let mut request = self
            .client
            .get(self.url(node, &format!("{}/{}", OUTSTANDING_PATH, target)));
        if let Some(since) = since_ms {
            request = request.query(&[("since", since)]);
        }
        decode(node, request.send().await?).await
    }

    pub async fn report_replayed(&self, node: NodeId, report: &ReplayedReport) -> Result<()> {
        let response = self
            .client
            .post(self.url(node, REPLAYED_PATH))
            .json(report)
            .send()
            .await?;
        decode::<serde_json::Value>(node, response).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(node: NodeId, response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("{} answered {}: {}", node, status, body);
    Err(match status {
        StatusCode::SERVICE_UNAVAILABLE => crate::Error::Connectivity(message),
        StatusCode::CONFLICT => crate::Error::LockConflict(message),
        StatusCode::BAD_REQUEST => crate::Error::InvalidRequest(message),
        _ => crate::Error::Http(message),
    })
}
