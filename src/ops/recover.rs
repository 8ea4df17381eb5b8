//! Manual recovery and transaction log inspection

use crate::common::Result;
use crate::recovery::PassReport;
use crate::txlog::TxEntry;
use serde::de::DeserializeOwned;
use serde::Deserialize;

#[derive(Deserialize)]
struct RecoveryResponse {
    report: PassReport,
}

#[derive(Deserialize)]
struct LogResponse {
    entries: Vec<TxEntry>,
}

/// Trigger a recovery pass on the node at `url`
pub async fn run_recovery(client: &reqwest::Client, url: &str) -> Result<PassReport> {
    tracing::info!("Requesting recovery pass from {}", url);
    let response = client
        .post(format!("{}/api/recovery/run", url.trim_end_matches('/')))
        .send()
        .await?;
    Ok(decode::<RecoveryResponse>(response).await?.report)
}

/// Most recent transaction log entries of the node at `url`
pub async fn fetch_transactions(
    client: &reqwest::Client,
    url: &str,
    limit: usize,
) -> Result<Vec<TxEntry>> {
    let response = client
        .get(format!("{}/api/transactions", url.trim_end_matches('/')))
        .query(&[("limit", limit)])
        .send()
        .await?;
    Ok(decode::<LogResponse>(response).await?.entries)
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(crate::Error::Http(format!("{}: {}", status, body)));
    }
    Ok(response.json().await?)
}
