//! Requests wait for the startup recovery pass

mod common;

use common::*;
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use trinode::recovery::PassKind;
use trinode::storage::MemoryExecutor;
use trinode::{NodeId, NodeServer};

#[tokio::test]
async fn test_request_waits_for_gate() {
    let (listener, url) = reserve().await;
    let peers = peer_urls(&url, &dead_url(), &dead_url());
    let db = Arc::new(MemoryExecutor::with_titles([title("tt0000300", 2000)]));
    let (state, dir) = build_node(NodeId::Main, &peers, db.clone());
    state.gate.close();
    let gate = state.gate.clone();
    let main = serve(NodeId::Main, listener, url, db, state, dir);

    let request = tokio::spawn({
        let url = format!("{}/api/titles/distributed-select", main.url);
        async move {
            let resp = Client::new().get(url).send().await.unwrap();
            (resp.status(), Instant::now())
        }
    });

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!request.is_finished());

    // The status resource stays reachable and reports the pass
    let status: Value = Client::new()
        .get(format!("{}/api/recovery/status", main.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["recovering"], true);

    let opened_at = Instant::now();
    gate.open();
    let (status, answered_at) = request.await.unwrap();
    assert_eq!(status, 200);
    assert!(answered_at >= opened_at);
}

#[tokio::test]
async fn test_startup_pass_opens_gate() {
    let (listener, url) = reserve().await;
    let peers = peer_urls(&url, &dead_url(), &dead_url());
    let db = Arc::new(MemoryExecutor::new());
    let (state, dir) = build_node(NodeId::Main, &peers, db.clone());
    let main = serve(NodeId::Main, listener, url, db, state, dir);

    let report = main.state.recovery.run_startup(&main.state.gate).await;
    assert_eq!(report.kind, PassKind::Startup);
    assert_eq!(report.reports.len(), 3);
    assert!(main.state.gate.is_open());
    assert!(!main.state.cluster.is_recovering());
    assert_eq!(
        main.state.recovery.last_pass().map(|p| p.kind),
        Some(PassKind::Startup)
    );
}

#[tokio::test]
async fn test_node_server_serves_after_startup_recovery() {
    let (listener, url) = reserve().await;
    let peers = peer_urls(&url, &dead_url(), &dead_url());
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(NodeId::Main, &peers, dir.path());
    config.recovery.on_startup = true;

    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(NodeServer::new(config).serve_on(listener, async move {
        let _ = stop_rx.await;
    }));

    let resp = Client::new()
        .get(format!("{}/api/db-status", url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["ready"], true);
    assert_eq!(body["currentNode"], "MAIN");

    stop_tx.send(()).unwrap();
    server.await.unwrap().unwrap();
}
