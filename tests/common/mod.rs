//! In-process cluster harness shared by the integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use trinode::api::{create_router, AppState};
use trinode::common::{PeerUrls, StorageBackend};
use trinode::storage::{MemoryExecutor, Title};
use trinode::{Config, NodeId, NodeServer};

pub struct TestNode {
    pub node: NodeId,
    pub url: String,
    pub db: Arc<MemoryExecutor>,
    pub state: AppState,
    server: JoinHandle<()>,
    _dir: TempDir,
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.server.abort();
    }
}

/// Bind a port for a node that will be started later
pub async fn reserve() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// URL nothing listens on
pub fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{}", addr)
}

pub fn peer_urls(main: &str, node_a: &str, node_b: &str) -> PeerUrls {
    PeerUrls {
        main: main.to_string(),
        node_a: node_a.to_string(),
        node_b: node_b.to_string(),
    }
}

pub fn test_config(node: NodeId, peers: &PeerUrls, dir: &Path) -> Config {
    let mut config = Config::for_node(node);
    config.peers = peers.clone();
    config.storage.backend = StorageBackend::Memory;
    config.txlog_path = dir.join("txlog");
    config.health.local_debounce_ms = 0;
    config.health.peer_timeout_ms = 1_000;
    config.forwarding.relay_timeout_ms = 2_000;
    config.recovery.on_startup = false;
    config.recovery.pending_grace_secs = 0;
    config
}

/// Build a node's state without serving it
pub fn build_node(node: NodeId, peers: &PeerUrls, db: Arc<MemoryExecutor>) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(node, peers, dir.path());
    let state = NodeServer::new(config).with_executor(db).build().unwrap();
    (state, dir)
}

/// Serve an already built state
pub fn serve(
    node: NodeId,
    listener: TcpListener,
    url: String,
    db: Arc<MemoryExecutor>,
    state: AppState,
    dir: TempDir,
) -> TestNode {
    let router = create_router(state.clone());
    let server = tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    TestNode {
        node,
        url,
        db,
        state,
        server,
        _dir: dir,
    }
}

pub fn start(
    node: NodeId,
    listener: TcpListener,
    peers: &PeerUrls,
    db: Arc<MemoryExecutor>,
) -> TestNode {
    let url = peers.url_of(node).to_string();
    let (state, dir) = build_node(node, peers, db.clone());
    serve(node, listener, url, db, state, dir)
}

pub fn title(tconst: &str, year: i32) -> Title {
    Title {
        tconst: tconst.to_string(),
        primary_title: format!("Title {}", tconst),
        runtime_minutes: 90,
        average_rating: 7.0,
        num_votes: 100,
        start_year: year,
    }
}

pub fn insert_body(tconst: &str, year: i32) -> serde_json::Value {
    serde_json::json!({
        "tconst": tconst,
        "primaryTitle": format!("Title {}", tconst),
        "runtimeMinutes": 90,
        "averageRating": 7.5,
        "numVotes": 10,
        "startYear": year,
    })
}
