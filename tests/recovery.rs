//! Log replay and partition sync between live nodes

mod common;

use common::*;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use trinode::common::NodeMode;
use trinode::recovery::{PassKind, RecoveryOutcome};
use trinode::storage::{ExecOptions, MemoryExecutor, QueryExecutor, Statement};
use trinode::txlog::TxStatus;
use trinode::NodeId;

async fn post(client: &Client, url: String, body: Value) -> Value {
    let resp = client.post(url).json(&body).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    resp.json().await.unwrap()
}

#[tokio::test]
async fn test_missed_writes_replayed_in_order() {
    let (main_listener, main_url) = reserve().await;
    let (a_listener, a_url) = reserve().await;
    let (b_listener, b_url) = reserve().await;
    let peers = peer_urls(&main_url, &a_url, &b_url);

    let a_db = Arc::new(MemoryExecutor::new());
    let main = start(NodeId::Main, main_listener, &peers, Arc::new(MemoryExecutor::new()));
    let a = start(NodeId::NodeA, a_listener, &peers, a_db.clone());
    let _b = start(NodeId::NodeB, b_listener, &peers, Arc::new(MemoryExecutor::new()));
    let client = Client::new();

    a_db.set_available(false);
    post(&client, format!("{}/api/titles/distributed-insert", main.url), insert_body("tt0000100", 1990)).await;
    post(
        &client,
        format!("{}/api/titles/distributed-update", main.url),
        json!({ "tconst": "tt0000100", "averageRating": 8.0 }),
    )
    .await;
    post(
        &client,
        format!("{}/api/titles/distributed-update", main.url),
        json!({ "tconst": "tt0000100", "averageRating": 9.0 }),
    )
    .await;

    let outstanding = main.state.txlog.find_outstanding(NodeId::NodeA, None).unwrap();
    assert_eq!(outstanding.len(), 3);
    assert!(outstanding.windows(2).all(|w| w[0].seq < w[1].seq));
    assert!(outstanding.iter().all(|e| e.status == TxStatus::Failed));

    a_db.set_available(true);
    let pass = main.state.recovery.run_pass(PassKind::Manual).await;

    match &pass.report_for(NodeId::NodeA).unwrap().outcome {
        RecoveryOutcome::Completed {
            replayed,
            replay_failed,
            ..
        } => {
            assert_eq!(*replayed, 3);
            assert_eq!(*replay_failed, 0);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(a.db.get("tt0000100").unwrap().average_rating, 9.0);
    assert!(main
        .state
        .txlog
        .find_outstanding(NodeId::NodeA, None)
        .unwrap()
        .is_empty());

    // Nothing left: a second pass replays nothing
    let again = main.state.recovery.run_pass(PassKind::Manual).await;
    match &again.report_for(NodeId::NodeA).unwrap().outcome {
        RecoveryOutcome::Completed { replayed, .. } => assert_eq!(*replayed, 0),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_drifted_partition_is_synced() {
    let (main_listener, main_url) = reserve().await;
    let (a_listener, a_url) = reserve().await;
    let (b_listener, b_url) = reserve().await;
    let peers = peer_urls(&main_url, &a_url, &b_url);

    let main_rows: Vec<_> = (0..10)
        .map(|i| title(&format!("tt10000{:02}", i), 2011 + i))
        .collect();
    let main = start(
        NodeId::Main,
        main_listener,
        &peers,
        Arc::new(MemoryExecutor::with_titles(main_rows)),
    );
    let _a = start(NodeId::NodeA, a_listener, &peers, Arc::new(MemoryExecutor::new()));
    let b = start(
        NodeId::NodeB,
        b_listener,
        &peers,
        Arc::new(MemoryExecutor::with_titles([title("tt9999999", 2020)])),
    );

    let pass = main.state.recovery.run_pass(PassKind::Manual).await;
    match &pass.report_for(NodeId::NodeB).unwrap().outcome {
        RecoveryOutcome::Completed {
            inserted,
            removed,
            diff,
            ..
        } => {
            assert_eq!(*inserted, 10);
            assert_eq!(*removed, 1);
            assert!(diff.as_ref().unwrap().synced);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(b.db.len(), 10);
    assert!(b.db.get("tt9999999").is_none());
}

#[tokio::test]
async fn test_main_recovers_writes_accepted_by_node_a() {
    let (main_listener, main_url) = reserve().await;
    let (a_listener, a_url) = reserve().await;
    let (b_listener, b_url) = reserve().await;
    let peers = peer_urls(&main_url, &a_url, &b_url);

    let main_db = Arc::new(MemoryExecutor::new());
    let a_db = Arc::new(MemoryExecutor::new());
    a_db.execute(
        &Statement::SetNodeMode(NodeMode::ActingMaster),
        ExecOptions::write(),
    )
    .await
    .unwrap();

    let main = start(NodeId::Main, main_listener, &peers, main_db.clone());
    let a = start(NodeId::NodeA, a_listener, &peers, a_db);
    let _b = start(NodeId::NodeB, b_listener, &peers, Arc::new(MemoryExecutor::new()));
    let client = Client::new();

    main_db.set_available(false);
    main.state.monitor.check_peers_now().await;
    post(&client, format!("{}/api/titles/distributed-insert", main.url), insert_body("tt0000200", 2001)).await;
    assert!(main.db.get("tt0000200").is_none());
    assert_eq!(a.state.txlog.find_outstanding(NodeId::Main, None).unwrap().len(), 1);

    main_db.set_available(true);
    let pass = main.state.recovery.run_pass(PassKind::Manual).await;
    match &pass.report_for(NodeId::Main).unwrap().outcome {
        RecoveryOutcome::Completed { replayed, .. } => assert_eq!(*replayed, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(main.db.get("tt0000200").is_some());

    // NODE_A's log records the replay and no longer lists the write
    assert!(a.state.txlog.find_outstanding(NodeId::Main, None).unwrap().is_empty());
    let replay = a
        .state
        .txlog
        .list(10)
        .unwrap()
        .into_iter()
        .find(|e| e.is_replay())
        .expect("replay entry");
    assert_eq!(replay.target, NodeId::Main);
    assert_eq!(replay.status, TxStatus::Committed);
}

#[tokio::test]
async fn test_workers_skip_recovery() {
    let (a_listener, a_url) = reserve().await;
    let peers = peer_urls(&dead_url(), &a_url, &dead_url());
    let a = start(NodeId::NodeA, a_listener, &peers, Arc::new(MemoryExecutor::new()));

    let body: Value = Client::new()
        .post(format!("{}/api/recovery/run", a.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let reports = body["report"]["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r["status"] == "skipped"));
}

#[tokio::test]
async fn test_node_a_writes_for_node_b_are_replayed() {
    let (main_listener, main_url) = reserve().await;
    let (a_listener, a_url) = reserve().await;
    let (b_listener, b_url) = reserve().await;
    let peers = peer_urls(&main_url, &a_url, &b_url);

    let row = title("tt0000300", 2015);
    let main_db = Arc::new(MemoryExecutor::with_titles([row.clone()]));
    let a_db = Arc::new(MemoryExecutor::with_titles([row.clone()]));
    let b_db = Arc::new(MemoryExecutor::with_titles([row]));
    a_db.execute(
        &Statement::SetNodeMode(NodeMode::ActingMaster),
        ExecOptions::write(),
    )
    .await
    .unwrap();

    let main = start(NodeId::Main, main_listener, &peers, main_db.clone());
    let a = start(NodeId::NodeA, a_listener, &peers, a_db);
    let b = start(NodeId::NodeB, b_listener, &peers, b_db.clone());
    let client = Client::new();

    main_db.set_available(false);
    b_db.set_available(false);
    main.state.monitor.check_peers_now().await;
    post(
        &client,
        format!("{}/api/titles/distributed-update", main.url),
        json!({ "tconst": "tt0000300", "averageRating": 9.9 }),
    )
    .await;
    assert_eq!(a.state.txlog.find_outstanding(NodeId::NodeB, None).unwrap().len(), 1);

    main_db.set_available(true);
    b_db.set_available(true);
    let pass = main.state.recovery.run_pass(PassKind::Manual).await;

    match &pass.report_for(NodeId::NodeB).unwrap().outcome {
        RecoveryOutcome::Completed { replayed, .. } => assert_eq!(*replayed, 1),
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(b.db.get("tt0000300").unwrap().average_rating, 9.9);
    assert_eq!(main.db.get("tt0000300").unwrap().average_rating, 9.9);
    assert!(a.state.txlog.find_outstanding(NodeId::NodeB, None).unwrap().is_empty());
    assert!(a.state.txlog.find_outstanding(NodeId::Main, None).unwrap().is_empty());
}

#[tokio::test]
async fn test_check_status_compares_partitions_with_main() {
    let (main_listener, main_url) = reserve().await;
    let (a_listener, a_url) = reserve().await;
    let (b_listener, b_url) = reserve().await;
    let peers = peer_urls(&main_url, &a_url, &b_url);

    let main = start(
        NodeId::Main,
        main_listener,
        &peers,
        Arc::new(MemoryExecutor::with_titles([
            title("tt0000401", 1990),
            title("tt0000402", 1991),
            title("tt0000403", 1992),
            title("tt0000404", 2015),
        ])),
    );
    let a = start(
        NodeId::NodeA,
        a_listener,
        &peers,
        Arc::new(MemoryExecutor::with_titles([
            title("tt0000401", 1990),
            title("tt0000499", 1999),
        ])),
    );
    let _b = start(
        NodeId::NodeB,
        b_listener,
        &peers,
        Arc::new(MemoryExecutor::with_titles([title("tt0000404", 2015)])),
    );
    let client = Client::new();

    let body: Value = client
        .get(format!("{}/api/recovery/check-status", main.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["needsRecovery"], true);
    let partitions = body["partitions"].as_array().unwrap();
    assert_eq!(partitions.len(), 2);
    let node_a = &partitions[0];
    assert_eq!(node_a["node"], "NODE_A");
    assert_eq!(node_a["localRecords"], 2);
    assert_eq!(node_a["mainRecords"], 3);
    assert_eq!(node_a["difference"], -1);
    assert_eq!(node_a["missingFromLocal"], 2);
    assert_eq!(node_a["extraInLocal"], 1);
    assert_eq!(node_a["needsRecovery"], true);
    let node_b = &partitions[1];
    assert_eq!(node_b["node"], "NODE_B");
    assert_eq!(node_b["difference"], 0);
    assert_eq!(node_b["needsRecovery"], false);

    // A worker reports its own slice against MAIN's copy
    let body: Value = client
        .get(format!("{}/api/recovery/check-status", a.url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["needsRecovery"], true);
    assert_eq!(body["health"]["node"], "NODE_A");
    assert_eq!(body["health"]["missingFromLocal"], 2);
    assert_eq!(body["health"]["mainRecords"], 3);

    // Workers cannot serve another node's slice
    let resp = client
        .get(format!("{}/api/recovery/digest?node=NODE_B", a.url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
