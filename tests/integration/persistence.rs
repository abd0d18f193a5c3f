//! Snapshot persistence across manager restarts

use std::fs;
use std::sync::{Arc, Mutex};

use node_warden::connection::Ros2Client;
use node_warden::reconciler::NodeManager;
use node_warden::state::StateStore;
use node_warden::NodeStatus;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::{manager_over, ScriptedConnection};

#[tokio::test]
async fn roster_survives_a_manager_restart() {
    let dir = TempDir::new().unwrap();

    {
        let conn = ScriptedConnection::new();
        conn.respond("ros2 node list", "/lidar_driver\n/planner");
        conn.respond("ros2 node list", "/lidar_driver");
        conn.respond("ros2 service list", "");

        let mgr = manager_over(conn, &dir);
        mgr.reconcile().await;
        mgr.reconcile().await;
        mgr.teardown().await;
    }

    // Fresh store over the same directory, no executor traffic at all.
    let conn = ScriptedConnection::new();
    let mgr = manager_over(conn.clone(), &dir);
    let summary = mgr.cached_summary();

    assert_eq!(summary.total, 2);
    assert_eq!(summary.active, 1);
    let planner = summary.nodes.iter().find(|n| n.name == "/planner").unwrap();
    assert_eq!(planner.status, NodeStatus::Inactive);
    assert_eq!(conn.commands_containing("ros2"), 0);
}

#[tokio::test]
async fn first_seen_survives_restart_and_reappearance() {
    let dir = TempDir::new().unwrap();

    let first_seen = {
        let conn = ScriptedConnection::new();
        conn.respond("ros2 node list", "/planner");
        conn.respond("ros2 service list", "");
        let mgr = manager_over(conn, &dir);
        mgr.reconcile().await;
        mgr.teardown().await;
        mgr.node_detail("/planner", false).await.unwrap().first_seen
    };

    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/planner");
    conn.respond("ros2 service list", "");
    let mgr = manager_over(conn, &dir);
    mgr.reconcile().await;
    mgr.teardown().await;

    let record = mgr.node_detail("/planner", false).await.unwrap();
    assert_eq!(record.first_seen, first_seen);
    assert!(record.last_seen >= first_seen);
}

#[tokio::test]
async fn corrupt_snapshot_starts_empty_and_is_rebuilt() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("node_state_robot-1.json"),
        "{ definitely not json",
    )
    .unwrap();

    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/planner");
    conn.respond("ros2 service list", "");

    let mgr = manager_over(conn, &dir);
    assert_eq!(mgr.cached_summary().total, 0);

    mgr.reconcile().await;
    mgr.teardown().await;

    // The rebuilt snapshot replaced the corrupt file.
    let content = fs::read_to_string(dir.path().join("node_state_robot-1.json")).unwrap();
    let parsed: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert!(parsed["nodes"]["/planner"].is_object());
}

#[tokio::test]
async fn save_leaves_no_temp_file_behind() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/planner");
    conn.respond("ros2 service list", "");

    let mgr = manager_over(conn, &dir);
    mgr.reconcile().await;
    mgr.teardown().await;

    let entries: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(entries, vec!["node_state_robot-1.json"]);
}

#[tokio::test]
async fn snapshots_are_isolated_per_server() {
    let dir = TempDir::new().unwrap();

    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 service list", "");
    let mgr = manager_over(conn, &dir);
    mgr.reconcile().await;
    mgr.teardown().await;

    // A second environment over the same data dir sees nothing.
    let conn_b = ScriptedConnection::new();
    let store_b = Arc::new(Mutex::new(StateStore::open(dir.path(), "robot-2")));
    let mgr_b = NodeManager::new("robot-2", Ros2Client::new(conn_b), store_b, None);
    assert_eq!(mgr_b.cached_summary().total, 0);
}
