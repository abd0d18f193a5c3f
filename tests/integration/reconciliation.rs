//! End-to-end reconciliation over a scripted executor

use std::time::Duration;

use node_warden::{LifecycleState, NodeKind, NodeStatus};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

use crate::helpers::{manager_over, ScriptedConnection};

#[tokio::test(start_paused = true)]
async fn mixed_roster_is_classified_end_to_end() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver\n/planner\n/rosout");
    conn.respond(
        "ros2 service list",
        "/lidar_driver/get_state\n/planner/describe_parameters",
    );
    conn.respond("ros2 lifecycle get /lidar_driver", "current state: active [3]");

    let mgr = manager_over(conn.clone(), &dir);
    let summary = mgr.reconcile().await;
    assert_eq!(summary.total, 2, "infrastructure names are not tracked");

    // Classification runs in the background after a settle delay.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let summary = mgr.cached_summary();
        let classified = summary
            .nodes
            .iter()
            .all(|n| n.kind != NodeKind::Unknown);
        if classified {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "classification never completed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    mgr.teardown().await;

    let summary = mgr.cached_summary();
    let lidar = summary
        .nodes
        .iter()
        .find(|n| n.name == "/lidar_driver")
        .unwrap();
    assert_eq!(lidar.kind, NodeKind::Lifecycle);
    assert_eq!(lidar.lifecycle_state, Some(LifecycleState::Active));

    let planner = summary.nodes.iter().find(|n| n.name == "/planner").unwrap();
    assert_eq!(planner.kind, NodeKind::Regular);
    assert_eq!(planner.lifecycle_state, None);

    // One service-list fetch served both classifications.
    assert_eq!(conn.commands_containing("ros2 service list"), 1);
}

#[tokio::test]
async fn unchanged_roster_reconciles_idempotently() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver\n/planner");
    conn.respond("ros2 service list", "");

    let mgr = manager_over(conn, &dir);
    let first = mgr.reconcile().await;
    let first_seen = mgr.node_detail("/planner", false).await.unwrap().first_seen;

    let second = mgr.reconcile().await;
    mgr.teardown().await;

    assert_eq!(first, second);
    assert_eq!(
        mgr.node_detail("/planner", false).await.unwrap().first_seen,
        first_seen
    );
}

#[tokio::test]
async fn executor_outage_never_marks_nodes_inactive() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver\n/planner");
    conn.fail_on("ros2 node list");
    conn.respond("ros2 service list", "");

    let mgr = manager_over(conn, &dir);
    mgr.reconcile().await;

    // Several failed polls in a row change nothing.
    for _ in 0..3 {
        let summary = mgr.reconcile().await;
        assert_eq!(summary.active, 2);
        assert_eq!(summary.inactive, 0);
    }
    mgr.teardown().await;
}

#[tokio::test(start_paused = true)]
async fn lifecycle_shutdown_is_graceful_and_kill_needs_force() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver\n/planner");
    conn.respond("ros2 service list", "/lidar_driver/get_state");
    conn.respond("ros2 lifecycle get /lidar_driver", "current state: active [3]");
    conn.respond("ros2 lifecycle set /lidar_driver shutdown", "ok");
    conn.respond("pgrep", "3131");
    conn.respond("kill ", "");

    let mgr = manager_over(conn.clone(), &dir);
    mgr.reconcile().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // Lifecycle node: graceful transition, no process killing.
    let (stopped, _) = mgr.shutdown_node("/lidar_driver", false).await;
    assert!(stopped);
    assert_eq!(conn.commands_containing("pgrep"), 0);

    // Regular node: refused without force, killed with it.
    let (stopped, message) = mgr.shutdown_node("/planner", false).await;
    assert!(!stopped);
    assert!(message.contains("force"));

    let (stopped, _) = mgr.shutdown_node("/planner", true).await;
    mgr.teardown().await;
    assert!(stopped);
    assert_eq!(conn.commands_containing("kill 3131"), 1);

    let summary = mgr.cached_summary();
    assert_eq!(summary.active, 0);
    assert_eq!(summary.inactive, 2);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_transition_round_trip() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 service list", "/lidar_driver/get_state");
    conn.respond("ros2 lifecycle get /lidar_driver", "current state: inactive [2]");
    conn.respond("ros2 lifecycle get /lidar_driver", "current state: active [3]");
    conn.respond("ros2 lifecycle set /lidar_driver activate", "ok");

    let mgr = manager_over(conn.clone(), &dir);
    mgr.reconcile().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    // A bogus transition is rejected before any executor traffic.
    assert!(mgr
        .lifecycle_transition("/lidar_driver", "detonate")
        .await
        .is_err());
    assert_eq!(conn.commands_containing("lifecycle set"), 0);

    let state = mgr
        .lifecycle_transition("/lidar_driver", "activate")
        .await
        .unwrap();
    mgr.teardown().await;

    assert_eq!(state, LifecycleState::Active);
    let detail = mgr.node_detail("/lidar_driver", false).await.unwrap();
    assert_eq!(detail.lifecycle_state, Some(LifecycleState::Active));
    assert_eq!(detail.status, NodeStatus::Active);
}

#[tokio::test]
async fn node_detail_refresh_pulls_endpoints_and_parameters() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 service list", "");
    conn.respond(
        "ros2 node info /lidar_driver",
        "/lidar_driver\n  Subscribers:\n    /clock: rosgraph_msgs/msg/Clock\n  Publishers:\n    /points_raw: sensor_msgs/msg/PointCloud2\n  Service Servers:\n    /lidar_driver/get_parameters: rcl_interfaces/srv/GetParameters\n",
    );
    conn.respond(
        "ros2 param dump /lidar_driver",
        "/lidar_driver:\n  ros__parameters:\n    frame_id: 'lidar_link'\n    rate: 10\n",
    );

    let mgr = manager_over(conn, &dir);
    mgr.reconcile().await;
    let detail = mgr.node_detail("/lidar_driver", true).await.unwrap();
    mgr.teardown().await;

    assert_eq!(detail.subscribers, vec!["/clock"]);
    assert_eq!(detail.publishers, vec!["/points_raw"]);
    assert_eq!(detail.services, vec!["/lidar_driver/get_parameters"]);
    assert_eq!(detail.parameters.get("rate").unwrap(), "10");
}
