//! Alert pipeline: reconciler transitions, monitors, queue and webhook

use std::sync::{Arc, Mutex};
use std::time::Duration;

use node_warden::alerts::{AlertEngine, AlertSeverity, AlertType};
use node_warden::connection::Ros2Client;
use node_warden::reconciler::NodeManager;
use node_warden::state::StateStore;
use node_warden::NodeStatus;
use pretty_assertions::assert_eq;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::{alert_config, rosout_frame, ScriptedConnection};

fn quiet_engine(config_json: &str) -> Arc<AlertEngine> {
    // Engine over its own executor so monitor polls cannot consume the
    // reconciler's scripted responses.
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "");
    conn.respond("ros2 topic list", "");
    Arc::new(AlertEngine::new(
        Ros2Client::new(conn),
        alert_config(config_json),
    ))
}

#[tokio::test(start_paused = true)]
async fn node_disappearance_flows_from_reconciler_to_alert_stream() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 node list", "");
    conn.respond("ros2 service list", "");

    let engine = quiet_engine(r#"{"cooldown_seconds": 0}"#);
    engine.start().await;

    let store = Arc::new(Mutex::new(StateStore::open(dir.path(), "robot-1")));
    let mgr = NodeManager::new(
        "robot-1",
        Ros2Client::new(conn),
        store,
        Some(engine.clone()),
    );

    mgr.reconcile().await;
    mgr.reconcile().await;
    mgr.teardown().await;

    let alert = engine.next_alert().await.unwrap();
    assert_eq!(alert.alert_type, AlertType::NodeInactive);
    assert_eq!(alert.severity, AlertSeverity::Error);
    assert_eq!(alert.message, "/lidar_driver");

    engine.stop().await;
    assert!(engine.next_alert().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn flapping_node_raises_inactive_then_recovered() {
    let dir = TempDir::new().unwrap();
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 node list", "");
    conn.respond("ros2 node list", "/lidar_driver");
    conn.respond("ros2 service list", "");

    let engine = quiet_engine(r#"{"cooldown_seconds": 0}"#);
    engine.start().await;

    let store = Arc::new(Mutex::new(StateStore::open(dir.path(), "robot-1")));
    let mgr = NodeManager::new(
        "robot-1",
        Ros2Client::new(conn),
        store,
        Some(engine.clone()),
    );

    mgr.reconcile().await;
    mgr.reconcile().await;
    mgr.reconcile().await;
    mgr.teardown().await;
    engine.stop().await;

    let first = engine.next_alert().await.unwrap();
    let second = engine.next_alert().await.unwrap();
    assert_eq!(first.alert_type, AlertType::NodeInactive);
    assert_eq!(second.alert_type, AlertType::NodeRecovered);
    assert_eq!(second.severity, AlertSeverity::Info);
    assert!(engine.next_alert().await.is_none());
}

#[tokio::test]
async fn queue_keeps_the_newest_hundred_alerts() {
    let engine = quiet_engine(r#"{"cooldown_seconds": 0}"#);

    for i in 0..101 {
        let name = format!("/n{i}");
        engine.update_node_status(&name, NodeStatus::Active);
        engine.update_node_status(&name, NodeStatus::Inactive);
    }

    let mut drained = Vec::new();
    while let Some(alert) = engine.next_alert().await {
        drained.push(alert);
    }

    assert_eq!(drained.len(), 100);
    // The oldest alert (for /n0) was evicted.
    assert_eq!(drained[0].message, "/n1");
    assert_eq!(drained[99].message, "/n100");
}

#[tokio::test(start_paused = true)]
async fn cooldown_suppresses_repeat_alerts_for_the_same_node() {
    let engine = quiet_engine(r#"{"cooldown_seconds": 3600}"#);

    engine.update_node_status("/lidar_driver", NodeStatus::Active);
    engine.update_node_status("/lidar_driver", NodeStatus::Inactive);
    engine.update_node_status("/lidar_driver", NodeStatus::Active);
    engine.update_node_status("/lidar_driver", NodeStatus::Inactive);

    // Second inactive transition falls inside the window; the recovery
    // uses a different key and passes.
    let mut drained = Vec::new();
    while let Some(alert) = engine.next_alert().await {
        drained.push(alert.alert_type);
    }
    assert_eq!(
        drained,
        vec![AlertType::NodeInactive, AlertType::NodeRecovered]
    );
}

#[tokio::test(start_paused = true)]
async fn pattern_monitor_alerts_on_matching_rosout_records() {
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "");
    conn.respond("ros2 topic list", "");

    let mut lines = rosout_frame(1, 20, "/planner", "route ready");
    lines.extend(rosout_frame(2, 40, "/lidar_driver", "DDS Timeout while reading"));
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    conn.push_stream(&refs);

    let engine = Arc::new(AlertEngine::new(
        Ros2Client::new(conn),
        alert_config(
            r#"{
                "cooldown_seconds": 0,
                "error_patterns": [
                    {"pattern": "timeout", "severity": "warning"}
                ]
            }"#,
        ),
    ));
    engine.start().await;

    let alert = engine.next_alert().await.unwrap();
    engine.stop().await;

    assert_eq!(alert.alert_type, AlertType::ErrorPattern);
    assert_eq!(alert.severity, AlertSeverity::Warning);
    assert!(alert.message.starts_with("/lidar_driver:"));
    assert_eq!(
        alert.details.get("full_message").unwrap(),
        "DDS Timeout while reading"
    );
}

#[tokio::test(start_paused = true)]
async fn missing_important_topic_alerts_and_recovers() {
    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "");
    conn.respond("ros2 topic list", "/odom");
    conn.respond("ros2 topic list", "/odom\n/tf");

    let engine = Arc::new(AlertEngine::new(
        Ros2Client::new(conn),
        alert_config(r#"{"cooldown_seconds": 0, "important_topics": ["/tf"]}"#),
    ));
    engine.start().await;

    let missing = engine.next_alert().await.unwrap();
    assert_eq!(missing.alert_type, AlertType::MissingTopic);
    assert_eq!(missing.message, "/tf");

    let recovered = engine.next_alert().await.unwrap();
    engine.stop().await;
    assert_eq!(recovered.alert_type, AlertType::TopicRecovered);
}

#[tokio::test]
async fn accepted_alerts_reach_the_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(body_partial_json(serde_json::json!({
            "type": "node-inactive",
            "severity": "error",
            "message": "/lidar_driver",
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let conn = ScriptedConnection::new();
    conn.respond("ros2 node list", "");
    conn.respond("ros2 topic list", "");
    let engine = AlertEngine::new(
        Ros2Client::new(conn),
        alert_config(&format!(
            r#"{{"cooldown_seconds": 0, "webhook": {{"url": "{}"}}}}"#,
            server.uri()
        )),
    );

    engine.update_node_status("/lidar_driver", NodeStatus::Active);
    engine.update_node_status("/lidar_driver", NodeStatus::Inactive);

    // Delivery runs on its own task; give it a moment.
    for _ in 0..100 {
        if !server.received_requests().await.unwrap_or_default().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn log_collector_fans_out_parsed_records() {
    let conn = ScriptedConnection::new();
    let mut lines = rosout_frame(1, 20, "/planner", "route ready");
    lines.extend(rosout_frame(2, 40, "/lidar_driver", "scan dropped"));
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();

    let handle = node_warden::rosout::LogCollectorHandle::spawn(conn.clone());
    let mut all = handle.subscribe(None).await.unwrap();
    let mut lidar = handle
        .subscribe(Some("/lidar_driver".to_string()))
        .await
        .unwrap();
    conn.push_stream(&refs);

    let first = all.recv().await.unwrap();
    assert_eq!(first.node_name, "/planner");
    assert_eq!(first.level, node_warden::LogLevel::Info);

    let filtered = lidar.recv().await.unwrap();
    assert_eq!(filtered.node_name, "/lidar_driver");
    assert_eq!(filtered.level, node_warden::LogLevel::Error);
    assert_eq!(filtered.message, "scan dropped");

    handle.shutdown().await;
}
