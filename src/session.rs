//! One monitored environment, fully wired
//!
//! A [`Session`] owns the executor, the durable store, the reconciler,
//! the alert engine and the log collector for a single server entry. The
//! binary (or an embedding application) talks only to this surface; no
//! globals are involved, so multiple sessions can coexist.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::alerts::{Alert, AlertEngine, SubscriberId};
use crate::config::{AlertConfig, ServerConfig};
use crate::connection::{Connection, LocalConnection, Ros2Client};
use crate::reconciler::NodeManager;
use crate::rosout::LogCollectorHandle;
use crate::state::StateStore;
use crate::{LifecycleState, LogRecord, NodeRecord, RosterSummary};

pub struct Session {
    server_id: String,
    conn: Arc<dyn Connection>,
    manager: NodeManager,
    alerts: Arc<AlertEngine>,
    collector: LogCollectorHandle,
    closed: AtomicBool,
}

impl Session {
    /// Connect to one configured server and wire everything up.
    ///
    /// Fails when the container cannot be verified as running; everything
    /// past that point is lazy.
    pub async fn connect(
        server: &ServerConfig,
        alert_config: AlertConfig,
        data_dir: &Path,
    ) -> anyhow::Result<Self> {
        let conn: Arc<dyn Connection> =
            Arc::new(LocalConnection::new(&server.container, &server.ros_setup));
        conn.connect()
            .await
            .with_context(|| format!("connecting to {}", server.display_name()))?;

        let ros2 = Ros2Client::new(conn.clone());
        let store = Arc::new(Mutex::new(StateStore::open(data_dir, &server.id)));
        let alerts = Arc::new(AlertEngine::new(ros2.clone(), alert_config));
        let manager = NodeManager::new(&server.id, ros2, store, Some(alerts.clone()));
        let collector = LogCollectorHandle::spawn(conn.clone());

        info!("session established for {}", server.display_name());
        Ok(Self {
            server_id: server.id.clone(),
            conn,
            manager,
            alerts,
            collector,
            closed: AtomicBool::new(false),
        })
    }

    /// Wrap pre-built parts; lets tests drive a session over a mock
    /// executor.
    #[cfg(test)]
    pub(crate) fn from_parts(
        server_id: impl Into<String>,
        conn: Arc<dyn Connection>,
        manager: NodeManager,
        alerts: Arc<AlertEngine>,
        collector: LogCollectorHandle,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            conn,
            manager,
            alerts,
            collector,
            closed: AtomicBool::new(false),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// One reconciliation pass against the live roster.
    pub async fn reconcile(&self) -> RosterSummary {
        self.manager.reconcile().await
    }

    /// Last persisted roster, no executor traffic.
    pub fn cached_summary(&self) -> RosterSummary {
        self.manager.cached_summary()
    }

    pub async fn node_detail(&self, name: &str, refresh: bool) -> Option<NodeRecord> {
        self.manager.node_detail(name, refresh).await
    }

    pub async fn shutdown_node(&self, name: &str, force: bool) -> (bool, String) {
        self.manager.shutdown_node(name, force).await
    }

    pub async fn lifecycle_transition(
        &self,
        name: &str,
        transition: &str,
    ) -> anyhow::Result<LifecycleState> {
        self.manager.lifecycle_transition(name, transition).await
    }

    pub async fn start_alerts(&self) {
        self.alerts.start().await;
    }

    pub async fn stop_alerts(&self) {
        self.alerts.stop().await;
    }

    pub fn subscribe_alerts<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        self.alerts.subscribe(callback)
    }

    pub fn unsubscribe_alerts(&self, id: SubscriberId) {
        self.alerts.unsubscribe(id);
    }

    /// Pull-style access to accepted alerts.
    pub fn alert_stream(&self) -> AlertStream {
        AlertStream {
            engine: self.alerts.clone(),
        }
    }

    /// Parsed rosout records, optionally filtered to one node. `None`
    /// when the collector has already shut down.
    pub async fn log_stream(&self, node: Option<String>) -> Option<mpsc::Receiver<LogRecord>> {
        self.collector.subscribe(node).await
    }

    /// Tear the session down: alert engine, collector, classification
    /// tasks, then the connection. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing session for {}", self.server_id);
        self.alerts.stop().await;
        self.collector.shutdown().await;
        self.manager.teardown().await;
        self.conn.disconnect().await;
    }
}

/// Drains accepted alerts off the engine's bounded queue.
///
/// `next()` returns `None` once the engine has stopped and the queue is
/// empty, so a drain loop terminates naturally on session close.
pub struct AlertStream {
    engine: Arc<AlertEngine>,
}

impl AlertStream {
    pub async fn next(&self) -> Option<Alert> {
        self.engine.next_alert().await
    }
}
