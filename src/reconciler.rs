//! Roster reconciliation
//!
//! One [`NodeManager`] per monitored environment. Each pass polls the
//! live node roster and folds it into the durable store: new names get
//! records (and a background classification), present names are marked
//! active, absent names inactive. Records are never deleted.
//!
//! A failed poll proves nothing about the nodes themselves, so it skips
//! the cycle and leaves every status untouched.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::alerts::AlertEngine;
use crate::connection::Ros2Client;
use crate::state::StateStore;
use crate::{LifecycleState, NodeKind, NodeRecord, NodeStatus, RosterSummary};

/// Infrastructure names excluded from tracking (substring match,
/// case-insensitive).
const DENYLIST: [&str; 4] = ["rosout", "parameter_events", "ros2cli", "transform_listener"];

/// Transitions the lifecycle CLI accepts.
pub const VALID_TRANSITIONS: [&str; 5] =
    ["configure", "activate", "deactivate", "shutdown", "cleanup"];

/// Freshly started nodes need a moment before their services register.
const CLASSIFY_DELAY: Duration = Duration::from_secs(2);

fn is_denylisted(name: &str) -> bool {
    let lowered = name.to_lowercase();
    DENYLIST.iter().any(|entry| lowered.contains(entry))
}

pub struct NodeManager {
    server_id: String,
    ros2: Ros2Client,
    store: Arc<Mutex<StateStore>>,
    alerts: Option<Arc<AlertEngine>>,

    /// In-flight kind classifications, keyed by node name.
    classify_tasks: tokio::sync::Mutex<HashMap<String, JoinHandle<()>>>,
}

impl NodeManager {
    pub fn new(
        server_id: impl Into<String>,
        ros2: Ros2Client,
        store: Arc<Mutex<StateStore>>,
        alerts: Option<Arc<AlertEngine>>,
    ) -> Self {
        Self {
            server_id: server_id.into(),
            ros2,
            store,
            alerts,
            classify_tasks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Roster view of the store without touching the target.
    pub fn cached_summary(&self) -> RosterSummary {
        self.store.lock().unwrap().summary()
    }

    /// One reconciliation pass. Returns the roster after folding in the
    /// poll result, or the unchanged cached roster when the poll fails.
    #[instrument(skip(self), fields(server = %self.server_id))]
    pub async fn reconcile(&self) -> RosterSummary {
        let listed = match self.ros2.node_list().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("node list poll failed: {e}, keeping previous statuses");
                return self.cached_summary();
            }
        };

        let listed: HashSet<String> = listed
            .into_iter()
            .filter(|name| !is_denylisted(name))
            .collect();

        // The service roster is cached for one pass only: drop the
        // previous pass's copy so this pass's classifications see
        // services that registered since.
        self.ros2.invalidate_service_cache().await;

        let mut went_inactive = Vec::new();
        let summary = {
            let mut store = self.store.lock().unwrap();

            let known: Vec<(String, NodeStatus)> = store
                .all_nodes()
                .iter()
                .map(|(name, record)| (name.clone(), record.status))
                .collect();
            for name in &listed {
                if store.get(name).is_some() {
                    store.set_status(name, NodeStatus::Active);
                } else {
                    debug!("tracking new node {name}");
                    store.add_new(name);
                }
            }
            // Only active nodes can go inactive; touching an already
            // inactive record would keep bumping its last_seen.
            for (name, status) in known {
                if status == NodeStatus::Active && !listed.contains(&name) {
                    store.set_status(&name, NodeStatus::Inactive);
                    went_inactive.push(name);
                }
            }

            if let Err(e) = store.save() {
                warn!("persisting node state failed: {e}");
            }
            store.summary()
        };

        if let Some(alerts) = &self.alerts {
            for name in &listed {
                alerts.update_node_status(name, NodeStatus::Active);
            }
            for name in &went_inactive {
                alerts.update_node_status(name, NodeStatus::Inactive);
            }
        }

        // Classify everything still unknown, not just this pass's
        // arrivals, so an earlier failed classification gets retried.
        let unknown: Vec<String> = {
            let store = self.store.lock().unwrap();
            store
                .all_nodes()
                .values()
                .filter(|n| n.kind == NodeKind::Unknown && listed.contains(&n.name))
                .map(|n| n.name.clone())
                .collect()
        };
        for name in unknown {
            self.spawn_classify(name).await;
        }

        summary
    }

    async fn spawn_classify(&self, name: String) {
        let mut tasks = self.classify_tasks.lock().await;
        if let Some(task) = tasks.get(&name) {
            if !task.is_finished() {
                return;
            }
        }

        let ros2 = self.ros2.clone();
        let store = self.store.clone();
        let task_name = name.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(CLASSIFY_DELAY).await;

            let is_lifecycle = match ros2.is_lifecycle_node(&task_name).await {
                Ok(flag) => flag,
                Err(e) => {
                    debug!("classification of {task_name} failed: {e}");
                    return;
                }
            };

            let lifecycle_state = if is_lifecycle {
                match ros2.lifecycle_state(&task_name).await {
                    Ok(state) => state.map(|raw| LifecycleState::parse(&raw)),
                    Err(_) => Some(LifecycleState::Unknown),
                }
            } else {
                None
            };

            let mut store = store.lock().unwrap();
            store.set_kind(
                &task_name,
                if is_lifecycle {
                    NodeKind::Lifecycle
                } else {
                    NodeKind::Regular
                },
            );
            if let Some(state) = lifecycle_state {
                store.set_lifecycle_state(&task_name, state);
            }
            if let Err(e) = store.save() {
                warn!("persisting classification of {task_name} failed: {e}");
            }
        });
        tasks.insert(name, task);
    }

    /// Full record for one node. With `refresh`, an active node gets its
    /// endpoints, parameters and (for lifecycle nodes) state re-queried;
    /// any failed query just leaves the stored snapshot in place.
    pub async fn node_detail(&self, name: &str, refresh: bool) -> Option<NodeRecord> {
        let record = {
            let store = self.store.lock().unwrap();
            store.get(name).cloned()?
        };

        if !refresh || record.status != NodeStatus::Active {
            return Some(record);
        }

        let endpoints = self.ros2.node_info(name).await;
        let parameters = self.ros2.param_dump(name).await;
        let lifecycle_state = if record.kind == NodeKind::Lifecycle {
            match self.ros2.lifecycle_state(name).await {
                Ok(Some(raw)) => Some(LifecycleState::parse(&raw)),
                _ => None,
            }
        } else {
            None
        };

        let mut store = self.store.lock().unwrap();
        let mut record = store.get(name).cloned()?;

        match endpoints {
            Ok(endpoints) => {
                record.subscribers = endpoints.subscribers;
                record.publishers = endpoints.publishers;
                record.services = endpoints.services;
            }
            Err(e) => debug!("endpoint refresh of {name} failed: {e}"),
        }
        match parameters {
            Ok(parameters) => record.parameters = parameters,
            Err(e) => debug!("parameter refresh of {name} failed: {e}"),
        }
        if let Some(state) = lifecycle_state {
            record.lifecycle_state = Some(state);
        }
        record.last_seen = chrono::Utc::now();

        store.upsert(record.clone());
        if let Err(e) = store.save() {
            warn!("persisting node detail failed: {e}");
        }
        Some(record)
    }

    /// Request a lifecycle transition and return the state the node
    /// reports afterwards.
    pub async fn lifecycle_transition(
        &self,
        name: &str,
        transition: &str,
    ) -> anyhow::Result<LifecycleState> {
        anyhow::ensure!(
            VALID_TRANSITIONS.contains(&transition),
            "invalid lifecycle transition: {transition}"
        );

        let record = {
            let store = self.store.lock().unwrap();
            store
                .get(name)
                .cloned()
                .with_context(|| format!("unknown node: {name}"))?
        };
        anyhow::ensure!(
            record.status == NodeStatus::Active,
            "{name} is not active"
        );
        anyhow::ensure!(
            record.kind == NodeKind::Lifecycle,
            "{name} is not a lifecycle node"
        );

        anyhow::ensure!(
            self.ros2.lifecycle_set(name, transition).await,
            "node {name} rejected transition {transition}"
        );

        // The transition may have changed which services exist.
        self.ros2.invalidate_service_cache().await;

        let state = match self.ros2.lifecycle_state(name).await {
            Ok(Some(raw)) => LifecycleState::parse(&raw),
            _ => LifecycleState::Unknown,
        };

        let mut store = self.store.lock().unwrap();
        store.set_lifecycle_state(name, state);
        if let Err(e) = store.save() {
            warn!("persisting lifecycle state failed: {e}");
        }
        Ok(state)
    }

    /// Stop a node. Lifecycle nodes get the graceful `shutdown` transition
    /// (with a kill fallback under `force`); killing a regular node's
    /// process always requires `force`. Structural problems come back as
    /// `(false, reason)` rather than errors.
    pub async fn shutdown_node(&self, name: &str, force: bool) -> (bool, String) {
        let record = {
            let store = self.store.lock().unwrap();
            store.get(name).cloned()
        };
        let Some(record) = record else {
            return (false, format!("unknown node: {name}"));
        };
        if record.status != NodeStatus::Active {
            return (false, format!("{name} is already inactive"));
        }

        let (stopped, message) = match record.kind {
            NodeKind::Unknown => (
                false,
                format!("{name} has not been classified yet, try again shortly"),
            ),
            NodeKind::Lifecycle => {
                if self.ros2.lifecycle_set(name, "shutdown").await {
                    (true, format!("{name} shut down via lifecycle transition"))
                } else if force {
                    debug!("graceful shutdown of {name} failed, falling back to kill");
                    self.kill_by_name(name).await
                } else {
                    (false, format!("lifecycle shutdown of {name} failed"))
                }
            }
            NodeKind::Regular => {
                if !force {
                    (
                        false,
                        format!("{name} is not a lifecycle node, pass force to kill it"),
                    )
                } else {
                    self.kill_by_name(name).await
                }
            }
        };

        if stopped {
            {
                let mut store = self.store.lock().unwrap();
                store.set_status(name, NodeStatus::Inactive);
                if let Err(e) = store.save() {
                    warn!("persisting shutdown of {name} failed: {e}");
                }
            }
            if let Some(alerts) = &self.alerts {
                alerts.update_node_status(name, NodeStatus::Inactive);
            }
            self.ros2.invalidate_service_cache().await;
        }
        (stopped, message)
    }

    /// Kill by the last path segment of the node name, which is what the
    /// process command line actually carries.
    async fn kill_by_name(&self, name: &str) -> (bool, String) {
        let pattern = name.rsplit('/').next().unwrap_or(name);
        match self.ros2.kill_process(pattern).await {
            Ok(true) => (true, format!("killed process matching {pattern}")),
            Ok(false) => (false, format!("no process matching {pattern}")),
            Err(e) => (false, format!("kill of {name} failed: {e}")),
        }
    }

    /// Abort outstanding classification tasks.
    pub async fn teardown(&self) {
        let mut tasks = self.classify_tasks.lock().await;
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }
}
