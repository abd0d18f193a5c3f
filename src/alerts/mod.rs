//! Alert engine
//!
//! A set of independent background monitors (node liveness, topic
//! presence, rosout pattern matches, topic value thresholds) that all
//! funnel their findings through one deduplicating emission path:
//!
//! ```text
//!  liveness ──┐
//!  topics ────┤            ┌─> bounded queue (drop-oldest) ─> drainers
//!  patterns ──┼─> emit() ──┼─> callback subscribers
//!  thresholds ┘  (cooldown)└─> webhook notifier (optional)
//! ```
//!
//! Emission is keyed by an explicit cooldown key; a key only re-fires
//! once `cooldown_seconds` have passed since the last *accepted*
//! emission. Suppression never advances the clock.

pub mod monitors;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::NodeStatus;
use crate::config::AlertConfig;
use crate::connection::Ros2Client;
use crate::notify::WebhookNotifier;

/// Most recent alerts kept for drainers; oldest evicted on overflow.
pub const QUEUE_CAPACITY: usize = 100;

/// Drainers re-check the running flag at this cadence.
const DRAIN_POLL_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertType {
    NodeInactive,
    NodeRecovered,
    MissingTopic,
    TopicRecovered,
    ErrorPattern,
    TopicValue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

/// One alert event. Immutable once created; lives only in the queue and
/// subscriber buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub details: BTreeMap<String, String>,
}

impl Alert {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        title: impl Into<String>,
        message: impl Into<String>,
        details: BTreeMap<String, String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            alert_type,
            severity,
            title: title.into(),
            message: message.into(),
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Identifies one registered callback subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

type AlertCallback = Box<dyn Fn(&Alert) + Send + Sync>;

/// State shared between the engine facade, its monitor tasks, and any
/// drainers.
pub(crate) struct EngineShared {
    pub(crate) config: AlertConfig,
    pub(crate) ros2: Ros2Client,

    /// cooldown key -> last accepted emission
    cooldowns: Mutex<HashMap<String, DateTime<Utc>>>,

    /// Bounded alert queue plus wakeup for drainers.
    queue: Mutex<VecDeque<Alert>>,
    queue_notify: Notify,

    subscribers: Mutex<HashMap<SubscriberId, AlertCallback>>,

    /// Last status per node, written by the liveness monitor *and* the
    /// reconciler's transition callback.
    pub(crate) node_statuses: Mutex<HashMap<String, NodeStatus>>,

    /// Topics currently in a missing episode.
    pub(crate) missing_topics: Mutex<HashSet<String>>,

    running: AtomicBool,

    notifier: Option<WebhookNotifier>,
}

impl EngineShared {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Emit with deduplication. Returns true when the alert was accepted.
    pub(crate) fn emit(
        &self,
        alert_type: AlertType,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        details: BTreeMap<String, String>,
        cooldown_key: &str,
    ) -> bool {
        let now = Utc::now();
        {
            let mut cooldowns = self.cooldowns.lock().unwrap();
            if let Some(last) = cooldowns.get(cooldown_key) {
                let elapsed = now.signed_duration_since(*last);
                if elapsed < chrono::Duration::seconds(self.config.cooldown_seconds as i64) {
                    // Suppressed; the reference point stays put.
                    return false;
                }
            }
            cooldowns.insert(cooldown_key.to_string(), now);
        }

        let alert = Alert::new(alert_type, severity, title, message, details);

        {
            let mut queue = self.queue.lock().unwrap();
            if queue.len() >= QUEUE_CAPACITY {
                queue.pop_front();
            }
            queue.push_back(alert.clone());
        }
        self.queue_notify.notify_waiters();

        {
            let subscribers = self.subscribers.lock().unwrap();
            for callback in subscribers.values() {
                // One broken subscriber must not starve the rest.
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    callback(&alert)
                }));
                if result.is_err() {
                    warn!("alert subscriber callback panicked");
                }
            }
        }

        if let Some(notifier) = &self.notifier {
            notifier.forward(alert.clone());
        }

        info!(
            "alert: [{:?}] {}: {}",
            alert.severity, alert.title, alert.message
        );
        true
    }

    /// Record a status observation and emit on transitions.
    ///
    /// Called from the liveness monitor and from the reconciler whenever
    /// it flips a node's status.
    pub(crate) fn update_node_status(&self, node_name: &str, status: NodeStatus) {
        let previous = {
            let mut statuses = self.node_statuses.lock().unwrap();
            statuses.insert(node_name.to_string(), status)
        };

        // First observation is baseline, not a transition.
        let Some(previous) = previous else {
            return;
        };

        if previous == NodeStatus::Active && status == NodeStatus::Inactive {
            let mut details = BTreeMap::new();
            details.insert("node_name".to_string(), node_name.to_string());
            self.emit(
                AlertType::NodeInactive,
                AlertSeverity::Error,
                "Node went inactive",
                node_name,
                details,
                &format!("node-inactive:{node_name}"),
            );
        } else if previous == NodeStatus::Inactive && status == NodeStatus::Active {
            let mut details = BTreeMap::new();
            details.insert("node_name".to_string(), node_name.to_string());
            self.emit(
                AlertType::NodeRecovered,
                AlertSeverity::Info,
                "Node recovered",
                node_name,
                details,
                &format!("node-recovered:{node_name}"),
            );
        }
    }

    fn pop_alert(&self) -> Option<Alert> {
        self.queue.lock().unwrap().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn queue_len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    #[cfg(test)]
    pub(crate) fn backdate_cooldown(&self, key: &str, seconds: i64) {
        let mut cooldowns = self.cooldowns.lock().unwrap();
        if let Some(ts) = cooldowns.get_mut(key) {
            *ts -= chrono::Duration::seconds(seconds);
        }
    }
}

/// The engine facade owned by a session.
pub struct AlertEngine {
    shared: Arc<EngineShared>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl AlertEngine {
    pub fn new(ros2: Ros2Client, config: AlertConfig) -> Self {
        let notifier = config.webhook.clone().map(WebhookNotifier::new);
        Self {
            shared: Arc::new(EngineShared {
                config,
                ros2,
                cooldowns: Mutex::new(HashMap::new()),
                queue: Mutex::new(VecDeque::new()),
                queue_notify: Notify::new(),
                subscribers: Mutex::new(HashMap::new()),
                node_statuses: Mutex::new(HashMap::new()),
                missing_topics: Mutex::new(HashSet::new()),
                running: AtomicBool::new(false),
                notifier,
            }),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Launch all monitor loops. No-op when disabled or already running.
    pub async fn start(&self) {
        if !self.shared.config.enabled {
            debug!("alert engine disabled in config");
            return;
        }
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("alert engine starting");
        let mut tasks = self.tasks.lock().await;

        tasks.push(tokio::spawn(monitors::liveness_loop(self.shared.clone())));

        if !self.shared.config.important_topics.is_empty() {
            tasks.push(tokio::spawn(monitors::topic_presence_loop(
                self.shared.clone(),
            )));
        }

        if !self.shared.config.error_patterns.is_empty() {
            tasks.push(tokio::spawn(monitors::pattern_loop(self.shared.clone())));
        }

        for spec in self.shared.config.monitored_topics.clone() {
            tasks.push(tokio::spawn(monitors::threshold_loop(
                self.shared.clone(),
                spec,
            )));
        }

        debug!("alert engine started with {} monitors", tasks.len());
    }

    /// Cancel all monitors, await their termination, and clear
    /// subscribers. Safe to call repeatedly or without a prior `start`.
    pub async fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);

        let mut tasks = self.tasks.lock().await;
        let aborted: Vec<_> = tasks
            .drain(..)
            .map(|task| {
                task.abort();
                task
            })
            .collect();
        for result in futures::future::join_all(aborted).await {
            if let Err(e) = result {
                if !e.is_cancelled() {
                    warn!("alert monitor task failed: {e}");
                }
            }
        }

        self.shared.subscribers.lock().unwrap().clear();
        // Wake any drainer so it observes the stopped state.
        self.shared.queue_notify.notify_waiters();
        debug!("alert engine stopped");
    }

    /// Register a callback invoked synchronously for every accepted alert.
    pub fn subscribe<F>(&self, callback: F) -> SubscriberId
    where
        F: Fn(&Alert) + Send + Sync + 'static,
    {
        let id = SubscriberId(Uuid::new_v4());
        self.shared
            .subscribers
            .lock()
            .unwrap()
            .insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.shared.subscribers.lock().unwrap().remove(&id);
    }

    /// Reconciler-facing liveness callback.
    pub fn update_node_status(&self, node_name: &str, status: NodeStatus) {
        self.shared.update_node_status(node_name, status);
    }

    /// Next queued alert; `None` once the engine has stopped and the
    /// queue has drained. Wakes up at least once a second so shutdown is
    /// observed promptly.
    pub async fn next_alert(&self) -> Option<Alert> {
        loop {
            if let Some(alert) = self.shared.pop_alert() {
                return Some(alert);
            }
            if !self.shared.is_running() {
                return None;
            }
            let _ = tokio::time::timeout(DRAIN_POLL_TIMEOUT, self.shared.queue_notify.notified())
                .await;
        }
    }

    #[cfg(test)]
    pub(crate) fn shared(&self) -> Arc<EngineShared> {
        self.shared.clone()
    }
}
