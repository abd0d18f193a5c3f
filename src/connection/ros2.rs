//! ROS 2 CLI wrappers
//!
//! Thin, lenient layer translating `ros2 ...` text output into usable
//! values. None of these parsers treat the output as a grammar: they
//! scan for the fields they need and return empty/None on anything
//! unexpected, because CLI output shifts between distro versions.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{Connection, ConnectionError, ConnectionResult};

const EXEC_TIMEOUT: u64 = 30;
const TOPIC_ECHO_TIMEOUT: u64 = 10;

/// CLI front-end over any [`Connection`].
///
/// Holds the service-list cache: one reconciliation pass classifies
/// many nodes, and each classification needs the service roster, so the
/// first lookup fills the cache and the rest hit it. The cache lives for
/// one pass; the reconciler drops it at the start of the next, and any
/// action that changes what a node exposes drops it immediately.
#[derive(Clone)]
pub struct Ros2Client {
    conn: Arc<dyn Connection>,
    service_cache: Arc<Mutex<Option<Vec<String>>>>,
}

impl Ros2Client {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            conn,
            service_cache: Arc::new(Mutex::new(None)),
        }
    }

    pub fn connection(&self) -> Arc<dyn Connection> {
        self.conn.clone()
    }

    /// Names of currently running nodes.
    pub async fn node_list(&self) -> ConnectionResult<Vec<String>> {
        let output = self.conn.exec("ros2 node list", EXEC_TIMEOUT).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('/'))
            .map(str::to_string)
            .collect())
    }

    /// Subscribers, publishers and service servers of one node.
    pub async fn node_info(&self, node_name: &str) -> ConnectionResult<NodeEndpoints> {
        let output = self
            .conn
            .exec(&format!("ros2 node info {node_name}"), EXEC_TIMEOUT)
            .await?;
        Ok(parse_node_info(&output))
    }

    /// Current parameter values of one node, as opaque strings.
    pub async fn param_dump(
        &self,
        node_name: &str,
    ) -> ConnectionResult<std::collections::BTreeMap<String, String>> {
        let output = self
            .conn
            .exec(
                &format!("ros2 param dump {node_name} --print"),
                EXEC_TIMEOUT,
            )
            .await?;
        Ok(parse_param_dump(&output))
    }

    pub async fn service_list(&self) -> ConnectionResult<Vec<String>> {
        let output = self.conn.exec("ros2 service list", EXEC_TIMEOUT).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Service list served from the cache, fetched lazily on miss.
    pub async fn cached_service_list(&self) -> ConnectionResult<Vec<String>> {
        let mut cache = self.service_cache.lock().await;
        if let Some(services) = cache.as_ref() {
            trace!("service list cache hit ({} entries)", services.len());
            return Ok(services.clone());
        }

        let services = self.service_list().await?;
        *cache = Some(services.clone());
        Ok(services)
    }

    /// Drop the cached service roster; rebuilt lazily on next use.
    pub async fn invalidate_service_cache(&self) {
        let mut cache = self.service_cache.lock().await;
        if cache.take().is_some() {
            debug!("service list cache invalidated");
        }
    }

    /// A node is a lifecycle node iff it exposes the conventional
    /// `<name>/get_state` service.
    pub async fn is_lifecycle_node(&self, node_name: &str) -> ConnectionResult<bool> {
        let services = self.cached_service_list().await?;
        let get_state = format!("{node_name}/get_state");
        Ok(services.iter().any(|s| s == &get_state))
    }

    /// Current lifecycle state, `None` when the output is unparseable.
    pub async fn lifecycle_state(&self, node_name: &str) -> ConnectionResult<Option<String>> {
        let output = self
            .conn
            .exec(&format!("ros2 lifecycle get {node_name}"), EXEC_TIMEOUT)
            .await?;

        let lowered = output.to_lowercase();
        if let Some(idx) = lowered.find("current state:") {
            let rest = &output[idx + "current state:".len()..];
            let state = rest
                .split(|c: char| c == '[' || c == '\n')
                .next()
                .unwrap_or("")
                .trim()
                .to_lowercase();
            if !state.is_empty() {
                return Ok(Some(state));
            }
        }
        Ok(None)
    }

    /// Request a lifecycle transition; true on success.
    pub async fn lifecycle_set(&self, node_name: &str, transition: &str) -> bool {
        self.conn
            .exec(
                &format!("ros2 lifecycle set {node_name} {transition}"),
                EXEC_TIMEOUT,
            )
            .await
            .is_ok()
    }

    /// Kill the first process matching a pattern inside the container.
    pub async fn kill_process(&self, pattern: &str) -> ConnectionResult<bool> {
        let output = match self
            .conn
            .exec(&format!("pgrep -f '{pattern}'"), EXEC_TIMEOUT)
            .await
        {
            Ok(output) => output,
            // pgrep exits 1 when nothing matches.
            Err(ConnectionError::CommandFailed { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let Some(pid) = output.lines().map(str::trim).find(|l| !l.is_empty()) else {
            return Ok(false);
        };

        self.conn.exec(&format!("kill {pid}"), EXEC_TIMEOUT).await?;
        Ok(true)
    }

    pub async fn topic_list(&self) -> ConnectionResult<Vec<String>> {
        let output = self.conn.exec("ros2 topic list", EXEC_TIMEOUT).await?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with('/'))
            .map(str::to_string)
            .collect())
    }

    /// One sampled message from a topic, raw text.
    pub async fn topic_echo_once(&self, topic: &str) -> ConnectionResult<String> {
        self.conn
            .exec(&format!("ros2 topic echo {topic} --once"), TOPIC_ECHO_TIMEOUT)
            .await
    }
}

/// Endpoint names grouped the way `ros2 node info` prints them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeEndpoints {
    pub subscribers: Vec<String>,
    pub publishers: Vec<String>,
    pub services: Vec<String>,
}

fn parse_node_info(output: &str) -> NodeEndpoints {
    #[derive(Clone, Copy, PartialEq)]
    enum Section {
        None,
        Subscribers,
        Publishers,
        Services,
    }

    let mut endpoints = NodeEndpoints::default();
    let mut section = Section::None;

    for line in output.lines() {
        let line = line.trim();

        if line.contains("Subscribers:") {
            section = Section::Subscribers;
        } else if line.contains("Publishers:") {
            section = Section::Publishers;
        } else if line.contains("Service Servers:") || line.contains("Services:") {
            section = Section::Services;
        } else if line.contains("Service Clients:")
            || line.contains("Action Servers:")
            || line.contains("Action Clients:")
        {
            section = Section::None;
        } else if line.starts_with('/') && section != Section::None {
            // Drop the type annotation after the colon.
            let name = line.split(':').next().unwrap_or(line).trim().to_string();
            match section {
                Section::Subscribers => endpoints.subscribers.push(name),
                Section::Publishers => endpoints.publishers.push(name),
                Section::Services => endpoints.services.push(name),
                Section::None => {}
            }
        }
    }

    endpoints
}

/// Scrape `key: value` leaves out of `ros2 param dump` output.
///
/// The dump is YAML, but values are display-only here, so a line scan
/// beats carrying a structural parser. Container keys (lines ending in
/// a bare colon) are skipped.
fn parse_param_dump(output: &str) -> std::collections::BTreeMap<String, String> {
    let mut params = std::collections::BTreeMap::new();

    for line in output.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if value.is_empty() || key.is_empty() || key == "ros__parameters" {
            continue;
        }
        params.insert(key.to_string(), value.trim_matches('\'').to_string());
    }

    params
}
