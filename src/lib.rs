pub mod alerts;
pub mod config;
pub mod connection;
pub mod notify;
pub mod reconciler;
pub mod rosout;
pub mod session;
pub mod state;
pub mod util;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a tracked node.
///
/// Every node starts out as `Unknown` and is classified in the background
/// once it has been observed for the first time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    #[default]
    Unknown,
    Lifecycle,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Active,
    Inactive,
}

/// State reported by a managed lifecycle node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    #[default]
    Unknown,
    Unconfigured,
    Inactive,
    Active,
    Finalized,
}

impl LifecycleState {
    /// Lenient mapping from `ros2 lifecycle get` output tokens.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "unconfigured" => Self::Unconfigured,
            "inactive" => Self::Inactive,
            "active" => Self::Active,
            "finalized" => Self::Finalized,
            _ => Self::Unknown,
        }
    }
}

/// Everything we know about a single node.
///
/// Records are created on first observation and never deleted; inactive
/// nodes stay around as historical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub status: NodeStatus,
    #[serde(default)]
    pub lifecycle_state: Option<LifecycleState>,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub subscribers: Vec<String>,
    #[serde(default)]
    pub publishers: Vec<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            first_seen: now,
            last_seen: now,
            kind: NodeKind::Unknown,
            status: NodeStatus::Active,
            lifecycle_state: None,
            parameters: BTreeMap::new(),
            subscribers: Vec::new(),
            publishers: Vec::new(),
            services: Vec::new(),
        }
    }
}

/// Whole-snapshot state for one monitored environment. This is what the
/// state store serializes to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    pub last_updated: DateTime<Utc>,
    pub server_id: String,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeRecord>,
}

/// Compact per-node entry used in roster summaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub name: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    pub lifecycle_state: Option<LifecycleState>,
}

/// Result of one reconciliation pass (or a cached view of the store).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterSummary {
    pub total: usize,
    pub active: usize,
    pub inactive: usize,
    /// Sorted by node name.
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// rosout encodes severities as numeric codes.
    pub fn from_code(code: u8) -> Self {
        match code {
            10 => Self::Debug,
            20 => Self::Info,
            30 => Self::Warn,
            40 => Self::Error,
            50 => Self::Fatal,
            _ => Self::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        };
        write!(f, "{s}")
    }
}

/// One structured record reconstructed from the rosout text stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub node_name: String,
    pub message: String,
}
