use std::path::PathBuf;

use tracing::trace;

use crate::alerts::AlertSeverity;

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Config {
    pub servers: Option<Vec<ServerConfig>>,

    /// Alert engine configuration (optional - defaults to disabled)
    pub alerts: Option<AlertConfig>,

    #[serde(default = "crate::util::get_default_data_dir")]
    pub data_dir: PathBuf,

    /// Seconds between reconciliation passes
    #[serde(default = "crate::util::get_default_poll_interval")]
    pub poll_interval: u64,
}

/// One monitored environment: a named container reachable from this host.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    pub id: String,
    pub display: Option<String>,
    pub container: String,
    #[serde(default = "default_ros_setup")]
    pub ros_setup: String,
}

impl ServerConfig {
    pub fn display_name(&self) -> String {
        self.display
            .clone()
            .unwrap_or_else(|| format!("{} ({})", self.id, self.container))
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,

    /// Topics whose absence should raise an alert.
    #[serde(default)]
    pub important_topics: Vec<String>,

    /// Case-insensitive regexes matched against rosout messages.
    #[serde(default)]
    pub error_patterns: Vec<PatternSpec>,

    /// Per-topic boolean threshold monitors.
    #[serde(default)]
    pub monitored_topics: Vec<TopicMonitorSpec>,

    /// Optional webhook that accepted alerts are forwarded to.
    pub webhook: Option<Webhook>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            cooldown_seconds: default_cooldown_seconds(),
            important_topics: Vec::new(),
            error_patterns: Vec::new(),
            monitored_topics: Vec::new(),
            webhook: None,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct PatternSpec {
    pub pattern: String,
    #[serde(default = "default_pattern_severity")]
    pub severity: AlertSeverity,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct TopicMonitorSpec {
    pub topic: String,
    #[serde(default = "default_field")]
    pub field: String,
    /// Boolean value that trips the alert (edge-triggered).
    #[serde(default)]
    pub alert_on_value: bool,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct Webhook {
    pub url: String,
}

fn default_enabled() -> bool {
    true
}

fn default_cooldown_seconds() -> u64 {
    60
}

fn default_field() -> String {
    String::from("data")
}

fn default_pattern_severity() -> AlertSeverity {
    AlertSeverity::Error
}

fn default_ros_setup() -> String {
    String::from("/opt/ros/humble/setup.bash")
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))
        .inspect(|config| trace!("loaded config: {config:?}"))
}
