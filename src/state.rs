//! Flat-file persistence for node state
//!
//! One JSON file per monitored environment, written wholesale on every
//! mutation batch. Loading is forgiving: a missing or corrupt file just
//! yields an empty snapshot, since the reconciler will rebuild it.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::Utc;
use tracing::{debug, warn};

use crate::{LifecycleState, NodeKind, NodeRecord, NodeState, NodeStatus, NodeSummary, RosterSummary};

pub struct StateStore {
    file_path: PathBuf,
    state: NodeState,
}

impl StateStore {
    /// Open (and load) the store for one environment.
    pub fn open(data_dir: &Path, server_id: &str) -> Self {
        let file_path = data_dir.join(format!("node_state_{server_id}.json"));
        let state = Self::load(&file_path, server_id);
        Self { file_path, state }
    }

    fn load(file_path: &Path, server_id: &str) -> NodeState {
        match fs::read_to_string(file_path) {
            Ok(content) => match serde_json::from_str::<NodeState>(&content) {
                Ok(state) => {
                    debug!(
                        "loaded {} node records from {}",
                        state.nodes.len(),
                        file_path.display()
                    );
                    state
                }
                Err(e) => {
                    warn!("corrupt state file {}: {e}, starting empty", file_path.display());
                    Self::empty(server_id)
                }
            },
            Err(_) => Self::empty(server_id),
        }
    }

    fn empty(server_id: &str) -> NodeState {
        NodeState {
            last_updated: Utc::now(),
            server_id: server_id.to_string(),
            nodes: Default::default(),
        }
    }

    /// Atomic whole-file overwrite: write a sibling temp file, then rename.
    pub fn save(&self) -> anyhow::Result<()> {
        let parent = self
            .file_path
            .parent()
            .context("state file has no parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("creating state directory {}", parent.display()))?;

        let json = serde_json::to_string_pretty(&self.state)?;
        let tmp_path = self.file_path.with_extension("json.tmp");
        fs::write(&tmp_path, json)
            .with_context(|| format!("writing {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.file_path)
            .with_context(|| format!("replacing {}", self.file_path.display()))?;
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&NodeRecord> {
        self.state.nodes.get(name)
    }

    pub fn upsert(&mut self, record: NodeRecord) {
        self.state.nodes.insert(record.name.clone(), record);
        self.state.last_updated = Utc::now();
    }

    /// Create a fresh record for a node seen for the first time.
    pub fn add_new(&mut self, name: &str) -> NodeRecord {
        let record = NodeRecord::new(name);
        self.state.nodes.insert(name.to_string(), record.clone());
        self.state.last_updated = Utc::now();
        record
    }

    /// Update status and bump `last_seen`. No-op for unknown names.
    pub fn set_status(&mut self, name: &str, status: NodeStatus) {
        if let Some(node) = self.state.nodes.get_mut(name) {
            node.status = status;
            node.last_seen = Utc::now();
            self.state.last_updated = node.last_seen;
        }
    }

    pub fn set_kind(&mut self, name: &str, kind: NodeKind) {
        if let Some(node) = self.state.nodes.get_mut(name) {
            node.kind = kind;
            self.state.last_updated = Utc::now();
        }
    }

    pub fn set_lifecycle_state(&mut self, name: &str, state: LifecycleState) {
        if let Some(node) = self.state.nodes.get_mut(name) {
            node.lifecycle_state = Some(state);
            self.state.last_updated = Utc::now();
        }
    }

    pub fn all_nodes(&self) -> &std::collections::BTreeMap<String, NodeRecord> {
        &self.state.nodes
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        let total = self.state.nodes.len();
        let active = self
            .state
            .nodes
            .values()
            .filter(|n| n.status == NodeStatus::Active)
            .count();
        (total, active, total - active)
    }

    /// Sorted roster view of the current snapshot.
    pub fn summary(&self) -> RosterSummary {
        let (total, active, inactive) = self.counts();

        // BTreeMap iteration is already name-ordered.
        let nodes = self
            .state
            .nodes
            .values()
            .map(|n| NodeSummary {
                name: n.name.clone(),
                kind: n.kind,
                status: n.status,
                lifecycle_state: n.lifecycle_state,
            })
            .collect();

        RosterSummary {
            total,
            active,
            inactive,
            nodes,
        }
    }
}
