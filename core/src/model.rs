// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Benchmark definitions and the replicated cluster-state document.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{BenchError, BenchResult};

/// Benchmark identifier
pub type BenchmarkId = String;

/// Node identifier
pub type NodeId = String;

/// Global lifecycle state of a benchmark.
///
/// Allowed transitions: `INITIALIZING -> {RUNNING | FAILED}`,
/// `RUNNING <-> {PAUSED / RESUMING}`, `{RUNNING, PAUSED} ->
/// {COMPLETED, FAILED, ABORTED}`. Terminal states are final until the
/// entry is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BenchmarkState {
    /// Entry created, executors fetching definitions
    Initializing,
    /// All executors were ready; competitions are running
    Running,
    /// Paused by a client; workers block before their next iteration
    Paused,
    /// Resume requested; waiting for executors to echo RUNNING
    Resuming,
    /// All executors finished and results were collected
    Completed,
    /// The benchmark failed as a whole
    Failed,
    /// Aborted by a client; partial results were collected
    Aborted,
}

impl BenchmarkState {
    /// Whether this state admits no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for BenchmarkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Resuming => write!(f, "RESUMING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Per-node lifecycle state within one benchmark entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    /// Assigned; the node has not yet fetched the definition
    Initializing,
    /// Definition fetched, worker not yet started
    Ready,
    /// Worker executing competitions
    Running,
    /// Worker blocked on the pause gate
    Paused,
    /// Worker finished; results cached locally
    Completed,
    /// The node failed this benchmark
    Failed,
    /// Worker dropped at an abort checkpoint
    Aborted,
}

impl NodeState {
    /// Whether this node has finished participating
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "INITIALIZING"),
            Self::Ready => write!(f, "READY"),
            Self::Running => write!(f, "RUNNING"),
            Self::Paused => write!(f, "PAUSED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// One search request executed by competitions.
///
/// The body is opaque to the orchestration layer; only the search engine
/// interprets it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    /// Target index, when the engine distinguishes indices
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<String>,
    /// Engine-specific request body
    pub body: serde_json::Value,
}

impl SearchRequest {
    /// Create a request against the default index
    pub fn new(body: serde_json::Value) -> Self {
        Self { index: None, body }
    }
}

/// Benchmark-level execution settings with the recognized options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchmarkSettings {
    /// Iterations per competition per node
    pub iterations: u32,
    /// Parallel requests per iteration on a node
    pub concurrency: u32,
    /// Repetitions of the query set per iteration
    pub multiplier: u32,
    /// Perform an untimed warm-up iteration before measuring
    pub warmup: bool,
    /// The node may clear caches between iterations
    pub allow_cache_clearing: bool,
}

impl Default for BenchmarkSettings {
    fn default() -> Self {
        Self {
            iterations: 5,
            concurrency: 1,
            multiplier: 1,
            warmup: true,
            allow_cache_clearing: false,
        }
    }
}

impl BenchmarkSettings {
    /// Apply a per-competition overlay on top of these settings
    pub fn overlaid(&self, overlay: &SettingsOverlay) -> Self {
        Self {
            iterations: overlay.iterations.unwrap_or(self.iterations),
            concurrency: overlay.concurrency.unwrap_or(self.concurrency),
            multiplier: overlay.multiplier.unwrap_or(self.multiplier),
            warmup: overlay.warmup.unwrap_or(self.warmup),
            allow_cache_clearing: overlay
                .allow_cache_clearing
                .unwrap_or(self.allow_cache_clearing),
        }
    }
}

/// Optional per-competition overrides of [`BenchmarkSettings`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsOverlay {
    /// Overrides `iterations` when set
    pub iterations: Option<u32>,
    /// Overrides `concurrency` when set
    pub concurrency: Option<u32>,
    /// Overrides `multiplier` when set
    pub multiplier: Option<u32>,
    /// Overrides `warmup` when set
    pub warmup: Option<bool>,
    /// Overrides `allow_cache_clearing` when set
    pub allow_cache_clearing: Option<bool>,
}

fn default_percentiles() -> Vec<f64> {
    vec![10.0, 25.0, 50.0, 75.0, 90.0, 99.0]
}

/// A named group of search requests with its own execution settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    /// Competition name, unique within the benchmark
    pub name: String,
    /// Non-empty set of search requests
    pub requests: Vec<SearchRequest>,
    /// Overrides of the benchmark-level settings
    #[serde(default)]
    pub settings: SettingsOverlay,
    /// Percentile keys for the summary roll-up
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<f64>,
}

impl Competition {
    /// Create a competition with default settings and percentiles
    pub fn new(name: impl Into<String>, requests: Vec<SearchRequest>) -> Self {
        Self {
            name: name.into(),
            requests,
            settings: SettingsOverlay::default(),
            percentiles: default_percentiles(),
        }
    }
}

/// A client-submitted benchmark, immutable from creation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkDefinition {
    /// Cluster-unique benchmark id
    pub benchmark_id: BenchmarkId,
    /// Ordered competitions to execute
    pub competitions: Vec<Competition>,
    /// Number of executor nodes to run on
    pub num_executor_nodes: usize,
    /// Benchmark-level execution settings
    #[serde(default)]
    pub settings: BenchmarkSettings,
}

impl BenchmarkDefinition {
    /// Effective settings for one competition (benchmark settings with the
    /// competition overlay applied)
    pub fn effective_settings(&self, competition: &Competition) -> BenchmarkSettings {
        self.settings.overlaid(&competition.settings)
    }

    /// Validate the definition before any cluster-state write
    pub fn validate(&self) -> BenchResult<()> {
        if self.num_executor_nodes < 1 {
            return Err(BenchError::InvalidDefinition(
                "num_executor_nodes must be at least 1".to_string(),
            ));
        }
        if self.competitions.is_empty() {
            return Err(BenchError::InvalidDefinition(
                "at least one competition is required".to_string(),
            ));
        }
        for competition in &self.competitions {
            if competition.name.is_empty() {
                return Err(BenchError::InvalidDefinition(
                    "competition name must not be empty".to_string(),
                ));
            }
            if competition.requests.is_empty() {
                return Err(BenchError::InvalidDefinition(format!(
                    "competition '{}' has no search requests",
                    competition.name
                )));
            }
            let effective = self.effective_settings(competition);
            if effective.iterations < 1 || effective.concurrency < 1 || effective.multiplier < 1 {
                return Err(BenchError::InvalidDefinition(format!(
                    "competition '{}': iterations, concurrency and multiplier must be at least 1",
                    competition.name
                )));
            }
            for pct in &competition.percentiles {
                if !(*pct > 0.0 && *pct <= 100.0) {
                    return Err(BenchError::InvalidDefinition(format!(
                        "competition '{}': percentile {} outside (0, 100]",
                        competition.name, pct
                    )));
                }
            }
        }
        Ok(())
    }
}

/// One record in the replicated [`BenchmarkMetaData`] document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Benchmark id this entry belongs to
    pub benchmark_id: BenchmarkId,
    /// Global benchmark state
    pub state: BenchmarkState,
    /// Per-node state of every assigned node
    pub node_state_map: BTreeMap<NodeId, NodeState>,
    /// The initial node assignment, in selection order
    pub concrete_nodes: Vec<NodeId>,
}

impl Entry {
    /// Create a fresh entry with all assigned nodes INITIALIZING
    pub fn new(benchmark_id: BenchmarkId, nodes: Vec<NodeId>) -> Self {
        let node_state_map = nodes
            .iter()
            .map(|n| (n.clone(), NodeState::Initializing))
            .collect();
        Self {
            benchmark_id,
            state: BenchmarkState::Initializing,
            node_state_map,
            concrete_nodes: nodes,
        }
    }

    /// State of one assigned node, if it is part of this entry
    pub fn node_state(&self, node: &NodeId) -> Option<NodeState> {
        self.node_state_map.get(node).copied()
    }

    /// Set the state of one assigned node. Unassigned nodes are ignored:
    /// the node-state map never grows beyond the initial assignment.
    pub fn set_node_state(&mut self, node: &NodeId, state: NodeState) {
        if let Some(slot) = self.node_state_map.get_mut(node) {
            *slot = state;
        }
    }
}

/// The replicated benchmark document, the single field of cluster state
/// this engine owns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkMetaData {
    /// Entries keyed by benchmark id
    pub entries: BTreeMap<BenchmarkId, Entry>,
}

impl BenchmarkMetaData {
    /// Look up one entry
    pub fn entry(&self, benchmark_id: &str) -> Option<&Entry> {
        self.entries.get(benchmark_id)
    }

    /// Look up one entry mutably
    pub fn entry_mut(&mut self, benchmark_id: &str) -> Option<&mut Entry> {
        self.entries.get_mut(benchmark_id)
    }
}
