// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Point-to-point transport contract between coordinator and executors.
//!
//! The orchestration engine talks to the cluster through this trait only:
//! node identity, mastership, membership change notifications, and the
//! three typed request channels. Action names are contractual.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::{BenchmarkDefinition, NodeId};
use crate::results::NodeResultSet;

/// Executor -> master: request the benchmark definition
pub const ACTION_DEFINITION: &str = "bench/node/definition";

/// Master -> executor: request per-node partial results
pub const ACTION_STATUS: &str = "bench/node/status";

/// Master -> executor: best-effort abort nudge
pub const ACTION_ABORT: &str = "bench/node/abort";

/// Transport-level errors
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The target node is not reachable
    #[error("node unavailable: {0}")]
    NodeUnavailable(NodeId),

    /// No master is currently elected
    #[error("no elected master")]
    NoMaster,

    /// The master has no record of the benchmark
    #[error("unknown benchmark: {0}")]
    UnknownBenchmark(String),

    /// The request was canceled at the caller; committed side effects stand
    #[error("request canceled: {0}")]
    Canceled(String),

    /// Any other request failure
    #[error("transport failure: {0}")]
    Failure(String),
}

/// Cluster membership changes, delivered to subscribers on every node
#[derive(Debug, Clone)]
pub enum MembershipEvent {
    /// A node left the cluster
    NodeRemoved(NodeId),
    /// Mastership of the local node changed
    MasterChanged {
        /// Whether the local node is now the master
        master: bool,
    },
}

/// Handler for [`ACTION_DEFINITION`], registered by the coordinator
#[async_trait]
pub trait MasterService: Send + Sync {
    /// Return the definition of a benchmark this master is coordinating
    async fn definition(
        &self,
        benchmark_id: &str,
        node_id: &NodeId,
    ) -> Result<BenchmarkDefinition, TransportError>;
}

/// Handler for [`ACTION_STATUS`] and [`ACTION_ABORT`], registered by the
/// executor service of each node
#[async_trait]
pub trait NodeService: Send + Sync {
    /// Return this node's cached results for a benchmark
    async fn node_results(&self, benchmark_id: &str) -> Result<NodeResultSet, TransportError>;

    /// Best-effort local abort; the state store remains the truth
    async fn abort(&self, benchmark_id: &str) -> Result<(), TransportError>;
}

/// The transport seen by one node
#[async_trait]
pub trait Transport: Send + Sync {
    /// Id of the local node
    fn local_node(&self) -> NodeId;

    /// Whether the local node is the elected master
    fn is_master(&self) -> bool;

    /// Nodes currently alive in the cluster
    fn alive_nodes(&self) -> BTreeSet<NodeId>;

    /// Alive nodes carrying the benchmark-execution capability
    fn executor_nodes(&self) -> BTreeSet<NodeId>;

    /// Subscribe to membership changes
    fn subscribe_membership(&self) -> mpsc::UnboundedReceiver<MembershipEvent>;

    /// Register the local coordinator as the [`ACTION_DEFINITION`] handler
    fn register_master_service(&self, service: Arc<dyn MasterService>);

    /// Register the local executor as the [`ACTION_STATUS`] /
    /// [`ACTION_ABORT`] handler
    fn register_node_service(&self, service: Arc<dyn NodeService>);

    /// [`ACTION_DEFINITION`]: fetch a definition from the current master
    async fn fetch_definition(
        &self,
        benchmark_id: &str,
    ) -> Result<BenchmarkDefinition, TransportError>;

    /// [`ACTION_STATUS`]: fetch per-node results from an executor
    async fn fetch_results(
        &self,
        benchmark_id: &str,
        node: &NodeId,
    ) -> Result<NodeResultSet, TransportError>;

    /// [`ACTION_ABORT`]: nudge an executor to abort locally
    async fn abort_local(&self, benchmark_id: &str, node: &NodeId)
        -> Result<(), TransportError>;
}

struct Endpoint {
    executor_capable: bool,
    master_service: RwLock<Option<Arc<dyn MasterService>>>,
    node_service: RwLock<Option<Arc<dyn NodeService>>>,
}

struct HubInner {
    endpoints: DashMap<NodeId, Arc<Endpoint>>,
    master: RwLock<Option<NodeId>>,
    subscribers: Mutex<Vec<(NodeId, mpsc::UnboundedSender<MembershipEvent>)>>,
}

/// In-process cluster fabric connecting [`LocalTransport`] instances.
///
/// One hub models one cluster: nodes join with a capability flag, one node
/// is elected master, and removals fan out membership events. The handle
/// is cheap to clone; used by the local cluster harness and the tests.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: DashMap::new(),
                master: RwLock::new(None),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Join a node to the cluster and return its transport
    pub fn join(&self, node_id: impl Into<NodeId>, executor_capable: bool) -> Arc<LocalTransport> {
        let node_id = node_id.into();
        self.inner.endpoints.insert(
            node_id.clone(),
            Arc::new(Endpoint {
                executor_capable,
                master_service: RwLock::new(None),
                node_service: RwLock::new(None),
            }),
        );
        Arc::new(LocalTransport {
            node_id,
            hub: self.clone(),
        })
    }

    /// Elect `node` as the master
    pub fn set_master(&self, node: &NodeId) {
        let previous = {
            let mut master = self.inner.master.write();
            let previous = master.take();
            *master = Some(node.clone());
            previous
        };
        if previous.as_ref() == Some(node) {
            return;
        }
        if let Some(old) = previous {
            self.notify_node(&old, MembershipEvent::MasterChanged { master: false });
        }
        self.notify_node(node, MembershipEvent::MasterChanged { master: true });
    }

    /// Demote the current master without electing a new one
    pub fn clear_master(&self) {
        let previous = self.inner.master.write().take();
        if let Some(old) = previous {
            self.notify_node(&old, MembershipEvent::MasterChanged { master: false });
        }
    }

    /// Remove a node from the cluster; all subscribers observe the removal
    pub fn remove_node(&self, node: &NodeId) {
        if self.inner.endpoints.remove(node).is_none() {
            return;
        }
        let was_master = self.inner.master.read().as_ref() == Some(node);
        if was_master {
            self.inner.master.write().take();
        }
        debug!(node = %node, "node removed from cluster");
        self.notify_all(MembershipEvent::NodeRemoved(node.clone()));
    }

    fn notify_all(&self, event: MembershipEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    fn notify_node(&self, node: &NodeId, event: MembershipEvent) {
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|(subscriber, tx)| {
            if subscriber == node {
                tx.send(event.clone()).is_ok()
            } else {
                true
            }
        });
    }

    fn master_service(&self) -> Result<Arc<dyn MasterService>, TransportError> {
        let master = self
            .inner
            .master
            .read()
            .clone()
            .ok_or(TransportError::NoMaster)?;
        let endpoint = self
            .inner
            .endpoints
            .get(&master)
            .ok_or(TransportError::NoMaster)?;
        let service = endpoint.master_service.read().clone();
        service.ok_or(TransportError::NoMaster)
    }

    fn node_service(&self, node: &NodeId) -> Result<Arc<dyn NodeService>, TransportError> {
        let endpoint = self
            .inner
            .endpoints
            .get(node)
            .ok_or_else(|| TransportError::NodeUnavailable(node.clone()))?;
        let service = endpoint.node_service.read().clone();
        service.ok_or_else(|| TransportError::NodeUnavailable(node.clone()))
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport of one node joined to a [`LocalHub`]
pub struct LocalTransport {
    node_id: NodeId,
    hub: LocalHub,
}

#[async_trait]
impl Transport for LocalTransport {
    fn local_node(&self) -> NodeId {
        self.node_id.clone()
    }

    fn is_master(&self) -> bool {
        self.hub.inner.master.read().as_ref() == Some(&self.node_id)
    }

    fn alive_nodes(&self) -> BTreeSet<NodeId> {
        self.hub
            .inner
            .endpoints
            .iter()
            .map(|e| e.key().clone())
            .collect()
    }

    fn executor_nodes(&self) -> BTreeSet<NodeId> {
        self.hub
            .inner
            .endpoints
            .iter()
            .filter(|e| e.value().executor_capable)
            .map(|e| e.key().clone())
            .collect()
    }

    fn subscribe_membership(&self) -> mpsc::UnboundedReceiver<MembershipEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.hub
            .inner
            .subscribers
            .lock()
            .push((self.node_id.clone(), tx));
        rx
    }

    fn register_master_service(&self, service: Arc<dyn MasterService>) {
        if let Some(endpoint) = self.hub.inner.endpoints.get(&self.node_id) {
            *endpoint.master_service.write() = Some(service);
        }
    }

    fn register_node_service(&self, service: Arc<dyn NodeService>) {
        if let Some(endpoint) = self.hub.inner.endpoints.get(&self.node_id) {
            *endpoint.node_service.write() = Some(service);
        }
    }

    async fn fetch_definition(
        &self,
        benchmark_id: &str,
    ) -> Result<BenchmarkDefinition, TransportError> {
        let service = self.hub.master_service()?;
        service.definition(benchmark_id, &self.node_id).await
    }

    async fn fetch_results(
        &self,
        benchmark_id: &str,
        node: &NodeId,
    ) -> Result<NodeResultSet, TransportError> {
        let service = self.hub.node_service(node)?;
        service.node_results(benchmark_id).await
    }

    async fn abort_local(
        &self,
        benchmark_id: &str,
        node: &NodeId,
    ) -> Result<(), TransportError> {
        let service = self.hub.node_service(node)?;
        service.abort(benchmark_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BenchmarkSettings, Competition, SearchRequest};

    struct StaticMaster(BenchmarkDefinition);

    #[async_trait]
    impl MasterService for StaticMaster {
        async fn definition(
            &self,
            benchmark_id: &str,
            _node_id: &NodeId,
        ) -> Result<BenchmarkDefinition, TransportError> {
            if benchmark_id == self.0.benchmark_id {
                Ok(self.0.clone())
            } else {
                Err(TransportError::UnknownBenchmark(benchmark_id.to_string()))
            }
        }
    }

    fn definition() -> BenchmarkDefinition {
        BenchmarkDefinition {
            benchmark_id: "b1".to_string(),
            competitions: vec![Competition::new(
                "c1",
                vec![SearchRequest::new(serde_json::json!({"query": "*"}))],
            )],
            num_executor_nodes: 1,
            settings: BenchmarkSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_membership_and_capability() {
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        let _node = hub.join("node-0", true);
        hub.set_master(&"master".to_string());

        assert!(master.is_master());
        assert_eq!(master.alive_nodes().len(), 2);
        let executors = master.executor_nodes();
        assert_eq!(executors.len(), 1);
        assert!(executors.contains("node-0"));
    }

    #[tokio::test]
    async fn test_definition_rpc_routes_to_master() {
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        let node = hub.join("node-0", true);
        hub.set_master(&"master".to_string());

        master.register_master_service(Arc::new(StaticMaster(definition())));

        let fetched = node.fetch_definition("b1").await.unwrap();
        assert_eq!(fetched.benchmark_id, "b1");

        let err = node.fetch_definition("missing").await.unwrap_err();
        assert!(matches!(err, TransportError::UnknownBenchmark(_)));
    }

    #[tokio::test]
    async fn test_no_master() {
        let hub = LocalHub::new();
        let node = hub.join("node-0", true);
        let err = node.fetch_definition("b1").await.unwrap_err();
        assert!(matches!(err, TransportError::NoMaster));
    }

    #[tokio::test]
    async fn test_removal_fanout() {
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        let _node = hub.join("node-0", true);
        let mut events = master.subscribe_membership();

        hub.remove_node(&"node-0".to_string());

        match events.recv().await.unwrap() {
            MembershipEvent::NodeRemoved(node) => assert_eq!(node, "node-0"),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(master.alive_nodes().iter().all(|n| n != "node-0"));
    }

    #[tokio::test]
    async fn test_master_change_fanout() {
        let hub = LocalHub::new();
        let a = hub.join("a", false);
        let b = hub.join("b", false);
        hub.set_master(&"a".to_string());

        let mut a_events = a.subscribe_membership();
        let mut b_events = b.subscribe_membership();

        hub.set_master(&"b".to_string());

        match a_events.recv().await.unwrap() {
            MembershipEvent::MasterChanged { master } => assert!(!master),
            other => panic!("unexpected event: {other:?}"),
        }
        match b_events.recv().await.unwrap() {
            MembershipEvent::MasterChanged { master } => assert!(master),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(b.is_master());
        assert!(!a.is_master());
    }

    #[tokio::test]
    async fn test_rpc_to_removed_node_fails() {
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        let _node = hub.join("node-0", true);
        hub.set_master(&"master".to_string());
        hub.remove_node(&"node-0".to_string());

        let err = master
            .fetch_results("b1", &"node-0".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NodeUnavailable(_)));
    }
}
