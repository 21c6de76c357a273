// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! In-process cluster: a coordinator and N executor services wired over
//! the in-memory store and transport hub.
//!
//! Backs the end-to-end test suite and the CLI. The engine code running
//! here is exactly the code a networked deployment would run; only the
//! store and transport adapters differ.

use std::sync::Arc;

use crate::coordinator::CoordinatorService;
use crate::executor::ExecutorService;
use crate::model::NodeId;
use crate::search::{SearchEngine, SimulatedSearchEngine};
use crate::store::InMemoryStateStore;
use crate::transport::LocalHub;

/// Node id of the coordinator-only master
pub const MASTER_NODE: &str = "master";

/// One-process cluster with a master and N benchmark-capable nodes
pub struct LocalCluster {
    store: Arc<InMemoryStateStore>,
    hub: LocalHub,
    coordinator: Arc<CoordinatorService>,
    executors: Vec<(NodeId, Arc<ExecutorService>)>,
}

impl LocalCluster {
    /// Start a cluster with the simulated search engine
    pub async fn start(executor_nodes: usize) -> Self {
        Self::start_with_engine(executor_nodes, Arc::new(SimulatedSearchEngine::default())).await
    }

    /// Start a cluster over a caller-provided engine
    pub async fn start_with_engine(
        executor_nodes: usize,
        engine: Arc<dyn SearchEngine>,
    ) -> Self {
        let store = Arc::new(InMemoryStateStore::new());
        let hub = LocalHub::new();

        let master_transport = hub.join(MASTER_NODE, false);
        hub.set_master(&MASTER_NODE.to_string());
        let coordinator = CoordinatorService::new(store.clone(), master_transport);
        Arc::clone(&coordinator).start();

        let mut executors = Vec::with_capacity(executor_nodes);
        for i in 0..executor_nodes {
            let node_id = format!("node-{i}");
            let transport = hub.join(node_id.clone(), true);
            let executor =
                ExecutorService::new(store.clone(), transport, Arc::clone(&engine));
            Arc::clone(&executor).start();
            executors.push((node_id, executor));
        }

        Self {
            store,
            hub,
            coordinator,
            executors,
        }
    }

    /// The coordinator running on the master
    pub fn coordinator(&self) -> &Arc<CoordinatorService> {
        &self.coordinator
    }

    /// The backing in-memory store
    pub fn store(&self) -> &Arc<InMemoryStateStore> {
        &self.store
    }

    /// Ids of the executor nodes, in join order
    pub fn executor_node_ids(&self) -> Vec<NodeId> {
        self.executors.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Kill one executor node: its service stops writing and the cluster
    /// observes the removal
    pub fn kill_node(&self, node: &NodeId) {
        if let Some((_, executor)) = self.executors.iter().find(|(id, _)| id == node) {
            executor.stop();
        }
        self.hub.remove_node(node);
    }

    /// Demote the master without electing a successor; pending listeners
    /// observe the leadership change
    pub fn demote_master(&self) {
        self.hub.clear_master();
    }

    /// Stop every service
    pub fn shutdown(&self) {
        for (_, executor) in &self.executors {
            executor.stop();
        }
        self.coordinator.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        BenchmarkDefinition, BenchmarkSettings, BenchmarkState, Competition, SearchRequest,
    };

    #[tokio::test]
    async fn test_smoke_single_node_run() {
        let cluster = LocalCluster::start(1).await;
        let definition = BenchmarkDefinition {
            benchmark_id: "smoke".to_string(),
            competitions: vec![Competition::new(
                "c1",
                vec![SearchRequest::new(serde_json::json!({"query": "*"}))],
            )],
            num_executor_nodes: 1,
            settings: BenchmarkSettings {
                iterations: 1,
                concurrency: 1,
                multiplier: 1,
                warmup: false,
                allow_cache_clearing: false,
            },
        };

        let pending = cluster
            .coordinator()
            .start_benchmark(definition)
            .await
            .unwrap();
        let response = pending.wait().await.unwrap();

        assert_eq!(response.state, BenchmarkState::Completed);
        assert_eq!(response.competition_results["c1"].node_results.len(), 1);
        // the entry is deleted once the client has its response
        assert!(cluster.store().read().await.metadata.entries.is_empty());
        cluster.shutdown();
    }
}
