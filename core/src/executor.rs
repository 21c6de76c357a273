// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-node executor: observes cluster-state events for benchmarks
//! assigned to the local node and drives the local phase machine.
//!
//! Every action is idempotent against re-delivered events: a state the
//! node is already in is a no-op. All transitions to a new local state are
//! written back through the store; the node never deletes entries.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::model::{BenchmarkDefinition, BenchmarkId, BenchmarkMetaData, BenchmarkState, NodeId, NodeState};
use crate::results::{CompetitionNodeResult, NodeResultSet};
use crate::search::{CompetitionExecutor, RunControl, SearchEngine};
use crate::store::{update_with_retry, ClusterStateStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::transport::{NodeService, Transport, TransportError};

/// Per-benchmark state held by one executor node
struct LocalBenchmark {
    definition: BenchmarkDefinition,
    control: RunControl,
    state: Mutex<NodeState>,
    results: Mutex<Vec<CompetitionNodeResult>>,
    errors: Mutex<Vec<String>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Executor service of one node (C4).
///
/// Owns the node's per-benchmark map for the lifetime of the service;
/// [`ExecutorService::stop`] clears it.
pub struct ExecutorService {
    node_id: NodeId,
    store: Arc<dyn ClusterStateStore>,
    transport: Arc<dyn Transport>,
    runner: CompetitionExecutor,
    local: DashMap<BenchmarkId, Arc<LocalBenchmark>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl ExecutorService {
    /// Create the executor service for the transport's local node
    pub fn new(
        store: Arc<dyn ClusterStateStore>,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn SearchEngine>,
    ) -> Arc<Self> {
        Arc::new(Self {
            node_id: transport.local_node(),
            store,
            transport,
            runner: CompetitionExecutor::new(engine),
            local: DashMap::new(),
            event_task: Mutex::new(None),
        })
    }

    /// Register the node RPC handlers and start observing cluster state
    pub fn start(self: Arc<Self>) {
        self.transport
            .register_node_service(Arc::clone(&self) as Arc<dyn NodeService>);

        let service = Arc::clone(&self);
        let mut events = self.store.subscribe();
        let handle = tokio::spawn(async move {
            let snapshot = service.store.read().await;
            service.apply(&snapshot.metadata).await;
            while let Some(event) = events.recv().await {
                service.apply(&event.current).await;
            }
        });
        *self.event_task.lock() = Some(handle);
        info!(node = %self.node_id, "executor service started");
    }

    /// Stop observing, drop workers and clear per-benchmark state
    pub fn stop(&self) {
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        for entry in self.local.iter() {
            entry.value().control.request_abort();
            if let Some(worker) = entry.value().worker.lock().take() {
                worker.abort();
            }
        }
        self.local.clear();
        info!(node = %self.node_id, "executor service stopped");
    }

    fn get(&self, benchmark_id: &str) -> Option<Arc<LocalBenchmark>> {
        self.local.get(benchmark_id).map(|e| Arc::clone(e.value()))
    }

    async fn apply(&self, current: &BenchmarkMetaData) {
        // entries deleted by the coordinator take their local state with them
        let gone: Vec<BenchmarkId> = self
            .local
            .iter()
            .filter(|e| !current.entries.contains_key(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for benchmark_id in gone {
            if let Some((_, local)) = self.local.remove(&benchmark_id) {
                local.control.request_abort();
                if let Some(worker) = local.worker.lock().take() {
                    worker.abort();
                }
                debug!(node = %self.node_id, benchmark_id = %benchmark_id, "dropped local state for deleted entry");
            }
        }

        for entry_ref in current.entries.values() {
            if let Some(node_state) = entry_ref.node_state(&self.node_id) {
                self.observe(entry_ref.benchmark_id.clone(), entry_ref.state, node_state)
                    .await;
            }
        }
    }

    async fn observe(
        &self,
        benchmark_id: BenchmarkId,
        global: BenchmarkState,
        node_state: NodeState,
    ) {
        match global {
            BenchmarkState::Initializing => {
                // a node that already reported FAILED stays failed
                if node_state == NodeState::Initializing && self.get(&benchmark_id).is_none() {
                    self.initialize(benchmark_id).await;
                }
            }
            BenchmarkState::Running => {
                if let Some(local) = self.get(&benchmark_id) {
                    let spawn = {
                        let mut state = local.state.lock();
                        match *state {
                            NodeState::Ready => {
                                *state = NodeState::Running;
                                true
                            }
                            NodeState::Paused => {
                                // the resume cycle ends with a plain RUNNING write
                                *state = NodeState::Running;
                                local.control.resume();
                                false
                            }
                            _ => false,
                        }
                    };
                    if spawn {
                        self.spawn_worker(benchmark_id, local);
                    }
                }
            }
            BenchmarkState::Paused => {
                if let Some(local) = self.get(&benchmark_id) {
                    let mut state = local.state.lock();
                    if matches!(*state, NodeState::Running | NodeState::Ready) {
                        *state = NodeState::Paused;
                        local.control.pause();
                        debug!(node = %self.node_id, benchmark_id = %benchmark_id, "worker paused");
                    }
                }
            }
            BenchmarkState::Resuming => {
                if let Some(local) = self.get(&benchmark_id) {
                    let resumed = {
                        let mut state = local.state.lock();
                        if *state == NodeState::Paused {
                            *state = NodeState::Running;
                            true
                        } else {
                            false
                        }
                    };
                    if resumed {
                        local.control.resume();
                        self.write_node_state(&benchmark_id, NodeState::Running).await;
                    }
                }
            }
            BenchmarkState::Aborted => {
                if let Some(local) = self.get(&benchmark_id) {
                    let write_direct = {
                        let mut state = local.state.lock();
                        if state.is_terminal() {
                            false
                        } else {
                            local.control.request_abort();
                            if local.worker.lock().is_some() {
                                // the worker writes ABORTED from its checkpoint
                                false
                            } else {
                                *state = NodeState::Aborted;
                                true
                            }
                        }
                    };
                    if write_direct {
                        self.write_node_state(&benchmark_id, NodeState::Aborted).await;
                    }
                }
            }
            BenchmarkState::Completed | BenchmarkState::Failed => {
                // terminal; local state stays cached for result fetches
                // until the coordinator deletes the entry
            }
        }
    }

    async fn initialize(&self, benchmark_id: BenchmarkId) {
        let definition = match self.transport.fetch_definition(&benchmark_id).await {
            Ok(definition) => Ok(definition),
            Err(TransportError::UnknownBenchmark(_)) => {
                // the coordinator lost this benchmark; fail immediately
                Err(TransportError::UnknownBenchmark(benchmark_id.clone()))
            }
            Err(first) => {
                warn!(node = %self.node_id, benchmark_id = %benchmark_id, error = %first, "definition fetch failed, retrying once");
                self.transport.fetch_definition(&benchmark_id).await
            }
        };

        match definition {
            Ok(definition) => {
                self.local.insert(
                    benchmark_id.clone(),
                    Arc::new(LocalBenchmark {
                        definition,
                        control: RunControl::new(),
                        state: Mutex::new(NodeState::Ready),
                        results: Mutex::new(Vec::new()),
                        errors: Mutex::new(Vec::new()),
                        worker: Mutex::new(None),
                    }),
                );
                self.write_node_state(&benchmark_id, NodeState::Ready).await;
                debug!(node = %self.node_id, benchmark_id = %benchmark_id, "ready");
            }
            Err(error) => {
                warn!(node = %self.node_id, benchmark_id = %benchmark_id, %error, "failed to fetch definition");
                self.write_node_state(&benchmark_id, NodeState::Failed).await;
            }
        }
    }

    fn spawn_worker(&self, benchmark_id: BenchmarkId, local: Arc<LocalBenchmark>) {
        let store = Arc::clone(&self.store);
        let runner = self.runner.clone();
        let node_id = self.node_id.clone();
        let worker_local = Arc::clone(&local);
        let handle = tokio::spawn(async move {
            let mut fatal: Option<String> = None;
            for competition in &worker_local.definition.competitions {
                if worker_local.control.is_aborted() {
                    break;
                }
                let settings = worker_local.definition.effective_settings(competition);
                match runner
                    .run(&node_id, competition, &settings, &worker_local.control)
                    .await
                {
                    Ok(result) => {
                        worker_local.results.lock().push(result);
                    }
                    Err(failure) => {
                        fatal = Some(failure.to_string());
                        break;
                    }
                }
            }

            let final_state = if let Some(message) = fatal {
                worker_local.errors.lock().push(message);
                NodeState::Failed
            } else if worker_local.control.is_aborted() {
                NodeState::Aborted
            } else {
                NodeState::Completed
            };
            *worker_local.state.lock() = final_state;
            persist_node_state(store.as_ref(), &node_id, &benchmark_id, final_state).await;
            info!(node = %node_id, benchmark_id = %benchmark_id, state = %final_state, "worker finished");
        });
        *local.worker.lock() = Some(handle);
    }

    async fn write_node_state(&self, benchmark_id: &str, state: NodeState) {
        persist_node_state(self.store.as_ref(), &self.node_id, benchmark_id, state).await;
    }
}

/// Write one node's state into the entry, no-op when unchanged or the
/// entry is already gone
async fn persist_node_state(
    store: &dyn ClusterStateStore,
    node_id: &NodeId,
    benchmark_id: &str,
    state: NodeState,
) {
    let node = node_id.clone();
    let id = benchmark_id.to_string();
    let result = update_with_retry(store, DEFAULT_UPDATE_ATTEMPTS, move |meta| {
        match meta.entry_mut(&id) {
            Some(entry) => {
                if entry.node_state(&node) == Some(state) {
                    return Err(StoreError::Rejected("unchanged".to_string()));
                }
                entry.set_node_state(&node, state);
                Ok(())
            }
            None => Err(StoreError::Rejected("entry deleted".to_string())),
        }
    })
    .await;

    match result {
        Ok(_) | Err(StoreError::Rejected(_)) => {}
        Err(error) => {
            warn!(node = %node_id, benchmark_id = %benchmark_id, %error, "failed to write node state");
        }
    }
}

#[async_trait]
impl NodeService for ExecutorService {
    async fn node_results(&self, benchmark_id: &str) -> Result<NodeResultSet, TransportError> {
        let local = self
            .get(benchmark_id)
            .ok_or_else(|| TransportError::UnknownBenchmark(benchmark_id.to_string()))?;
        let node_state = *local.state.lock();
        let competition_results = local.results.lock().clone();
        let errors = local.errors.lock().clone();
        Ok(NodeResultSet {
            benchmark_id: benchmark_id.to_string(),
            node_id: self.node_id.clone(),
            node_state,
            competition_results,
            errors,
        })
    }

    async fn abort(&self, benchmark_id: &str) -> Result<(), TransportError> {
        if let Some(local) = self.get(benchmark_id) {
            local.control.request_abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BenchmarkSettings, Competition, Entry, SearchRequest};
    use crate::search::SimulatedSearchEngine;
    use crate::store::InMemoryStateStore;
    use crate::transport::{LocalHub, MasterService};
    use std::time::Duration;

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

    fn definition(id: &str) -> BenchmarkDefinition {
        BenchmarkDefinition {
            benchmark_id: id.to_string(),
            competitions: vec![Competition::new(
                "c1",
                vec![SearchRequest::new(serde_json::json!({"query": "*"}))],
            )],
            num_executor_nodes: 1,
            settings: BenchmarkSettings {
                iterations: 2,
                concurrency: 1,
                multiplier: 1,
                warmup: false,
                allow_cache_clearing: false,
            },
        }
    }

    async fn wait_for<F>(store: &InMemoryStateStore, mut predicate: F)
    where
        F: FnMut(&BenchmarkMetaData) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = store.read().await;
            if predicate(&snapshot.metadata) {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached before deadline"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    struct Harness {
        store: Arc<InMemoryStateStore>,
        executor: Arc<ExecutorService>,
        master: Arc<crate::transport::LocalTransport>,
    }

    async fn harness(def: BenchmarkDefinition) -> Harness {
        harness_with(def, Duration::ZERO).await
    }

    async fn harness_with(def: BenchmarkDefinition, latency: Duration) -> Harness {
        let store = Arc::new(InMemoryStateStore::new());
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        let node = hub.join("node-0", true);
        hub.set_master(&"master".to_string());
        master.register_master_service(Arc::new(StaticMaster(def)));

        let executor = ExecutorService::new(
            store.clone() as Arc<dyn ClusterStateStore>,
            node as Arc<dyn Transport>,
            Arc::new(SimulatedSearchEngine::new(latency)),
        );
        Arc::clone(&executor).start();
        Harness {
            store,
            executor,
            master,
        }
    }

    async fn insert_entry(store: &InMemoryStateStore, id: &str) {
        let id = id.to_string();
        store
            .update(Box::new(move |meta| {
                meta.entries
                    .insert(id.clone(), Entry::new(id.clone(), vec!["node-0".to_string()]));
                Ok(())
            }))
            .await
            .unwrap();
    }

    async fn set_running(store: &InMemoryStateStore, id: &str) {
        let id = id.to_string();
        store
            .update(Box::new(move |meta| {
                if let Some(entry) = meta.entry_mut(&id) {
                    entry.state = BenchmarkState::Running;
                    entry.set_node_state(&"node-0".to_string(), NodeState::Running);
                }
                Ok(())
            }))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_initializing_entry_becomes_ready() {
        let h = harness(definition("b1")).await;
        insert_entry(&h.store, "b1").await;

        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Ready)
        })
        .await;
        h.executor.stop();
    }

    #[tokio::test]
    async fn test_unknown_definition_fails_node() {
        let h = harness(definition("other")).await;
        insert_entry(&h.store, "b1").await;

        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Failed)
        })
        .await;
        h.executor.stop();
    }

    #[tokio::test]
    async fn test_worker_runs_to_completion_and_serves_results() {
        let h = harness(definition("b1")).await;
        insert_entry(&h.store, "b1").await;
        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Ready)
        })
        .await;

        set_running(&h.store, "b1").await;
        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Completed)
        })
        .await;

        let results = h
            .master
            .fetch_results("b1", &"node-0".to_string())
            .await
            .unwrap();
        assert_eq!(results.node_state, NodeState::Completed);
        assert_eq!(results.competition_results.len(), 1);
        assert_eq!(results.competition_results[0].iterations.len(), 2);
        h.executor.stop();
    }

    #[tokio::test]
    async fn test_abort_nudge_drops_worker() {
        let mut def = definition("b1");
        def.settings.iterations = 1_000;
        let h = harness_with(def, Duration::from_millis(2)).await;
        insert_entry(&h.store, "b1").await;
        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Ready)
        })
        .await;
        set_running(&h.store, "b1").await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        h.master
            .abort_local("b1", &"node-0".to_string())
            .await
            .unwrap();

        wait_for(&h.store, |meta| {
            meta.entry("b1")
                .and_then(|e| e.node_state(&"node-0".to_string()))
                == Some(NodeState::Aborted)
        })
        .await;
        h.executor.stop();
    }
}
