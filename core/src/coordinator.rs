// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Master-side coordinator: accepts client operations, assigns executors,
//! advances the global phase machine and collates final results.
//!
//! All mutations of the in-memory per-benchmark state happen on the
//! cluster-state dispatch task; atomic flags guard each phase handler so
//! it fires at most once per benchmark per entry into the triggering
//! state, however often an event is re-delivered.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregate::Aggregator;
use crate::error::{BenchError, BenchResult};
use crate::liveness::LivenessTracker;
use crate::model::{
    BenchmarkDefinition, BenchmarkId, BenchmarkState, Entry, NodeId, NodeState,
};
use crate::pattern::IdPatterns;
use crate::results::{
    BenchmarkResponse, BenchmarkStatus, CompetitionNodeResult, CompetitionResult,
    ControlResponse, NodeResultSet, StatusResponse,
};
use crate::store::{update_with_retry, ClusterStateStore, StoreError, DEFAULT_UPDATE_ATTEMPTS};
use crate::transport::{MasterService, MembershipEvent, Transport, TransportError};

/// A response the coordinator will deliver later.
///
/// Waiting takes an optional deadline; expiry surfaces
/// [`BenchError::Timeout`] without rolling anything back, and a dropped
/// listener (leadership change) surfaces [`BenchError::MasterLost`].
pub struct PendingResponse<T> {
    operation: String,
    benchmark_id: BenchmarkId,
    receiver: oneshot::Receiver<T>,
}

impl<T> PendingResponse<T> {
    fn new(
        operation: impl Into<String>,
        benchmark_id: BenchmarkId,
        receiver: oneshot::Receiver<T>,
    ) -> Self {
        Self {
            operation: operation.into(),
            benchmark_id,
            receiver,
        }
    }

    /// Benchmark id (or pattern) this response belongs to
    pub fn benchmark_id(&self) -> &str {
        &self.benchmark_id
    }

    /// Wait without a deadline
    pub async fn wait(self) -> BenchResult<T> {
        let benchmark_id = self.benchmark_id;
        self.receiver
            .await
            .map_err(|_| BenchError::MasterLost { benchmark_id })
    }

    /// Wait with an optional deadline
    pub async fn wait_with_deadline(self, deadline: Option<Duration>) -> BenchResult<T> {
        match deadline {
            None => self.wait().await,
            Some(limit) => {
                let operation = self.operation.clone();
                match tokio::time::timeout(limit, self.wait()).await {
                    Ok(result) => result,
                    Err(_) => Err(BenchError::Timeout { operation }),
                }
            }
        }
    }
}

/// Counts down over the benchmarks a pause/resume/abort targeted and
/// signals the client exactly once when the last one reports.
struct ControlWaiter {
    remaining: AtomicUsize,
    benchmark_ids: Mutex<Vec<BenchmarkId>>,
    client: Mutex<Option<oneshot::Sender<ControlResponse>>>,
}

impl ControlWaiter {
    fn new(count: usize, client: oneshot::Sender<ControlResponse>) -> Arc<Self> {
        Arc::new(Self {
            remaining: AtomicUsize::new(count),
            benchmark_ids: Mutex::new(Vec::new()),
            client: Mutex::new(Some(client)),
        })
    }

    fn signal(&self, benchmark_id: &BenchmarkId) {
        self.benchmark_ids.lock().push(benchmark_id.clone());
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Some(client) = self.client.lock().take() {
                let benchmark_ids = std::mem::take(&mut *self.benchmark_ids.lock());
                let _ = client.send(ControlResponse { benchmark_ids });
            }
        }
    }
}

#[derive(Default)]
struct ResponseBuilder {
    errors: Vec<String>,
    competition_results: BTreeMap<String, CompetitionResult>,
    node_states: BTreeMap<NodeId, NodeState>,
}

/// In-memory coordinator state of one active benchmark
struct BenchmarkHandle {
    definition: BenchmarkDefinition,
    running: AtomicBool,
    paused: AtomicBool,
    failed: AtomicBool,
    complete: AtomicBool,
    response: Mutex<ResponseBuilder>,
    client: Mutex<Option<oneshot::Sender<BenchmarkResponse>>>,
    pause_waiter: Mutex<Option<Arc<ControlWaiter>>>,
    resume_waiter: Mutex<Option<Arc<ControlWaiter>>>,
    abort_waiter: Mutex<Option<Arc<ControlWaiter>>>,
}

impl BenchmarkHandle {
    fn new(
        definition: BenchmarkDefinition,
        client: oneshot::Sender<BenchmarkResponse>,
    ) -> Arc<Self> {
        Arc::new(Self {
            definition,
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            complete: AtomicBool::new(false),
            response: Mutex::new(ResponseBuilder::default()),
            client: Mutex::new(Some(client)),
            pause_waiter: Mutex::new(None),
            resume_waiter: Mutex::new(None),
            abort_waiter: Mutex::new(None),
        })
    }
}

/// The coordinator service on the elected master (C5).
///
/// Public operations refuse with [`BenchError::NotMaster`] when this node
/// is not the master. The `benchmarks` map is the only process-wide
/// mutable structure and lives for the service lifetime.
pub struct CoordinatorService {
    store: Arc<dyn ClusterStateStore>,
    transport: Arc<dyn Transport>,
    liveness: LivenessTracker,
    benchmarks: DashMap<BenchmarkId, Arc<BenchmarkHandle>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl CoordinatorService {
    /// Create the coordinator over explicit collaborators
    pub fn new(store: Arc<dyn ClusterStateStore>, transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            store,
            transport,
            liveness: LivenessTracker::new(),
            benchmarks: DashMap::new(),
            event_task: Mutex::new(None),
        })
    }

    /// Register the definition handler and start the event loop
    pub fn start(self: Arc<Self>) {
        self.transport
            .register_master_service(Arc::clone(&self) as Arc<dyn MasterService>);

        let service = Arc::clone(&self);
        let mut state_events = self.store.subscribe();
        let mut membership = self.transport.subscribe_membership();
        let handle = tokio::spawn(async move {
            let snapshot = service.store.read().await;
            service.handle_state_event(&snapshot.metadata.entries).await;
            loop {
                tokio::select! {
                    event = state_events.recv() => match event {
                        Some(event) => service.handle_state_event(&event.current.entries).await,
                        None => break,
                    },
                    event = membership.recv() => match event {
                        Some(MembershipEvent::NodeRemoved(node)) => {
                            service.handle_node_removed(&node).await;
                        }
                        Some(MembershipEvent::MasterChanged { master: false }) => {
                            service.handle_demotion();
                        }
                        Some(MembershipEvent::MasterChanged { master: true }) => {
                            info!("elected master");
                        }
                        None => break,
                    },
                }
            }
        });
        *self.event_task.lock() = Some(handle);
        info!(node = %self.transport.local_node(), "coordinator started");
    }

    /// Stop the event loop and fail every pending listener
    pub fn stop(&self) {
        if let Some(handle) = self.event_task.lock().take() {
            handle.abort();
        }
        self.handle_demotion();
    }

    /// Start a benchmark: select executors, create the INITIALIZING entry
    /// and return the pending final response.
    pub async fn start_benchmark(
        &self,
        mut definition: BenchmarkDefinition,
    ) -> BenchResult<PendingResponse<BenchmarkResponse>> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }
        if definition.benchmark_id.is_empty() {
            definition.benchmark_id = format!("benchmark-{}", uuid::Uuid::new_v4());
        }
        definition.validate()?;

        let available = self.transport.executor_nodes();
        if available.len() < definition.num_executor_nodes {
            return Err(BenchError::InsufficientExecutors {
                required: definition.num_executor_nodes,
                available: available.len(),
            });
        }
        let chosen: Vec<NodeId> = available
            .into_iter()
            .take(definition.num_executor_nodes)
            .collect();

        let benchmark_id = definition.benchmark_id.clone();
        let (client, receiver) = oneshot::channel();
        let handle = BenchmarkHandle::new(definition, client);

        // the handle must be visible before the INITIALIZING event fires,
        // or the event handler would sweep the entry as an orphan; an
        // occupied slot means the id is already running here
        match self.benchmarks.entry(benchmark_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(BenchError::DuplicateBenchmark(benchmark_id));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(handle);
            }
        }
        self.liveness.register(&benchmark_id, &chosen);

        let id = benchmark_id.clone();
        let nodes = chosen.clone();
        let inserted = update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            if meta.entries.contains_key(&id) {
                return Err(StoreError::Rejected(format!("benchmark already exists: {id}")));
            }
            meta.entries
                .insert(id.clone(), Entry::new(id.clone(), nodes.clone()));
            Ok(())
        })
        .await;

        if let Err(error) = inserted {
            self.benchmarks.remove(&benchmark_id);
            self.liveness.forget(&benchmark_id);
            return Err(match error {
                StoreError::Rejected(_) => BenchError::DuplicateBenchmark(benchmark_id),
                other => other.into(),
            });
        }

        info!(benchmark_id = %benchmark_id, nodes = ?chosen, "benchmark started");
        Ok(PendingResponse::new("start", benchmark_id, receiver))
    }

    /// Report the status of benchmarks matching the glob patterns
    pub async fn list_benchmarks(&self, patterns: &[String]) -> BenchResult<StatusResponse> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }
        let compiled = IdPatterns::compile(patterns);
        let snapshot = self.store.read().await;
        let benchmarks: Vec<BenchmarkStatus> = snapshot
            .metadata
            .entries
            .values()
            .filter(|entry| compiled.matches(&entry.benchmark_id))
            .map(BenchmarkStatus::from)
            .collect();
        if benchmarks.is_empty() && compiled.is_explicit() {
            return Err(BenchError::UnknownBenchmark(patterns.join(",")));
        }
        Ok(StatusResponse {
            benchmarks,
            reported_at: Utc::now(),
        })
    }

    /// Pause every RUNNING benchmark matching the patterns. The response
    /// arrives when all alive executors of each match have echoed PAUSED.
    pub async fn pause_benchmarks(
        &self,
        patterns: &[String],
    ) -> BenchResult<PendingResponse<ControlResponse>> {
        let matched = self
            .matched_in_state(patterns, |state| state == BenchmarkState::Running)
            .await?;
        let (client, receiver) = oneshot::channel();
        let waiter = ControlWaiter::new(matched.len(), client);
        for id in &matched {
            if let Some(handle) = self.benchmarks.get(id) {
                *handle.pause_waiter.lock() = Some(Arc::clone(&waiter));
            }
        }

        let alive = self.alive_by_benchmark(&matched).await;
        let ids = matched.clone();
        update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            for id in &ids {
                if let Some(entry) = meta.entry_mut(id) {
                    if entry.state == BenchmarkState::Running {
                        entry.state = BenchmarkState::Paused;
                        if let Some(nodes) = alive.get(id) {
                            for node in nodes {
                                if entry.node_state(node).is_some_and(|s| !s.is_terminal()) {
                                    entry.set_node_state(node, NodeState::Paused);
                                }
                            }
                        }
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(BenchError::from)?;

        info!(benchmarks = ?matched, "pause requested");
        Ok(PendingResponse::new("pause", patterns.join(","), receiver))
    }

    /// Resume every PAUSED benchmark matching the patterns. The response
    /// arrives when all alive executors have echoed RUNNING.
    pub async fn resume_benchmarks(
        &self,
        patterns: &[String],
    ) -> BenchResult<PendingResponse<ControlResponse>> {
        let matched = self
            .matched_in_state(patterns, |state| state == BenchmarkState::Paused)
            .await?;
        let (client, receiver) = oneshot::channel();
        let waiter = ControlWaiter::new(matched.len(), client);
        for id in &matched {
            if let Some(handle) = self.benchmarks.get(id) {
                *handle.resume_waiter.lock() = Some(Arc::clone(&waiter));
            }
        }

        let ids = matched.clone();
        update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            for id in &ids {
                if let Some(entry) = meta.entry_mut(id) {
                    if entry.state == BenchmarkState::Paused {
                        entry.state = BenchmarkState::Resuming;
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(BenchError::from)?;

        info!(benchmarks = ?matched, "resume requested");
        Ok(PendingResponse::new("resume", patterns.join(","), receiver))
    }

    /// Abort every RUNNING or PAUSED benchmark matching the patterns.
    /// Partial results are collected once every alive executor reaches a
    /// terminal state; the original start listener receives them.
    pub async fn abort_benchmarks(
        &self,
        patterns: &[String],
    ) -> BenchResult<PendingResponse<ControlResponse>> {
        let matched = self
            .matched_in_state(patterns, |state| {
                matches!(
                    state,
                    BenchmarkState::Running | BenchmarkState::Paused | BenchmarkState::Resuming
                )
            })
            .await?;
        let (client, receiver) = oneshot::channel();
        let waiter = ControlWaiter::new(matched.len(), client);
        for id in &matched {
            if let Some(handle) = self.benchmarks.get(id) {
                *handle.abort_waiter.lock() = Some(Arc::clone(&waiter));
            }
        }

        let ids = matched.clone();
        update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            for id in &ids {
                if let Some(entry) = meta.entry_mut(id) {
                    if !entry.state.is_terminal() && entry.state != BenchmarkState::Initializing {
                        entry.state = BenchmarkState::Aborted;
                    }
                }
            }
            Ok(())
        })
        .await
        .map_err(BenchError::from)?;

        // best-effort nudge so paused workers reach their checkpoint promptly
        let alive = self.alive_by_benchmark(&matched).await;
        for (id, nodes) in alive {
            for node in nodes {
                let transport = Arc::clone(&self.transport);
                let id = id.clone();
                tokio::spawn(async move {
                    if let Err(error) = transport.abort_local(&id, &node).await {
                        debug!(benchmark_id = %id, node = %node, %error, "abort nudge failed");
                    }
                });
            }
        }

        info!(benchmarks = ?matched, "abort requested");
        Ok(PendingResponse::new("abort", patterns.join(","), receiver))
    }

    async fn matched_in_state(
        &self,
        patterns: &[String],
        eligible: impl Fn(BenchmarkState) -> bool,
    ) -> BenchResult<Vec<BenchmarkId>> {
        if !self.transport.is_master() {
            return Err(BenchError::NotMaster);
        }
        let compiled = IdPatterns::compile(patterns);
        let snapshot = self.store.read().await;
        let matched: Vec<BenchmarkId> = snapshot
            .metadata
            .entries
            .values()
            .filter(|entry| compiled.matches(&entry.benchmark_id) && eligible(entry.state))
            .map(|entry| entry.benchmark_id.clone())
            .collect();
        if matched.is_empty() {
            return Err(BenchError::UnknownBenchmark(if patterns.is_empty() {
                "*".to_string()
            } else {
                patterns.join(",")
            }));
        }
        Ok(matched)
    }

    async fn alive_by_benchmark(
        &self,
        ids: &[BenchmarkId],
    ) -> BTreeMap<BenchmarkId, Vec<NodeId>> {
        let snapshot = self.store.read().await;
        ids.iter()
            .filter_map(|id| {
                snapshot.metadata.entry(id).map(|entry| {
                    let nodes = entry
                        .concrete_nodes
                        .iter()
                        .filter(|node| self.liveness.is_alive(id, node))
                        .cloned()
                        .collect();
                    (id.clone(), nodes)
                })
            })
            .collect()
    }

    async fn handle_state_event(&self, entries: &BTreeMap<BenchmarkId, Entry>) {
        if !self.transport.is_master() {
            return;
        }
        for entry in entries.values() {
            self.evaluate(entry).await;
        }
    }

    async fn handle_node_removed(&self, node: &NodeId) {
        self.liveness.mark_node_dead(node);
        if !self.transport.is_master() {
            return;
        }
        // a death can complete a quorum no further store event will announce
        let snapshot = self.store.read().await;
        for entry in snapshot.metadata.entries.values() {
            self.evaluate(entry).await;
        }
    }

    fn handle_demotion(&self) {
        let ids: Vec<BenchmarkId> = self.benchmarks.iter().map(|e| e.key().clone()).collect();
        if !ids.is_empty() {
            warn!(benchmarks = ?ids, "lost mastership, failing pending listeners");
        }
        for id in ids {
            if let Some((_, handle)) = self.benchmarks.remove(&id) {
                // dropping the senders surfaces MasterLost at every waiter
                handle.client.lock().take();
                handle.pause_waiter.lock().take();
                handle.resume_waiter.lock().take();
                handle.abort_waiter.lock().take();
                self.liveness.forget(&id);
            }
        }
    }

    /// Per-entry step of the cluster-state change handler
    async fn evaluate(&self, entry: &Entry) {
        let id = entry.benchmark_id.clone();
        let Some(handle) = self.benchmarks.get(&id).map(|h| Arc::clone(h.value())) else {
            warn!(benchmark_id = %id, "deleting orphaned benchmark entry");
            self.delete_entry(&id).await;
            return;
        };

        let participants: Vec<(NodeId, NodeState)> = entry
            .concrete_nodes
            .iter()
            .filter_map(|node| entry.node_state(node).map(|state| (node.clone(), state)))
            .filter(|(node, state)| {
                *state != NodeState::Failed && self.liveness.is_alive(&id, node)
            })
            .collect();

        if participants.is_empty() && !entry.state.is_terminal() {
            // every assigned node failed or died; a terminal entry still
            // falls through so its finalization arm can run
            if !handle.failed.swap(true, Ordering::SeqCst) {
                self.record_node_states(&handle, entry);
                self.mark_failed(&id).await;
            }
            return;
        }

        match entry.state {
            BenchmarkState::Initializing => {
                let all_ready = participants.iter().all(|(_, s)| *s == NodeState::Ready);
                if all_ready && !handle.running.swap(true, Ordering::SeqCst) {
                    self.on_ready(&id, &participants).await;
                }
            }
            BenchmarkState::Running => {
                let all_finished = participants.iter().all(|(_, s)| s.is_terminal());
                if all_finished && handle.running.swap(false, Ordering::SeqCst) {
                    self.on_finished(handle, entry, BenchmarkState::Completed)
                        .await;
                }
            }
            BenchmarkState::Paused => {
                let all_paused = participants
                    .iter()
                    .all(|(_, s)| *s == NodeState::Paused || s.is_terminal());
                if all_paused && !handle.paused.swap(true, Ordering::SeqCst) {
                    info!(benchmark_id = %id, "benchmark paused");
                    if let Some(waiter) = handle.pause_waiter.lock().take() {
                        waiter.signal(&id);
                    }
                }
            }
            BenchmarkState::Resuming => {
                let all_running = participants
                    .iter()
                    .all(|(_, s)| *s == NodeState::Running || s.is_terminal());
                if all_running && handle.paused.swap(false, Ordering::SeqCst) {
                    self.on_resumed(&id).await;
                    if let Some(waiter) = handle.resume_waiter.lock().take() {
                        waiter.signal(&id);
                    }
                }
            }
            BenchmarkState::Aborted => {
                let all_done = participants.iter().all(|(_, s)| s.is_terminal());
                if all_done && handle.running.swap(false, Ordering::SeqCst) {
                    self.record_node_states(&handle, entry);
                    if let Some(waiter) = handle.abort_waiter.lock().take() {
                        waiter.signal(&id);
                    }
                    self.on_finished(handle, entry, BenchmarkState::Aborted)
                        .await;
                }
            }
            BenchmarkState::Completed => {
                if !handle.complete.swap(true, Ordering::SeqCst) {
                    self.record_node_states(&handle, entry);
                    self.finish(handle, id, BenchmarkState::Completed).await;
                }
            }
            BenchmarkState::Failed => {
                if !handle.complete.swap(true, Ordering::SeqCst) {
                    self.record_node_states(&handle, entry);
                    self.finish_failed(handle, entry).await;
                }
            }
        }
    }

    fn record_node_states(&self, handle: &BenchmarkHandle, entry: &Entry) {
        let mut response = handle.response.lock();
        for (node, state) in &entry.node_state_map {
            response.node_states.insert(node.clone(), *state);
        }
    }

    /// All alive executors echoed READY: move the benchmark to RUNNING
    async fn on_ready(&self, benchmark_id: &BenchmarkId, participants: &[(NodeId, NodeState)]) {
        info!(benchmark_id = %benchmark_id, nodes = participants.len(), "all executors ready");
        let id = benchmark_id.clone();
        let nodes: Vec<NodeId> = participants.iter().map(|(n, _)| n.clone()).collect();
        let result = update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            if let Some(entry) = meta.entry_mut(&id) {
                if entry.state == BenchmarkState::Initializing {
                    entry.state = BenchmarkState::Running;
                    for node in &nodes {
                        if entry.node_state(node) == Some(NodeState::Ready) {
                            entry.set_node_state(node, NodeState::Running);
                        }
                    }
                }
            }
            Ok(())
        })
        .await;
        if let Err(error) = result {
            warn!(benchmark_id = %benchmark_id, %error, "failed to start benchmark run");
        }
    }

    /// All alive executors echoed RUNNING after a resume
    async fn on_resumed(&self, benchmark_id: &BenchmarkId) {
        info!(benchmark_id = %benchmark_id, "benchmark resumed");
        let id = benchmark_id.clone();
        let result = update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            if let Some(entry) = meta.entry_mut(&id) {
                if entry.state == BenchmarkState::Resuming {
                    entry.state = BenchmarkState::Running;
                }
            }
            Ok(())
        })
        .await;
        if let Err(error) = result {
            warn!(benchmark_id = %benchmark_id, %error, "failed to finish resume");
        }
    }

    /// Every alive executor is terminal: fetch per-node results, merge
    /// them, and drive the benchmark to its terminal state.
    async fn on_finished(
        &self,
        handle: Arc<BenchmarkHandle>,
        entry: &Entry,
        final_state: BenchmarkState,
    ) {
        let id = entry.benchmark_id.clone();
        let mut fetched: Vec<NodeResultSet> = Vec::new();
        for node in &entry.concrete_nodes {
            let state = entry.node_state(node);
            if state == Some(NodeState::Failed) || !self.liveness.is_alive(&id, node) {
                continue;
            }
            match self.fetch_results_with_retry(&id, node).await {
                Ok(results) => fetched.push(results),
                Err(error) => {
                    warn!(benchmark_id = %id, node = %node, %error, "dropping results of unreachable node");
                    let mut response = handle.response.lock();
                    response
                        .errors
                        .push(format!("failed to fetch results from node {node}: {error}"));
                    response.node_states.insert(node.clone(), NodeState::Failed);
                }
            }
        }

        {
            let mut response = handle.response.lock();
            for results in &fetched {
                for error in &results.errors {
                    response.errors.push(format!("[{}] {}", results.node_id, error));
                }
                for competition in &results.competition_results {
                    for error in &competition.errors {
                        response
                            .errors
                            .push(format!("[{}] {}", results.node_id, error));
                    }
                }
            }
            for competition in &handle.definition.competitions {
                let per_node: Vec<CompetitionNodeResult> = fetched
                    .iter()
                    .flat_map(|set| {
                        set.competition_results
                            .iter()
                            .filter(|r| r.competition == competition.name)
                            .cloned()
                    })
                    .collect();
                let merged =
                    Aggregator::merge(&competition.name, &competition.percentiles, per_node);
                response
                    .competition_results
                    .insert(competition.name.clone(), merged);
            }
        }

        match final_state {
            BenchmarkState::Completed => {
                let id_owned = id.clone();
                let result =
                    update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
                        if let Some(entry) = meta.entry_mut(&id_owned) {
                            if entry.state == BenchmarkState::Running {
                                entry.state = BenchmarkState::Completed;
                            }
                        }
                        Ok(())
                    })
                    .await;
                if let Err(error) = result {
                    warn!(benchmark_id = %id, %error, "failed to mark benchmark completed");
                }
                // the COMPLETED event finalizes the entry
            }
            BenchmarkState::Aborted => {
                // the entry already carries its terminal state
                if !handle.complete.swap(true, Ordering::SeqCst) {
                    self.finish(handle, id, BenchmarkState::Aborted).await;
                }
            }
            other => {
                debug!(benchmark_id = %id, state = %other, "unexpected terminal state in result collection");
            }
        }
    }

    async fn fetch_results_with_retry(
        &self,
        benchmark_id: &str,
        node: &NodeId,
    ) -> Result<NodeResultSet, TransportError> {
        match self.transport.fetch_results(benchmark_id, node).await {
            Ok(results) => Ok(results),
            Err(first) => {
                debug!(benchmark_id = %benchmark_id, node = %node, error = %first, "result fetch failed, retrying once");
                self.transport.fetch_results(benchmark_id, node).await
            }
        }
    }

    /// Mark the whole benchmark FAILED in the store
    async fn mark_failed(&self, benchmark_id: &BenchmarkId) {
        warn!(benchmark_id = %benchmark_id, "all assigned nodes failed or died");
        let id = benchmark_id.clone();
        let result = update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            if let Some(entry) = meta.entry_mut(&id) {
                if !entry.state.is_terminal() {
                    entry.state = BenchmarkState::Failed;
                }
            }
            Ok(())
        })
        .await;
        if let Err(error) = result {
            warn!(benchmark_id = %benchmark_id, %error, "failed to mark benchmark failed");
        }
    }

    /// Harvest node-level errors, then finalize a FAILED benchmark.
    /// Callers hold the `complete` CAS.
    async fn finish_failed(&self, handle: Arc<BenchmarkHandle>, entry: &Entry) {
        let id = entry.benchmark_id.clone();
        for node in &entry.concrete_nodes {
            if !self.liveness.is_alive(&id, node) {
                continue;
            }
            if let Ok(results) = self.transport.fetch_results(&id, node).await {
                let mut response = handle.response.lock();
                for error in &results.errors {
                    response.errors.push(format!("[{}] {}", results.node_id, error));
                }
            }
        }
        {
            let mut response = handle.response.lock();
            for (node, state) in &entry.node_state_map {
                if *state == NodeState::Failed {
                    response.errors.push(format!("node {node} failed"));
                }
            }
        }
        self.delete_and_respond(handle, id, BenchmarkState::Failed).await;
    }

    /// Finalize a benchmark whose `complete` CAS the caller already won
    async fn finish(
        &self,
        handle: Arc<BenchmarkHandle>,
        benchmark_id: BenchmarkId,
        state: BenchmarkState,
    ) {
        self.delete_and_respond(handle, benchmark_id, state).await;
    }

    async fn delete_and_respond(
        &self,
        handle: Arc<BenchmarkHandle>,
        benchmark_id: BenchmarkId,
        state: BenchmarkState,
    ) {
        // delete the entry first; the in-memory record goes only after the
        // delete commits, so a crash in between leaves an orphan the event
        // handler sweeps
        self.delete_entry(&benchmark_id).await;

        let mut response = BenchmarkResponse::new(benchmark_id.clone(), state);
        {
            let mut builder = handle.response.lock();
            response.errors = std::mem::take(&mut builder.errors);
            response.competition_results = std::mem::take(&mut builder.competition_results);
            response.node_states = std::mem::take(&mut builder.node_states);
        }
        if let Some(client) = handle.client.lock().take() {
            let _ = client.send(response);
        }
        self.liveness.forget(&benchmark_id);
        self.benchmarks.remove(&benchmark_id);
        info!(benchmark_id = %benchmark_id, state = %state, "benchmark finished");
    }

    async fn delete_entry(&self, benchmark_id: &str) {
        let id = benchmark_id.to_string();
        let result = update_with_retry(self.store.as_ref(), DEFAULT_UPDATE_ATTEMPTS, move |meta| {
            if meta.entries.remove(&id).is_none() {
                return Err(StoreError::Rejected("entry already deleted".to_string()));
            }
            Ok(())
        })
        .await;
        match result {
            Ok(_) | Err(StoreError::Rejected(_)) => {}
            Err(error) => {
                warn!(benchmark_id = %benchmark_id, %error, "failed to delete benchmark entry");
            }
        }
    }
}

#[async_trait]
impl MasterService for CoordinatorService {
    async fn definition(
        &self,
        benchmark_id: &str,
        node_id: &NodeId,
    ) -> Result<BenchmarkDefinition, TransportError> {
        debug!(benchmark_id = %benchmark_id, node = %node_id, "definition requested");
        self.benchmarks
            .get(benchmark_id)
            .map(|handle| handle.definition.clone())
            .ok_or_else(|| TransportError::UnknownBenchmark(benchmark_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BenchmarkSettings, Competition, SearchRequest};
    use crate::store::InMemoryStateStore;
    use crate::transport::LocalHub;

    fn definition(id: &str, nodes: usize) -> BenchmarkDefinition {
        BenchmarkDefinition {
            benchmark_id: id.to_string(),
            competitions: vec![Competition::new(
                "c1",
                vec![SearchRequest::new(serde_json::json!({"query": "*"}))],
            )],
            num_executor_nodes: nodes,
            settings: BenchmarkSettings::default(),
        }
    }

    fn cluster(executors: usize) -> (Arc<InMemoryStateStore>, Arc<CoordinatorService>) {
        let store = Arc::new(InMemoryStateStore::new());
        let hub = LocalHub::new();
        let master = hub.join("master", false);
        for i in 0..executors {
            let _ = hub.join(format!("node-{i}"), true);
        }
        hub.set_master(&"master".to_string());
        let coordinator = CoordinatorService::new(
            store.clone() as Arc<dyn ClusterStateStore>,
            master as Arc<dyn Transport>,
        );
        (store, coordinator)
    }

    #[tokio::test]
    async fn test_operations_refuse_when_not_master() {
        let store = Arc::new(InMemoryStateStore::new());
        let hub = LocalHub::new();
        let transport = hub.join("standby", false);
        // no master elected, and this node is certainly not it
        let coordinator = CoordinatorService::new(
            store.clone() as Arc<dyn ClusterStateStore>,
            transport as Arc<dyn Transport>,
        );

        let err = coordinator
            .start_benchmark(definition("b1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::NotMaster));
        assert!(store.read().await.metadata.entries.is_empty());

        assert!(matches!(
            coordinator.list_benchmarks(&[]).await.unwrap_err(),
            BenchError::NotMaster
        ));
        assert!(matches!(
            coordinator.pause_benchmarks(&[]).await.unwrap_err(),
            BenchError::NotMaster
        ));
    }

    #[tokio::test]
    async fn test_insufficient_executors_before_any_write() {
        let (store, coordinator) = cluster(1);
        let err = coordinator
            .start_benchmark(definition("b1", 2))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BenchError::InsufficientExecutors {
                required: 2,
                available: 1
            }
        ));
        assert!(store.read().await.metadata.entries.is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_benchmark_rejected() {
        let (store, coordinator) = cluster(1);
        let _pending = coordinator
            .start_benchmark(definition("b1", 1))
            .await
            .unwrap();
        assert!(store.read().await.metadata.entry("b1").is_some());

        let err = coordinator
            .start_benchmark(definition("b1", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::DuplicateBenchmark(_)));
    }

    #[tokio::test]
    async fn test_control_waiter_signals_once_after_countdown() {
        let (tx, rx) = oneshot::channel();
        let waiter = ControlWaiter::new(2, tx);
        waiter.signal(&"b1".to_string());
        waiter.signal(&"b2".to_string());
        // further signals must not panic or double-send
        waiter.signal(&"b3".to_string());

        let response = rx.await.unwrap();
        assert_eq!(response.benchmark_ids, vec!["b1", "b2"]);
    }

    #[tokio::test]
    async fn test_pending_response_timeout_and_master_lost() {
        let (tx, rx) = oneshot::channel::<ControlResponse>();
        let pending = PendingResponse::new("pause", "b1".to_string(), rx);
        let err = pending
            .wait_with_deadline(Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::Timeout { .. }));
        drop(tx);

        let (tx, rx) = oneshot::channel::<ControlResponse>();
        let pending = PendingResponse::new("pause", "b1".to_string(), rx);
        drop(tx);
        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, BenchError::MasterLost { .. }));
    }

    #[tokio::test]
    async fn test_unknown_pattern_errors() {
        let (_store, coordinator) = cluster(1);
        let err = coordinator
            .list_benchmarks(&["missing-*".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::UnknownBenchmark(_)));

        let err = coordinator
            .abort_benchmarks(&["missing".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, BenchError::UnknownBenchmark(_)));
    }

    #[tokio::test]
    async fn test_orphan_entry_is_deleted() {
        let (store, coordinator) = cluster(1);
        Arc::clone(&coordinator).start();

        // an entry this coordinator has no internal state for
        store
            .update(Box::new(|meta| {
                meta.entries.insert(
                    "ghost".to_string(),
                    Entry::new("ghost".to_string(), vec!["node-0".to_string()]),
                );
                Ok(())
            }))
            .await
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if store.read().await.metadata.entry("ghost").is_none() {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "orphan not swept");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        coordinator.stop();
    }
}
