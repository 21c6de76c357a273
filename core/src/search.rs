// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Search-engine adapter: the opaque engine trait, pause/abort run
//! controls, and the competition iteration loop.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

use crate::model::{BenchmarkSettings, Competition, NodeId, SearchRequest};
use crate::results::{CompetitionNodeResult, IterationResult, QueryStats};

/// Failures raised by the search layer.
///
/// A non-fatal failure is recorded against the running competition and
/// execution continues; a fatal failure (for example a query that does not
/// compile) fails the whole competition on this node.
#[derive(Debug, Clone, Error)]
pub enum SearchFailure {
    /// Fails the competition on this node
    #[error("fatal search failure: {0}")]
    Fatal(String),

    /// Recorded; the iteration continues
    #[error("search failure: {0}")]
    NonFatal(String),
}

/// The search/query engine the executors drive. Opaque to orchestration.
#[async_trait]
pub trait SearchEngine: Send + Sync {
    /// Execute one search request and report its timing
    async fn search(&self, request: &SearchRequest) -> Result<QueryStats, SearchFailure>;

    /// Drop engine caches; called between iterations when the benchmark
    /// allows cache clearing
    async fn clear_caches(&self);
}

/// Gate a worker acquires before every iteration; closed while the
/// benchmark is paused.
pub struct PauseGate {
    paused: watch::Sender<bool>,
}

impl PauseGate {
    /// Create an open gate
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self { paused }
    }

    /// Close the gate
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    /// Open the gate, releasing blocked workers
    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    /// Whether the gate is currently closed
    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Wait until the gate is open
    pub async fn acquire(&self) {
        let mut watcher = self.paused.subscribe();
        loop {
            if !*watcher.borrow_and_update() {
                return;
            }
            if watcher.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Abort flag and pause gate shared between a worker and its executor
/// service. Requesting an abort also opens the gate so a paused worker can
/// reach its checkpoint.
pub struct RunControl {
    abort: AtomicBool,
    pause: PauseGate,
}

impl RunControl {
    /// Create a control with the gate open and no abort requested
    pub fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            pause: PauseGate::new(),
        }
    }

    /// Request an abort; the worker drops at its next checkpoint
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        self.pause.resume();
    }

    /// Whether an abort was requested
    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    /// Close the pause gate
    pub fn pause(&self) {
        self.pause.pause();
        // an abort racing this pause must not leave the gate closed
        if self.is_aborted() {
            self.pause.resume();
        }
    }

    /// Open the pause gate
    pub fn resume(&self) {
        self.pause.resume();
    }

    /// The pause gate itself
    pub fn gate(&self) -> &PauseGate {
        &self.pause
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(since: Instant) -> f64 {
    since.elapsed().as_secs_f64() * 1000.0
}

/// Runs one competition on one node: warm-up, `iterations` measured
/// passes of the query set repeated `multiplier` times with up to
/// `concurrency` requests in flight, acquiring the pause gate before each
/// iteration and polling the abort flag between iterations.
#[derive(Clone)]
pub struct CompetitionExecutor {
    engine: Arc<dyn SearchEngine>,
}

impl CompetitionExecutor {
    /// Create an executor over the given engine
    pub fn new(engine: Arc<dyn SearchEngine>) -> Self {
        Self { engine }
    }

    /// Run the competition to completion, abort checkpoint or fatal
    /// failure. On abort the partial result is returned; the caller reads
    /// the control to distinguish.
    pub async fn run(
        &self,
        node_id: &NodeId,
        competition: &Competition,
        settings: &BenchmarkSettings,
        control: &RunControl,
    ) -> Result<CompetitionNodeResult, SearchFailure> {
        let mut result = CompetitionNodeResult::new(
            node_id.clone(),
            competition.name.clone(),
            settings.iterations,
        );

        if settings.warmup {
            control.gate().acquire().await;
            if control.is_aborted() {
                return Ok(result);
            }
            let started = Instant::now();
            self.run_iteration(competition, settings, &mut result.errors)
                .await?;
            result.warmup_ms = elapsed_ms(started);
            debug!(
                competition = %competition.name,
                warmup_ms = result.warmup_ms,
                "warm-up pass finished"
            );
        }

        for _ in 0..settings.iterations {
            control.gate().acquire().await;
            if control.is_aborted() {
                break;
            }
            let iteration = self
                .run_iteration(competition, settings, &mut result.errors)
                .await?;
            result.total_time_ms += iteration.duration_ms;
            result.total_queries += iteration.total_queries;
            result.total_hits += iteration.total_hits;
            result.iterations.push(iteration);

            if settings.allow_cache_clearing {
                self.engine.clear_caches().await;
            }
        }

        Ok(result)
    }

    async fn run_iteration(
        &self,
        competition: &Competition,
        settings: &BenchmarkSettings,
        errors: &mut Vec<String>,
    ) -> Result<IterationResult, SearchFailure> {
        let started = Instant::now();
        let requests = (0..settings.multiplier)
            .flat_map(|_| competition.requests.iter().cloned())
            .collect::<Vec<_>>();

        let mut outcomes = stream::iter(requests)
            .map(|request| {
                let engine = Arc::clone(&self.engine);
                async move { engine.search(&request).await }
            })
            .buffer_unordered(settings.concurrency as usize);

        let mut latencies = Vec::new();
        let mut queries = 0u64;
        let mut hits = 0u64;
        while let Some(outcome) = outcomes.next().await {
            match outcome {
                Ok(stats) => {
                    queries += 1;
                    hits += stats.hits;
                    latencies.push(stats.took_ms);
                }
                Err(SearchFailure::NonFatal(message)) => errors.push(message),
                Err(fatal) => return Err(fatal),
            }
        }

        Ok(IterationResult {
            duration_ms: elapsed_ms(started),
            total_queries: queries,
            total_hits: hits,
            latencies_ms: latencies,
        })
    }
}

/// Deterministic engine for the local cluster and tests.
///
/// A request body may script failures: `{"fail": "fatal"}` does not
/// compile, `{"fail": "query"}` fails that single query.
pub struct SimulatedSearchEngine {
    latency: Duration,
    hits_per_query: u64,
    sequence: AtomicU64,
}

impl SimulatedSearchEngine {
    /// Engine with the given per-request latency
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            hits_per_query: 10,
            sequence: AtomicU64::new(0),
        }
    }

    /// Override the hits every query reports
    pub fn with_hits(mut self, hits_per_query: u64) -> Self {
        self.hits_per_query = hits_per_query;
        self
    }
}

impl Default for SimulatedSearchEngine {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

#[async_trait]
impl SearchEngine for SimulatedSearchEngine {
    async fn search(&self, request: &SearchRequest) -> Result<QueryStats, SearchFailure> {
        if let Some(fail) = request.body.get("fail").and_then(|v| v.as_str()) {
            match fail {
                "fatal" => {
                    return Err(SearchFailure::Fatal(format!(
                        "query does not compile: {}",
                        request.body
                    )))
                }
                "query" => {
                    return Err(SearchFailure::NonFatal(format!(
                        "query failed: {}",
                        request.body
                    )))
                }
                _ => {}
            }
        }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let jitter = (self.sequence.fetch_add(1, Ordering::Relaxed) % 5) as f64 * 0.1;
        Ok(QueryStats {
            took_ms: self.latency.as_secs_f64() * 1000.0 + jitter,
            hits: self.hits_per_query,
        })
    }

    async fn clear_caches(&self) {}
}
