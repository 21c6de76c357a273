// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Benchmark result types, from single queries up to the merged response.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::model::{BenchmarkId, BenchmarkState, Entry, NodeId, NodeState};

/// Timing of a single executed search request
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    /// Wall time of the request in milliseconds
    pub took_ms: f64,
    /// Hits the request returned
    pub hits: u64,
}

/// One measured pass through a competition's query set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationResult {
    /// Wall time of the whole iteration in milliseconds
    pub duration_ms: f64,
    /// Requests that completed successfully
    pub total_queries: u64,
    /// Hits summed over the iteration
    pub total_hits: u64,
    /// Per-request latencies, kept for percentile roll-ups
    pub latencies_ms: Vec<f64>,
}

/// Result of one competition on one executor node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitionNodeResult {
    /// Node that produced this result
    pub node_id: NodeId,
    /// Competition name
    pub competition: String,
    /// Time spent in the untimed warm-up pass, milliseconds
    pub warmup_ms: f64,
    /// Iterations the definition asked for
    pub requested_iterations: u32,
    /// Completed iterations, in order
    pub iterations: Vec<IterationResult>,
    /// Measured time summed over iterations, milliseconds
    pub total_time_ms: f64,
    /// Successful requests summed over iterations
    pub total_queries: u64,
    /// Hits summed over iterations
    pub total_hits: u64,
    /// Per-query errors recorded while the competition kept running
    pub errors: Vec<String>,
}

impl CompetitionNodeResult {
    /// Create an empty result shell for a node about to run a competition
    pub fn new(
        node_id: NodeId,
        competition: impl Into<String>,
        requested_iterations: u32,
    ) -> Self {
        Self {
            node_id,
            competition: competition.into(),
            warmup_ms: 0.0,
            requested_iterations,
            iterations: Vec::new(),
            total_time_ms: 0.0,
            total_queries: 0,
            total_hits: 0,
            errors: Vec::new(),
        }
    }

    /// Iterations actually completed
    pub fn completed_iterations(&self) -> usize {
        self.iterations.len()
    }

    /// Mean per-request latency on this node, milliseconds
    pub fn mean_latency_ms(&self) -> f64 {
        let (sum, count) = self
            .iterations
            .iter()
            .flat_map(|i| i.latencies_ms.iter())
            .fold((0.0_f64, 0_u64), |(s, c), l| (s + l, c + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }
}

/// Per-node payload of the `bench/node/status` transport action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeResultSet {
    /// Benchmark id
    pub benchmark_id: BenchmarkId,
    /// Reporting node
    pub node_id: NodeId,
    /// The node's local phase at report time
    pub node_state: NodeState,
    /// Results of the competitions this node has finished or partially run
    pub competition_results: Vec<CompetitionNodeResult>,
    /// Node-level errors (fatal failures, definition fetch problems)
    pub errors: Vec<String>,
}

/// One percentile key/value pair in a summary
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PercentileValue {
    /// Percentile key in (0, 100]
    pub percentile: f64,
    /// Interpolated latency at that percentile, milliseconds
    pub value_ms: f64,
}

/// Cluster-wide summary of one competition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompetitionSummary {
    /// Measured time summed over all nodes, milliseconds
    pub total_time_ms: f64,
    /// Smallest per-request latency observed on any node
    pub min_ms: f64,
    /// Largest per-request latency observed on any node
    pub max_ms: f64,
    /// Equal-weighted mean of the per-node mean latencies
    pub mean_ms: f64,
    /// Successful requests summed over all nodes
    pub total_queries: u64,
    /// Hits summed over all nodes
    pub total_hits: u64,
    /// Queries per second from the summed totals
    pub queries_per_second: f64,
    /// Milliseconds per hit from the summed totals
    pub millis_per_hit: f64,
    /// Warm-up time summed over all nodes, milliseconds
    pub warmup_ms: f64,
    /// Iterations completed summed over all nodes
    pub completed_iterations: u64,
    /// Percentile table over the concatenated latency samples
    pub percentiles: Vec<PercentileValue>,
}

/// Merged result of one competition across all reporting nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetitionResult {
    /// Competition name
    pub competition: String,
    /// One entry per reporting node
    pub node_results: Vec<CompetitionNodeResult>,
    /// Cluster-wide summary statistics
    pub summary: CompetitionSummary,
}

/// Final response delivered to the client that started the benchmark
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResponse {
    /// Benchmark id
    pub benchmark_id: BenchmarkId,
    /// Terminal state the benchmark ended in
    pub state: BenchmarkState,
    /// Accumulated error messages, node-level and per-query
    pub errors: Vec<String>,
    /// Merged results keyed by competition name
    pub competition_results: BTreeMap<String, CompetitionResult>,
    /// Last observed per-node states
    pub node_states: BTreeMap<NodeId, NodeState>,
    /// When the response was assembled
    pub completed_at: DateTime<Utc>,
}

impl BenchmarkResponse {
    /// An empty response shell in the given terminal state
    pub fn new(benchmark_id: BenchmarkId, state: BenchmarkState) -> Self {
        Self {
            benchmark_id,
            state,
            errors: Vec::new(),
            competition_results: BTreeMap::new(),
            node_states: BTreeMap::new(),
            completed_at: Utc::now(),
        }
    }
}

/// Status of one benchmark as reported by `listBenchmarks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkStatus {
    /// Benchmark id
    pub benchmark_id: BenchmarkId,
    /// Global state
    pub state: BenchmarkState,
    /// Per-node states
    pub node_state_map: BTreeMap<NodeId, NodeState>,
}

impl From<&Entry> for BenchmarkStatus {
    fn from(entry: &Entry) -> Self {
        Self {
            benchmark_id: entry.benchmark_id.clone(),
            state: entry.state,
            node_state_map: entry.node_state_map.clone(),
        }
    }
}

/// Response of `listBenchmarks`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Matched benchmarks, in id order
    pub benchmarks: Vec<BenchmarkStatus>,
    /// When the snapshot was read
    pub reported_at: DateTime<Utc>,
}

/// Acknowledgement of a pause, resume or abort operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlResponse {
    /// Benchmarks the operation transitioned, in completion order
    pub benchmark_ids: Vec<BenchmarkId>,
}

/// Value at `pct` (0..=100] of an ascending-sorted sample slice, with
/// linear interpolation between adjacent samples.
pub fn calculate_percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = (pct / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    if lower == upper {
        return sorted[lower];
    }
    let weight = rank - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentile_empty_and_single() {
        assert_eq!(calculate_percentile(&[], 50.0), 0.0);
        assert_eq!(calculate_percentile(&[7.0], 99.0), 7.0);
    }

    #[test]
    fn test_percentile_interpolation() {
        let samples = vec![10.0, 20.0, 30.0, 40.0];
        assert_eq!(calculate_percentile(&samples, 0.0), 10.0);
        assert_eq!(calculate_percentile(&samples, 100.0), 40.0);
        // rank 1.5 -> halfway between 20 and 30
        assert!((calculate_percentile(&samples, 50.0) - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_percentile_monotone() {
        let mut samples: Vec<f64> = (0..100).map(|i| (i * 7 % 41) as f64).collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let keys = [1.0, 10.0, 25.0, 50.0, 75.0, 90.0, 99.0, 100.0];
        let values: Vec<f64> = keys
            .iter()
            .map(|p| calculate_percentile(&samples, *p))
            .collect();
        for pair in values.windows(2) {
            assert!(pair[0] <= pair[1] + 1e-9);
        }
    }

    #[test]
    fn test_mean_latency() {
        let mut result = CompetitionNodeResult::new("n1".to_string(), "c1", 2);
        assert_eq!(result.mean_latency_ms(), 0.0);
        result.iterations.push(IterationResult {
            duration_ms: 30.0,
            total_queries: 2,
            total_hits: 4,
            latencies_ms: vec![10.0, 20.0],
        });
        result.iterations.push(IterationResult {
            duration_ms: 30.0,
            total_queries: 1,
            total_hits: 2,
            latencies_ms: vec![30.0],
        });
        assert!((result.mean_latency_ms() - 20.0).abs() < 1e-9);
        assert_eq!(result.completed_iterations(), 2);
    }
}
