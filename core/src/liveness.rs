// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Per-benchmark node liveness tracking on the coordinator.

use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use crate::model::{BenchmarkId, NodeId};

/// Tracks which assigned nodes are still alive, per benchmark.
///
/// Bits are cleared when the transport reports a node removal and are
/// never set back: a node reconnecting under the same id is dead for the
/// runs it was assigned to. Dead nodes are excluded from quorum checks.
pub struct LivenessTracker {
    flags: DashMap<(BenchmarkId, NodeId), Arc<AtomicBool>>,
}

impl LivenessTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self {
            flags: DashMap::new(),
        }
    }

    /// Register the initial node assignment of a benchmark. An existing
    /// cleared bit stays cleared.
    pub fn register(&self, benchmark_id: &BenchmarkId, nodes: &[NodeId]) {
        for node in nodes {
            self.flags
                .entry((benchmark_id.clone(), node.clone()))
                .or_insert_with(|| Arc::new(AtomicBool::new(true)));
        }
    }

    /// Clear the alive bit of `node` for every benchmark referencing it
    pub fn mark_node_dead(&self, node: &NodeId) {
        let mut cleared = 0usize;
        for entry in self.flags.iter() {
            if &entry.key().1 == node {
                entry.value().store(false, Ordering::SeqCst);
                cleared += 1;
            }
        }
        if cleared > 0 {
            warn!(node = %node, benchmarks = cleared, "executor node marked dead");
        }
    }

    /// Whether `node` is still alive for `benchmark_id`. Pairs that were
    /// never registered have not been observed dead.
    pub fn is_alive(&self, benchmark_id: &BenchmarkId, node: &NodeId) -> bool {
        self.flags
            .get(&(benchmark_id.clone(), node.clone()))
            .map(|bit| bit.load(Ordering::SeqCst))
            .unwrap_or(true)
    }

    /// Drop all bits of a finished benchmark
    pub fn forget(&self, benchmark_id: &BenchmarkId) {
        self.flags.retain(|(id, _), _| id != benchmark_id);
    }
}

impl Default for LivenessTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(benchmark: &str, node: &str) -> (BenchmarkId, NodeId) {
        (benchmark.to_string(), node.to_string())
    }

    #[test]
    fn test_register_and_query() {
        let tracker = LivenessTracker::new();
        let (b, n1) = ids("b1", "n1");
        tracker.register(&b, &[n1.clone(), "n2".to_string()]);

        assert!(tracker.is_alive(&b, &n1));
        assert!(tracker.is_alive(&b, &"n2".to_string()));
    }

    #[test]
    fn test_death_clears_every_benchmark() {
        let tracker = LivenessTracker::new();
        let node = "n1".to_string();
        tracker.register(&"b1".to_string(), &[node.clone()]);
        tracker.register(&"b2".to_string(), &[node.clone()]);

        tracker.mark_node_dead(&node);

        assert!(!tracker.is_alive(&"b1".to_string(), &node));
        assert!(!tracker.is_alive(&"b2".to_string(), &node));
    }

    #[test]
    fn test_death_is_latched() {
        let tracker = LivenessTracker::new();
        let (b, n) = ids("b1", "n1");
        tracker.register(&b, &[n.clone()]);
        tracker.mark_node_dead(&n);

        // re-registration of the same pair must not resurrect it
        tracker.register(&b, &[n.clone()]);
        assert!(!tracker.is_alive(&b, &n));
    }

    #[test]
    fn test_forget_drops_only_that_benchmark() {
        let tracker = LivenessTracker::new();
        let node = "n1".to_string();
        tracker.register(&"b1".to_string(), &[node.clone()]);
        tracker.register(&"b2".to_string(), &[node.clone()]);
        tracker.mark_node_dead(&node);

        tracker.forget(&"b1".to_string());

        // b1's pair is gone entirely; b2 remains dead
        assert!(tracker.is_alive(&"b1".to_string(), &node));
        assert!(!tracker.is_alive(&"b2".to_string(), &node));
    }
}
