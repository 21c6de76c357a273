// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Merges per-node competition results into a cluster-wide result.

use crate::results::{
    calculate_percentile, CompetitionNodeResult, CompetitionResult, CompetitionSummary,
    PercentileValue,
};

/// Aggregates one [`CompetitionNodeResult`] per reporting node into a
/// [`CompetitionResult`].
///
/// Totals are summed across nodes; min and max are taken pointwise over
/// every sample; the mean is the equal-weighted mean of the per-node
/// means; throughput figures are derived from the summed totals rather
/// than averaged; percentiles are interpolated over the concatenation of
/// all per-iteration sample arrays.
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    /// Merge the per-node results of one competition.
    pub fn merge(
        competition: &str,
        percentiles: &[f64],
        node_results: Vec<CompetitionNodeResult>,
    ) -> CompetitionResult {
        let mut summary = CompetitionSummary::default();

        let mut samples: Vec<f64> = Vec::new();
        let mut node_mean_sum = 0.0;
        let mut nodes_with_samples = 0u64;

        for node in &node_results {
            summary.total_time_ms += node.total_time_ms;
            summary.total_queries += node.total_queries;
            summary.total_hits += node.total_hits;
            summary.warmup_ms += node.warmup_ms;
            summary.completed_iterations += node.iterations.len() as u64;

            let before = samples.len();
            for iteration in &node.iterations {
                samples.extend_from_slice(&iteration.latencies_ms);
            }
            if samples.len() > before {
                node_mean_sum += node.mean_latency_ms();
                nodes_with_samples += 1;
            }
        }

        if !samples.is_empty() {
            samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            summary.min_ms = samples[0];
            summary.max_ms = samples[samples.len() - 1];
            summary.mean_ms = node_mean_sum / nodes_with_samples as f64;
            summary.percentiles = percentiles
                .iter()
                .map(|pct| PercentileValue {
                    percentile: *pct,
                    value_ms: calculate_percentile(&samples, *pct),
                })
                .collect();
        }

        if summary.total_time_ms > 0.0 {
            summary.queries_per_second =
                summary.total_queries as f64 / (summary.total_time_ms / 1000.0);
        }
        if summary.total_hits > 0 {
            summary.millis_per_hit = summary.total_time_ms / summary.total_hits as f64;
        }

        CompetitionResult {
            competition: competition.to_string(),
            node_results,
            summary,
        }
    }
}
