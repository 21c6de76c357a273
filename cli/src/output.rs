//! Output formatting for benchmark responses.
//!
//! - Pretty: human-readable with colors and a per-competition summary
//! - Json: compact JSON
//! - JsonPretty: pretty-printed JSON

use colored::*;

use search_bench_core::model::BenchmarkState;
use search_bench_core::results::BenchmarkResponse;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable pretty output with colors
    Pretty,
    /// Compact JSON output
    Json,
    /// Pretty-printed JSON output
    JsonPretty,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::Pretty
    }
}

/// Display a benchmark response in the specified format
pub fn display_response(response: &BenchmarkResponse, format: OutputFormat) {
    match format {
        OutputFormat::Pretty => display_pretty(response),
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(response).unwrap_or_default());
        }
        OutputFormat::JsonPretty => {
            println!(
                "{}",
                serde_json::to_string_pretty(response).unwrap_or_default()
            );
        }
    }
}

fn state_label(state: BenchmarkState) -> ColoredString {
    match state {
        BenchmarkState::Completed => state.to_string().green().bold(),
        BenchmarkState::Failed => state.to_string().red().bold(),
        BenchmarkState::Aborted => state.to_string().yellow().bold(),
        other => other.to_string().cyan().bold(),
    }
}

fn display_pretty(response: &BenchmarkResponse) {
    println!();
    println!("{}", "━".repeat(72).bright_blue());
    println!(
        "{} {} [{}]",
        "Benchmark".bright_blue().bold(),
        response.benchmark_id,
        state_label(response.state)
    );
    println!("{}", "━".repeat(72).bright_blue());

    for (name, result) in &response.competition_results {
        let summary = &result.summary;
        println!();
        println!("{} {}", "Competition:".bright_cyan(), name.bold());
        println!(
            "  nodes {}  iterations {}  queries {}  hits {}",
            result.node_results.len(),
            summary.completed_iterations,
            summary.total_queries,
            summary.total_hits
        );
        println!(
            "  latency min/mean/max {:.2} / {:.2} / {:.2} ms  qps {:.1}  ms/hit {:.3}",
            summary.min_ms,
            summary.mean_ms,
            summary.max_ms,
            summary.queries_per_second,
            summary.millis_per_hit
        );
        if !summary.percentiles.is_empty() {
            let table: Vec<String> = summary
                .percentiles
                .iter()
                .map(|p| format!("p{:.0}={:.2}", p.percentile, p.value_ms))
                .collect();
            println!("  percentiles {}", table.join("  "));
        }
    }

    if !response.errors.is_empty() {
        println!();
        println!("{}", "Errors:".red().bold());
        for error in &response.errors {
            println!("  - {error}");
        }
    }
    println!();
}
