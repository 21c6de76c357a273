use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use search_bench_core::cluster::LocalCluster;
use search_bench_core::model::BenchmarkState;
use search_bench_core::search::SimulatedSearchEngine;

use crate::error::CliError;
use crate::output::{self, OutputFormat};

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Path to the benchmark definition file (JSON or YAML)
    #[arg(short, long)]
    pub definition: PathBuf,

    /// Number of executor nodes in the local cluster
    #[arg(short, long, default_value = "3")]
    pub nodes: usize,

    /// Simulated per-request latency in milliseconds
    #[arg(long, default_value = "1")]
    pub latency_ms: u64,

    /// Output format
    #[arg(short, long, value_enum, default_value = "pretty")]
    pub format: OutputFormat,

    /// Overall deadline in seconds; the benchmark keeps running on expiry
    #[arg(long)]
    pub timeout: Option<u64>,
}

pub async fn execute(args: RunArgs, verbose: bool) -> Result<(), CliError> {
    let definition = super::load_definition(&args.definition)?;
    definition.validate().map_err(CliError::from)?;

    if verbose {
        println!("{}", "Configuration:".bold());
        println!("  Definition: {}", args.definition.display());
        println!("  Benchmark:  {}", definition.benchmark_id);
        println!("  Executors:  {}", args.nodes);
        println!("  Latency:    {}ms", args.latency_ms);
        println!();
    }

    let engine = Arc::new(SimulatedSearchEngine::new(Duration::from_millis(
        args.latency_ms,
    )));
    let cluster = LocalCluster::start_with_engine(args.nodes, engine).await;

    let pending = cluster
        .coordinator()
        .start_benchmark(definition)
        .await
        .map_err(CliError::from)?;
    let response = pending
        .wait_with_deadline(args.timeout.map(Duration::from_secs))
        .await
        .map_err(CliError::from)?;
    cluster.shutdown();

    output::display_response(&response, args.format);

    if response.state == BenchmarkState::Failed {
        return Err(CliError::cluster(format!(
            "benchmark {} failed: {}",
            response.benchmark_id,
            response.errors.join("; ")
        )));
    }
    Ok(())
}
