use clap::Args;
use colored::Colorize;
use std::path::PathBuf;

use crate::error::CliError;

#[derive(Args, Debug)]
pub struct ValidateArgs {
    /// Path to the benchmark definition file (JSON or YAML)
    #[arg(short, long)]
    pub definition: PathBuf,
}

pub async fn execute(args: ValidateArgs, verbose: bool) -> Result<(), CliError> {
    let definition = super::load_definition(&args.definition)?;
    definition.validate().map_err(CliError::from)?;

    println!(
        "{} {} ({} competitions, {} executor nodes)",
        "Valid:".green().bold(),
        definition.benchmark_id,
        definition.competitions.len(),
        definition.num_executor_nodes
    );
    if verbose {
        for competition in &definition.competitions {
            let settings = definition.effective_settings(competition);
            println!(
                "  {} - {} requests, {} iterations x {} multiplier, concurrency {}",
                competition.name,
                competition.requests.len(),
                settings.iterations,
                settings.multiplier,
                settings.concurrency
            );
        }
    }
    Ok(())
}
