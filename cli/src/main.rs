use clap::{Parser, Subcommand};
use std::process;

mod commands;
mod error;
mod output;

use commands::{run, validate};

/// Search Bench - run distributed search benchmarks on an in-process cluster
#[derive(Parser)]
#[command(name = "search-bench")]
#[command(author = "Search Bench Contributors")]
#[command(version)]
#[command(about = "Run distributed search benchmarks on an in-process cluster", long_about = None)]
#[command(propagate_version = true)]
#[command(arg_required_else_help = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a benchmark definition file against a local cluster
    #[command(visible_alias = "r")]
    Run(run::RunArgs),

    /// Validate a benchmark definition file
    #[command(visible_alias = "v")]
    Validate(validate::ValidateArgs),
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    // Handle color output
    if cli.no_color {
        colored::control::set_override(false);
    }

    // Execute command
    let result = match cli.command {
        Commands::Run(args) => run::execute(args, cli.verbose).await,
        Commands::Validate(args) => validate::execute(args, cli.verbose).await,
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(e.exit_code());
    }
}
