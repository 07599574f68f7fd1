mod commands;
mod input;
mod output;

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::process;

use commands::run::RunArgs;
use commands::validate::ValidateArgs;

/// RMBS deal cashflow simulation engine
#[derive(Parser)]
#[command(
    name = "rmbsctl",
    version,
    about = "RMBS deal cashflow simulation engine",
    long_about = "A CLI for loading RMBS deal descriptions, running the cashflow \
                  engine against a collateral cashflow stream, and reporting the \
                  resulting period-by-period snapshot tape."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format
    #[arg(long, default_value = "json", global = true)]
    output: OutputFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Load a deal description and report validation errors without running it
    Validate(ValidateArgs),
    /// Run a deal against a collateral cashflow stream and print the snapshot tape
    Run(RunArgs),
    /// Print version information
    Version,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Csv,
    Minimal,
}

fn main() {
    let cli = Cli::parse();

    let result: Result<serde_json::Value, Box<dyn std::error::Error>> = match cli.command {
        Commands::Validate(args) => commands::validate::run_validate(args),
        Commands::Run(args) => commands::run::run_run(args),
        Commands::Version => {
            println!("rmbsctl {}", env!("CARGO_PKG_VERSION"));
            return;
        }
    };

    match result {
        Ok(value) => {
            output::format_output(&cli.output, &value);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            process::exit(1);
        }
    }
}
