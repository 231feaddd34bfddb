mod adapters;
mod scenario;

use clap::Parser;
use color_eyre::eyre::Result;
use std::path::PathBuf;

use drybox_core::config::Side;
use drybox_core::errors::DryboxError;
use drybox_core::runner::RunSummary;
use scenario::{Overrides, ScenarioFile};

#[derive(Parser, Debug)]
#[command(author, version, about = "DryBox deterministic peer test bench", long_about = None)]
struct Cli {
    /// Path to the YAML scenario file
    #[arg(short, long)]
    scenario: PathBuf,

    /// Left adapter spec, name[:Class] (overrides the scenario)
    #[arg(long)]
    left: Option<String>,

    /// Right adapter spec, name[:Class] (overrides the scenario)
    #[arg(long)]
    right: Option<String>,

    /// Artifacts directory
    #[arg(short, long, default_value = "out")]
    out: PathBuf,

    /// Logical tick length override in milliseconds
    #[arg(long)]
    tick_ms: Option<u64>,

    /// Master seed override
    #[arg(long)]
    seed: Option<u64>,

    /// Suppress the run summary line on stderr
    #[arg(long)]
    no_ui: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    match execute(&cli) {
        Ok(summary) => {
            if !cli.no_ui {
                eprintln!(
                    "drybox: {} ticks, {} SDUs delivered, {} PDUs dropped, artifacts in {}",
                    summary.ticks,
                    summary.sdus_delivered,
                    summary.pdus_dropped,
                    cli.out.display()
                );
            }
            Ok(())
        }
        Err(error) => {
            eprintln!("drybox: error: {error}");
            std::process::exit(error.exit_code());
        }
    }
}

fn execute(cli: &Cli) -> std::result::Result<RunSummary, DryboxError> {
    let file = ScenarioFile::from_file(&cli.scenario)?;
    let resolved = file.resolve(&Overrides {
        seed: cli.seed,
        tick_ms: cli.tick_ms,
        left_adapter: cli.left.clone(),
        right_adapter: cli.right.clone(),
    })?;

    let left = adapters::build(&resolved, Side::Left)?;
    let right = adapters::build(&resolved, Side::Right)?;

    drybox_core::run(&resolved, left, right, &cli.out)
}
