// Host tooling: unwrap/expect/panic and plain arithmetic are acceptable here.
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(clippy::arithmetic_side_effects, clippy::cast_possible_truncation)]
#![allow(missing_docs)]

mod check;
mod doc;
mod simulate;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Falcon overlay paging development tasks", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the crates under every supported feature combination
    Check,
    /// Run all tests (unit, integration, doc)
    Test {
        /// Run only unit tests
        #[arg(long)]
        unit: bool,
        /// Run only integration tests
        #[arg(long)]
        integration: bool,
    },
    /// Build and optionally open documentation
    Doc {
        /// Open documentation in browser
        #[arg(long)]
        open: bool,
    },
    /// Drive a randomized task workload through the paging system on the
    /// simulated core. Log level via RUST_LOG (default `overlay=info`).
    Simulate {
        /// Scheduling rounds to run
        #[arg(long, default_value_t = 500)]
        rounds: u32,
        /// Use round-robin replacement and instruction misses instead of
        /// LRU task loads only
        #[arg(long)]
        on_demand: bool,
        /// Workload seed
        #[arg(long, default_value_t = 0x5EED)]
        seed: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => check::run(),
        Commands::Test { unit, integration } => test::run(unit, integration),
        Commands::Doc { open } => doc::run(open),
        Commands::Simulate {
            rounds,
            on_demand,
            seed,
        } => simulate::run(rounds, on_demand, seed),
    }
}
