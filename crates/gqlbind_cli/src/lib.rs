//! gqlbind CLI
//!
//! Command-line driver for the gqlbind runtime.
//!
//! # Usage
//!
//! ```bash
//! # Walk through the binding runtime against a mock server
//! gqlbind demo
//!
//! # Slower server, shorter grace period
//! gqlbind demo --latency-ms 1500 --grace-ms 1000 --todos 20
//!
//! # Show runtime logs
//! gqlbind -v demo
//! ```

pub mod demo;
pub mod fixtures;

use clap::{Parser, Subcommand};
use colored::Colorize;
use gqlbind_runtime::BindError;
use std::time::Duration;

use crate::demo::DemoOptions;

/// gqlbind - cache-backed GraphQL bindings for host components
#[derive(Parser)]
#[command(name = "gqlbind")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress step output
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the todo walkthrough against a mock server
    Demo {
        /// Simulated server latency in milliseconds
        #[arg(long, default_value_t = 500)]
        latency_ms: u64,

        /// Grace period before unused queries are disposed, in milliseconds
        #[arg(long, default_value_t = 5000)]
        grace_ms: u64,

        /// Number of seeded todos
        #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
        todos: u64,
    },

    /// Show version information
    Version,
}

/// Runs the CLI. Returns the process exit code.
pub async fn run(cli: Cli) -> Result<i32, BindError> {
    match cli.command {
        Commands::Demo {
            latency_ms,
            grace_ms,
            todos,
        } => {
            let options = DemoOptions {
                latency: Duration::from_millis(latency_ms),
                grace_period: Duration::from_millis(grace_ms),
                todos: usize::try_from(todos).unwrap_or(usize::MAX),
                quiet: cli.quiet,
            };
            if !cli.quiet {
                println!(
                    "{} {} todos, {}ms latency, {}ms grace period",
                    "Running demo:".green(),
                    options.todos,
                    latency_ms,
                    grace_ms
                );
            }
            demo::run(&options).await?;
            Ok(0)
        }
        Commands::Version => {
            println!("gqlbind {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}
