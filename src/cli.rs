//! Command-line interface, clap derive.

use clap::{Parser, Subcommand};

/// Negotiates GPU reservations on a shared cluster so you don't have to
/// babysit the scheduler.
#[derive(Debug, Parser)]
#[command(name = "gpualloc", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the configuration file (default: gpualloc.toml).
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Override the free-memory threshold in MiB.
    #[arg(long, global = true)]
    pub threshold: Option<u64>,

    /// Verbose output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Process every pending job in the queue file.
    Run {
        /// Job queue file (JSON array of job descriptors).
        #[arg(long, default_value = "jobs.json")]
        queue: String,
    },

    /// Acquire a single acceptable reservation without touching the queue.
    Alloc {
        /// Also look up the newest checkpoint in this experiment directory.
        #[arg(long)]
        directory: Option<String>,
    },

    /// Parse a saved diagnostic dump and report whether it would be
    /// accepted.
    Check {
        /// File holding captured diagnostic output.
        file: String,
    },
}
