mod allocator;
mod cli;
mod config;
mod error;
mod orchestrator;
mod queue;
mod session;
mod ui;
mod validator;
mod workspace;

use anyhow::{Result, bail};
use clap::Parser;
use regex::Regex;

use cli::{Cli, Command};
use config::Config;
use orchestrator::AllocationOrchestrator;
use queue::FileQueue;
use session::SessionChannel;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(threshold) = cli.threshold {
        config.allocation.threshold_mib = threshold;
    }

    match cli.command {
        Command::Run { queue } => run_batch(config, &queue),
        Command::Alloc { directory } => run_single(config, directory.as_deref()),
        Command::Check { file } => check_dump(&config, &file),
    }
}

/// Process every pending job in the queue file.
fn run_batch(config: Config, queue_path: &str) -> Result<()> {
    let orchestrator = AllocationOrchestrator::new(config)?;
    let mut queue = FileQueue::new(queue_path);
    orchestrator.run_batch(&mut queue, || orchestrator.connect_session())?;
    Ok(())
}

/// One ad-hoc allocation, reported and released; no queue involved.
fn run_single(config: Config, directory: Option<&str>) -> Result<()> {
    let orchestrator = AllocationOrchestrator::new(config)?;
    let mut chan = orchestrator.connect_session()?;

    let outcome = (|| {
        let report = orchestrator.allocate(&mut chan, None)?;
        println!(
            "Accepted reservation on {}: {} (round {})",
            report.server, report.sample, report.round
        );

        if let Some(directory) = directory {
            let ws = orchestrator
                .workspace()
                .lookup(orchestrator.allocator(), &mut chan, directory)?;
            match ws.checkpoint {
                Some(name) => println!("Newest checkpoint: {name}"),
                None => println!("No checkpoint found in {directory}"),
            }
        }
        orchestrator.allocator().release(&mut chan)?;
        Ok::<_, error::AllocError>(())
    })();

    chan.close()?;
    outcome?;
    Ok(())
}

/// Offline validation of a captured diagnostic dump.
fn check_dump(config: &Config, path: &str) -> Result<()> {
    let output = std::fs::read_to_string(path)?;
    let pattern = Regex::new(&config.protocol.memory_pattern)?;

    match validator::sample(&output, &config.protocol.diagnostic_signature, &pattern) {
        Some(sample) if sample.is_acceptable(config.allocation.threshold_mib) => {
            println!(
                "{sample} - acceptable (threshold {}MiB)",
                config.allocation.threshold_mib
            );
            Ok(())
        }
        Some(sample) => {
            println!(
                "{sample} - NOT acceptable (threshold {}MiB)",
                config.allocation.threshold_mib
            );
            Ok(())
        }
        None => bail!("diagnostic output is malformed or missing the tool signature"),
    }
}
