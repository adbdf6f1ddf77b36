//! Terminal output: spinners while a job negotiates with the scheduler,
//! colored per-job outcomes, and the batch summary block.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::AllocError;
use crate::orchestrator::{AllocationReport, BatchSummary};

/// Visual progress for one job's allocation attempt.
pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    pub fn start(directory: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.cyan} {msg}")
                .expect("invalid template"),
        );
        pb.set_message(format!("Allocating GPU for {directory}"));
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// A candidate did not grant within the deadline; printed above the
    /// still-ticking spinner.
    pub fn candidate_miss(&self, server: &str, round: u32) {
        self.pb.println(format!(
            "  {} No grant from {server} (round {round}), cancelling request",
            self.yellow.apply_to("↻")
        ));
    }

    /// Reservation accepted; show where and with how much headroom.
    pub fn accepted(&self, report: &AllocationReport) {
        self.pb.finish_and_clear();
        println!(
            "  {} Reservation on {} accepted: {} (round {})",
            self.green.apply_to("✓"),
            report.server,
            report.sample,
            report.round
        );
    }

    /// Job failed. Exhaustion and diagnostic failures read differently so
    /// the researcher can tell a busy cluster from a broken node.
    pub fn failed(&self, err: &AllocError) {
        self.pb.finish_and_clear();
        match err {
            AllocError::CandidatesExhausted { .. } => {
                println!(
                    "  {} No servers available, job could not be completed: {err}",
                    self.red.apply_to("✗")
                );
            }
            AllocError::MalformedDiagnostic { .. } => {
                println!(
                    "  {} Diagnostic failed on the allocated node: {err}",
                    self.red.apply_to("✗")
                );
            }
            _ => {
                println!("  {} Job failed: {err}", self.red.apply_to("✗"));
            }
        }
    }
}

/// Print the end-of-run summary.
pub fn print_summary(summary: &BatchSummary) {
    let bold = Style::new().bold();
    println!();
    println!("{}", bold.apply_to("─── Batch Summary ───"));
    println!("  accepted:  {}", summary.accepted);
    println!("  exhausted: {}", summary.exhausted);
    println!("  failed:    {}", summary.failed);
    println!("  skipped:   {}", summary.skipped);
}
