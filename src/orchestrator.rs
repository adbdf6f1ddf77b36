//! The allocation retry state machine and the batch driver built on it.
//!
//! One allocation walks the candidate list in priority order until the
//! scheduler grants a reservation whose device passes the memory check.
//! A grant that fails validation is released and the whole list is retried
//! from the top; a request that is never granted is interrupted before the
//! next candidate is tried. The batch driver runs this machine once per
//! pending job on a fresh authenticated session and records results back
//! into the job queue.

use std::fmt;
use std::time::Duration;

use chrono::Utc;
use regex::Regex;

use crate::allocator::ResourceAllocator;
use crate::config::Config;
use crate::error::AllocError;
use crate::queue::{JobDescriptor, JobQueue, JobResult};
use crate::session::{ConnectParams, PtySession, SessionChannel};
use crate::ui::{self, JobProgress};
use crate::validator::{self, MemorySample};
use crate::workspace::Workspace;

/// States of one allocation run. Connection and authentication happen
/// before the machine starts; a connect failure means no candidate is ever
/// tried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocState {
    /// Requesting a reservation on candidate `i`.
    TryCandidate(usize),
    /// A grant on candidate `i` is being probed with the diagnostic tool.
    Validating(usize),
    /// The grant on candidate `i` was rejected; release it and restart the
    /// candidate list.
    CancelAndAdvance(usize),
    Accepted,
    Exhausted,
}

impl fmt::Display for AllocState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocState::TryCandidate(i) => write!(f, "TRY_CANDIDATE({i})"),
            AllocState::Validating(i) => write!(f, "VALIDATING({i})"),
            AllocState::CancelAndAdvance(i) => write!(f, "CANCEL_AND_ADVANCE({i})"),
            AllocState::Accepted => write!(f, "ACCEPTED"),
            AllocState::Exhausted => write!(f, "EXHAUSTED"),
        }
    }
}

/// Outcome of a successful allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationReport {
    /// Candidate that granted the accepted reservation.
    pub server: String,
    pub sample: MemorySample,
    /// 1-based round in which the reservation was accepted.
    pub round: u32,
    pub state_history: Vec<AllocState>,
}

/// Per-run counters reported at exit.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub accepted: u32,
    /// Jobs for which no candidate granted a reservation.
    pub exhausted: u32,
    /// Jobs aborted by a session or diagnostic failure.
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug)]
pub struct AllocationOrchestrator {
    allocator: ResourceAllocator,
    workspace: Workspace,
    candidates: Vec<String>,
    threshold_mib: u64,
    max_rounds: u32,
    continue_on_exhaustion: bool,
    diagnostic_signature: String,
    memory_pattern: Regex,
    password_prompt: Regex,
    prompt: Regex,
    config: Config,
}

impl AllocationOrchestrator {
    pub fn new(config: Config) -> Result<Self, AllocError> {
        if config.allocation.candidates.is_empty() {
            return Err(AllocError::Config(
                "allocation.candidates must not be empty".to_string(),
            ));
        }
        let allocator = ResourceAllocator::from_config(&config.protocol, &config.allocation)?;
        let workspace = Workspace::from_config(&config.workspace)?;
        let memory_pattern = Regex::new(&config.protocol.memory_pattern)
            .map_err(|e| AllocError::Config(format!("memory_pattern: {e}")))?;
        let password_prompt = Regex::new(&config.protocol.password_prompt)
            .map_err(|e| AllocError::Config(format!("password_prompt: {e}")))?;
        let prompt = Regex::new(&config.protocol.prompt_pattern)
            .map_err(|e| AllocError::Config(format!("prompt_pattern: {e}")))?;

        Ok(Self {
            allocator,
            workspace,
            candidates: config.allocation.candidates.clone(),
            threshold_mib: config.allocation.threshold_mib,
            max_rounds: config.allocation.max_rounds,
            continue_on_exhaustion: config.allocation.continue_on_exhaustion,
            diagnostic_signature: config.protocol.diagnostic_signature.clone(),
            memory_pattern,
            password_prompt,
            prompt,
            config,
        })
    }

    pub fn allocator(&self) -> &ResourceAllocator {
        &self.allocator
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Open a fresh authenticated session to the login host.
    pub fn connect_session(&self) -> Result<PtySession, AllocError> {
        let password = self
            .config
            .password()
            .map_err(|e| AllocError::Config(e.to_string()))?;
        PtySession::connect(ConnectParams {
            host: &self.config.connection.host,
            user: &self.config.connection.user,
            password: &password,
            password_prompt: &self.password_prompt,
            prompt: &self.prompt,
            timeout: Duration::from_secs(self.config.connection.login_timeout_secs),
            exit_command: &self.config.protocol.exit_command,
            close_timeout: Duration::from_secs(self.config.connection.close_timeout_secs),
        })
        .map_err(|e| AllocError::Connection {
            host: self.config.connection.host.clone(),
            reason: e.to_string(),
        })
    }

    /// Drive the state machine until a reservation is accepted or the
    /// candidate list is exhausted.
    ///
    /// Invariants upheld here: candidates within a round are tried strictly
    /// in priority order; every ungranted request is interrupted before the
    /// next one is sent; every rejected grant is released before the list
    /// restarts; at most one reservation is ever in flight.
    pub fn allocate<C: SessionChannel>(
        &self,
        chan: &mut C,
        progress: Option<&JobProgress>,
    ) -> Result<AllocationReport, AllocError> {
        let mut history = Vec::new();
        let mut round: u32 = 1;
        let mut state = AllocState::TryCandidate(0);

        loop {
            history.push(state);
            match state {
                AllocState::TryCandidate(i) => {
                    let server = &self.candidates[i];
                    if self.allocator.acquire(chan, server)? {
                        state = AllocState::Validating(i);
                    } else {
                        if let Some(progress) = progress {
                            progress.candidate_miss(server, round);
                        }
                        // Request may still be pending on the scheduler side.
                        self.allocator.cancel(chan)?;
                        state = if i + 1 < self.candidates.len() {
                            AllocState::TryCandidate(i + 1)
                        } else {
                            AllocState::Exhausted
                        };
                    }
                }
                AllocState::Validating(i) => {
                    let output = self.allocator.run_diagnostic(chan)?;
                    let Some(sample) = validator::sample(
                        &output,
                        &self.diagnostic_signature,
                        &self.memory_pattern,
                    ) else {
                        return Err(AllocError::MalformedDiagnostic {
                            excerpt: excerpt(&output),
                        });
                    };
                    if sample.is_acceptable(self.threshold_mib) {
                        history.push(AllocState::Accepted);
                        return Ok(AllocationReport {
                            server: self.candidates[i].clone(),
                            sample,
                            round,
                            state_history: history,
                        });
                    }
                    state = AllocState::CancelAndAdvance(i);
                }
                AllocState::CancelAndAdvance(_) => {
                    // The grant is real but unsatisfactory; leave its shell
                    // before requesting again.
                    self.allocator.release(chan)?;
                    if round >= self.max_rounds {
                        return Err(AllocError::CandidatesExhausted { round });
                    }
                    round += 1;
                    state = AllocState::TryCandidate(0);
                }
                AllocState::Exhausted => {
                    return Err(AllocError::CandidatesExhausted { round });
                }
                AllocState::Accepted => unreachable!("accepted is returned from Validating"),
            }
        }
    }

    /// Allocate for one job, then look up its workspace and build the
    /// downstream command. On success the session is back at the login
    /// shell prompt.
    pub fn process_job<C: SessionChannel>(
        &self,
        chan: &mut C,
        job: &JobDescriptor,
        progress: Option<&JobProgress>,
    ) -> Result<(AllocationReport, JobResult), AllocError> {
        let report = self.allocate(chan, progress)?;

        let ws = self
            .workspace
            .lookup(&self.allocator, chan, &job.directory)?;
        let command = ws
            .model_path
            .as_deref()
            .map(|path| self.workspace.build_sample_command(job, path));

        // Leave the allocation shell so the session ends at the login prompt.
        self.allocator.release(chan)?;

        let result = JobResult {
            command,
            checkpoint: ws.checkpoint,
            done: true,
            completed_at: Utc::now(),
        };
        Ok((report, result))
    }

    /// Process every pending job in the queue, one fresh session per job.
    ///
    /// `connect` opens an authenticated session; a connection failure aborts
    /// the whole run. Job-level failures are recorded and, except for
    /// exhaustion with `continue_on_exhaustion` disabled, the run moves on
    /// to the next job. Every session reaches `close` on every path.
    pub fn run_batch<C, F>(
        &self,
        queue: &mut dyn JobQueue,
        mut connect: F,
    ) -> Result<BatchSummary, AllocError>
    where
        C: SessionChannel,
        F: FnMut() -> Result<C, AllocError>,
    {
        let jobs = queue.pull()?;
        let mut summary = BatchSummary::default();

        for (index, job) in jobs.iter().enumerate() {
            if !job.is_pending() {
                summary.skipped += 1;
                continue;
            }

            let progress = JobProgress::start(&job.directory);
            let mut chan = connect()?;

            match self.process_job(&mut chan, job, Some(&progress)) {
                Ok((report, result)) => {
                    let _ = chan.close();
                    queue.push(index, &result)?;
                    progress.accepted(&report);
                    summary.accepted += 1;
                }
                Err(err) => {
                    let _ = chan.close();
                    progress.failed(&err);
                    match &err {
                        AllocError::CandidatesExhausted { .. } => {
                            summary.exhausted += 1;
                            if !self.continue_on_exhaustion {
                                return Err(err);
                            }
                        }
                        _ if err.is_fatal_for_run() => return Err(err),
                        _ => summary.failed += 1,
                    }
                }
            }
        }

        ui::print_summary(&summary);
        Ok(summary)
    }
}

/// First line of diagnostic output, bounded, for error reporting.
fn excerpt(output: &str) -> String {
    let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    line.chars().take(120).collect()
}
