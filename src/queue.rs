//! The job-queue boundary.
//!
//! The reference deployment reads jobs from a spreadsheet; here the queue is
//! pluggable behind [`JobQueue`] and ships with a JSON file implementation.
//! A job is only picked up while `ready` is set and `done` is not; a job
//! flagged complete is never reprocessed.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AllocError;

/// One pending sampling job, as supplied by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// Experiment directory under the remote workspace root.
    pub directory: String,
    #[serde(default = "default_job_type")]
    pub job_type: String,
    /// Iterative-refinement sampling.
    #[serde(default)]
    pub indi: bool,
    #[serde(default)]
    pub indi_steps: Option<u32>,
    #[serde(default)]
    pub indi_noise: Option<f64>,
    #[serde(default = "default_num_samples")]
    pub num_samples: u32,
    /// Marked by the researcher once the row is fully filled in.
    #[serde(default)]
    pub ready: bool,
    /// Set when the job has been processed; never picked up again.
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

fn default_job_type() -> String {
    "default".to_string()
}

fn default_num_samples() -> u32 {
    1
}

impl JobDescriptor {
    pub fn is_pending(&self) -> bool {
        self.ready && !self.done
    }
}

/// What gets written back for one processed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// The constructed downstream sampling command, absent when no
    /// checkpoint was found to build it from.
    pub command: Option<String>,
    /// Selected checkpoint artifact, `None` when the workspace held no
    /// matching file.
    pub checkpoint: Option<String>,
    pub done: bool,
    pub completed_at: DateTime<Utc>,
}

pub trait JobQueue {
    /// All job rows, processed or not, in queue order.
    fn pull(&mut self) -> Result<Vec<JobDescriptor>, AllocError>;

    /// Record the result for the job at `index` and persist it.
    fn push(&mut self, index: usize, result: &JobResult) -> Result<(), AllocError>;
}

/// JSON-file queue: the whole file is a `Vec<JobDescriptor>`.
pub struct FileQueue {
    path: PathBuf,
}

impl FileQueue {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    fn read_all(&self) -> Result<Vec<JobDescriptor>, AllocError> {
        let contents = std::fs::read_to_string(&self.path)
            .map_err(|e| AllocError::Queue(format!("{}: {e}", self.path.display())))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

impl JobQueue for FileQueue {
    fn pull(&mut self) -> Result<Vec<JobDescriptor>, AllocError> {
        self.read_all()
    }

    fn push(&mut self, index: usize, result: &JobResult) -> Result<(), AllocError> {
        let mut jobs = self.read_all()?;
        let job = jobs
            .get_mut(index)
            .ok_or_else(|| AllocError::Queue(format!("no job at index {index}")))?;
        job.done = result.done;
        job.result = Some(result.clone());
        let contents = serde_json::to_string_pretty(&jobs)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }
}
