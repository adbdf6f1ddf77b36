use thiserror::Error;

use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("Connection to {host} failed: {reason}")]
    Connection { host: String, reason: String },

    /// The session stopped responding at a point where its state can no
    /// longer be trusted (prompt timeout after a grant, failed cancel).
    /// Fatal for the current job; the session must be torn down.
    #[error("Session lost: {0}")]
    SessionLost(#[from] SessionError),

    /// Diagnostic output did not carry the tool signature. The allocated
    /// node is unusable and the job is aborted.
    #[error("Malformed diagnostic output: {excerpt:?}")]
    MalformedDiagnostic { excerpt: String },

    #[error("No candidate server granted a reservation (round {round})")]
    CandidatesExhausted { round: u32 },

    #[error("Job queue error: {0}")]
    Queue(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl AllocError {
    /// Whether the batch may proceed to the next job after this failure.
    /// Only a connection failure takes the whole run down.
    pub fn is_fatal_for_run(&self) -> bool {
        matches!(self, AllocError::Connection { .. })
    }
}
