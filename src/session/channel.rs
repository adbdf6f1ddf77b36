use std::time::Duration;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Timed out after {waited_secs}s waiting for {pattern:?}")]
    Timeout { pattern: String, waited_secs: u64 },

    #[error("Session is closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, SessionError::Timeout { .. })
    }
}

/// A line-oriented interactive terminal to a remote process.
///
/// Every blocking operation carries its own deadline; nothing here retries
/// or waits implicitly. The allocator and orchestrator are written against
/// this trait so their control flow can be tested with a scripted channel.
pub trait SessionChannel {
    /// Write one command line, terminated for the remote line discipline.
    fn send_line(&mut self, line: &str) -> Result<(), SessionError>;

    /// Send the interrupt byte (ctrl-C) to the remote process group.
    fn send_intr(&mut self) -> Result<(), SessionError>;

    /// Block until `pattern` matches the accumulated output, consuming
    /// through the end of the match. Returns everything received before
    /// the match began.
    fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String, SessionError>;

    /// Block until the remote process signals end-of-stream, returning any
    /// remaining output.
    fn expect_eof(&mut self, timeout: Duration) -> Result<String, SessionError>;

    /// Gracefully terminate the session. Idempotent.
    fn close(&mut self) -> Result<(), SessionError>;
}
