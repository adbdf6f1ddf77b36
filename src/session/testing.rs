//! Scripted [`SessionChannel`] for exercising the allocator and orchestrator
//! without a remote host.

use std::collections::VecDeque;
use std::time::Duration;

use regex::Regex;

use super::channel::{SessionChannel, SessionError};

/// One scripted reply to an `expect` call.
#[derive(Debug, Clone)]
pub enum Reply {
    /// The pattern matches; `expect` returns this captured text.
    Match(String),
    /// The deadline elapses before the pattern appears.
    Timeout,
}

/// What the code under test did to the channel, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    SendLine(String),
    SendIntr,
    Expect(String),
    ExpectEof,
    Close,
}

/// A channel that replays a fixed script of replies and records every call.
pub struct ScriptedChannel {
    replies: VecDeque<Reply>,
    pub calls: Vec<Call>,
}

impl ScriptedChannel {
    pub fn new(replies: Vec<Reply>) -> Self {
        Self {
            replies: replies.into(),
            calls: Vec::new(),
        }
    }

    /// The lines sent so far, for asserting command order.
    pub fn sent_lines(&self) -> Vec<&str> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::SendLine(line) => Some(line.as_str()),
                _ => None,
            })
            .collect()
    }

    fn next_reply(&mut self) -> Reply {
        self.replies
            .pop_front()
            .unwrap_or_else(|| panic!("script exhausted; calls so far: {:?}", self.calls))
    }
}

impl SessionChannel for ScriptedChannel {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.calls.push(Call::SendLine(line.to_string()));
        Ok(())
    }

    fn send_intr(&mut self) -> Result<(), SessionError> {
        self.calls.push(Call::SendIntr);
        Ok(())
    }

    fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String, SessionError> {
        self.calls.push(Call::Expect(pattern.as_str().to_string()));
        match self.next_reply() {
            Reply::Match(before) => Ok(before),
            Reply::Timeout => Err(SessionError::Timeout {
                pattern: pattern.as_str().to_string(),
                waited_secs: timeout.as_secs(),
            }),
        }
    }

    fn expect_eof(&mut self, _timeout: Duration) -> Result<String, SessionError> {
        self.calls.push(Call::ExpectEof);
        Ok(String::new())
    }

    fn close(&mut self) -> Result<(), SessionError> {
        self.calls.push(Call::Close);
        Ok(())
    }
}
