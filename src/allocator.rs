//! Requesting and cancelling scheduler reservations over a live session.
//!
//! The allocator owns the compiled protocol patterns and the two deadlines
//! that govern scheduler interaction: the long wait for a grant and the
//! shorter wait for a shell prompt. It is generic over [`SessionChannel`]
//! so the retry logic above it can be tested against a scripted channel.

use std::time::Duration;

use regex::Regex;

use crate::config::{AllocationConfig, ProtocolConfig};
use crate::error::AllocError;
use crate::session::{SessionChannel, SessionError};

#[derive(Debug)]
pub struct ResourceAllocator {
    reserve_template: String,
    gpus_per_reservation: u32,
    start_marker: Regex,
    prompt: Regex,
    diagnostic_command: String,
    exit_command: String,
    grant_timeout: Duration,
    prompt_timeout: Duration,
}

impl ResourceAllocator {
    pub fn from_config(
        protocol: &ProtocolConfig,
        allocation: &AllocationConfig,
    ) -> Result<Self, AllocError> {
        // The start marker is a literal banner fragment, not a regex.
        let start_marker = Regex::new(&regex::escape(&protocol.start_marker))
            .map_err(|e| AllocError::Config(format!("start_marker: {e}")))?;
        let prompt = Regex::new(&protocol.prompt_pattern)
            .map_err(|e| AllocError::Config(format!("prompt_pattern: {e}")))?;

        Ok(Self {
            reserve_template: protocol.reserve_command.clone(),
            gpus_per_reservation: protocol.gpus_per_reservation,
            start_marker,
            prompt,
            diagnostic_command: protocol.diagnostic_command.clone(),
            exit_command: protocol.exit_command.clone(),
            grant_timeout: Duration::from_secs(allocation.grant_timeout_secs),
            prompt_timeout: Duration::from_secs(allocation.prompt_timeout_secs),
        })
    }

    /// The reservation request for one candidate server.
    pub fn reserve_command(&self, server: &str) -> String {
        self.reserve_template
            .replace("{server}", server)
            .replace("{gpus}", &self.gpus_per_reservation.to_string())
    }

    /// Request a reservation on `server`.
    ///
    /// `Ok(true)` means the scheduler printed the start marker and the
    /// allocation shell reached its prompt. `Ok(false)` means the grant
    /// never arrived within the deadline; the request may still be pending
    /// remotely and [`cancel`](Self::cancel) must run before the session is
    /// reused. A prompt timeout *after* the marker leaves the session
    /// indeterminate and surfaces as an error.
    pub fn acquire<C: SessionChannel>(
        &self,
        chan: &mut C,
        server: &str,
    ) -> Result<bool, SessionError> {
        chan.send_line(&self.reserve_command(server))?;
        match chan.expect(&self.start_marker, self.grant_timeout) {
            Ok(_) => {}
            Err(e) if e.is_timeout() => return Ok(false),
            Err(e) => return Err(e),
        }
        chan.expect(&self.prompt, self.prompt_timeout)?;
        Ok(true)
    }

    /// Interrupt an in-flight reservation request and wait for the prompt,
    /// restoring the session to a request-ready state.
    pub fn cancel<C: SessionChannel>(&self, chan: &mut C) -> Result<(), SessionError> {
        chan.send_intr()?;
        chan.expect(&self.prompt, self.prompt_timeout)?;
        Ok(())
    }

    /// Leave a granted allocation shell that was rejected during
    /// validation, returning to the login shell prompt.
    pub fn release<C: SessionChannel>(&self, chan: &mut C) -> Result<(), SessionError> {
        chan.send_line(&self.exit_command)?;
        chan.expect(&self.prompt, self.prompt_timeout)?;
        Ok(())
    }

    /// Run one command and capture everything up to the next prompt.
    pub fn run_command<C: SessionChannel>(
        &self,
        chan: &mut C,
        command: &str,
    ) -> Result<String, SessionError> {
        chan.send_line(command)?;
        chan.expect(&self.prompt, self.prompt_timeout)
    }

    /// Run the configured diagnostic command on the allocated node.
    pub fn run_diagnostic<C: SessionChannel>(
        &self,
        chan: &mut C,
    ) -> Result<String, SessionError> {
        chan.send_line(&self.diagnostic_command)?;
        chan.expect(&self.prompt, self.prompt_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::{Call, Reply, ScriptedChannel};

    fn allocator() -> ResourceAllocator {
        ResourceAllocator::from_config(
            &ProtocolConfig::default(),
            &AllocationConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn reserve_command_substitutes_server_and_gpus() {
        let alloc = allocator();
        assert_eq!(
            alloc.reserve_command("cigserver5"),
            r#"bsub -m cigserver5 -gpu "num=1" -Is /bin/bash"#
        );
    }

    #[test]
    fn acquire_grant_waits_for_marker_then_prompt() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![
            Reply::Match("Job <123> is submitted".into()), // start marker
            Reply::Match("banner".into()),                 // allocation shell prompt
        ]);

        let granted = alloc.acquire(&mut chan, "cigserver5").unwrap();
        assert!(granted);
        assert_eq!(
            chan.sent_lines(),
            vec![r#"bsub -m cigserver5 -gpu "num=1" -Is /bin/bash"#]
        );
        // Marker wait precedes the prompt wait.
        let expects: Vec<_> = chan
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Expect(_)))
            .collect();
        assert_eq!(expects.len(), 2);
        assert_eq!(*expects[0], Call::Expect(regex::escape("<<Starting on")));
    }

    #[test]
    fn acquire_marker_timeout_is_not_granted() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![Reply::Timeout]);

        let granted = alloc.acquire(&mut chan, "cigserver3").unwrap();
        assert!(!granted);
        // No prompt wait after a missed grant.
        let expects = chan
            .calls
            .iter()
            .filter(|c| matches!(c, Call::Expect(_)))
            .count();
        assert_eq!(expects, 1);
    }

    #[test]
    fn acquire_prompt_timeout_after_grant_is_an_error() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![
            Reply::Match("granted".into()),
            Reply::Timeout, // prompt never appears
        ]);

        let err = alloc.acquire(&mut chan, "cigserver5").unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn cancel_interrupts_then_waits_for_prompt() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![Reply::Match(String::new())]);

        alloc.cancel(&mut chan).unwrap();
        assert_eq!(chan.calls[0], Call::SendIntr);
        assert!(matches!(chan.calls[1], Call::Expect(_)));
    }

    #[test]
    fn release_exits_the_allocation_shell() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![Reply::Match(String::new())]);

        alloc.release(&mut chan).unwrap();
        assert_eq!(chan.sent_lines(), vec!["exit"]);
    }

    #[test]
    fn run_command_returns_captured_output() {
        let alloc = allocator();
        let mut chan = ScriptedChannel::new(vec![Reply::Match("file_a\nfile_b\n".into())]);

        let out = alloc.run_command(&mut chan, "ls").unwrap();
        assert_eq!(out, "file_a\nfile_b\n");
        assert_eq!(chan.sent_lines(), vec!["ls"]);
    }
}
