//! Pseudo-terminal session backed by `portable-pty`.
//!
//! The remote shell is reached through an `ssh` child process spawned on a
//! native pty, so the remote side behaves interactively (password prompt,
//! shell prompts, scheduler banners). A dedicated reader thread drains the
//! pty into a channel; [`PtySession::expect`] consumes chunks from it under
//! a deadline and scans an accumulating buffer for the requested pattern,
//! with expect-style "everything before the match" capture semantics.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use regex::Regex;

use super::channel::{SessionChannel, SessionError};

/// Parameters for opening and authenticating a session.
pub struct ConnectParams<'a> {
    pub host: &'a str,
    pub user: &'a str,
    pub password: &'a str,
    /// Matches the password prompt during login.
    pub password_prompt: &'a Regex,
    /// Matches the shell prompt once authenticated.
    pub prompt: &'a Regex,
    /// Deadline for the whole handshake.
    pub timeout: Duration,
    /// Command sent on graceful close, typically `exit`.
    pub exit_command: &'a str,
    /// How long `close` waits for end-of-stream before killing the child.
    pub close_timeout: Duration,
}

pub struct PtySession {
    writer: Box<dyn Write + Send>,
    chunks: Receiver<Vec<u8>>,
    child: Box<dyn Child + Send + Sync>,
    // The master must outlive the child or the pty is torn down early.
    _master: Box<dyn MasterPty + Send>,
    buffer: String,
    exit_command: String,
    close_timeout: Duration,
    closed: bool,
}

impl PtySession {
    /// Spawn `ssh user@host` on a fresh pty and complete the password
    /// handshake. Any failure before the first shell prompt is a
    /// [`SessionError::Connection`].
    pub fn connect(params: ConnectParams<'_>) -> Result<Self, SessionError> {
        let pty = native_pty_system()
            .openpty(PtySize {
                rows: 40,
                cols: 200,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        let mut cmd = CommandBuilder::new("ssh");
        cmd.arg(format!("{}@{}", params.user, params.host));
        let child = pty
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        drop(pty.slave);

        let mut reader = pty
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        let writer = pty
            .master
            .take_writer()
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        let (tx, chunks) = mpsc::channel();
        thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut session = Self {
            writer,
            chunks,
            child,
            _master: pty.master,
            buffer: String::new(),
            exit_command: params.exit_command.to_string(),
            close_timeout: params.close_timeout,
            closed: false,
        };

        session
            .authenticate(params)
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        Ok(session)
    }

    fn authenticate(&mut self, params: ConnectParams<'_>) -> Result<(), SessionError> {
        self.expect(params.password_prompt, params.timeout)?;
        self.send_line(params.password)?;
        self.expect(params.prompt, params.timeout)?;
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::Closed);
        }
        self.writer.write_all(bytes)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Pull one chunk from the reader thread within `remaining`. `Ok(false)`
    /// means the stream has ended.
    fn pull_chunk(&mut self, remaining: Duration) -> Result<bool, RecvTimeoutError> {
        match self.chunks.recv_timeout(remaining) {
            Ok(chunk) => {
                self.buffer.push_str(&String::from_utf8_lossy(&chunk));
                Ok(true)
            }
            Err(RecvTimeoutError::Disconnected) => Ok(false),
            Err(e @ RecvTimeoutError::Timeout) => Err(e),
        }
    }
}

impl SessionChannel for PtySession {
    fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        let mut bytes = line.as_bytes().to_vec();
        bytes.push(b'\n');
        self.write_all(&bytes)
    }

    fn send_intr(&mut self) -> Result<(), SessionError> {
        // ETX; the pty line discipline delivers SIGINT to the foreground
        // process group.
        self.write_all(&[0x03])
    }

    fn expect(&mut self, pattern: &Regex, timeout: Duration) -> Result<String, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((start, end)) = pattern.find(&self.buffer).map(|m| (m.start(), m.end())) {
                let before = self.buffer[..start].to_string();
                self.buffer.drain(..end);
                return Ok(before);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout {
                    pattern: pattern.as_str().to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
            match self.pull_chunk(remaining) {
                Ok(true) => continue,
                Ok(false) => return Err(SessionError::Closed),
                Err(_) => {
                    return Err(SessionError::Timeout {
                        pattern: pattern.as_str().to_string(),
                        waited_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }

    fn expect_eof(&mut self, timeout: Duration) -> Result<String, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(SessionError::Timeout {
                    pattern: "<EOF>".to_string(),
                    waited_secs: timeout.as_secs(),
                });
            }
            match self.pull_chunk(remaining) {
                Ok(true) => continue,
                Ok(false) => return Ok(std::mem::take(&mut self.buffer)),
                Err(_) => {
                    return Err(SessionError::Timeout {
                        pattern: "<EOF>".to_string(),
                        waited_secs: timeout.as_secs(),
                    });
                }
            }
        }
    }

    fn close(&mut self) -> Result<(), SessionError> {
        if self.closed {
            return Ok(());
        }
        let exit = self.exit_command.clone();
        let close_timeout = self.close_timeout;
        // Errors past this point must not prevent reaching the closed state.
        let _ = self.send_line(&exit);
        if self.expect_eof(close_timeout).is_err() {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
        self.closed = true;
        Ok(())
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
