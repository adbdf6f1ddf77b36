pub mod channel;
pub mod pty;
#[cfg(test)]
pub mod testing;

pub use channel::{SessionChannel, SessionError};
pub use pty::{ConnectParams, PtySession};
