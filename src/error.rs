//! Error types for the relay core.
//!
//! Per-session failures (`ReadFailure`, `WriteFailure`) are local: they end in
//! the removal of one session and never propagate past the dispatcher. Only a
//! registry invariant violation is fatal to the server.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why a session's read loop stopped.
#[derive(Debug, Error)]
pub enum ReadFailure {
    /// Peer closed the stream cleanly at a line boundary.
    #[error("connection closed by peer")]
    Closed,
    /// Stream ended in the middle of a line.
    #[error("stream ended with {0} bytes of unterminated line")]
    PartialLine(usize),
    /// A line exceeded the configured maximum length.
    #[error("line exceeds {0} bytes")]
    LineTooLong(usize),
    /// A line was not valid UTF-8.
    #[error("line is not valid UTF-8")]
    InvalidUtf8,
    /// No complete line arrived within the idle timeout.
    #[error("idle for more than {0}s")]
    Idle(u64),
    #[error("read error: {0}")]
    Io(#[from] io::Error),
}

/// Why a session's write loop stopped.
#[derive(Debug, Error)]
pub enum WriteFailure {
    /// The outbound queue overflowed under the disconnect policy.
    #[error("outbound queue overflowed ({0} pending)")]
    Overflow(usize),
    /// A single write+flush did not complete in time.
    #[error("write timed out after {0:?}")]
    Timeout(Duration),
    #[error("write error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Accepting a connection failed. Not fatal: the acceptor keeps going.
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Read(#[from] ReadFailure),

    #[error(transparent)]
    Write(#[from] WriteFailure),

    /// The session already failed or was removed and refuses new lines.
    #[error("session is closed")]
    SessionClosed,

    /// The registry is at capacity.
    #[error("registry full ({0} sessions)")]
    RegistryFull(usize),

    /// The registry's single-owner discipline was broken.
    #[error("registry invariant violated: {0}")]
    RegistryInvariant(String),

    /// The dispatcher's control loop has exited.
    #[error("dispatcher is not running")]
    DispatcherGone,
}

pub type Result<T> = std::result::Result<T, RelayError>;
