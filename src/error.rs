//! Error handling utils.
//!
//! Every fallible operation in this crate returns one of the [`Error`]
//! variants: `io`, `cancelled`, `closed`, `resource`, `protocol` and
//! `internal`.

use std::io;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all error cases produced by the reactor, scheduler, accept
/// server and pipeline executor.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A read/write/accept/connect failed for a reason other than EOF.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The operation's deadline elapsed, or the owning reactor/pipeline was
    /// asked to stop while the fiber was suspended.
    #[error("operation cancelled")]
    Cancelled,

    /// A channel or fiber socket was already closed by the other side.
    #[error("channel or socket closed")]
    Closed,

    /// A kernel or runtime resource was exhausted or unavailable: ring
    /// creation, socket bind, out of file descriptors, submission queue
    /// full for longer than the caller is willing to wait.
    #[error("resource error: {0}")]
    Resource(String),

    /// A frame or record failed to decode.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An invariant the scheduler or reactor relies on was violated, e.g. a
    /// fiber socket was used from a reactor other than the one it is bound
    /// to, or `await_on_all` was called reentrantly from inside a reactor
    /// fiber.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl Error {
    /// `true` for errors that represent an orderly shutdown rather than a
    /// real failure (EOF, stop, close). Callers typically just unwind.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Cancelled | Error::Closed)
            || matches!(self, Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let message = e.to_string();
        match e {
            Error::Io(e) => e,
            Error::Cancelled => io::Error::new(io::ErrorKind::TimedOut, message),
            Error::Closed => io::Error::new(io::ErrorKind::NotConnected, message),
            other => io::Error::other(other.to_string()),
        }
    }
}
