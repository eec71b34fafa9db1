//! Error types for mixos operations.

use std::io;
use std::time::Duration;

/// Alias for `Result<T, mixos::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by machine, session, and VM operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The connection descriptor matched none of the accepted forms.
    #[error("invalid connection descriptor {descriptor:?}: {reason}")]
    InvalidDescriptor {
        /// The string that failed to parse.
        descriptor: String,
        /// What was wrong with it.
        reason: &'static str,
    },

    /// Every connection attempt failed.
    #[error("failed to connect to {target} after {attempts} attempt(s)")]
    ConnectFailed {
        /// Display form of the connection spec.
        target: String,
        /// How many attempts were made.
        attempts: u32,
        /// Error from the last attempt.
        #[source]
        source: io::Error,
    },

    /// The peer closed the stream before a full frame arrived.
    #[error("connection closed by machine")]
    ConnectionClosed,

    /// The response was not valid JSON or did not match the envelope.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The backdoor reported that it could not run the command.
    #[error("machine reported failure: {0}")]
    Remote(String),

    /// `run_command` was called with no arguments.
    #[error("empty command")]
    EmptyCommand,

    /// The VM process exited; no further commands can be issued.
    #[error("target terminated ({0})")]
    TargetTerminated(String),

    /// An operation exceeded the configured timeout.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The VM process could not be started.
    #[error("failed to spawn {program}")]
    Spawn {
        /// Program that was being launched.
        program: String,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Any other I/O error on an established connection.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` if the machine ran the request and reported failure,
    /// as opposed to the client failing to talk to it.
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }

    /// Maps an I/O error from the frame codec onto the error taxonomy.
    pub(crate) fn from_wire(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe => Self::ConnectionClosed,
            io::ErrorKind::InvalidData => Self::Protocol(err.to_string()),
            _ => Self::Io(err),
        }
    }
}
