//! Decodes response frames into [`CommandOutput`].

use std::borrow::Cow;

use mixos_proto::{Dialect, FlatEnvelope, FlatResult, Outcome, TaggedEnvelope, TerminationCause};

use crate::error::{Error, Result};

/// Output captured from a command executed on the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct CommandOutput {
    /// How the process ended.
    pub termination: TerminationCause,
    /// Stdout bytes.
    pub stdout: Vec<u8>,
    /// Stderr bytes.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// `true` only for a normal exit with status 0.
    pub const fn success(&self) -> bool {
        matches!(self.termination, TerminationCause::Exited(0))
    }

    /// Exit status, if the process exited normally.
    pub const fn exit_code(&self) -> Option<i32> {
        match self.termination {
            TerminationCause::Exited(code) => Some(code),
            _ => None,
        }
    }

    /// Stdout decoded as UTF-8, replacing invalid sequences.
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    /// Stderr decoded as UTF-8, replacing invalid sequences.
    pub fn stderr_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stderr)
    }
}

/// Decodes one response frame in the given dialect.
///
/// An explicit failure from the backdoor becomes [`Error::Remote`]; anything
/// that does not match the envelope becomes [`Error::Protocol`].
pub fn decode_response(bytes: &[u8], dialect: Dialect) -> Result<CommandOutput> {
    match dialect {
        Dialect::Flat => decode_flat(bytes),
        Dialect::Tagged => decode_tagged(bytes),
        other => Err(Error::Protocol(format!("unsupported dialect: {other}"))),
    }
}

/// `{"error": ...}` or `{"result": {"run_command": ...}}`.
fn decode_flat(bytes: &[u8]) -> Result<CommandOutput> {
    let envelope: FlatEnvelope =
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;
    if let Some(message) = envelope.error {
        return Err(Error::Remote(message));
    }
    let FlatResult { run_command } = envelope
        .result
        .ok_or_else(|| Error::Protocol("envelope has neither `error` nor `result`".into()))?;
    Ok(CommandOutput {
        termination: TerminationCause::Exited(run_command.exit_code),
        stdout: run_command.stdout.into_bytes(),
        stderr: run_command.stderr.into_bytes(),
    })
}

/// `{"response": {"success": ...}}` or `{"response": {"failure": ...}}`.
fn decode_tagged(bytes: &[u8]) -> Result<CommandOutput> {
    let envelope: TaggedEnvelope =
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(e.to_string()))?;
    match envelope.response {
        Outcome::Success(done) => Ok(CommandOutput {
            termination: done.term,
            stdout: done.stdout.into_bytes(),
            stderr: done.stderr.into_bytes(),
        }),
        Outcome::Failure(message) => Err(Error::Remote(message)),
    }
}
