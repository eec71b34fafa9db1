//! Protocol message types for host↔backdoor communication.

use std::str::FromStr;
use std::{fmt, io};

use serde::{Deserialize, Serialize};

/// Payload of a run-command request: an executable followed by its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCommand {
    /// `argv`, including the program name.
    pub command: Vec<String>,
}

/// Request object whose single key names the operation.
///
/// Serializes as `{"run_command": {"command": [...]}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Request {
    /// Execute a command on the machine under test.
    RunCommand(RunCommand),
}

/// Which revision of the envelope the backdoor speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Dialect {
    /// `{"run_command": ...}` requests answered by
    /// `{"error": ...}` / `{"result": {"run_command": ...}}`.
    #[default]
    Flat,
    /// Bare `{"command": [...]}` requests answered by
    /// `{"response": {"success": ...}}` / `{"response": {"failure": ...}}`.
    Tagged,
}

impl Dialect {
    /// Encodes a run-command request frame in this dialect's shape.
    pub fn encode_request(self, command: Vec<String>) -> io::Result<Vec<u8>> {
        let payload = RunCommand { command };
        match self {
            Self::Flat => crate::encode(&Request::RunCommand(payload)),
            Self::Tagged => crate::encode(&payload),
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flat => "flat",
            Self::Tagged => "tagged",
        })
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "flat" => Ok(Self::Flat),
            "tagged" => Ok(Self::Tagged),
            _ => Err(format!("unknown protocol dialect: {s}")),
        }
    }
}

/// Captured process output as it appears on the wire.
///
/// Older backdoors send an array of byte values, newer ones a UTF-8 string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireBytes {
    /// Array of integers in `0..=255`.
    Raw(Vec<u8>),
    /// UTF-8 text.
    Text(String),
}

impl WireBytes {
    /// Returns the raw bytes regardless of encoding.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Raw(bytes) => bytes,
            Self::Text(text) => text.into_bytes(),
        }
    }
}

impl Default for WireBytes {
    fn default() -> Self {
        Self::Raw(Vec::new())
    }
}

/// Why a process on the machine under test ended.
///
/// On the wire this is an object with a single key naming the variant,
/// e.g. `{"Signal": 9}`. Zero or several keys are rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TerminationCause {
    /// Normal exit with a status code.
    Exited(i32),
    /// Killed by a signal.
    Signal(i32),
    /// Stopped by a signal.
    Stopped(i32),
    /// The backdoor could not classify the wait status.
    Unknown(i32),
}

impl fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exit_code: {code}"),
            Self::Signal(sig) => write!(f, "signal: {sig}"),
            Self::Stopped(sig) => write!(f, "stopped: {sig}"),
            Self::Unknown(code) => write!(f, "unknown: {code}"),
        }
    }
}

/// Response envelope of the [`Dialect::Flat`] revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlatEnvelope {
    /// Set when the backdoor failed to handle the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Operation result, keyed by operation name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<FlatResult>,
}

/// The `result` object of a [`FlatEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlatResult {
    /// Output of the run-command operation.
    pub run_command: RunCommandOutput,
}

/// Run-command payload of the [`Dialect::Flat`] revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunCommandOutput {
    /// Exit status of the process.
    pub exit_code: i32,
    /// Captured stdout.
    pub stdout: WireBytes,
    /// Captured stderr.
    pub stderr: WireBytes,
}

/// Response envelope of the [`Dialect::Tagged`] revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaggedEnvelope {
    /// Outcome of the request.
    pub response: Outcome,
}

/// Tagged outcome: exactly one of `success` or `failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// The command ran.
    Success(Completion),
    /// The backdoor reported a failure message.
    Failure(String),
}

/// Successful run-command payload of the [`Dialect::Tagged`] revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Completion {
    /// How the process ended.
    pub term: TerminationCause,
    /// Captured stdout.
    pub stdout: WireBytes,
    /// Captured stderr.
    pub stderr: WireBytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_request_shapes() {
        let cmd = vec!["echo".to_owned(), "hi".to_owned()];
        assert_eq!(
            Dialect::Flat.encode_request(cmd.clone()).unwrap(),
            b"{\"run_command\":{\"command\":[\"echo\",\"hi\"]}}\0"
        );
        assert_eq!(
            Dialect::Tagged.encode_request(cmd).unwrap(),
            b"{\"command\":[\"echo\",\"hi\"]}\0"
        );
    }

    #[test]
    fn dialect_parses_case_insensitively() {
        assert_eq!("Flat".parse::<Dialect>(), Ok(Dialect::Flat));
        assert_eq!("tagged".parse::<Dialect>(), Ok(Dialect::Tagged));
        assert!("json".parse::<Dialect>().is_err());
    }

    #[test]
    fn termination_cause_requires_exactly_one_key() {
        let sig: TerminationCause = serde_json::from_str(r#"{"Signal":9}"#).unwrap();
        assert_eq!(sig, TerminationCause::Signal(9));

        assert!(serde_json::from_str::<TerminationCause>("{}").is_err());
        assert!(serde_json::from_str::<TerminationCause>(r#"{"Exited":0,"Signal":9}"#).is_err());
        assert!(serde_json::from_str::<TerminationCause>(r#"{"Crashed":1}"#).is_err());
    }

    #[test]
    fn wire_bytes_accepts_both_encodings() {
        let raw: WireBytes = serde_json::from_str("[104,105]").unwrap();
        let text: WireBytes = serde_json::from_str(r#""hi""#).unwrap();
        assert_eq!(raw.into_bytes(), b"hi");
        assert_eq!(text.into_bytes(), b"hi");

        assert!(serde_json::from_str::<WireBytes>("[256]").is_err());
        assert!(serde_json::from_str::<WireBytes>("12").is_err());
    }

    #[test]
    fn flat_output_rejects_unknown_fields() {
        let json = r#"{"exit_code":0,"stdout":[],"stderr":[],"extra":1}"#;
        assert!(serde_json::from_str::<RunCommandOutput>(json).is_err());
    }

    #[test]
    fn tagged_failure_decodes() {
        let env: TaggedEnvelope =
            serde_json::from_str(r#"{"response":{"failure":"no such file"}}"#).unwrap();
        assert_eq!(env.response, Outcome::Failure("no such file".into()));
    }
}
