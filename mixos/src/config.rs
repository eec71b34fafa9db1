//! Client configuration.

use std::time::Duration;

use mixos_proto::Dialect;
use serde::{Deserialize, Serialize};

use crate::transport::RetryPolicy;

/// Whether a [`Machine`](crate::Machine) keeps its connection between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum SessionMode {
    /// One connection serves every `run_command` call.
    #[default]
    Persistent,
    /// A fresh connection per command, closed afterwards.
    PerCommand,
}

/// Settings shared by every connection a [`Machine`](crate::Machine) opens.
///
/// Defaults: flat dialect, 10 retries 250 ms apart, persistent session,
/// no timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
#[must_use]
pub struct ClientConfig {
    /// Envelope revision spoken by the backdoor.
    pub dialect: Dialect,
    /// Connect retry policy.
    pub retry: RetryPolicy,
    /// Connection reuse between commands.
    pub session: SessionMode,
    /// Bound on each connect attempt and each request/response cycle.
    pub timeout: Option<Duration>,
}

impl ClientConfig {
    /// Sets the protocol dialect.
    pub const fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Sets the connect retry policy.
    pub const fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the session mode.
    pub const fn session(mut self, mode: SessionMode) -> Self {
        self.session = mode;
        self
    }

    /// Bounds connect attempts and request/response cycles.
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}
