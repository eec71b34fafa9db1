//! Host-side client for the MixOS testing backdoor.
//!
//! A [`Session`] drives request/response cycles over one open stream. A
//! [`Machine`] knows how to reach the backdoor and opens sessions as its
//! [`SessionMode`] requires.

use std::time::Duration;

use mixos_proto::{Dialect, FrameReader};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::Instrument;

use crate::address::ConnectionSpec;
use crate::config::{ClientConfig, SessionMode};
use crate::error::{Error, Result};
use crate::response::{self, CommandOutput};
use crate::transport::{self, Connection};

/// A non-empty `argv` to run on the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRequest(Vec<String>);

impl CommandRequest {
    /// Collects `args`, failing with [`Error::EmptyCommand`] if there are none.
    pub fn new<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let argv: Vec<String> = args.into_iter().map(Into::into).collect();
        if argv.is_empty() {
            return Err(Error::EmptyCommand);
        }
        Ok(Self(argv))
    }

    /// The executable.
    pub fn program(&self) -> &str {
        &self.0[0]
    }

    /// Full `argv`, program name included.
    pub fn argv(&self) -> &[String] {
        &self.0
    }
}

impl IntoIterator for CommandRequest {
    type Item = String;
    type IntoIter = std::vec::IntoIter<String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// One open conversation with the backdoor.
///
/// Only one request is in flight at a time; the stream is released when the
/// session is dropped or [`closed`](Session::close). Any failure other than
/// [`Error::Remote`] leaves the stream at an unknown frame boundary, so every
/// later call fails with [`Error::ConnectionClosed`].
#[derive(Debug)]
pub struct Session<S = Connection> {
    /// Framed stream.
    frames: FrameReader<S>,
    /// Envelope revision.
    dialect: Dialect,
    /// Bound on one request/response cycle.
    timeout: Option<Duration>,
    /// Set once an exchange failed mid-stream.
    broken: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Session<S> {
    /// Wraps an already-open stream.
    pub const fn new(stream: S, dialect: Dialect) -> Self {
        Self {
            frames: FrameReader::new(stream),
            dialect,
            timeout: None,
            broken: false,
        }
    }

    /// Bounds each request/response cycle.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs a command and waits for its result.
    ///
    /// An empty command is rejected before anything is written.
    pub async fn run_command<I, A>(&mut self, command: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let command = CommandRequest::new(command)?;
        if self.broken {
            return Err(Error::ConnectionClosed);
        }
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.exchange(command))
                .await
                .unwrap_or(Err(Error::Timeout(limit))),
            None => self.exchange(command).await,
        };
        if matches!(&result, Err(e) if !e.is_remote()) {
            self.broken = true;
        }
        result
    }

    /// `false` once a failed exchange made the stream unusable.
    pub const fn is_usable(&self) -> bool {
        !self.broken
    }

    /// Writes one request frame, then reads and decodes one response frame.
    async fn exchange(&mut self, command: CommandRequest) -> Result<CommandOutput> {
        tracing::debug!(program = command.program(), "running command");
        let frame = self
            .dialect
            .encode_request(command.0)
            .map_err(Error::from_wire)?;

        let stream = self.frames.get_mut();
        stream.write_all(&frame).await.map_err(Error::from_wire)?;
        stream.flush().await.map_err(Error::from_wire)?;

        let raw = self.frames.decode().await.map_err(Error::from_wire)?;
        tracing::debug!(message = %String::from_utf8_lossy(&raw), "message from machine");
        response::decode_response(&raw, self.dialect)
    }

    /// Shuts down the write side and releases the stream.
    pub async fn close(self) -> Result<()> {
        let mut stream = self.frames.into_inner();
        match stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// A machine under test reachable through its backdoor.
#[derive(Debug)]
pub struct Machine {
    /// Where the backdoor listens.
    spec: ConnectionSpec,
    /// Client settings.
    config: ClientConfig,
    /// Cached session in [`SessionMode::Persistent`].
    session: Option<Session>,
    /// Log scope for everything this machine does.
    span: tracing::Span,
}

impl Machine {
    /// Creates a machine with the default [`ClientConfig`].
    pub fn new(spec: ConnectionSpec) -> Self {
        Self::with_config(spec, ClientConfig::default())
    }

    /// Creates a machine with explicit settings.
    pub fn with_config(spec: ConnectionSpec, config: ClientConfig) -> Self {
        let span = tracing::info_span!("machine", addr = %spec);
        Self {
            spec,
            config,
            session: None,
            span,
        }
    }

    /// Parses `descriptor` and creates a machine for it.
    pub fn from_descriptor(descriptor: &str, config: ClientConfig) -> Result<Self> {
        Ok(Self::with_config(ConnectionSpec::parse(descriptor)?, config))
    }

    /// Where this machine's backdoor listens.
    pub const fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }

    /// Active settings.
    pub const fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// `true` while a session is held open for the next command.
    pub const fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Opens a new session, retrying per the configured policy.
    pub async fn connect(&self) -> Result<Session> {
        let config = self.config;
        async {
            let conn = transport::connect(&self.spec, config.retry, config.timeout).await?;
            tracing::debug!("connected");
            Ok(Session::new(conn, config.dialect).with_timeout(config.timeout))
        }
        .instrument(self.span.clone())
        .await
    }

    /// Runs a command on the machine.
    ///
    /// In [`SessionMode::Persistent`] the first call connects and later
    /// calls reuse the connection; a transport or protocol failure drops it
    /// so the next call reconnects. In [`SessionMode::PerCommand`] every call
    /// connects, runs, and closes (a session handed over by the VM
    /// supervisor serves the first call).
    pub async fn run_command<I, A>(&mut self, command: I) -> Result<CommandOutput>
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        let command = CommandRequest::new(command)?;
        let span = self.span.clone();
        async {
            match self.config.session {
                SessionMode::Persistent => {
                    let session = match self.session.take() {
                        Some(s) => s,
                        None => self.connect().await?,
                    };
                    let session = self.session.insert(session);
                    let result = session.run_command(command).await;
                    if matches!(&result, Err(e) if !e.is_remote()) {
                        tracing::debug!("dropping connection after failure");
                        self.session = None;
                    }
                    result
                }
                SessionMode::PerCommand => {
                    let mut session = match self.session.take() {
                        Some(s) => s,
                        None => self.connect().await?,
                    };
                    let result = session.run_command(command).await;
                    if let Err(e) = session.close().await {
                        tracing::debug!(error = %e, "closing one-shot connection failed");
                    }
                    result
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Hands an already-open session to this machine for its next command.
    pub(crate) fn adopt(&mut self, session: Session) {
        self.session = Some(session);
    }

    /// Closes the open session, if any.
    pub async fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => {
                tracing::debug!(parent: &self.span, "closing connection");
                session.close().await
            }
            None => Ok(()),
        }
    }
}
