//! Transport connector: opens a byte stream for a [`ConnectionSpec`].

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

use crate::address::ConnectionSpec;
use crate::error::{Error, Result};

/// How often to retry a refused connection.
///
/// Total attempts are `retries + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts made after the first one fails.
    pub retries: u32,
    /// Pause between attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// A single attempt with no retry.
    pub const fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }

    /// `retries` back-to-back attempts with no pause.
    pub const fn immediate(retries: u32) -> Self {
        Self {
            retries,
            delay: Duration::ZERO,
        }
    }

    /// Total number of attempts this policy allows.
    pub const fn attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    /// 10 retries, 250 ms apart.
    fn default() -> Self {
        Self {
            retries: 10,
            delay: Duration::from_millis(250),
        }
    }
}

/// Runs `attempt` until it succeeds or `policy` is exhausted.
///
/// Returns the last error along with the number of attempts made.
pub(crate) async fn with_retry<T, F, Fut>(
    policy: RetryPolicy,
    mut attempt: F,
) -> std::result::Result<T, (u32, io::Error)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut made = 0;
    loop {
        made += 1;
        tracing::debug!(attempt = made, "attempting connection");
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if made < policy.attempts() => {
                tracing::info!(attempt = made, error = %e, "connection failed, retrying");
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
            Err(e) => return Err((made, e)),
        }
    }
}

/// An open stream to the machine under test.
#[derive(Debug)]
#[non_exhaustive]
pub enum Connection {
    /// TCP stream.
    Tcp(TcpStream),
    /// Unix-domain stream.
    #[cfg(unix)]
    Unix(UnixStream),
    /// AF_VSOCK stream.
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockStream),
}

impl Connection {
    /// Opens a stream with a single attempt.
    pub async fn open(spec: &ConnectionSpec) -> io::Result<Self> {
        match spec {
            ConnectionSpec::Inet { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
            #[cfg(unix)]
            ConnectionSpec::UnixPath { path } => Ok(Self::Unix(UnixStream::connect(path).await?)),
            #[cfg(not(unix))]
            ConnectionSpec::UnixPath { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets require a Unix host",
            )),
            #[cfg(target_os = "linux")]
            ConnectionSpec::Vsock { cid, port } => {
                let addr = tokio_vsock::VsockAddr::new(*cid, *port);
                Ok(Self::Vsock(tokio_vsock::VsockStream::connect(addr).await?))
            }
            #[cfg(not(target_os = "linux"))]
            ConnectionSpec::Vsock { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "vsock requires a Linux host",
            )),
        }
    }
}

/// Opens a stream to `spec`, retrying per `retry`.
///
/// With a `timeout`, each attempt is bounded individually.
pub async fn connect(
    spec: &ConnectionSpec,
    retry: RetryPolicy,
    timeout: Option<Duration>,
) -> Result<Connection> {
    with_retry(retry, move || async move {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, Connection::open(spec))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))?,
            None => Connection::open(spec).await,
        }
    })
    .await
    .map_err(|(attempts, source)| Error::ConnectFailed {
        target: spec.to_string(),
        attempts,
        source,
    })
}

/// Delegates a poll method to whichever stream is inside.
macro_rules! delegate {
    ($self:ident, $s:ident => $call:expr) => {
        match $self.get_mut() {
            Connection::Tcp($s) => $call,
            #[cfg(unix)]
            Connection::Unix($s) => $call,
            #[cfg(target_os = "linux")]
            Connection::Vsock($s) => $call,
        }
    };
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_read(cx, buf))
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        delegate!(self, s => Pin::new(s).poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        delegate!(self, s => Pin::new(s).poll_shutdown(cx))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "refused")
    }

    #[tokio::test]
    async fn succeeds_within_budget() {
        let calls = Cell::new(0u32);
        let got = with_retry(RetryPolicy::immediate(10), || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { if n <= 4 { Err(refused()) } else { Ok(n) } }
        })
        .await
        .unwrap();
        assert_eq!(got, 5);
        assert_eq!(calls.get(), 5);
    }

    #[tokio::test]
    async fn always_failing_stops_after_configured_attempts() {
        let calls = Cell::new(0u32);
        let (attempts, err) = with_retry(RetryPolicy::immediate(10), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(refused()) }
        })
        .await
        .unwrap_err();
        assert_eq!(attempts, 11);
        assert_eq!(calls.get(), 11);
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn no_retry_policy_tries_once() {
        let calls = Cell::new(0u32);
        let (attempts, _) = with_retry(RetryPolicy::none(), || {
            calls.set(calls.get() + 1);
            async { Err::<(), _>(refused()) }
        })
        .await
        .unwrap_err();
        assert_eq!(attempts, 1);
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waits_between_attempts() {
        let policy = RetryPolicy {
            retries: 3,
            delay: Duration::from_secs(1),
        };
        let start = tokio::time::Instant::now();
        let _ = with_retry(policy, || async { Err::<(), _>(refused()) }).await;
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connect_reports_attempts_and_target() {
        let dir = tempfile::tempdir().unwrap();
        let spec = ConnectionSpec::UnixPath {
            path: dir.path().join("absent.sock"),
        };
        match connect(&spec, RetryPolicy::immediate(2), None).await {
            Err(Error::ConnectFailed {
                target, attempts, ..
            }) => {
                assert_eq!(attempts, 3);
                assert!(target.ends_with("absent.sock"));
            }
            other => panic!("expected ConnectFailed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connects_over_tcp_and_unix() {
        let tcp = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = tcp.local_addr().unwrap().port();
        let spec = ConnectionSpec::Inet {
            host: "127.0.0.1".into(),
            port,
        };
        let conn = connect(&spec, RetryPolicy::none(), None).await.unwrap();
        assert!(matches!(conn, Connection::Tcp(_)));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backdoor.sock");
        let _unix = tokio::net::UnixListener::bind(&path).unwrap();
        let conn = connect(&ConnectionSpec::UnixPath { path }, RetryPolicy::none(), None)
            .await
            .unwrap();
        assert!(matches!(conn, Connection::Unix(_)));
    }
}
