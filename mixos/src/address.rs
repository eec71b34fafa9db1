//! Connection descriptor parsing.
//!
//! Accepted forms, checked in order:
//!
//! - `vsock:<cid>:<port>`
//! - an absolute path, used as a Unix-domain socket address
//! - `<host>:<port>` or `[<ipv6>]:<port>`, optionally prefixed with `inet:`

use std::fmt;
use std::path::{MAIN_SEPARATOR, PathBuf};
use std::str::FromStr;

use crate::error::{Error, Result};

/// How to reach the machine under test.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConnectionSpec {
    /// TCP to `host:port`. IPv6 hosts are stored without brackets.
    Inet {
        /// Hostname or IP literal.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// Unix-domain stream socket at a filesystem path.
    UnixPath {
        /// Socket path.
        path: PathBuf,
    },
    /// AF_VSOCK stream socket.
    Vsock {
        /// Context ID of the guest.
        cid: u32,
        /// Vsock port.
        port: u32,
    },
}

impl ConnectionSpec {
    /// Parses a descriptor string.
    pub fn parse(descriptor: &str) -> Result<Self> {
        let invalid = |reason| Error::InvalidDescriptor {
            descriptor: descriptor.to_owned(),
            reason,
        };

        if let Some(rest) = descriptor.strip_prefix("vsock:") {
            let (cid, port) = rest
                .split_once(':')
                .ok_or_else(|| invalid("expected vsock:<cid>:<port>"))?;
            let cid = cid.parse().map_err(|_| invalid("invalid vsock cid"))?;
            let port = port.parse().map_err(|_| invalid("invalid vsock port"))?;
            return Ok(Self::Vsock { cid, port });
        }

        if descriptor.starts_with(MAIN_SEPARATOR) {
            return Ok(Self::UnixPath {
                path: PathBuf::from(descriptor),
            });
        }

        let inet = match descriptor.strip_prefix("inet:") {
            Some(rest) if rest.contains(':') => rest,
            _ => descriptor,
        };
        let (host, port) = inet
            .rsplit_once(':')
            .ok_or_else(|| invalid("expected <host>:<port>"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        let port = port.parse().map_err(|_| invalid("invalid port"))?;
        Ok(Self::Inet {
            host: host.to_owned(),
            port,
        })
    }
}

impl FromStr for ConnectionSpec {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ConnectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inet { host, port } if host.contains(':') => write!(f, "[{host}]:{port}"),
            Self::Inet { host, port } => write!(f, "{host}:{port}"),
            Self::UnixPath { path } => write!(f, "{}", path.display()),
            Self::Vsock { cid, port } => write!(f, "vsock:{cid}:{port}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inet(host: &str, port: u16) -> ConnectionSpec {
        ConnectionSpec::Inet {
            host: host.into(),
            port,
        }
    }

    #[test]
    fn parses_inet_forms() {
        assert_eq!(ConnectionSpec::parse("127.0.0.1:8000").unwrap(), inet("127.0.0.1", 8000));
        assert_eq!(ConnectionSpec::parse("localhost:22").unwrap(), inet("localhost", 22));
        assert_eq!(ConnectionSpec::parse("[::1]:8000").unwrap(), inet("::1", 8000));
        assert_eq!(
            ConnectionSpec::parse("[fe80::1:2]:65535").unwrap(),
            inet("fe80::1:2", 65535)
        );
        assert_eq!(ConnectionSpec::parse("inet:10.0.2.15:80").unwrap(), inet("10.0.2.15", 80));
        assert_eq!(ConnectionSpec::parse("inet:[::1]:80").unwrap(), inet("::1", 80));
    }

    #[test]
    fn parses_vsock() {
        assert_eq!(
            ConnectionSpec::parse("vsock:3:1024").unwrap(),
            ConnectionSpec::Vsock { cid: 3, port: 1024 }
        );
        assert_eq!(
            ConnectionSpec::parse("vsock:4294967295:4294967295").unwrap(),
            ConnectionSpec::Vsock {
                cid: u32::MAX,
                port: u32::MAX
            }
        );
    }

    #[test]
    fn parses_unix_path_verbatim() {
        assert_eq!(
            ConnectionSpec::parse("/run/mixos/backdoor.sock").unwrap(),
            ConnectionSpec::UnixPath {
                path: "/run/mixos/backdoor.sock".into()
            }
        );
        // Colons inside a path are not a port separator.
        assert_eq!(
            ConnectionSpec::parse("/tmp/a:1").unwrap(),
            ConnectionSpec::UnixPath {
                path: "/tmp/a:1".into()
            }
        );
    }

    #[test]
    fn rejects_malformed() {
        for bad in [
            "",
            "localhost",
            "localhost:",
            ":8000",
            "[]:8000",
            "host:65536",
            "host:-1",
            "host:http",
            "vsock:3",
            "vsock:x:1024",
            "vsock:3:",
            "vsock:-1:1024",
        ] {
            assert!(
                matches!(
                    ConnectionSpec::parse(bad),
                    Err(Error::InvalidDescriptor { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn display_roundtrips() {
        for s in ["10.0.0.1:80", "[::1]:8000", "vsock:3:1024", "/tmp/sock"] {
            let spec: ConnectionSpec = s.parse().unwrap();
            assert_eq!(spec.to_string(), s);
        }
    }
}
