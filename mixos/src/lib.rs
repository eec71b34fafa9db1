//! Host-side test harness for MixOS machines.
//!
//! `mixos` talks to the command-execution backdoor that a MixOS test image
//! runs inside the guest: it sends an `argv`, the guest runs it, and the
//! exit status plus captured stdout and stderr come back. The backdoor is
//! reached over TCP, a Unix socket, or AF_VSOCK, and a [`VmBuilder`] can
//! boot the machine under QEMU first.
//!
//! # Quick start: an already running machine
//!
//! ```no_run
//! # async fn demo() -> mixos::Result<()> {
//! use mixos::{ClientConfig, Machine};
//!
//! let mut machine = Machine::from_descriptor("vsock:3:8000", ClientConfig::default())?;
//! let out = machine.run_command(["cat", "/proc/version"]).await?;
//! assert!(out.success());
//! println!("{}", out.stdout_lossy());
//! # Ok(())
//! # }
//! ```
//!
//! Descriptors take one of three forms: `vsock:<cid>:<port>`, an absolute
//! Unix socket path, or `[inet:]<host>:<port>`.

mod address;
mod client;
mod config;
mod console;
mod error;
mod response;
mod transport;
mod vm;

pub use address::ConnectionSpec;
pub use client::{CommandRequest, Machine, Session};
pub use config::{ClientConfig, SessionMode};
pub use console::{ConsoleSink, TracingSink};
pub use error::{Error, Result};
pub use mixos_proto::{Dialect, TerminationCause};
pub use response::{CommandOutput, decode_response};
pub use transport::{Connection, RetryPolicy, connect};
pub use vm::{VmBuilder, VmHandle, VmState};
