//! Console output sinks for supervised VMs.

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

/// Receives console output from a VM, one line at a time.
///
/// Lines arrive without their trailing newline. Any `FnMut(&str)` closure
/// is a sink.
pub trait ConsoleSink: Send + 'static {
    /// Handles one console line.
    fn line(&mut self, line: &str);
}

impl<F: FnMut(&str) + Send + 'static> ConsoleSink for F {
    fn line(&mut self, line: &str) {
        self(line);
    }
}

/// Emits every console line as a `tracing` event with target `mixos::console`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ConsoleSink for TracingSink {
    fn line(&mut self, line: &str) {
        tracing::info!(target: "mixos::console", "{line}");
    }
}

/// Forwards lines from `reader` to `sink` until end-of-stream.
pub(crate) async fn drain<R: AsyncRead + Unpin>(reader: R, mut sink: impl ConsoleSink) {
    let mut reader = BufReader::new(reader);
    let mut raw = Vec::new();
    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw).await {
            Ok(0) => break,
            Ok(_) => sink.line(&decode_line(&raw)),
            Err(e) => {
                tracing::debug!(error = %e, "console read failed");
                break;
            }
        }
    }
    tracing::debug!("console closed");
}

/// Strips the line ending and drops invalid UTF-8 sequences.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    raw.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
