//! NUL-terminated JSON frame codec over any async byte stream.
//!
//! Each frame is: `[compact JSON document][0x00]`. A single read may return
//! part of a frame, a whole frame, or several frames; [`FrameReader`] keeps
//! whatever follows a sentinel for the next call.

use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// End-of-message sentinel.
pub const SENTINEL: u8 = 0;

/// Maximum allowed frame payload (16 MiB).
pub const MAX_FRAME: usize = 16 * 1024 * 1024;

/// How much spare capacity is reserved before each read.
const READ_CHUNK: usize = 1 << 16;

/// Serializes `msg` to compact JSON and appends the NUL sentinel.
pub fn encode(msg: &impl Serialize) -> io::Result<Vec<u8>> {
    let mut frame =
        serde_json::to_vec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if frame.contains(&SENTINEL) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message contains a NUL byte",
        ));
    }
    if frame.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 16 MiB limit",
        ));
    }
    frame.push(SENTINEL);
    Ok(frame)
}

/// Encodes `msg` as a frame, writes it to `w` and flushes.
pub async fn send<W: AsyncWrite + Unpin>(w: &mut W, msg: &impl Serialize) -> io::Result<()> {
    let frame = encode(msg)?;
    w.write_all(&frame).await?;
    w.flush().await
}

/// Buffered frame decoder that owns the underlying stream.
///
/// Writes go through [`FrameReader::get_mut`], so one value can drive a
/// full request/response exchange.
#[derive(Debug)]
pub struct FrameReader<S> {
    /// The wrapped stream.
    inner: S,
    /// Bytes read but not yet returned as part of a frame.
    buf: Vec<u8>,
}

impl<S> FrameReader<S> {
    /// Wraps `inner` with an empty buffer.
    pub const fn new(inner: S) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Returns a shared reference to the wrapped stream.
    pub const fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns a mutable reference to the wrapped stream.
    pub const fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Number of buffered bytes that belong to frames not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Unwraps the stream, discarding any buffered bytes.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: AsyncRead + Unpin> FrameReader<S> {
    /// Reads until the next sentinel and returns the bytes before it.
    ///
    /// Only newly arrived bytes are scanned for the sentinel. Fails with
    /// [`io::ErrorKind::UnexpectedEof`] if the stream ends mid-frame and with
    /// [`io::ErrorKind::InvalidData`] once a frame outgrows [`MAX_FRAME`].
    pub async fn decode(&mut self) -> io::Result<Vec<u8>> {
        let mut scanned = 0;
        loop {
            if let Some(pos) = self.buf[scanned..].iter().position(|&b| b == SENTINEL) {
                let end = scanned + pos;
                if end > MAX_FRAME {
                    return Err(oversized());
                }
                let rest = self.buf.split_off(end + 1);
                let mut frame = std::mem::replace(&mut self.buf, rest);
                frame.truncate(end);
                return Ok(frame);
            }
            scanned = self.buf.len();
            if scanned > MAX_FRAME {
                return Err(oversized());
            }

            // Never buffer more than one byte past the limit.
            let room = (MAX_FRAME + 1 - scanned).min(READ_CHUNK);
            self.buf.reserve(room);
            let mut limited = (&mut self.inner).take(room as u64);
            if limited.read_buf(&mut self.buf).await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before end of frame",
                ));
            }
        }
    }
}

/// Error for a frame that outgrew [`MAX_FRAME`].
fn oversized() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, "frame exceeds 16 MiB limit")
}
