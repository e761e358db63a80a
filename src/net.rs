//! Line framing over arbitrary async byte streams.
//!
//! Both protocols are CRLF line based, and the plaintext, TLS and outbound
//! streams all need the same treatment, so the framer is generic over any
//! `AsyncRead`. Splitting happens on LF only; a single trailing CR is
//! stripped here and the protocol layers never see line terminators.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt};

/// Per-stream read buffer size. Logical lines longer than this are handed
/// out truncated at the boundary; the remainder of the wire line shows up
/// as further lines.
pub const READ_BUF_SIZE: usize = 16 * 1024;

/// Reads LF-terminated lines from an async byte stream.
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
    eof: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        LineReader { inner, buf: Vec::new(), eof: false }
    }

    /// Returns the next logical line, without its LF and without a trailing
    /// CR, or `None` once the stream is exhausted.
    ///
    /// Non-UTF-8 bytes are replaced lossily; both protocols are text.
    pub async fn read_line(&mut self) -> io::Result<Option<String>> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.drain(..=pos).collect::<Vec<u8>>();
                line.pop(); // LF
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            // An overlong line is cut at the buffer boundary.
            if self.buf.len() >= READ_BUF_SIZE {
                let line = self.buf.drain(..READ_BUF_SIZE).collect::<Vec<u8>>();
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.eof {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                // Final unterminated line.
                let mut line = std::mem::take(&mut self.buf);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let mut chunk = [0u8; READ_BUF_SIZE];
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                self.eof = true;
            } else {
                self.buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
