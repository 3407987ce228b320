//! Line framing for device consoles.

use std::io;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};

/// Boxed console byte stream (pipe, serial port, or TCP socket).
pub type ConsoleStream = Box<dyn AsyncRead + Send + Unpin>;

/// Buffered console reader.
pub type ConsoleReader = BufReader<ConsoleStream>;

pub fn console_reader(stream: ConsoleStream) -> ConsoleReader {
    BufReader::new(stream)
}

/// Splits a byte stream into lines.
///
/// Lines end at `\n`; a trailing `\r` is stripped and invalid UTF-8 is
/// replaced. A final unterminated line is still returned at end of stream.
/// [`LineReader::next_line`] is cancel-safe: partial input survives a dropped
/// call and is completed by the next one.
#[derive(Debug)]
pub struct LineReader<R> {
    inner: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Next line, or `None` once the stream is exhausted.
    pub async fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            let n = self.inner.read_until(b'\n', &mut self.buf).await?;
            if n == 0 && self.buf.is_empty() {
                return Ok(None);
            }
            if n == 0 || self.buf.ends_with(b"\n") {
                return Ok(Some(self.take_line()));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.ends_with(b"\n") {
            bytes.pop();
        }
        if bytes.ends_with(b"\r") {
            bytes.pop();
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
