//! HTTP/1.1 chunked transfer coding.
//!
//! [`ChunkedWriter`] frames outgoing body data when the length is not known up
//! front; [`read_chunked_body`] decodes an incoming chunked body.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

const CRLF: &[u8] = b"\r\n";

/// Longest size or trailer line accepted by the decoder.
pub(crate) const MAX_LINE: usize = 8 * 1024;

/// Writes each call as one `hex(len) CRLF data CRLF` chunk.
///
/// [`finish`](Self::finish) emits the last-chunk marker followed by the empty
/// trailer section (`0 CRLF CRLF`).
#[derive(Debug)]
pub struct ChunkedWriter<W> {
    wire: W,
}

impl<W: AsyncWrite + Unpin> ChunkedWriter<W> {
    pub fn new(wire: W) -> Self {
        Self { wire }
    }

    /// Frame `data` as a single chunk. Empty input writes nothing.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<usize, Error> {
        if data.is_empty() {
            return Ok(0);
        }
        let head = format!("{:x}\r\n", data.len());
        write_fully(&mut self.wire, head.as_bytes()).await?;
        write_fully(&mut self.wire, data).await?;
        write_fully(&mut self.wire, CRLF).await?;
        Ok(data.len())
    }

    /// Terminate the body.
    pub async fn finish(&mut self) -> Result<(), Error> {
        write_fully(&mut self.wire, b"0\r\n\r\n").await
    }

    pub async fn flush(&mut self) -> io::Result<()> {
        self.wire.flush().await
    }

    pub fn get_mut(&mut self) -> &mut W {
        &mut self.wire
    }

    pub fn into_inner(self) -> W {
        self.wire
    }
}

async fn write_fully<W: AsyncWrite + Unpin>(wire: &mut W, data: &[u8]) -> Result<(), Error> {
    let mut written = 0;
    while written < data.len() {
        let n = wire.write(&data[written..]).await?;
        if n == 0 {
            return Err(Error::ShortWrite {
                written,
                expected: data.len(),
            });
        }
        written += n;
    }
    Ok(())
}

/// Read one CRLF- (or LF-) terminated line, without the terminator.
pub(crate) async fn read_line<R: AsyncBufRead + Unpin>(
    r: &mut R,
    limit: usize,
) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();
    (&mut *r).take(limit as u64 + 1).read_until(b'\n', &mut line).await?;
    if !line.ends_with(b"\n") {
        if line.len() > limit {
            return Err(Error::MalformedBody(format!("line longer than {limit} bytes")));
        }
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
    }
    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(line)
}

/// Decode a chunked body into memory. Chunk extensions are ignored and
/// trailer fields are discarded.
pub async fn read_chunked_body<R: AsyncBufRead + Unpin>(
    r: &mut R,
    limit: usize,
) -> Result<Bytes, Error> {
    let mut body = Vec::new();
    loop {
        let line = read_line(r, MAX_LINE).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            while !read_line(r, MAX_LINE).await?.is_empty() {}
            return Ok(body.into());
        }
        if body.len().saturating_add(size) > limit {
            return Err(Error::BodyTooLarge { limit });
        }
        let start = body.len();
        body.resize(start + size, 0);
        r.read_exact(&mut body[start..]).await?;
        if !read_line(r, 2).await?.is_empty() {
            return Err(Error::MalformedBody("missing CRLF after chunk data".into()));
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, Error> {
    let text = std::str::from_utf8(line)
        .map_err(|_| Error::MalformedBody("chunk size is not ascii".into()))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16)
        .map_err(|_| Error::MalformedBody(format!("invalid chunk size {digits:?}")))
}
