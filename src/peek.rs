use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Error;

pub const DEFAULT_CAPACITY: usize = 500;

/// Reader that records what it hands out so the bytes can be replayed.
///
/// Everything read since the last checkpoint is kept in a buffer of fixed
/// capacity. [`rewind`](Self::rewind) moves the cursor back to the checkpoint
/// so the same bytes are served again; [`forget`](Self::forget) moves the
/// checkpoint forward to the cursor. Once a read no longer fits in the buffer
/// the reader becomes a plain pass-through and `rewind` fails with
/// [`Error::RegretOverflow`] until the next `forget`.
///
/// The proxy uses this to sniff request heads and TLS records without
/// consuming them. Writes are passed through untouched, so a wrapped socket
/// can still be handed to hyper or a TLS acceptor.
#[derive(Debug)]
pub struct PeekableReader<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
    overflow: bool,
}

impl<R> PeekableReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(capacity.min(16 * 1024)),
            pos: 0,
            capacity,
            overflow: false,
        }
    }

    /// Serve the bytes read since the last checkpoint again.
    pub fn rewind(&mut self) -> Result<(), Error> {
        if self.overflow {
            return Err(Error::RegretOverflow {
                capacity: self.capacity,
            });
        }
        self.pos = 0;
        Ok(())
    }

    /// Move the checkpoint to the current position. Bytes already handed out
    /// can no longer be replayed; buffered bytes not yet read are kept.
    pub fn forget(&mut self) {
        self.buf.drain(..self.pos);
        self.pos = 0;
        self.overflow = false;
    }

    pub fn has_overflowed(&self) -> bool {
        self.overflow
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes recorded since the last checkpoint.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.inner
    }

    /// Unwrap the source. Buffered bytes that were not read yet are lost.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn pending(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    fn record(&mut self, fresh: &[u8]) {
        if !self.overflow {
            let room = self.capacity - self.buf.len();
            let keep = room.min(fresh.len());
            self.buf.extend_from_slice(&fresh[..keep]);
            if keep < fresh.len() {
                self.overflow = true;
            }
        }
        self.pos = self.buf.len();
    }
}

impl<R: Read> Read for PeekableReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if !self.pending().is_empty() {
            let n = self.pending().len().min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            return Ok(n);
        }
        let n = self.inner.read(out)?;
        self.record(&out[..n]);
        Ok(n)
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for PeekableReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.pending().is_empty() {
            let n = this.pending().len().min(out.remaining());
            out.put_slice(&this.buf[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        let before = out.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, out))?;
        this.record(&out.filled()[before..]);
        Poll::Ready(Ok(()))
    }
}

impl<R: AsyncWrite + Unpin> AsyncWrite for PeekableReader<R> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}
