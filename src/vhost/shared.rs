use bytes::{Buf, BytesMut};
use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

const INITIAL_SNIFF_CAPACITY: usize = 1024;

/// A connection whose first bytes were consumed to find its virtual host
/// name.
///
/// Everything read while sniffing is kept and replayed before any further
/// read reaches the underlying connection, so the consumer sees the byte
/// stream unmodified.
#[derive(Debug)]
pub struct SharedConn<C> {
    conn: C,
    replay: BytesMut,
    host: String,
}

impl<C> SharedConn<C> {
    pub fn new(conn: C) -> Self {
        Self {
            conn,
            replay: BytesMut::with_capacity(INITIAL_SNIFF_CAPACITY),
            host: String::new(),
        }
    }

    /// The virtual host name the connection was routed by.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub(crate) fn set_host(&mut self, host: String) {
        self.host = host;
    }

    /// Bytes read so far that have not been consumed.
    pub fn buffered(&self) -> &[u8] {
        &self.replay
    }

    pub fn get_ref(&self) -> &C {
        &self.conn
    }
}

impl<C: AsyncRead + Unpin> SharedConn<C> {
    /// Reads once from the connection into the replay buffer. Returns 0 at
    /// EOF.
    pub async fn read_more(&mut self) -> io::Result<usize> {
        self.replay.reserve(INITIAL_SNIFF_CAPACITY);
        self.conn.read_buf(&mut self.replay).await
    }

    /// Reads until at least `len` bytes are buffered. Returns false if the
    /// connection ends first.
    pub async fn fill(&mut self, len: usize) -> io::Result<bool> {
        while self.replay.len() < len {
            if self.read_more().await? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for SharedConn<C> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.replay.is_empty() {
            let n = buf.remaining().min(this.replay.len());
            buf.put_slice(&this.replay[..n]);
            this.replay.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.conn).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for SharedConn<C> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_shutdown(cx)
    }
}
