use crate::{
    error::{MuxError, Result},
    session::Session,
    stream::Stream,
};
use std::{
    fmt,
    io,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

/// Application-defined tag written as the first four bytes of a typed
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamType(pub u32);

impl From<u32> for StreamType {
    fn from(raw: u32) -> Self {
        StreamType(raw)
    }
}

impl fmt::Display for StreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A [`Stream`] that announced a [`StreamType`] when it was opened.
#[derive(Debug)]
pub struct TypedStream {
    stream: Stream,
    stream_type: StreamType,
}

impl TypedStream {
    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn into_inner(self) -> Stream {
        self.stream
    }
}

impl Deref for TypedStream {
    type Target = Stream;

    fn deref(&self) -> &Stream {
        &self.stream
    }
}

impl DerefMut for TypedStream {
    fn deref_mut(&mut self) -> &mut Stream {
        &mut self.stream
    }
}

impl AsyncRead for TypedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TypedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

/// Wraps a [`Session`] so that every stream carries a type tag.
#[derive(Debug, Clone)]
pub struct TypedStreamSession {
    session: Session,
}

impl TypedStreamSession {
    pub fn new(session: Session) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn open_typed_stream(&self, stream_type: StreamType) -> Result<TypedStream> {
        let mut stream = self.session.open_stream().await?;
        stream
            .write_all(&stream_type.0.to_be_bytes())
            .await
            .map_err(MuxError::from)?;
        Ok(TypedStream {
            stream,
            stream_type,
        })
    }

    /// Accept the next peer stream and read its tag. Streams that end
    /// before a full tag arrives are closed and skipped.
    pub async fn accept_typed_stream(&self) -> Result<TypedStream> {
        loop {
            let mut stream = self.session.accept_stream().await?;
            let mut tag = [0u8; 4];
            match stream.read_exact(&mut tag).await {
                Ok(_) => {
                    return Ok(TypedStream {
                        stream,
                        stream_type: StreamType(u32::from_be_bytes(tag)),
                    });
                }
                Err(err) => {
                    tracing::debug!(stream_id = %stream.id(), error = %err, "dropping stream without a type tag");
                    let _ = stream.close().await;
                }
            }
        }
    }

    pub async fn close(&self) -> Result<()> {
        self.session.close().await
    }
}
