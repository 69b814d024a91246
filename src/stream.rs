use crate::{
    buffer::InboundBuffer,
    error::{ErrorCode, MuxError, Result},
    frame::Frame,
    session::{Session, SessionInner, WriteAck},
    stream_id::StreamId,
    window::WindowManager,
};
use bytes::Bytes;
use futures::{future::BoxFuture, ready};
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
    task::{Context, Poll},
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep},
};

/// Per-stream state shared between a [`Stream`] handle and the session
/// read task.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: StreamId,
    pub(crate) window: WindowManager,
    pub(crate) buffer: InboundBuffer,
    syn_pending: AtomicBool,
    fin_sent: AtomicBool,
    fin_received: AtomicBool,
}

impl StreamShared {
    /// State for a stream opened locally; its first frame carries SYN.
    pub fn new(id: StreamId, window: usize) -> Self {
        Self {
            id,
            window: WindowManager::new(window),
            buffer: InboundBuffer::new(window),
            syn_pending: AtomicBool::new(true),
            fin_sent: AtomicBool::new(false),
            fin_received: AtomicBool::new(false),
        }
    }

    /// State for a stream the peer announced.
    pub fn accepted(id: StreamId, window: usize) -> Self {
        let shared = Self::new(id, window);
        shared.syn_pending.store(false, Ordering::Relaxed);
        shared
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    fn take_syn(&self) -> bool {
        self.syn_pending.swap(false, Ordering::AcqRel)
    }

    fn restore_syn(&self) {
        self.syn_pending.store(true, Ordering::Release);
    }

    /// Marks the write side finished. Returns false if it already was.
    fn begin_fin(&self) -> bool {
        !self.fin_sent.swap(true, Ordering::AcqRel)
    }

    pub fn mark_fin_received(&self) {
        self.fin_received.store(true, Ordering::Release);
        self.buffer.set_eof();
    }

    pub fn fin_received(&self) -> bool {
        self.fin_received.load(Ordering::Acquire)
    }

    /// Both directions have seen FIN.
    pub fn is_finished(&self) -> bool {
        self.fin_sent.load(Ordering::Acquire) && self.fin_received.load(Ordering::Acquire)
    }

    /// Fails blocked and future operations; buffered bytes stay readable.
    pub fn fail(&self, err: MuxError) {
        self.window.set_error(err.clone());
        self.buffer.set_error(err);
    }

    /// Fails everything at once, discarding unread bytes.
    pub fn reset(&self, err: MuxError) {
        self.fin_sent.store(true, Ordering::Release);
        self.window.set_error(err.clone());
        self.buffer.reset(err);
    }
}

/// One logical full-duplex byte stream inside a [`Session`].
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. Writes block while the
/// peer's window is exhausted; reads return credit to the peer as bytes
/// are delivered. `poll_shutdown` half-closes the stream (see
/// [`Stream::close_write`]). Dropping an unclosed stream closes it.
pub struct Stream {
    shared: Arc<StreamShared>,
    session: Weak<SessionInner>,
    max_frame_size: usize,
    pending_write: Option<BoxFuture<'static, Result<usize>>>,
    pending_shutdown: Option<BoxFuture<'static, Result<()>>>,
    read_deadline: Option<Instant>,
    read_timer: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Instant>,
    closed: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("read_deadline", &self.read_deadline)
            .field("write_deadline", &self.write_deadline)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Stream {
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        session: Weak<SessionInner>,
        max_frame_size: usize,
    ) -> Self {
        Self {
            shared,
            session,
            max_frame_size,
            pending_write: None,
            pending_shutdown: None,
            read_deadline: None,
            read_timer: None,
            write_deadline: None,
            closed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// The session this stream belongs to, if it is still alive.
    pub fn session(&self) -> Option<Session> {
        self.session.upgrade().map(Session::from_inner)
    }

    /// See [`Session::local_addr`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session.upgrade().and_then(|session| session.local_addr())
    }

    /// See [`Session::remote_addr`].
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.session.upgrade().and_then(|session| session.remote_addr())
    }

    /// Sets both the read and the write deadline. `None` clears them.
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
        self.read_timer = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Applies to writes started after this call. The deadline bounds the
    /// wait for window credit and for room in the write queue; a chunk
    /// that was queued in time is reported as written.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Sends FIN. The peer reads EOF once it has drained earlier bytes;
    /// later local writes fail with [`MuxError::StreamClosed`].
    pub async fn close_write(&mut self) -> Result<()> {
        if let Some(pending) = self.pending_write.take() {
            let _ = pending.await;
        }
        send_fin(Arc::clone(&self.shared), self.session.clone()).await
    }

    /// Closes both directions. Reads fail afterwards, and any further data
    /// from the peer is answered with RST(StreamClosed).
    pub async fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.shared.buffer.set_error(MuxError::StreamClosed);
        self.close_write().await
    }

    /// Aborts the stream in both directions with `code`.
    pub async fn reset(&mut self, code: ErrorCode) -> Result<()> {
        self.closed = true;
        self.pending_write = None;
        self.shared.reset(MuxError::Reset(code));
        let session = self.session.upgrade().ok_or(MuxError::SessionClosed)?;
        session.remove_stream(self.shared.id);
        session
            .write_frame(Frame::new_rst(self.shared.id, code))
            .await
    }

    fn poll_pending_write(&mut self, cx: &mut Context<'_>) -> Poll<Result<()>> {
        if let Some(pending) = self.pending_write.as_mut() {
            let result = ready!(pending.as_mut().poll(cx));
            self.pending_write = None;
            result?;
        }
        Poll::Ready(Ok(()))
    }

    fn return_credit(&self, n: usize) {
        if self.shared.fin_received() {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if let Ok(frame) = Frame::new_wnd_inc(self.shared.id, n as u32) {
            session.submit(frame);
        }
    }
}

async fn send_fin(shared: Arc<StreamShared>, session: Weak<SessionInner>) -> Result<()> {
    if !shared.begin_fin() {
        return Ok(());
    }
    shared.window.set_error(MuxError::StreamClosed);
    let session = session.upgrade().ok_or(MuxError::SessionClosed)?;
    let frame = Frame::new_data(shared.id, Bytes::new(), true, shared.take_syn());
    let result = session.write_frame(frame).await;
    session.finish_if_done(&shared);
    result
}

/// Credit and SYN taken for a chunk that has not been queued yet. Both go
/// back to the stream if the chunk is abandoned.
struct Reserved<'a> {
    shared: &'a StreamShared,
    granted: usize,
    syn: bool,
}

impl Reserved<'_> {
    fn commit(mut self) -> usize {
        self.syn = false;
        std::mem::take(&mut self.granted)
    }
}

impl Drop for Reserved<'_> {
    fn drop(&mut self) {
        if self.granted > 0 {
            self.shared.window.increment(self.granted);
        }
        if self.syn {
            self.shared.restore_syn();
        }
    }
}

async fn write_chunk(
    shared: Arc<StreamShared>,
    session: Weak<SessionInner>,
    chunk: Bytes,
    deadline: Option<Instant>,
) -> Result<usize> {
    let session = session.upgrade().ok_or(MuxError::SessionClosed)?;
    let queued = queue_chunk(&shared, &session, chunk);
    let (granted, done) = match deadline {
        Some(at) if at <= Instant::now() => return Err(MuxError::Timeout),
        Some(at) => tokio::time::timeout_at(at, queued)
            .await
            .unwrap_or(Err(MuxError::Timeout))?,
        None => queued.await?,
    };
    session.written(done).await?;
    Ok(granted)
}

async fn queue_chunk(
    shared: &StreamShared,
    session: &SessionInner,
    mut chunk: Bytes,
) -> Result<(usize, WriteAck)> {
    let granted = shared.window.decrement(chunk.len()).await?;
    let reserved = Reserved {
        shared,
        granted,
        syn: shared.take_syn(),
    };
    let frame = Frame::new_data(shared.id, chunk.split_to(granted), false, reserved.syn);
    let done = session.enqueue(frame).await?;
    Ok((reserved.commit(), done))
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        if let Some(deadline) = this.read_deadline {
            if Instant::now() >= deadline {
                return Poll::Ready(Err(MuxError::Timeout.into()));
            }
        }

        match this.shared.buffer.poll_read(cx, buf) {
            Poll::Ready(Ok(n)) => {
                if n > 0 {
                    this.return_credit(n);
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => {
                if let Some(timer) = this.read_timer.as_mut() {
                    if timer.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(MuxError::Timeout.into()));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_write.is_none() {
            if buf.is_empty() {
                return Poll::Ready(Ok(0));
            }
            let len = buf.len().min(this.max_frame_size);
            let chunk = Bytes::copy_from_slice(&buf[..len]);
            this.pending_write = Some(Box::pin(write_chunk(
                Arc::clone(&this.shared),
                this.session.clone(),
                chunk,
                this.write_deadline,
            )));
        }

        let Some(pending) = this.pending_write.as_mut() else {
            return Poll::Ready(Ok(0));
        };
        let result = ready!(pending.as_mut().poll(cx));
        this.pending_write = None;
        Poll::Ready(result.map_err(io::Error::from))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut()
            .poll_pending_write(cx)
            .map_err(io::Error::from)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // A failed in-flight write must not keep the FIN from going out
        let _ = ready!(this.poll_pending_write(cx));

        if this.pending_shutdown.is_none() {
            this.pending_shutdown = Some(Box::pin(send_fin(
                Arc::clone(&this.shared),
                this.session.clone(),
            )));
        }
        let Some(pending) = this.pending_shutdown.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let result = ready!(pending.as_mut().poll(cx));
        this.pending_shutdown = None;
        Poll::Ready(result.map_err(io::Error::from))
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.shared.buffer.set_error(MuxError::StreamClosed);
        let Some(session) = self.session.upgrade() else {
            return;
        };
        if self.shared.take_syn() {
            // Never announced, so the peer has nothing to close
            session.remove_stream(self.shared.id);
            return;
        }
        if self.shared.begin_fin() {
            self.shared.window.set_error(MuxError::StreamClosed);
            let frame = Frame::new_data(self.shared.id, Bytes::new(), true, false);
            session.submit(frame);
        }
        session.finish_if_done(&self.shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_is_taken_once() {
        let shared = StreamShared::new(StreamId::new(1), 1024);
        assert!(shared.take_syn());
        assert!(!shared.take_syn());

        let shared = StreamShared::accepted(StreamId::new(2), 1024);
        assert!(!shared.take_syn());
    }

    #[test]
    fn test_finished_needs_both_directions() {
        let shared = StreamShared::new(StreamId::new(1), 1024);
        assert!(shared.begin_fin());
        assert!(!shared.begin_fin());
        assert!(!shared.is_finished());

        shared.mark_fin_received();
        assert!(shared.is_finished());
        assert!(shared.buffer.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_chunk_returns_credit_and_syn() {
        let shared = StreamShared::new(StreamId::new(1), 1024);

        let granted = shared.window.decrement(100).await.unwrap();
        let reserved = Reserved {
            shared: &shared,
            granted,
            syn: shared.take_syn(),
        };
        drop(reserved);
        assert_eq!(shared.window.available(), 1024);
        assert!(shared.take_syn());

        let granted = shared.window.decrement(100).await.unwrap();
        let reserved = Reserved {
            shared: &shared,
            granted,
            syn: false,
        };
        assert_eq!(reserved.commit(), 100);
        assert_eq!(shared.window.available(), 924);
    }

    #[tokio::test]
    async fn test_reset_fails_writers() {
        let shared = StreamShared::new(StreamId::new(1), 1024);
        shared.reset(MuxError::Reset(ErrorCode::StreamCancelled));
        assert!(matches!(
            shared.window.decrement(1).await,
            Err(MuxError::Reset(ErrorCode::StreamCancelled))
        ));
    }
}
