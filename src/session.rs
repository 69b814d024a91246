use crate::{
    buffer::PushError,
    codec::Codec,
    config::Config,
    error::{ErrorCode, MuxError, Result},
    frame::Frame,
    frame_type::FrameType,
    stream::{Stream, StreamShared},
    stream_id::{Role, StreamId, StreamIdGenerator},
    stream_map::StreamTable,
};
use bytes::Bytes;
use futures::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use std::{
    fmt,
    net::SocketAddr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    sync::oneshot,
    time::Instant,
};
use tokio_util::{codec::Framed, sync::CancellationToken};

/// A frame waiting for the writer task, with an optional acknowledgment.
struct WriteRequest {
    frame: Frame,
    ack: Option<oneshot::Sender<Result<()>>>,
}

/// Resolves once a queued frame has reached the transport.
pub(crate) type WriteAck = oneshot::Receiver<Result<()>>;

#[derive(Debug, Clone, Copy, Default)]
struct Addrs {
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
}

#[derive(Debug, Default)]
struct Outcome {
    local_error: Option<MuxError>,
    remote_error: Option<ErrorCode>,
    remote_debug: Bytes,
    /// GOAWAY the writer flushes on its way out.
    final_frame: Option<Frame>,
}

/// Why a session ended, as returned by [`Session::wait`].
#[derive(Debug, Clone)]
pub struct Termination {
    /// The error that terminated the session locally.
    pub local_error: MuxError,
    /// The code from the peer's last GOAWAY, if it sent one.
    pub remote_error: Option<ErrorCode>,
    /// Debug bytes from the peer's last GOAWAY.
    pub remote_debug: Bytes,
}

/// A multiplexed session that manages multiple streams over a single
/// connection.
///
/// One task reads and dispatches frames, one task writes them; stream
/// operations run on the caller's task. Cloning a `Session` yields another
/// handle to the same session.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Internal session state shared between tasks and stream handles
pub(crate) struct SessionInner {
    config: Config,
    ids: StreamIdGenerator,
    streams: StreamTable,
    /// Sender for outgoing frames (to write_loop)
    write_tx: flume::Sender<WriteRequest>,
    /// Fire-and-forget frames, drained by the writer ahead of `write_tx`
    control_tx: flume::Sender<Frame>,
    /// Peer-opened streams waiting for accept_stream
    accept_tx: flume::Sender<Stream>,
    accept_rx: flume::Receiver<Stream>,
    /// Cancelled when the session starts terminating
    die: CancellationToken,
    /// Cancelled once the writer has flushed its last frame
    closed: CancellationToken,
    last_remote_id: AtomicU32,
    local_go_away: AtomicBool,
    remote_go_away: AtomicBool,
    outcome: Mutex<Outcome>,
    addrs: Addrs,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.ids.role())
            .field("streams", &self.inner.streams.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Session {
    /// Create a session on the initiating side of `transport`.
    pub async fn client<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = Codec::new(&config);
        Self::with_codec(transport, config, Role::Initiator, codec).await
    }

    /// Create a session on the accepting side of `transport`.
    pub async fn server<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let codec = Codec::new(&config);
        Self::with_codec(transport, config, Role::Acceptor, codec).await
    }

    /// Create the initiating side over a TCP connection. The socket's
    /// addresses are reported by [`Session::local_addr`] and
    /// [`Session::remote_addr`].
    pub async fn tcp_client(transport: TcpStream, config: Config) -> Result<Self> {
        let codec = Codec::new(&config);
        let addrs = tcp_addrs(&transport);
        Self::start(transport, config, Role::Initiator, codec, addrs)
    }

    /// Create the accepting side over a TCP connection.
    pub async fn tcp_server(transport: TcpStream, config: Config) -> Result<Self> {
        let codec = Codec::new(&config);
        let addrs = tcp_addrs(&transport);
        Self::start(transport, config, Role::Acceptor, codec, addrs)
    }

    /// Create a session with a caller-supplied codec, e.g. one built with
    /// [`Codec::named`] to trace every frame.
    pub async fn with_codec<T>(
        transport: T,
        config: Config,
        role: Role,
        codec: Codec,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::start(transport, config, role, codec, Addrs::default())
    }

    fn start<T>(
        transport: T,
        config: Config,
        role: Role,
        codec: Codec,
        addrs: Addrs,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;

        let (sink, frames) = Framed::new(transport, codec).split();
        let (write_tx, write_rx) = flume::bounded(config.write_queue_depth);
        let (control_tx, control_rx) = flume::unbounded();
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);

        let inner = Arc::new(SessionInner {
            ids: StreamIdGenerator::new(role),
            streams: StreamTable::new(),
            write_tx,
            control_tx,
            accept_tx,
            accept_rx,
            die: CancellationToken::new(),
            closed: CancellationToken::new(),
            last_remote_id: AtomicU32::new(0),
            local_go_away: AtomicBool::new(false),
            remote_go_away: AtomicBool::new(false),
            outcome: Mutex::new(Outcome::default()),
            addrs,
            config,
        });

        tokio::spawn(read_loop(frames, Arc::clone(&inner)));
        tokio::spawn(write_loop(sink, write_rx, control_rx, Arc::clone(&inner)));
        tracing::debug!(?role, "session started");

        Ok(Session { inner })
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Session { inner }
    }

    /// Open a new outgoing stream.
    ///
    /// Nothing is sent until the stream's first write or close, which
    /// carries SYN.
    pub async fn open_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.remote_go_away.load(Ordering::Acquire) {
            return Err(MuxError::RemoteGoneAway);
        }
        if inner.die.is_cancelled() || inner.local_go_away.load(Ordering::Acquire) {
            return Err(MuxError::SessionClosed);
        }

        let id = inner.ids.next()?;
        let shared = Arc::new(StreamShared::new(id, inner.config.max_window_size));
        inner.register(&shared)?;
        tracing::trace!(stream_id = %id, "opened stream");

        Ok(inner.build_stream(shared))
    }

    /// Accept the next stream opened by the peer.
    pub async fn accept_stream(&self) -> Result<Stream> {
        tokio::select! {
            biased;
            _ = self.inner.die.cancelled() => Err(MuxError::SessionClosed),
            stream = self.inner.accept_rx.recv_async() => {
                stream.map_err(|_| MuxError::SessionClosed)
            }
        }
    }

    /// Send GOAWAY with the last peer stream id processed so far. Streams
    /// already open keep working; new local and peer streams are refused.
    pub async fn go_away(&self, code: ErrorCode, debug: impl Into<Bytes>) -> Result<()> {
        let inner = &self.inner;
        inner.local_go_away.store(true, Ordering::Release);
        let frame = Frame::new_go_away(inner.last_remote_id(), code, debug.into());
        tokio::time::timeout(inner.config.go_away_timeout, inner.write_frame(frame))
            .await
            .unwrap_or(Err(MuxError::Timeout))
    }

    /// Close the session gracefully.
    ///
    /// Sends GOAWAY(NoError), shuts the transport down and fails every
    /// stream with [`MuxError::SessionClosed`]. Calling it again is a no-op.
    pub async fn close(&self) -> Result<()> {
        self.inner.die(ErrorCode::NoError, MuxError::SessionClosed);
        self.inner.closed.cancelled().await;
        Ok(())
    }

    /// Wait for the session to terminate.
    pub async fn wait(&self) -> Termination {
        self.inner.die.cancelled().await;
        self.inner.closed.cancelled().await;
        let outcome = self.inner.lock_outcome();
        Termination {
            local_error: outcome
                .local_error
                .clone()
                .unwrap_or(MuxError::SessionClosed),
            remote_error: outcome.remote_error,
            remote_debug: outcome.remote_debug.clone(),
        }
    }

    /// Check if the session is closed
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.inner.die.is_cancelled()
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.inner.ids.role()
    }

    pub fn num_streams(&self) -> usize {
        self.inner.streams.len()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Local address of the transport, when it was built over a socket.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.addrs.local
    }

    /// Remote address of the transport, when it was built over a socket.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.addrs.remote
    }

    /// Same as [`Session::local_addr`].
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addr()
    }
}

fn tcp_addrs(stream: &TcpStream) -> Addrs {
    Addrs {
        local: stream.local_addr().ok(),
        remote: stream.peer_addr().ok(),
    }
}

impl SessionInner {
    fn lock_outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn last_remote_id(&self) -> StreamId {
        StreamId::new(self.last_remote_id.load(Ordering::Acquire))
    }

    fn register(&self, shared: &Arc<StreamShared>) -> Result<()> {
        self.streams.insert(Arc::clone(shared));
        // die() cancels before draining, so a stream inserted after the
        // drain is caught here
        if self.die.is_cancelled() {
            self.streams.remove(shared.id());
            shared.fail(MuxError::SessionClosed);
            return Err(MuxError::SessionClosed);
        }
        Ok(())
    }

    /// Wraps stream state in a handle, passing it through the configured
    /// stream factory.
    fn build_stream(self: &Arc<Self>, shared: Arc<StreamShared>) -> Stream {
        let stream = Stream::new(shared, Arc::downgrade(self), self.config.max_frame_size);
        match &self.config.stream_factory {
            Some(factory) => factory(stream),
            None => stream,
        }
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.addrs.local
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        self.addrs.remote
    }

    pub(crate) fn remove_stream(&self, id: StreamId) {
        self.streams.remove(id);
    }

    pub(crate) fn finish_if_done(&self, shared: &StreamShared) {
        if shared.is_finished() && self.streams.remove(shared.id()).is_some() {
            tracing::trace!(stream_id = %shared.id(), "stream finished");
        }
    }

    /// Queue a frame and wait until it has been written to the transport.
    pub(crate) async fn write_frame(&self, frame: Frame) -> Result<()> {
        let done = self.enqueue(frame).await?;
        self.written(done).await
    }

    /// Queue a frame for the writer, waiting while the queue is full.
    pub(crate) async fn enqueue(&self, frame: Frame) -> Result<WriteAck> {
        let (ack, done) = oneshot::channel();
        let request = WriteRequest {
            frame,
            ack: Some(ack),
        };
        tokio::select! {
            biased;
            _ = self.die.cancelled() => Err(MuxError::SessionClosed),
            sent = self.write_tx.send_async(request) => {
                sent.map_err(|_| MuxError::SessionClosed)?;
                Ok(done)
            }
        }
    }

    /// Wait for a queued frame to be written. Returns once the writer has
    /// shut down even if the frame was never picked up.
    pub(crate) async fn written(&self, done: WriteAck) -> Result<()> {
        tokio::select! {
            biased;
            result = done => result.unwrap_or(Err(MuxError::SessionClosed)),
            _ = self.closed.cancelled() => Err(MuxError::SessionClosed),
        }
    }

    /// Queue a frame without waiting. Never blocks the caller; frames
    /// submitted this way are written in submission order.
    pub(crate) fn submit(&self, frame: Frame) {
        if !self.closed.is_cancelled() {
            let _ = self.control_tx.send(frame);
        }
    }

    /// Terminate the session. Only the first call has any effect.
    fn die(&self, code: ErrorCode, err: MuxError) {
        {
            let mut outcome = self.lock_outcome();
            if outcome.local_error.is_some() {
                return;
            }
            let debug = match code {
                ErrorCode::NoError => Bytes::new(),
                _ => Bytes::from(err.to_string()),
            };
            outcome.final_frame = Some(Frame::new_go_away(self.last_remote_id(), code, debug));
            outcome.local_error = Some(err.clone());
        }

        match code {
            ErrorCode::NoError => tracing::debug!("session closing"),
            ErrorCode::PeerEof => tracing::debug!("transport closed by peer"),
            _ => tracing::warn!(error = %err, %code, "session terminated"),
        }

        self.local_go_away.store(true, Ordering::Release);
        self.die.cancel();
        for stream in self.streams.drain() {
            stream.fail(MuxError::SessionClosed);
        }
    }

    fn take_final_frame(&self) -> Option<Frame> {
        self.lock_outcome().final_frame.take()
    }

    /// Handle an incoming frame based on its type
    fn handle_frame(self: &Arc<Self>, frame: Frame) -> Result<()> {
        match frame.frame_type {
            FrameType::Data => self.handle_data(frame),
            FrameType::Rst { error_code } => {
                if let Some(stream) = self.streams.remove(frame.stream_id) {
                    tracing::debug!(stream_id = %frame.stream_id, %error_code, "stream reset by peer");
                    stream.reset(MuxError::Reset(error_code));
                }
                Ok(())
            }
            FrameType::WndInc { increment: 0 } => {
                let id = frame.stream_id;
                if let Some(stream) = self.streams.remove(id) {
                    tracing::debug!(stream_id = %id, "zero window increment");
                    stream.reset(MuxError::Protocol(format!(
                        "zero window increment on stream {id}"
                    )));
                    self.submit(Frame::new_rst(id, ErrorCode::ProtocolError));
                }
                Ok(())
            }
            FrameType::WndInc { increment } => {
                if let Some(stream) = self.streams.get(frame.stream_id) {
                    stream.window.increment(increment as usize);
                }
                Ok(())
            }
            FrameType::GoAway {
                last_stream_id,
                error_code,
            } => {
                self.handle_go_away(last_stream_id, error_code, frame.data);
                Ok(())
            }
            FrameType::Unknown(frame_type) => {
                tracing::trace!(frame_type, stream_id = %frame.stream_id, "ignoring unknown frame");
                Ok(())
            }
        }
    }

    fn handle_data(self: &Arc<Self>, frame: Frame) -> Result<()> {
        let id = frame.stream_id;

        if let Some(shared) = self.streams.get(id) {
            if frame.is_syn() {
                return Err(MuxError::Protocol(format!("duplicate SYN for stream {id}")));
            }
            return self.deliver(&shared, frame);
        }

        if !frame.is_syn() {
            tracing::trace!(stream_id = %id, "DATA for unknown stream");
            self.submit(Frame::new_rst(id, ErrorCode::StreamClosed));
            return Ok(());
        }

        self.ids.validate_peer_stream_id(id)?;

        if self.local_go_away.load(Ordering::Acquire) {
            tracing::debug!(stream_id = %id, "refusing stream after GOAWAY");
            self.submit(Frame::new_rst(id, ErrorCode::StreamRefused));
            return Ok(());
        }

        self.last_remote_id.fetch_max(id.get(), Ordering::AcqRel);
        let shared = Arc::new(StreamShared::accepted(id, self.config.max_window_size));
        if self.register(&shared).is_err() {
            return Ok(());
        }
        self.deliver(&shared, frame)?;

        let stream = self.build_stream(Arc::clone(&shared));
        if self.accept_tx.try_send(stream).is_err() {
            tracing::warn!(stream_id = %id, "accept backlog full, refusing stream");
            self.streams.remove(id);
            shared.reset(MuxError::StreamRefused);
            self.submit(Frame::new_rst(id, ErrorCode::StreamRefused));
        }
        Ok(())
    }

    fn deliver(&self, shared: &StreamShared, frame: Frame) -> Result<()> {
        if !frame.data.is_empty() {
            match shared.buffer.push(&frame.data) {
                Ok(()) => {}
                Err(PushError::Closed) => {
                    tracing::debug!(stream_id = %shared.id(), "data after read side closed");
                    self.streams.remove(shared.id());
                    shared.reset(MuxError::StreamClosed);
                    self.submit(Frame::new_rst(shared.id(), ErrorCode::StreamClosed));
                    return Ok(());
                }
                Err(PushError::Full) => {
                    return Err(MuxError::FlowControl(format!(
                        "stream {} overflowed its receive window",
                        shared.id()
                    )));
                }
            }
        }

        if frame.is_fin() {
            shared.mark_fin_received();
            self.finish_if_done(shared);
        }
        Ok(())
    }

    fn handle_go_away(&self, last_stream_id: StreamId, code: ErrorCode, debug: Bytes) {
        tracing::debug!(%last_stream_id, %code, "peer sent GOAWAY");
        self.remote_go_away.store(true, Ordering::Release);
        {
            let mut outcome = self.lock_outcome();
            outcome.remote_error = Some(code);
            outcome.remote_debug = debug;
        }

        // The peer never saw these, they can be retried elsewhere
        let ids = &self.ids;
        for stream in self
            .streams
            .drain_where(|id| ids.is_local(id) && id > last_stream_id)
        {
            stream.fail(MuxError::RemoteGoneAway);
        }
    }
}

/// Background task that reads frames from the transport and dispatches them
async fn read_loop<T>(mut frames: SplitStream<Framed<T, Codec>>, inner: Arc<SessionInner>)
where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = inner.die.cancelled() => return,
            next = frames.next() => next,
        };

        match next {
            Some(Ok(frame)) => {
                if let Err(err) = inner.handle_frame(frame) {
                    inner.die(err.code(), err);
                    return;
                }
            }
            Some(Err(err)) => {
                inner.die(err.code(), err);
                return;
            }
            None => {
                inner.die(ErrorCode::PeerEof, MuxError::PeerEof);
                return;
            }
        }
    }
}

/// Background task that writes frames to the transport
async fn write_loop<T>(
    mut sink: SplitSink<Framed<T, Codec>, Frame>,
    requests: flume::Receiver<WriteRequest>,
    control: flume::Receiver<Frame>,
    inner: Arc<SessionInner>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        let WriteRequest { frame, ack } = tokio::select! {
            biased;
            _ = inner.die.cancelled() => break,
            frame = control.recv_async() => match frame {
                Ok(frame) => WriteRequest { frame, ack: None },
                Err(_) => break,
            },
            request = requests.recv_async() => match request {
                Ok(request) => request,
                Err(_) => break,
            },
        };

        let result = tokio::select! {
            result = sink.send(frame) => result,
            _ = inner.die.cancelled() => Err(MuxError::SessionClosed),
        };
        let failed = result.as_ref().err().cloned();
        if let Some(ack) = ack {
            let _ = ack.send(result);
        }
        if let Some(err) = failed {
            if !inner.die.is_cancelled() {
                tracing::error!(error = %err, "failed to write frame");
                inner.die(err.code(), err);
            }
            break;
        }
    }

    // Flush what is already queued, then the GOAWAY, all within the timeout
    let deadline = Instant::now() + inner.config.go_away_timeout;
    let flush = async {
        while let Ok(frame) = control.try_recv() {
            if sink.send(frame).await.is_err() {
                return;
            }
        }
        while let Ok(WriteRequest { frame, ack }) = requests.try_recv() {
            let result = sink.send(frame).await;
            let failed = result.is_err();
            if let Some(ack) = ack {
                let _ = ack.send(result);
            }
            if failed {
                return;
            }
        }
        if let Some(go_away) = inner.take_final_frame() {
            let _ = sink.send(go_away).await;
        }
    };
    if tokio::time::timeout_at(deadline, flush).await.is_err() {
        tracing::debug!("timed out flushing GOAWAY");
    }
    let _ = tokio::time::timeout_at(deadline, sink.close()).await;

    inner.closed.cancel();
    // Whatever is still queued will never be written
    for request in requests.drain() {
        if let Some(ack) = request.ack {
            let _ = ack.send(Err(MuxError::SessionClosed));
        }
    }
    control.drain().for_each(drop);
}
