//! Name-based routing of raw connections.
//!
//! A [`VirtualHostMuxer`] accepts connections, reads just enough of each to
//! learn the virtual host name it is addressed to, and hands the connection
//! to the [`Listener`] registered for that name. The bytes consumed while
//! sniffing are replayed by [`SharedConn`].

mod http;
mod shared;
mod tls;

pub use http::{DEFAULT_MAX_HEADER_BYTES, HttpMuxer, HttpSniffer};
pub use shared::SharedConn;
pub use tls::{DEFAULT_MAX_RECORD_BYTES, TlsMuxer, TlsSniffer};

use crate::error::VhostError;
use dashmap::{DashMap, mapref::entry::Entry};
use futures::{Stream, StreamExt, future::BoxFuture};
use std::{
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tokio_util::sync::CancellationToken;

/// Extracts the virtual host name from the first bytes of a connection.
pub trait Sniff<C>: Send + Sync + 'static {
    fn sniff<'a>(&'a self, conn: &'a mut SharedConn<C>) -> BoxFuture<'a, Result<String, VhostError>>;
}

/// A connection that could not be routed, if there was one, and why.
pub type MuxFailure<C> = (Option<SharedConn<C>>, VhostError);

struct Route<C> {
    listener_id: u64,
    tx: flume::Sender<SharedConn<C>>,
}

struct MuxerInner<C> {
    registry: DashMap<String, Route<C>>,
    errors_tx: flume::Sender<MuxFailure<C>>,
    errors_rx: flume::Receiver<MuxFailure<C>>,
    token: CancellationToken,
    mux_timeout: Duration,
    local_addr: Option<SocketAddr>,
    next_listener_id: AtomicU64,
}

impl<C> MuxerInner<C> {
    /// Exact match first, then wildcards replacing the leftmost labels:
    /// `a.b.c`, `*.b.c`, `*.c`.
    fn lookup(&self, name: &str) -> Option<flume::Sender<SharedConn<C>>> {
        if let Some(route) = self.registry.get(name) {
            return Some(route.tx.clone());
        }
        let labels: Vec<&str> = name.split('.').collect();
        for i in 1..labels.len() {
            let wildcard = format!("*.{}", labels[i..].join("."));
            if let Some(route) = self.registry.get(&wildcard) {
                return Some(route.tx.clone());
            }
        }
        None
    }

    async fn report(&self, conn: Option<SharedConn<C>>, err: VhostError) {
        tracing::debug!(error = %err, "connection not routed");
        tokio::select! {
            _ = self.errors_tx.send_async((conn, err)) => {}
            _ = self.token.cancelled() => {}
        }
    }
}

/// Routes incoming connections to listeners by virtual host name.
///
/// Names are matched case-insensitively. A listener registered as
/// `*.example.com` receives connections for any subdomain that has no more
/// specific listener. Connections that cannot be routed are surfaced through
/// [`VirtualHostMuxer::next_error`], which must be drained or routing of
/// further failures stalls.
pub struct VirtualHostMuxer<C> {
    inner: Arc<MuxerInner<C>>,
}

impl<C> Clone for VirtualHostMuxer<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C> fmt::Debug for VirtualHostMuxer<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualHostMuxer")
            .field("local_addr", &self.inner.local_addr)
            .field("listeners", &self.inner.registry.len())
            .field("closed", &self.inner.token.is_cancelled())
            .finish()
    }
}

impl VirtualHostMuxer<TcpStream> {
    /// Bind a TCP listener and route its connections with `sniffer`.
    pub async fn bind_tcp<A, S>(addr: A, sniffer: S, mux_timeout: Duration) -> io::Result<Self>
    where
        A: ToSocketAddrs,
        S: Sniff<TcpStream>,
    {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(addr = %local_addr, "virtual host muxer listening");

        let incoming = futures::stream::unfold(listener, |listener| async move {
            let accepted = listener.accept().await.map(|(conn, _)| conn);
            Some((accepted, listener))
        });
        Ok(Self::spawn(incoming, sniffer, mux_timeout, Some(local_addr)))
    }
}

impl<C> VirtualHostMuxer<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Route connections from `incoming`. `mux_timeout` bounds how long a
    /// connection may take to reveal its name.
    pub fn new<L, S>(incoming: L, sniffer: S, mux_timeout: Duration) -> Self
    where
        L: Stream<Item = io::Result<C>> + Send + 'static,
        S: Sniff<C>,
    {
        Self::spawn(incoming, sniffer, mux_timeout, None)
    }

    fn spawn<L, S>(incoming: L, sniffer: S, mux_timeout: Duration, local_addr: Option<SocketAddr>) -> Self
    where
        L: Stream<Item = io::Result<C>> + Send + 'static,
        S: Sniff<C>,
    {
        let (errors_tx, errors_rx) = flume::bounded(0);
        let inner = Arc::new(MuxerInner {
            registry: DashMap::new(),
            errors_tx,
            errors_rx,
            token: CancellationToken::new(),
            mux_timeout,
            local_addr,
            next_listener_id: AtomicU64::new(1),
        });
        tokio::spawn(accept_loop(incoming, Arc::new(sniffer), Arc::clone(&inner)));
        Self { inner }
    }

    /// Register a listener for `name`, which may start with `*.`.
    pub fn listen(&self, name: &str) -> Result<Listener<C>, VhostError> {
        if self.inner.token.is_cancelled() {
            return Err(VhostError::Closed);
        }
        let name = name.to_lowercase();
        let (tx, rx) = flume::unbounded();
        let listener_id = self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed);

        match self.inner.registry.entry(name.clone()) {
            Entry::Occupied(_) => return Err(VhostError::NameInUse(name)),
            Entry::Vacant(slot) => {
                slot.insert(Route { listener_id, tx });
            }
        }
        tracing::debug!(host = %name, "virtual host registered");

        Ok(Listener {
            name,
            listener_id,
            rx,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Wait for the next connection that could not be routed. Returns
    /// `(None, VhostError::Closed)` once the muxer is closed.
    pub async fn next_error(&self) -> MuxFailure<C> {
        tokio::select! {
            biased;
            _ = self.inner.token.cancelled() => (None, VhostError::Closed),
            failure = self.inner.errors_rx.recv_async() => {
                failure.unwrap_or((None, VhostError::Closed))
            }
        }
    }
}

impl<C> VirtualHostMuxer<C> {
    /// Stop accepting and close every listener.
    pub fn close(&self) {
        self.inner.token.cancel();
        self.inner.registry.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// Address of the bound socket, for muxers created by `bind_tcp`.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }
}

async fn accept_loop<C, L, S>(incoming: L, sniffer: Arc<S>, inner: Arc<MuxerInner<C>>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    L: Stream<Item = io::Result<C>> + Send + 'static,
    S: Sniff<C>,
{
    let mut incoming = Box::pin(incoming);
    loop {
        let next = tokio::select! {
            _ = inner.token.cancelled() => break,
            next = incoming.next() => next,
        };
        match next {
            Some(Ok(conn)) => {
                tokio::spawn(route(conn, Arc::clone(&sniffer), Arc::clone(&inner)));
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "accept failed");
                inner.report(None, VhostError::Io(err)).await;
            }
            None => break,
        }
    }
    tracing::debug!("virtual host muxer stopped accepting");
    inner.token.cancel();
}

async fn route<C, S>(conn: C, sniffer: Arc<S>, inner: Arc<MuxerInner<C>>)
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Sniff<C>,
{
    let mut conn = SharedConn::new(conn);
    let sniffed = tokio::time::timeout(inner.mux_timeout, sniffer.sniff(&mut conn)).await;
    let name = match sniffed {
        Ok(Ok(name)) => name.to_lowercase(),
        Ok(Err(err)) => return inner.report(Some(conn), err).await,
        Err(_) => {
            let err = VhostError::BadRequest(format!(
                "no virtual host name within {:?}",
                inner.mux_timeout
            ));
            return inner.report(Some(conn), err).await;
        }
    };
    conn.set_host(name.clone());

    let Some(tx) = inner.lookup(&name) else {
        return inner.report(Some(conn), VhostError::NotFound(name)).await;
    };
    tracing::trace!(host = %name, "routing connection");

    tokio::select! {
        sent = tx.send_async(conn) => {
            if let Err(flume::SendError(conn)) = sent {
                inner.report(Some(conn), VhostError::NotFound(name)).await;
            }
        }
        _ = inner.token.cancelled() => {}
    }
}

/// Receives the connections routed to one virtual host name. Dropping it
/// unregisters the name.
pub struct Listener<C> {
    name: String,
    listener_id: u64,
    rx: flume::Receiver<SharedConn<C>>,
    inner: Arc<MuxerInner<C>>,
}

impl<C> fmt::Debug for Listener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("name", &self.name)
            .field("pending", &self.rx.len())
            .finish()
    }
}

impl<C> Listener<C> {
    pub async fn accept(&self) -> Result<SharedConn<C>, VhostError> {
        tokio::select! {
            conn = self.rx.recv_async() => conn.map_err(|_| VhostError::Closed),
            _ = self.inner.token.cancelled() => Err(VhostError::Closed),
        }
    }

    /// Unregister the name. A listener registered later under the same
    /// name is left alone.
    pub fn close(&self) {
        let removed = self
            .inner
            .registry
            .remove_if(&self.name, |_, route| route.listener_id == self.listener_id);
        if removed.is_some() {
            tracing::debug!(host = %self.name, "virtual host unregistered");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address of the muxer this listener belongs to.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }
}

impl<C> Drop for Listener<C> {
    fn drop(&mut self) {
        self.close();
    }
}
