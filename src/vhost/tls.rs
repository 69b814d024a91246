use super::{SharedConn, Sniff, VirtualHostMuxer};
use crate::error::VhostError;
use futures::{Stream, future::BoxFuture};
use std::{io, ops::Deref, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

const RECORD_HEADER_LEN: usize = 5;
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const EXTENSION_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// Largest TLS plaintext record plus its header.
pub const DEFAULT_MAX_RECORD_BYTES: usize = RECORD_HEADER_LEN + (1 << 14);

/// Finds the virtual host of a TLS connection from the server name
/// indication in its ClientHello. Nothing is decrypted or answered.
#[derive(Debug, Clone)]
pub struct TlsSniffer {
    max_record_bytes: usize,
}

impl TlsSniffer {
    pub fn new(max_record_bytes: usize) -> Self {
        Self { max_record_bytes }
    }
}

impl Default for TlsSniffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RECORD_BYTES)
    }
}

impl<C> Sniff<C> for TlsSniffer
where
    C: AsyncRead + Unpin + Send + 'static,
{
    fn sniff<'a>(&'a self, conn: &'a mut SharedConn<C>) -> BoxFuture<'a, Result<String, VhostError>> {
        Box::pin(async move {
            let bad = |reason: &str| VhostError::BadRequest(reason.to_string());

            if !conn.fill(RECORD_HEADER_LEN).await? {
                return Err(bad("connection closed before the TLS record header"));
            }
            let header = &conn.buffered()[..RECORD_HEADER_LEN];
            if header[0] != CONTENT_TYPE_HANDSHAKE {
                return Err(bad("not a TLS handshake record"));
            }
            let record_len = RECORD_HEADER_LEN + u16::from_be_bytes([header[3], header[4]]) as usize;
            if record_len > self.max_record_bytes {
                return Err(bad("TLS record too large"));
            }
            if !conn.fill(record_len).await? {
                return Err(bad("connection closed inside the ClientHello"));
            }

            parse_server_name(&conn.buffered()[RECORD_HEADER_LEN..record_len])
                .ok_or_else(|| bad("ClientHello carries no server name"))
        })
    }
}

fn take<'a>(buf: &mut &'a [u8], len: usize) -> Option<&'a [u8]> {
    if buf.len() < len {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Some(head)
}

fn take_u8_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = take(buf, 1)?[0] as usize;
    take(buf, len)
}

fn take_u16_prefixed<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = take(buf, 2)?;
    take(buf, u16::from_be_bytes([len[0], len[1]]) as usize)
}

/// Extracts the `host_name` entry of the server_name extension from a
/// handshake message.
pub(crate) fn parse_server_name(mut handshake: &[u8]) -> Option<String> {
    let header = take(&mut handshake, 4)?;
    if header[0] != HANDSHAKE_CLIENT_HELLO {
        return None;
    }
    let body_len = u32::from_be_bytes([0, header[1], header[2], header[3]]) as usize;
    let mut hello = take(&mut handshake, body_len)?;

    // legacy_version + random
    take(&mut hello, 2 + 32)?;
    take_u8_prefixed(&mut hello)?; // session id
    take_u16_prefixed(&mut hello)?; // cipher suites
    take_u8_prefixed(&mut hello)?; // compression methods
    let mut extensions = take_u16_prefixed(&mut hello)?;

    while !extensions.is_empty() {
        let ext_type = take(&mut extensions, 2)?;
        let mut ext = take_u16_prefixed(&mut extensions)?;
        if u16::from_be_bytes([ext_type[0], ext_type[1]]) != EXTENSION_SERVER_NAME {
            continue;
        }

        let mut names = take_u16_prefixed(&mut ext)?;
        while !names.is_empty() {
            let name_type = take(&mut names, 1)?[0];
            let name = take_u16_prefixed(&mut names)?;
            if name_type == NAME_TYPE_HOST_NAME {
                return std::str::from_utf8(name).ok().map(str::to_owned);
            }
        }
        return None;
    }
    None
}

/// Drops a trailing `:port` the way listeners name TLS hosts.
fn strip_port(name: &str) -> &str {
    if let Some(rest) = name.strip_prefix('[') {
        return match rest.split_once("]:") {
            Some((host, _port)) => host,
            None => name,
        };
    }
    match name.split_once(':') {
        Some((host, port)) if !port.contains(':') => host,
        _ => name,
    }
}

/// A [`VirtualHostMuxer`] that routes TLS connections by SNI.
pub struct TlsMuxer<C> {
    muxer: VirtualHostMuxer<C>,
}

impl TlsMuxer<TcpStream> {
    pub async fn bind<A: ToSocketAddrs>(addr: A, mux_timeout: Duration) -> io::Result<Self> {
        let muxer = VirtualHostMuxer::bind_tcp(addr, TlsSniffer::default(), mux_timeout).await?;
        Ok(Self { muxer })
    }
}

impl<C> TlsMuxer<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new<L>(incoming: L, mux_timeout: Duration) -> Self
    where
        L: Stream<Item = io::Result<C>> + Send + 'static,
    {
        Self {
            muxer: VirtualHostMuxer::new(incoming, TlsSniffer::default(), mux_timeout),
        }
    }

    /// Registers `name`, ignoring any port since SNI never carries one.
    pub fn listen(&self, name: &str) -> Result<super::Listener<C>, VhostError> {
        self.muxer.listen(strip_port(name))
    }

    /// Closes every connection that failed to route until the muxer is
    /// closed. There is no error response a TLS client would understand.
    pub async fn handle_errors(&self) {
        loop {
            let (conn, err) = self.muxer.next_error().await;
            match conn {
                Some(mut conn) => {
                    tracing::debug!(host = conn.host(), error = %err, "closing unrouted TLS connection");
                    let _ = conn.shutdown().await;
                }
                None if matches!(err, VhostError::Closed) => return,
                None => tracing::warn!(error = %err, "TLS muxer error"),
            }
        }
    }
}

impl<C> Deref for TlsMuxer<C> {
    type Target = VirtualHostMuxer<C>;

    fn deref(&self) -> &VirtualHostMuxer<C> {
        &self.muxer
    }
}
