use super::{SharedConn, Sniff, VirtualHostMuxer};
use crate::error::VhostError;
use futures::{Stream, future::BoxFuture};
use std::{io, ops::Deref, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, ToSocketAddrs},
};

pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

const NOT_FOUND: &[u8] = b"HTTP/1.0 404 Not Found\r\nContent-Length: 14\r\n\r\n404 not found\n";
const BAD_REQUEST: &[u8] = b"HTTP/1.0 400 Bad Request\r\nContent-Length: 12\r\n\r\nBad Request\n";
const SERVER_ERROR: &[u8] =
    b"HTTP/1.0 500 Internal Server Error\r\nContent-Length: 22\r\n\r\nInternal Server Error\n";

/// Finds the virtual host of an HTTP/1.x request: the authority of an
/// absolute-form request target, otherwise the `Host` header.
#[derive(Debug, Clone)]
pub struct HttpSniffer {
    max_header_bytes: usize,
}

impl HttpSniffer {
    pub fn new(max_header_bytes: usize) -> Self {
        Self { max_header_bytes }
    }
}

impl Default for HttpSniffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HEADER_BYTES)
    }
}

impl<C> Sniff<C> for HttpSniffer
where
    C: AsyncRead + Unpin + Send + 'static,
{
    fn sniff<'a>(&'a self, conn: &'a mut SharedConn<C>) -> BoxFuture<'a, Result<String, VhostError>> {
        Box::pin(async move {
            loop {
                if let Some(end) = find_header_end(conn.buffered()) {
                    return parse_host(&conn.buffered()[..end]);
                }
                if conn.buffered().len() >= self.max_header_bytes {
                    return Err(VhostError::BadRequest(format!(
                        "request header exceeds {} bytes",
                        self.max_header_bytes
                    )));
                }
                if conn.read_more().await? == 0 {
                    return Err(VhostError::BadRequest(
                        "connection closed before the request header ended".to_string(),
                    ));
                }
            }
        })
    }
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_host(head: &[u8]) -> Result<String, VhostError> {
    let bad = |reason: &str| VhostError::BadRequest(reason.to_string());

    let text = std::str::from_utf8(head).map_err(|_| bad("request header is not UTF-8"))?;
    let mut lines = text.split("\r\n");

    // Request line: GET /path HTTP/1.1
    let request_line = lines.next().ok_or_else(|| bad("empty request"))?;
    let mut parts = request_line.split(' ');
    let (Some(_method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(bad("malformed request line"));
    };
    if !version.starts_with("HTTP/") {
        return Err(bad("malformed request line"));
    }

    let absolute = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));
    if let Some(rest) = absolute {
        let authority = rest.split('/').next().unwrap_or_default();
        if !authority.is_empty() {
            return Ok(authority.to_string());
        }
    }

    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("host") && !value.trim().is_empty() {
                return Ok(value.trim().to_string());
            }
        }
    }

    Err(bad("missing Host header"))
}

/// A [`VirtualHostMuxer`] that routes HTTP connections by `Host`.
pub struct HttpMuxer<C> {
    muxer: VirtualHostMuxer<C>,
}

impl HttpMuxer<TcpStream> {
    pub async fn bind<A: ToSocketAddrs>(addr: A, mux_timeout: Duration) -> io::Result<Self> {
        let muxer = VirtualHostMuxer::bind_tcp(addr, HttpSniffer::default(), mux_timeout).await?;
        Ok(Self { muxer })
    }
}

impl<C> HttpMuxer<C>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new<L>(incoming: L, mux_timeout: Duration) -> Self
    where
        L: Stream<Item = io::Result<C>> + Send + 'static,
    {
        Self {
            muxer: VirtualHostMuxer::new(incoming, HttpSniffer::default(), mux_timeout),
        }
    }

    /// Answers every muxing error with a plain HTTP error response until
    /// the muxer is closed.
    pub async fn handle_errors(&self) {
        loop {
            let (conn, err) = self.muxer.next_error().await;
            if matches!(err, VhostError::Closed) {
                return;
            }
            Self::handle_error(conn, err).await;
        }
    }

    pub async fn handle_error(conn: Option<SharedConn<C>>, err: VhostError) {
        let response = match err {
            VhostError::Closed => return,
            VhostError::NotFound(_) => NOT_FOUND,
            VhostError::BadRequest(_) => BAD_REQUEST,
            VhostError::NameInUse(_) | VhostError::Io(_) => SERVER_ERROR,
        };
        if let Some(mut conn) = conn {
            let _ = conn.write_all(response).await;
            let _ = conn.shutdown().await;
        }
    }
}

impl<C> Deref for HttpMuxer<C> {
    type Target = VirtualHostMuxer<C>;

    fn deref(&self) -> &VirtualHostMuxer<C> {
        &self.muxer
    }
}
