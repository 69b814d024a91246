use std::{error::Error as StdError, fmt, io, sync::Arc};
use thiserror::Error;

/// Convenient type alias for `Result<T, MuxError>`.
pub type Result<T> = std::result::Result<T, MuxError>;

/// Error codes carried on the wire by RST and GOAWAY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0,
    ProtocolError = 1,
    InternalError = 2,
    FlowControlError = 3,
    StreamClosed = 4,
    StreamRefused = 5,
    StreamCancelled = 6,
    StreamReset = 7,
    FrameSizeError = 8,
    AcceptQueueFull = 9,
    EnhanceYourCalm = 10,
    RemoteGoneAway = 11,
    StreamsExhausted = 12,
    WriteTimeout = 13,
    SessionClosed = 14,
    PeerEof = 15,
    /// Any code this crate does not know about.
    ErrorUnknown = 0xFF,
}

impl ErrorCode {
    pub fn from_u32(code: u32) -> Self {
        match code {
            0 => ErrorCode::NoError,
            1 => ErrorCode::ProtocolError,
            2 => ErrorCode::InternalError,
            3 => ErrorCode::FlowControlError,
            4 => ErrorCode::StreamClosed,
            5 => ErrorCode::StreamRefused,
            6 => ErrorCode::StreamCancelled,
            7 => ErrorCode::StreamReset,
            8 => ErrorCode::FrameSizeError,
            9 => ErrorCode::AcceptQueueFull,
            10 => ErrorCode::EnhanceYourCalm,
            11 => ErrorCode::RemoteGoneAway,
            12 => ErrorCode::StreamsExhausted,
            13 => ErrorCode::WriteTimeout,
            14 => ErrorCode::SessionClosed,
            15 => ErrorCode::PeerEof,
            _ => ErrorCode::ErrorUnknown,
        }
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::NoError => "NoError",
            ErrorCode::ProtocolError => "ProtocolError",
            ErrorCode::InternalError => "InternalError",
            ErrorCode::FlowControlError => "FlowControlError",
            ErrorCode::StreamClosed => "StreamClosed",
            ErrorCode::StreamRefused => "StreamRefused",
            ErrorCode::StreamCancelled => "StreamCancelled",
            ErrorCode::StreamReset => "StreamReset",
            ErrorCode::FrameSizeError => "FrameSizeError",
            ErrorCode::AcceptQueueFull => "AcceptQueueFull",
            ErrorCode::EnhanceYourCalm => "EnhanceYourCalm",
            ErrorCode::RemoteGoneAway => "RemoteGoneAway",
            ErrorCode::StreamsExhausted => "StreamsExhausted",
            ErrorCode::WriteTimeout => "WriteTimeout",
            ErrorCode::SessionClosed => "SessionClosed",
            ErrorCode::PeerEof => "PeerEOF",
            ErrorCode::ErrorUnknown => "ErrorUnknown",
        };
        f.write_str(name)
    }
}

/// Error types for the multiplexing layer.
///
/// Every variant maps onto exactly one [`ErrorCode`] through
/// [`MuxError::code`]. The type is `Clone` so that a single fatal session
/// error can be handed to every blocked stream operation.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    #[error("I/O error: {0}")]
    Io(Arc<io::Error>),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("malformed {frame} frame: body length {length}")]
    FrameSize { frame: &'static str, length: usize },

    #[error("flow control violation: {0}")]
    FlowControl(String),

    #[error("stream closed")]
    StreamClosed,

    #[error("stream refused")]
    StreamRefused,

    #[error("stream reset: {0}")]
    Reset(ErrorCode),

    #[error("remote side has gone away")]
    RemoteGoneAway,

    #[error("stream ids exhausted")]
    StreamsExhausted,

    /// A read or write deadline elapsed. Both directions share the
    /// `WriteTimeout` code.
    #[error("operation timed out")]
    Timeout,

    #[error("session closed")]
    SessionClosed,

    #[error("peer closed the connection")]
    PeerEof,

    #[error("configuration error: {0}")]
    Config(String),
}

impl MuxError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MuxError::Io(_) | MuxError::Config(_) => ErrorCode::InternalError,
            MuxError::Protocol(_) => ErrorCode::ProtocolError,
            MuxError::FrameSize { .. } => ErrorCode::FrameSizeError,
            MuxError::FlowControl(_) => ErrorCode::FlowControlError,
            MuxError::StreamClosed => ErrorCode::StreamClosed,
            MuxError::StreamRefused => ErrorCode::StreamRefused,
            MuxError::Reset(code) => *code,
            MuxError::RemoteGoneAway => ErrorCode::RemoteGoneAway,
            MuxError::StreamsExhausted => ErrorCode::StreamsExhausted,
            MuxError::Timeout => ErrorCode::WriteTimeout,
            MuxError::SessionClosed => ErrorCode::SessionClosed,
            MuxError::PeerEof => ErrorCode::PeerEof,
        }
    }

    fn io_kind(&self) -> io::ErrorKind {
        match self {
            MuxError::Io(e) => e.kind(),
            MuxError::Timeout => io::ErrorKind::TimedOut,
            MuxError::StreamClosed | MuxError::SessionClosed => io::ErrorKind::BrokenPipe,
            MuxError::Reset(_) | MuxError::StreamRefused | MuxError::RemoteGoneAway => {
                io::ErrorKind::ConnectionReset
            }
            MuxError::PeerEof => io::ErrorKind::ConnectionAborted,
            MuxError::Protocol(_) | MuxError::FrameSize { .. } | MuxError::FlowControl(_) => {
                io::ErrorKind::InvalidData
            }
            MuxError::StreamsExhausted | MuxError::Config(_) => io::ErrorKind::Other,
        }
    }
}

impl From<io::Error> for MuxError {
    /// Recovers the original `MuxError` when the I/O error was produced by
    /// a stream of this crate.
    fn from(err: io::Error) -> Self {
        match err.get_ref().and_then(|inner| inner.downcast_ref::<MuxError>()) {
            Some(mux) => mux.clone(),
            None => MuxError::Io(Arc::new(err)),
        }
    }
}

impl From<MuxError> for io::Error {
    fn from(err: MuxError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}

/// Extracts the [`ErrorCode`] and the underlying error from any error
/// produced by this crate, looking through `io::Error` wrappers.
///
/// Errors that did not originate here report [`ErrorCode::ErrorUnknown`].
pub fn get_error<'a>(
    err: &'a (dyn StdError + 'static),
) -> (ErrorCode, &'a (dyn StdError + 'static)) {
    if let Some(mux) = err.downcast_ref::<MuxError>() {
        return match mux {
            MuxError::Io(inner) => (mux.code(), &**inner as &(dyn StdError + 'static)),
            _ => (mux.code(), err),
        };
    }

    if let Some(inner) = err
        .downcast_ref::<io::Error>()
        .and_then(|io_err| io_err.get_ref())
    {
        if inner.is::<MuxError>() {
            return get_error(inner);
        }
    }

    (ErrorCode::ErrorUnknown, err)
}

/// Errors reported by the virtual host muxer.
#[derive(Debug, Error)]
pub enum VhostError {
    #[error("host not found: {0}")]
    NotFound(String),

    #[error("failed to extract virtual host name: {0}")]
    BadRequest(String),

    #[error("name {0} is already bound")]
    NameInUse(String),

    #[error("muxer closed")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
