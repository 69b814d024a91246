//! Stream multiplexing over a single ordered byte stream, with typed
//! streams, heartbeats and name-based connection routing on top.

mod buffer;
pub mod codec;
pub mod config;
pub mod error;
pub mod frame;
pub mod frame_type;
pub mod heartbeat;
pub mod session;
pub mod stream;
pub mod stream_id;
mod stream_map;
pub mod typed;
pub mod vhost;
mod window;

pub use codec::Codec;
pub use config::{Config, ConfigBuilder, StreamFactory};
pub use error::{ErrorCode, MuxError, Result, VhostError, get_error};
pub use frame::{Frame, HEADER_SIZE};
pub use frame_type::{Flags, FrameType};
pub use heartbeat::{HEARTBEAT_STREAM_TYPE, Heartbeat, HeartbeatConfig};
pub use session::{Session, Termination};
pub use stream::Stream;
pub use stream_id::{Role, StreamId, StreamIdGenerator};
pub use typed::{StreamType, TypedStream, TypedStreamSession};
pub use vhost::{
    HttpMuxer, HttpSniffer, Listener, SharedConn, Sniff, TlsMuxer, TlsSniffer, VirtualHostMuxer,
};
