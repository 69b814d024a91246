use crate::{
    error::{ErrorCode, MuxError, Result},
    frame_type::{Flags, FrameType},
    stream_id::StreamId,
};
use bytes::Bytes;

pub const HEADER_SIZE: usize = 8;

/// Largest body the 24-bit length field can describe.
pub const MAX_BODY_LEN: usize = 0xFF_FFFF;

pub const RST_BODY_LEN: usize = 4;
pub const WNDINC_BODY_LEN: usize = 4;
pub const GOAWAY_MIN_BODY_LEN: usize = 8;

/// Largest credit a single WNDINC may carry; the top bit is reserved.
pub const MAX_WINDOW_INCREMENT: u32 = 0x7FFF_FFFF;

/// One decoded frame.
///
/// `data` holds the DATA payload or the GOAWAY debug bytes. The fixed
/// fields of RST, WNDINC and GOAWAY bodies live in [`FrameType`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: Flags,
    pub stream_id: StreamId,
    pub data: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, flags: Flags, stream_id: StreamId, data: Bytes) -> Self {
        Self {
            frame_type,
            flags,
            stream_id,
            data,
        }
    }

    pub fn new_data(stream_id: StreamId, payload: Bytes, fin: bool, syn: bool) -> Self {
        let mut flags = Flags::NONE;
        if fin {
            flags = flags | Flags::FIN;
        }
        if syn {
            flags = flags | Flags::SYN;
        }
        Self::new(FrameType::Data, flags, stream_id, payload)
    }

    pub fn new_rst(stream_id: StreamId, error_code: ErrorCode) -> Self {
        Self::new(
            FrameType::Rst { error_code },
            Flags::NONE,
            stream_id,
            Bytes::new(),
        )
    }

    /// Builds a window update. A zero increment is never valid on the wire.
    pub fn new_wnd_inc(stream_id: StreamId, increment: u32) -> Result<Self> {
        if increment == 0 || increment > MAX_WINDOW_INCREMENT {
            return Err(MuxError::Protocol(format!(
                "invalid window increment {increment}"
            )));
        }
        Ok(Self::new(
            FrameType::WndInc { increment },
            Flags::NONE,
            stream_id,
            Bytes::new(),
        ))
    }

    pub fn new_go_away(last_stream_id: StreamId, error_code: ErrorCode, debug: Bytes) -> Self {
        Self::new(
            FrameType::GoAway {
                last_stream_id,
                error_code,
            },
            Flags::NONE,
            StreamId::ZERO,
            debug,
        )
    }

    pub fn is_fin(&self) -> bool {
        matches!(self.frame_type, FrameType::Data) && self.flags.contains(Flags::FIN)
    }

    pub fn is_syn(&self) -> bool {
        matches!(self.frame_type, FrameType::Data) && self.flags.contains(Flags::SYN)
    }

    /// Length of the body as written into the header.
    pub fn body_len(&self) -> usize {
        match self.frame_type {
            FrameType::Rst { .. } => RST_BODY_LEN,
            FrameType::WndInc { .. } => WNDINC_BODY_LEN,
            FrameType::GoAway { .. } => GOAWAY_MIN_BODY_LEN + self.data.len(),
            FrameType::Data | FrameType::Unknown(_) => self.data.len(),
        }
    }

    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.body_len()
    }

    pub fn validate(&self) -> Result<()> {
        self.validate_framing()?;
        match self.frame_type {
            FrameType::WndInc { increment }
                if increment == 0 || increment > MAX_WINDOW_INCREMENT =>
            {
                Err(MuxError::Protocol(format!(
                    "invalid window increment {increment}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// Checks that can desynchronize the connection. A bad window
    /// increment only concerns its stream and is left to the session.
    pub(crate) fn validate_framing(&self) -> Result<()> {
        if self.body_len() > MAX_BODY_LEN {
            return Err(MuxError::FrameSize {
                frame: self.frame_type.name(),
                length: self.body_len(),
            });
        }

        if self.frame_type.is_stream_scoped() && self.stream_id.is_zero() {
            return Err(MuxError::Protocol(format!(
                "{} frame on stream 0",
                self.frame_type.name()
            )));
        }

        match self.frame_type {
            FrameType::GoAway { .. } if !self.stream_id.is_zero() => {
                Err(MuxError::Protocol(format!(
                    "GOAWAY frame on stream {}",
                    self.stream_id
                )))
            }
            _ => Ok(()),
        }
    }
}
