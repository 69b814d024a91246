use crate::{error::ErrorCode, stream_id::StreamId};
use std::ops::BitOr;

/// The 4-bit frame type from the header, together with the fixed fields
/// of its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Rst {
        error_code: ErrorCode,
    },
    Data,
    WndInc {
        increment: u32,
    },
    GoAway {
        last_stream_id: StreamId,
        error_code: ErrorCode,
    },
    /// A type this crate does not understand. Its body is skipped.
    Unknown(u8),
}

impl FrameType {
    pub const RST: u8 = 0x0;
    pub const DATA: u8 = 0x1;
    pub const WNDINC: u8 = 0x2;
    pub const GOAWAY: u8 = 0x3;

    pub fn to_nibble(self) -> u8 {
        match self {
            FrameType::Rst { .. } => Self::RST,
            FrameType::Data => Self::DATA,
            FrameType::WndInc { .. } => Self::WNDINC,
            FrameType::GoAway { .. } => Self::GOAWAY,
            FrameType::Unknown(raw) => raw & 0x0F,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FrameType::Rst { .. } => "RST",
            FrameType::Data => "DATA",
            FrameType::WndInc { .. } => "WNDINC",
            FrameType::GoAway { .. } => "GOAWAY",
            FrameType::Unknown(_) => "UNKNOWN",
        }
    }

    /// Frames that address a single stream and so need a non-zero id.
    pub fn is_stream_scoped(self) -> bool {
        matches!(
            self,
            FrameType::Rst { .. } | FrameType::Data | FrameType::WndInc { .. }
        )
    }
}

/// Header flags. Only DATA frames define any.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flags(u8);

impl Flags {
    pub const NONE: Flags = Flags(0);
    pub const FIN: Flags = Flags(0x1);
    pub const SYN: Flags = Flags(0x2);

    pub fn from_bits(bits: u8) -> Self {
        Flags(bits & 0x0F)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;

    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}
