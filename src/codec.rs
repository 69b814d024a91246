use crate::{
    config::Config,
    error::{ErrorCode, MuxError, Result},
    frame::{
        Frame, GOAWAY_MIN_BODY_LEN, HEADER_SIZE, MAX_WINDOW_INCREMENT, RST_BODY_LEN,
        WNDINC_BODY_LEN,
    },
    frame_type::{Flags, FrameType},
    stream_id::StreamId,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::codec::{Decoder, Encoder};

/// Wire codec for frames.
///
/// Header layout, big-endian: 24-bit body length, 4-bit type, 4-bit
/// flags, 32-bit stream id with the top bit reserved.
#[derive(Debug, Clone)]
pub struct Codec {
    max_data_len: usize,
    name: Option<Arc<str>>,
    /// Body bytes of an unknown frame still to be discarded.
    skip: usize,
}

#[derive(Debug, Clone, Copy)]
struct Header {
    length: usize,
    type_bits: u8,
    flags: Flags,
    stream_id: StreamId,
}

impl Codec {
    pub fn new(config: &Config) -> Self {
        Self {
            max_data_len: config.max_window_size,
            name: None,
            skip: 0,
        }
    }

    /// Emits a TRACE event for every frame read or written, tagged with
    /// `name`.
    pub fn named(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn peek_header(src: &[u8]) -> Header {
        let mut buf = &src[..HEADER_SIZE];
        let length = buf.get_uint(3) as usize;
        let type_and_flags = buf.get_u8();
        let stream_id = StreamId::new(buf.get_u32());
        Header {
            length,
            type_bits: type_and_flags >> 4,
            flags: Flags::from_bits(type_and_flags),
            stream_id,
        }
    }

    fn check_length(&self, header: &Header) -> Result<()> {
        let (frame, ok) = match header.type_bits {
            FrameType::RST => ("RST", header.length == RST_BODY_LEN),
            FrameType::WNDINC => ("WNDINC", header.length == WNDINC_BODY_LEN),
            FrameType::GOAWAY => ("GOAWAY", header.length >= GOAWAY_MIN_BODY_LEN),
            FrameType::DATA => {
                if header.length > self.max_data_len {
                    return Err(MuxError::FlowControl(format!(
                        "DATA frame of {} bytes exceeds the {} byte window",
                        header.length, self.max_data_len
                    )));
                }
                return Ok(());
            }
            _ => return Ok(()),
        };
        if ok {
            Ok(())
        } else {
            Err(MuxError::FrameSize {
                frame,
                length: header.length,
            })
        }
    }

    fn parse_body(header: Header, mut body: Bytes) -> Result<Frame> {
        let frame_type = match header.type_bits {
            FrameType::RST => FrameType::Rst {
                error_code: ErrorCode::from_u32(body.get_u32()),
            },
            FrameType::DATA => FrameType::Data,
            FrameType::WNDINC => FrameType::WndInc {
                increment: body.get_u32() & MAX_WINDOW_INCREMENT,
            },
            FrameType::GOAWAY => FrameType::GoAway {
                last_stream_id: StreamId::new(body.get_u32()),
                error_code: ErrorCode::from_u32(body.get_u32()),
            },
            other => FrameType::Unknown(other),
        };
        let frame = Frame::new(frame_type, header.flags, header.stream_id, body);
        frame.validate_framing()?;
        Ok(frame)
    }

    fn trace(&self, direction: &'static str, frame: &Frame) {
        if let Some(name) = &self.name {
            tracing::trace!(
                endpoint = %name,
                direction,
                frame_type = frame.frame_type.name(),
                stream_id = %frame.stream_id,
                flags = frame.flags.bits(),
                length = frame.body_len(),
                "frame"
            );
        }
    }
}

impl Decoder for Codec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if self.skip > 0 {
            let n = self.skip.min(src.len());
            src.advance(n);
            self.skip -= n;
            if self.skip > 0 {
                return Ok(None);
            }
        }

        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        // Peek at the header without consuming the bytes
        let header = Self::peek_header(src);
        self.check_length(&header)?;

        if header.type_bits > FrameType::GOAWAY {
            // Hand unknown frames up right away and drop their body as it arrives
            src.advance(HEADER_SIZE);
            let available = header.length.min(src.len());
            src.advance(available);
            self.skip = header.length - available;
            let frame = Frame::new(
                FrameType::Unknown(header.type_bits),
                header.flags,
                header.stream_id,
                Bytes::new(),
            );
            self.trace("read", &frame);
            return Ok(Some(frame));
        }

        let total_frame_size = HEADER_SIZE + header.length;
        if src.len() < total_frame_size {
            src.reserve(total_frame_size - src.len());
            return Ok(None);
        }

        src.advance(HEADER_SIZE);
        let body = src.split_to(header.length).freeze();
        let frame = Self::parse_body(header, body)?;
        self.trace("read", &frame);
        Ok(Some(frame))
    }
}

impl Encoder<Frame> for Codec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        frame.validate()?;
        self.trace("write", &frame);

        let length = frame.body_len();
        dst.reserve(HEADER_SIZE + length);

        dst.put_uint(length as u64, 3);
        dst.put_u8((frame.frame_type.to_nibble() << 4) | frame.flags.bits());
        dst.put_u32(frame.stream_id.get());

        match frame.frame_type {
            FrameType::Rst { error_code } => dst.put_u32(error_code.as_u32()),
            FrameType::WndInc { increment } => dst.put_u32(increment),
            FrameType::GoAway {
                last_stream_id,
                error_code,
            } => {
                dst.put_u32(last_stream_id.get());
                dst.put_u32(error_code.as_u32());
                dst.put_slice(&frame.data);
            }
            FrameType::Data | FrameType::Unknown(_) => dst.put_slice(&frame.data),
        }

        Ok(())
    }
}
