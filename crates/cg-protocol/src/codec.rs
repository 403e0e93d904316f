//! Tokio codec for framed tunnel messages
//!
//! Each frame is an 8-byte header followed by a bincode payload:
//!
//! ```text
//! +-----------+------+-------------+-----------------+
//! | stream id | type | payload len | payload         |
//! | u32 BE    | u8   | u24 BE      | bincode Message |
//! +-----------+------+-------------+-----------------+
//! ```
//!
//! The header is validated before any payload is buffered: an unknown type,
//! an oversized length, or a type sent on the wrong kind of stream (a
//! heartbeat on a data stream, `Data` on the control stream) fails the
//! connection straight away.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;
use crate::message::{Message, MessageType};
use crate::stream::StreamId;

/// Size of the frame header in bytes
pub const HEADER_SIZE: usize = 8;

/// Maximum payload size, bounded by the 24-bit length field
pub const MAX_PAYLOAD_SIZE: usize = 0x00FF_FFFF;

/// A complete frame with header and payload
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Stream this frame belongs to
    pub stream_id: StreamId,
    /// The message payload
    pub message: Message,
}

impl Frame {
    /// Create a new frame
    pub fn new(stream_id: StreamId, message: Message) -> Self {
        Self { stream_id, message }
    }

    /// A frame on the control stream
    pub fn control(message: Message) -> Self {
        Self::new(StreamId::CONTROL, message)
    }
}

/// Header of a frame whose payload is still arriving
#[derive(Debug, Clone, Copy)]
struct PendingHeader {
    stream_id: StreamId,
    message_type: MessageType,
    payload_len: usize,
}

fn check_scope(stream_id: StreamId, message_type: MessageType) -> Result<(), ProtocolError> {
    if message_type.scope().admits(stream_id) {
        Ok(())
    } else {
        Err(ProtocolError::WrongStream {
            stream: stream_id.as_u32(),
            message_type: message_type.as_u8(),
        })
    }
}

/// Codec for encoding/decoding tunnel frames
#[derive(Debug, Default)]
pub struct FrameCodec {
    pending: Option<PendingHeader>,
}

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self::default()
    }

    fn decode_header(src: &mut BytesMut) -> Result<Option<PendingHeader>, ProtocolError> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }

        let type_byte = src[4];
        let message_type = MessageType::from_u8(type_byte)
            .ok_or(ProtocolError::UnknownMessageType(type_byte))?;
        let stream_id = StreamId::new(src.get_u32());
        check_scope(stream_id, message_type)?;

        // type byte already read above, then the 24-bit length
        src.advance(1);
        let payload_len = ((src.get_u8() as usize) << 16) | src.get_u16() as usize;

        Ok(Some(PendingHeader {
            stream_id,
            message_type,
            payload_len,
        }))
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match self.pending.take() {
            Some(h) => h,
            None => match Self::decode_header(src)? {
                Some(h) => h,
                None => return Ok(None),
            },
        };

        if src.len() < header.payload_len {
            src.reserve(header.payload_len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(header.payload_len).freeze();
        let message: Message = bincode::deserialize(&payload)?;

        if message.message_type() != header.message_type {
            return Err(ProtocolError::TypeMismatch {
                header: header.message_type.as_u8(),
                payload: message.message_type().as_u8(),
            });
        }

        Ok(Some(Frame {
            stream_id: header.stream_id,
            message,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let message_type = frame.message.message_type();
        check_scope(frame.stream_id, message_type)?;

        let payload = bincode::serialize(&frame.message)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        dst.reserve(HEADER_SIZE + payload.len());
        dst.put_u32(frame.stream_id.as_u32());
        dst.put_u8(message_type.as_u8());
        dst.put_u8((payload.len() >> 16) as u8);
        dst.put_u16(payload.len() as u16);
        dst.extend_from_slice(&payload);

        Ok(())
    }
}
