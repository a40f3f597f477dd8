//! Stateful frame codec for the embedded wire protocol
//!
//! Layout is little-endian throughout: a 2-byte message type, then the
//! variant body. `Winch` is two u16s (width, height). `Data` is a 4-byte
//! signed length followed by exactly that many bytes.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::frame::{Frame, Winch};

const MSG_WINCH: i16 = 0;
const MSG_DATA: i16 = 1;

const TYPE_LEN: usize = 2;
const WINCH_BODY_LEN: usize = 4;
const DATA_HEADER_LEN: usize = 4;

/// Maximum accepted `Data` payload (16 MiB).
pub const MAX_DATA_LEN: usize = 16 * 1024 * 1024;

/// Frame codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid message type: {0}")]
    InvalidMessageType(i16),

    #[error("invalid data length: {0}")]
    InvalidDataLength(i32),

    #[error("data frame too large: {size} bytes (max {max})")]
    DataTooLarge { size: usize, max: usize },

    #[error("stream ended inside a frame")]
    TruncatedFrame,
}

/// Codec for [`Frame`] streams, usable on both ends of a connection.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        if src.len() < TYPE_LEN {
            return Ok(None);
        }

        let ty = i16::from_le_bytes([src[0], src[1]]);
        match ty {
            MSG_WINCH => {
                if src.len() < TYPE_LEN + WINCH_BODY_LEN {
                    return Ok(None);
                }
                src.advance(TYPE_LEN);
                let width = src.get_u16_le();
                let height = src.get_u16_le();
                Ok(Some(Frame::Winch(Winch::new(width, height))))
            }
            MSG_DATA => {
                if src.len() < TYPE_LEN + DATA_HEADER_LEN {
                    return Ok(None);
                }
                let declared = i32::from_le_bytes([src[2], src[3], src[4], src[5]]);
                if declared < 0 {
                    return Err(CodecError::InvalidDataLength(declared));
                }
                let len = declared as usize;
                if len > MAX_DATA_LEN {
                    return Err(CodecError::DataTooLarge {
                        size: len,
                        max: MAX_DATA_LEN,
                    });
                }
                if src.len() < TYPE_LEN + DATA_HEADER_LEN + len {
                    // Reserve the rest so the next read can complete the frame.
                    src.reserve(TYPE_LEN + DATA_HEADER_LEN + len - src.len());
                    return Ok(None);
                }
                src.advance(TYPE_LEN + DATA_HEADER_LEN);
                Ok(Some(Frame::Data(src.split_to(len).freeze())))
            }
            other => Err(CodecError::InvalidMessageType(other)),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            // A peer that hangs up mid-frame declared more than it sent.
            None => Err(CodecError::TruncatedFrame),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        match frame {
            Frame::Winch(ws) => {
                dst.reserve(TYPE_LEN + WINCH_BODY_LEN);
                dst.put_i16_le(MSG_WINCH);
                dst.put_u16_le(ws.width);
                dst.put_u16_le(ws.height);
            }
            Frame::Data(bytes) => {
                if bytes.len() > MAX_DATA_LEN {
                    return Err(CodecError::DataTooLarge {
                        size: bytes.len(),
                        max: MAX_DATA_LEN,
                    });
                }
                dst.reserve(TYPE_LEN + DATA_HEADER_LEN + bytes.len());
                dst.put_i16_le(MSG_DATA);
                dst.put_i32_le(bytes.len() as i32);
                dst.put_slice(&bytes);
            }
        }
        Ok(())
    }
}
