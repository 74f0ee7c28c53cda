use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::message::{Envelope, MessageKind};
use crate::protocol::payload::is_plausible_text;

/// Largest frame accepted in either direction (64 MiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// kind + group id + run id + info length
const HEADER_LEN: usize = 16;
const LENGTH_PREFIX: usize = 4;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unknown message kind code {0}")]
    UnknownKind(i32),

    #[error("frame of {0} bytes exceeds the 64 MiB limit")]
    FrameTooLarge(usize),

    #[error("frame of {0} bytes is shorter than the message header")]
    Truncated(usize),

    #[error("info text length {info_len} overruns a frame body of {body_len} bytes")]
    InfoOverrun { info_len: usize, body_len: usize },

    #[error("info text is not plausible text")]
    UnsafeInfoText,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed envelope framing.
///
/// ```text
/// u32 frame_len | i32 kind | i32 group_id | i32 run_id | u32 info_len | info | payload
/// ```
///
/// All integers are big-endian and `frame_len` counts every byte after itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvelopeCodec;

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>, CodecError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame_len));
        }
        if frame_len < HEADER_LEN {
            return Err(CodecError::Truncated(frame_len));
        }
        if src.len() < LENGTH_PREFIX + frame_len {
            src.reserve(LENGTH_PREFIX + frame_len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let mut frame = src.split_to(frame_len);

        let kind = MessageKind::try_from(frame.get_i32())?;
        let group_id = frame.get_i32();
        let run_id = frame.get_i32();
        let info_len = frame.get_u32() as usize;
        if info_len > frame.len() {
            return Err(CodecError::InfoOverrun {
                info_len,
                body_len: frame.len(),
            });
        }

        let info = frame.split_to(info_len);
        if !is_plausible_text(&info) {
            return Err(CodecError::UnsafeInfoText);
        }
        let info_text = String::from_utf8_lossy(&info).into_owned();

        Ok(Some(Envelope {
            kind,
            group_id,
            run_id,
            info_text,
            payload: frame.freeze(),
        }))
    }
}

impl<'a> Encoder<&'a Envelope> for EnvelopeCodec {
    type Error = CodecError;

    fn encode(&mut self, envelope: &'a Envelope, dst: &mut BytesMut) -> Result<(), CodecError> {
        let info = envelope.info_text.as_bytes();
        let frame_len = HEADER_LEN + info.len() + envelope.payload.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame_len));
        }

        dst.reserve(LENGTH_PREFIX + frame_len);
        dst.put_u32(frame_len as u32);
        dst.put_i32(envelope.kind.code());
        dst.put_i32(envelope.group_id);
        dst.put_i32(envelope.run_id);
        dst.put_u32(info.len() as u32);
        dst.put_slice(info);
        dst.put_slice(&envelope.payload);
        Ok(())
    }
}
