//! Wire framing for the TCP control link.
//!
//! ```text
//! u8 scope | u16 BE topic length | topic (UTF-8) | u32 BE payload length | payload
//! ```
//!
//! Scope `0` is local, `1` is global.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use super::Scope;

pub const MAX_TOPIC_LEN: usize = 1024;
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

const HEADER_LEN: usize = 1 + 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub scope: Scope,
    pub topic: String,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(scope: Scope, topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            scope,
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Default)]
pub struct FrameCodec;

fn invalid(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let scope = match src[0] {
            0 => Scope::Local,
            1 => Scope::Global,
            other => return Err(invalid(format!("unknown scope byte {other}"))),
        };
        let topic_len = usize::from(u16::from_be_bytes([src[1], src[2]]));
        if topic_len > MAX_TOPIC_LEN {
            return Err(invalid(format!("topic length {topic_len} exceeds {MAX_TOPIC_LEN}")));
        }

        let len_at = HEADER_LEN + topic_len;
        if src.len() < len_at + 4 {
            src.reserve(len_at + 4 - src.len());
            return Ok(None);
        }
        let payload_len = u32::from_be_bytes([
            src[len_at],
            src[len_at + 1],
            src[len_at + 2],
            src[len_at + 3],
        ]) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(invalid(format!(
                "payload length {payload_len} exceeds {MAX_PAYLOAD_LEN}"
            )));
        }

        let total = len_at + 4 + payload_len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let topic = src.split_to(topic_len);
        let topic = String::from_utf8(topic.to_vec())
            .map_err(|_| invalid("topic is not valid UTF-8".to_string()))?;
        src.advance(4);
        let payload = src.split_to(payload_len).freeze();

        Ok(Some(Frame {
            scope,
            topic,
            payload,
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.topic.len() > MAX_TOPIC_LEN {
            return Err(invalid(format!("topic '{}' too long", frame.topic)));
        }
        if frame.payload.len() > MAX_PAYLOAD_LEN {
            return Err(invalid(format!(
                "payload of {} bytes too long",
                frame.payload.len()
            )));
        }

        dst.reserve(HEADER_LEN + frame.topic.len() + 4 + frame.payload.len());
        dst.put_u8(match frame.scope {
            Scope::Local => 0,
            Scope::Global => 1,
        });
        dst.put_u16(frame.topic.len() as u16);
        dst.put_slice(frame.topic.as_bytes());
        dst.put_u32(frame.payload.len() as u32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
