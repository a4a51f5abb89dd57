//! Length-prefixed MessagePack codec for tokio I/O.
//!
//! Framing: `[4 bytes: payload length, big-endian u32][N bytes: MessagePack payload]`

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{MAX_PAYLOAD_SIZE, Message, RawEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("payload too large: {0} bytes (max {MAX_PAYLOAD_SIZE})")]
    PayloadTooLarge(usize),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("MessagePack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Frame-level codec — handles only length-prefixed framing.
///
/// Yields raw payloads without deserializing them. The broker uses this
/// with [`decode_frame`] so that frames with an unknown `type` can still
/// be answered.
#[derive(Debug, Default)]
pub struct FrameCodec {
    /// Length of the frame being read, once its header is consumed.
    pending_len: Option<usize>,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self { pending_len: None }
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let payload_len = match self.pending_len {
            Some(len) => len,
            None => {
                if src.len() < 4 {
                    return Ok(None);
                }
                let len = src.get_u32() as usize;
                if len > MAX_PAYLOAD_SIZE {
                    return Err(CodecError::PayloadTooLarge(len));
                }
                self.pending_len = Some(len);
                len
            }
        };

        if src.len() < payload_len {
            src.reserve(payload_len - src.len());
            return Ok(None);
        }

        self.pending_len = None;
        Ok(Some(src.split_to(payload_len)))
    }
}

impl Encoder<Message> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = rmp_serde::to_vec_named(&item)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::PayloadTooLarge(payload.len()));
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

/// Typed codec over [`FrameCodec`]: frames in, [`Message`]s out.
///
/// Used by clients, which only ever receive messages they understand.
#[derive(Debug, Default)]
pub struct LengthPrefixedCodec {
    frames: FrameCodec,
}

impl LengthPrefixedCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for LengthPrefixedCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.frames.decode(src)? {
            Some(payload) => Ok(Some(rmp_serde::from_slice(&payload)?)),
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for LengthPrefixedCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.frames.encode(item, dst)
    }
}

/// Result of attempting to decode a raw frame into a protocol message.
#[derive(Debug)]
pub enum DecodeResult {
    Ok(Box<Message>),
    /// Unknown type — the envelope is kept so the error can echo its id.
    UnknownType(RawEnvelope),
    /// Could not even extract `{type, id}`.
    Malformed(rmp_serde::decode::Error),
}

/// Two-phase decode: the full [`Message`] first, then the bare envelope.
pub fn decode_frame(payload: &[u8]) -> DecodeResult {
    match rmp_serde::from_slice::<Message>(payload) {
        Ok(msg) => DecodeResult::Ok(Box::new(msg)),
        Err(_) => match rmp_serde::from_slice::<RawEnvelope>(payload) {
            Ok(envelope) => DecodeResult::UnknownType(envelope),
            Err(e) => DecodeResult::Malformed(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::protocol::Response;

    fn framed(msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        LengthPrefixedCodec::new().encode(msg, &mut buf).unwrap();
        buf
    }

    #[test]
    fn header_is_big_endian_payload_length() {
        let buf = framed(Message::ListPlatforms { id: 0 });
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        assert_eq!(buf.len() - 4, len);
    }

    #[test]
    fn waits_for_partial_header_and_payload() {
        let mut codec = LengthPrefixedCodec::new();
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let msg = Message::Broadcast {
            id: 1,
            context: crate::engine::tests::ctx("AAPL"),
        };
        let mut full = framed(msg.clone());
        let mut partial = full.split_to(full.len() / 2);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full);
        assert_eq!(codec.decode(&mut partial).unwrap().unwrap(), msg);
    }

    #[test]
    fn consecutive_frames_in_one_buffer() {
        let mut buf = framed(Message::ListPlatforms { id: 1 });
        buf.extend_from_slice(&framed(Message::from(Response::ok(2))));

        let mut codec = LengthPrefixedCodec::new();
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().id(), 1);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().id(), 2);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversize_header_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_PAYLOAD_SIZE + 1) as u32);
        buf.extend_from_slice(&[0u8; 16]);
        let err = FrameCodec::new().decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::PayloadTooLarge(_)));
    }

    // -- Two-phase decode --

    #[test]
    fn decode_frame_distinguishes_unknown_and_malformed() {
        #[derive(serde::Serialize)]
        struct Unknown {
            #[serde(rename = "type")]
            msg_type: &'static str,
            id: u32,
        }
        let unknown = rmp_serde::to_vec_named(&Unknown {
            msg_type: "frobnicate",
            id: 7,
        })
        .unwrap();
        match decode_frame(&unknown) {
            DecodeResult::UnknownType(envelope) => assert_eq!(envelope.id, 7),
            other => panic!("expected UnknownType, got {other:?}"),
        }

        assert!(matches!(decode_frame(&[0xc1]), DecodeResult::Malformed(_)));

        let known = rmp_serde::to_vec_named(&Message::ListPlatforms { id: 3 }).unwrap();
        assert!(matches!(decode_frame(&known), DecodeResult::Ok(m) if m.id() == 3));
    }
}
