//! Length-prefixed framing for JSON messages

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::NetworkError;

/// Maximum frame size (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Length prefix size (4 bytes).
const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec splitting a byte stream into frames.
///
/// Wire format: [length: u32 BE] [UTF-8 JSON payload]. Frames are handed out
/// undecoded so callers can log and skip records with unknown discriminants.
#[derive(Debug, Default)]
pub struct FrameCodec {
    decode_state: DecodeState,
}

#[derive(Debug, Default)]
enum DecodeState {
    #[default]
    ReadingLength,
    ReadingPayload {
        length: usize,
    },
}

impl FrameCodec {
    /// Creates a new codec.
    pub fn new() -> Self {
        Self::default()
    }
}

/// Serialize a message into a frame payload
pub fn encode_json<T: Serialize>(msg: &T) -> Result<Bytes, NetworkError> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| NetworkError::Codec(format!("serialize error: {}", e)))?;
    Ok(Bytes::from(payload))
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = NetworkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match &self.decode_state {
                DecodeState::ReadingLength => {
                    if src.len() < LENGTH_PREFIX_SIZE {
                        return Ok(None);
                    }

                    let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

                    if length == 0 || length > MAX_FRAME_SIZE {
                        return Err(NetworkError::Codec(format!(
                            "frame length {} outside 1..={}",
                            length, MAX_FRAME_SIZE
                        )));
                    }

                    src.advance(LENGTH_PREFIX_SIZE);
                    src.reserve(length);
                    self.decode_state = DecodeState::ReadingPayload { length };
                }
                DecodeState::ReadingPayload { length } => {
                    let length = *length;
                    if src.len() < length {
                        return Ok(None);
                    }

                    let payload = src.split_to(length).freeze();
                    self.decode_state = DecodeState::ReadingLength;
                    return Ok(Some(payload));
                }
            }
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = NetworkError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.is_empty() || item.len() > MAX_FRAME_SIZE {
            return Err(NetworkError::Codec(format!(
                "frame size {} outside 1..={}",
                item.len(),
                MAX_FRAME_SIZE
            )));
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_streaming() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Bytes::from_static(b"{\"a\":1}"), &mut buf).unwrap();
        codec.encode(Bytes::from_static(b"{\"b\":2}"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"{\"a\":1}"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), &b"{\"b\":2}"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"{\"mode\":\"new-peer\"}"), &mut encoded)
            .unwrap();

        // Feed bytes one at a time
        let mut buf = BytesMut::new();
        let total = encoded.len();
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut buf).unwrap();
            if i < total - 1 {
                assert!(result.is_none());
            } else {
                assert_eq!(result.unwrap(), &b"{\"mode\":\"new-peer\"}"[..]);
            }
        }
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        assert!(codec.decode(&mut buf).is_err());

        let mut out = BytesMut::new();
        assert!(codec.encode(Bytes::new(), &mut out).is_err());
    }

    #[test]
    fn test_encode_json() {
        let bytes = encode_json(&serde_json::json!({"mode": "public-keys"})).unwrap();
        assert_eq!(bytes, &b"{\"mode\":\"public-keys\"}"[..]);
    }
}
