//! Frame codec for the UDS wire format (MJI1/MJM1).
//!
//! ```text
//! [4 bytes ASCII magic] [u32 BE body length] [body: length bytes]
//! ```
//!
//! `MJI1` bodies are the JSON serialization of the client's
//! [`Address::UdsClient`] descriptor; `MJM1` bodies are opaque serialized
//! messages. Body length is encoded in network byte order even though the
//! transport never crosses a host boundary.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::address::Address;
use crate::error::JoynrError;

/// Magic cookie preceding every init frame.
pub const INIT_MAGIC: [u8; 4] = *b"MJI1";

/// Magic cookie preceding every message frame.
pub const MESSAGE_MAGIC: [u8; 4] = *b"MJM1";

const COOKIE_SIZE: usize = 4;
const LENGTH_SIZE: usize = 4;
const HEADER_SIZE: usize = COOKIE_SIZE + LENGTH_SIZE;

/// Maximum body length a frame can declare.
pub const MAX_BODY_LENGTH: u64 = u32::MAX as u64;

/// Decode failures are fatal for the connection that produced them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("UDS frame header does not start with a known magic cookie: {0:02x?}")]
    InvalidCookie([u8; 4]),

    #[error("init frame body is not a valid client address descriptor: {0}")]
    InvalidInitBody(String),
}

impl From<DecodeError> for JoynrError {
    fn from(error: DecodeError) -> Self {
        JoynrError::FatalTransport(error.to_string())
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdsFrame {
    /// First frame on a connection: the client announcing its address.
    Init(Address),
    /// One serialized message.
    Message(Bytes),
}

fn encode_raw(magic: [u8; 4], body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.extend_from_slice(&magic);
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Encode a message frame.
///
/// # Errors
///
/// Returns [`JoynrError::InvalidArgument`] if the payload exceeds
/// [`MAX_BODY_LENGTH`].
pub fn encode_message_frame(payload: &[u8]) -> Result<Bytes, JoynrError> {
    if payload.len() as u64 > MAX_BODY_LENGTH {
        return Err(JoynrError::InvalidArgument(format!(
            "message of {} bytes does not fit into one UDS frame",
            payload.len()
        )));
    }
    Ok(encode_raw(MESSAGE_MAGIC, payload))
}

/// Encode the init frame announcing `client_address`.
///
/// # Errors
///
/// Returns [`JoynrError::InvalidArgument`] for non-UDS-client addresses, or
/// [`JoynrError::Serialization`] if the descriptor cannot be serialized.
pub fn encode_init_frame(client_address: &Address) -> Result<Bytes, JoynrError> {
    if !matches!(client_address, Address::UdsClient { .. }) {
        return Err(JoynrError::InvalidArgument(format!(
            "init frame requires a UDS client address, got {client_address}"
        )));
    }
    let body = serde_json::to_vec(client_address)
        .map_err(|e| JoynrError::Serialization(format!("client address: {e}")))?;
    Ok(encode_raw(INIT_MAGIC, &body))
}

/// Incremental frame decoder over a reassembled byte stream.
///
/// Feed read chunks via [`FrameDecoder::feed`]; complete frames are returned
/// in order, partial data is buffered for the next call.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and extract all complete frames.
    ///
    /// # Errors
    ///
    /// Returns a [`DecodeError`] on an unknown magic cookie or an unreadable
    /// init body. The decoder must not be fed again after an error.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<UdsFrame>, DecodeError> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < HEADER_SIZE {
                break;
            }

            let cookie: [u8; 4] = self.buf[..COOKIE_SIZE].try_into().expect("4-byte slice");
            if cookie != INIT_MAGIC && cookie != MESSAGE_MAGIC {
                return Err(DecodeError::InvalidCookie(cookie));
            }

            let length = u32::from_be_bytes(
                self.buf[COOKIE_SIZE..HEADER_SIZE]
                    .try_into()
                    .expect("4-byte slice"),
            ) as usize;

            let total = HEADER_SIZE + length;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            let body = &self.buf[HEADER_SIZE..total];
            let frame = if cookie == INIT_MAGIC {
                let address: Address = serde_json::from_slice(body)
                    .map_err(|e| DecodeError::InvalidInitBody(e.to_string()))?;
                if !matches!(address, Address::UdsClient { .. }) {
                    return Err(DecodeError::InvalidInitBody(format!(
                        "not a UDS client address: {address}"
                    )));
                }
                UdsFrame::Init(address)
            } else {
                UdsFrame::Message(Bytes::copy_from_slice(body))
            };
            frames.push(frame);
            self.buf.drain(..total);
        }

        Ok(frames)
    }

    /// Whether the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_round_trip() {
        let encoded = encode_message_frame(b"serialized message").unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(
            frames,
            vec![UdsFrame::Message(Bytes::from_static(b"serialized message"))]
        );
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_init_round_trip() {
        let address = Address::uds_client("client-1");
        let encoded = encode_init_frame(&address).unwrap();
        // Wire contract: the body starts with the literal _typeName.
        assert_eq!(&encoded[..4], b"MJI1");
        assert!(encoded[8..].starts_with(
            br#"{"_typeName":"joynr.system.RoutingTypes.UdsClientAddress""#
        ));

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames, vec![UdsFrame::Init(address)]);
    }

    #[test]
    fn test_init_frame_rejects_non_client_address() {
        assert!(encode_init_frame(&Address::InProcess).is_err());
        assert!(encode_init_frame(&Address::mqtt("g", "c")).is_err());
    }

    #[test]
    fn test_body_length_is_big_endian() {
        let encoded = encode_message_frame(&[0xAB; 300]).unwrap();
        assert_eq!(&encoded[4..8], &300u32.to_be_bytes());
    }

    #[test]
    fn test_empty_message_body() {
        let encoded = encode_message_frame(b"").unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames, vec![UdsFrame::Message(Bytes::new())]);
    }

    #[test]
    fn test_multiple_frames_in_single_feed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_init_frame(&Address::uds_client("c")).unwrap());
        buf.extend_from_slice(&encode_message_frame(b"one").unwrap());
        buf.extend_from_slice(&encode_message_frame(b"two").unwrap());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert!(matches!(frames[0], UdsFrame::Init(_)));
        assert_eq!(frames[1], UdsFrame::Message(Bytes::from_static(b"one")));
        assert_eq!(frames[2], UdsFrame::Message(Bytes::from_static(b"two")));
    }

    #[test]
    fn test_byte_at_a_time_reassembly() {
        let encoded = encode_message_frame(b"x").unwrap();
        let mut decoder = FrameDecoder::new();
        for (i, byte) in encoded.iter().enumerate() {
            let frames = decoder.feed(&[*byte]).unwrap();
            if i < encoded.len() - 1 {
                assert!(frames.is_empty());
                assert!(decoder.has_partial());
            } else {
                assert_eq!(frames.len(), 1);
            }
        }
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_invalid_cookie_rejected() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.feed(&[0x01; 100]).unwrap_err();
        assert!(matches!(err, DecodeError::InvalidCookie(_)));
    }

    #[test]
    fn test_init_body_garbage_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&INIT_MAGIC);
        buf.extend_from_slice(&4u32.to_be_bytes());
        buf.extend_from_slice(b"junk");
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&buf),
            Err(DecodeError::InvalidInitBody(_))
        ));
    }

    #[test]
    fn test_init_body_wrong_address_type_rejected() {
        let body = serde_json::to_vec(&Address::mqtt("gbid", "chan")).unwrap();
        let mut buf = Vec::new();
        buf.extend_from_slice(&INIT_MAGIC);
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(&body);
        let mut decoder = FrameDecoder::new();
        assert!(matches!(
            decoder.feed(&buf),
            Err(DecodeError::InvalidInitBody(_))
        ));
    }

    #[test]
    fn test_large_body() {
        let payload = vec![0x42u8; 256 * 1024];
        let encoded = encode_message_frame(&payload).unwrap();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        match &frames[0] {
            UdsFrame::Message(body) => assert_eq!(body.len(), payload.len()),
            other => panic!("expected message frame, got {other:?}"),
        }
    }
}
