//! Token framing
//!
//! The outer framing wraps every exchange in a token:
//! - flags: 1 byte
//! - payload_length: 4 bytes (u32, big-endian)
//! - payload
//!
//! Context tokens carry authentication handshake data in the clear;
//! data tokens carry integrity-protected messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProtocolError;

/// Size of the token header in bytes
pub const HEADER_SIZE: usize = 5;

/// Maximum token length we accept from the remote side (1MB)
pub const TOKEN_MAX_LENGTH: usize = 1024 * 1024;

/// Maximum message payload a peer may put in a single data token (64KB)
pub const TOKEN_MAX_DATA: usize = 64 * 1024;

/// Token flag bits
pub mod flags {
    /// Initial connection token carrying no data
    pub const NOOP: u8 = 1 << 0;
    /// Authentication context establishment token
    pub const CONTEXT: u8 = 1 << 1;
    /// Protected message data
    pub const DATA: u8 = 1 << 2;
    /// Message integrity code (unused, kept for wire compatibility)
    pub const MIC: u8 = 1 << 3;
    /// Context establishment follows this token
    pub const CONTEXT_NEXT: u8 = 1 << 4;
    /// Peer requests a MIC in response (unused, kept for wire compatibility)
    pub const SEND_MIC: u8 = 1 << 5;
    /// Token conforms to protocol version 2 framing
    pub const PROTOCOL: u8 = 1 << 6;
}

/// A single framed token: flags plus opaque payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token flag bits
    pub flags: u8,
    /// The token payload
    pub payload: Bytes,
}

impl Token {
    /// Create a new token
    pub fn new(flags: u8, payload: Bytes) -> Self {
        Self { flags, payload }
    }

    /// The initial token a client sends to announce protocol version 2
    pub fn initial() -> Self {
        Self::new(
            flags::NOOP | flags::CONTEXT_NEXT | flags::PROTOCOL,
            Bytes::new(),
        )
    }

    /// A context establishment token
    pub fn context(payload: Bytes) -> Self {
        Self::new(flags::CONTEXT | flags::PROTOCOL, payload)
    }

    /// A protected data token
    pub fn data(payload: Bytes) -> Self {
        Self::new(flags::DATA | flags::PROTOCOL, payload)
    }

    /// Whether this token carries protected message data
    pub fn is_data(&self) -> bool {
        self.flags == (flags::DATA | flags::PROTOCOL)
    }

    /// Whether this token carries context establishment data
    pub fn is_context(&self) -> bool {
        self.flags == (flags::CONTEXT | flags::PROTOCOL)
    }
}

/// Codec for encoding/decoding tokens over a byte stream
#[derive(Debug, Default)]
pub struct TokenCodec {
    /// Header already decoded while waiting for the payload
    pending: Option<(u8, usize)>,
}

impl TokenCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self { pending: None }
    }
}

impl Decoder for TokenCodec {
    type Item = Token;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (flags, length) = match self.pending.take() {
            Some(header) => header,
            None => {
                if src.len() < HEADER_SIZE {
                    return Ok(None);
                }
                let flags = src.get_u8();
                let length = src.get_u32() as usize;
                if length > TOKEN_MAX_LENGTH {
                    return Err(ProtocolError::TokenTooLarge {
                        size: length,
                        max: TOKEN_MAX_LENGTH,
                    });
                }
                (flags, length)
            }
        };

        if src.len() < length {
            // Save the header and wait for the rest of the payload
            src.reserve(length - src.len());
            self.pending = Some((flags, length));
            return Ok(None);
        }

        let payload = src.split_to(length).freeze();
        Ok(Some(Token { flags, payload }))
    }
}

impl Encoder<Token> for TokenCodec {
    type Error = ProtocolError;

    fn encode(&mut self, token: Token, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if token.payload.len() > TOKEN_MAX_LENGTH {
            return Err(ProtocolError::TokenTooLarge {
                size: token.payload.len(),
                max: TOKEN_MAX_LENGTH,
            });
        }
        dst.reserve(HEADER_SIZE + token.payload.len());
        dst.put_u8(token.flags);
        dst.put_u32(token.payload.len() as u32);
        dst.extend_from_slice(&token.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_roundtrip() {
        let mut codec = TokenCodec::new();
        let token = Token::data(Bytes::from_static(b"payload bytes"));

        let mut buf = BytesMut::new();
        codec.encode(token.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE + 13);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, token);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_empty_payload() {
        let mut codec = TokenCodec::new();
        let token = Token::initial();

        let mut buf = BytesMut::new();
        codec.encode(token.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.flags, flags::NOOP | flags::CONTEXT_NEXT | flags::PROTOCOL);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_partial_decode() {
        let mut codec = TokenCodec::new();
        let token = Token::context(Bytes::from_static(b"handshake"));

        let mut full = BytesMut::new();
        codec.encode(token, &mut full).unwrap();

        // Header only, one byte short
        let mut partial = full.split_to(HEADER_SIZE - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Header complete, payload partial
        partial.extend_from_slice(&full.split_to(4));
        assert!(codec.decode(&mut partial).unwrap().is_none());

        // Rest of the payload
        partial.extend_from_slice(&full);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded.payload.as_ref(), b"handshake");
    }

    #[test]
    fn test_oversize_rejected_on_decode() {
        let mut codec = TokenCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u8(flags::DATA | flags::PROTOCOL);
        buf.put_u32((TOKEN_MAX_LENGTH + 1) as u32);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(ProtocolError::TokenTooLarge { .. })));
    }

    #[test]
    fn test_two_tokens_in_one_buffer() {
        let mut codec = TokenCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Token::data(Bytes::from_static(b"first")), &mut buf)
            .unwrap();
        codec
            .encode(Token::data(Bytes::from_static(b"second")), &mut buf)
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.payload.as_ref(), b"first");
        assert_eq!(second.payload.as_ref(), b"second");
    }
}
