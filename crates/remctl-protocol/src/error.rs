//! Protocol error types

use thiserror::Error;

/// Errors that can occur while encoding or decoding protocol data
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unknown message type byte
    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    /// Message carried a protocol version we do not speak
    #[error("unknown protocol version: {0}")]
    UnknownVersion(u8),

    /// Output message named a stream other than stdout (1) or stderr (2)
    #[error("unexpected output stream: {0}")]
    BadStream(u8),

    /// Token exceeds the maximum size we are willing to handle
    #[error("token too large: {size} bytes exceeds maximum of {max} bytes")]
    TokenTooLarge { size: usize, max: usize },

    /// Message body was shorter than its type requires
    #[error("malformed {what} message from peer")]
    Malformed { what: &'static str },

    /// Token flags did not match what the protocol state allows
    #[error("unexpected token flags: {0:#04x}")]
    UnexpectedFlags(u8),

    /// Message type was not valid at this point in the exchange
    #[error("unexpected message type: {0:?}")]
    UnexpectedMessage(crate::message::MessageType),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
