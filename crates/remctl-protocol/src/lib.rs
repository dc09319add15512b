//! remctl-protocol: Wire protocol for remctl remote command execution
//!
//! This crate defines the binary protocol spoken between remctl clients
//! and servers: the outer token framing and the inner typed messages
//! (command, output, status, error, version, no-op, quit).

pub mod error;
pub mod message;
pub mod token;

pub use error::ProtocolError;
pub use message::{
    decode_args, split_command, CommandAssembler, Continuation, ErrorCode, Message, MessageType,
    OutputStream, HIGHEST_VERSION, MAX_OUTPUT_DATA, NOOP_VERSION, PROTOCOL_VERSION,
};
pub use token::{Token, TokenCodec, HEADER_SIZE, TOKEN_MAX_DATA, TOKEN_MAX_LENGTH};

/// The standard remctl port.
pub const DEFAULT_PORT: u16 = 4373;

/// The legacy port used before the standard port was assigned.
pub const FALLBACK_PORT: u16 = 4444;
