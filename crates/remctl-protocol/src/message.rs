//! Message types and encoding for the remctl protocol
//!
//! Every data token carries one message: a protocol version byte, a
//! message type byte, and a type-specific body with all integers in
//! network byte order.
//!
//! # Message Flow
//!
//! Typical sequence for one command:
//!
//! 1. Client sends `Command` (split across several tokens if large)
//! 2. Server sends zero or more `Output` messages
//! 3. Server sends exactly one `Status` *or* one `Error`
//! 4. Client either sends the next `Command` or `Quit`
//!
//! `Noop`/`Noop` round trips may happen between commands to keep the
//! connection alive.  A server that receives a version byte above what
//! it supports answers with `Version` naming its highest version.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::token::TOKEN_MAX_DATA;

/// Protocol version carried by all messages except `Noop`.
pub const PROTOCOL_VERSION: u8 = 2;

/// Protocol version carried by `Noop` messages, a later extension.
pub const NOOP_VERSION: u8 = 3;

/// Highest protocol version this implementation speaks.
pub const HIGHEST_VERSION: u8 = NOOP_VERSION;

/// Maximum data payload of a single `Output` message: the token data
/// limit minus the version, type, stream, and length overhead.
pub const MAX_OUTPUT_DATA: usize = TOKEN_MAX_DATA - 1 - 1 - 1 - 4;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Command execution request
    Command = 1,
    /// Client is done with the connection
    Quit = 2,
    /// A chunk of stdout or stderr from the running command
    Output = 3,
    /// Final exit status of the command
    Status = 4,
    /// Protocol-level error terminating the exchange
    Error = 5,
    /// Highest protocol version the server supports
    Version = 6,
    /// Keep-alive request and reply
    Noop = 7,
}

impl MessageType {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Command),
            2 => Some(Self::Quit),
            3 => Some(Self::Output),
            4 => Some(Self::Status),
            5 => Some(Self::Error),
            6 => Some(Self::Version),
            7 => Some(Self::Noop),
            _ => None,
        }
    }
}

/// Error codes carried in `Error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ErrorCode {
    /// Internal server failure
    Internal = 1,
    /// Invalid format in token
    BadToken = 2,
    /// Unknown message type
    UnknownMessage = 3,
    /// Invalid command format in token
    BadCommand = 4,
    /// Unknown command
    UnknownCommand = 5,
    /// Access denied
    AccessDenied = 6,
    /// Argument count exceeds server limit
    TooManyArgs = 7,
    /// Argument size exceeds server limit
    TooMuchData = 8,
    /// Message type not valid now
    UnexpectedMessage = 9,
    /// No help defined for this command
    NoHelp = 10,
}

impl ErrorCode {
    /// Convert to u32
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// Convert from u32
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(Self::Internal),
            2 => Some(Self::BadToken),
            3 => Some(Self::UnknownMessage),
            4 => Some(Self::BadCommand),
            5 => Some(Self::UnknownCommand),
            6 => Some(Self::AccessDenied),
            7 => Some(Self::TooManyArgs),
            8 => Some(Self::TooMuchData),
            9 => Some(Self::UnexpectedMessage),
            10 => Some(Self::NoHelp),
            _ => None,
        }
    }

    /// The conventional diagnostic text for this code
    pub fn text(&self) -> &'static str {
        match self {
            Self::Internal => "Internal failure",
            Self::BadToken => "Invalid format in token",
            Self::UnknownMessage => "Unknown message type",
            Self::BadCommand => "Invalid command token",
            Self::UnknownCommand => "Unknown command",
            Self::AccessDenied => "Access denied",
            Self::TooManyArgs => "Too many arguments",
            Self::TooMuchData => "Too much argument data",
            Self::UnexpectedMessage => "Message type not valid now",
            Self::NoHelp => "No help defined for this command",
        }
    }
}

/// Output stream identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputStream {
    /// Standard output
    Stdout = 1,
    /// Standard error
    Stderr = 2,
}

impl OutputStream {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Continuation status of a `Command` message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Continuation {
    /// The whole command fits in this message
    Complete = 0,
    /// First of several chunks
    First = 1,
    /// Middle chunk
    Middle = 2,
    /// Last chunk
    Last = 3,
}

impl Continuation {
    /// Convert to u8
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Complete),
            1 => Some(Self::First),
            2 => Some(Self::Middle),
            3 => Some(Self::Last),
            _ => None,
        }
    }
}

/// Protocol messages
///
/// `Command` carries a raw chunk of the serialized argument body so that
/// split commands can be represented message-for-message; use
/// [`split_command`] to build chunks from an argv and [`CommandAssembler`]
/// plus [`decode_args`] to reconstruct the argv.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Command execution request (one chunk of the argument body)
    Command {
        /// Keep the connection open after the command completes
        keep_alive: bool,
        /// Where this chunk falls in a possibly-split command
        continuation: Continuation,
        /// Serialized argument body bytes
        data: Bytes,
    },

    /// Client is done with the connection
    Quit,

    /// A chunk of command output
    Output {
        /// Which stream the data belongs to
        stream: OutputStream,
        /// Output bytes, order-preserving within the stream
        data: Bytes,
    },

    /// Final exit status of the command
    Status {
        /// Remote exit status
        status: u8,
    },

    /// Protocol-level error terminating the exchange
    Error {
        /// Error code; see [`ErrorCode`] for the defined values
        code: u32,
        /// Human-readable message
        message: String,
    },

    /// Highest protocol version the server supports
    Version {
        /// Version number
        highest: u8,
    },

    /// Keep-alive request and reply
    Noop,
}

impl Message {
    /// Get the message type for this message
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Command { .. } => MessageType::Command,
            Message::Quit => MessageType::Quit,
            Message::Output { .. } => MessageType::Output,
            Message::Status { .. } => MessageType::Status,
            Message::Error { .. } => MessageType::Error,
            Message::Version { .. } => MessageType::Version,
            Message::Noop => MessageType::Noop,
        }
    }

    /// The protocol version byte this message is sent with
    fn version(&self) -> u8 {
        match self {
            Message::Noop => NOOP_VERSION,
            _ => PROTOCOL_VERSION,
        }
    }

    /// Encode the message into a token payload
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.version());
        buf.put_u8(self.message_type().as_u8());
        match self {
            Message::Command {
                keep_alive,
                continuation,
                data,
            } => {
                buf.put_u8(u8::from(*keep_alive));
                buf.put_u8(continuation.as_u8());
                buf.extend_from_slice(data);
            }
            Message::Quit | Message::Noop => {}
            Message::Output { stream, data } => {
                buf.put_u8(stream.as_u8());
                buf.put_u32(data.len() as u32);
                buf.extend_from_slice(data);
            }
            Message::Status { status } => {
                buf.put_u8(*status);
            }
            Message::Error { code, message } => {
                buf.put_u32(*code);
                buf.put_u32(message.len() as u32);
                buf.extend_from_slice(message.as_bytes());
            }
            Message::Version { highest } => {
                buf.put_u8(*highest);
            }
        }
        buf.freeze()
    }

    /// Decode a message from a token payload
    pub fn decode(payload: &Bytes) -> Result<Message, ProtocolError> {
        let mut buf = payload.clone();
        if buf.len() < 2 {
            return Err(ProtocolError::Malformed { what: "result" });
        }
        let version = buf.get_u8();
        let type_byte = buf.get_u8();
        let message_type =
            MessageType::from_u8(type_byte).ok_or(ProtocolError::UnknownMessageType(type_byte))?;

        // NOOP arrived in version 3; everything else is version 2.
        let expected = match message_type {
            MessageType::Noop => NOOP_VERSION,
            _ => PROTOCOL_VERSION,
        };
        if version != expected {
            return Err(ProtocolError::UnknownVersion(version));
        }

        match message_type {
            MessageType::Command => {
                if buf.len() < 2 {
                    return Err(ProtocolError::Malformed { what: "command" });
                }
                let keep_alive = buf.get_u8() != 0;
                let cont = buf.get_u8();
                let continuation = Continuation::from_u8(cont)
                    .ok_or(ProtocolError::Malformed { what: "command" })?;
                Ok(Message::Command {
                    keep_alive,
                    continuation,
                    data: buf,
                })
            }
            MessageType::Quit => Ok(Message::Quit),
            MessageType::Output => {
                if buf.len() < 5 {
                    return Err(ProtocolError::Malformed { what: "output" });
                }
                let stream_byte = buf.get_u8();
                let stream = OutputStream::from_u8(stream_byte)
                    .ok_or(ProtocolError::BadStream(stream_byte))?;
                let length = buf.get_u32() as usize;
                if buf.len() != length {
                    return Err(ProtocolError::Malformed { what: "output" });
                }
                Ok(Message::Output { stream, data: buf })
            }
            MessageType::Status => {
                if buf.len() != 1 {
                    return Err(ProtocolError::Malformed { what: "status" });
                }
                Ok(Message::Status {
                    status: buf.get_u8(),
                })
            }
            MessageType::Error => {
                if buf.len() < 8 {
                    return Err(ProtocolError::Malformed { what: "error" });
                }
                let code = buf.get_u32();
                let length = buf.get_u32() as usize;
                if buf.len() != length {
                    return Err(ProtocolError::Malformed { what: "error" });
                }
                Ok(Message::Error {
                    code,
                    message: String::from_utf8_lossy(&buf).into_owned(),
                })
            }
            MessageType::Version => {
                if buf.len() != 1 {
                    return Err(ProtocolError::Malformed { what: "version" });
                }
                Ok(Message::Version {
                    highest: buf.get_u8(),
                })
            }
            MessageType::Noop => Ok(Message::Noop),
        }
    }
}

/// Serialize an argv into the command body format: argument count
/// followed by a length-prefixed byte string per argument.
fn encode_args(args: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + args.iter().map(|a| 4 + a.len()).sum::<usize>());
    buf.put_u32(args.len() as u32);
    for arg in args {
        buf.put_u32(arg.len() as u32);
        buf.extend_from_slice(arg);
    }
    buf.freeze()
}

/// Parse a complete command body back into its argv.
pub fn decode_args(mut body: Bytes) -> Result<Vec<Bytes>, ProtocolError> {
    if body.len() < 4 {
        return Err(ProtocolError::Malformed { what: "command" });
    }
    let count = body.get_u32() as usize;
    let mut args = Vec::with_capacity(count.min(64));
    for _ in 0..count {
        if body.len() < 4 {
            return Err(ProtocolError::Malformed { what: "command" });
        }
        let length = body.get_u32() as usize;
        if body.len() < length {
            return Err(ProtocolError::Malformed { what: "command" });
        }
        args.push(body.split_to(length));
    }
    if !body.is_empty() {
        return Err(ProtocolError::Malformed { what: "command" });
    }
    Ok(args)
}

/// Build the `Command` messages for an argv, splitting the serialized
/// body across continuation chunks when it exceeds what fits in a
/// single data token.
pub fn split_command(keep_alive: bool, args: &[Bytes]) -> Vec<Message> {
    // Each chunk repeats the 4-byte message header, so the body space
    // per token is the data limit minus that overhead.
    const CHUNK: usize = TOKEN_MAX_DATA - 4;

    let mut body = encode_args(args);
    if body.len() <= CHUNK {
        return vec![Message::Command {
            keep_alive,
            continuation: Continuation::Complete,
            data: body,
        }];
    }

    let mut messages = Vec::with_capacity(body.len() / CHUNK + 1);
    let mut first = true;
    while !body.is_empty() {
        let take = body.len().min(CHUNK);
        let data = body.split_to(take);
        let continuation = if first {
            Continuation::First
        } else if body.is_empty() {
            Continuation::Last
        } else {
            Continuation::Middle
        };
        first = false;
        messages.push(Message::Command {
            keep_alive,
            continuation,
            data,
        });
    }
    messages
}

/// Reassembles a command body from a sequence of `Command` chunks.
///
/// Feed each chunk in arrival order; a finished body is returned for a
/// `Complete` chunk or a `Last` chunk closing an open sequence.
/// Out-of-order continuation statuses are rejected.
#[derive(Debug, Default)]
pub struct CommandAssembler {
    buffer: BytesMut,
    in_progress: bool,
}

impl CommandAssembler {
    /// Create a new assembler
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a split command is partially assembled
    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Add one command chunk, returning the full body once complete
    pub fn push(
        &mut self,
        continuation: Continuation,
        data: &Bytes,
    ) -> Result<Option<Bytes>, ProtocolError> {
        match (continuation, self.in_progress) {
            (Continuation::Complete, false) => Ok(Some(data.clone())),
            (Continuation::First, false) => {
                self.buffer.extend_from_slice(data);
                self.in_progress = true;
                Ok(None)
            }
            (Continuation::Middle, true) => {
                self.buffer.extend_from_slice(data);
                Ok(None)
            }
            (Continuation::Last, true) => {
                self.buffer.extend_from_slice(data);
                self.in_progress = false;
                Ok(Some(self.buffer.split().freeze()))
            }
            _ => {
                self.buffer.clear();
                self.in_progress = false;
                Err(ProtocolError::Malformed { what: "command" })
            }
        }
    }
}
