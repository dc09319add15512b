//! Client error types

use remctl_core::AuthError;
use remctl_protocol::ProtocolError;
use thiserror::Error;

/// Errors returned by the client interfaces
#[derive(Error, Debug)]
pub enum ClientError {
    /// Operation requires an open session
    #[error("no currently open connection")]
    NotOpen,

    /// Command argument vector was empty
    #[error("cannot send empty command")]
    EmptyCommand,

    /// Port string was not a number in 0-65535
    #[error("invalid port number: {0}")]
    InvalidPort(String),

    /// Source address string did not parse as an IP address
    #[error("invalid source address: {0}")]
    InvalidSource(String),

    /// Could not reach the server
    #[error("cannot connect to {host} (port {port}): {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// Authentication handshake failed
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// Wire protocol violation
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The server reported an application-level error for the command
    /// (simple interface only; the session interface returns these as
    /// regular output tokens)
    #[error("{message}")]
    Remote {
        /// Protocol error code
        code: u32,
        /// Server-supplied diagnostic
        message: String,
    },

    /// A network operation exceeded the configured timeout
    #[error("network operation timed out")]
    Timeout,

    /// Server closed the connection unexpectedly
    #[error("connection closed by server")]
    ConnectionClosed,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
