//! remctl-server: authenticated remote command execution server
//!
//! Listens for remctl connections, authenticates each client, and
//! dispatches commands to registered handlers, streaming their output
//! back as protocol tokens.

pub mod config;
pub mod dispatch;
pub mod program;
pub mod server;

pub use config::{CommandConfig, ConfigError, ServerConfig};
pub use dispatch::{Acl, CommandContext, CommandHandler, CommandTable, OutputSink};
pub use program::ProgramHandler;
pub use server::{Server, ServerError};
