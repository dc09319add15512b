//! Command dispatch
//!
//! Maps (command, subcommand) pairs to handlers and checks access
//! before anything runs. Handlers stream output through an
//! [`OutputSink`]; the connection loop forwards each chunk to the
//! client as it arrives, so stdout and stderr interleave in production
//! order.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use remctl_protocol::OutputStream;

/// Wildcard subcommand matching any subcommand for a command
pub const ANY_SUBCOMMAND: &str = "ALL";

/// Who a command entry admits
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acl {
    /// Any authenticated principal
    AnyUser,
    /// Only the listed principals
    Principals(Vec<String>),
}

impl Acl {
    /// Whether the given principal may run the command
    pub fn permits(&self, principal: &str) -> bool {
        match self {
            Acl::AnyUser => true,
            Acl::Principals(list) => list.iter().any(|p| p == principal),
        }
    }
}

/// Information about the authenticated caller
#[derive(Debug, Clone)]
pub struct CommandContext {
    /// Authenticated client principal
    pub principal: String,
}

/// Streams output chunks from a handler back to the connection loop
#[derive(Clone)]
pub struct OutputSink {
    tx: mpsc::Sender<(OutputStream, Bytes)>,
}

impl OutputSink {
    /// Create a sink and the receiving end for the connection loop
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<(OutputStream, Bytes)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Send a chunk on the given stream
    pub async fn send(&self, stream: OutputStream, data: Bytes) -> io::Result<()> {
        self.tx
            .send((stream, data))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }

    /// Send a chunk of standard output
    pub async fn stdout(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.send(OutputStream::Stdout, data.into()).await
    }

    /// Send a chunk of standard error
    pub async fn stderr(&self, data: impl Into<Bytes>) -> io::Result<()> {
        self.send(OutputStream::Stderr, data.into()).await
    }
}

/// A command implementation.
///
/// `args` is the full argv as received, command and subcommand
/// included. The returned value becomes the remote exit status.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// Run the command, streaming output through `sink`
    async fn run(
        &self,
        ctx: &CommandContext,
        args: &[Bytes],
        sink: OutputSink,
    ) -> io::Result<u8>;
}

/// One dispatchable command
struct CommandEntry {
    command: String,
    subcommand: Option<String>,
    acl: Acl,
    handler: Arc<dyn CommandHandler>,
}

/// Result of looking up an incoming command
pub enum Dispatch<'a> {
    /// Run this handler
    Run(&'a Arc<dyn CommandHandler>),
    /// No matching entry
    Unknown,
    /// Entry exists but the principal is not allowed
    Denied,
}

/// The set of commands a server offers
#[derive(Default)]
pub struct CommandTable {
    entries: Vec<CommandEntry>,
}

impl CommandTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a command. A `subcommand` of `None`
    /// matches any subcommand (and commands with no subcommand at all).
    pub fn add(
        &mut self,
        command: impl Into<String>,
        subcommand: Option<&str>,
        acl: Acl,
        handler: Arc<dyn CommandHandler>,
    ) {
        self.entries.push(CommandEntry {
            command: command.into(),
            subcommand: subcommand
                .filter(|s| *s != ANY_SUBCOMMAND)
                .map(str::to_owned),
            acl,
            handler,
        });
    }

    /// Look up the handler for an argv on behalf of a principal.
    ///
    /// An exact subcommand match always wins over a wildcard entry for
    /// the same command, and its ACL decision is terminal: a denied
    /// exact match is never retried against a more permissive wildcard.
    pub fn lookup(&self, args: &[Bytes], principal: &str) -> Dispatch<'_> {
        let command = match args.first() {
            Some(arg) => String::from_utf8_lossy(arg),
            None => return Dispatch::Unknown,
        };
        let subcommand = args.get(1).map(|arg| String::from_utf8_lossy(arg));

        let mut wildcard = None;
        for entry in &self.entries {
            if entry.command != command {
                continue;
            }
            match (&entry.subcommand, &subcommand) {
                (Some(want), Some(have)) if want == have => {
                    return if entry.acl.permits(principal) {
                        Dispatch::Run(&entry.handler)
                    } else {
                        Dispatch::Denied
                    };
                }
                (None, _) => {
                    if wildcard.is_none() {
                        wildcard = Some(entry);
                    }
                }
                _ => {}
            }
        }
        match wildcard {
            Some(entry) if entry.acl.permits(principal) => Dispatch::Run(&entry.handler),
            Some(_) => Dispatch::Denied,
            None => Dispatch::Unknown,
        }
    }
}
