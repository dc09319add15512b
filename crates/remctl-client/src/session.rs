//! Stateful session client
//!
//! A [`Remctl`] session holds one authenticated connection and sends
//! commands over it serially. Output for the most recent command is
//! consumed token by token with [`Remctl::output`] until [`Output::Done`]
//! is observed.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::{Future, SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio_util::codec::Framed;

use remctl_core::{client_handshake, default_principal, Credential, SecurityContext};
use remctl_protocol::{
    split_command, Message, OutputStream, ProtocolError, Token, TokenCodec, DEFAULT_PORT,
    FALLBACK_PORT,
};

use crate::error::ClientError;

/// One output token from the server for the current command.
///
/// Zero or more `Output` tokens arrive first; exactly one `Status` or
/// `Error` follows; after that every read returns `Done` until the next
/// command is sent. Interleaving of stdout and stderr chunks is arrival
/// order, not grouped by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// A chunk of stdout or stderr bytes
    Output {
        /// Which stream the data belongs to
        stream: OutputStream,
        /// Output bytes
        data: Bytes,
    },
    /// Final exit status of the remote command
    Status {
        /// Remote exit status
        status: u8,
    },
    /// Protocol-level error terminating the exchange
    Error {
        /// Error code
        code: u32,
        /// Server-supplied diagnostic
        message: String,
    },
    /// No further tokens follow for this command
    Done,
}

/// Open connection state: framed socket plus security context
struct Connection {
    framed: Framed<TcpStream, TokenCodec>,
    context: SecurityContext,
}

impl Connection {
    async fn send_message(&mut self, message: &Message) -> Result<(), ClientError> {
        let wrapped = self.context.wrap(&message.encode());
        self.framed.send(Token::data(wrapped)).await?;
        Ok(())
    }

    async fn recv_message(&mut self) -> Result<Message, ClientError> {
        let token = match self.framed.next().await {
            Some(Ok(token)) => token,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ClientError::ConnectionClosed),
        };
        if !token.is_data() {
            return Err(ClientError::Protocol(ProtocolError::UnexpectedFlags(
                token.flags,
            )));
        }
        let payload = self.context.unwrap(&token.payload)?;
        Ok(Message::decode(&payload)?)
    }
}

/// A persistent remctl session.
///
/// The session starts closed; [`open`](Remctl::open) authenticates a
/// connection, after which commands may be issued repeatedly. All
/// operations take `&mut self`: one command is in flight at a time, and
/// sharing a session across tasks requires external locking.
pub struct Remctl {
    conn: Option<Connection>,
    /// Output tokens are pending for the most recent command
    ready: bool,
    timeout: Option<Duration>,
    source: Option<IpAddr>,
    ccache: Option<PathBuf>,
    last_error: Option<String>,
}

impl Default for Remctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Remctl {
    /// Create a closed session. No I/O happens until `open`.
    pub fn new() -> Self {
        Self {
            conn: None,
            ready: false,
            timeout: None,
            source: None,
            ccache: None,
            last_error: None,
        }
    }

    /// Whether the session currently holds an open connection
    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    /// Use the credential cache at `path` instead of the default
    /// resolution (the `REMCTL_CCACHE` environment variable, then the
    /// user config dir). Takes effect at the next `open`.
    pub fn set_ccache(&mut self, path: impl Into<PathBuf>) {
        self.ccache = Some(path.into());
    }

    /// Set the source IP address for outgoing connections. Takes effect
    /// at the next `open`.
    pub fn set_source_ip(&mut self, source: &str) -> Result<(), ClientError> {
        let result = source
            .parse::<IpAddr>()
            .map(|addr| {
                self.source = Some(addr);
            })
            .map_err(|_| ClientError::InvalidSource(source.to_string()));
        self.record(&result);
        result
    }

    /// Set the network timeout, or `None` for no timeout (the default).
    ///
    /// The timeout bounds connection establishment (including the
    /// authentication handshake) as well as each subsequent send and
    /// blocking read. An operation that times out leaves the session
    /// unusable; close and reopen it.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout.filter(|d| !d.is_zero());
    }

    /// Open a connection to `host` and authenticate.
    ///
    /// A port of 0 means the standard port, falling back to the legacy
    /// port if the standard one is unreachable. When `principal` is
    /// `None`, the host-based service principal of the target is used.
    /// On failure the session remains closed and the diagnostic is
    /// available from [`error`](Remctl::error).
    pub async fn open(
        &mut self,
        host: &str,
        port: u16,
        principal: Option<&str>,
    ) -> Result<(), ClientError> {
        let timeout = self.timeout;
        let result = timed(timeout, self.open_inner(host, port, principal)).await;
        self.record(&result);
        result
    }

    async fn open_inner(
        &mut self,
        host: &str,
        port: u16,
        principal: Option<&str>,
    ) -> Result<(), ClientError> {
        // Drop any existing connection before reconfiguring.
        self.close().await;

        let stream = if port == 0 {
            match self.connect(host, DEFAULT_PORT).await {
                Ok(stream) => stream,
                Err(primary) => match self.connect(host, FALLBACK_PORT).await {
                    Ok(stream) => stream,
                    // The standard-port error is the one worth reporting.
                    Err(_) => return Err(primary),
                },
            }
        } else {
            self.connect(host, port).await?
        };
        let _ = stream.set_nodelay(true);

        let credential =
            Credential::resolve(self.ccache.as_deref()).map_err(remctl_core::AuthError::from)?;
        let principal = principal
            .map(str::to_owned)
            .unwrap_or_else(|| default_principal(host));

        let mut framed = Framed::new(stream, TokenCodec::new());
        let context = client_handshake(&mut framed, &credential, &principal).await?;
        tracing::debug!(host, principal, "session opened");
        self.conn = Some(Connection { framed, context });
        self.ready = false;
        Ok(())
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream, ClientError> {
        let connect_err = |source| ClientError::Connect {
            host: host.to_string(),
            port,
            source,
        };
        let addrs = lookup_host((host, port)).await.map_err(connect_err)?;
        let mut last = None;
        for addr in addrs {
            match self.connect_addr(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => last = Some(e),
            }
        }
        Err(connect_err(last.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
        })))
    }

    async fn connect_addr(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        match self.source {
            Some(source) => {
                if source.is_ipv4() != addr.is_ipv4() {
                    return Err(io::Error::new(
                        io::ErrorKind::AddrNotAvailable,
                        "source address family does not match destination",
                    ));
                }
                let socket = match addr {
                    SocketAddr::V4(_) => TcpSocket::new_v4()?,
                    SocketAddr::V6(_) => TcpSocket::new_v6()?,
                };
                socket.bind(SocketAddr::new(source, 0))?;
                socket.connect(addr).await
            }
            None => TcpStream::connect(addr).await,
        }
    }

    /// Send one command over the open session.
    ///
    /// Arguments are opaque byte strings. Commands whose serialized
    /// form exceeds the single-token limit are split across
    /// continuation tokens transparently.
    pub async fn command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<(), ClientError> {
        let timeout = self.timeout;
        let args: Vec<Bytes> = args
            .iter()
            .map(|arg| Bytes::copy_from_slice(arg.as_ref()))
            .collect();
        let result = timed(timeout, self.command_inner(args)).await;
        self.poison(&result);
        self.record(&result);
        result
    }

    async fn command_inner(&mut self, args: Vec<Bytes>) -> Result<(), ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotOpen)?;
        if args.is_empty() {
            return Err(ClientError::EmptyCommand);
        }
        for message in split_command(true, &args) {
            conn.send_message(&message).await?;
        }
        self.ready = true;
        Ok(())
    }

    /// Read the next output token for the most recent command.
    ///
    /// Returns [`Output::Done`] without touching the network once a
    /// `Status` or `Error` token has been consumed (or before any
    /// command was sent).
    pub async fn output(&mut self) -> Result<Output, ClientError> {
        let timeout = self.timeout;
        let result = timed(timeout, self.output_inner()).await;
        self.poison(&result);
        self.record(&result);
        result
    }

    async fn output_inner(&mut self) -> Result<Output, ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotOpen)?;
        if !self.ready {
            return Ok(Output::Done);
        }
        match conn.recv_message().await? {
            Message::Output { stream, data } => Ok(Output::Output { stream, data }),
            Message::Status { status } => {
                self.ready = false;
                Ok(Output::Status { status })
            }
            Message::Error { code, message } => {
                self.ready = false;
                Ok(Output::Error { code, message })
            }
            other => Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                other.message_type(),
            ))),
        }
    }

    /// Send a keep-alive to validate the connection without side
    /// effects. Only meaningful between commands.
    pub async fn noop(&mut self) -> Result<(), ClientError> {
        let timeout = self.timeout;
        let result = timed(timeout, self.noop_inner()).await;
        self.poison(&result);
        self.record(&result);
        result
    }

    async fn noop_inner(&mut self) -> Result<(), ClientError> {
        let conn = self.conn.as_mut().ok_or(ClientError::NotOpen)?;
        conn.send_message(&Message::Noop).await?;
        match conn.recv_message().await? {
            Message::Noop => Ok(()),
            // An older server that predates NOOP answers with an error.
            Message::Error { code, message } => Err(ClientError::Remote { code, message }),
            other => Err(ClientError::Protocol(ProtocolError::UnexpectedMessage(
                other.message_type(),
            ))),
        }
    }

    /// Close the connection. Idempotent; a closed session reports
    /// "no currently open connection" from [`error`](Remctl::error).
    pub async fn close(&mut self) {
        if let Some(mut conn) = self.conn.take() {
            // Best-effort QUIT so the server tears down cleanly.
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                conn.send_message(&Message::Quit),
            )
            .await;
        }
        self.ready = false;
        self.last_error = None;
    }

    /// The last diagnostic from a failed operation. Never fails, so it
    /// is safe to call while handling another error, including after
    /// the session has been closed.
    pub fn error(&self) -> &str {
        match (&self.last_error, &self.conn) {
            (Some(message), _) => message,
            (None, Some(_)) => "no error",
            (None, None) => "no currently open connection",
        }
    }

    fn record<T>(&mut self, result: &Result<T, ClientError>) {
        match result {
            Ok(_) => self.last_error = None,
            Err(e) => self.last_error = Some(e.to_string()),
        }
    }

    /// A timeout or unexpected EOF leaves the protocol state unknown;
    /// the connection cannot be used again.
    fn poison<T>(&mut self, result: &Result<T, ClientError>) {
        if matches!(
            result,
            Err(ClientError::Timeout | ClientError::ConnectionClosed)
        ) {
            self.conn = None;
            self.ready = false;
        }
    }
}

async fn timed<T>(
    timeout: Option<Duration>,
    fut: impl Future<Output = Result<T, ClientError>>,
) -> Result<T, ClientError> {
    match timeout {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| ClientError::Timeout)?,
        None => fut.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_command_requires_open_session() {
        let mut session = Remctl::new();
        let result = session.command(&["test", "test"]).await;
        assert!(matches!(result, Err(ClientError::NotOpen)));
        assert_eq!(session.error(), "no currently open connection");
    }

    #[tokio::test]
    async fn test_output_requires_open_session() {
        let mut session = Remctl::new();
        assert!(matches!(session.output().await, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn test_noop_requires_open_session() {
        let mut session = Remctl::new();
        assert!(matches!(session.noop().await, Err(ClientError::NotOpen)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let mut session = Remctl::new();
        session.close().await;
        session.close().await;
        assert_eq!(session.error(), "no currently open connection");
    }

    #[test]
    fn test_error_before_any_operation() {
        let session = Remctl::new();
        assert!(!session.is_open());
        assert_eq!(session.error(), "no currently open connection");
    }

    #[test]
    fn test_set_source_ip_validation() {
        let mut session = Remctl::new();
        assert!(session.set_source_ip("127.0.0.1").is_ok());
        assert!(session.set_source_ip("::1").is_ok());
        let result = session.set_source_ip("not-an-address");
        assert!(matches!(result, Err(ClientError::InvalidSource(_))));
        assert!(session.error().contains("not-an-address"));
    }

    #[test]
    fn test_zero_timeout_means_none() {
        let mut session = Remctl::new();
        session.set_timeout(Some(Duration::ZERO));
        assert!(session.timeout.is_none());
        session.set_timeout(Some(Duration::from_secs(5)));
        assert_eq!(session.timeout, Some(Duration::from_secs(5)));
    }
}
