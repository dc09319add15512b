//! Connection acceptance and the per-connection protocol loop

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use remctl_core::{server_handshake, AuthError, Keytab, SecurityContext};
use remctl_protocol::{
    decode_args, CommandAssembler, ErrorCode, Message, ProtocolError, Token, TokenCodec,
    HIGHEST_VERSION, MAX_OUTPUT_DATA, TOKEN_MAX_DATA,
};

use crate::dispatch::{CommandContext, CommandTable, Dispatch, OutputSink};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Shared server state: authentication material plus the dispatch table
struct Inner {
    keytab: Keytab,
    principal: String,
    table: CommandTable,
}

/// The remctl server.
///
/// Accepts connections, authenticates each one against the keytab, and
/// serves commands from the dispatch table until the client quits or
/// the shutdown token fires.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(keytab: Keytab, principal: impl Into<String>, table: CommandTable) -> Self {
        Self {
            inner: Arc::new(Inner {
                keytab,
                principal: principal.into(),
                table,
            }),
        }
    }

    /// Bind `addr` and serve until `shutdown` is cancelled
    pub async fn run(&self, addr: &str, shutdown: CancellationToken) -> Result<(), ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        info!(addr, "listening");
        self.run_listener(listener, shutdown).await
    }

    /// Serve connections from an already-bound listener until `shutdown`
    /// is cancelled. In-flight connections are left to finish on their
    /// own tasks.
    pub async fn run_listener(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), ServerError> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down listener");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    debug!(%peer, "accepted connection");
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            match e {
                                ServerError::ConnectionClosed => {
                                    debug!(%peer, "connection closed");
                                }
                                e => warn!(%peer, error = %e, "connection failed"),
                            }
                        }
                    });
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), ServerError> {
        let _ = stream.set_nodelay(true);
        let mut framed = Framed::new(stream, TokenCodec::new());
        let (context, principal) =
            server_handshake(&mut framed, &self.inner.keytab, &self.inner.principal).await?;
        info!(principal, "client authenticated");

        let mut conn = ServerConnection {
            framed,
            context,
            principal,
        };
        let mut assembler = CommandAssembler::new();

        loop {
            let payload = match conn.recv_payload().await {
                Ok(payload) => payload,
                Err(ServerError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            if payload.len() > TOKEN_MAX_DATA {
                conn.send_error(ErrorCode::TooMuchData).await?;
                continue;
            }

            let message = match Message::decode(&payload) {
                Ok(message) => message,
                Err(ProtocolError::UnknownVersion(version)) => {
                    debug!(version, "client spoke a newer version");
                    conn.send_message(&Message::Version {
                        highest: HIGHEST_VERSION,
                    })
                    .await?;
                    continue;
                }
                Err(ProtocolError::UnknownMessageType(_)) => {
                    conn.send_error(ErrorCode::UnknownMessage).await?;
                    continue;
                }
                Err(_) => {
                    conn.send_error(ErrorCode::BadToken).await?;
                    continue;
                }
            };

            match message {
                Message::Command {
                    keep_alive,
                    continuation,
                    data,
                } => {
                    let body = match assembler.push(continuation, &data) {
                        Ok(Some(body)) => body,
                        Ok(None) => continue,
                        Err(_) => {
                            conn.send_error(ErrorCode::BadCommand).await?;
                            continue;
                        }
                    };
                    let args = match decode_args(body) {
                        Ok(args) => args,
                        Err(_) => {
                            conn.send_error(ErrorCode::BadCommand).await?;
                            continue;
                        }
                    };
                    self.run_command(&mut conn, &args).await?;
                    if !keep_alive {
                        return Ok(());
                    }
                }
                Message::Quit => return Ok(()),
                Message::Noop => conn.send_message(&Message::Noop).await?,
                _ => conn.send_error(ErrorCode::UnexpectedMessage).await?,
            }
        }
    }

    /// Dispatch one assembled command and stream its output back
    async fn run_command(
        &self,
        conn: &mut ServerConnection,
        args: &[Bytes],
    ) -> Result<(), ServerError> {
        let handler = match self.inner.table.lookup(args, &conn.principal) {
            Dispatch::Run(handler) => Arc::clone(handler),
            Dispatch::Unknown => {
                debug!(principal = %conn.principal, "unknown command");
                return conn.send_error(ErrorCode::UnknownCommand).await;
            }
            Dispatch::Denied => {
                warn!(principal = %conn.principal, "access denied");
                return conn.send_error(ErrorCode::AccessDenied).await;
            }
        };

        let ctx = CommandContext {
            principal: conn.principal.clone(),
        };
        let (sink, mut rx) = OutputSink::channel(16);
        let task_args = args.to_vec();
        let task = tokio::spawn(async move { handler.run(&ctx, &task_args, sink).await });

        // Forward output as it arrives; the channel closes when the
        // handler drops its sink.
        while let Some((stream, data)) = rx.recv().await {
            for chunk in data.chunks(MAX_OUTPUT_DATA) {
                conn.send_message(&Message::Output {
                    stream,
                    data: Bytes::copy_from_slice(chunk),
                })
                .await?;
            }
        }

        match task.await {
            Ok(Ok(status)) => conn.send_message(&Message::Status { status }).await,
            Ok(Err(e)) => {
                error!(error = %e, "command handler failed");
                conn.send_error(ErrorCode::Internal).await
            }
            Err(e) => {
                error!(error = %e, "command handler panicked");
                conn.send_error(ErrorCode::Internal).await
            }
        }
    }
}

/// An authenticated connection: framed socket, security context, and
/// the client's principal
struct ServerConnection {
    framed: Framed<TcpStream, TokenCodec>,
    context: SecurityContext,
    principal: String,
}

impl ServerConnection {
    async fn send_message(&mut self, message: &Message) -> Result<(), ServerError> {
        let wrapped = self.context.wrap(&message.encode());
        self.framed.send(Token::data(wrapped)).await?;
        Ok(())
    }

    async fn send_error(&mut self, code: ErrorCode) -> Result<(), ServerError> {
        self.send_message(&Message::Error {
            code: code.as_u32(),
            message: code.text().to_string(),
        })
        .await
    }

    /// Read and verify one protected payload
    async fn recv_payload(&mut self) -> Result<Bytes, ServerError> {
        let token = match self.framed.next().await {
            Some(Ok(token)) => token,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(ServerError::ConnectionClosed),
        };
        if !token.is_data() {
            return Err(ServerError::Protocol(ProtocolError::UnexpectedFlags(
                token.flags,
            )));
        }
        Ok(self.context.unwrap(&token.payload)?)
    }
}
