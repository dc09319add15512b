//! End-to-end client/server tests over an in-process server on an
//! ephemeral port.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use remctl_client::{remctl, ClientError, Output, OutputStream, Remctl};
use remctl_core::{keytab::generate_key, server_handshake, Credential, Keytab};
use remctl_protocol::TokenCodec;
use remctl_server::{Acl, CommandContext, CommandHandler, CommandTable, OutputSink, Server};

const CLIENT_PRINCIPAL: &str = "user@EXAMPLE.ORG";
const SERVER_PRINCIPAL: &str = "host/localhost";

/// Test command backend: `test <subcommand> [args...]`
struct TestHandler;

#[async_trait]
impl CommandHandler for TestHandler {
    async fn run(
        &self,
        _ctx: &CommandContext,
        args: &[Bytes],
        sink: OutputSink,
    ) -> io::Result<u8> {
        match args.get(1).map(|a| a.as_ref()) {
            Some(b"test") => {
                sink.stdout("hello world\n".to_string()).await?;
                Ok(0)
            }
            Some(b"status") => Ok(3),
            Some(b"stderr") => {
                sink.stderr("oops\n".to_string()).await?;
                Ok(1)
            }
            Some(b"big") => {
                // Well past the single-message output limit
                sink.stdout(vec![b'x'; 200_000]).await?;
                Ok(0)
            }
            Some(b"len") => {
                let length = args.get(2).map(|a| a.len()).unwrap_or(0);
                sink.stdout(format!("{}\n", length)).await?;
                Ok(0)
            }
            Some(b"hang") => {
                // Never produces output or a status
                std::future::pending::<()>().await;
                Ok(0)
            }
            _ => Ok(64),
        }
    }
}

/// Denies everyone but admin; used for the access control test
struct SecretHandler;

#[async_trait]
impl CommandHandler for SecretHandler {
    async fn run(
        &self,
        _ctx: &CommandContext,
        _args: &[Bytes],
        _sink: OutputSink,
    ) -> io::Result<u8> {
        Ok(0)
    }
}

/// One in-process server plus the matching client credential cache
struct Fixture {
    addr: SocketAddr,
    ccache: PathBuf,
    shutdown: CancellationToken,
    dir: TempDir,
}

impl Fixture {
    async fn start() -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");

        let key = generate_key();
        let mut keytab = Keytab::new();
        keytab.insert(CLIENT_PRINCIPAL, key);

        let ccache = dir.path().join("ccache.toml");
        Credential::new(CLIENT_PRINCIPAL, key)
            .save(&ccache)
            .expect("save ccache");

        let mut table = CommandTable::new();
        table.add("test", None, Acl::AnyUser, Arc::new(TestHandler));
        table.add(
            "secure",
            Some("op"),
            Acl::Principals(vec!["admin@EXAMPLE.ORG".to_string()]),
            Arc::new(SecretHandler),
        );

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let server = Server::new(keytab, SERVER_PRINCIPAL, table);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        tokio::spawn(async move {
            let _ = server.run_listener(listener, token).await;
        });

        Fixture {
            addr,
            ccache,
            shutdown,
            dir,
        }
    }

    async fn open_session(&self) -> Remctl {
        let mut session = Remctl::new();
        session.set_ccache(&self.ccache);
        session
            .open("127.0.0.1", self.addr.port(), Some(SERVER_PRINCIPAL))
            .await
            .expect("open session");
        session
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Drain output for the current command into (stdout, stderr, last token)
async fn collect(session: &mut Remctl) -> (Vec<u8>, Vec<u8>, Output) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        match session.output().await.expect("output") {
            Output::Output {
                stream: OutputStream::Stdout,
                data,
            } => stdout.extend_from_slice(&data),
            Output::Output {
                stream: OutputStream::Stderr,
                data,
            } => stderr.extend_from_slice(&data),
            last => return (stdout, stderr, last),
        }
    }
}

#[tokio::test]
async fn test_simple_interface() {
    let fixture = Fixture::start().await;
    // The simple interface resolves credentials through the
    // environment; both simple-interface scenarios share this test so
    // the variable is set exactly once per process.
    std::env::set_var("REMCTL_CCACHE", &fixture.ccache);

    let result = remctl(
        "127.0.0.1",
        fixture.addr.port(),
        Some(SERVER_PRINCIPAL),
        &["test", "test"],
    )
    .await
    .expect("run command");
    assert_eq!(result.stdout, b"hello world\n");
    assert!(result.stderr.is_empty());
    assert_eq!(result.status, 0);

    // "test" has a wildcard entry, so an unknown subcommand still runs
    // the backend, which reports it with its own status.
    let fallback = remctl(
        "127.0.0.1",
        fixture.addr.port(),
        Some(SERVER_PRINCIPAL),
        &["test", "bad-command"],
    )
    .await
    .expect("run unknown subcommand");
    assert_eq!(fallback.status, 64);

    let err = remctl(
        "127.0.0.1",
        fixture.addr.port(),
        Some(SERVER_PRINCIPAL),
        &["no-such-command"],
    )
    .await
    .expect_err("unknown command should fail");
    match err {
        ClientError::Remote { code, message } => {
            assert_eq!(code, 5);
            assert_eq!(message, "Unknown command");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_session_hello_world() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session.command(&["test", "test"]).await.expect("command");
    let (stdout, stderr, last) = collect(&mut session).await;
    assert_eq!(stdout, b"hello world\n");
    assert!(stderr.is_empty());
    assert_eq!(last, Output::Status { status: 0 });

    // After the status token, further reads return Done
    assert_eq!(session.output().await.expect("output"), Output::Done);
    assert_eq!(session.error(), "no error");
    session.close().await;
}

#[tokio::test]
async fn test_session_unknown_command() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session
        .command(&["no-such-command", "x"])
        .await
        .expect("command");
    let (stdout, _, last) = collect(&mut session).await;
    assert!(stdout.is_empty());
    assert_eq!(
        last,
        Output::Error {
            code: 5,
            message: "Unknown command".to_string(),
        }
    );
    assert_eq!(session.output().await.expect("output"), Output::Done);
    session.close().await;
}

#[tokio::test]
async fn test_access_denied() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session.command(&["secure", "op"]).await.expect("command");
    let (_, _, last) = collect(&mut session).await;
    assert_eq!(
        last,
        Output::Error {
            code: 6,
            message: "Access denied".to_string(),
        }
    );
    session.close().await;
}

#[tokio::test]
async fn test_multiple_commands_one_session() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    for _ in 0..3 {
        session.command(&["test", "test"]).await.expect("command");
        let (stdout, _, last) = collect(&mut session).await;
        assert_eq!(stdout, b"hello world\n");
        assert_eq!(last, Output::Status { status: 0 });
    }

    session.command(&["test", "status"]).await.expect("command");
    let (_, _, last) = collect(&mut session).await;
    assert_eq!(last, Output::Status { status: 3 });
    session.close().await;
}

#[tokio::test]
async fn test_noop_between_commands() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session.noop().await.expect("noop");
    session.command(&["test", "test"]).await.expect("command");
    let (stdout, _, _) = collect(&mut session).await;
    assert_eq!(stdout, b"hello world\n");
    session.close().await;
}

#[tokio::test]
async fn test_stderr_stream() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session.command(&["test", "stderr"]).await.expect("command");
    let (stdout, stderr, last) = collect(&mut session).await;
    assert!(stdout.is_empty());
    assert_eq!(stderr, b"oops\n");
    assert_eq!(last, Output::Status { status: 1 });
    session.close().await;
}

#[tokio::test]
async fn test_large_output_is_chunked() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    session.command(&["test", "big"]).await.expect("command");
    let mut total = 0usize;
    let mut chunks = 0usize;
    let status = loop {
        match session.output().await.expect("output") {
            Output::Output { data, .. } => {
                assert!(data.len() <= remctl_protocol::MAX_OUTPUT_DATA);
                total += data.len();
                chunks += 1;
            }
            Output::Status { status } => break status,
            other => panic!("unexpected token {:?}", other),
        }
    };
    assert_eq!(total, 200_000);
    assert!(chunks > 1);
    assert_eq!(status, 0);
    session.close().await;
}

#[tokio::test]
async fn test_large_command_is_split() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    // Argument larger than a single data token; the command is split
    // across continuation tokens and reassembled server-side.
    let big = vec![b'y'; 150_000];
    session
        .command(&[b"test".to_vec(), b"len".to_vec(), big])
        .await
        .expect("command");
    let (stdout, _, last) = collect(&mut session).await;
    assert_eq!(stdout, b"150000\n");
    assert_eq!(last, Output::Status { status: 0 });
    session.close().await;
}

#[tokio::test]
async fn test_double_close_is_idempotent() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;

    assert!(session.is_open());
    session.close().await;
    assert!(!session.is_open());
    session.close().await;
    assert_eq!(session.error(), "no currently open connection");
}

#[tokio::test]
async fn test_wrong_server_principal_rejected() {
    let fixture = Fixture::start().await;
    let mut session = Remctl::new();
    session.set_ccache(&fixture.ccache);

    let result = session
        .open("127.0.0.1", fixture.addr.port(), Some("host/imposter"))
        .await;
    assert!(matches!(result, Err(ClientError::Auth(_))));
    assert!(!session.is_open());
    assert_ne!(session.error(), "no error");
}

#[tokio::test]
async fn test_unknown_client_rejected() {
    let fixture = Fixture::start().await;
    let unknown = fixture.dir.path().join("unknown.toml");
    Credential::new("stranger@EXAMPLE.ORG", generate_key())
        .save(&unknown)
        .expect("save ccache");

    let mut session = Remctl::new();
    session.set_ccache(&unknown);
    let result = session
        .open("127.0.0.1", fixture.addr.port(), Some(SERVER_PRINCIPAL))
        .await;
    assert!(matches!(result, Err(ClientError::Auth(_))));
}

#[tokio::test]
async fn test_timeout_poisons_session() {
    let fixture = Fixture::start().await;
    let mut session = fixture.open_session().await;
    session.set_timeout(Some(Duration::from_millis(200)));

    session.command(&["test", "hang"]).await.expect("command");
    let result = session.output().await;
    assert!(matches!(result, Err(ClientError::Timeout)));

    // A timed-out read leaves the protocol state unknown; the session
    // drops the connection and must be reopened.
    assert!(!session.is_open());
    assert!(matches!(session.output().await, Err(ClientError::NotOpen)));
    assert!(matches!(
        session.command(&["test", "test"]).await,
        Err(ClientError::NotOpen)
    ));
}

#[tokio::test]
async fn test_server_eof_mid_command_poisons_session() {
    let dir = tempfile::tempdir().expect("tempdir");
    let key = generate_key();
    let mut keytab = Keytab::new();
    keytab.insert(CLIENT_PRINCIPAL, key);
    let ccache = dir.path().join("ccache.toml");
    Credential::new(CLIENT_PRINCIPAL, key)
        .save(&ccache)
        .expect("save ccache");

    // A server that authenticates, reads one command token, then
    // drops the connection without answering.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let mut framed = Framed::new(stream, TokenCodec::new());
        let _ = server_handshake(&mut framed, &keytab, SERVER_PRINCIPAL).await;
        let _ = framed.next().await;
    });

    let mut session = Remctl::new();
    session.set_ccache(&ccache);
    session
        .open("127.0.0.1", addr.port(), Some(SERVER_PRINCIPAL))
        .await
        .expect("open session");
    session.command(&["test", "test"]).await.expect("command");

    let result = session.output().await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert!(!session.is_open());
    assert!(matches!(session.output().await, Err(ClientError::NotOpen)));
}

#[tokio::test]
async fn test_principal_derived_from_host() {
    let fixture = Fixture::start().await;
    let mut session = Remctl::new();
    session.set_ccache(&fixture.ccache);

    // No explicit principal: the client derives host/localhost from
    // the hostname, which matches the server's identity.
    session
        .open("localhost", fixture.addr.port(), None)
        .await
        .expect("open session");
    session.command(&["test", "test"]).await.expect("command");
    let (stdout, _, _) = collect(&mut session).await;
    assert_eq!(stdout, b"hello world\n");
    session.close().await;
}
