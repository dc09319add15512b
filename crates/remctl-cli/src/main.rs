//! remctl command-line client
//!
//! Runs one command on a remote server, streaming its stdout and
//! stderr to the local streams, and exits with the remote status.
//! Local and protocol failures exit with status 255.

use std::io::{self, Write};
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use remctl_client::{parse_port, ClientError, Output, Remctl};

#[derive(Parser)]
#[command(name = "remctl")]
#[command(about = "remctl remote command execution client")]
#[command(version)]
struct Args {
    /// Source IP address for the outgoing connection
    #[arg(short = 'b', long = "source")]
    source: Option<String>,

    /// Port to connect to (0 means the standard port with fallback)
    #[arg(short, long, default_value = "0")]
    port: String,

    /// Server principal to authenticate against
    #[arg(short = 's', long = "service")]
    principal: Option<String>,

    /// Network timeout in seconds (0 means none)
    #[arg(short, long, default_value = "0")]
    timeout: u64,

    /// Host to connect to
    host: String,

    /// Command and arguments to run remotely
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(status) => ExitCode::from(status),
        Err(e) => {
            eprintln!("remctl: {}", e);
            ExitCode::from(255)
        }
    }
}

async fn run(args: Args) -> Result<u8, ClientError> {
    let port = parse_port(&args.port)?;
    tracing::debug!(host = %args.host, port, "running remote command");

    let mut session = Remctl::new();
    if let Some(source) = &args.source {
        session.set_source_ip(source)?;
    }
    if args.timeout > 0 {
        session.set_timeout(Some(Duration::from_secs(args.timeout)));
    }

    session
        .open(&args.host, port, args.principal.as_deref())
        .await?;
    session.command(&args.command).await?;

    let status = loop {
        match session.output().await? {
            Output::Output { stream, data } => write_stream(stream, &data)?,
            Output::Status { status } => break status,
            Output::Error { code, message } => {
                session.close().await;
                return Err(ClientError::Remote { code, message });
            }
            Output::Done => break 0,
        }
    };
    session.close().await;
    tracing::debug!(status, "remote command finished");
    Ok(status)
}

fn write_stream(stream: remctl_client::OutputStream, data: &[u8]) -> io::Result<()> {
    match stream {
        remctl_client::OutputStream::Stdout => {
            let mut stdout = io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()
        }
        remctl_client::OutputStream::Stderr => {
            let mut stderr = io::stderr().lock();
            stderr.write_all(data)?;
            stderr.flush()
        }
    }
}
