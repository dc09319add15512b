//! Running external programs as command handlers

use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use remctl_protocol::OutputStream;

use crate::dispatch::{CommandContext, CommandHandler, OutputSink};

const READ_BUF: usize = 8192;

/// Runs a configured executable for each matching command.
///
/// The command and subcommand words are passed through as the
/// program's first arguments, so one executable can serve several
/// entries. The caller's principal is exported in `REMCTL_USER`.
pub struct ProgramHandler {
    executable: PathBuf,
}

impl ProgramHandler {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

#[async_trait]
impl CommandHandler for ProgramHandler {
    async fn run(
        &self,
        ctx: &CommandContext,
        args: &[Bytes],
        sink: OutputSink,
    ) -> io::Result<u8> {
        let mut command = Command::new(&self.executable);
        for arg in &args[1..] {
            command.arg(os_arg(arg)?);
        }
        command
            .env("REMCTL_USER", &ctx.principal)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(program = %self.executable.display(), "spawning command");
        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let out_sink = sink.clone();
        let out_task = async move {
            if let Some(stdout) = stdout {
                forward(stdout, OutputStream::Stdout, out_sink).await
            } else {
                Ok(())
            }
        };
        let err_task = async move {
            if let Some(stderr) = stderr {
                forward(stderr, OutputStream::Stderr, sink).await
            } else {
                Ok(())
            }
        };

        let (out_res, err_res) = tokio::join!(out_task, err_task);
        out_res?;
        err_res?;

        let status = child.wait().await?;
        // A signal death has no exit code; report it the way a shell
        // reports an abnormal exit.
        Ok(status.code().map(|c| c as u8).unwrap_or(255))
    }
}

/// Forward one child stream to the sink until EOF
async fn forward<R: AsyncRead + Unpin>(
    mut reader: R,
    stream: OutputStream,
    sink: OutputSink,
) -> io::Result<()> {
    let mut buf = vec![0u8; READ_BUF];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        sink.send(stream, Bytes::copy_from_slice(&buf[..n])).await?;
    }
}

#[cfg(unix)]
fn os_arg(arg: &Bytes) -> io::Result<std::ffi::OsString> {
    use std::os::unix::ffi::OsStringExt;
    Ok(std::ffi::OsString::from_vec(arg.to_vec()))
}

#[cfg(not(unix))]
fn os_arg(arg: &Bytes) -> io::Result<std::ffi::OsString> {
    match std::str::from_utf8(arg) {
        Ok(s) => Ok(s.into()),
        Err(_) => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "argument is not valid UTF-8",
        )),
    }
}
