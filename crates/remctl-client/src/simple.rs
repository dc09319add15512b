//! Simple one-shot client
//!
//! Opens a connection, runs a single command, aggregates its output,
//! and tears the connection down again.

use remctl_protocol::{OutputStream, ProtocolError};

use crate::error::ClientError;
use crate::session::{Output, Remctl};

/// Aggregated result of a one-shot command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemctlResult {
    /// Complete standard output
    pub stdout: Vec<u8>,
    /// Complete standard error
    pub stderr: Vec<u8>,
    /// Exit status of the remote command
    pub status: i32,
}

/// Run one command on a remote host and collect its output.
///
/// A port of 0 means the standard port with legacy-port fallback; a
/// `principal` of `None` derives the host-based service principal from
/// `host`. An `Error` token from the server is returned as
/// [`ClientError::Remote`]; in that case no exit status exists.
///
/// The empty command is rejected before any network activity.
pub async fn remctl<A: AsRef<[u8]>>(
    host: &str,
    port: u16,
    principal: Option<&str>,
    command: &[A],
) -> Result<RemctlResult, ClientError> {
    if command.is_empty() {
        return Err(ClientError::EmptyCommand);
    }

    let mut session = Remctl::new();
    session.open(host, port, principal).await?;
    session.command(command).await?;

    let mut result = RemctlResult::default();
    loop {
        match session.output().await? {
            Output::Output {
                stream: OutputStream::Stdout,
                data,
            } => result.stdout.extend_from_slice(&data),
            Output::Output {
                stream: OutputStream::Stderr,
                data,
            } => result.stderr.extend_from_slice(&data),
            Output::Status { status } => {
                result.status = i32::from(status);
                break;
            }
            Output::Error { code, message } => {
                session.close().await;
                return Err(ClientError::Remote { code, message });
            }
            // The stream must end in a status or an error.
            Output::Done => {
                session.close().await;
                return Err(ClientError::Protocol(ProtocolError::Malformed {
                    what: "result",
                }));
            }
        }
    }
    session.close().await;
    Ok(result)
}

/// Parse a port number from text, rejecting values outside 0-65535.
///
/// The typed interfaces take `u16` and cannot express an invalid port;
/// this is the validation for textual boundaries such as the CLI.
pub fn parse_port(text: &str) -> Result<u16, ClientError> {
    let invalid = || ClientError::InvalidPort(text.to_string());
    let value: i64 = text.trim().parse().map_err(|_| invalid())?;
    u16::try_from(value).map_err(|_| invalid())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port_valid() {
        assert_eq!(parse_port("0").unwrap(), 0);
        assert_eq!(parse_port("4373").unwrap(), 4373);
        assert_eq!(parse_port("65535").unwrap(), 65535);
        assert_eq!(parse_port(" 14373 ").unwrap(), 14373);
    }

    #[test]
    fn test_parse_port_out_of_range() {
        assert!(matches!(
            parse_port("65536"),
            Err(ClientError::InvalidPort(_))
        ));
        assert!(matches!(parse_port("-1"), Err(ClientError::InvalidPort(_))));
        assert!(matches!(
            parse_port("99999999999999999999"),
            Err(ClientError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_parse_port_not_a_number() {
        assert!(matches!(
            parse_port("remctl"),
            Err(ClientError::InvalidPort(_))
        ));
        assert!(matches!(parse_port(""), Err(ClientError::InvalidPort(_))));
    }

    #[tokio::test]
    async fn test_empty_command_rejected_before_network() {
        // The invalid hostname would fail differently if any network
        // activity were attempted.
        let result = remctl::<&str>("remctl.invalid", 0, None, &[]).await;
        assert!(matches!(result, Err(ClientError::EmptyCommand)));
    }
}
