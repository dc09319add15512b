//! remctl-client: client library for the remctl protocol
//!
//! Two interfaces are provided. The simple interface runs one command
//! and returns its aggregated output:
//!
//! ```no_run
//! # async fn demo() -> Result<(), remctl_client::ClientError> {
//! let result = remctl_client::remctl("server.example.org", 0, None, &["test", "test"]).await?;
//! assert_eq!(result.status, 0);
//! # Ok(())
//! # }
//! ```
//!
//! The session interface holds an authenticated connection open across
//! commands and hands back output tokens one at a time:
//!
//! ```no_run
//! # async fn demo() -> Result<(), remctl_client::ClientError> {
//! use remctl_client::{Output, Remctl};
//!
//! let mut session = Remctl::new();
//! session.open("server.example.org", 0, None).await?;
//! session.command(&["test", "test"]).await?;
//! loop {
//!     match session.output().await? {
//!         Output::Output { data, .. } => print!("{}", String::from_utf8_lossy(&data)),
//!         Output::Status { status } => println!("exited {status}"),
//!         Output::Error { message, .. } => eprintln!("{message}"),
//!         Output::Done => break,
//!     }
//! }
//! session.close().await;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod session;
pub mod simple;

pub use error::ClientError;
pub use session::{Output, Remctl};
pub use simple::{parse_port, remctl, RemctlResult};

pub use remctl_protocol::OutputStream;
