//! remctl-core: Shared authentication and configuration for remctl
//!
//! This crate provides the pieces both the client and the server need:
//! principal naming, keytab and credential cache files, the
//! authentication handshake, and the per-session security context that
//! protects data tokens.

pub mod auth;
pub mod keytab;
pub mod principal;

pub use auth::{client_handshake, server_handshake, AuthError, SecurityContext};
pub use keytab::{Credential, Keytab, KeytabError, SessionKey, KEY_BYTES};
pub use principal::default_principal;
