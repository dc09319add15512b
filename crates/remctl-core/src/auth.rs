//! Authentication handshake and session security context
//!
//! remctl authenticates every connection before any command traffic.
//! The handshake runs over context tokens and mutually authenticates
//! client and server against a shared per-principal key: the client
//! opens with an empty announcement token, then sends its principal and
//! a random nonce; the server answers with its own nonce and a keyed
//! proof; the client verifies that proof and responds with its own.
//! Both sides then derive a session key and protect every subsequent
//! data token with an HMAC-SHA256 tag over a per-direction sequence
//! number and the payload, so tampering, replay, and reordering are all
//! rejected.
//!
//! The handshake never sends key material on the wire; only nonces and
//! HMAC proofs. All proof comparisons are constant-time.

use bytes::{BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use remctl_protocol::{token::flags, ProtocolError, Token, TokenCodec};

use crate::keytab::{Credential, Keytab, SessionKey, KEY_BYTES};

type HmacSha256 = Hmac<Sha256>;

/// Size of the integrity tag appended to wrapped payloads
pub const TAG_BYTES: usize = 32;

const SERVER_PROOF_LABEL: &[u8] = b"remctl server proof";
const CLIENT_PROOF_LABEL: &[u8] = b"remctl client proof";
const SESSION_KEY_LABEL: &[u8] = b"remctl session key";

/// Authentication and message protection errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Framing or transport failure during the handshake
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Peer closed the connection mid-handshake
    #[error("connection closed during authentication")]
    ClosedEarly,

    /// Received a token with flags that have no place in the handshake
    #[error("unexpected token during authentication (flags {0:#04x})")]
    UnexpectedToken(u8),

    /// Handshake payload did not deserialize
    #[error("malformed authentication token")]
    MalformedToken,

    /// Client principal is not in the keytab
    #[error("unknown principal: {0}")]
    UnknownPrincipal(String),

    /// Client asked for a different server principal than ours
    #[error("server principal mismatch: client requested {requested}, we are {ours}")]
    PrincipalMismatch { requested: String, ours: String },

    /// The server's proof did not verify; wrong key or impostor
    #[error("server authentication failed")]
    ServerAuthentication,

    /// The client's proof did not verify; wrong key or impostor
    #[error("client authentication failed")]
    ClientAuthentication,

    /// A protected message failed its integrity or sequence check
    #[error("message integrity check failed")]
    IntegrityCheck,

    /// Credential cache or keytab problem
    #[error(transparent)]
    Credentials(#[from] crate::keytab::KeytabError),
}

/// First handshake message, client to server
#[derive(Debug, Serialize, Deserialize)]
struct ClientInit {
    /// Principal the client authenticates as
    client: String,
    /// Principal the client believes it is talking to
    server: String,
    /// Client nonce
    nonce: [u8; 32],
}

/// Second handshake message, server to client
#[derive(Debug, Serialize, Deserialize)]
struct ServerChallenge {
    /// Server nonce
    nonce: [u8; 32],
    /// Proof of the shared key, bound to both nonces and principals
    proof: [u8; TAG_BYTES],
}

/// Third handshake message, client to server
#[derive(Debug, Serialize, Deserialize)]
struct ClientProof {
    /// Proof of the shared key, bound to both nonces and principals
    proof: [u8; TAG_BYTES],
}

/// Established security context protecting one connection.
///
/// Wrapped payloads carry an HMAC-SHA256 tag keyed with the session key
/// over the direction byte, a monotonically increasing sequence number,
/// and the payload itself.
#[derive(Debug)]
pub struct SecurityContext {
    key: SessionKey,
    send_dir: u8,
    recv_dir: u8,
    send_seq: u64,
    recv_seq: u64,
}

impl SecurityContext {
    fn new(key: SessionKey, initiator: bool) -> Self {
        let (send_dir, recv_dir) = if initiator { (1, 2) } else { (2, 1) };
        Self {
            key,
            send_dir,
            recv_dir,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    /// Protect a message payload for sending
    pub fn wrap(&mut self, payload: &[u8]) -> Bytes {
        let tag = self.tag(self.send_dir, self.send_seq, payload);
        self.send_seq += 1;
        let mut buf = BytesMut::with_capacity(payload.len() + TAG_BYTES);
        buf.extend_from_slice(payload);
        buf.extend_from_slice(&tag);
        buf.freeze()
    }

    /// Verify and strip the protection from a received payload
    pub fn unwrap(&mut self, wrapped: &Bytes) -> Result<Bytes, AuthError> {
        if wrapped.len() < TAG_BYTES {
            return Err(AuthError::IntegrityCheck);
        }
        let (payload, tag) = wrapped.split_at(wrapped.len() - TAG_BYTES);
        let mut mac = self.mac(self.recv_dir, self.recv_seq);
        mac.update(payload);
        mac.verify_slice(tag).map_err(|_| AuthError::IntegrityCheck)?;
        self.recv_seq += 1;
        Ok(wrapped.slice(..wrapped.len() - TAG_BYTES))
    }

    fn mac(&self, dir: u8, seq: u64) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(&[dir]);
        mac.update(&seq.to_be_bytes());
        mac
    }

    fn tag(&self, dir: u8, seq: u64, payload: &[u8]) -> [u8; TAG_BYTES] {
        let mut mac = self.mac(dir, seq);
        mac.update(payload);
        mac.finalize().into_bytes().into()
    }
}

/// The byte string both proofs and the session key are bound to
fn transcript(init: &ClientInit, server_nonce: &[u8; 32]) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(&init.nonce);
    buf.extend_from_slice(server_nonce);
    buf.put_u32(init.client.len() as u32);
    buf.extend_from_slice(init.client.as_bytes());
    buf.put_u32(init.server.len() as u32);
    buf.extend_from_slice(init.server.as_bytes());
    buf
}

fn prf(key: &SessionKey, label: &[u8], transcript: &[u8]) -> [u8; KEY_BYTES] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    mac.update(transcript);
    mac.finalize().into_bytes().into()
}

fn verify_proof(
    key: &SessionKey,
    label: &[u8],
    transcript: &[u8],
    candidate: &[u8; TAG_BYTES],
) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(label);
    mac.update(transcript);
    mac.verify_slice(candidate).is_ok()
}

fn random_nonce() -> [u8; 32] {
    use rand::Rng;
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill(&mut nonce);
    nonce
}

fn encode<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(bincode::serialize(value).expect("handshake serialization cannot fail"))
}

fn decode<T: serde::de::DeserializeOwned>(payload: &Bytes) -> Result<T, AuthError> {
    bincode::deserialize(payload).map_err(|_| AuthError::MalformedToken)
}

async fn recv_context<S>(framed: &mut Framed<S, TokenCodec>) -> Result<Token, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(Ok(token)) if token.is_context() => Ok(token),
        Some(Ok(token)) => Err(AuthError::UnexpectedToken(token.flags)),
        Some(Err(e)) => Err(e.into()),
        None => Err(AuthError::ClosedEarly),
    }
}

/// Run the client side of the authentication handshake.
///
/// On success the returned context protects all further traffic on the
/// connection. The server is authenticated before the client reveals
/// its own proof.
pub async fn client_handshake<S>(
    framed: &mut Framed<S, TokenCodec>,
    credential: &Credential,
    server_principal: &str,
) -> Result<SecurityContext, AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    framed.send(Token::initial()).await?;

    let init = ClientInit {
        client: credential.principal.clone(),
        server: server_principal.to_string(),
        nonce: random_nonce(),
    };
    framed.send(Token::context(encode(&init))).await?;

    let token = recv_context(framed).await?;
    let challenge: ServerChallenge = decode(&token.payload)?;

    let transcript = transcript(&init, &challenge.nonce);
    if !verify_proof(
        &credential.key,
        SERVER_PROOF_LABEL,
        &transcript,
        &challenge.proof,
    ) {
        return Err(AuthError::ServerAuthentication);
    }

    let proof = ClientProof {
        proof: prf(&credential.key, CLIENT_PROOF_LABEL, &transcript),
    };
    framed.send(Token::context(encode(&proof))).await?;

    let session_key = prf(&credential.key, SESSION_KEY_LABEL, &transcript);
    tracing::debug!(server = server_principal, "authenticated to server");
    Ok(SecurityContext::new(session_key, true))
}

/// Run the server side of the authentication handshake.
///
/// Returns the security context and the authenticated client principal.
pub async fn server_handshake<S>(
    framed: &mut Framed<S, TokenCodec>,
    keytab: &Keytab,
    server_principal: &str,
) -> Result<(SecurityContext, String), AuthError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // The connection opens with an empty version announcement token.
    let initial = match framed.next().await {
        Some(Ok(token)) => token,
        Some(Err(e)) => return Err(e.into()),
        None => return Err(AuthError::ClosedEarly),
    };
    if initial.flags != (flags::NOOP | flags::CONTEXT_NEXT | flags::PROTOCOL) {
        return Err(AuthError::UnexpectedToken(initial.flags));
    }

    let token = recv_context(framed).await?;
    let init: ClientInit = decode(&token.payload)?;

    let key = *keytab
        .lookup(&init.client)
        .ok_or_else(|| AuthError::UnknownPrincipal(init.client.clone()))?;
    if init.server != server_principal {
        return Err(AuthError::PrincipalMismatch {
            requested: init.server,
            ours: server_principal.to_string(),
        });
    }

    let server_nonce = random_nonce();
    let transcript = transcript(&init, &server_nonce);
    let challenge = ServerChallenge {
        nonce: server_nonce,
        proof: prf(&key, SERVER_PROOF_LABEL, &transcript),
    };
    framed.send(Token::context(encode(&challenge))).await?;

    let token = recv_context(framed).await?;
    let proof: ClientProof = decode(&token.payload)?;
    if !verify_proof(&key, CLIENT_PROOF_LABEL, &transcript, &proof.proof) {
        return Err(AuthError::ClientAuthentication);
    }

    let session_key = prf(&key, SESSION_KEY_LABEL, &transcript);
    tracing::debug!(client = init.client, "client authenticated");
    Ok((SecurityContext::new(session_key, false), init.client))
}
