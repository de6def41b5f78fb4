//! Authentication handshake state machine.
//!
//! Sequence per connection: both sides put the fixed 16-byte magic token
//! first on the wire and must read it back identically (a convention
//! check against mismatched component load order, nothing cryptographic),
//! then run one authentication exchange, then normal traffic flows.
//!
//! Mode selection is *not* negotiated: each side picks secure or insecure
//! from its own local configuration. A misconfigured pairing (one side
//! secure, the other insecure) is only caught downstream, when the
//! handshake bytes fail to parse as the shape the other side expects.
//! That asymmetry is a known protocol gap and is deliberately preserved
//! here rather than papered over with a negotiation field.
//!
//! Every I/O failure during the handshake is an unconditional
//! authentication failure; the handshake is never retried or resumed on
//! the same connection.
//!
//! ## Wire shapes
//! - Secure client → server: join secret (string)
//! - Insecure client → server: account ID (string), display name (string)
//! - Server → client: result (bool); on `false`, a reason key (string)
//!   and an i32-counted string-args array follow

use crate::auth::certificate::unix_now;
use crate::auth::identity::IdentityService;
use crate::auth::refresh::CredentialStore;
use crate::codec::{WireReader, WireWriter};
use crate::config::{AuthConfig, AuthMode, AUTH_MAGIC};
use crate::connection::PeerIdentity;
use crate::error::{reason, Disconnect, NetError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, error, info, warn};

/// Reason keys a server writes when it rejects a handshake.
pub mod deny {
    /// The identity service did not accept the join secret.
    pub const JOIN_SECRET_REJECTED: &str = "join_secret_rejected";
    /// An insecure identity claim was refused by the acceptor.
    pub const LOGIN_REJECTED: &str = "login_rejected";
}

/// Write our magic token, then require the identical bytes from the peer.
///
/// Runs before any authentication traffic; a mismatch is fatal and the
/// connection never reaches mode selection.
pub(crate) async fn exchange_magic(
    reader: &mut (dyn AsyncRead + Send + Unpin),
    writer: &mut (dyn AsyncWrite + Send + Unpin),
) -> Result<()> {
    writer.write_all(AUTH_MAGIC).await?;
    writer.flush().await?;

    let mut peer_magic = [0u8; 16];
    reader.read_exact(&mut peer_magic).await?;
    if &peer_magic != AUTH_MAGIC {
        error!(reason = reason::MAGIC_MISMATCH, "peer opened with wrong magic token");
        return Err(NetError::ProtocolDesync("magic token mismatch".into()));
    }
    Ok(())
}

/// Byte-level access to the stream during the handshake window, before
/// the read loop owns it. Every write is flushed immediately — handshake
/// messages are tiny and strictly sequential.
pub struct HandshakeIo<'a> {
    reader: &'a mut (dyn AsyncRead + Send + Unpin),
    writer: &'a mut (dyn AsyncWrite + Send + Unpin),
}

impl<'a> HandshakeIo<'a> {
    pub(crate) fn new(
        reader: &'a mut (dyn AsyncRead + Send + Unpin),
        writer: &'a mut (dyn AsyncWrite + Send + Unpin),
    ) -> Self {
        Self { reader, writer }
    }

    pub async fn read_string(&mut self) -> Result<String> {
        WireReader::new(&mut *self.reader).read_string().await
    }

    pub async fn read_bool(&mut self) -> Result<bool> {
        WireReader::new(&mut *self.reader).read_bool().await
    }

    pub async fn write_string(&mut self, s: &str) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_string(s)?;
        self.flush_frame(w).await
    }

    pub async fn write_bool(&mut self, v: bool) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_bool(v)?;
        self.flush_frame(w).await
    }

    /// Write `false` plus a structured denial reason.
    pub async fn write_rejection(&mut self, denial: &Disconnect) -> Result<()> {
        let mut w = WireWriter::new();
        w.write_bool(false)?;
        w.write_string(&denial.reason)?;
        w.write_i32(denial.args.len() as i32)?;
        for arg in &denial.args {
            w.write_string(arg)?;
        }
        self.flush_frame(w).await
    }

    /// Read the server's verdict. On `false`, surfaces the structured
    /// reason unchanged as [`NetError::AuthRejected`]; if the peer closed
    /// before writing one, a bare `auth_failed` reason is substituted.
    pub async fn read_result(&mut self) -> Result<()> {
        if self.read_bool().await? {
            return Ok(());
        }
        let denial = match self.read_rejection().await {
            Ok(d) => d,
            Err(_) => Disconnect::new(reason::AUTH_FAILED),
        };
        Err(NetError::AuthRejected(denial))
    }

    async fn read_rejection(&mut self) -> Result<Disconnect> {
        let key = self.read_string().await?;
        let mut r = WireReader::new(&mut *self.reader);
        let count = r.read_i32().await?;
        if !(0..=64).contains(&count) {
            return Err(NetError::Decode(format!("bad rejection arg count {count}")));
        }
        let mut args = Vec::with_capacity(count as usize);
        for _ in 0..count {
            args.push(r.read_string().await?);
        }
        Ok(Disconnect::with_args(key, args))
    }

    async fn flush_frame(&mut self, w: WireWriter) -> Result<()> {
        let bytes = w.into_bytes();
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// What a successful handshake established about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthOutcome {
    pub peer: PeerIdentity,
}

/// One side of the authentication exchange.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Run this side's exchange to completion. Any error terminates the
    /// connection attempt; there is no partial authentication.
    async fn authenticate(&self, io: &mut HandshakeIo<'_>) -> Result<AuthOutcome>;
}

/// Client-side session state, owned by whoever opens connections.
///
/// Replaces process-wide mutable session singletons: create one per
/// logged-in session and hand it to the connection factory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub account_id: String,
    pub display_name: String,
    /// Bearer token from the identity service, if logged in.
    pub session_token: Option<String>,
    /// Unix seconds; 0 means no recorded expiry.
    pub token_expires_at: i64,
    pub game_id: String,
}

impl SessionContext {
    /// Whether this session can drive a secure handshake for `game_id`.
    pub fn secure_capable(&self, game_id: &str, now: i64) -> bool {
        self.session_token.is_some()
            && self.game_id == game_id
            && (self.token_expires_at == 0 || now < self.token_expires_at)
    }
}

/// Client side, secure mode: fetch a one-time join secret from the
/// identity service and present it to the server.
pub struct SecureClientAuth {
    identity: Arc<dyn IdentityService>,
    session: SessionContext,
    server_id: String,
}

impl SecureClientAuth {
    pub fn new(
        identity: Arc<dyn IdentityService>,
        session: SessionContext,
        server_id: impl Into<String>,
    ) -> Self {
        Self {
            identity,
            session,
            server_id: server_id.into(),
        }
    }
}

#[async_trait]
impl Authenticator for SecureClientAuth {
    async fn authenticate(&self, io: &mut HandshakeIo<'_>) -> Result<AuthOutcome> {
        let token = self
            .session
            .session_token
            .as_deref()
            .ok_or_else(|| NetError::Handshake("secure mode without a session token".into()))?;

        let join = self
            .identity
            .join_server(&self.server_id, token)
            .await
            .map_err(|e| NetError::Handshake(format!("join secret request failed: {e}")))?;

        io.write_string(&join.secret).await?;
        io.read_result().await?;

        debug!(server_id = %self.server_id, "secure handshake complete");
        Ok(AuthOutcome {
            peer: PeerIdentity::Server {
                server_id: self.server_id.clone(),
            },
        })
    }
}

/// Server side, secure mode: resolve the presented join secret to a
/// player through the identity service.
pub struct SecureServerAuth {
    identity: Arc<dyn IdentityService>,
    credentials: CredentialStore,
}

impl SecureServerAuth {
    pub fn new(identity: Arc<dyn IdentityService>, credentials: CredentialStore) -> Self {
        Self {
            identity,
            credentials,
        }
    }
}

#[async_trait]
impl Authenticator for SecureServerAuth {
    async fn authenticate(&self, io: &mut HandshakeIo<'_>) -> Result<AuthOutcome> {
        let secret = io.read_string().await?;

        // Snapshot the credentials once; a concurrent refresh swap must
        // not change the token mid-exchange.
        let creds = self.credentials.current();

        match self.identity.authenticate_player(&secret, &creds.token).await {
            Ok(profile) => {
                io.write_bool(true).await?;
                info!(account_id = %profile.account_id, "player authenticated");
                Ok(AuthOutcome {
                    peer: PeerIdentity::Player {
                        account_id: profile.account_id,
                        display_name: profile.display_name,
                        trusted: true,
                    },
                })
            }
            Err(e) => {
                warn!(error = %e, "join secret rejected by identity service");
                let denial = Disconnect::new(deny::JOIN_SECRET_REJECTED);
                io.write_rejection(&denial).await?;
                Err(NetError::AuthRejected(denial))
            }
        }
    }
}

/// Client side, insecure mode: claim an identity in plaintext.
pub struct InsecureClientAuth {
    account_id: String,
    display_name: String,
}

impl InsecureClientAuth {
    pub fn new(account_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            display_name: display_name.into(),
        }
    }
}

#[async_trait]
impl Authenticator for InsecureClientAuth {
    async fn authenticate(&self, io: &mut HandshakeIo<'_>) -> Result<AuthOutcome> {
        io.write_string(&self.account_id).await?;
        io.write_string(&self.display_name).await?;
        io.read_result().await?;
        Ok(AuthOutcome {
            peer: PeerIdentity::Unknown,
        })
    }
}

/// Decides whether an unverified identity claim is admitted.
pub type InsecureAcceptor = Arc<dyn Fn(&str, &str) -> bool + Send + Sync>;

/// Server side, insecure mode: accept plaintext identity claims.
///
/// Claims are unverifiable and spoofable; every identity this produces is
/// marked untrusted, and permission grants must stay disabled for them
/// unless the operator explicitly opted in.
pub struct InsecureServerAuth {
    acceptor: Option<InsecureAcceptor>,
}

impl InsecureServerAuth {
    pub fn new() -> Self {
        Self { acceptor: None }
    }

    /// Install an acceptor consulted with `(account_id, display_name)`.
    pub fn with_acceptor(acceptor: InsecureAcceptor) -> Self {
        Self {
            acceptor: Some(acceptor),
        }
    }
}

impl Default for InsecureServerAuth {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Authenticator for InsecureServerAuth {
    async fn authenticate(&self, io: &mut HandshakeIo<'_>) -> Result<AuthOutcome> {
        let account_id = io.read_string().await?;
        let display_name = io.read_string().await?;

        let accepted = self
            .acceptor
            .as_ref()
            .map_or(true, |f| f(&account_id, &display_name));

        if accepted {
            io.write_bool(true).await?;
            warn!(account_id = %account_id, "insecure identity accepted without verification");
            Ok(AuthOutcome {
                peer: PeerIdentity::Player {
                    account_id,
                    display_name,
                    trusted: false,
                },
            })
        } else {
            let denial = Disconnect::new(deny::LOGIN_REJECTED);
            io.write_rejection(&denial).await?;
            Err(NetError::AuthRejected(denial))
        }
    }
}

/// Build the client-side authenticator for the locally-configured mode.
///
/// `Auto` picks secure when the session holds a valid, unexpired token
/// for the configured game; the peer is not consulted.
pub fn client_authenticator(
    config: &AuthConfig,
    session: SessionContext,
    identity: Arc<dyn IdentityService>,
    server_id: impl Into<String>,
) -> Result<Box<dyn Authenticator>> {
    let server_id = server_id.into();
    let secure_capable = session.secure_capable(&config.game_id, unix_now());

    let secure = match config.mode {
        AuthMode::Secure => {
            if !secure_capable {
                return Err(NetError::Config(
                    "secure mode requires a valid session token for the configured game".into(),
                ));
            }
            true
        }
        AuthMode::Insecure => false,
        AuthMode::Auto => secure_capable,
    };

    if secure {
        Ok(Box::new(SecureClientAuth::new(identity, session, server_id)))
    } else {
        Ok(Box::new(InsecureClientAuth::new(
            session.account_id,
            session.display_name,
        )))
    }
}

/// Build the server-side authenticator for the locally-configured mode.
///
/// `Auto` picks secure when server credentials are present and the
/// certificate is not already expired.
pub fn server_authenticator(
    config: &AuthConfig,
    identity: Arc<dyn IdentityService>,
    credentials: Option<CredentialStore>,
    acceptor: Option<InsecureAcceptor>,
) -> Result<Box<dyn Authenticator>> {
    let secure = match config.mode {
        AuthMode::Secure => true,
        AuthMode::Insecure => false,
        AuthMode::Auto => credentials
            .as_ref()
            .map_or(false, |c| !c.current().certificate.is_expired(unix_now())),
    };

    if secure {
        let credentials = credentials.ok_or_else(|| {
            NetError::Config("secure mode requires server credentials".into())
        })?;
        Ok(Box::new(SecureServerAuth::new(identity, credentials)))
    } else {
        Ok(Box::new(match acceptor {
            Some(a) => InsecureServerAuth::with_acceptor(a),
            None => InsecureServerAuth::new(),
        }))
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn session_secure_capability() {
        let mut session = SessionContext {
            account_id: "acc1".into(),
            display_name: "Disp".into(),
            session_token: Some("tok".into()),
            token_expires_at: 0,
            game_id: "game-1".into(),
        };
        assert!(session.secure_capable("game-1", unix_now()));
        assert!(!session.secure_capable("game-2", unix_now()));

        session.token_expires_at = unix_now() - 10;
        assert!(!session.secure_capable("game-1", unix_now()));

        session.token_expires_at = 0;
        session.session_token = None;
        assert!(!session.secure_capable("game-1", unix_now()));
    }

    #[tokio::test]
    async fn magic_mismatch_detected() {
        let (ours, mut theirs) = tokio::io::duplex(1024);

        // Peer speaks the wrong first bytes.
        theirs.write_all(b"NOTPHOENIXATALL!").await.unwrap();
        theirs.flush().await.unwrap();

        let (mut r, mut w) = tokio::io::split(ours);
        let result = exchange_magic(&mut r, &mut w).await;
        assert!(matches!(result, Err(NetError::ProtocolDesync(_))));
    }

    #[tokio::test]
    async fn rejection_roundtrip_preserves_reason() {
        let (a, b) = tokio::io::duplex(1024);
        let (mut ar, mut aw) = tokio::io::split(a);
        let (mut br, mut bw) = tokio::io::split(b);

        let denial = Disconnect::with_args("account_banned", vec!["cheating".into()]);
        {
            let mut io = HandshakeIo::new(&mut br, &mut bw);
            io.write_rejection(&denial).await.unwrap();
        }

        let mut io = HandshakeIo::new(&mut ar, &mut aw);
        match io.read_result().await {
            Err(NetError::AuthRejected(got)) => assert_eq!(got, denial),
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
