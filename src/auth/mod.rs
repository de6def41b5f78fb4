//! # Authentication
//!
//! The per-connection handshake state machine, the certificate model with
//! its background refresh loop, and the identity-service interface.
//!
//! ## Components
//! - **handshake**: magic token exchange plus the secure/insecure
//!   authentication exchange, run exactly once per connection
//! - **certificate**: certificate records, refresh margins, and pluggable
//!   signer/verifier seams
//! - **refresh**: the interval task that keeps server credentials fresh
//! - **identity**: the external identity service as a typed async trait,
//!   with an HTTP JSON implementation
//!
//! ## Security
//! - Secure mode never puts the session token itself on the game wire;
//!   only the one-time join secret travels
//! - Insecure mode trusts plaintext claims and is spoofable by design;
//!   identities it produces are marked untrusted

pub mod certificate;
pub mod handshake;
pub mod identity;
pub mod refresh;

pub use certificate::{
    unix_now, Certificate, CertificatePayload, CertificateSigner, CertificateVerifier,
    ServerCredentials,
};
pub use handshake::{
    client_authenticator, server_authenticator, AuthOutcome, Authenticator, HandshakeIo,
    InsecureClientAuth, InsecureServerAuth, SecureClientAuth, SecureServerAuth, SessionContext,
};
pub use identity::{
    login_with_retry, AuthenticateResponse, HttpIdentityService, IdentityService, JoinSecret,
    LoginSuccess, PlayerProfile,
};
pub use refresh::{refresh_due, spawn_refresh_task, CredentialStore};
