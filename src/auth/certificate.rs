//! Certificate records and the pluggable signing seam.
//!
//! The actual signature primitives are out of scope: callers plug in a
//! [`CertificateSigner`]/[`CertificateVerifier`] pair. This module owns
//! the data model, the 7-day proactive refresh margin, and the payload a
//! server signs on demand for a handshaking peer.

use crate::codec::WireWriter;
use crate::config::CERT_REFRESH_MARGIN;
use crate::error::{NetError, Result};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current unix time in seconds. Clamps to 0 if the clock predates the
/// epoch.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A server identity certificate as issued by the identity service.
///
/// Clients receive it without the private key; the server's own copy
/// carries one so it can sign fresh payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    #[serde(rename = "gameID", default)]
    pub game_id: String,

    #[serde(rename = "serverID", default)]
    pub server_id: String,

    /// Addresses this certificate is valid for.
    #[serde(default)]
    pub addresses: Vec<String>,

    /// Unix seconds of the last issue/refresh.
    #[serde(rename = "lastUpdate", default)]
    pub last_update: i64,

    /// Unix seconds of hard expiry.
    #[serde(default)]
    pub expiry: i64,

    #[serde(rename = "publicKey", default)]
    pub public_key: String,

    /// Only present on the server's own copy.
    #[serde(rename = "privateKey", default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

impl Certificate {
    /// Whether expiry falls within the proactive refresh margin.
    ///
    /// Always checked 7 days ahead of actual expiry so a refresh happens
    /// while the old certificate still works.
    pub fn expires_within_margin(&self, now: i64) -> bool {
        now >= self.expiry - CERT_REFRESH_MARGIN.as_secs() as i64
    }

    /// Whether the certificate is already past hard expiry.
    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expiry
    }
}

/// A server's full credential set: its identity, the bearer token it uses
/// against the identity service, and its certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCredentials {
    pub identity: String,

    pub token: String,

    /// Unix seconds when `token` was issued; a certificate refreshed
    /// after this point means the token is stale.
    #[serde(rename = "tokenIssuedAt", default)]
    pub token_issued_at: i64,

    pub certificate: Certificate,
}

/// The payload a server mints and signs for a handshaking peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificatePayload {
    pub game_id: String,
    pub server_id: String,
    /// When this particular payload was issued.
    pub issued_at: i64,
    pub last_update: i64,
    pub expiry: i64,
    /// Random per-payload nonce.
    pub nonce: [u8; 16],
}

impl CertificatePayload {
    /// Canonical byte form used as signing input.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut w = WireWriter::new();
        w.write_string(&self.game_id)?;
        w.write_string(&self.server_id)?;
        w.write_i64(self.issued_at)?;
        w.write_i64(self.last_update)?;
        w.write_i64(self.expiry)?;
        w.write_raw(&self.nonce)?;
        Ok(w.into_bytes().to_vec())
    }
}

/// Produces signatures over payload bytes with a private key.
pub trait CertificateSigner: Send + Sync {
    fn sign(&self, payload: &[u8], private_key: &str) -> Result<Vec<u8>>;
}

/// Checks signatures over payload bytes against a public key.
pub trait CertificateVerifier: Send + Sync {
    fn verify(&self, payload: &[u8], signature: &[u8], public_key: &str) -> Result<bool>;
}

impl ServerCredentials {
    /// Mint and sign a fresh payload for a handshaking peer.
    pub fn mint_signed(
        &self,
        signer: &dyn CertificateSigner,
        now: i64,
    ) -> Result<(CertificatePayload, Vec<u8>)> {
        let private_key = self
            .certificate
            .private_key
            .as_deref()
            .ok_or_else(|| NetError::Certificate("credentials carry no private key".into()))?;

        let mut nonce = [0u8; 16];
        rand::rng().fill_bytes(&mut nonce);

        let payload = CertificatePayload {
            game_id: self.certificate.game_id.clone(),
            server_id: self.certificate.server_id.clone(),
            issued_at: now,
            last_update: self.certificate.last_update,
            expiry: self.certificate.expiry,
            nonce,
        };
        let bytes = payload.to_bytes()?;
        let signature = signer.sign(&bytes, private_key)?;
        Ok((payload, signature))
    }
}
