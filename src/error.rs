//! # Error Types
//!
//! Error handling for the packet channel and handshake layers.
//!
//! This module defines every failure the crate can surface, from low-level
//! I/O errors to protocol desyncs and authentication rejections.
//!
//! ## Error Categories
//! - **Transport errors**: connect refused, stream closed mid-read — always
//!   fatal to the connection, converted into a disconnect signal
//! - **Protocol desync errors**: magic mismatch, registry mismatch, unknown
//!   packet index
//! - **Authentication failures**: identity service rejections, malformed
//!   handshake traffic — always terminate the handshake
//! - **Timeout errors**: request/response waits that expired, kept distinct
//!   from connection loss so callers can tell the two apart
//! - **Certificate refresh failures**: non-fatal, degrade to the stale
//!   certificate
//!
//! Handler code never sees raw transport errors; the connection boundary
//! converts them into a [`Disconnect`] with a reason key from [`reason`].

use std::io;
use thiserror::Error;

/// Disconnect reason keys used in [`Disconnect::reason`].
///
/// Static strings are borrowed, avoiding heap allocations on error paths.
pub mod reason {
    /// Transport-level connect or handshake failure during `open`.
    pub const CONNECT_ERROR: &str = "connect_error";
    /// Read loop died decoding or dispatching a frame.
    pub const PROCESSOR_ERROR: &str = "processor_error";
    /// Authentication handshake was rejected by the peer.
    pub const AUTH_FAILED: &str = "auth_failed";
    /// Orderly local close.
    pub const CLOSED: &str = "closed";
    /// Peer's first bytes were not the expected magic token.
    pub const MAGIC_MISMATCH: &str = "magic_mismatch";
}

/// A structured disconnect signal: a machine-readable reason key plus
/// optional human-readable arguments.
///
/// This is the shape handed to disconnect callbacks and carried on the wire
/// when a handshake is rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disconnect {
    /// Reason key, usually one of the [`reason`] constants.
    pub reason: String,
    /// Free-form arguments for display or logging.
    pub args: Vec<String>,
}

impl Disconnect {
    /// Build a disconnect with no arguments.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            args: Vec::new(),
        }
    }

    /// Build a disconnect with arguments.
    pub fn with_args(reason: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            reason: reason.into(),
            args,
        }
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.args.is_empty() {
            write!(f, "{}", self.reason)
        } else {
            write!(f, "{} ({})", self.reason, self.args.join(", "))
        }
    }
}

/// Primary error type for all protocol operations.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection dropped while a caller was waiting on a response.
    /// Distinct from [`NetError::Timeout`] by contract.
    #[error("Connection lost while waiting")]
    ConnectionLost,

    /// A bounded wait expired without a matching response.
    #[error("Operation timed out")]
    Timeout,

    #[error("Encode error: {0}")]
    Encode(String),

    #[error("Decode error: {0}")]
    Decode(String),

    /// Declared string/array/payload length exceeds the wire cap.
    #[error("Wire length {0} exceeds maximum allowed")]
    OversizedLength(usize),

    /// Magic token, registry snapshot, or packet index disagreement
    /// between the two peers.
    #[error("Protocol desync: {0}")]
    ProtocolDesync(String),

    /// Frame carried a packet index no bound channel owns.
    #[error("Unknown packet index: {0}")]
    UnknownPacketIndex(i32),

    /// A packet type was sent on a channel that never registered it.
    #[error("Packet type not registered on channel '{0}'")]
    UnregisteredPacket(&'static str),

    /// Channel definition missing from the registry.
    #[error("Channel '{0}' is not registered")]
    UnknownChannel(&'static str),

    /// A channel subtype's build step ran more than once.
    #[error("Channel '{0}' is already registered")]
    DuplicateChannel(&'static str),

    /// Registration attempted after the registry was locked by its first
    /// bind to a live connection.
    #[error("Channel registry is locked: {0}")]
    RegistryLocked(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// The peer rejected authentication and supplied a structured reason.
    #[error("Authentication rejected: {0}")]
    AuthRejected(Disconnect),

    #[error("Identity service error: {0}")]
    IdentityService(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Message '{0}' is not registered with this messenger")]
    UnregisteredMessage(String),

    #[error("Duplicate message id '{0}'")]
    DuplicateMessage(String),

    #[error("Package container error: {0}")]
    Container(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl NetError {
    /// Map this error to the disconnect signal the connection should emit
    /// when the error kills the read loop or an open attempt.
    pub fn to_disconnect(&self) -> Disconnect {
        match self {
            NetError::AuthRejected(d) => d.clone(),
            NetError::Handshake(msg) => {
                Disconnect::with_args(reason::AUTH_FAILED, vec![msg.clone()])
            }
            NetError::ProtocolDesync(msg) => {
                Disconnect::with_args(reason::PROCESSOR_ERROR, vec![msg.clone()])
            }
            NetError::Io(e) => Disconnect::with_args(reason::PROCESSOR_ERROR, vec![e.to_string()]),
            other => Disconnect::with_args(reason::PROCESSOR_ERROR, vec![other.to_string()]),
        }
    }
}

/// Type alias for Results using [`NetError`].
pub type Result<T> = std::result::Result<T, NetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_display() {
        let d = Disconnect::new(reason::CLOSED);
        assert_eq!(d.to_string(), "closed");

        let d = Disconnect::with_args(reason::AUTH_FAILED, vec!["bad token".into()]);
        assert_eq!(d.to_string(), "auth_failed (bad token)");
    }

    #[test]
    fn auth_rejection_keeps_structured_reason() {
        let rejected = NetError::AuthRejected(Disconnect::new("account_banned"));
        let d = rejected.to_disconnect();
        assert_eq!(d.reason, "account_banned");
        assert!(d.args.is_empty());
    }

    #[test]
    fn timeout_and_connection_lost_are_distinct() {
        assert!(!matches!(NetError::Timeout, NetError::ConnectionLost));
        assert_ne!(
            NetError::Timeout.to_string(),
            NetError::ConnectionLost.to_string()
        );
    }
}
