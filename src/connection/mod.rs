//! # Connections
//!
//! One duplex byte stream per peer, owned by a [`Connection`].
//!
//! A connection is created by a transport provider ([`tcp`] or
//! [`loopback`]), runs the open sequence exactly once (magic token
//! exchange, then the authentication handshake), binds the channel
//! registry, and starts its background read loop. Channel code never sees
//! a half-open connection: `establish` either returns a live connection or
//! an error with nothing left behind.
//!
//! Outbound frames from any number of caller tasks serialize at the
//! writer lock, so concurrent sends can never interleave bytes. Inbound
//! frames are decoded and dispatched sequentially by the read loop.

pub mod loopback;
pub mod tcp;

#[allow(clippy::module_inception)]
mod connection;

pub use connection::{establish, Connection, ConnectionSide, PeerIdentity};
