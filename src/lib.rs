//! # phoenix-net
//!
//! Engine-agnostic packet channel and connection-handshake core for game
//! servers: a binary multiplexed protocol with request/response
//! correlation over an asynchronous transport, manual tagged-value
//! serialization, and a dual-mode (secure/insecure) authentication
//! handshake with certificate-based server identity.
//!
//! ## Layers
//! - [`codec`]: primitive wire reads/writes and the recursive
//!   tagged-value encoding
//! - [`connection`]: one duplex stream per peer, background read loop,
//!   atomic frame writes, TCP and in-process loopback transports
//! - [`channel`]: typed packet channels — immutable blueprints, locked
//!   registries, per-connection instances with one-shot response waiters
//! - [`messenger`]: per-object, per-room request/response routing with
//!   registry desync detection
//! - [`auth`]: the handshake state machine, certificates and their
//!   refresh loop, and the identity-service interface
//! - [`container`]: the binary package archive format used for mod and
//!   asset distribution
//!
//! ## Example
//! ```ignore
//! use phoenix_net::prelude::*;
//!
//! let registry = ChannelRegistry::new();
//! registry.register::<ChatChannel>()?;
//!
//! let auth = InsecureClientAuth::new("acc1", "Disp");
//! let conn = tcp::connect("127.0.0.1:7350", &registry, &auth, &config.connection).await?;
//!
//! let chat = conn.channel::<ChatChannel>()?;
//! let reply: ChatAck = chat.send_and_wait(&ChatLine::new("hello"), 5_000).await?;
//! ```

pub mod auth;
pub mod channel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod container;
pub mod error;
pub mod messenger;
pub mod utils;

/// Common imports for crate users.
pub mod prelude {
    pub use crate::auth::{
        client_authenticator, server_authenticator, Authenticator, CredentialStore,
        IdentityService, SessionContext,
    };
    pub use crate::channel::{
        AnyPacket, ChannelBuilder, ChannelContext, ChannelDef, ChannelInstance, ChannelRegistry,
        Packet,
    };
    pub use crate::codec::{Array, Value, WireReader, WireWriter};
    pub use crate::config::NetConfig;
    pub use crate::connection::{loopback, tcp, Connection, ConnectionSide, PeerIdentity};
    pub use crate::error::{Disconnect, NetError, Result};
    pub use crate::messenger::{ComponentMessenger, MessengerCoordinates, WireMessage};
}

pub use error::{NetError, Result};
